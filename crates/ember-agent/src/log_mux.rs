//! Line buffering for managed process output.

use ember_process::{LogLine, ProfileId};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::events::EventBus;

pub const STDERR_PREFIX: &str = "[ERR] ";

const READ_CHUNK_BYTES: usize = 8 * 1024;
/// A fragment longer than this is emitted as a line of its own.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    fn prefix(self) -> &'static str {
        match self {
            StreamKind::Stdout => "",
            StreamKind::Stderr => STDERR_PREFIX,
        }
    }
}

/// Splits a byte stream into complete lines, keeping the trailing fragment.
///
/// Bytes are buffered raw so a UTF-8 sequence cut by a chunk boundary decodes
/// once the rest arrives.
#[derive(Debug)]
pub struct LineSplitter {
    residual: Vec<u8>,
    prefix: &'static str,
}

impl LineSplitter {
    pub fn new(kind: StreamKind) -> Self {
        Self {
            residual: Vec::new(),
            prefix: kind.prefix(),
        }
    }

    /// Append a chunk; returns the non-blank lines it completed, in order.
    /// A fragment that outgrows [`MAX_LINE_BYTES`] is flushed in pieces.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.residual.extend_from_slice(chunk);
        let mut lines = Vec::new();
        if let Some(last_nl) = self.residual.iter().rposition(|b| *b == b'\n') {
            let rest = self.residual.split_off(last_nl + 1);
            let complete = std::mem::replace(&mut self.residual, rest);
            lines.extend(complete.split(|b| *b == b'\n').filter_map(|raw| self.render(raw)));
        }

        while self.residual.len() > MAX_LINE_BYTES {
            // Back off to a char boundary; a UTF-8 char has at most three continuation bytes.
            let mut cut = MAX_LINE_BYTES;
            while cut > MAX_LINE_BYTES - 3 && self.residual[cut] & 0xC0 == 0x80 {
                cut -= 1;
            }
            let rest = self.residual.split_off(cut);
            let head = std::mem::replace(&mut self.residual, rest);
            lines.extend(self.render(&head));
        }
        lines
    }

    /// Flush the trailing fragment at end of stream.
    pub fn finish(&mut self) -> Option<String> {
        let raw = std::mem::take(&mut self.residual);
        self.render(&raw)
    }

    fn render(&self, raw: &[u8]) -> Option<String> {
        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
        let text = String::from_utf8_lossy(raw);
        if text.trim().is_empty() {
            return None;
        }
        Some(format!("{}{}", self.prefix, text))
    }
}

/// Read `reader` to end of stream, publishing each complete line.
pub async fn pump<R>(mut reader: R, profile_id: ProfileId, kind: StreamKind, bus: EventBus<LogLine>)
where
    R: AsyncRead + Unpin,
{
    let mut splitter = LineSplitter::new(kind);
    let mut buf = vec![0u8; READ_CHUNK_BYTES];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) => {
                tracing::debug!(profile_id = %profile_id, ?kind, %err, "output stream read failed");
                break;
            }
        };
        for line in splitter.feed(&buf[..n]) {
            bus.publish(LogLine {
                profile_id: profile_id.clone(),
                line,
            });
        }
    }
    if let Some(line) = splitter.finish() {
        bus.publish(LogLine { profile_id, line });
    }
}
