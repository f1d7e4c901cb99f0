//! Java runtime provisioning.
//!
//! `ensure_java` is idempotent: a usable runtime already under the install
//! directory short-circuits the pipeline. Otherwise the vendor archive is
//! downloaded, extracted into a scratch directory, moved into place and
//! verified. Failures are returned as-is; nothing here retries.

use std::{
    collections::VecDeque,
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use async_trait::async_trait;
use ember_process::{RuntimePhase, RuntimeProgress};
use futures_util::StreamExt;
use reqwest::{Url, header::LOCATION, redirect};
use tokio::{io::AsyncWriteExt, process::Command, sync::Mutex};

use crate::{
    archive,
    config::{AgentConfig, RuntimePaths, SUPPORTED_JAVA_MAJOR},
    error::{ManagerError, Result, format_error_chain},
    events::{EventBus, PROGRESS_CHANNEL_CAPACITY, Subscription},
};

pub const MAX_REDIRECTS: u32 = 5;
/// Search depth below the install directory.
pub const INSTALLED_SEARCH_DEPTH: usize = 4;
/// Search depth below a freshly extracted archive.
pub const EXTRACTED_SEARCH_DEPTH: usize = 5;
/// Upper bound on directories visited by one search.
const MAX_SEARCH_DIRS: usize = 10_000;

pub fn java_executable_name() -> &'static str {
    if cfg!(windows) { "java.exe" } else { "java" }
}

fn archive_file_name() -> String {
    let ext = if cfg!(windows) { "zip" } else { "tar.gz" };
    format!("temurin-{SUPPORTED_JAVA_MAJOR}-jre.{ext}")
}

/// Decides whether a java executable is usable.
#[async_trait]
pub trait RuntimeProbe: Send + Sync {
    async fn probe(&self, java: &Path) -> bool;
}

/// Runs `java -version` and accepts a zero exit code.
#[derive(Debug, Default, Clone, Copy)]
pub struct JavaVersionProbe;

#[async_trait]
impl RuntimeProbe for JavaVersionProbe {
    async fn probe(&self, java: &Path) -> bool {
        let out = match Command::new(java)
            .arg("-version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
        {
            Ok(v) => v,
            Err(err) => {
                tracing::debug!(java = %java.display(), %err, "java probe failed to run");
                return false;
            }
        };

        if out.status.success() {
            // `java -version` reports on stderr.
            let text = String::from_utf8_lossy(&out.stderr);
            let first = text.lines().next().unwrap_or_default();
            match parse_java_major_from_version_line(first) {
                Ok(major) => tracing::debug!(java = %java.display(), major, "java probe ok"),
                Err(err) => tracing::debug!(java = %java.display(), %err, "java probe ok"),
            }
        }
        out.status.success()
    }
}

pub fn parse_java_major_from_version_line(first_line: &str) -> anyhow::Result<u32> {
    // Typical formats:
    // - openjdk version "21.0.2" 2024-01-16
    // - java version "1.8.0_402"
    // - openjdk 21.0.2 2024-01-16

    let ver = if let Some(quoted) = first_line.split('"').nth(1) {
        quoted
    } else {
        // First token starting with a digit; the version precedes the date.
        first_line
            .split_whitespace()
            .find(|t| t.chars().next().is_some_and(|c| c.is_ascii_digit()))
            .ok_or_else(|| anyhow::anyhow!("failed to parse java version output: {first_line}"))?
    };

    let parse_leading_u32 = |s: &str| -> anyhow::Result<u32> {
        let end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
        if end == 0 {
            anyhow::bail!("failed to parse java major from: {ver}");
        }
        s[..end]
            .parse::<u32>()
            .map_err(|_| anyhow::anyhow!("failed to parse java major from: {ver}"))
    };

    if ver.starts_with("1.") {
        parse_leading_u32(ver.split('.').nth(1).unwrap_or(""))
    } else {
        parse_leading_u32(ver.split('.').next().unwrap_or(""))
    }
}

/// Breadth-first search for `<dir>/bin/<java>` at most `max_depth` levels
/// below `root`. Visits at most `MAX_SEARCH_DIRS` directories.
pub async fn find_java_exe(root: &Path, max_depth: usize) -> Option<PathBuf> {
    let exe = java_executable_name();
    let mut queue: VecDeque<(PathBuf, usize)> = VecDeque::from([(root.to_path_buf(), 0)]);
    let mut visited = 0usize;

    while let Some((dir, depth)) = queue.pop_front() {
        visited += 1;
        if visited > MAX_SEARCH_DIRS {
            break;
        }

        let candidate = dir.join("bin").join(exe);
        if tokio::fs::metadata(&candidate)
            .await
            .is_ok_and(|m| m.is_file())
        {
            return Some(candidate);
        }

        if depth >= max_depth {
            continue;
        }

        let Ok(mut rd) = tokio::fs::read_dir(&dir).await else {
            continue;
        };
        while let Ok(Some(entry)) = rd.next_entry().await {
            if entry.file_type().await.is_ok_and(|t| t.is_dir()) {
                queue.push_back((entry.path(), depth + 1));
            }
        }
    }

    None
}

pub struct JavaRuntime {
    paths: RuntimePaths,
    download_url: String,
    client: reqwest::Client,
    probe: Arc<dyn RuntimeProbe>,
    progress: EventBus<RuntimeProgress>,
    install_lock: Mutex<()>,
}

impl JavaRuntime {
    pub fn new(config: &AgentConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent("ember-agent")
            .timeout(config.download_timeout)
            .connect_timeout(Duration::from_secs(30))
            // Redirects are followed by hand so the hop count is ours to enforce.
            .redirect(redirect::Policy::none())
            .build()
            .map_err(|e| ManagerError::DownloadFailed(format!("build http client: {e}")))?;

        Ok(Self {
            paths: config.runtime_paths(),
            download_url: config.java_download_url.clone(),
            client,
            probe: Arc::new(JavaVersionProbe),
            progress: EventBus::new(PROGRESS_CHANNEL_CAPACITY),
            install_lock: Mutex::new(()),
        })
    }

    pub fn with_probe(mut self, probe: Arc<dyn RuntimeProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn paths(&self) -> &RuntimePaths {
        &self.paths
    }

    pub fn subscribe_progress(&self) -> Subscription<RuntimeProgress> {
        self.progress.subscribe()
    }

    pub async fn check_java(&self, java: &Path) -> bool {
        self.probe.probe(java).await
    }

    /// Return a usable java executable for `version`, installing it if needed.
    pub async fn ensure_java(&self, version: u32) -> Result<PathBuf> {
        if version != SUPPORTED_JAVA_MAJOR {
            return Err(ManagerError::UnsupportedVersion {
                requested: version,
                supported: SUPPORTED_JAVA_MAJOR,
            });
        }

        let _guard = self.install_lock.lock().await;
        self.ensure_dirs().await?;

        if let Some(existing) = find_java_exe(&self.paths.install_dir, INSTALLED_SEARCH_DEPTH).await
            && self.probe.probe(&existing).await
        {
            tracing::debug!(java = %existing.display(), "java runtime already installed");
            return Ok(existing);
        }

        let archive_path = self.paths.cache_dir.join(archive_file_name());
        tracing::info!(url = %self.download_url, dest = %archive_path.display(), "downloading java runtime");
        self.download(&self.download_url, &archive_path).await?;

        self.progress
            .publish(RuntimeProgress::marker(RuntimePhase::Extracting, 0));

        let extract_root = self
            .paths
            .cache_dir
            .join(format!("extract-{}", uuid::Uuid::new_v4()));
        let installed = self.install_from_archive(&archive_path, &extract_root).await;
        if let Err(err) = tokio::fs::remove_dir_all(&extract_root).await
            && err.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(dir = %extract_root.display(), %err, "failed to remove extraction dir");
        }
        installed?;

        self.progress
            .publish(RuntimeProgress::marker(RuntimePhase::Verifying, 0));
        let java = find_java_exe(&self.paths.install_dir, INSTALLED_SEARCH_DEPTH)
            .await
            .ok_or_else(|| ManagerError::RuntimeNotFound(self.paths.install_dir.clone()))?;
        let ok = self.probe.probe(&java).await;
        self.progress
            .publish(RuntimeProgress::marker(RuntimePhase::Verifying, 100));
        if !ok {
            return Err(ManagerError::VerificationFailed(java));
        }

        tracing::info!(java = %java.display(), "java runtime installed");
        Ok(java)
    }

    async fn ensure_dirs(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.paths.root).await?;
        tokio::fs::create_dir_all(&self.paths.install_dir).await?;
        tokio::fs::create_dir_all(&self.paths.cache_dir).await?;
        Ok(())
    }

    /// Download `url` to `dest` via a `.part` sibling. `dest` only exists
    /// after the full body was written.
    async fn download(&self, url: &str, dest: &Path) -> Result<()> {
        let part = PathBuf::from(format!("{}.part", dest.display()));
        let _ = tokio::fs::remove_file(dest).await;

        let res = self.download_to(url, &part).await;
        if let Err(err) = res {
            let _ = tokio::fs::remove_file(&part).await;
            return Err(err);
        }
        tokio::fs::rename(&part, dest)
            .await
            .map_err(|e| ManagerError::DownloadFailed(format!("persist {}: {e}", dest.display())))?;
        Ok(())
    }

    async fn download_to(&self, url: &str, path: &Path) -> Result<()> {
        let mut current = Url::parse(url)
            .map_err(|e| ManagerError::DownloadFailed(format!("invalid url {url}: {e}")))?;
        let mut redirects = 0u32;

        let resp = loop {
            let resp = self
                .client
                .get(current.clone())
                .send()
                .await
                .map_err(|e| ManagerError::DownloadFailed(format!("request {current}: {e}")))?;

            let status = resp.status();
            if status.is_redirection()
                && let Some(location) = resp.headers().get(LOCATION).and_then(|v| v.to_str().ok())
            {
                redirects += 1;
                if redirects > MAX_REDIRECTS {
                    return Err(ManagerError::DownloadFailed(format!(
                        "too many redirects (more than {MAX_REDIRECTS})"
                    )));
                }
                current = current.join(location).map_err(|e| {
                    ManagerError::DownloadFailed(format!("invalid redirect {location:?}: {e}"))
                })?;
                tracing::debug!(to = %current, hop = redirects, "following redirect");
                continue;
            }

            if !status.is_success() {
                return Err(ManagerError::DownloadFailed(format!(
                    "server responded with status {status}"
                )));
            }
            break resp;
        };

        let total_bytes = resp.content_length().unwrap_or(0);
        let mut downloaded_bytes = 0u64;
        self.progress
            .publish(RuntimeProgress::downloading(0, total_bytes));

        let written: anyhow::Result<()> = async {
            let mut f = tokio::fs::File::create(path)
                .await
                .context("create download file")?;
            let mut stream = resp.bytes_stream();
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.context("read download chunk")?;
                f.write_all(&chunk).await.context("write download")?;
                downloaded_bytes = downloaded_bytes.saturating_add(chunk.len() as u64);
                self.progress
                    .publish(RuntimeProgress::downloading(downloaded_bytes, total_bytes));
            }
            f.flush().await.context("flush download")?;
            f.sync_all().await.ok();
            Ok(())
        }
        .await;
        written.map_err(|e| ManagerError::DownloadFailed(format_error_chain(&e)))?;

        self.progress.publish(RuntimeProgress {
            phase: RuntimePhase::Downloading,
            percent: 100,
            downloaded_bytes,
            total_bytes,
        });
        Ok(())
    }

    async fn install_from_archive(&self, archive_path: &Path, extract_root: &Path) -> Result<()> {
        let extracted = tokio::task::spawn_blocking({
            let archive_path = archive_path.to_path_buf();
            let extract_root = extract_root.to_path_buf();
            move || archive::extract(&archive_path, &extract_root)
        })
        .await
        .map_err(|e| ManagerError::ExtractionFailed(format!("extract task failed: {e}")))?;
        extracted.map_err(|e| ManagerError::ExtractionFailed(format_error_chain(&e)))?;

        let found = find_java_exe(extract_root, EXTRACTED_SEARCH_DEPTH)
            .await
            .ok_or_else(|| {
                ManagerError::ExtractionFailed(
                    "java executable not found after extraction".to_string(),
                )
            })?;
        // <home>/bin/java
        let home = found
            .parent()
            .and_then(Path::parent)
            .ok_or_else(|| ManagerError::ExtractionFailed("invalid runtime layout".to_string()))?
            .to_path_buf();

        replace_dir(&home, &self.paths.install_dir).await?;

        self.progress
            .publish(RuntimeProgress::marker(RuntimePhase::Extracting, 100));
        Ok(())
    }
}

/// Replace `dst` with `src`: rename when possible, copy across devices.
async fn replace_dir(src: &Path, dst: &Path) -> Result<()> {
    if let Err(err) = tokio::fs::remove_dir_all(dst).await
        && err.kind() != std::io::ErrorKind::NotFound
    {
        return Err(ManagerError::ExtractionFailed(format!(
            "clear {}: {err}",
            dst.display()
        )));
    }
    if let Some(parent) = dst.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    if let Err(err) = tokio::fs::rename(src, dst).await {
        tracing::debug!(%err, "rename into install dir failed; copying instead");
        let copied = tokio::task::spawn_blocking({
            let src = src.to_path_buf();
            let dst = dst.to_path_buf();
            move || archive::copy_dir_all(&src, &dst)
        })
        .await
        .map_err(|e| ManagerError::ExtractionFailed(format!("copy task failed: {e}")))?;
        copied.map_err(|e| ManagerError::ExtractionFailed(format_error_chain(&e)))?;
    }
    Ok(())
}
