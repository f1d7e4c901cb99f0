//! Error taxonomy for the server manager core.
//!
//! Every public operation returns [`ManagerError`]. Surfaces that need a
//! machine-readable value use [`ManagerError::code`].

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ManagerError>;

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("server not found: {0}")]
    NotFound(String),

    #[error("server is already running: {0}")]
    AlreadyRunning(String),

    #[error("server is not running: {0}")]
    NotRunning(String),

    #[error("only Java {supported} is supported by this runtime installer (requested {requested})")]
    UnsupportedVersion { requested: u32, supported: u32 },

    #[error("java download failed: {0}")]
    DownloadFailed(String),

    #[error("java extraction failed: {0}")]
    ExtractionFailed(String),

    #[error("java executable not found after install: {}", .0.display())]
    RuntimeNotFound(PathBuf),

    #[error("java verification failed: {}", .0.display())]
    VerificationFailed(PathBuf),

    #[error("{0}")]
    PreconditionFailed(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("failed to spawn server process: {0}")]
    SpawnFailed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl ManagerError {
    /// Stable snake_case identifier of the error kind.
    pub fn code(&self) -> &'static str {
        match self {
            ManagerError::NotFound(_) => "not_found",
            ManagerError::AlreadyRunning(_) => "already_running",
            ManagerError::NotRunning(_) => "not_running",
            ManagerError::UnsupportedVersion { .. } => "unsupported_version",
            ManagerError::DownloadFailed(_) => "download_failed",
            ManagerError::ExtractionFailed(_) => "extraction_failed",
            ManagerError::RuntimeNotFound(_) => "runtime_not_found",
            ManagerError::VerificationFailed(_) => "verification_failed",
            ManagerError::PreconditionFailed(_) => "precondition_failed",
            ManagerError::InvalidInput(_) => "invalid_input",
            ManagerError::SpawnFailed(_) => "spawn_failed",
            ManagerError::Io(_) => "io",
            ManagerError::Json(_) => "json",
        }
    }
}

/// Render an `anyhow` chain as a single `a: b: c` message, skipping repeats.
pub(crate) fn format_error_chain(err: &anyhow::Error) -> String {
    let mut parts = Vec::<String>::new();
    for cause in err.chain() {
        let s = cause.to_string();
        if s.is_empty() {
            continue;
        }
        if parts.last() == Some(&s) {
            continue;
        }
        parts.push(s);
    }
    if parts.is_empty() {
        "unknown error".to_string()
    } else {
        parts.join(": ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn codes_are_stable() {
        assert_eq!(ManagerError::NotRunning("x".into()).code(), "not_running");
        assert_eq!(
            ManagerError::UnsupportedVersion {
                requested: 17,
                supported: 21
            }
            .code(),
            "unsupported_version"
        );
    }

    #[test]
    fn error_chain_is_joined() {
        let err = Err::<(), _>(std::io::Error::other("disk full"))
            .context("write archive")
            .unwrap_err();
        assert_eq!(format_error_chain(&err), "write archive: disk full");
    }
}
