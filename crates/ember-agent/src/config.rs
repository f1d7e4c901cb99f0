use std::{
    path::{Path, PathBuf},
    time::Duration,
};

pub const SUPPORTED_JAVA_MAJOR: u32 = 21;

const DEFAULT_STOP_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_KILL_GRACE_MS: u64 = 5_000;
const DEFAULT_DOWNLOAD_TIMEOUT_SEC: u64 = 30 * 60;

pub(crate) fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.trim().parse::<u64>().ok())
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn absolute(p: PathBuf) -> PathBuf {
    let abs = if p.is_absolute() {
        p
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(p)
    };

    // Best-effort canonicalization: don't fail if the directory doesn't exist yet.
    std::fs::canonicalize(&abs).unwrap_or(abs)
}

/// Vendor archive for the platform this binary was built for.
pub fn default_java_download_url() -> String {
    let os = if cfg!(target_os = "windows") {
        "windows"
    } else if cfg!(target_os = "macos") {
        "mac"
    } else {
        "linux"
    };
    let arch = if cfg!(target_arch = "aarch64") {
        "aarch64"
    } else {
        "x64"
    };
    format!(
        "https://api.adoptium.net/v3/binary/latest/{SUPPORTED_JAVA_MAJOR}/ga/{os}/{arch}/jre/hotspot/normal/eclipse"
    )
}

/// Where the provisioner keeps the runtime and its downloads.
#[derive(Debug, Clone)]
pub struct RuntimePaths {
    pub root: PathBuf,
    pub install_dir: PathBuf,
    pub cache_dir: PathBuf,
}

impl RuntimePaths {
    pub fn under(runtime_root: &Path) -> Self {
        Self {
            root: runtime_root.to_path_buf(),
            install_dir: runtime_root.join(format!("java-{SUPPORTED_JAVA_MAJOR}")),
            cache_dir: runtime_root.join("cache"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub data_root: PathBuf,
    pub java_download_url: String,
    pub stop_timeout: Duration,
    pub kill_grace: Duration,
    pub download_timeout: Duration,
}

impl AgentConfig {
    /// Config rooted at `data_root` with default timeouts.
    pub fn new(data_root: impl Into<PathBuf>) -> Self {
        Self {
            data_root: data_root.into(),
            java_download_url: default_java_download_url(),
            stop_timeout: Duration::from_millis(DEFAULT_STOP_TIMEOUT_MS),
            kill_grace: Duration::from_millis(DEFAULT_KILL_GRACE_MS),
            download_timeout: Duration::from_secs(DEFAULT_DOWNLOAD_TIMEOUT_SEC),
        }
    }

    pub fn from_env() -> Self {
        let raw = env_string("EMBER_DATA_ROOT").unwrap_or_else(|| "./data".to_string());
        let mut cfg = Self::new(absolute(PathBuf::from(raw)));

        if let Some(url) = env_string("EMBER_JAVA_DOWNLOAD_URL") {
            cfg.java_download_url = url;
        }
        cfg.stop_timeout = Duration::from_millis(
            env_u64("EMBER_STOP_TIMEOUT_MS")
                .map(|v| v.clamp(1000, 10 * 60 * 1000))
                .unwrap_or(DEFAULT_STOP_TIMEOUT_MS),
        );
        cfg.kill_grace = Duration::from_millis(
            env_u64("EMBER_KILL_GRACE_MS")
                .map(|v| v.clamp(100, 60_000))
                .unwrap_or(DEFAULT_KILL_GRACE_MS),
        );
        cfg.download_timeout = Duration::from_secs(
            env_u64("EMBER_DOWNLOAD_TIMEOUT_SEC")
                .map(|v| v.clamp(30, 2 * 60 * 60))
                .unwrap_or(DEFAULT_DOWNLOAD_TIMEOUT_SEC),
        );
        cfg
    }

    pub fn registry_path(&self) -> PathBuf {
        self.data_root.join("registry.json")
    }

    pub fn servers_root(&self) -> PathBuf {
        self.data_root.join("servers")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_root.join("logs")
    }

    pub fn runtime_paths(&self) -> RuntimePaths {
        RuntimePaths::under(&self.data_root.join("runtime"))
    }
}
