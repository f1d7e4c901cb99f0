use std::{fmt, path::PathBuf};

use chrono::{DateTime, Utc};

/// Stable identifier of a server profile.
///
/// NOTE: The same id keys the persisted registry entry and the live process handle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct ProfileId(pub String);

impl ProfileId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ProfileId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ProfileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProfileId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoreType {
    Vanilla,
    Paper,
    Fabric,
    Forge,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    #[default]
    Stopped,
    Running,
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerStatus::Stopped => f.write_str("stopped"),
            ServerStatus::Running => f.write_str("running"),
        }
    }
}

/// Persisted configuration of one manageable server.
///
/// `status` is a cache of the last known state. The live process registry is
/// authoritative.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerProfile {
    pub id: ProfileId,
    pub display_name: String,
    pub core_type: CoreType,
    pub mc_version: String,
    pub ram_min_mb: u32,
    pub ram_max_mb: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_java_path: Option<PathBuf>,
    pub root_path: PathBuf,
    pub server_path: PathBuf,
    pub status: ServerStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ServerProfile {
    /// Merge `patch` into the profile and stamp `updated_at`.
    pub fn apply_patch(&mut self, patch: ProfilePatch, now: DateTime<Utc>) {
        if let Some(v) = patch.display_name {
            self.display_name = v;
        }
        if let Some(v) = patch.core_type {
            self.core_type = v;
        }
        if let Some(v) = patch.mc_version {
            self.mc_version = v;
        }
        if let Some(v) = patch.ram_min_mb {
            self.ram_min_mb = v;
        }
        if let Some(v) = patch.ram_max_mb {
            self.ram_max_mb = v;
        }
        if let Some(v) = patch.runtime_java_path {
            self.runtime_java_path = Some(v);
        }
        if let Some(v) = patch.status {
            self.status = v;
        }
        self.updated_at = now;
    }
}

/// Partial update of a [`ServerProfile`]. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfilePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub core_type: Option<CoreType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mc_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ram_min_mb: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ram_max_mb: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_java_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ServerStatus>,
}

impl ProfilePatch {
    pub fn status(status: ServerStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimePhase {
    Downloading,
    Extracting,
    Verifying,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeProgress {
    pub phase: RuntimePhase,
    pub percent: u8,
    pub downloaded_bytes: u64,
    pub total_bytes: u64,
}

impl RuntimeProgress {
    /// A phase marker without byte counts (extracting/verifying).
    pub fn marker(phase: RuntimePhase, percent: u8) -> Self {
        Self {
            phase,
            percent: percent.min(100),
            downloaded_bytes: 0,
            total_bytes: 0,
        }
    }

    /// Download progress. Percent stays 0 while the total is unknown.
    pub fn downloading(downloaded_bytes: u64, total_bytes: u64) -> Self {
        let percent = if total_bytes == 0 {
            0
        } else {
            (downloaded_bytes.saturating_mul(100) / total_bytes).min(100) as u8
        };
        Self {
            phase: RuntimePhase::Downloading,
            percent,
            downloaded_bytes,
            total_bytes,
        }
    }
}

/// One complete, non-blank line of server output (or a system line).
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogLine {
    pub profile_id: ProfileId,
    pub line: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_profile() -> ServerProfile {
        let now = Utc::now();
        ServerProfile {
            id: ProfileId::from("p1"),
            display_name: "Survival".to_string(),
            core_type: CoreType::Paper,
            mc_version: "1.21.1".to_string(),
            ram_min_mb: 1024,
            ram_max_mb: 2048,
            runtime_java_path: None,
            root_path: PathBuf::from("/srv/p1"),
            server_path: PathBuf::from("/srv/p1/server"),
            status: ServerStatus::Stopped,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn profile_id_is_non_empty() {
        let id = ProfileId::new();
        assert!(!id.0.is_empty());
    }

    #[test]
    fn profile_serializes_camel_case() {
        let v = serde_json::to_value(sample_profile()).unwrap();
        assert_eq!(v["displayName"], "Survival");
        assert_eq!(v["coreType"], "paper");
        assert_eq!(v["ramMinMb"], 1024);
        assert_eq!(v["status"], "stopped");
        assert!(v.get("runtimeJavaPath").is_none());
    }

    #[test]
    fn patch_merges_only_present_fields() {
        let mut p = sample_profile();
        let before = p.updated_at;
        let later = before + chrono::Duration::seconds(5);
        p.apply_patch(
            ProfilePatch {
                runtime_java_path: Some(PathBuf::from("/rt/bin/java")),
                ..ProfilePatch::status(ServerStatus::Running)
            },
            later,
        );
        assert_eq!(p.status, ServerStatus::Running);
        assert_eq!(p.runtime_java_path, Some(PathBuf::from("/rt/bin/java")));
        assert_eq!(p.display_name, "Survival");
        assert_eq!(p.updated_at, later);
    }

    #[test]
    fn download_percent_is_clamped_and_zero_without_total() {
        assert_eq!(RuntimeProgress::downloading(50, 0).percent, 0);
        assert_eq!(RuntimeProgress::downloading(50, 200).percent, 25);
        assert_eq!(RuntimeProgress::downloading(500, 200).percent, 100);
    }
}
