//! Persistent server profiles, stored as one JSON document.
//!
//! Every mutation reads, modifies and rewrites the whole document under an
//! in-process mutex. Writes go to a `.tmp` sibling that is renamed into
//! place, so readers never observe a torn file. Separate processes sharing
//! the file are last-write-wins.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ember_process::{CoreType, ProfileId, ProfilePatch, ServerProfile, ServerStatus};
use serde::{Deserialize, Serialize};
use tokio::{io::AsyncWriteExt, sync::Mutex};

use crate::{
    config::AgentConfig,
    error::{ManagerError, Result},
};

pub const REGISTRY_VERSION: u32 = 1;
pub const DEFAULT_RAM_MIN_MB: u32 = 1024;
pub const DEFAULT_RAM_MAX_MB: u32 = 2048;

/// Profile access needed by the process registry.
#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn get(&self, id: &ProfileId) -> Result<ServerProfile>;

    /// Merge `patch` into the profile and stamp its update time.
    async fn update(&self, id: &ProfileId, patch: ProfilePatch) -> Result<ServerProfile>;

    async fn set_status(&self, id: &ProfileId, status: ServerStatus) -> Result<ServerProfile> {
        self.update(id, ProfilePatch::status(status)).await
    }

    async fn list(&self) -> Result<Vec<ServerProfile>>;

    /// Remove the profile, and its directory tree when `delete_files` is set.
    async fn delete(&self, id: &ProfileId, delete_files: bool) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewProfile {
    pub display_name: String,
    pub core_type: CoreType,
    pub mc_version: String,
}

#[derive(Serialize)]
struct RegistryDocument<'a> {
    version: u32,
    servers: &'a [ServerProfile],
}

/// On-disk shape accepted on read. Older documents may lack the path, memory
/// and status fields.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredDocument {
    #[serde(default)]
    version: Option<u32>,
    #[serde(default)]
    servers: Vec<StoredProfile>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredProfile {
    id: ProfileId,
    display_name: String,
    core_type: CoreType,
    mc_version: String,
    ram_min_mb: Option<u32>,
    ram_max_mb: Option<u32>,
    runtime_java_path: Option<PathBuf>,
    root_path: Option<PathBuf>,
    server_path: Option<PathBuf>,
    status: Option<ServerStatus>,
    created_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
}

impl StoredProfile {
    /// Fill defaults; the flag reports whether anything was missing.
    fn normalize(self, servers_root: &Path, now: DateTime<Utc>) -> (ServerProfile, bool) {
        let changed = self.root_path.is_none()
            || self.server_path.is_none()
            || self.ram_min_mb.is_none()
            || self.ram_max_mb.is_none()
            || self.status.is_none()
            || self.created_at.is_none()
            || self.updated_at.is_none();

        let root_path = self
            .root_path
            .unwrap_or_else(|| servers_root.join(self.id.as_str()));
        let server_path = self.server_path.unwrap_or_else(|| root_path.join("server"));
        let created_at = self.created_at.unwrap_or(now);

        let profile = ServerProfile {
            id: self.id,
            display_name: self.display_name,
            core_type: self.core_type,
            mc_version: self.mc_version,
            ram_min_mb: self.ram_min_mb.unwrap_or(DEFAULT_RAM_MIN_MB),
            ram_max_mb: self.ram_max_mb.unwrap_or(DEFAULT_RAM_MAX_MB),
            runtime_java_path: self.runtime_java_path,
            root_path,
            server_path,
            status: self.status.unwrap_or_default(),
            created_at,
            updated_at: self.updated_at.unwrap_or(created_at),
        };
        (profile, changed)
    }
}

fn validate_display_name(name: &str) -> Result<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ManagerError::InvalidInput(
            "display name must not be empty".to_string(),
        ));
    }
    Ok(name.to_string())
}

fn validate_memory(profile: &ServerProfile) -> Result<()> {
    if profile.ram_min_mb == 0 {
        return Err(ManagerError::InvalidInput(
            "minimum memory must be positive".to_string(),
        ));
    }
    if profile.ram_min_mb > profile.ram_max_mb {
        return Err(ManagerError::InvalidInput(format!(
            "minimum memory ({} MB) exceeds maximum ({} MB)",
            profile.ram_min_mb, profile.ram_max_mb
        )));
    }
    Ok(())
}

fn not_found(id: &ProfileId) -> ManagerError {
    ManagerError::NotFound(id.to_string())
}

#[derive(Debug)]
pub struct JsonProfileStore {
    path: PathBuf,
    servers_root: PathBuf,
    lock: Mutex<()>,
}

impl JsonProfileStore {
    pub fn new(path: impl Into<PathBuf>, servers_root: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            servers_root: servers_root.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn from_config(config: &AgentConfig) -> Self {
        Self::new(config.registry_path(), config.servers_root())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn create(&self, input: NewProfile) -> Result<ServerProfile> {
        let display_name = validate_display_name(&input.display_name)?;
        let id = ProfileId::new();
        let root_path = self.servers_root.join(id.as_str());
        let server_path = root_path.join("server");
        let now = Utc::now();

        let profile = ServerProfile {
            id,
            display_name,
            core_type: input.core_type,
            mc_version: input.mc_version.trim().to_string(),
            ram_min_mb: DEFAULT_RAM_MIN_MB,
            ram_max_mb: DEFAULT_RAM_MAX_MB,
            runtime_java_path: None,
            root_path,
            server_path,
            status: ServerStatus::Stopped,
            created_at: now,
            updated_at: now,
        };

        let _guard = self.lock.lock().await;
        let mut servers = self.load().await?;
        tokio::fs::create_dir_all(&profile.server_path).await?;
        servers.push(profile.clone());
        self.save(&servers).await?;

        tracing::info!(profile_id = %profile.id, name = %profile.display_name, "server profile created");
        Ok(profile)
    }

    pub async fn rename(&self, id: &ProfileId, display_name: &str) -> Result<ServerProfile> {
        let display_name = validate_display_name(display_name)?;
        self.update(
            id,
            ProfilePatch {
                display_name: Some(display_name),
                ..ProfilePatch::default()
            },
        )
        .await
    }

    /// The profile's root folder.
    pub async fn root_path(&self, id: &ProfileId) -> Result<PathBuf> {
        Ok(self.get(id).await?.root_path)
    }

    /// Caller must hold `lock`.
    async fn load(&self) -> Result<Vec<ServerProfile>> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(v) => v,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                self.save(&[]).await?;
                return Ok(Vec::new());
            }
            Err(err) => return Err(err.into()),
        };

        let doc: StoredDocument = serde_json::from_slice(&raw)?;
        let now = Utc::now();
        let mut changed = doc.version.is_none();
        let servers: Vec<ServerProfile> = doc
            .servers
            .into_iter()
            .map(|s| {
                let (profile, c) = s.normalize(&self.servers_root, now);
                changed |= c;
                profile
            })
            .collect();

        if changed {
            tracing::debug!(path = %self.path.display(), "normalized registry document");
            self.save(&servers).await?;
        }
        Ok(servers)
    }

    /// Caller must hold `lock`.
    async fn save(&self, servers: &[ServerProfile]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let data = serde_json::to_vec_pretty(&RegistryDocument {
            version: REGISTRY_VERSION,
            servers,
        })?;

        let tmp = PathBuf::from(format!("{}.tmp", self.path.display()));
        let mut f = tokio::fs::File::create(&tmp).await?;
        f.write_all(&data).await?;
        f.flush().await?;
        f.sync_all().await.ok();
        drop(f);
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl ProfileStore for JsonProfileStore {
    async fn get(&self, id: &ProfileId) -> Result<ServerProfile> {
        let _guard = self.lock.lock().await;
        self.load()
            .await?
            .into_iter()
            .find(|s| &s.id == id)
            .ok_or_else(|| not_found(id))
    }

    async fn update(&self, id: &ProfileId, patch: ProfilePatch) -> Result<ServerProfile> {
        let mut patch = patch;
        if let Some(name) = patch.display_name.take() {
            patch.display_name = Some(validate_display_name(&name)?);
        }

        let _guard = self.lock.lock().await;
        let mut servers = self.load().await?;
        let server = servers
            .iter_mut()
            .find(|s| &s.id == id)
            .ok_or_else(|| not_found(id))?;

        // Stored bounds may predate validation; only a memory patch is checked.
        let touches_memory = patch.ram_min_mb.is_some() || patch.ram_max_mb.is_some();
        let mut next = server.clone();
        next.apply_patch(patch, Utc::now());
        if touches_memory {
            validate_memory(&next)?;
        }
        *server = next.clone();

        self.save(&servers).await?;
        Ok(next)
    }

    async fn list(&self) -> Result<Vec<ServerProfile>> {
        let _guard = self.lock.lock().await;
        self.load().await
    }

    async fn delete(&self, id: &ProfileId, delete_files: bool) -> Result<()> {
        let removed = {
            let _guard = self.lock.lock().await;
            let mut servers = self.load().await?;
            let idx = servers
                .iter()
                .position(|s| &s.id == id)
                .ok_or_else(|| not_found(id))?;
            if servers[idx].status == ServerStatus::Running {
                return Err(ManagerError::PreconditionFailed(
                    "server is running; stop it before deleting".to_string(),
                ));
            }
            let removed = servers.remove(idx);
            self.save(&servers).await?;
            removed
        };

        if delete_files {
            match tokio::fs::remove_dir_all(&removed.root_path).await {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        tracing::info!(profile_id = %id, delete_files, "server profile deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_in(dir: &Path) -> JsonProfileStore {
        JsonProfileStore::new(dir.join("registry.json"), dir.join("servers"))
    }

    fn input(name: &str) -> NewProfile {
        NewProfile {
            display_name: name.to_string(),
            core_type: CoreType::Vanilla,
            mc_version: "1.21.1".to_string(),
        }
    }

    #[tokio::test]
    async fn missing_document_is_created_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(tmp.path());
        assert!(store.list().await.unwrap().is_empty());

        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(store.path()).unwrap()).unwrap();
        assert_eq!(raw, serde_json::json!({ "version": 1, "servers": [] }));
    }

    #[tokio::test]
    async fn create_uses_defaults_and_makes_server_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(tmp.path());
        let p = store.create(input("  Survival  ")).await.unwrap();

        assert_eq!(p.display_name, "Survival");
        assert_eq!((p.ram_min_mb, p.ram_max_mb), (1024, 2048));
        assert_eq!(p.status, ServerStatus::Stopped);
        assert_eq!(p.root_path, tmp.path().join("servers").join(p.id.as_str()));
        assert_eq!(p.server_path, p.root_path.join("server"));
        assert!(p.server_path.is_dir());

        assert_eq!(store.get(&p.id).await.unwrap(), p);
        assert_eq!(store.root_path(&p.id).await.unwrap(), p.root_path);
        assert!(!tmp.path().join("registry.json.tmp").exists());
    }

    #[tokio::test]
    async fn blank_names_are_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(tmp.path());
        assert_eq!(store.create(input("   ")).await.unwrap_err().code(), "invalid_input");

        let p = store.create(input("A")).await.unwrap();
        assert_eq!(store.rename(&p.id, "").await.unwrap_err().code(), "invalid_input");
        assert_eq!(store.rename(&p.id, " B ").await.unwrap().display_name, "B");
    }

    #[tokio::test]
    async fn update_merges_and_checks_memory_bounds() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(tmp.path());
        let p = store.create(input("A")).await.unwrap();

        let patch = ProfilePatch {
            ram_min_mb: Some(4096),
            ..ProfilePatch::default()
        };
        let err = store.update(&p.id, patch).await.unwrap_err();
        assert!(matches!(err, ManagerError::InvalidInput(_)));
        assert_eq!(store.get(&p.id).await.unwrap().ram_min_mb, 1024);

        let patch = ProfilePatch {
            ram_min_mb: Some(2048),
            ram_max_mb: Some(4096),
            ..ProfilePatch::default()
        };
        let updated = store.update(&p.id, patch).await.unwrap();
        assert_eq!((updated.ram_min_mb, updated.ram_max_mb), (2048, 4096));
        assert_eq!(updated.display_name, "A");
        assert!(updated.updated_at >= p.updated_at);
    }

    #[tokio::test]
    async fn status_writes_ignore_inconsistent_stored_memory() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(tmp.path());
        std::fs::write(
            store.path(),
            r#"{"version":1,"servers":[{"id":"old","displayName":"Old","coreType":"forge",
                "mcVersion":"1.20.1","ramMinMb":4096,"status":"running"}]}"#,
        )
        .unwrap();
        let id = ProfileId::from("old");

        let p = store.get(&id).await.unwrap();
        assert_eq!((p.ram_min_mb, p.ram_max_mb), (4096, 2048));

        let stopped = store.set_status(&id, ServerStatus::Stopped).await.unwrap();
        assert_eq!(stopped.status, ServerStatus::Stopped);
        assert_eq!(store.rename(&id, "Renamed").await.unwrap().display_name, "Renamed");

        // Touching memory still validates the merged bounds.
        let patch = ProfilePatch {
            ram_max_mb: Some(3072),
            ..ProfilePatch::default()
        };
        assert_eq!(store.update(&id, patch).await.unwrap_err().code(), "invalid_input");
        let patch = ProfilePatch {
            ram_max_mb: Some(8192),
            ..ProfilePatch::default()
        };
        assert_eq!(store.update(&id, patch).await.unwrap().ram_max_mb, 8192);
    }

    #[tokio::test]
    async fn unknown_id_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(tmp.path());
        let id = ProfileId::from("nope");
        assert_eq!(store.get(&id).await.unwrap_err().code(), "not_found");
        assert_eq!(
            store
                .set_status(&id, ServerStatus::Running)
                .await
                .unwrap_err()
                .code(),
            "not_found"
        );
    }

    #[tokio::test]
    async fn legacy_entries_are_normalized_and_written_back() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(tmp.path());
        std::fs::write(
            store.path(),
            r#"{"servers":[{"id":"old","displayName":"Old","coreType":"paper","mcVersion":"1.20.4",
                "createdAt":"2024-01-01T00:00:00Z","updatedAt":"2024-01-02T00:00:00Z"}]}"#,
        )
        .unwrap();

        let servers = store.list().await.unwrap();
        assert_eq!(servers.len(), 1);
        let p = &servers[0];
        assert_eq!(p.root_path, tmp.path().join("servers").join("old"));
        assert_eq!(p.server_path, p.root_path.join("server"));
        assert_eq!((p.ram_min_mb, p.ram_max_mb), (1024, 2048));
        assert_eq!(p.status, ServerStatus::Stopped);

        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(store.path()).unwrap()).unwrap();
        assert_eq!(raw["version"], 1);
        assert_eq!(raw["servers"][0]["ramMaxMb"], 2048);
        assert_eq!(raw["servers"][0]["status"], "stopped");
    }

    #[tokio::test]
    async fn delete_refuses_running_profiles() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(tmp.path());
        let p = store.create(input("A")).await.unwrap();
        store.set_status(&p.id, ServerStatus::Running).await.unwrap();

        let err = store.delete(&p.id, true).await.unwrap_err();
        assert!(matches!(err, ManagerError::PreconditionFailed(_)));
        assert!(p.root_path.is_dir());

        store.set_status(&p.id, ServerStatus::Stopped).await.unwrap();
        store.delete(&p.id, true).await.unwrap();
        assert!(!p.root_path.exists());
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_can_keep_files() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(tmp.path());
        let p = store.create(input("A")).await.unwrap();
        store.delete(&p.id, false).await.unwrap();
        assert!(p.server_path.is_dir());
        assert_eq!(store.get(&p.id).await.unwrap_err().code(), "not_found");
    }
}
