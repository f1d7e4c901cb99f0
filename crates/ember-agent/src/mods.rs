//! Mod management for a server's `mods/` directory: listing, enabling and
//! disabling, and importing jars, mod zips, CurseForge packs and prepared
//! instance folders.

use std::{
    fs,
    io::Read,
    path::{Path, PathBuf},
    sync::Arc,
};

use ember_process::{ProfileId, ServerProfile};
use serde::{Deserialize, Serialize};

use crate::{
    archive,
    error::{ManagerError, Result, format_error_chain},
    registry_store::ProfileStore,
};

const DISABLED_SUFFIX: &str = ".disabled";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModInfo {
    pub filename: String,
    pub size: u64,
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackType {
    Curseforge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoaderType {
    Forge,
    Fabric,
    Neoforge,
    Unknown,
}

impl LoaderType {
    fn from_loader_id(id: &str) -> Self {
        if id.starts_with("neoforge") {
            LoaderType::Neoforge
        } else if id.starts_with("forge") {
            LoaderType::Forge
        } else if id.starts_with("fabric") {
            LoaderType::Fabric
        } else {
            LoaderType::Unknown
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderImportOptions {
    pub include_config: bool,
    pub include_kubejs: bool,
    pub include_defaultconfigs: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportResult {
    pub imported_count: usize,
    pub skipped_count: usize,
    /// Relative paths (or jar names) that already existed.
    pub conflicts: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detected_pack_type: Option<PackType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mc_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loader_type: Option<LoaderType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mod_count: Option<usize>,
    pub imported_overrides_count: usize,
    pub imported_jars_count: usize,
}

impl ImportResult {
    fn add_conflict(&mut self, name: String) {
        if !self.conflicts.contains(&name) {
            self.conflicts.push(name);
        }
    }

    fn add_copied(&mut self, copied: Copied) {
        self.imported_jars_count += copied.jars;
        self.imported_overrides_count += copied.files - copied.jars;
    }

    fn finish(mut self) -> Self {
        self.imported_count = self.imported_jars_count + self.imported_overrides_count;
        self
    }
}

/// CurseForge `manifest.json`, reduced to the fields we report.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PackManifest {
    #[serde(default)]
    minecraft: PackMinecraft,
    #[serde(default)]
    files: Vec<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PackMinecraft {
    #[serde(default)]
    version: String,
    #[serde(default)]
    mod_loaders: Vec<PackLoader>,
}

#[derive(Debug, Deserialize)]
struct PackLoader {
    id: String,
}

#[derive(Debug)]
struct PackInfo {
    mc_version: String,
    loader_type: LoaderType,
    mod_count: usize,
}

/// `None` unless the zip carries a parseable top-level `manifest.json`.
fn detect_curseforge(zip_path: &Path) -> Option<PackInfo> {
    let f = fs::File::open(zip_path).ok()?;
    let mut zip = zip::ZipArchive::new(f).ok()?;
    let mut entry = zip.by_name("manifest.json").ok()?;
    let mut raw = String::new();
    entry.read_to_string(&mut raw).ok()?;
    let manifest: PackManifest = serde_json::from_str(&raw).ok()?;

    let loader_id = manifest
        .minecraft
        .mod_loaders
        .first()
        .map(|l| l.id.as_str())
        .unwrap_or_default();
    Some(PackInfo {
        loader_type: LoaderType::from_loader_id(loader_id),
        mc_version: manifest.minecraft.version,
        mod_count: manifest.files.len(),
    })
}

fn has_extension(path: &Path, ext: &str) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.to_ascii_lowercase().ends_with(ext))
}

/// A bare file name: no separators, no `.`/`..`.
fn validate_mod_filename(name: &str) -> Result<&str> {
    let trimmed = name.trim();
    if trimmed.is_empty()
        || trimmed == "."
        || trimmed == ".."
        || trimmed.contains('/')
        || trimmed.contains('\\')
    {
        return Err(ManagerError::InvalidInput(format!(
            "invalid mod file name: {name:?}"
        )));
    }
    Ok(trimmed)
}

/// A jar conflicts when it, or its disabled twin, is already present.
fn has_conflict(mods_dir: &Path, filename: &str) -> bool {
    mods_dir.join(filename).exists() || mods_dir.join(format!("{filename}{DISABLED_SUFFIX}")).exists()
}

fn find_jar_files(dir: &Path, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
    let mut entries: Vec<_> = fs::read_dir(dir)?.collect::<std::io::Result<_>>()?;
    entries.sort_by_key(|e| e.file_name());
    for e in entries {
        let ty = e.file_type()?;
        let path = e.path();
        if ty.is_dir() {
            find_jar_files(&path, out)?;
        } else if ty.is_file() && has_extension(&path, ".jar") {
            out.push(path);
        }
    }
    Ok(())
}

#[derive(Debug, Default, Clone, Copy)]
struct Copied {
    files: usize,
    jars: usize,
}

/// Copy the regular files under `src` into `dest`. Existing targets are
/// recorded as conflicts and either skipped or overwritten.
fn copy_tree(
    src: &Path,
    dest: &Path,
    skip_on_conflict: bool,
    result: &mut ImportResult,
) -> std::io::Result<Copied> {
    fn walk(
        root: &Path,
        current: &Path,
        dest: &Path,
        skip_on_conflict: bool,
        result: &mut ImportResult,
        copied: &mut Copied,
    ) -> std::io::Result<()> {
        let mut entries: Vec<_> = fs::read_dir(current)?.collect::<std::io::Result<_>>()?;
        entries.sort_by_key(|e| e.file_name());
        for e in entries {
            let path = e.path();
            let Ok(rel) = path.strip_prefix(root) else {
                continue;
            };
            let target = dest.join(rel);
            let ty = e.file_type()?;

            if ty.is_dir() {
                fs::create_dir_all(&target)?;
                walk(root, &path, dest, skip_on_conflict, result, copied)?;
                continue;
            }
            if !ty.is_file() {
                continue;
            }

            if target.exists() {
                result.add_conflict(rel.to_string_lossy().replace('\\', "/"));
                if skip_on_conflict {
                    continue;
                }
            }
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(&path, &target)?;
            copied.files += 1;
            if has_extension(&path, ".jar") {
                copied.jars += 1;
            }
        }
        Ok(())
    }

    let mut copied = Copied::default();
    walk(src, src, dest, skip_on_conflict, result, &mut copied)?;
    Ok(copied)
}

/// Scratch directory removed on drop.
struct ScratchDir(PathBuf);

impl ScratchDir {
    fn new(parent: &Path) -> std::io::Result<Self> {
        let dir = parent.join(format!(".import-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir)?;
        Ok(Self(dir))
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_dir_all(&self.0)
            && err.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(dir = %self.0.display(), %err, "failed to remove import scratch dir");
        }
    }
}

fn copy_jar_unless_conflict(
    jar: &Path,
    mods_dir: &Path,
    result: &mut ImportResult,
) -> std::io::Result<()> {
    let Some(filename) = jar.file_name().and_then(|n| n.to_str()) else {
        return Ok(());
    };
    if has_conflict(mods_dir, filename) {
        result.add_conflict(filename.to_string());
        result.skipped_count += 1;
        return Ok(());
    }
    fs::copy(jar, mods_dir.join(filename))?;
    result.imported_jars_count += 1;
    Ok(())
}

fn import_zip(
    zip_path: &Path,
    server: &ServerProfile,
    mods_dir: &Path,
    result: &mut ImportResult,
) -> Result<()> {
    let pack = detect_curseforge(zip_path);
    let scratch = ScratchDir::new(&server.root_path)?;
    archive::extract_zip_safely(zip_path, &scratch.0).map_err(|e| {
        ManagerError::InvalidInput(format!(
            "{}: {}",
            zip_path.display(),
            format_error_chain(&e)
        ))
    })?;

    if let Some(pack) = pack {
        if result.detected_pack_type.is_none() {
            result.detected_pack_type = Some(PackType::Curseforge);
            result.mc_version = Some(pack.mc_version);
            result.loader_type = Some(pack.loader_type);
            result.mod_count = Some(pack.mod_count);
        }
        let overrides = scratch.0.join("overrides");
        if overrides.is_dir() {
            let copied = copy_tree(&overrides, &server.server_path, false, result)?;
            result.add_copied(copied);
        }
        return Ok(());
    }

    let mods_src = scratch.0.join("mods");
    let search_root = if mods_src.is_dir() { &mods_src } else { &scratch.0 };
    let mut jars = Vec::new();
    find_jar_files(search_root, &mut jars)?;
    for jar in jars {
        copy_jar_unless_conflict(&jar, mods_dir, result)?;
    }
    Ok(())
}

fn import_files_blocking(
    server: &ServerProfile,
    mods_dir: &Path,
    paths: &[PathBuf],
) -> Result<ImportResult> {
    let mut result = ImportResult::default();
    for path in paths {
        if has_extension(path, ".jar") {
            copy_jar_unless_conflict(path, mods_dir, &mut result)?;
        } else if has_extension(path, ".zip") {
            import_zip(path, server, mods_dir, &mut result)?;
        } else {
            tracing::debug!(path = %path.display(), "ignoring non-mod file");
        }
    }
    Ok(result.finish())
}

fn import_folder_blocking(
    server: &ServerProfile,
    mods_dir: &Path,
    folder: &Path,
    options: FolderImportOptions,
) -> Result<ImportResult> {
    if !folder.is_dir() {
        return Err(ManagerError::InvalidInput(format!(
            "not a directory: {}",
            folder.display()
        )));
    }

    let mut result = ImportResult::default();
    let mods_src = folder.join("mods");
    if mods_src.is_dir() {
        let copied = copy_tree(&mods_src, mods_dir, true, &mut result)?;
        result.add_copied(copied);
    }

    let optional = [
        (options.include_config, "config"),
        (options.include_kubejs, "kubejs"),
        (options.include_defaultconfigs, "defaultconfigs"),
    ];
    for (enabled, name) in optional {
        let src = folder.join(name);
        if !enabled || !src.is_dir() {
            continue;
        }
        let copied = copy_tree(&src, &server.server_path.join(name), false, &mut result)?;
        result.add_copied(copied);
    }
    Ok(result.finish())
}

#[derive(Clone)]
pub struct ModManager {
    store: Arc<dyn ProfileStore>,
}

impl ModManager {
    pub fn new(store: Arc<dyn ProfileStore>) -> Self {
        Self { store }
    }

    /// The profile and its `mods/` directory, created if missing.
    async fn mods_dir(&self, id: &ProfileId) -> Result<(ServerProfile, PathBuf)> {
        let server = self.store.get(id).await?;
        let dir = server.server_path.join("mods");
        tokio::fs::create_dir_all(&dir).await?;
        Ok((server, dir))
    }

    /// `.jar` and `.jar.disabled` files, sorted by name.
    pub async fn list_mods(&self, id: &ProfileId) -> Result<Vec<ModInfo>> {
        let (_, dir) = self.mods_dir(id).await?;
        let mut out = Vec::new();
        let mut rd = tokio::fs::read_dir(&dir).await?;
        while let Some(e) = rd.next_entry().await? {
            let meta = e.metadata().await?;
            if !meta.is_file() {
                continue;
            }
            let filename = e.file_name().to_string_lossy().into_owned();
            let enabled = filename.ends_with(".jar");
            if !enabled && !filename.ends_with(".jar.disabled") {
                continue;
            }
            out.push(ModInfo {
                filename,
                size: meta.len(),
                enabled,
            });
        }
        out.sort_by(|a, b| {
            a.filename
                .to_lowercase()
                .cmp(&b.filename.to_lowercase())
                .then_with(|| a.filename.cmp(&b.filename))
        });
        Ok(out)
    }

    /// Delete a mod file. A missing file is not an error.
    pub async fn remove_mod(&self, id: &ProfileId, filename: &str) -> Result<()> {
        let filename = validate_mod_filename(filename)?;
        let (_, dir) = self.mods_dir(id).await?;
        match tokio::fs::remove_file(dir.join(filename)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Enable (strip `.disabled`) or disable (append it). Already in the
    /// requested state is a no-op.
    pub async fn toggle_mod(&self, id: &ProfileId, filename: &str, enabled: bool) -> Result<()> {
        let filename = validate_mod_filename(filename)?;
        let (_, dir) = self.mods_dir(id).await?;
        let current = dir.join(filename);

        let next = match (enabled, filename.strip_suffix(DISABLED_SUFFIX)) {
            (true, Some(base)) => dir.join(base),
            (false, None) => dir.join(format!("{filename}{DISABLED_SUFFIX}")),
            _ => return Ok(()),
        };
        tokio::fs::rename(&current, &next).await?;
        Ok(())
    }

    /// Import `.jar` files and `.zip` archives. Other files are ignored.
    pub async fn import_files(&self, id: &ProfileId, paths: Vec<PathBuf>) -> Result<ImportResult> {
        let (server, dir) = self.mods_dir(id).await?;
        let result = tokio::task::spawn_blocking(move || import_files_blocking(&server, &dir, &paths))
            .await
            .map_err(|e| ManagerError::Io(std::io::Error::other(e)))??;
        tracing::info!(
            profile_id = %id,
            imported = result.imported_count,
            skipped = result.skipped_count,
            conflicts = result.conflicts.len(),
            "mods imported"
        );
        Ok(result)
    }

    /// Import `mods/` from a prepared instance folder (skipping existing
    /// files) plus the selected config directories (overwriting).
    pub async fn import_from_folder(
        &self,
        id: &ProfileId,
        folder: PathBuf,
        options: FolderImportOptions,
    ) -> Result<ImportResult> {
        let (server, dir) = self.mods_dir(id).await?;
        tokio::task::spawn_blocking(move || import_folder_blocking(&server, &dir, &folder, options))
            .await
            .map_err(|e| ManagerError::Io(std::io::Error::other(e)))?
    }
}
