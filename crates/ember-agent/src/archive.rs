//! Archive extraction and tree copies. All functions block; call them from
//! `spawn_blocking`.

use std::{
    fs,
    io::Read,
    path::{Component, Path, PathBuf},
};

use anyhow::Context;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Zip,
    TarGz,
}

/// Detect the archive format from its leading magic bytes.
pub fn sniff_kind(path: &Path) -> anyhow::Result<ArchiveKind> {
    let mut f = fs::File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut magic = [0u8; 4];
    let n = f.read(&mut magic).context("read archive header")?;
    match &magic[..n] {
        [b'P', b'K', 3, 4] | [b'P', b'K', 5, 6] => Ok(ArchiveKind::Zip),
        [0x1f, 0x8b, ..] => Ok(ArchiveKind::TarGz),
        _ => anyhow::bail!("unrecognized archive format: {}", path.display()),
    }
}

pub fn extract(archive: &Path, out_dir: &Path) -> anyhow::Result<()> {
    match sniff_kind(archive)? {
        ArchiveKind::Zip => extract_zip_safely(archive, out_dir),
        ArchiveKind::TarGz => extract_tar_gz(archive, out_dir),
    }
}

/// Relative path with `.` removed; rejects absolute paths and `..`.
pub fn normalize_rel_path(rel: &str) -> anyhow::Result<PathBuf> {
    if rel.trim().is_empty() {
        return Ok(PathBuf::new());
    }
    let p = Path::new(rel);
    if p.is_absolute() {
        anyhow::bail!("absolute paths are not allowed");
    }
    let mut out = PathBuf::new();
    for c in p.components() {
        match c {
            Component::CurDir => {}
            Component::Normal(seg) => out.push(seg),
            Component::ParentDir => anyhow::bail!("path traversal is not allowed"),
            Component::Prefix(_) | Component::RootDir => {
                anyhow::bail!("absolute paths are not allowed")
            }
        }
    }
    Ok(out)
}

pub fn extract_zip_safely(zip_path: &Path, out_dir: &Path) -> anyhow::Result<()> {
    fs::create_dir_all(out_dir)?;
    let f = fs::File::open(zip_path)?;
    let mut archive = zip::ZipArchive::new(f).context("read zip archive")?;

    for i in 0..archive.len() {
        let mut file = archive.by_index(i)?;
        let name = file.name().to_string();
        let trimmed = name.trim_end_matches('/');
        if trimmed.is_empty() {
            continue;
        }
        let rel =
            normalize_rel_path(trimmed).with_context(|| format!("invalid zip path {trimmed:?}"))?;
        if rel.as_os_str().is_empty() {
            continue;
        }
        let out_path = out_dir.join(&rel);
        if file.is_dir() {
            fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = fs::File::create(&out_path)?;
        std::io::copy(&mut file, &mut out)?;

        #[cfg(unix)]
        if let Some(mode) = file.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&out_path, fs::Permissions::from_mode(mode & 0o7777))?;
        }
    }
    Ok(())
}

pub fn extract_tar_gz(path: &Path, out_dir: &Path) -> anyhow::Result<()> {
    fs::create_dir_all(out_dir)?;
    let f = fs::File::open(path)?;
    let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(f));
    archive.set_preserve_permissions(true);
    // `unpack` refuses entries that would escape `out_dir`.
    archive.unpack(out_dir).context("unpack tar.gz archive")?;
    Ok(())
}

/// Recursively copy `src` into `dst`, overwriting files. Symlinks are
/// recreated on Unix and skipped elsewhere.
pub fn copy_dir_all(src: &Path, dst: &Path) -> anyhow::Result<()> {
    fs::create_dir_all(dst)?;
    for e in fs::read_dir(src)? {
        let e = e?;
        let p = e.path();
        let out = dst.join(e.file_name());
        let meta = fs::symlink_metadata(&p)?;
        if meta.file_type().is_symlink() {
            #[cfg(unix)]
            {
                let target = fs::read_link(&p)?;
                let _ = fs::remove_file(&out);
                std::os::unix::fs::symlink(target, &out)?;
            }
            continue;
        }
        if meta.is_dir() {
            copy_dir_all(&p, &out)?;
            continue;
        }
        if meta.is_file() {
            fs::copy(&p, &out).with_context(|| format!("copy {}", p.display()))?;
        }
    }
    Ok(())
}
