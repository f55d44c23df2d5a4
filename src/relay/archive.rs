//! Packed bytes of an update transaction: a zstd-compressed tar stream with
//! one entry per resource.
//!
//! Blocking I/O; callers run these in `spawn_blocking`.

use crate::error::{Result, SyncError};
use std::fs::File;
use std::path::{Component, Path, PathBuf};

const ZSTD_LEVEL: i32 = 3;

/// Map an archive member name under `root`, refusing anything that escapes it.
pub(crate) fn validate_member(root: &Path, relative: &str) -> Result<PathBuf> {
    let rel_path = Path::new(relative);
    if relative.is_empty() || rel_path.is_absolute() {
        return Err(SyncError::Archive {
            path: root.to_path_buf(),
            message: format!("invalid member name '{}'", relative),
        });
    }
    for component in rel_path.components() {
        match component {
            Component::ParentDir | Component::Prefix(_) | Component::RootDir => {
                return Err(SyncError::Archive {
                    path: root.to_path_buf(),
                    message: format!("member escapes staging directory: '{}'", relative),
                });
            }
            _ => {}
        }
    }
    Ok(root.join(rel_path))
}

fn archive_error(path: &Path, e: impl ToString) -> SyncError {
    SyncError::Archive {
        path: path.to_path_buf(),
        message: e.to_string(),
    }
}

/// Write `members` (resource name, local file) into a new archive at `dest`.
pub fn pack(members: &[(String, PathBuf)], dest: &Path) -> Result<()> {
    let file = File::create(dest)?;
    let encoder = zstd::Encoder::new(file, ZSTD_LEVEL).map_err(|e| archive_error(dest, e))?;
    let mut builder = tar::Builder::new(encoder);
    builder.mode(tar::HeaderMode::Deterministic);

    for (resource, local) in members {
        validate_member(Path::new("."), resource)?;
        builder
            .append_path_with_name(local, resource)
            .map_err(|e| archive_error(dest, format!("{}: {}", resource, e)))?;
    }

    let encoder = builder.into_inner().map_err(|e| archive_error(dest, e))?;
    encoder.finish().map_err(|e| archive_error(dest, e))?;
    Ok(())
}

/// Extract every member of `archive` below `staging`; returns the resources.
pub fn unpack(archive: &Path, staging: &Path) -> Result<Vec<String>> {
    let file = File::open(archive)?;
    let decoder = zstd::Decoder::new(file).map_err(|e| archive_error(archive, e))?;
    let mut tar = tar::Archive::new(decoder);

    let mut resources = Vec::new();
    for entry in tar.entries().map_err(|e| archive_error(archive, e))? {
        let mut entry = entry.map_err(|e| archive_error(archive, e))?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let name = entry
            .path()
            .map_err(|e| archive_error(archive, e))?
            .to_string_lossy()
            .replace('\\', "/");
        let dest = validate_member(staging, &name)?;
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        entry.unpack(&dest).map_err(|e| archive_error(archive, e))?;
        resources.push(name);
    }
    Ok(resources)
}
