//! Opaque byte transforms applied to file contents on their way to and from
//! the relay.
//!
//! The relay protocols never look inside transferred files, so a transform
//! only has to be reversible. All methods do blocking I/O.

use crate::error::{Result, SyncError};
use crate::relay::{PARTIAL_SUFFIX, TEMP_PREFIX};
use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const ZSTD_LEVEL: i32 = 3;

pub trait Cipher: Send + Sync {
    fn name(&self) -> &'static str;

    /// File to upload in place of `path`. May be `path` itself.
    fn encrypt(&self, path: &Path) -> Result<PathBuf>;

    /// Turn the downloaded `src` into the workspace file `dst`.
    fn decrypt(&self, src: &Path, dst: &Path) -> Result<()>;

    /// Drop whatever `encrypt` produced, once it has been pushed.
    fn finalize(&self, encrypted: &Path) -> Result<()>;
}

/// Identity transform.
pub struct PlainCipher;

impl Cipher for PlainCipher {
    fn name(&self) -> &'static str {
        "plain"
    }

    fn encrypt(&self, path: &Path) -> Result<PathBuf> {
        Ok(path.to_path_buf())
    }

    fn decrypt(&self, src: &Path, dst: &Path) -> Result<()> {
        if let Some(parent) = dst.parent() {
            std::fs::create_dir_all(parent)?;
        }
        // Across file systems a rename is not possible
        if std::fs::rename(src, dst).is_err() {
            std::fs::copy(src, dst)?;
        }
        Ok(())
    }

    fn finalize(&self, _encrypted: &Path) -> Result<()> {
        Ok(())
    }
}

/// zstd-compressed contents.
pub struct ZstdCipher;

impl Cipher for ZstdCipher {
    fn name(&self) -> &'static str {
        "zstd"
    }

    fn encrypt(&self, path: &Path) -> Result<PathBuf> {
        let mut input = File::open(path)?;
        let mut output = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .suffix(".zst")
            .tempfile()?;
        zstd::stream::copy_encode(&mut input, output.as_file_mut(), ZSTD_LEVEL)?;
        let (_, encrypted) = output.keep().map_err(|e| SyncError::Io(e.error))?;
        Ok(encrypted)
    }

    fn decrypt(&self, src: &Path, dst: &Path) -> Result<()> {
        let parent = match dst.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(parent)?;
        let mut input = File::open(src)?;
        let mut output = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .suffix(PARTIAL_SUFFIX)
            .tempfile_in(parent)?;
        zstd::stream::copy_decode(&mut input, output.as_file_mut()).map_err(|e| {
            SyncError::Corrupted {
                target: src.display().to_string(),
                message: format!("not zstd data: {}", e),
            }
        })?;
        output.persist(dst).map_err(|e| SyncError::Io(e.error))?;
        Ok(())
    }

    fn finalize(&self, encrypted: &Path) -> Result<()> {
        match std::fs::remove_file(encrypted) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Ciphers keyed by name, built once at startup.
pub struct CipherRegistry {
    ciphers: HashMap<&'static str, Arc<dyn Cipher>>,
}

impl CipherRegistry {
    pub fn init() -> Self {
        let mut ciphers: HashMap<&'static str, Arc<dyn Cipher>> = HashMap::new();
        for cipher in [Arc::new(PlainCipher) as Arc<dyn Cipher>, Arc::new(ZstdCipher)] {
            ciphers.insert(cipher.name(), cipher);
        }
        Self { ciphers }
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.ciphers.keys().copied().collect();
        names.sort_unstable();
        names
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Cipher>> {
        self.ciphers.get(name).cloned().ok_or_else(|| {
            SyncError::Config(format!(
                "unknown cipher '{}' (known: {})",
                name,
                self.names().join(", ")
            ))
        })
    }
}
