//! Compiled-binary cache.
//!
//! Keeps the last unstripped compiler output per version/platform/arch so a
//! rebuild whose inputs did not change skips configure and compile. An entry
//! is only trusted when its recorded content hash matches the current build
//! inputs and the stored binary still hashes to what was recorded.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{BuildError, Result};
use crate::orchestrator::cache::sha256_file;
use crate::system::copy_executable;

const METADATA_FILE: &str = "metadata.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheMetadata {
    pub sha256: String,
    pub size: u64,
    /// Build-input hash the binary was compiled from
    pub content_hash: String,
    pub created_at: DateTime<Utc>,
}

pub struct CompiledBinaryCache {
    dir: PathBuf,
    binary_name: String,
}

impl CompiledBinaryCache {
    pub fn new(dir: impl Into<PathBuf>, binary_name: &str) -> Self {
        CompiledBinaryCache {
            dir: dir.into(),
            binary_name: binary_name.to_string(),
        }
    }

    pub fn binary_path(&self) -> PathBuf {
        self.dir.join(&self.binary_name)
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.dir.join(METADATA_FILE)
    }

    pub fn read_metadata(&self) -> Option<CacheMetadata> {
        let raw = fs::read_to_string(self.metadata_path()).ok()?;
        serde_json::from_str(&raw).ok()
    }

    /// Copy `binary` into the cache, recording `content_hash`.
    pub fn store(&self, binary: &Path, content_hash: &str) -> Result<CacheMetadata> {
        let size = copy_executable(binary, &self.binary_path())?;
        let metadata = CacheMetadata {
            sha256: sha256_file(&self.binary_path())?,
            size,
            content_hash: content_hash.to_string(),
            created_at: Utc::now(),
        };
        let json = serde_json::to_string_pretty(&metadata)
            .map_err(|e| BuildError::Config(format!("serializing cache metadata: {}", e)))?;
        fs::write(self.metadata_path(), json)
            .map_err(|e| BuildError::io(format!("writing {}", self.metadata_path().display()), e))?;
        log::info!(
            "[Cache] [STORE] Compiled binary cached at {} ({} bytes)",
            self.dir.display(),
            size
        );
        Ok(metadata)
    }

    /// Cached binary for `content_hash`, if present and intact.
    pub fn lookup(&self, content_hash: &str) -> Option<PathBuf> {
        let metadata = self.read_metadata()?;
        if metadata.content_hash != content_hash {
            log::debug!("[Cache] [LOOKUP] Compiled cache is for different inputs");
            return None;
        }
        let binary = self.binary_path();
        let size = fs::metadata(&binary).ok()?.len();
        if size != metadata.size {
            log::warn!("[Cache] [LOOKUP] Cached binary size changed, ignoring entry");
            return None;
        }
        match sha256_file(&binary) {
            Ok(hash) if hash == metadata.sha256 => Some(binary),
            _ => {
                log::warn!("[Cache] [LOOKUP] Cached binary checksum mismatch, ignoring entry");
                None
            }
        }
    }

    /// Copy a valid cached binary to `dest`.
    pub fn restore(&self, content_hash: &str, dest: &Path) -> Result<bool> {
        let Some(cached) = self.lookup(content_hash) else {
            return Ok(false);
        };
        copy_executable(&cached, dest)?;
        log::info!("[Cache] [RESTORE] ✓ Restored compiled binary to {}", dest.display());
        Ok(true)
    }

    pub fn clear(&self) -> Result<()> {
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BuildError::io(format!("removing {}", self.dir.display()), e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, CompiledBinaryCache, PathBuf) {
        let temp = TempDir::new().unwrap();
        let cache = CompiledBinaryCache::new(temp.path().join("cache/compiled/v24.10.0-linux-x64"), "node");
        let binary = temp.path().join("out/Release/node");
        fs::create_dir_all(binary.parent().unwrap()).unwrap();
        fs::write(&binary, b"compiled runtime").unwrap();
        (temp, cache, binary)
    }

    #[test]
    fn test_store_and_lookup() {
        let (_temp, cache, binary) = setup();
        let metadata = cache.store(&binary, "hash-a").unwrap();
        assert_eq!(metadata.size, 16);
        assert_eq!(cache.read_metadata(), Some(metadata));
        assert_eq!(cache.lookup("hash-a"), Some(cache.binary_path()));
        assert_eq!(cache.lookup("hash-b"), None);
    }

    #[test]
    fn test_tampered_entry_is_ignored() {
        let (_temp, cache, binary) = setup();
        cache.store(&binary, "hash-a").unwrap();
        fs::write(cache.binary_path(), b"compiled runtimX").unwrap();
        assert_eq!(cache.lookup("hash-a"), None);
    }

    #[test]
    fn test_restore_and_clear() {
        let (temp, cache, binary) = setup();
        cache.store(&binary, "hash-a").unwrap();
        let dest = temp.path().join("restored/node");
        assert!(cache.restore("hash-a", &dest).unwrap());
        assert_eq!(fs::read(&dest).unwrap(), b"compiled runtime");
        assert!(!cache.restore("other", &dest).unwrap());

        cache.clear().unwrap();
        assert!(cache.read_metadata().is_none());
        cache.clear().unwrap();
    }
}
