//! Content-hash build cache.
//!
//! The hash covers every input that can change the produced binary: patch
//! files, auxiliary source additions, the settings file and the serialized
//! build configuration. A stored hash is only trusted when every declared
//! output still exists.

use sha2::{Digest, Sha256};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use crate::config::BuildConfig;
use crate::error::{BuildError, Result};
use crate::runtime::patcher::{discover_patches, list_files_recursive};

const HASH_HEADER: &str = "# smol-builder content hash (sha256)";

/// Outcome of a cache check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheStatus {
    /// Hash matches and outputs exist
    Valid,
    NoStoredHash,
    HashMismatch,
    MissingOutput(PathBuf),
}

impl CacheStatus {
    pub fn is_valid(&self) -> bool {
        matches!(self, CacheStatus::Valid)
    }
}

/// SHA-256 over every build input.
pub fn compute_content_hash(config: &BuildConfig) -> Result<String> {
    let mut hasher = Sha256::new();

    for patch in discover_patches(&config.patch_dirs())? {
        hasher.update(b"patch\0");
        hasher.update(patch_label(&patch).as_bytes());
        hasher.update(b"\0");
        hash_file_into(&mut hasher, &patch)?;
    }

    if config.additions_dir.is_dir() {
        for relative in list_files_recursive(&config.additions_dir)? {
            let label = relative.to_string_lossy().replace('\\', "/");
            hasher.update(b"addition\0");
            hasher.update(label.as_bytes());
            hasher.update(b"\0");
            hash_file_into(&mut hasher, &config.additions_dir.join(&relative))?;
        }
    }

    if let Some(settings) = &config.settings_file {
        if settings.exists() {
            hasher.update(b"settings\0");
            hash_file_into(&mut hasher, settings)?;
        }
    }

    hasher.update(b"config\0");
    hasher.update(config.fingerprint().as_bytes());

    Ok(hex::encode(hasher.finalize()))
}

fn patch_label(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn hash_file_into(hasher: &mut Sha256, path: &Path) -> Result<()> {
    let mut file = fs::File::open(path)
        .map_err(|e| BuildError::io(format!("opening {} for hashing", path.display()), e))?;
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file
            .read(&mut buf)
            .map_err(|e| BuildError::io(format!("reading {}", path.display()), e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(())
}

/// Hex SHA-256 of one file.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut hasher = Sha256::new();
    hash_file_into(&mut hasher, path)?;
    Ok(hex::encode(hasher.finalize()))
}

/// Stored hash, if the file exists and is well formed.
pub fn read_stored_hash(path: &Path) -> Option<String> {
    let raw = fs::read_to_string(path).ok()?;
    raw.lines()
        .map(str::trim)
        .find(|l| !l.is_empty() && !l.starts_with('#'))
        .filter(|l| l.len() == 64 && l.chars().all(|c| c.is_ascii_hexdigit()))
        .map(str::to_lowercase)
}

pub fn write_hash(path: &Path, hash: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| BuildError::io(format!("creating {}", parent.display()), e))?;
    }
    fs::write(path, format!("{}\n{}\n", HASH_HEADER, hash))
        .map_err(|e| BuildError::io(format!("writing {}", path.display()), e))
}

/// Compare the stored hash with `fresh` and confirm the outputs exist.
pub fn check_cache(hash_path: &Path, fresh: &str, outputs: &[PathBuf]) -> CacheStatus {
    let Some(stored) = read_stored_hash(hash_path) else {
        return CacheStatus::NoStoredHash;
    };
    if stored != fresh {
        return CacheStatus::HashMismatch;
    }
    match outputs.iter().find(|o| !o.exists()) {
        Some(missing) => CacheStatus::MissingOutput(missing.clone()),
        None => CacheStatus::Valid,
    }
}

/// Whether `config`'s outputs are current.
pub fn is_cache_valid(config: &BuildConfig) -> Result<CacheStatus> {
    let fresh = compute_content_hash(config)?;
    Ok(check_cache(&config.hash_path(), &fresh, &config.declared_outputs()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CliArgs, EnvSnapshot};
    use tempfile::TempDir;

    fn config_in(root: &Path) -> BuildConfig {
        let args = CliArgs {
            project_root: Some(root.to_path_buf()),
            ..CliArgs::default()
        };
        BuildConfig::resolve(&args, &EnvSnapshot::default()).unwrap()
    }

    #[test]
    fn test_hash_file_format() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(".cache/build-hash.txt");
        let hash = "a".repeat(64);
        write_hash(&path, &hash).unwrap();
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            format!("# smol-builder content hash (sha256)\n{}\n", hash)
        );
        assert_eq!(read_stored_hash(&path), Some(hash));
    }

    #[test]
    fn test_malformed_hash_ignored() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("hash.txt");
        fs::write(&path, "# header\nnot-a-hash\n").unwrap();
        assert_eq!(read_stored_hash(&path), None);
    }

    #[test]
    fn test_hash_tracks_patch_and_addition_content() {
        let temp = TempDir::new().unwrap();
        let config = config_in(temp.path());
        fs::create_dir_all(temp.path().join("patches")).unwrap();
        fs::create_dir_all(temp.path().join("additions/src")).unwrap();
        fs::write(temp.path().join("patches/001.patch"), "@@ -1 +1 @@\n").unwrap();
        fs::write(temp.path().join("additions/src/smol.h"), "#define A 1\n").unwrap();

        let first = compute_content_hash(&config).unwrap();
        assert_eq!(first, compute_content_hash(&config).unwrap());

        fs::write(temp.path().join("additions/src/smol.h"), "#define A 2\n").unwrap();
        let second = compute_content_hash(&config).unwrap();
        assert_ne!(first, second);

        fs::write(temp.path().join("patches/001.patch"), "@@ -1 +1,2 @@\n").unwrap();
        assert_ne!(second, compute_content_hash(&config).unwrap());
    }

    #[test]
    fn test_check_cache_requires_outputs() {
        let temp = TempDir::new().unwrap();
        let hash_path = temp.path().join("hash.txt");
        let output = temp.path().join("out/node");
        let hash = "b".repeat(64);

        assert_eq!(check_cache(&hash_path, &hash, &[]), CacheStatus::NoStoredHash);
        write_hash(&hash_path, &hash).unwrap();
        assert_eq!(
            check_cache(&hash_path, &"c".repeat(64), &[]),
            CacheStatus::HashMismatch
        );
        assert_eq!(
            check_cache(&hash_path, &hash, &[output.clone()]),
            CacheStatus::MissingOutput(output.clone())
        );
        fs::create_dir_all(output.parent().unwrap()).unwrap();
        fs::write(&output, "bin").unwrap();
        assert!(check_cache(&hash_path, &hash, &[output]).is_valid());
    }

    #[test]
    fn test_sha256_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("f");
        fs::write(&path, "abc").unwrap();
        assert_eq!(
            sha256_file(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
