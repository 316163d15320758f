//! Checkpoint persistence for resumable builds.
//!
//! One token per build directory, stored as plain text in `.checkpoint`.
//! Setting a token replaces the previous one; the file is removed once a
//! build completes.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{BuildError, Result};

/// Furthest point a previous run reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Checkpoint {
    /// Source checked out at the target tag
    Cloned,
    /// Compiler output exists and passed its smoke test
    Built,
    /// Every output installed
    Complete,
}

impl Checkpoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            Checkpoint::Cloned => "cloned",
            Checkpoint::Built => "built",
            Checkpoint::Complete => "complete",
        }
    }

    pub fn parse(token: &str) -> Option<Self> {
        match token.trim() {
            "cloned" => Some(Checkpoint::Cloned),
            "built" => Some(Checkpoint::Built),
            "complete" => Some(Checkpoint::Complete),
            _ => None,
        }
    }
}

/// Typed access to the checkpoint file of one build directory.
#[derive(Debug, Clone)]
pub struct BuildStateStore {
    path: PathBuf,
}

impl BuildStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        BuildStateStore { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current checkpoint. Unknown tokens are ignored with a warning so a
    /// corrupt file only costs a rebuild.
    pub fn get(&self) -> Result<Option<Checkpoint>> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(BuildError::io(
                    format!("reading checkpoint {}", self.path.display()),
                    e,
                ))
            }
        };
        let parsed = Checkpoint::parse(&raw);
        if parsed.is_none() {
            log::warn!(
                "[Checkpoint] [READ] Ignoring unknown checkpoint token '{}'",
                raw.trim()
            );
        }
        Ok(parsed)
    }

    pub fn set(&self, checkpoint: Checkpoint) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| BuildError::io(format!("creating {}", parent.display()), e))?;
        }
        let staging = self.path.with_extension("tmp");
        fs::write(&staging, format!("{}\n", checkpoint.as_str()))
            .and_then(|_| fs::rename(&staging, &self.path))
            .map_err(|e| BuildError::io(format!("writing checkpoint {}", self.path.display()), e))?;
        log::info!("[Checkpoint] [SET] {}", checkpoint.as_str());
        Ok(())
    }

    pub fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                log::debug!("[Checkpoint] [CLEAR] {}", self.path.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BuildError::io(
                format!("removing checkpoint {}", self.path.display()),
                e,
            )),
        }
    }

    /// At least `checkpoint` has been reached.
    pub fn reached(&self, checkpoint: Checkpoint) -> Result<bool> {
        Ok(self.get()?.map(|c| c >= checkpoint).unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_get_set_clear() {
        let temp = TempDir::new().unwrap();
        let store = BuildStateStore::new(temp.path().join("build/.checkpoint"));
        assert_eq!(store.get().unwrap(), None);

        store.set(Checkpoint::Cloned).unwrap();
        assert_eq!(store.get().unwrap(), Some(Checkpoint::Cloned));
        store.set(Checkpoint::Built).unwrap();
        assert_eq!(fs::read_to_string(store.path()).unwrap(), "built\n");
        assert!(store.reached(Checkpoint::Cloned).unwrap());
        assert!(!store.reached(Checkpoint::Complete).unwrap());

        store.clear().unwrap();
        assert!(!store.path().exists());
        store.clear().unwrap();
    }

    #[test]
    fn test_unknown_token_is_ignored() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(".checkpoint");
        fs::write(&path, "half-built").unwrap();
        assert_eq!(BuildStateStore::new(&path).get().unwrap(), None);
    }
}
