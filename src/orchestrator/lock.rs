//! Advisory build-directory lock.
//!
//! `<build>/.build.lock` holds the owner's PID. The PID is written to a
//! private temp file first and hard-linked into place, so the lock is never
//! visible without its owner and two runs cannot both win. A lock whose owner
//! is no longer alive is considered stale and replaced.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use sysinfo::{Pid, ProcessesToUpdate, System};

use crate::error::{BuildError, Result};

/// An unreadable lock younger than this may still be mid-write by a creator
/// that does not use the link protocol.
const UNREADABLE_GRACE: Duration = Duration::from_secs(5);

/// Held for the duration of a run; removes the lock file on drop.
#[derive(Debug)]
pub struct BuildLock {
    path: PathBuf,
    pid: u32,
}

enum Owner {
    Live(u32),
    Stale(Option<u32>),
}

impl BuildLock {
    /// Take the lock at `path`, replacing it if its owner is dead.
    pub fn acquire(path: &Path) -> Result<Self> {
        let parent = path
            .parent()
            .ok_or_else(|| BuildError::Config(format!("{} has no parent directory", path.display())))?;
        fs::create_dir_all(parent)
            .map_err(|e| BuildError::io(format!("creating {}", parent.display()), e))?;
        let pid = std::process::id();

        let staging = staging_path(path, pid);
        fs::write(&staging, pid.to_string())
            .map_err(|e| BuildError::io(format!("writing {}", staging.display()), e))?;
        let result = Self::link_into_place(&staging, path, pid);
        let _ = fs::remove_file(&staging);
        result
    }

    fn link_into_place(staging: &Path, path: &Path, pid: u32) -> Result<Self> {
        // Second pass only after a stale lock was removed
        for _ in 0..2 {
            match fs::hard_link(staging, path) {
                Ok(()) => {
                    log::debug!("[Lock] [ACQUIRE] {} (pid {})", path.display(), pid);
                    return Ok(BuildLock {
                        path: path.to_path_buf(),
                        pid,
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => match inspect_owner(path, pid) {
                    Owner::Live(owner) => {
                        return Err(BuildError::BuildLocked {
                            lock_path: path.to_path_buf(),
                            pid: owner,
                        });
                    }
                    Owner::Stale(owner) => remove_stale(path, owner)?,
                },
                Err(e) => {
                    return Err(BuildError::io(format!("creating lock {}", path.display()), e))
                }
            }
        }

        Err(BuildError::BuildLocked {
            lock_path: path.to_path_buf(),
            pid: read_owner(path).unwrap_or(0),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for BuildLock {
    fn drop(&mut self) {
        // Only remove the file if it is still ours
        if read_owner(&self.path) == Some(self.pid) {
            let _ = fs::remove_file(&self.path);
            log::debug!("[Lock] [RELEASE] {}", self.path.display());
        }
    }
}

fn staging_path(path: &Path, pid: u32) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "lock".to_string());
    path.with_file_name(format!("{}.{}.{}.tmp", name, pid, nanos))
}

/// Who holds the existing lock. Our own PID counts as live: a second
/// acquire in the same process must not steal the first guard's lock.
fn inspect_owner(path: &Path, pid: u32) -> Owner {
    match read_owner(path) {
        Some(owner) if owner == pid || process_alive(owner) => Owner::Live(owner),
        Some(owner) => Owner::Stale(Some(owner)),
        None if lock_age(path).map_or(false, |age| age < UNREADABLE_GRACE) => Owner::Live(0),
        None => Owner::Stale(None),
    }
}

fn lock_age(path: &Path) -> Option<Duration> {
    let modified = fs::metadata(path).ok()?.modified().ok()?;
    Some(SystemTime::now().duration_since(modified).unwrap_or_default())
}

fn remove_stale(path: &Path, owner: Option<u32>) -> Result<()> {
    // Someone else may have replaced it already
    if read_owner(path) != owner {
        return Ok(());
    }
    log::warn!(
        "[Lock] [STALE] Replacing stale lock {} (owner {})",
        path.display(),
        owner.map_or("unknown".to_string(), |p| p.to_string())
    );
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(BuildError::io(format!("removing stale lock {}", path.display()), e)),
    }
}

fn read_owner(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

pub fn process_alive(pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    system.process(pid).is_some()
}
