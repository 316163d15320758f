/// System module: host tool checks, environment readiness, binary verification

pub mod health;
pub mod tools;
pub mod verification;

use std::fs;
use std::path::Path;

use crate::error::{BuildError, Result};

/// High-level progress line, routed to the parsed log
#[macro_export]
macro_rules! log_parsed {
    ($($arg:tt)*) => {{
        let msg = format!($($arg)*);
        // Use target="parsed" for high-level events
        log::info!(target: "parsed", "{}", msg);
    }}
}

/// Copy an executable, creating parent directories and keeping it runnable.
///
/// Writes to a sibling temp file first and renames over `dst`, so a reader
/// never sees a half-written binary.
pub fn copy_executable(src: &Path, dst: &Path) -> Result<u64> {
    let parent = dst
        .parent()
        .ok_or_else(|| BuildError::Config(format!("{} has no parent directory", dst.display())))?;
    fs::create_dir_all(parent)
        .map_err(|e| BuildError::io(format!("creating {}", parent.display()), e))?;

    let staging = parent.join(format!(
        ".{}.tmp",
        dst.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "binary".to_string())
    ));
    let bytes = fs::copy(src, &staging).map_err(|e| {
        BuildError::io(format!("copying {} to {}", src.display(), staging.display()), e)
    })?;
    set_executable(&staging)?;
    fs::rename(&staging, dst)
        .map_err(|e| BuildError::io(format!("moving {} into place", dst.display()), e))?;
    Ok(bytes)
}

#[cfg(unix)]
pub fn set_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))
        .map_err(|e| BuildError::io(format!("chmod {}", path.display()), e))
}

#[cfg(not(unix))]
pub fn set_executable(_path: &Path) -> Result<()> {
    Ok(())
}
