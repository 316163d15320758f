//! Debug-symbol stripping.

use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;

use crate::error::{BuildError, Result};
use crate::models::Platform;

/// Flag sets tried in order until one succeeds.
pub fn strip_flag_sets(platform: Platform) -> &'static [&'static [&'static str]] {
    match platform {
        Platform::Linux => &[&["--strip-all"], &["-s"]],
        // Plain `strip` keeps the dyld-required symbols on macOS
        Platform::Darwin => &[&["-x"], &[]],
        Platform::Win32 => &[],
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StripOutcome {
    Stripped { flags: Vec<String>, before: u64, after: u64 },
    /// Platform has no strip step
    Skipped,
}

/// Strip `binary` in place.
pub async fn strip_binary(strip_tool: &str, binary: &Path, platform: Platform) -> Result<StripOutcome> {
    let flag_sets = strip_flag_sets(platform);
    if flag_sets.is_empty() {
        log::info!("[Strip] [SKIP] No strip step for {}", platform);
        return Ok(StripOutcome::Skipped);
    }

    let before = file_size(binary)?;
    let mut errors = Vec::new();
    for flags in flag_sets {
        let output = Command::new(strip_tool)
            .args(flags.iter())
            .arg(binary)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| BuildError::io(format!("running {}", strip_tool), e))?;

        if output.status.success() {
            let after = file_size(binary)?;
            log::info!(
                "[Strip] [DONE] {} {} → {} bytes",
                if flags.is_empty() { "(no flags)".to_string() } else { flags.join(" ") },
                before,
                after
            );
            return Ok(StripOutcome::Stripped {
                flags: flags.iter().map(|f| f.to_string()).collect(),
                before,
                after,
            });
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        log::warn!(
            "[Strip] [RETRY] '{} {}' failed: {}",
            strip_tool,
            flags.join(" "),
            stderr
        );
        errors.push(stderr);
    }

    Err(BuildError::BinaryCorruption {
        step: "strip".to_string(),
        binary: binary.to_path_buf(),
        reason: format!("every strip flag set failed: {}", errors.join("; ")),
    })
}

fn file_size(path: &Path) -> Result<u64> {
    std::fs::metadata(path)
        .map(|m| m.len())
        .map_err(|e| BuildError::io(format!("reading {}", path.display()), e))
}
