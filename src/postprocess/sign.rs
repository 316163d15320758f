//! Ad-hoc code signing for macOS arm64 binaries.
//!
//! Apple silicon refuses to run unsigned code, and stripping or appending a
//! payload invalidates any existing signature.

use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;

use crate::error::{BuildError, Result};

async fn run_codesign(codesign: &str, args: &[&str], binary: &Path, step: &str) -> Result<()> {
    let output = Command::new(codesign)
        .args(args)
        .arg(binary)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| BuildError::io(format!("running {}", codesign), e))?;
    if output.status.success() {
        return Ok(());
    }
    Err(BuildError::BinaryCorruption {
        step: step.to_string(),
        binary: binary.to_path_buf(),
        reason: format!(
            "{} {} failed: {}",
            codesign,
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        ),
    })
}

/// `codesign --sign - --force <binary>`
pub async fn sign_adhoc(codesign: &str, binary: &Path) -> Result<()> {
    run_codesign(codesign, &["--sign", "-", "--force"], binary, "sign").await?;
    log::info!("[Sign] [ADHOC] ✓ {}", binary.display());
    Ok(())
}

/// `codesign --verify <binary>`
pub async fn verify_signature(codesign: &str, binary: &Path) -> Result<()> {
    run_codesign(codesign, &["--verify"], binary, "verify-signature").await?;
    log::info!("[Sign] [VERIFY] ✓ {}", binary.display());
    Ok(())
}
