//! Binary post-processing pipeline.
//!
//! Release copy → strip → smoke test → sign → smoke test → compress →
//! re-sign → verify signature → smoke test. Each step writes a fresh copy into
//! its own stage directory; the compiler output itself is never modified.

pub mod binary_cache;
pub mod compress;
pub mod sign;
pub mod strip;

use std::path::PathBuf;

use crate::config::BuildConfig;
use crate::error::{BuildError, Result};
use crate::models::Stage;
use crate::system::copy_executable;
use crate::system::verification::smoke_test;

pub use compress::CompressionStats;
pub use strip::StripOutcome;

/// What the strip stage produced.
#[derive(Debug, Clone)]
pub struct StrippedArtifact {
    pub path: PathBuf,
    pub outcome: StripOutcome,
    pub signed: bool,
}

/// What the compress stage produced.
#[derive(Debug, Clone)]
pub struct FinalArtifact {
    pub path: PathBuf,
    pub size: u64,
    /// `None` when compression was disabled or no stub was available
    pub compression: Option<CompressionStats>,
}

/// Release copy, strip and (on macOS arm64) sign.
pub async fn strip_stage(config: &BuildConfig) -> Result<StrippedArtifact> {
    let compiled = config.compiler_output();
    if !compiled.is_file() {
        return Err(BuildError::Compilation {
            reason: format!("compiler output {} is missing", compiled.display()),
            log_path: None,
            log_tail: Vec::new(),
        });
    }

    let release = config.stage_binary(Stage::Release);
    copy_executable(&compiled, &release)?;
    log::info!("[PostProcess] [RELEASE] {}", release.display());

    let stripped = config.stage_binary(Stage::Stripped);
    copy_executable(&release, &stripped)?;
    let outcome = strip::strip_binary(&config.tools.strip, &stripped, config.platform).await?;
    smoke_test(&stripped, &config.node_version, "strip").await?;

    let signed = config.needs_signing();
    if signed {
        sign::sign_adhoc(&config.tools.codesign, &stripped).await?;
        smoke_test(&stripped, &config.node_version, "sign").await?;
    }

    Ok(StrippedArtifact {
        path: stripped,
        outcome,
        signed,
    })
}

/// Optional compression, then the Final and Sea stages.
pub async fn compress_stage(config: &BuildConfig, stripped: &StrippedArtifact) -> Result<FinalArtifact> {
    let compressed = if config.compress {
        compress_binary(config, stripped).await?
    } else {
        log::info!("[PostProcess] [COMPRESS] Disabled (SMOL_COMPRESS)");
        None
    };

    let (source, compression) = match compressed {
        Some((path, stats)) => (path, Some(stats)),
        None => (stripped.path.clone(), None),
    };

    let final_path = config.stage_binary(Stage::Final);
    let size = copy_executable(&source, &final_path)?;
    smoke_test(&final_path, &config.node_version, "final").await?;

    // Single-executable applications need the uncompressed binary to inject into
    let sea = config.stage_binary(Stage::Sea);
    copy_executable(&stripped.path, &sea)?;

    log::info!(target: "parsed", "Final binary: {} ({} bytes)", final_path.display(), size);
    Ok(FinalArtifact {
        path: final_path,
        size,
        compression,
    })
}

async fn compress_binary(
    config: &BuildConfig,
    stripped: &StrippedArtifact,
) -> Result<Option<(PathBuf, CompressionStats)>> {
    let Some(stub) = compress::locate_stub(config.stub_path.as_deref(), config.platform, config.arch)
    else {
        log::warn!(
            "[PostProcess] [COMPRESS] No decompression stub for {}-{}; skipping compression",
            config.platform,
            config.arch
        );
        return Ok(None);
    };

    let output = config.stage_binary(Stage::Compressed);
    let spec = compress::spec_string(&config.node_version, config.platform, config.arch);
    let input = stripped.path.clone();
    let target = output.clone();
    let platform = config.platform;
    let stats = tokio::task::spawn_blocking(move || {
        compress::compress_file(&stub, &input, &target, platform, Some(&spec))
    })
    .await
    .map_err(|e| BuildError::Config(format!("compression task failed: {}", e)))?
    .map_err(|e| match e {
        compress::FormatError::Io(e) => {
            BuildError::io(format!("compressing {}", stripped.path.display()), e)
        }
        other => BuildError::BinaryCorruption {
            binary: stripped.path.clone(),
            step: "compress".to_string(),
            reason: other.to_string(),
        },
    })?;
    crate::system::set_executable(&output)?;

    log::info!(
        "[PostProcess] [COMPRESS] {} → {} bytes ({:.1}% smaller)",
        stats.original_size,
        stats.artifact_size,
        stats.savings_percent()
    );

    if config.needs_signing() {
        sign::sign_adhoc(&config.tools.codesign, &output).await?;
        sign::verify_signature(&config.tools.codesign, &output).await?;
    }
    smoke_test(&output, &config.node_version, "compress").await?;
    Ok(Some((output, stats)))
}
