//! Distribution installer.
//!
//! Places the final artifact at every consumption point: the distribution
//! staging tree, the package-manager build cache and the end-to-end fixture
//! path. A copy only counts once it runs and matches the source size.

use std::path::{Path, PathBuf};

use crate::config::BuildConfig;
use crate::error::{BuildError, Result};
use crate::models::Stage;
use crate::orchestrator::cache::sha256_file;
use crate::system::copy_executable;
use crate::system::verification::smoke_test;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallTarget {
    pub name: &'static str,
    pub path: PathBuf,
}

/// Every place the final artifact is installed to.
pub fn install_targets(config: &BuildConfig) -> Vec<InstallTarget> {
    vec![
        InstallTarget {
            name: "distribution",
            path: config.stage_binary(Stage::Distribution),
        },
        InstallTarget {
            name: "pkg-cache",
            path: config.pkg_cache_target(),
        },
        InstallTarget {
            name: "e2e-fixture",
            path: config.e2e_fixture_target(),
        },
    ]
}

fn install_error(target: &Path, reason: impl Into<String>) -> BuildError {
    BuildError::CacheInstall {
        target: target.to_path_buf(),
        reason: reason.into(),
    }
}

fn size_of(path: &Path) -> Result<u64> {
    std::fs::metadata(path)
        .map(|m| m.len())
        .map_err(|e| install_error(path, format!("cannot stat: {}", e)))
}

/// Copy `artifact` to every target, smoke-testing each copy.
pub async fn install_all(config: &BuildConfig, artifact: &Path) -> Result<Vec<InstallTarget>> {
    let expected = size_of(artifact)?;
    let targets = install_targets(config);

    for target in &targets {
        copy_executable(artifact, &target.path)
            .map_err(|e| install_error(&target.path, e.to_string()))?;
        let actual = size_of(&target.path)?;
        if actual != expected {
            return Err(install_error(
                &target.path,
                format!("size {} differs from source artifact ({})", actual, expected),
            ));
        }
        smoke_test(&target.path, &config.node_version, target.name)
            .await
            .map_err(|e| install_error(&target.path, e.to_string()))?;
        log::info!("[Install] [{}] ✓ {}", target.name.to_uppercase(), target.path.display());
    }
    log::info!(target: "parsed", "Installed to {} location(s)", targets.len());
    Ok(targets)
}

/// Re-check installed copies: present and same size, plus identical SHA-256
/// when `checksums` is set.
pub fn verify_installation(config: &BuildConfig, artifact: &Path, checksums: bool) -> Result<()> {
    let expected_size = size_of(artifact)?;
    let expected_hash = if checksums {
        Some(sha256_file(artifact)?)
    } else {
        None
    };

    for target in install_targets(config) {
        if !target.path.is_file() {
            return Err(install_error(&target.path, "installed copy disappeared"));
        }
        let size = size_of(&target.path)?;
        if size != expected_size {
            return Err(install_error(
                &target.path,
                format!("size {} differs from source artifact ({})", size, expected_size),
            ));
        }
        if let Some(expected) = &expected_hash {
            let actual = sha256_file(&target.path)?;
            if &actual != expected {
                return Err(install_error(
                    &target.path,
                    format!("sha256 {} differs from source artifact ({})", actual, expected),
                ));
            }
        }
    }
    log::info!(
        "[Install] [VERIFY] ✓ All copies match{}",
        if checksums { " (sha256)" } else { "" }
    );
    Ok(())
}
