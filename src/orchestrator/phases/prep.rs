//! Preparation: preflight checks, version check and source acquisition.
//!
//! Everything here runs before the first patch touches the tree:
//! - Required tools and environment readiness
//! - The target tag exists upstream
//! - A pristine checkout of that tag at `<build>/node-source`

use std::fs;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

use crate::config::BuildConfig;
use crate::error::{BuildError, Result};
use crate::orchestrator::retry::RetryPolicy;
use crate::runtime::git::{remote_has_tag, GitError, GitManager};
use crate::system::health::EnvironmentValidator;
use crate::system::tools::ToolChecker;

/// Tool availability and environment readiness.
pub async fn run_preflight(config: &BuildConfig) -> Result<()> {
    log::info!(target: "parsed", "Preflight checks");
    ToolChecker::new(config.auto_install_tools).ensure(config)?;
    EnvironmentValidator::new(config).validate().await?;
    Ok(())
}

/// Directories every later phase writes into.
pub fn prepare_build_environment(config: &BuildConfig) -> Result<()> {
    for dir in [
        config.build_dir.clone(),
        config.logs_dir(),
        config.dynamic_patches_dir.clone(),
        config.build_dir.join(".cache"),
    ] {
        fs::create_dir_all(&dir)
            .map_err(|e| BuildError::io(format!("creating {}", dir.display()), e))?;
    }
    log::debug!("[Prep] [DIRS] Build workspace ready at {}", config.build_dir.display());
    Ok(())
}

/// Confirm the target tag exists on the configured repository.
pub async fn check_version_exists(config: &BuildConfig) -> Result<()> {
    let url = config.repository_url.clone();
    let tag = config.node_version.clone();
    let found = tokio::task::spawn_blocking(move || remote_has_tag(&url, &tag))
        .await
        .map_err(|e| BuildError::Config(format!("version check task failed: {}", e)))?
        .map_err(|e| BuildError::SourceAcquisition {
            url: config.repository_url.clone(),
            attempts: 1,
            reason: format!("could not list tags: {}", e),
        })?;

    if !found {
        return Err(BuildError::InvalidVersion {
            version: config.node_version.clone(),
            reason: format!("tag not found on {}", config.repository_url),
        });
    }
    log::info!("[Prep] [VERSION] ✓ {} exists upstream", config.node_version);
    Ok(())
}

/// Ask before a destructive action. `--yes` and CI skip the prompt; a
/// non-interactive session without either declines.
pub fn confirm_destructive(config: &BuildConfig, action: &str) -> Result<()> {
    if config.may_skip_confirmation() {
        log::info!("[Prep] [CONFIRM] {} (auto-confirmed)", action);
        return Ok(());
    }
    if !config.interactive {
        return Err(BuildError::Config(format!(
            "refusing to {} without confirmation; re-run with --yes",
            action
        )));
    }

    eprint!("{}? [y/N] ", action);
    let _ = std::io::stderr().flush();
    let mut answer = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut answer)
        .map_err(|e| BuildError::io("reading confirmation", e))?;
    if is_affirmative(&answer) {
        Ok(())
    } else {
        Err(BuildError::Config(format!("declined to {}", action)))
    }
}

fn is_affirmative(answer: &str) -> bool {
    matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")
}

/// How the source tree was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    /// Existing checkout already pristine at the tag
    Reused,
    /// Existing checkout reset to the tag
    Reset,
    /// Fresh clone
    Cloned { attempts: u32 },
}

/// Produce a pristine checkout of the target tag.
pub async fn acquire_source(config: &BuildConfig, policy: &RetryPolicy<'_>) -> Result<SourceState> {
    let source = config.source_dir();
    let tag = config.node_version.clone();

    if GitManager::is_repository(&source) {
        let manager = GitManager::open(&source).map_err(|e| acquisition_error(config, 1, e))?;
        let dirty = manager
            .dirty_paths()
            .map_err(|e| acquisition_error(config, 1, e))?;
        if manager.head_matches(&tag) && dirty.is_empty() {
            log::info!("[Prep] [SOURCE] ✓ Reusing pristine checkout of {}", tag);
            return Ok(SourceState::Reused);
        }

        confirm_destructive(
            config,
            &format!(
                "reset {} to {} ({} modified path(s) will be discarded)",
                source.display(),
                tag,
                dirty.len()
            ),
        )?;
        match manager.reset_pristine(&tag) {
            Ok(_) => return Ok(SourceState::Reset),
            Err(GitError::RefNotFound(_)) => {
                log::info!("[Prep] [SOURCE] {} not in existing checkout, re-cloning", tag);
            }
            Err(e) => return Err(acquisition_error(config, 1, e)),
        }
        remove_dir(&source)?;
    } else if source.exists() {
        confirm_destructive(
            config,
            &format!("delete {} (not a git checkout)", source.display()),
        )?;
        remove_dir(&source)?;
    }

    let attempts = clone_with_retry(config, policy, &source).await?;
    Ok(SourceState::Cloned { attempts })
}

async fn clone_with_retry(config: &BuildConfig, policy: &RetryPolicy<'_>, source: &Path) -> Result<u32> {
    log::info!(target: "parsed", "Cloning {} {}", config.repository_url, config.node_version);
    let outcome = policy
        .run("clone", |attempt| {
            let url = config.repository_url.clone();
            let tag = config.node_version.clone();
            let target: PathBuf = source.to_path_buf();
            async move {
                if attempt > 1 {
                    log::info!("[Prep] [SOURCE] Clone attempt {}", attempt);
                }
                tokio::task::spawn_blocking(move || {
                    GitManager::clone_tag(&url, &tag, &target).map(|_| ())
                })
                .await
                .map_err(|e| format!("clone task failed: {}", e))?
                .map_err(|e| e.to_string())
            }
        })
        .await;

    match outcome {
        Ok(((), attempts)) => Ok(attempts),
        Err(exhausted) => {
            // Never leave a half-cloned tree behind
            discard_partial_clone(source);
            Err(BuildError::SourceAcquisition {
                url: config.repository_url.clone(),
                attempts: exhausted.attempts,
                reason: exhausted.last_error,
            })
        }
    }
}

/// Source acquisition policy with partial-clone cleanup between attempts.
pub fn source_retry_policy(source: PathBuf) -> RetryPolicy<'static> {
    RetryPolicy::source_acquisition().with_cleanup(move |attempt| {
        if source.exists() {
            log::debug!(
                "[Prep] [SOURCE] Removing partial clone after attempt {}",
                attempt
            );
            discard_partial_clone(&source);
        }
    })
}

/// Remove a partial clone, warning when it cannot be removed. Returns whether
/// the path is gone.
fn discard_partial_clone(path: &Path) -> bool {
    match fs::remove_dir_all(path) {
        Ok(()) => true,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
        Err(e) => {
            log::warn!(
                "[Prep] [SOURCE] Could not remove partial clone {}: {}",
                path.display(),
                e
            );
            false
        }
    }
}

fn remove_dir(path: &Path) -> Result<()> {
    fs::remove_dir_all(path).map_err(|e| BuildError::io(format!("removing {}", path.display()), e))
}

fn acquisition_error(config: &BuildConfig, attempts: u32, e: GitError) -> BuildError {
    BuildError::SourceAcquisition {
        url: config.repository_url.clone(),
        attempts,
        reason: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CliArgs, EnvSnapshot};
    use crate::runtime::git::test_support::init_tagged_repo;
    use std::time::Duration;
    use tempfile::TempDir;

    fn config_for(root: &Path, upstream: &Path, yes: bool) -> BuildConfig {
        let args = CliArgs {
            project_root: Some(root.to_path_buf()),
            node_version: Some("v24.10.0".to_string()),
            yes,
            ..CliArgs::default()
        };
        let mut config = BuildConfig::resolve(&args, &EnvSnapshot::default()).unwrap();
        config.repository_url = upstream.to_string_lossy().into_owned();
        config
    }

    fn fast_policy(source: PathBuf) -> RetryPolicy<'static> {
        source_retry_policy(source).with_backoff(|_| Duration::ZERO)
    }

    #[test]
    fn test_discard_partial_clone() {
        let temp = TempDir::new().unwrap();
        let partial = temp.path().join("node");
        fs::create_dir_all(partial.join(".git/objects")).unwrap();
        assert!(discard_partial_clone(&partial));
        assert!(!partial.exists());
        assert!(discard_partial_clone(&partial));

        // A file where the checkout should be cannot be removed as a tree
        fs::write(&partial, "not a checkout").unwrap();
        assert!(!discard_partial_clone(&partial));
        assert!(partial.exists());
    }

    #[test]
    fn test_affirmative_answers() {
        assert!(is_affirmative("y\n"));
        assert!(is_affirmative(" YES "));
        assert!(!is_affirmative("\n"));
        assert!(!is_affirmative("nope"));
    }

    #[test]
    fn test_non_interactive_declines() {
        let temp = TempDir::new().unwrap();
        let config = config_for(temp.path(), temp.path(), false);
        let err = confirm_destructive(&config, "wipe everything").unwrap_err();
        assert!(matches!(err, BuildError::Config(_)));
        assert!(err.to_string().contains("--yes"));

        let config = config_for(temp.path(), temp.path(), true);
        assert!(confirm_destructive(&config, "wipe everything").is_ok());
    }

    #[tokio::test]
    async fn test_clone_then_reuse_then_reset() {
        let upstream = TempDir::new().unwrap();
        init_tagged_repo(upstream.path(), &[("src/node.cc", "int main() {}\n")], "v24.10.0");
        let project = TempDir::new().unwrap();
        let config = config_for(project.path(), upstream.path(), true);
        let policy = fast_policy(config.source_dir());

        let state = acquire_source(&config, &policy).await.unwrap();
        assert_eq!(state, SourceState::Cloned { attempts: 1 });
        assert!(config.source_dir().join("src/node.cc").exists());

        assert_eq!(acquire_source(&config, &policy).await.unwrap(), SourceState::Reused);

        fs::write(config.source_dir().join("src/node.cc"), "patched\n").unwrap();
        fs::write(config.source_dir().join("stray.o"), "obj").unwrap();
        assert_eq!(acquire_source(&config, &policy).await.unwrap(), SourceState::Reset);
        assert_eq!(
            fs::read_to_string(config.source_dir().join("src/node.cc")).unwrap(),
            "int main() {}\n"
        );
        assert!(!config.source_dir().join("stray.o").exists());
    }

    #[tokio::test]
    async fn test_dirty_tree_needs_confirmation() {
        let upstream = TempDir::new().unwrap();
        init_tagged_repo(upstream.path(), &[("README.md", "node\n")], "v24.10.0");
        let project = TempDir::new().unwrap();
        let config = config_for(project.path(), upstream.path(), true);
        let policy = fast_policy(config.source_dir());
        acquire_source(&config, &policy).await.unwrap();
        fs::write(config.source_dir().join("README.md"), "edited\n").unwrap();

        let cautious = config_for(project.path(), upstream.path(), false);
        let err = acquire_source(&cautious, &policy).await.unwrap_err();
        assert!(matches!(err, BuildError::Config(_)));
        assert_eq!(
            fs::read_to_string(config.source_dir().join("README.md")).unwrap(),
            "edited\n"
        );
    }

    #[tokio::test]
    async fn test_clone_failure_exhausts_retries() {
        let project = TempDir::new().unwrap();
        let missing = project.path().join("no-such-upstream");
        let config = config_for(project.path(), &missing, true);
        let policy = fast_policy(config.source_dir());

        match acquire_source(&config, &policy).await.unwrap_err() {
            BuildError::SourceAcquisition { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(!config.source_dir().exists());
    }

    #[tokio::test]
    async fn test_version_check_against_local_upstream() {
        let upstream = TempDir::new().unwrap();
        init_tagged_repo(upstream.path(), &[("README.md", "node\n")], "v24.10.0");
        let project = TempDir::new().unwrap();
        let config = config_for(project.path(), upstream.path(), true);
        check_version_exists(&config).await.unwrap();

        let mut other = config.clone();
        other.node_version = "v99.0.0".to_string();
        let err = check_version_exists(&other).await.unwrap_err();
        assert!(matches!(err, BuildError::InvalidVersion { .. }));
    }
}
