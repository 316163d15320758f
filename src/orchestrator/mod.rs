//! Build Orchestration: preflight → cache check → source → patches → compile →
//! post-process → install, with checkpoints between the expensive parts.
//!
//! - `state`: phase enum and transition rules
//! - `checkpoint`: `cloned` / `built` / `complete` tokens on disk
//! - `cache`: content hash of every build input
//! - `retry`: retry policy for source acquisition
//! - `lock`: one orchestrator per build directory
//! - `executor`: configure and compile with persisted logs
//! - `phases`: preflight and source acquisition

pub mod cache;
pub mod checkpoint;
pub mod executor;
pub mod lock;
pub mod phases;
pub mod retry;
pub mod state;

use std::fs;
use std::sync::Arc;
use tokio::sync::RwLock;

pub use checkpoint::{BuildStateStore, Checkpoint};
pub use retry::RetryPolicy;
pub use state::{BuildPhase, OrchestrationState};

use crate::config::BuildConfig;
use crate::distribution::{install_all, verify_installation};
use crate::error::{BuildError, Result};
use crate::models::BuildOutcome;
use crate::postprocess::binary_cache::CompiledBinaryCache;
use crate::postprocess::{compress_stage, strip_stage};
use crate::runtime::conflicts::{check_patch_conflicts, ConflictSeverity};
use crate::runtime::patcher::{discover_patches, RuntimePatcher};
use crate::runtime::validator::validate_all;
use crate::runtime::version::Version;
use crate::system::verification::{run_test_suite, smoke_test, TestSuite};

/// Drives one build from preflight to completion.
pub struct Orchestrator {
    config: BuildConfig,

    /// Shared so callers can observe progress while `run` is pending
    state: Arc<RwLock<OrchestrationState>>,

    store: BuildStateStore,

    retry: RetryPolicy<'static>,
}

impl Orchestrator {
    pub fn new(config: BuildConfig) -> Self {
        let store = BuildStateStore::new(config.checkpoint_path());
        let retry = phases::source_retry_policy(config.source_dir());
        Orchestrator {
            config,
            state: Arc::new(RwLock::new(OrchestrationState::new())),
            store,
            retry,
        }
    }

    /// Replace the source acquisition retry policy.
    pub fn with_retry_policy(mut self, retry: RetryPolicy<'static>) -> Self {
        self.retry = retry;
        self
    }

    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    /// Get the current build phase.
    pub async fn current_phase(&self) -> BuildPhase {
        self.state.read().await.phase
    }

    /// Snapshot of the run state.
    pub async fn state(&self) -> OrchestrationState {
        self.state.read().await.clone()
    }

    async fn enter(&self, phase: BuildPhase) -> Result<()> {
        let mut state = self.state.write().await;
        state
            .transition_to(phase)
            .map_err(|e| BuildError::Config(format!("internal phase error: {}", e)))?;
        if let Some(idx) = BuildPhase::ORDER.iter().position(|p| *p == phase) {
            log::info!(
                target: "parsed",
                "[{}/{}] {}",
                idx + 1,
                BuildPhase::ORDER.len(),
                phase
            );
        }
        Ok(())
    }

    /// Run the build. On failure the state records the error and the last
    /// checkpoint stays on disk.
    pub async fn run(&self) -> Result<BuildOutcome> {
        match self.run_phases().await {
            Ok(outcome) => {
                let elapsed = self
                    .state
                    .read()
                    .await
                    .elapsed_since_start()
                    .map(|d| d.as_secs())
                    .unwrap_or(0);
                log::info!(target: "parsed", "Build finished in {}s: {:?}", elapsed, outcome);
                Ok(outcome)
            }
            Err(e) => {
                let phase = self.current_phase().await;
                log::error!("[Orchestrator] [FAILED] {} during {}", e, phase);
                self.state.write().await.record_error(e.to_string());
                Err(e)
            }
        }
    }

    async fn run_phases(&self) -> Result<BuildOutcome> {
        let config = &self.config;
        let _lock = lock::BuildLock::acquire(&config.lock_path())?;
        phases::prepare_build_environment(config)?;

        if config.clean {
            self.clean()?;
        }

        // Tool and health checks only run once a rebuild is needed
        self.enter(BuildPhase::CacheCheck).await?;
        let content_hash = cache::compute_content_hash(config)?;
        let status = cache::check_cache(&config.hash_path(), &content_hash, &config.declared_outputs());
        if status.is_valid() {
            log::info!("[Orchestrator] [CACHE] ✓ Outputs current (hash {})", &content_hash[..12]);
            self.enter(BuildPhase::Complete).await?;
            return Ok(BuildOutcome::Cached);
        }
        log::info!("[Orchestrator] [CACHE] Rebuild needed: {:?}", status);

        if config.skip_checks {
            log::warn!("[Orchestrator] [PREFLIGHT] Skipped (--skip-checks)");
        } else {
            phases::run_preflight(config).await?;
        }

        self.enter(BuildPhase::VersionCheck).await?;
        let compiled_cache =
            CompiledBinaryCache::new(config.compiled_cache_dir(), config.platform.binary_name());

        let resumed = if self.can_resume(&compiled_cache, &content_hash)? {
            log::info!(target: "parsed", "Resuming from checkpoint 'built'");
            true
        } else {
            phases::check_version_exists(config).await?;
            self.enter(BuildPhase::AcquireSource).await?;
            if self.restore_compiled(&compiled_cache, &content_hash).await? {
                true
            } else {
                self.build_from_source(&compiled_cache, &content_hash).await?;
                false
            }
        };

        self.enter(BuildPhase::Strip).await?;
        let stripped = strip_stage(config).await?;
        self.run_requested_tests(&stripped.path).await?;

        self.enter(BuildPhase::Compress).await?;
        let final_artifact = compress_stage(config, &stripped).await?;

        self.enter(BuildPhase::Install).await?;
        install_all(config, &final_artifact.path).await?;

        self.enter(BuildPhase::VerifyCacheInstall).await?;
        verify_installation(config, &final_artifact.path, config.verify)?;

        self.enter(BuildPhase::CheckpointComplete).await?;
        cache::write_hash(&config.hash_path(), &content_hash)?;
        self.store.set(Checkpoint::Complete)?;
        self.store.clear()?;

        self.enter(BuildPhase::Complete).await?;
        Ok(BuildOutcome::Built {
            resumed,
            compressed: final_artifact.compression.is_some(),
            final_size: final_artifact.size,
        })
    }

    /// Checkpoint `built` with the compiler output still present, and no
    /// compiled-cache record saying it came from different inputs.
    fn can_resume(&self, compiled_cache: &CompiledBinaryCache, content_hash: &str) -> Result<bool> {
        if !self.store.reached(Checkpoint::Built)? {
            return Ok(false);
        }
        if !self.config.compiler_output().is_file() {
            log::warn!("[Orchestrator] [RESUME] Checkpoint says built but compiler output is gone");
            return Ok(false);
        }
        if let Some(metadata) = compiled_cache.read_metadata() {
            if metadata.content_hash != content_hash {
                log::info!("[Orchestrator] [RESUME] Inputs changed since the last compile, rebuilding");
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn restore_compiled(&self, compiled_cache: &CompiledBinaryCache, content_hash: &str) -> Result<bool> {
        let output = self.config.compiler_output();
        if !compiled_cache.restore(content_hash, &output)? {
            return Ok(false);
        }
        match smoke_test(&output, &self.config.node_version, "cache-restore").await {
            Ok(_) => {
                self.store.set(Checkpoint::Built)?;
                Ok(true)
            }
            Err(e) => {
                log::warn!("[Orchestrator] [CACHE] Cached binary unusable ({}), rebuilding", e);
                compiled_cache.clear()?;
                Ok(false)
            }
        }
    }

    async fn build_from_source(&self, compiled_cache: &CompiledBinaryCache, content_hash: &str) -> Result<()> {
        let config = &self.config;

        let source_state = phases::acquire_source(config, &self.retry).await?;
        if let phases::SourceState::Cloned { attempts } = source_state {
            self.state.write().await.acquisition_attempts = attempts;
        }
        self.store.set(Checkpoint::Cloned)?;

        self.enter(BuildPhase::ValidatePatches).await?;
        let target = Version::parse(&config.node_version).map_err(|reason| BuildError::InvalidVersion {
            version: config.node_version.clone(),
            reason,
        })?;
        let paths = discover_patches(&config.patch_dirs())?;
        log::info!("[Orchestrator] [PATCHES] {} patch(es) discovered", paths.len());
        let patches = validate_all(&paths, &target)?;

        let mut blocking = Vec::new();
        for conflict in check_patch_conflicts(&patches, &target) {
            match conflict.severity {
                ConflictSeverity::Error => {
                    log::error!("[Patch] [CONFLICT] {}", conflict);
                    blocking.push(conflict);
                }
                ConflictSeverity::Warning => log::warn!("[Patch] [CONFLICT] {}", conflict),
            }
        }
        if !blocking.is_empty() {
            return Err(BuildError::PatchConflict { conflicts: blocking });
        }

        let patcher = RuntimePatcher::new(config.source_dir(), config.tools.patch.clone());
        patcher.dry_run_all(&patches).await?;

        self.enter(BuildPhase::ApplyPatches).await?;
        let applied = patcher.apply_all(&patches).await?;
        let additions = patcher.copy_additions(&config.additions_dir)?;
        {
            let mut state = self.state.write().await;
            state.patches_applied = applied;
            state.additions_copied = additions.len() as u32;
        }

        self.enter(BuildPhase::VerifyModifications).await?;
        patcher.verify_modifications(&patches, &config.additions_dir, &additions)?;

        self.enter(BuildPhase::Configure).await?;
        executor::run_configure(config).await?;

        self.enter(BuildPhase::Compile).await?;
        let output = executor::run_compile(config).await?;

        self.enter(BuildPhase::SmokeTest).await?;
        smoke_test(&output, &config.node_version, "compile").await?;
        if let Err(e) = compiled_cache.store(&output, content_hash) {
            log::warn!("[Orchestrator] [CACHE] Could not cache compiled binary: {}", e);
        }
        self.store.set(Checkpoint::Built)?;
        Ok(())
    }

    async fn run_requested_tests(&self, binary: &std::path::Path) -> Result<()> {
        let suite = if self.config.run_full_tests {
            TestSuite::Full
        } else if self.config.run_tests {
            TestSuite::Quick
        } else {
            return Ok(());
        };
        run_test_suite(
            &self.config.tools.python,
            &self.config.source_dir(),
            binary,
            self.config.jobs,
            suite,
        )
        .await
    }

    /// `--clean`: drop source, stage outputs, checkpoint, hash and the
    /// compiled-binary cache. Logs are kept.
    fn clean(&self) -> Result<()> {
        let config = &self.config;
        log::info!(target: "parsed", "Cleaning build directory");
        for dir in [
            config.source_dir(),
            config.build_dir.join("out"),
            config.compiled_cache_dir(),
        ] {
            match fs::remove_dir_all(&dir) {
                Ok(()) => log::debug!("[Orchestrator] [CLEAN] Removed {}", dir.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(BuildError::io(format!("removing {}", dir.display()), e)),
            }
        }
        self.store.clear()?;
        match fs::remove_file(config.hash_path()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BuildError::io(format!("removing {}", config.hash_path().display()), e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CliArgs, EnvSnapshot};
    use tempfile::TempDir;

    fn config_in(root: &std::path::Path) -> BuildConfig {
        let args = CliArgs {
            project_root: Some(root.to_path_buf()),
            skip_checks: true,
            yes: true,
            ..CliArgs::default()
        };
        BuildConfig::resolve(&args, &EnvSnapshot::default()).unwrap()
    }

    #[tokio::test]
    async fn test_new_orchestrator_starts_in_preflight() {
        let temp = TempDir::new().unwrap();
        let orch = Orchestrator::new(config_in(temp.path()));
        assert_eq!(orch.current_phase().await, BuildPhase::Preflight);
        assert_eq!(orch.state().await.progress(), 0);
    }

    #[tokio::test]
    async fn test_failure_is_recorded_and_lock_released() {
        let temp = TempDir::new().unwrap();
        let mut config = config_in(temp.path());
        config.repository_url = temp.path().join("missing-upstream").to_string_lossy().into_owned();
        let orch = Orchestrator::new(config.clone());

        let err = orch.run().await.unwrap_err();
        assert!(matches!(err, BuildError::SourceAcquisition { .. }));
        let state = orch.state().await;
        assert_eq!(state.phase, BuildPhase::Failed);
        assert!(state.visited(BuildPhase::VersionCheck));
        assert!(!config.lock_path().exists());
    }

    #[test]
    fn test_clean_removes_build_state() {
        let temp = TempDir::new().unwrap();
        let config = config_in(temp.path());
        fs::create_dir_all(config.source_dir().join("src")).unwrap();
        fs::create_dir_all(config.stage_dir(crate::models::Stage::Final)).unwrap();
        fs::create_dir_all(config.logs_dir()).unwrap();
        cache::write_hash(&config.hash_path(), &"a".repeat(64)).unwrap();
        let orch = Orchestrator::new(config.clone());
        orch.store.set(Checkpoint::Built).unwrap();

        orch.clean().unwrap();
        assert!(!config.source_dir().exists());
        assert!(!config.build_dir.join("out").exists());
        assert!(!config.hash_path().exists());
        assert!(!config.checkpoint_path().exists());
        assert!(config.logs_dir().exists());
    }
}
