//! Build State Management and Phase Tracking
//!
//! - `BuildPhase`: discrete phases of one orchestrator run, in fixed order
//! - `OrchestrationState`: current phase, counters and timing for the run
//!
//! Forward skips are only legal along the documented shortcuts; every other
//! transition moves exactly one phase ahead or into `Failed`.

use serde::{Deserialize, Serialize};
use std::time::SystemTime;

/// Build phase enumeration - discrete states in the build lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BuildPhase {
    Preflight,
    CacheCheck,
    VersionCheck,
    AcquireSource,
    ValidatePatches,
    ApplyPatches,
    VerifyModifications,
    Configure,
    Compile,
    SmokeTest,
    Strip,
    Compress,
    Install,
    VerifyCacheInstall,
    CheckpointComplete,

    /// Build completed successfully (or was already up to date)
    Complete,

    /// Build failed; the last checkpoint stays on disk
    Failed,
}

impl BuildPhase {
    /// Non-terminal phases in execution order.
    pub const ORDER: [BuildPhase; 15] = [
        BuildPhase::Preflight,
        BuildPhase::CacheCheck,
        BuildPhase::VersionCheck,
        BuildPhase::AcquireSource,
        BuildPhase::ValidatePatches,
        BuildPhase::ApplyPatches,
        BuildPhase::VerifyModifications,
        BuildPhase::Configure,
        BuildPhase::Compile,
        BuildPhase::SmokeTest,
        BuildPhase::Strip,
        BuildPhase::Compress,
        BuildPhase::Install,
        BuildPhase::VerifyCacheInstall,
        BuildPhase::CheckpointComplete,
    ];

    /// Get the human-readable name for this phase.
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildPhase::Preflight => "preflight",
            BuildPhase::CacheCheck => "cache-check",
            BuildPhase::VersionCheck => "version-check",
            BuildPhase::AcquireSource => "acquire-source",
            BuildPhase::ValidatePatches => "validate-patches",
            BuildPhase::ApplyPatches => "apply-patches",
            BuildPhase::VerifyModifications => "verify-modifications",
            BuildPhase::Configure => "configure",
            BuildPhase::Compile => "compile",
            BuildPhase::SmokeTest => "smoke-test",
            BuildPhase::Strip => "strip",
            BuildPhase::Compress => "compress",
            BuildPhase::Install => "install",
            BuildPhase::VerifyCacheInstall => "verify-cache-install",
            BuildPhase::CheckpointComplete => "checkpoint-complete",
            BuildPhase::Complete => "complete",
            BuildPhase::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BuildPhase::Complete | BuildPhase::Failed)
    }

    /// Get all valid phase transitions FROM this phase.
    pub fn valid_next_phases(&self) -> Vec<BuildPhase> {
        let mut next = match self {
            BuildPhase::Complete => return vec![],
            // Allow a fresh run after a failure
            BuildPhase::Failed => return vec![BuildPhase::Preflight],
            BuildPhase::CheckpointComplete => vec![BuildPhase::Complete],
            phase => {
                let idx = Self::ORDER.iter().position(|p| p == phase).unwrap_or(0);
                vec![Self::ORDER[idx + 1]]
            }
        };
        match self {
            // Cache hit
            BuildPhase::CacheCheck => next.push(BuildPhase::Complete),
            // Resume from `built` or compiled-binary cache hit
            BuildPhase::VersionCheck | BuildPhase::AcquireSource => next.push(BuildPhase::Strip),
            _ => {}
        }
        next.push(BuildPhase::Failed);
        next
    }

    /// Check if a transition to the given phase is valid.
    pub fn can_transition_to(&self, next: BuildPhase) -> bool {
        self.valid_next_phases().contains(&next)
    }
}

impl std::fmt::Display for BuildPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Build execution state for one orchestrator run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationState {
    /// Current build phase
    pub phase: BuildPhase,

    /// Phases entered so far, in order
    pub history: Vec<BuildPhase>,

    /// Number of patches applied
    pub patches_applied: u32,

    /// Auxiliary files copied into the source tree
    pub additions_copied: u32,

    /// Source acquisition attempts used
    pub acquisition_attempts: u32,

    /// Build start timestamp
    pub start_time: SystemTime,

    /// Last phase update timestamp
    pub last_update_time: SystemTime,

    /// Error message if phase failed
    pub error: Option<String>,
}

impl Default for OrchestrationState {
    fn default() -> Self {
        Self::new()
    }
}

impl OrchestrationState {
    pub fn new() -> Self {
        let now = SystemTime::now();
        OrchestrationState {
            phase: BuildPhase::Preflight,
            history: vec![BuildPhase::Preflight],
            patches_applied: 0,
            additions_copied: 0,
            acquisition_attempts: 0,
            start_time: now,
            last_update_time: now,
            error: None,
        }
    }

    /// Attempt to transition to the next phase.
    pub fn transition_to(&mut self, next_phase: BuildPhase) -> Result<(), String> {
        if !self.phase.can_transition_to(next_phase) {
            return Err(format!(
                "Invalid phase transition: {} -> {}",
                self.phase.as_str(),
                next_phase.as_str()
            ));
        }
        log::debug!("[Orchestrator] [PHASE] {} -> {}", self.phase, next_phase);
        self.phase = next_phase;
        self.history.push(next_phase);
        self.last_update_time = SystemTime::now();
        Ok(())
    }

    /// Overall progress through the fixed phase order (0-100).
    pub fn progress(&self) -> u32 {
        match self.phase {
            BuildPhase::Complete => 100,
            BuildPhase::Failed => 0,
            phase => {
                let idx = BuildPhase::ORDER.iter().position(|p| *p == phase).unwrap_or(0);
                (idx as u32 * 100) / BuildPhase::ORDER.len() as u32
            }
        }
    }

    /// Whether `phase` was entered during this run.
    pub fn visited(&self, phase: BuildPhase) -> bool {
        self.history.contains(&phase)
    }

    /// Record an error and mark phase as failed.
    pub fn record_error(&mut self, error: String) {
        self.error = Some(error);
        self.phase = BuildPhase::Failed;
        self.history.push(BuildPhase::Failed);
        self.last_update_time = SystemTime::now();
    }

    /// Get time elapsed since build start.
    pub fn elapsed_since_start(&self) -> Result<std::time::Duration, std::time::SystemTimeError> {
        self.start_time.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_transitions() {
        assert!(BuildPhase::Preflight.can_transition_to(BuildPhase::CacheCheck));
        assert!(BuildPhase::Compile.can_transition_to(BuildPhase::SmokeTest));
        assert!(BuildPhase::Compile.can_transition_to(BuildPhase::Failed));
        assert!(!BuildPhase::Compile.can_transition_to(BuildPhase::Install));
        assert!(!BuildPhase::Preflight.can_transition_to(BuildPhase::Compile));
        assert!(BuildPhase::Complete.valid_next_phases().is_empty());
        assert!(BuildPhase::Failed.can_transition_to(BuildPhase::Preflight));
    }

    #[test]
    fn test_documented_shortcuts() {
        assert!(BuildPhase::CacheCheck.can_transition_to(BuildPhase::Complete));
        assert!(BuildPhase::VersionCheck.can_transition_to(BuildPhase::Strip));
        assert!(BuildPhase::AcquireSource.can_transition_to(BuildPhase::Strip));
        assert!(!BuildPhase::Strip.can_transition_to(BuildPhase::Install));
        assert!(BuildPhase::Strip.can_transition_to(BuildPhase::Compress));
        assert!(!BuildPhase::ValidatePatches.can_transition_to(BuildPhase::Strip));
        assert!(!BuildPhase::Preflight.can_transition_to(BuildPhase::Complete));
    }

    #[test]
    fn test_every_phase_reaches_complete() {
        let mut state = OrchestrationState::new();
        for phase in BuildPhase::ORDER.iter().skip(1) {
            state.transition_to(*phase).unwrap();
        }
        state.transition_to(BuildPhase::Complete).unwrap();
        assert_eq!(state.progress(), 100);
        assert_eq!(state.history.len(), BuildPhase::ORDER.len() + 1);
    }

    #[test]
    fn test_invalid_phase_transition() {
        let mut state = OrchestrationState::new();
        let err = state.transition_to(BuildPhase::Strip).unwrap_err();
        assert!(err.contains("preflight -> strip"));
        assert_eq!(state.phase, BuildPhase::Preflight);
    }

    #[test]
    fn test_record_error() {
        let mut state = OrchestrationState::new();
        state.transition_to(BuildPhase::CacheCheck).unwrap();
        state.record_error("boom".to_string());
        assert_eq!(state.phase, BuildPhase::Failed);
        assert_eq!(state.error.as_deref(), Some("boom"));
        assert!(state.visited(BuildPhase::CacheCheck));
    }
}
