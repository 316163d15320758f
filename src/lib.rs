//! smol builder
//!
//! Builds a patched, stripped and compressed Node.js runtime from upstream
//! source and installs it where the packaging tools and end-to-end tests
//! expect it. A build runs as a fixed sequence of phases with checkpoints
//! after the expensive ones, so an interrupted or failed run resumes instead
//! of starting over.
//!
//! The system is organized into functional modules:
//! - **error**: Unified error type with remediation steps
//! - **models**: Platforms, architectures, profiles and stage directories
//! - **config**: Command line flags, settings file and environment
//! - **log_collector**: Decoupled console/disk logging
//! - **system**: Host tool checks, environment health, smoke tests
//! - **runtime**: Source checkout, patch metadata, validation and application
//! - **orchestrator**: Phase state machine, checkpoints, content cache
//! - **postprocess**: Strip, sign, compress and the compiled-binary cache
//! - **distribution**: Installing the final artifact

// Core foundational modules
pub mod error;
pub mod models;

pub mod config;

// Robust, decoupled logging system
pub mod log_collector;

// Host tools, health checks and binary verification
pub mod system;

// Upstream source handling and patches
pub mod runtime;

// Build orchestration and state management
pub mod orchestrator;

pub mod postprocess;
pub mod distribution;

// Re-export the log crate for macro usage
pub use log;

// Re-export log collector for use throughout the system
pub use log_collector::{LogCollector, LogLine};

// ============================================================================
// PUBLIC RE-EXPORTS FOR CONVENIENCE
// ============================================================================

pub use config::{BuildConfig, CliArgs};
pub use error::{BuildError, ConfigError, Result};
pub use models::{Arch, BuildOutcome, BuildProfile, Platform, Stage};
pub use orchestrator::{BuildPhase, OrchestrationState, Orchestrator};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_constant() {
        assert_eq!(VERSION, "0.1.0");
    }

    #[test]
    fn test_error_reexport() {
        // Verify error types are accessible via crate root
        let _: Result<i32> = Ok(42);
    }

    #[test]
    fn test_phase_reexport() {
        assert_eq!(BuildPhase::Preflight, BuildPhase::Preflight);
        assert_ne!(BuildPhase::Complete, BuildPhase::Failed);
    }
}
