//! Orchestrator phases: modularized build pipeline stages.
//!
//! - **Preparation** (`prep`) - preflight checks, version check, source acquisition
//!
//! Patching, compilation and post-processing live in `runtime`,
//! `orchestrator::executor` and `postprocess`; the orchestrator composes them.

pub mod prep;

pub use prep::{
    acquire_source, check_version_exists, confirm_destructive, prepare_build_environment,
    run_preflight, source_retry_policy, SourceState,
};
