//! Runtime source handling: acquisition, patch validation and patching.
//!
//! - `version`: release tags and `@node-versions` specifiers
//! - `metadata`: patch header directives
//! - `validator`: integrity and version checks
//! - `conflicts`: static diff analysis and pairwise conflict rules
//! - `patcher`: discovery, dry-run, application, verification
//! - `git`: native source acquisition (`git2`)

pub mod conflicts;
pub mod git;
pub mod metadata;
pub mod patcher;
pub mod validator;
pub mod version;

pub use conflicts::{check_patch_conflicts, ConflictSeverity, PatchAnalysis, PatchConflict};
pub use metadata::PatchMetadata;
pub use patcher::{discover_patches, RuntimePatcher};
pub use validator::{validate_all, validate_patch, validate_patch_file, ValidatedPatch};
pub use version::{Version, VersionSpec};
