//! Unified error type hierarchy for smol builds
//!
//! Every failure category the pipeline can hit is a `BuildError` variant. Each
//! variant knows how to explain itself: what failed, why, and which commands to
//! run next. A failed build costs tens of minutes to reproduce, so the message
//! alone has to be enough to act on.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::runtime::conflicts::PatchConflict;

/// Top-level error for every orchestrator phase.
#[derive(Error, Debug)]
pub enum BuildError {
    /// A required external tool is not on PATH (and auto-install did not help)
    #[error("Required tool '{tool}' not found: {purpose}")]
    MissingTool {
        tool: String,
        purpose: String,
        install_hint: Option<String>,
    },

    /// Disk, compiler, interpreter or network precondition failed
    #[error("Environment not ready ({check}): {reason}")]
    EnvironmentUnready { check: String, reason: String },

    /// The target runtime version does not exist upstream
    #[error("Invalid runtime version '{version}': {reason}")]
    InvalidVersion { version: String, reason: String },

    /// Patch integrity or version-compatibility failure
    #[error("Patch '{patch}' failed validation: {reason}")]
    PatchValidation { patch: String, reason: String },

    /// One or more error-severity conflicts between patches
    #[error("{} blocking patch conflict(s) detected", .conflicts.len())]
    PatchConflict { conflicts: Vec<PatchConflict> },

    /// Dry-run passed (or was skipped) but the real application failed
    #[error("Patch '{patch}' could not be applied: {reason}")]
    PatchApplication { patch: String, reason: String },

    /// Source tree could not be fetched after all retries
    #[error("Source acquisition from {url} failed after {attempts} attempt(s): {reason}")]
    SourceAcquisition {
        url: String,
        attempts: u32,
        reason: String,
    },

    /// Build generator exited non-zero
    #[error("Compilation failed: {reason}")]
    Compilation {
        reason: String,
        log_path: Option<PathBuf>,
        log_tail: Vec<String>,
    },

    /// Smoke test failed after a destructive step
    #[error("Binary corrupted after {step}: {reason}")]
    BinaryCorruption {
        step: String,
        binary: PathBuf,
        reason: String,
    },

    /// Copy to a consumption point failed or failed its smoke test
    #[error("Install to {target} failed: {reason}")]
    CacheInstall { target: PathBuf, reason: String },

    /// Another orchestrator run owns the build directory
    #[error("Build directory is locked by process {pid} ({lock_path})")]
    BuildLocked { lock_path: PathBuf, pid: u32 },

    /// Invalid flags, settings file or declined confirmation
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error while {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl BuildError {
    /// Wrap an I/O error with what the orchestrator was doing at the time.
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        BuildError::Io {
            context: context.into(),
            source,
        }
    }

    /// Short category name, used as the log prefix and in reports.
    pub fn category(&self) -> &'static str {
        match self {
            BuildError::MissingTool { .. } => "MissingToolError",
            BuildError::EnvironmentUnready { .. } => "EnvironmentUnready",
            BuildError::InvalidVersion { .. } => "InvalidVersionError",
            BuildError::PatchValidation { .. } => "PatchValidationError",
            BuildError::PatchConflict { .. } => "PatchConflictError",
            BuildError::PatchApplication { .. } => "PatchApplicationError",
            BuildError::SourceAcquisition { .. } => "SourceAcquisitionError",
            BuildError::Compilation { .. } => "CompilationError",
            BuildError::BinaryCorruption { .. } => "BinaryCorruptionError",
            BuildError::CacheInstall { .. } => "CacheInstallError",
            BuildError::BuildLocked { .. } => "BuildLockedError",
            BuildError::Config(_) => "ConfigError",
            BuildError::Io { .. } => "IoError",
        }
    }

    /// Concrete next commands for the operator.
    pub fn remediation(&self) -> Vec<String> {
        match self {
            BuildError::MissingTool {
                tool, install_hint, ..
            } => {
                let mut steps = Vec::new();
                if let Some(hint) = install_hint {
                    steps.push(hint.clone());
                }
                steps.push(format!("command -v {}   # confirm it is on PATH", tool));
                steps
            }
            BuildError::EnvironmentUnready { check, .. } => match check.as_str() {
                "disk" => vec![
                    "df -h .".to_string(),
                    "smol-builder --clean   # drops cached sources and stage copies".to_string(),
                ],
                "python" => vec![
                    "python3 --version".to_string(),
                    "Install Python 3.9 or newer and make sure `python3` resolves to it".to_string(),
                ],
                "compiler" => vec![
                    "cc --version".to_string(),
                    "Install clang or gcc (e.g. `xcode-select --install` or `sudo apt-get install build-essential`)".to_string(),
                ],
                "network" => vec![
                    "curl -I https://github.com".to_string(),
                    "Check proxy settings (HTTPS_PROXY) and retry".to_string(),
                ],
                _ => vec!["smol-builder --verbose   # re-run with full logging".to_string()],
            },
            BuildError::InvalidVersion { version, .. } => vec![
                format!(
                    "git ls-remote --tags https://github.com/nodejs/node.git | grep {}",
                    version
                ),
                "smol-builder --node-version <existing tag>".to_string(),
            ],
            BuildError::PatchValidation { patch, .. } => vec![
                format!("head -n 20 {}   # inspect metadata header and diff markers", patch),
                "Regenerate the patch with `git diff > <name>.patch` from a clean tree".to_string(),
            ],
            BuildError::PatchConflict { conflicts } => {
                let mut steps: Vec<String> = conflicts
                    .iter()
                    .map(|c| match &c.patch_b {
                        Some(other) => format!("Remove either '{}' or '{}'", c.patch_a, other),
                        None => format!("Remove or update '{}'", c.patch_a),
                    })
                    .collect();
                steps.push("Adjust @conflicts / @requires / @node-versions headers".to_string());
                steps
            }
            BuildError::PatchApplication { patch, .. } => vec![
                format!(
                    "cd build/node-source && patch -p1 --dry-run --batch --forward -i {}",
                    patch
                ),
                "The source tree drifted from what the patch expects; regenerate it for this version".to_string(),
                "smol-builder --clean --yes".to_string(),
            ],
            BuildError::SourceAcquisition { url, .. } => vec![
                format!("git ls-remote {}", url),
                "rm -rf build/node-source && smol-builder".to_string(),
            ],
            BuildError::Compilation { log_path, .. } => {
                let mut steps = Vec::new();
                if let Some(path) = log_path {
                    steps.push(format!("less {}", path.display()));
                }
                steps.push("smol-builder --clean --yes   # rebuild from a pristine tree".to_string());
                steps
            }
            BuildError::BinaryCorruption { binary, step, .. } => vec![
                format!("{} --version", binary.display()),
                format!(
                    "Compare against build/out/Release; the {} step produced a broken binary",
                    step
                ),
                "SMOL_COMPRESS=0 smol-builder   # rule out compression".to_string(),
            ],
            BuildError::CacheInstall { target, .. } => vec![
                format!("ls -la {}", target.display()),
                "df -h   # copies truncate silently on full disks".to_string(),
                "smol-builder   # re-run; completed stages are reused".to_string(),
            ],
            BuildError::BuildLocked { lock_path, pid } => vec![
                format!("ps -p {}", pid),
                format!("rm {}   # only if that process is gone", lock_path.display()),
            ],
            BuildError::Config(_) => vec!["smol-builder --help".to_string()],
            BuildError::Io { .. } => vec!["Check permissions and free space under build/".to_string()],
        }
    }

    /// Multi-line report: category, what failed, why, and next steps.
    pub fn report(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("✗ {}\n", self.category()));
        out.push_str(&format!("  What: {}\n", self));

        match self {
            BuildError::PatchConflict { conflicts } => {
                out.push_str("  Why:\n");
                for conflict in conflicts {
                    out.push_str(&format!("    - {}\n", conflict));
                }
            }
            BuildError::Compilation {
                log_tail, log_path, ..
            } => {
                if let Some(path) = log_path {
                    out.push_str(&format!("  Log: {}\n", path.display()));
                }
                if !log_tail.is_empty() {
                    out.push_str(&format!("  Last {} lines:\n", log_tail.len()));
                    for line in log_tail {
                        out.push_str(&format!("    | {}\n", line));
                    }
                }
            }
            BuildError::Io { source, .. } => {
                out.push_str(&format!("  Why: {}\n", source));
            }
            _ => {}
        }

        out.push_str("  Next:\n");
        for step in self.remediation() {
            out.push_str(&format!("    $ {}\n", step));
        }
        out
    }
}

/// Settings-file errors, folded into `BuildError::Config` at the orchestrator edge.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Settings file not found: {0}")]
    FileNotFound(String),

    #[error("Invalid JSON in settings file: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("Settings validation failed: {0}")]
    ValidationFailed(String),

    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl From<ConfigError> for BuildError {
    fn from(e: ConfigError) -> Self {
        BuildError::Config(e.to_string())
    }
}

/// Top-level result type for orchestrator operations.
pub type Result<T> = std::result::Result<T, BuildError>;
