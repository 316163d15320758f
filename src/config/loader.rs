//! Settings file loader.
//!
//! The settings file is optional JSON. Every field has a default, so an empty
//! object (or no file at all) yields a working configuration.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_SETTINGS_FILE: &str = "smol-build.json";
pub const DEFAULT_REPOSITORY_URL: &str = "https://github.com/nodejs/node.git";
pub const DEFAULT_NODE_VERSION: &str = "v24.10.0";

/// External commands the orchestrator shells out to.
///
/// `configure` and `build` are argv lists; `{jobs}` in `build` is replaced with
/// the parallel job count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolCommands {
    pub patch: String,
    pub strip: String,
    pub codesign: String,
    pub cc: String,
    pub python: String,
    pub configure: Vec<String>,
    pub build: Vec<String>,
}

impl Default for ToolCommands {
    fn default() -> Self {
        ToolCommands {
            patch: "patch".to_string(),
            strip: "strip".to_string(),
            codesign: "codesign".to_string(),
            cc: std::env::var("CC").unwrap_or_else(|_| "cc".to_string()),
            python: "python3".to_string(),
            configure: vec!["python3".to_string(), "configure".to_string()],
            build: vec!["make".to_string(), "-j{jobs}".to_string()],
        }
    }
}

/// Contents of `smol-build.json`. Relative paths resolve against the project root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub repository_url: String,
    pub node_version: String,
    pub build_dir: PathBuf,
    pub patches_dir: PathBuf,
    pub additions_dir: PathBuf,
    /// Package-manager build cache root
    pub pkg_cache_dir: Option<PathBuf>,
    /// End-to-end test fixture directory
    pub e2e_fixture_dir: PathBuf,
    pub network_probe_url: String,
    pub min_free_disk_gb: u64,
    /// Decompression stub; defaults to `smol-stub` next to the running binary
    pub stub_path: Option<PathBuf>,
    /// Let the tool checker run the package manager for missing tools
    pub auto_install_tools: bool,
    /// Extra `configure` flags appended after the built-in size flags
    pub extra_configure_flags: Vec<String>,
    pub tools: ToolCommands,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            repository_url: DEFAULT_REPOSITORY_URL.to_string(),
            node_version: DEFAULT_NODE_VERSION.to_string(),
            build_dir: PathBuf::from("build"),
            patches_dir: PathBuf::from("patches"),
            additions_dir: PathBuf::from("additions"),
            pkg_cache_dir: None,
            e2e_fixture_dir: PathBuf::from("test/fixtures/smol"),
            network_probe_url: "https://github.com".to_string(),
            min_free_disk_gb: 5,
            stub_path: None,
            auto_install_tools: false,
            extra_configure_flags: Vec::new(),
            tools: ToolCommands::default(),
        }
    }
}

/// Load settings from `path`. A missing file is an error here; callers decide
/// whether the file was required.
pub fn load_settings_from_file(path: &Path) -> Result<Settings, ConfigError> {
    validate_settings_path(path)?;

    let content = fs::read_to_string(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ConfigError::FileNotFound(path.display().to_string())
        } else {
            ConfigError::IoError(e)
        }
    })?;

    let settings: Settings = serde_json::from_str(&content)?;
    validate_settings(&settings)?;
    Ok(settings)
}

/// Settings file path must carry a `.json` extension.
pub fn validate_settings_path(path: &Path) -> Result<(), ConfigError> {
    if path.as_os_str().is_empty() {
        return Err(ConfigError::ValidationFailed(
            "Settings path cannot be empty".to_string(),
        ));
    }
    match path.extension() {
        Some(ext) if ext == "json" => Ok(()),
        Some(ext) => Err(ConfigError::ValidationFailed(format!(
            "Settings file must have .json extension, got .{}",
            ext.to_string_lossy()
        ))),
        None => Err(ConfigError::ValidationFailed(
            "Settings file must have .json extension".to_string(),
        )),
    }
}

fn validate_settings(settings: &Settings) -> Result<(), ConfigError> {
    if settings.repository_url.trim().is_empty() {
        return Err(ConfigError::ValidationFailed(
            "repository_url cannot be empty".to_string(),
        ));
    }
    if settings.tools.configure.is_empty() || settings.tools.build.is_empty() {
        return Err(ConfigError::ValidationFailed(
            "tools.configure and tools.build need at least a program name".to_string(),
        ));
    }
    Ok(())
}

/// Serialize settings as pretty JSON, creating parent directories.
pub fn save_settings_to_file(settings: &Settings, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    fs::write(path, serde_json::to_string_pretty(settings)?)?;
    Ok(())
}
