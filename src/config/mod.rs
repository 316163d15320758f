//! Configuration for a single orchestrator run.
//!
//! - `args`: command line flags (`clap`)
//! - `loader`: optional `smol-build.json` settings file
//!
//! Both are folded into an immutable [`BuildConfig`] together with the few
//! environment variables the builder honours. The environment is read exactly
//! once, in [`EnvSnapshot::capture`]; phases only see the resulting config.

pub mod args;
pub mod loader;

use serde::Serialize;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};

pub use args::CliArgs;
pub use loader::{Settings, ToolCommands};

use crate::error::{BuildError, Result};
use crate::models::{Arch, BuildProfile, Platform, Stage};

/// Environment inputs, captured once at startup.
#[derive(Debug, Clone, Default)]
pub struct EnvSnapshot {
    /// Raw `SMOL_COMPRESS` value
    pub smol_compress: Option<String>,
    /// `CI` set to anything but "" / "0" / "false"
    pub ci: bool,
    /// stdin is attached to a terminal
    pub interactive: bool,
}

impl EnvSnapshot {
    pub fn capture() -> Self {
        let ci = std::env::var("CI")
            .map(|v| !matches!(v.trim().to_lowercase().as_str(), "" | "0" | "false"))
            .unwrap_or(false);
        EnvSnapshot {
            smol_compress: std::env::var("SMOL_COMPRESS").ok(),
            ci,
            interactive: std::io::stdin().is_terminal(),
        }
    }

    /// Compression defaults on; `0`, `false`, `no` and `off` disable it.
    pub fn compression_enabled(&self) -> bool {
        match &self.smol_compress {
            Some(v) => !matches!(v.trim().to_lowercase().as_str(), "0" | "false" | "no" | "off"),
            None => true,
        }
    }
}

/// Immutable configuration shared by every phase.
#[derive(Debug, Clone)]
pub struct BuildConfig {
    pub project_root: PathBuf,
    pub build_dir: PathBuf,
    /// Settings file, if one was found
    pub settings_file: Option<PathBuf>,
    /// Static (version-agnostic) patches
    pub static_patches_dir: PathBuf,
    /// Patches generated for the target version
    pub dynamic_patches_dir: PathBuf,
    /// Files copied verbatim into the runtime tree before configure
    pub additions_dir: PathBuf,

    pub repository_url: String,
    pub node_version: String,
    pub platform: Platform,
    pub arch: Arch,
    pub profile: BuildProfile,
    pub compress: bool,

    pub clean: bool,
    pub verify: bool,
    pub run_tests: bool,
    pub run_full_tests: bool,
    pub assume_yes: bool,
    pub ci: bool,
    pub interactive: bool,
    pub skip_checks: bool,
    pub verbose: bool,

    pub jobs: usize,
    pub tools: ToolCommands,
    pub extra_configure_flags: Vec<String>,
    pub pkg_cache_dir: PathBuf,
    pub e2e_fixture_dir: PathBuf,
    pub network_probe_url: String,
    pub min_free_disk_bytes: u64,
    pub stub_path: Option<PathBuf>,
    pub auto_install_tools: bool,
}

/// Build-relevant fields that feed the content hash.
#[derive(Serialize)]
struct Fingerprint<'a> {
    node_version: &'a str,
    profile: BuildProfile,
    platform: Platform,
    arch: Arch,
    compress: bool,
    repository_url: &'a str,
    configure: &'a [String],
    extra_configure_flags: &'a [String],
}

impl BuildConfig {
    /// Resolve flags, settings file and environment into a config.
    pub fn from_args(args: &CliArgs) -> Result<Self> {
        Self::resolve(args, &EnvSnapshot::capture())
    }

    pub fn resolve(args: &CliArgs, env: &EnvSnapshot) -> Result<Self> {
        let project_root = match &args.project_root {
            Some(root) => root.clone(),
            None => std::env::current_dir()
                .map_err(|e| BuildError::io("resolving current directory", e))?,
        };

        let (settings, settings_file) = match &args.config {
            Some(path) => {
                let path = absolutize(&project_root, path);
                (loader::load_settings_from_file(&path)?, Some(path))
            }
            None => {
                let default_path = project_root.join(loader::DEFAULT_SETTINGS_FILE);
                if default_path.exists() {
                    (
                        loader::load_settings_from_file(&default_path)?,
                        Some(default_path),
                    )
                } else {
                    (Settings::default(), None)
                }
            }
        };

        let node_version = args
            .node_version
            .clone()
            .unwrap_or_else(|| settings.node_version.clone());
        let node_version = normalize_version_tag(&node_version)?;

        let profile = if args.prod || (env.ci && !args.dev) {
            BuildProfile::Prod
        } else {
            BuildProfile::Dev
        };

        let build_dir = absolutize(&project_root, &settings.build_dir);
        let pkg_cache_dir = match &settings.pkg_cache_dir {
            Some(dir) => absolutize(&project_root, dir),
            None => dirs::home_dir()
                .map(|home| home.join(".pkg-cache").join("v3.5"))
                .unwrap_or_else(|| build_dir.join("pkg-cache")),
        };

        Ok(BuildConfig {
            static_patches_dir: absolutize(&project_root, &settings.patches_dir),
            dynamic_patches_dir: build_dir.join("patches"),
            additions_dir: absolutize(&project_root, &settings.additions_dir),
            e2e_fixture_dir: absolutize(&project_root, &settings.e2e_fixture_dir),
            pkg_cache_dir,
            settings_file,
            repository_url: settings.repository_url.clone(),
            node_version,
            platform: args.platform.unwrap_or_else(Platform::host),
            arch: args.arch.unwrap_or_else(Arch::host),
            profile,
            compress: env.compression_enabled(),
            clean: args.clean,
            verify: args.verify,
            run_tests: args.test,
            run_full_tests: args.test_full,
            assume_yes: args.yes,
            ci: env.ci,
            interactive: env.interactive,
            skip_checks: args.skip_checks,
            verbose: args.verbose,
            jobs: num_cpus::get().max(1),
            tools: settings.tools.clone(),
            extra_configure_flags: settings.extra_configure_flags.clone(),
            network_probe_url: settings.network_probe_url.clone(),
            min_free_disk_bytes: settings.min_free_disk_gb * 1024 * 1024 * 1024,
            stub_path: settings.stub_path.as_ref().map(|p| absolutize(&project_root, p)),
            auto_install_tools: settings.auto_install_tools,
            build_dir,
            project_root,
        })
    }

    /// Patch directories in application order: static first, then dynamic.
    pub fn patch_dirs(&self) -> [&Path; 2] {
        [&self.static_patches_dir, &self.dynamic_patches_dir]
    }

    pub fn source_dir(&self) -> PathBuf {
        self.build_dir.join("node-source")
    }

    /// Where the build generator leaves the runtime binary.
    pub fn compiler_output(&self) -> PathBuf {
        self.source_dir()
            .join("out")
            .join("Release")
            .join(self.platform.binary_name())
    }

    pub fn stage_dir(&self, stage: Stage) -> PathBuf {
        self.build_dir.join("out").join(stage.dir_name())
    }

    pub fn stage_binary(&self, stage: Stage) -> PathBuf {
        self.stage_dir(stage).join(self.platform.binary_name())
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.build_dir.join(".checkpoint")
    }

    pub fn hash_path(&self) -> PathBuf {
        self.build_dir.join(".cache").join("build-hash.txt")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.build_dir.join(".build.lock")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.build_dir.join("logs")
    }

    pub fn compiled_cache_dir(&self) -> PathBuf {
        self.build_dir.join("cache").join("compiled").join(format!(
            "{}-{}-{}",
            self.node_version, self.platform, self.arch
        ))
    }

    /// Whether post-processing signs the binary (macOS on Apple silicon).
    pub fn needs_signing(&self) -> bool {
        self.platform == Platform::Darwin && self.arch == Arch::Arm64
    }

    /// `built-<version>-<platform>-<arch>[-signed]`
    pub fn pkg_cache_name(&self) -> String {
        let mut name = format!(
            "built-{}-{}-{}",
            self.node_version,
            self.platform.pkg_name(),
            self.arch
        );
        if self.needs_signing() {
            name.push_str("-signed");
        }
        name
    }

    pub fn pkg_cache_target(&self) -> PathBuf {
        self.pkg_cache_dir.join(self.pkg_cache_name())
    }

    pub fn e2e_fixture_target(&self) -> PathBuf {
        self.e2e_fixture_dir.join(self.platform.binary_name())
    }

    /// Outputs whose presence the cache check requires.
    pub fn declared_outputs(&self) -> Vec<PathBuf> {
        vec![self.stage_binary(Stage::Distribution), self.pkg_cache_target()]
    }

    /// Canonical serialization of the build-relevant fields.
    pub fn fingerprint(&self) -> String {
        let fp = Fingerprint {
            node_version: &self.node_version,
            profile: self.profile,
            platform: self.platform,
            arch: self.arch,
            compress: self.compress,
            repository_url: &self.repository_url,
            configure: &self.tools.configure,
            extra_configure_flags: &self.extra_configure_flags,
        };
        serde_json::to_string(&fp).unwrap_or_default()
    }

    /// Destructive prompts may proceed without asking.
    pub fn may_skip_confirmation(&self) -> bool {
        self.assume_yes || self.ci
    }
}

fn absolutize(root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}

/// Accepts `24.10.0` or `v24.10.0`, returns the tag form.
fn normalize_version_tag(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    let tag = if trimmed.starts_with('v') {
        trimmed.to_string()
    } else {
        format!("v{}", trimmed)
    };
    crate::runtime::version::Version::parse(&tag).map_err(|reason| BuildError::InvalidVersion {
        version: raw.to_string(),
        reason,
    })?;
    Ok(tag)
}
