//! Tool Availability Checker
//!
//! Confirms the external programs the pipeline shells out to are on PATH. When
//! allowed it asks the detected package manager to install what is missing;
//! otherwise it reports the exact install command.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::Command;

use crate::config::BuildConfig;
use crate::error::{BuildError, Result};
use crate::models::Platform;

/// Package managers the checker knows how to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PackageManager {
    Brew,
    Apt,
    Dnf,
    Yum,
    Pacman,
    Choco,
    Winget,
    Scoop,
}

impl PackageManager {
    const DETECTION_ORDER: [PackageManager; 8] = [
        PackageManager::Brew,
        PackageManager::Apt,
        PackageManager::Dnf,
        PackageManager::Yum,
        PackageManager::Pacman,
        PackageManager::Choco,
        PackageManager::Winget,
        PackageManager::Scoop,
    ];

    pub fn binary(&self) -> &'static str {
        match self {
            PackageManager::Brew => "brew",
            PackageManager::Apt => "apt-get",
            PackageManager::Dnf => "dnf",
            PackageManager::Yum => "yum",
            PackageManager::Pacman => "pacman",
            PackageManager::Choco => "choco",
            PackageManager::Winget => "winget",
            PackageManager::Scoop => "scoop",
        }
    }

    /// First package manager found on PATH.
    pub fn detect() -> Option<Self> {
        Self::DETECTION_ORDER
            .into_iter()
            .find(|pm| command_exists(pm.binary()))
    }

    /// Shell command that installs `package`.
    pub fn install_command(&self, package: &str) -> String {
        match self {
            PackageManager::Brew => format!("brew install {}", package),
            PackageManager::Apt => format!("sudo apt-get install -y {}", package),
            PackageManager::Dnf => format!("sudo dnf install -y {}", package),
            PackageManager::Yum => format!("sudo yum install -y {}", package),
            PackageManager::Pacman => format!("sudo pacman -S --needed --noconfirm {}", package),
            PackageManager::Choco => format!("choco install -y {}", package),
            PackageManager::Winget => format!("winget install --silent {}", package),
            PackageManager::Scoop => format!("scoop install {}", package),
        }
    }

    /// Package providing `tool` under this manager.
    pub fn package_for(&self, tool: &str) -> String {
        let name = match (self, tool) {
            (PackageManager::Apt, "cc") | (PackageManager::Apt, "make") => "build-essential",
            (PackageManager::Pacman, "cc") | (PackageManager::Pacman, "make") => "base-devel",
            (PackageManager::Dnf | PackageManager::Yum, "cc") => "gcc-c++",
            (PackageManager::Brew, "cc") => "llvm",
            (_, "strip") if !matches!(self, PackageManager::Brew) => "binutils",
            (PackageManager::Pacman, "python3") => "python",
            (PackageManager::Choco | PackageManager::Winget | PackageManager::Scoop, "python3") => {
                "python"
            }
            _ => tool,
        };
        name.to_string()
    }
}

/// One external program the build needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolRequirement {
    /// Command as invoked (may be a path)
    pub command: String,
    /// Generic name used for package lookup
    pub tool: String,
    pub purpose: String,
    pub required: bool,
}

impl ToolRequirement {
    fn new(command: &str, tool: &str, purpose: &str, required: bool) -> Self {
        ToolRequirement {
            command: command.to_string(),
            tool: tool.to_string(),
            purpose: purpose.to_string(),
            required,
        }
    }
}

/// What the checker found.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolReport {
    pub missing_required: Vec<ToolRequirement>,
    pub missing_optional: Vec<ToolRequirement>,
    pub package_manager: Option<PackageManager>,
    /// Tools installed during this check
    pub installed: Vec<String>,
}

impl ToolReport {
    pub fn is_ready(&self) -> bool {
        self.missing_required.is_empty()
    }

    /// Single command line that installs every missing tool, if a package
    /// manager is known.
    pub fn generate_fix_command(&self) -> Option<String> {
        let pm = self.package_manager?;
        let mut packages: Vec<String> = self
            .missing_required
            .iter()
            .chain(self.missing_optional.iter())
            .map(|t| pm.package_for(&t.tool))
            .collect();
        packages.dedup();
        if packages.is_empty() {
            return None;
        }
        Some(pm.install_command(&packages.join(" ")))
    }
}

/// Tools required for `config`. git and curl are not needed: source control
/// and HTTP go through `git2` and `reqwest`.
pub fn required_tools(config: &BuildConfig) -> Vec<ToolRequirement> {
    let tools = &config.tools;
    let mut list = vec![
        ToolRequirement::new(&tools.patch, "patch", "applies source patches", true),
        ToolRequirement::new(&tools.cc, "cc", "compiles the runtime", true),
        ToolRequirement::new(&tools.python, "python3", "runs the configure script", true),
    ];
    if let Some(build) = tools.build.first() {
        list.push(ToolRequirement::new(build, "make", "drives the compile", true));
    }
    if config.platform != Platform::Win32 {
        list.push(ToolRequirement::new(&tools.strip, "strip", "removes debug symbols", true));
    }
    if config.needs_signing() {
        list.push(ToolRequirement::new(
            &tools.codesign,
            "codesign",
            "ad-hoc signs arm64 binaries",
            true,
        ));
    }
    list.push(ToolRequirement::new("git", "git", "manual inspection of the checkout", false));
    list
}

/// Whether `cmd` resolves to an executable, either as a path or via PATH.
pub fn command_exists(cmd: &str) -> bool {
    let candidate = Path::new(cmd);
    if candidate.components().count() > 1 || candidate.is_absolute() {
        return candidate.is_file();
    }
    let Some(paths) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&paths).any(|dir| {
        let full = dir.join(cmd);
        if full.is_file() {
            return true;
        }
        cfg!(windows) && dir.join(format!("{}.exe", cmd)).is_file()
    })
}

pub struct ToolChecker {
    auto_install: bool,
}

impl ToolChecker {
    pub fn new(auto_install: bool) -> Self {
        ToolChecker { auto_install }
    }

    /// Check every requirement, optionally installing what is missing.
    pub fn check(&self, requirements: &[ToolRequirement]) -> ToolReport {
        let mut report = ToolReport {
            package_manager: PackageManager::detect(),
            ..ToolReport::default()
        };

        for req in requirements {
            if command_exists(&req.command) {
                continue;
            }
            if req.required && self.auto_install && self.try_install(req, report.package_manager) {
                report.installed.push(req.tool.clone());
                continue;
            }
            if req.required {
                report.missing_required.push(req.clone());
            } else {
                report.missing_optional.push(req.clone());
            }
        }
        report
    }

    fn try_install(&self, req: &ToolRequirement, pm: Option<PackageManager>) -> bool {
        let Some(pm) = pm else {
            return false;
        };
        let install = pm.install_command(&pm.package_for(&req.tool));
        log::info!("[Tools] [INSTALL] {}", install);
        let status = if cfg!(windows) {
            Command::new("cmd").args(["/C", &install]).status()
        } else {
            Command::new("sh").args(["-c", &install]).status()
        };
        match status {
            Ok(s) if s.success() => command_exists(&req.command),
            Ok(s) => {
                log::warn!("[Tools] [INSTALL] '{}' exited with {}", install, s);
                false
            }
            Err(e) => {
                log::warn!("[Tools] [INSTALL] could not run '{}': {}", install, e);
                false
            }
        }
    }

    /// Check and turn the first missing required tool into an error.
    pub fn ensure(&self, config: &BuildConfig) -> Result<ToolReport> {
        let report = self.check(&required_tools(config));
        for optional in &report.missing_optional {
            log::warn!(
                "[Tools] [CHECK] Optional tool '{}' not found ({})",
                optional.command,
                optional.purpose
            );
        }
        if let Some(missing) = report.missing_required.first() {
            let install_hint = report
                .package_manager
                .map(|pm| pm.install_command(&pm.package_for(&missing.tool)));
            return Err(BuildError::MissingTool {
                tool: missing.command.clone(),
                purpose: missing.purpose.clone(),
                install_hint,
            });
        }
        log::info!("[Tools] [CHECK] ✓ All required tools available");
        Ok(report)
    }
}
