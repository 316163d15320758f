//! Core data types for smol builds.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Target operating system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Linux,
    Darwin,
    Win32,
}

impl Platform {
    /// Platform of the running process.
    pub fn host() -> Self {
        if cfg!(target_os = "macos") {
            Platform::Darwin
        } else if cfg!(target_os = "windows") {
            Platform::Win32
        } else {
            Platform::Linux
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Linux => "linux",
            Platform::Darwin => "darwin",
            Platform::Win32 => "win32",
        }
    }

    /// Platform name used in package-manager cache directories.
    pub fn pkg_name(&self) -> &'static str {
        match self {
            Platform::Linux => "linux",
            Platform::Darwin => "macos",
            Platform::Win32 => "win",
        }
    }

    /// File name of the runtime executable on this platform.
    pub fn binary_name(&self) -> &'static str {
        match self {
            Platform::Win32 => "node.exe",
            _ => "node",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "linux" => Ok(Platform::Linux),
            "darwin" | "macos" | "mac" => Ok(Platform::Darwin),
            "win32" | "windows" | "win" => Ok(Platform::Win32),
            _ => Err(format!("Unknown platform: {}", s)),
        }
    }
}

/// Target CPU architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Arch {
    X64,
    Arm64,
}

impl Arch {
    pub fn host() -> Self {
        if cfg!(target_arch = "aarch64") {
            Arch::Arm64
        } else {
            Arch::X64
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Arch::X64 => "x64",
            Arch::Arm64 => "arm64",
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Arch {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "x64" | "x86_64" | "amd64" => Ok(Arch::X64),
            "arm64" | "aarch64" => Ok(Arch::Arm64),
            _ => Err(format!("Unknown architecture: {}", s)),
        }
    }
}

/// Build profile. Production adds link-time optimization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BuildProfile {
    #[default]
    Dev,
    Prod,
}

impl BuildProfile {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildProfile::Dev => "dev",
            BuildProfile::Prod => "prod",
        }
    }
}

impl fmt::Display for BuildProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A physical copy of the runtime binary at one point in post-processing.
///
/// Each stage lives in `<build>/out/<Stage>/`. Earlier stages are never
/// rewritten by later ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    Release,
    Stripped,
    Compressed,
    Final,
    Sea,
    Distribution,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::Release,
        Stage::Stripped,
        Stage::Compressed,
        Stage::Final,
        Stage::Sea,
        Stage::Distribution,
    ];

    pub fn dir_name(&self) -> &'static str {
        match self {
            Stage::Release => "Release",
            Stage::Stripped => "Stripped",
            Stage::Compressed => "Compressed",
            Stage::Final => "Final",
            Stage::Sea => "Sea",
            Stage::Distribution => "Distribution",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// Summary of a finished orchestrator run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildOutcome {
    /// Content hash matched and every declared output existed
    Cached,
    /// Full or resumed build produced new artifacts
    Built {
        /// Source acquisition and compile were skipped
        resumed: bool,
        compressed: bool,
        final_size: u64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_parsing_accepts_aliases() {
        assert_eq!("macos".parse::<Platform>().unwrap(), Platform::Darwin);
        assert_eq!("Windows".parse::<Platform>().unwrap(), Platform::Win32);
        assert_eq!("linux".parse::<Platform>().unwrap(), Platform::Linux);
        assert!("beos".parse::<Platform>().is_err());
    }

    #[test]
    fn test_pkg_names() {
        assert_eq!(Platform::Darwin.pkg_name(), "macos");
        assert_eq!(Platform::Win32.pkg_name(), "win");
        assert_eq!(Platform::Win32.binary_name(), "node.exe");
    }

    #[test]
    fn test_arch_parsing() {
        assert_eq!("aarch64".parse::<Arch>().unwrap(), Arch::Arm64);
        assert_eq!("x86_64".parse::<Arch>().unwrap(), Arch::X64);
    }

    #[test]
    fn test_stage_dirs_are_distinct() {
        let names: std::collections::HashSet<_> = Stage::ALL.iter().map(|s| s.dir_name()).collect();
        assert_eq!(names.len(), Stage::ALL.len());
    }
}
