//! Build Environment Validator
//!
//! Silent readiness checks run before any source is touched: free disk space,
//! Python version, a working C/C++ compiler and reachability of the source
//! host. Each check produces a [`CheckResult`]; the first failure becomes an
//! `EnvironmentUnready` error.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use sysinfo::Disks;
use tokio::process::Command;

use crate::config::BuildConfig;
use crate::error::{BuildError, Result};

/// Minimum interpreter the runtime's configure script accepts.
pub const MIN_PYTHON: (u32, u32) = (3, 9);

pub const NETWORK_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Health status levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    /// Every check passed
    Ready,
    /// Some checks were skipped but nothing failed
    Degraded,
    /// At least one check failed
    NotReady,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Ready => "Ready",
            HealthStatus::Degraded => "Degraded",
            HealthStatus::NotReady => "NotReady",
        }
    }

    pub fn needs_fix(&self) -> bool {
        matches!(self, HealthStatus::NotReady)
    }
}

/// Outcome of a single check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResult {
    /// Check name: "disk", "python", "compiler" or "network"
    pub check: String,
    pub passed: bool,
    pub skipped: bool,
    pub detail: String,
}

impl CheckResult {
    fn pass(check: &str, detail: impl Into<String>) -> Self {
        CheckResult {
            check: check.to_string(),
            passed: true,
            skipped: false,
            detail: detail.into(),
        }
    }

    fn fail(check: &str, detail: impl Into<String>) -> Self {
        CheckResult {
            check: check.to_string(),
            passed: false,
            skipped: false,
            detail: detail.into(),
        }
    }

    fn skip(check: &str, detail: impl Into<String>) -> Self {
        CheckResult {
            check: check.to_string(),
            passed: true,
            skipped: true,
            detail: detail.into(),
        }
    }
}

/// Environment report
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthReport {
    pub checks: Vec<CheckResult>,
}

impl HealthReport {
    pub fn status(&self) -> HealthStatus {
        if self.checks.iter().any(|c| !c.passed) {
            HealthStatus::NotReady
        } else if self.checks.iter().any(|c| c.skipped) {
            HealthStatus::Degraded
        } else {
            HealthStatus::Ready
        }
    }

    pub fn first_failure(&self) -> Option<&CheckResult> {
        self.checks.iter().find(|c| !c.passed)
    }

    /// Convert the first failed check into an error.
    pub fn into_result(self) -> Result<Self> {
        if let Some(failed) = self.first_failure() {
            return Err(BuildError::EnvironmentUnready {
                check: failed.check.clone(),
                reason: failed.detail.clone(),
            });
        }
        Ok(self)
    }
}

/// Runs every readiness check and logs each outcome.
pub struct EnvironmentValidator<'a> {
    config: &'a BuildConfig,
}

impl<'a> EnvironmentValidator<'a> {
    pub fn new(config: &'a BuildConfig) -> Self {
        EnvironmentValidator { config }
    }

    pub async fn check_all(&self) -> HealthReport {
        let mut report = HealthReport::default();
        report.checks.push(self.check_disk());
        report.checks.push(self.check_python().await);
        report.checks.push(self.check_compiler().await);
        report.checks.push(self.check_network().await);

        for check in &report.checks {
            if check.skipped {
                log::info!("[Env] [{}] skipped: {}", check.check.to_uppercase(), check.detail);
            } else if check.passed {
                log::info!("[Env] [{}] ✓ {}", check.check.to_uppercase(), check.detail);
            } else {
                log::error!("[Env] [{}] ✗ {}", check.check.to_uppercase(), check.detail);
            }
        }
        log::info!(target: "parsed", "Environment: {}", report.status().as_str());
        report
    }

    /// Run every check, failing on the first that did not pass.
    pub async fn validate(&self) -> Result<HealthReport> {
        self.check_all().await.into_result()
    }

    fn check_disk(&self) -> CheckResult {
        let required = self.config.min_free_disk_bytes;
        match available_disk_bytes(&self.config.build_dir) {
            Some(free) if free >= required => CheckResult::pass(
                "disk",
                format!("{} free (need {})", format_bytes(free), format_bytes(required)),
            ),
            Some(free) => CheckResult::fail(
                "disk",
                format!(
                    "only {} free under {}, need {}",
                    format_bytes(free),
                    self.config.build_dir.display(),
                    format_bytes(required)
                ),
            ),
            None => CheckResult::skip("disk", "could not determine the filesystem for the build dir"),
        }
    }

    async fn check_python(&self) -> CheckResult {
        let python = &self.config.tools.python;
        let output = match Command::new(python).arg("--version").output().await {
            Ok(o) => o,
            Err(e) => return CheckResult::fail("python", format!("cannot run {}: {}", python, e)),
        };
        // Python 2 prints its version on stderr.
        let text = format!(
            "{}{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
        match parse_python_version(&text) {
            Some(found) if found >= MIN_PYTHON => {
                CheckResult::pass("python", format!("{} {}.{}", python, found.0, found.1))
            }
            Some(found) => CheckResult::fail(
                "python",
                format!(
                    "{} is {}.{}, need {}.{}+",
                    python, found.0, found.1, MIN_PYTHON.0, MIN_PYTHON.1
                ),
            ),
            None => CheckResult::fail("python", format!("unrecognised version output: {}", text.trim())),
        }
    }

    async fn check_compiler(&self) -> CheckResult {
        let cc = &self.config.tools.cc;
        match Command::new(cc).arg("--version").output().await {
            Ok(o) if o.status.success() => {
                let first = String::from_utf8_lossy(&o.stdout)
                    .lines()
                    .next()
                    .unwrap_or_default()
                    .to_string();
                CheckResult::pass("compiler", first)
            }
            Ok(o) => CheckResult::fail("compiler", format!("{} --version exited with {}", cc, o.status)),
            Err(e) => CheckResult::fail("compiler", format!("cannot run {}: {}", cc, e)),
        }
    }

    async fn check_network(&self) -> CheckResult {
        if !is_remote_url(&self.config.repository_url) {
            return CheckResult::skip("network", "repository is local");
        }
        match probe_network(&self.config.network_probe_url, NETWORK_PROBE_TIMEOUT).await {
            Ok(status) => CheckResult::pass(
                "network",
                format!("{} answered {}", self.config.network_probe_url, status),
            ),
            Err(reason) => CheckResult::fail("network", reason),
        }
    }
}

/// HEAD request against `url`. Any HTTP answer counts as reachable.
pub async fn probe_network(url: &str, timeout: Duration) -> std::result::Result<u16, String> {
    let client = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| format!("cannot build HTTP client: {}", e))?;
    match client.head(url).send().await {
        Ok(resp) => Ok(resp.status().as_u16()),
        Err(e) if e.is_timeout() => Err(format!(
            "{} did not answer within {}s",
            url,
            timeout.as_secs()
        )),
        Err(e) => Err(format!("{} unreachable: {}", url, e)),
    }
}

pub fn is_remote_url(url: &str) -> bool {
    let lower = url.to_lowercase();
    ["http://", "https://", "git://", "ssh://", "git@"]
        .iter()
        .any(|p| lower.starts_with(p))
}

/// Free bytes on the filesystem holding `path` (or its nearest existing
/// ancestor).
pub fn available_disk_bytes(path: &Path) -> Option<u64> {
    let target = nearest_existing(path)?;
    let disks = Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|d| target.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().components().count())
        .map(|d| d.available_space())
}

fn nearest_existing(path: &Path) -> Option<PathBuf> {
    let mut current = Some(path);
    while let Some(p) = current {
        if p.exists() {
            return p.canonicalize().ok();
        }
        current = p.parent();
    }
    None
}

/// `Python 3.11.4` → `(3, 11)`
pub fn parse_python_version(output: &str) -> Option<(u32, u32)> {
    let rest = output.trim().strip_prefix("Python")?.trim();
    let mut parts = rest.split('.');
    let major = parts.next()?.trim().parse().ok()?;
    let minor: String = parts
        .next()?
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    Some((major, minor.parse().ok()?))
}

pub fn format_bytes(bytes: u64) -> String {
    const GB: f64 = 1024.0 * 1024.0 * 1024.0;
    const MB: f64 = 1024.0 * 1024.0;
    let b = bytes as f64;
    if b >= GB {
        format!("{:.1} GB", b / GB)
    } else {
        format!("{:.1} MB", b / MB)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_python_version() {
        assert_eq!(parse_python_version("Python 3.11.4\n"), Some((3, 11)));
        assert_eq!(parse_python_version("Python 3.9.0rc1"), Some((3, 9)));
        assert_eq!(parse_python_version("Python 2.7.18"), Some((2, 7)));
        assert_eq!(parse_python_version("nope"), None);
        assert!(parse_python_version("Python 3.8.10").unwrap() < MIN_PYTHON);
    }

    #[test]
    fn test_report_status() {
        let mut report = HealthReport::default();
        report.checks.push(CheckResult::pass("disk", "ok"));
        assert_eq!(report.status(), HealthStatus::Ready);
        report.checks.push(CheckResult::skip("network", "local"));
        assert_eq!(report.status(), HealthStatus::Degraded);
        report.checks.push(CheckResult::fail("python", "too old"));
        assert!(report.status().needs_fix());

        match report.into_result().unwrap_err() {
            BuildError::EnvironmentUnready { check, reason } => {
                assert_eq!(check, "python");
                assert_eq!(reason, "too old");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_remote_urls() {
        assert!(is_remote_url("https://github.com/nodejs/node.git"));
        assert!(is_remote_url("git@github.com:nodejs/node.git"));
        assert!(!is_remote_url("/tmp/node"));
        assert!(!is_remote_url("file:///tmp/node"));
    }

    #[test]
    fn test_disk_lookup_walks_to_existing_parent() {
        let temp = tempfile::tempdir().unwrap();
        let missing = temp.path().join("not/yet/created");
        assert_eq!(nearest_existing(&missing), temp.path().canonicalize().ok());
    }

    #[cfg(unix)]
    fn fake_tool(dir: &Path, name: &str, script: &str) -> String {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(name);
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[cfg(unix)]
    fn config_in(root: &Path) -> BuildConfig {
        let args = crate::config::CliArgs {
            project_root: Some(root.to_path_buf()),
            ..crate::config::CliArgs::default()
        };
        BuildConfig::resolve(&args, &crate::config::EnvSnapshot::default()).unwrap()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_python_version_read_from_stderr() {
        let temp = tempfile::tempdir().unwrap();
        let mut config = config_in(temp.path());
        config.tools.python = fake_tool(temp.path(), "python", "#!/bin/sh\necho 'Python 2.7.18' >&2\n");
        let result = EnvironmentValidator::new(&config).check_python().await;
        assert!(!result.passed);
        assert!(result.detail.contains("2.7"), "{}", result.detail);

        config.tools.python = fake_tool(temp.path(), "python3", "#!/bin/sh\necho 'Python 3.12.1'\n");
        assert!(EnvironmentValidator::new(&config).check_python().await.passed);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_compiler_check() {
        let temp = tempfile::tempdir().unwrap();
        let mut config = config_in(temp.path());
        config.tools.cc = fake_tool(temp.path(), "cc", "#!/bin/sh\necho 'smol cc 1.0'\n");
        let result = EnvironmentValidator::new(&config).check_compiler().await;
        assert!(result.passed);
        assert_eq!(result.detail, "smol cc 1.0");

        config.tools.cc = fake_tool(temp.path(), "broken-cc", "#!/bin/sh\nexit 1\n");
        assert!(!EnvironmentValidator::new(&config).check_compiler().await.passed);

        config.tools.cc = temp.path().join("missing-cc").to_string_lossy().into_owned();
        let missing = EnvironmentValidator::new(&config).check_compiler().await;
        assert!(missing.detail.starts_with("cannot run"), "{}", missing.detail);
    }

    #[tokio::test]
    async fn test_probe_network_reachable() {
        let mut server = mockito::Server::new_async().await;
        let mock = server.mock("HEAD", "/").with_status(200).create_async().await;

        let status = probe_network(&server.url(), Duration::from_secs(5)).await.unwrap();
        assert_eq!(status, 200);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_probe_network_unreachable() {
        // Port 9 (discard) on localhost is closed on any sane test host.
        let result = probe_network("http://127.0.0.1:9/", Duration::from_secs(2)).await;
        assert!(result.is_err());
    }
}
