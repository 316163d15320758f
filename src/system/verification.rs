//! Post-build binary verification
//!
//! Every binary the pipeline produces or installs is executed before it is
//! trusted: `--version` must report the target version and a one-line script
//! must evaluate correctly. A binary that fails either check is treated as
//! corrupt.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

use crate::error::{BuildError, Result};

pub const SMOKE_TEST_TIMEOUT: Duration = Duration::from_secs(30);

const EVAL_SCRIPT: &str = "console.log(1+1)";
const EVAL_EXPECTED: &str = "2";

/// Result of a successful smoke test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmokeReport {
    pub version: String,
    pub size: u64,
}

/// Run `binary` with `args`, returning trimmed stdout.
async fn run_probe(binary: &Path, args: &[&str], timeout: Duration) -> std::result::Result<String, String> {
    let child = Command::new(binary)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output();

    let output = match tokio::time::timeout(timeout, child).await {
        Ok(Ok(o)) => o,
        Ok(Err(e)) => return Err(format!("failed to execute: {}", e)),
        Err(_) => return Err(format!("timed out after {}s", timeout.as_secs())),
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!(
            "exited with {}: {}",
            output.status,
            stderr.lines().last().unwrap_or_default().trim()
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Version and eval checks with an explicit timeout per invocation.
pub async fn smoke_test_with_timeout(
    binary: &Path,
    expected_version: &str,
    step: &str,
    timeout: Duration,
) -> Result<SmokeReport> {
    let corrupt = |reason: String| BuildError::BinaryCorruption {
        step: step.to_string(),
        binary: binary.to_path_buf(),
        reason,
    };

    let metadata = std::fs::metadata(binary)
        .map_err(|e| corrupt(format!("binary missing: {}", e)))?;
    if metadata.len() == 0 {
        return Err(corrupt("binary is empty".to_string()));
    }

    let version = run_probe(binary, &["--version"], timeout)
        .await
        .map_err(|e| corrupt(format!("--version {}", e)))?;
    if version != expected_version {
        return Err(corrupt(format!(
            "--version reported '{}', expected '{}'",
            version, expected_version
        )));
    }

    let evaluated = run_probe(binary, &["-e", EVAL_SCRIPT], timeout)
        .await
        .map_err(|e| corrupt(format!("eval {}", e)))?;
    if evaluated != EVAL_EXPECTED {
        return Err(corrupt(format!(
            "eval printed '{}', expected '{}'",
            evaluated, EVAL_EXPECTED
        )));
    }

    log::info!(
        "[Verify] [{}] ✓ {} ({}, {} bytes)",
        step.to_uppercase(),
        binary.display(),
        version,
        metadata.len()
    );
    Ok(SmokeReport {
        version,
        size: metadata.len(),
    })
}

/// Smoke test `binary` after pipeline step `step`.
pub async fn smoke_test(binary: &Path, expected_version: &str, step: &str) -> Result<SmokeReport> {
    smoke_test_with_timeout(binary, expected_version, step, SMOKE_TEST_TIMEOUT).await
}

/// Which of the runtime's own test suites to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestSuite {
    /// `parallel` only
    Quick,
    /// Every default suite
    Full,
}

impl TestSuite {
    pub fn args(&self) -> Vec<&'static str> {
        match self {
            TestSuite::Quick => vec!["parallel"],
            TestSuite::Full => vec![],
        }
    }
}

/// Run the runtime's `tools/test.py` against `binary` from `source_dir`.
pub async fn run_test_suite(
    python: &str,
    source_dir: &Path,
    binary: &Path,
    jobs: usize,
    suite: TestSuite,
) -> Result<()> {
    let runner = source_dir.join("tools").join("test.py");
    if !runner.exists() {
        return Err(BuildError::Compilation {
            reason: format!("test runner not found at {}", runner.display()),
            log_path: None,
            log_tail: Vec::new(),
        });
    }

    log::info!(target: "parsed", "Running {:?} test suite", suite);
    let status = Command::new(python)
        .arg(&runner)
        .arg(format!("--shell={}", binary.display()))
        .arg(format!("-j{}", jobs))
        .args(suite.args())
        .current_dir(source_dir)
        .stdin(Stdio::null())
        .status()
        .await
        .map_err(|e| BuildError::io(format!("running {}", runner.display()), e))?;

    if status.success() {
        log::info!("[Verify] [TESTS] ✓ {:?} suite passed", suite);
        Ok(())
    } else {
        Err(BuildError::Compilation {
            reason: format!("{:?} test suite failed with {}", suite, status),
            log_path: None,
            log_tail: Vec::new(),
        })
    }
}
