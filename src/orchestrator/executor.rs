//! Build execution: configure and compile the runtime source tree.
//!
//! Both steps run the configured commands under `tokio::process`, stream
//! stdout and stderr line by line into a persisted build log, and keep the
//! last lines in memory so a failure can be reported without opening the log.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use crate::config::BuildConfig;
use crate::error::{BuildError, Result};
use crate::models::{Arch, BuildProfile, Platform};

/// Lines surfaced from the build log on failure.
pub const LOG_TAIL_LINES: usize = 40;

/// Configure flags that drop components a single-binary runtime never uses.
const SIZE_FLAGS: &[&str] = &["--without-npm", "--without-corepack", "--with-intl=small-icu"];

static FRACTION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[\s*(\d+)/(\d+)\]").expect("Invalid fraction progress regex"));
static PERCENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[\s*(\d+)%\]").expect("Invalid percent progress regex"));

/// A command that ran to completion but exited non-zero (or could not start).
#[derive(Debug)]
pub struct CommandFailure {
    pub reason: String,
    pub tail: Vec<String>,
}

/// Progress from a build-generator output line, if it carries any.
///
/// Understands ninja-style `[582/12041]` counters and `[ 45%]` markers.
pub fn parse_build_progress(line: &str) -> Option<u32> {
    if let Some(caps) = FRACTION_RE.captures(line) {
        if let (Ok(current), Ok(total)) = (caps[1].parse::<u64>(), caps[2].parse::<u64>()) {
            if total > 0 {
                return Some(((current * 100) / total).min(100) as u32);
            }
        }
    }
    if let Some(caps) = PERCENT_RE.captures(line) {
        if let Ok(progress) = caps[1].parse::<u32>() {
            return Some(progress.min(100));
        }
    }
    None
}

/// Whether a line marks one compilation unit (make's `  CXX(target) ...`).
fn is_compile_unit(line: &str) -> bool {
    let trimmed = line.trim_start();
    ["CXX(", "CC(", "CXX ", "CC ", "LINK(", "ACTION "]
        .iter()
        .any(|p| trimmed.starts_with(p))
}

/// Replace `{jobs}` placeholders in a command template.
pub fn expand_command(template: &[String], jobs: usize) -> Vec<String> {
    template
        .iter()
        .map(|part| part.replace("{jobs}", &jobs.to_string()))
        .collect()
}

fn dest_cpu(arch: Arch) -> &'static str {
    match arch {
        Arch::X64 => "x64",
        Arch::Arm64 => "arm64",
    }
}

fn dest_os(platform: Platform) -> &'static str {
    match platform {
        Platform::Linux => "linux",
        Platform::Darwin => "mac",
        Platform::Win32 => "win",
    }
}

/// Full configure invocation for `config`.
pub fn configure_command(config: &BuildConfig) -> Vec<String> {
    let mut cmd = expand_command(&config.tools.configure, config.jobs);
    cmd.extend(SIZE_FLAGS.iter().map(|s| s.to_string()));
    cmd.push(format!("--dest-cpu={}", dest_cpu(config.arch)));
    cmd.push(format!("--dest-os={}", dest_os(config.platform)));
    if config.profile == BuildProfile::Prod {
        cmd.push("--enable-lto".to_string());
    }
    cmd.extend(config.extra_configure_flags.iter().cloned());
    cmd
}

pub fn compile_command(config: &BuildConfig) -> Vec<String> {
    expand_command(&config.tools.build, config.jobs)
}

/// Fresh log file under `<build>/logs/`.
pub fn new_build_log_path(config: &BuildConfig, step: &str) -> PathBuf {
    let timestamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
    config.logs_dir().join(format!("{}-{}.log", step, timestamp))
}

/// Run `argv` in `cwd`, appending both streams to `log_path`.
///
/// Returns the number of output lines on success.
pub async fn run_logged(
    argv: &[String],
    cwd: &Path,
    envs: &[(String, String)],
    log_path: &Path,
) -> std::result::Result<usize, CommandFailure> {
    let fail = |reason: String, tail: Vec<String>| CommandFailure { reason, tail };

    let (program, args) = argv
        .split_first()
        .ok_or_else(|| fail("empty command".to_string(), Vec::new()))?;

    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| fail(format!("cannot create {}: {}", parent.display(), e), Vec::new()))?;
    }
    let mut log_file = File::create(log_path)
        .map(BufWriter::new)
        .map_err(|e| fail(format!("cannot create {}: {}", log_path.display(), e), Vec::new()))?;
    let _ = writeln!(log_file, "$ {}", argv.join(" "));

    let mut command = Command::new(program);
    command
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for (key, value) in envs {
        command.env(key, value);
    }

    log::info!("[Build] [EXEC] {} (in {})", argv.join(" "), cwd.display());
    let mut child = command
        .spawn()
        .map_err(|e| fail(format!("failed to spawn '{}': {}", program, e), Vec::new()))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| fail("failed to capture stdout".to_string(), Vec::new()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| fail("failed to capture stderr".to_string(), Vec::new()))?;
    let mut stdout_reader = BufReader::new(stdout);
    let mut stderr_reader = BufReader::new(stderr);
    // Partial lines survive a lost select race; `read_until` appends to them
    let mut stdout_buf = Vec::new();
    let mut stderr_buf = Vec::new();

    let mut tail: VecDeque<String> = VecDeque::with_capacity(LOG_TAIL_LINES);
    let mut stdout_closed = false;
    let mut stderr_closed = false;
    let mut line_count = 0usize;
    let mut unit_count = 0usize;
    let mut last_progress = None;

    let mut record = |line: String, log_file: &mut BufWriter<File>| {
        let _ = writeln!(log_file, "{}", line);
        line_count += 1;
        if is_compile_unit(&line) {
            unit_count += 1;
            if unit_count % 500 == 0 {
                log::info!(target: "parsed", "Compiling: processed {} units", unit_count);
            }
        }
        if let Some(progress) = parse_build_progress(&line) {
            if last_progress.map_or(true, |p: u32| progress >= p + 10) {
                log::info!(target: "parsed", "Compiling: {}%", progress);
                last_progress = Some(progress);
            }
        }
        if tail.len() == LOG_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    };

    // Both pipes are drained to EOF whatever their encoding, or a chatty
    // child blocks on a full pipe
    while !(stdout_closed && stderr_closed) {
        tokio::select! {
            read = stdout_reader.read_until(b'\n', &mut stdout_buf), if !stdout_closed => match read {
                Ok(0) => {
                    if !stdout_buf.is_empty() {
                        record(take_line(&mut stdout_buf), &mut log_file);
                    }
                    stdout_closed = true;
                }
                Ok(_) => record(take_line(&mut stdout_buf), &mut log_file),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => {
                    record(format!("stdout read error: {}", e), &mut log_file);
                    stdout_closed = true;
                }
            },
            read = stderr_reader.read_until(b'\n', &mut stderr_buf), if !stderr_closed => match read {
                Ok(0) => {
                    if !stderr_buf.is_empty() {
                        record(format!("[STDERR] {}", take_line(&mut stderr_buf)), &mut log_file);
                    }
                    stderr_closed = true;
                }
                Ok(_) => record(format!("[STDERR] {}", take_line(&mut stderr_buf)), &mut log_file),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => {
                    record(format!("stderr read error: {}", e), &mut log_file);
                    stderr_closed = true;
                }
            },
        }
    }

    let status = child
        .wait()
        .await
        .map_err(|e| fail(format!("failed to wait for '{}': {}", program, e), Vec::new()))?;
    let _ = writeln!(log_file, "# exit: {}", status);
    let _ = log_file.flush();

    let tail: Vec<String> = tail.into_iter().collect();
    if status.success() {
        Ok(line_count)
    } else {
        Err(fail(format!("'{}' exited with {}", argv.join(" "), status), tail))
    }
}

/// Decode one raw output line, replacing invalid UTF-8, and reset the buffer.
fn take_line(buf: &mut Vec<u8>) -> String {
    let line = String::from_utf8_lossy(buf)
        .trim_end_matches(&['\n', '\r'][..])
        .to_string();
    buf.clear();
    line
}

fn build_env(config: &BuildConfig) -> Vec<(String, String)> {
    vec![
        ("MAKEFLAGS".to_string(), format!("-j{}", config.jobs)),
        ("PYTHONDONTWRITEBYTECODE".to_string(), "1".to_string()),
    ]
}

fn compilation_error(failure: CommandFailure, log_path: &Path) -> BuildError {
    BuildError::Compilation {
        reason: failure.reason,
        log_path: Some(log_path.to_path_buf()),
        log_tail: failure.tail,
    }
}

/// Run the configure script in the source tree.
pub async fn run_configure(config: &BuildConfig) -> Result<PathBuf> {
    let log_path = new_build_log_path(config, "configure");
    let argv = configure_command(config);
    run_logged(&argv, &config.source_dir(), &build_env(config), &log_path)
        .await
        .map_err(|f| compilation_error(f, &log_path))?;
    log::info!("[Build] [CONFIGURE] ✓ Configured ({})", log_path.display());
    Ok(log_path)
}

/// Compile with `-j<N>` and confirm the compiler output exists.
pub async fn run_compile(config: &BuildConfig) -> Result<PathBuf> {
    let log_path = new_build_log_path(config, "build");
    let argv = compile_command(config);
    log::info!(target: "parsed", "Compiling with {} job(s)", config.jobs);

    let lines = run_logged(&argv, &config.source_dir(), &build_env(config), &log_path)
        .await
        .map_err(|f| compilation_error(f, &log_path))?;

    let output = config.compiler_output();
    if !output.is_file() {
        return Err(BuildError::Compilation {
            reason: format!(
                "build finished but {} was not produced",
                output.display()
            ),
            log_path: Some(log_path.clone()),
            log_tail: tail_of_file(&log_path, LOG_TAIL_LINES),
        });
    }
    log::info!(
        "[Build] [COMPILE] ✓ {} ({} log lines, {})",
        output.display(),
        lines,
        log_path.display()
    );
    Ok(output)
}

/// Last `n` lines of a text file.
pub fn tail_of_file(path: &Path, n: usize) -> Vec<String> {
    let content = fs::read_to_string(path).unwrap_or_default();
    let lines: Vec<&str> = content.lines().collect();
    lines[lines.len().saturating_sub(n)..]
        .iter()
        .map(|l| l.to_string())
        .collect()
}
