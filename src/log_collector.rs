//! Decoupled logging pipeline for runtime builds.
//!
//! Every `log::*` record is handed to a background persister thread through an
//! unbounded crossbeam channel, so a slow disk never stalls the orchestrator.
//!
//! ```text
//! log::info!() ... log::error!()
//!     |
//! [LogCollector]  -- records >= console level --> stderr
//!     | (crossbeam unbounded)
//! [DiskPersister thread]
//!     |
//! logs/full/<ts>_full.log      every record
//! logs/parsed/<ts>_parsed.log  records with target "parsed"
//! ```
//!
//! Call [`LogCollector::wait_for_empty`] before exiting so the final records
//! (the failure report in particular) reach disk.

use chrono::Local;
use crossbeam_channel::{unbounded, Sender};
use log::{Level, LevelFilter, Log, Metadata, Record};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Internal log line or flush marker
enum LogMessage {
    Line(LogLine),
    Flush(std::sync::mpsc::Sender<()>),
}

/// A log line with metadata
#[derive(Clone, Debug)]
pub struct LogLine {
    pub message: String,
    /// "full" or "parsed"
    pub log_type: String,
    pub timestamp: String,
}

impl LogLine {
    pub fn new(message: String) -> Self {
        LogLine {
            message,
            log_type: "full".to_string(),
            timestamp: Local::now().format("%H:%M:%S%.3f").to_string(),
        }
    }

    pub fn parsed(message: String) -> Self {
        LogLine {
            message,
            log_type: "parsed".to_string(),
            timestamp: Local::now().format("%H:%M:%S%.3f").to_string(),
        }
    }
}

/// Unified logger: disk persistence plus stderr echo
pub struct LogCollector {
    tx: Sender<LogMessage>,
    log_dir: PathBuf,
    console_level: LevelFilter,
    /// Explicit session file, bumps `generation` when replaced
    session: Arc<Mutex<SessionState>>,
}

#[derive(Clone, Debug, Default)]
struct SessionState {
    path: Option<PathBuf>,
    generation: u64,
}

impl LogCollector {
    /// Create the collector and spawn the disk persister thread.
    ///
    /// `log_dir` gets `full/` and `parsed/` subdirectories.
    pub fn new(log_dir: PathBuf, console_level: LevelFilter) -> Result<Self, String> {
        let full_log_dir = log_dir.join("full");
        let parsed_log_dir = log_dir.join("parsed");
        std::fs::create_dir_all(&full_log_dir)
            .map_err(|e| format!("Failed to create full log dir: {}", e))?;
        std::fs::create_dir_all(&parsed_log_dir)
            .map_err(|e| format!("Failed to create parsed log dir: {}", e))?;

        let (tx, rx) = unbounded::<LogMessage>();
        let session = Arc::new(Mutex::new(SessionState::default()));
        let session_clone = Arc::clone(&session);

        // OS thread rather than a tokio task: records from blocking sections
        // and from nested runtimes must still arrive.
        std::thread::spawn(move || {
            let mut handles: HashMap<&'static str, File> = HashMap::new();
            let mut seen_generation = 0u64;

            while let Ok(msg) = rx.recv() {
                match msg {
                    LogMessage::Line(line) => {
                        if let Ok(state) = session_clone.lock() {
                            if state.generation != seen_generation {
                                handles.remove("full");
                                seen_generation = state.generation;
                            }
                        }

                        if !handles.contains_key("full") {
                            let path = session_clone
                                .lock()
                                .ok()
                                .and_then(|s| s.path.clone())
                                .or_else(|| new_log_file(&full_log_dir, "full").ok());
                            if let Some(file) = path.and_then(|p| open_append(&p)) {
                                handles.insert("full", file);
                            }
                        }
                        if let Some(file) = handles.get_mut("full") {
                            let _ = writeln!(file, "[{}] {}", line.timestamp, line.message);
                        }

                        if line.log_type == "parsed" {
                            if !handles.contains_key("parsed") {
                                if let Some(file) = new_log_file(&parsed_log_dir, "parsed")
                                    .ok()
                                    .and_then(|p| open_append(&p))
                                {
                                    handles.insert("parsed", file);
                                }
                            }
                            if let Some(file) = handles.get_mut("parsed") {
                                let _ = writeln!(file, "[{}] {}", line.timestamp, line.message);
                            }
                        }
                    }
                    LogMessage::Flush(done) => {
                        for file in handles.values_mut() {
                            let _ = file.flush();
                            let _ = file.sync_data();
                        }
                        let _ = done.send(());
                    }
                }
            }
        });

        Ok(LogCollector {
            tx,
            log_dir,
            console_level,
            session,
        })
    }

    /// Route subsequent full-log records to `logs/full/<filename>`.
    pub fn start_new_session(&self, filename: &str) -> Result<PathBuf, String> {
        let log_path = self.log_dir.join("full").join(filename);
        let mut session = self
            .session
            .lock()
            .map_err(|e| format!("Failed to lock session state: {}", e))?;
        session.path = Some(log_path.clone());
        session.generation = session.generation.wrapping_add(1);
        Ok(log_path)
    }

    pub fn get_session_log_path(&self) -> Option<PathBuf> {
        self.session.lock().ok().and_then(|s| s.path.clone())
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// Queue a line for persistence. Never blocks.
    pub fn log(&self, line: LogLine) {
        let _ = self.tx.send(LogMessage::Line(line));
    }

    pub fn log_str(&self, message: impl Into<String>) {
        self.log(LogLine::new(message.into()));
    }

    pub fn log_parsed(&self, message: impl Into<String>) {
        self.log(LogLine::parsed(message.into()));
    }

    /// Block until every line queued before this call is on disk.
    pub async fn wait_for_empty(&self) -> Result<(), String> {
        let (tx, rx) = std::sync::mpsc::channel::<()>();
        self.tx
            .send(LogMessage::Flush(tx))
            .map_err(|e| format!("Failed to send flush marker: {}", e))?;
        tokio::task::spawn_blocking(move || rx.recv())
            .await
            .map_err(|e| format!("Flush task failed: {}", e))?
            .map_err(|e| format!("Flush signal interrupted: {}", e))
    }
}

impl Clone for LogCollector {
    fn clone(&self) -> Self {
        LogCollector {
            tx: self.tx.clone(),
            log_dir: self.log_dir.clone(),
            console_level: self.console_level,
            session: Arc::clone(&self.session),
        }
    }
}

/// Wires `log::info!()` and friends into the collector.
impl Log for LogCollector {
    fn enabled(&self, metadata: &Metadata) -> bool {
        // Dependency chatter (reqwest, hyper) stays out of the build log
        metadata.target().starts_with("smol")
            || metadata.target() == "parsed"
            || metadata.level() <= Level::Warn
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let message = format!("[{}] {}", record.level(), record.args());

        if record.level() <= self.console_level {
            eprintln!("{}", record.args());
        }

        if record.target() == "parsed" {
            self.log_parsed(message);
        } else {
            self.log_str(message);
        }
    }

    fn flush(&self) {}
}

/// Install `collector` as the global `log` backend.
pub fn install(collector: &LogCollector) -> Result<(), String> {
    log::set_boxed_logger(Box::new(collector.clone()))
        .map(|()| log::set_max_level(LevelFilter::Debug))
        .map_err(|e| format!("Failed to set global logger: {}", e))
}

fn open_append(path: &Path) -> Option<File> {
    OpenOptions::new().create(true).append(true).open(path).ok()
}

fn new_log_file(log_dir: &Path, log_type: &str) -> Result<PathBuf, String> {
    let timestamp = Local::now().format("%Y%m%d_%H%M%S");
    let log_path = log_dir.join(format!("{}_{}.log", timestamp, log_type));
    File::create(&log_path).map_err(|e| format!("Failed to create log file: {}", e))?;
    Ok(log_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[tokio::test]
    async fn test_log_collector_creates_directories() {
        let temp = tempfile::tempdir().unwrap();
        let log_dir = temp.path().join("logs");
        let result = LogCollector::new(log_dir.clone(), LevelFilter::Off);

        assert!(result.is_ok());
        assert!(log_dir.join("full").exists());
        assert!(log_dir.join("parsed").exists());
    }

    #[tokio::test]
    async fn test_wait_for_empty_persists_all_lines() {
        let temp = tempfile::tempdir().unwrap();
        let collector = LogCollector::new(temp.path().to_path_buf(), LevelFilter::Off).unwrap();

        for i in 0..500 {
            collector.log_str(format!("line {}", i));
        }
        collector.log_parsed("[Build] [PHASE] Compile");
        collector.wait_for_empty().await.unwrap();

        let full: Vec<_> = fs::read_dir(temp.path().join("full")).unwrap().collect();
        assert_eq!(full.len(), 1);
        let content = fs::read_to_string(full[0].as_ref().unwrap().path()).unwrap();
        assert!(content.contains("line 0"));
        assert!(content.contains("line 499"));

        let parsed: Vec<_> = fs::read_dir(temp.path().join("parsed")).unwrap().collect();
        let parsed_content = fs::read_to_string(parsed[0].as_ref().unwrap().path()).unwrap();
        assert!(parsed_content.contains("[Build] [PHASE] Compile"));
        assert!(!parsed_content.contains("line 0"));
    }

    #[tokio::test]
    async fn test_session_redirects_full_log() {
        let temp = tempfile::tempdir().unwrap();
        let collector = LogCollector::new(temp.path().to_path_buf(), LevelFilter::Off).unwrap();

        let session = collector.start_new_session("build-session.log").unwrap();
        collector.log_str("inside session");
        collector.wait_for_empty().await.unwrap();

        assert_eq!(collector.get_session_log_path(), Some(session.clone()));
        assert!(fs::read_to_string(session).unwrap().contains("inside session"));
    }
}
