use clap::Parser;
use std::process::ExitCode;

use smol_builder::log_collector::install;
use smol_builder::{BuildConfig, BuildOutcome, CliArgs, LogCollector, Orchestrator};

#[tokio::main]
async fn main() -> ExitCode {
    let args = CliArgs::parse();

    let config = match BuildConfig::from_args(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e.report());
            return ExitCode::FAILURE;
        }
    };

    // =========================================================================
    // LOGGING INITIALIZATION - MUST BE FIRST
    // =========================================================================
    let console_level = if config.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    let log_collector = match LogCollector::new(config.logs_dir(), console_level) {
        Ok(collector) => collector,
        Err(e) => {
            eprintln!("[Main] ERROR: LogCollector initialization failed: {}", e);
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = install(&log_collector) {
        eprintln!("[Main] WARNING: Failed to set LogCollector as global logger: {}", e);
    }
    let session = chrono::Local::now().format("%Y%m%d_%H%M%S_session.log").to_string();
    if let Err(e) = log_collector.start_new_session(&session) {
        eprintln!("[Main] WARNING: Could not start session log: {}", e);
    }

    smol_builder::log_parsed!(
        "smol-builder {} building {} for {}-{} ({})",
        smol_builder::VERSION,
        config.node_version,
        config.platform,
        config.arch,
        config.profile.as_str()
    );

    let orchestrator = Orchestrator::new(config);
    let code = match orchestrator.run().await {
        Ok(BuildOutcome::Cached) => {
            log::info!(target: "parsed", "✓ Nothing to do, outputs are current");
            ExitCode::SUCCESS
        }
        Ok(BuildOutcome::Built { resumed, compressed, final_size }) => {
            log::info!(
                target: "parsed",
                "✓ Build complete: {} bytes{}{}",
                final_size,
                if compressed { ", compressed" } else { "" },
                if resumed { ", resumed from checkpoint" } else { "" }
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            log::error!("{}", e.report());
            if let Some(path) = log_collector.get_session_log_path() {
                eprintln!("Full log: {}", path.display());
            }
            ExitCode::FAILURE
        }
    };

    if let Err(e) = log_collector.wait_for_empty().await {
        eprintln!("[Main] WARNING: Log flush failed: {}", e);
    }
    code
}
