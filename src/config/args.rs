//! Command line flags.

use clap::Parser;
use std::path::PathBuf;

use crate::models::{Arch, Platform};

/// Build a patched, stripped and compressed Node.js runtime from source.
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "smol-builder", version, about)]
pub struct CliArgs {
    /// Discard source checkout, stage copies, checkpoint and caches first
    #[arg(long)]
    pub clean: bool,

    /// Development profile (default outside CI)
    #[arg(long, conflicts_with = "prod")]
    pub dev: bool,

    /// Production profile: enables link-time optimization (implied under CI)
    #[arg(long)]
    pub prod: bool,

    /// Compare installed copies against the final artifact by checksum
    #[arg(long)]
    pub verify: bool,

    /// Run the runtime's smoke test suite against the final binary
    #[arg(long)]
    pub test: bool,

    /// Run the runtime's full test suite against the final binary
    #[arg(long = "test-full")]
    pub test_full: bool,

    /// Answer yes to destructive prompts (source reset)
    #[arg(long, short = 'y')]
    pub yes: bool,

    /// Target platform: linux, darwin, win32
    #[arg(long)]
    pub platform: Option<Platform>,

    /// Target architecture: x64, arm64
    #[arg(long)]
    pub arch: Option<Arch>,

    /// Runtime version tag, e.g. v24.10.0
    #[arg(long = "node-version")]
    pub node_version: Option<String>,

    /// Project root holding patches/, additions/ and smol-build.json
    #[arg(long = "project-root")]
    pub project_root: Option<PathBuf>,

    /// Settings file (default: <project-root>/smol-build.json)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Skip tool and environment preflight checks
    #[arg(long = "skip-checks")]
    pub skip_checks: bool,

    /// Echo debug records to the console
    #[arg(long, short = 'v')]
    pub verbose: bool,
}
