//! Decompression stub prepended to compressed runtime binaries.
//!
//! On launch it reads its own executable, locates the embedded payload,
//! extracts it once into a content-addressed cache directory and then hands
//! control to the extracted binary with the original arguments.

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use smol_builder::postprocess::compress::find_payload;

const CACHE_ENV: &str = "SMOL_STUB_CACHE_DIR";
const METADATA_FILE: &str = ".smol-metadata.json";

#[derive(Debug, Serialize, Deserialize)]
struct ExtractMetadata {
    integrity: String,
    size: u64,
    spec: Option<String>,
}

fn integrity_of(bytes: &[u8]) -> String {
    format!("sha512-{}", hex::encode(Sha512::digest(bytes)))
}

fn cache_root() -> Result<PathBuf> {
    if let Some(dir) = std::env::var_os(CACHE_ENV) {
        return Ok(PathBuf::from(dir));
    }
    dirs::cache_dir()
        .map(|d| d.join("smol"))
        .ok_or_else(|| anyhow!("no cache directory available; set {}", CACHE_ENV))
}

fn binary_name() -> &'static str {
    if cfg!(windows) {
        "node.exe"
    } else {
        "node"
    }
}

/// Extracted binary that still matches its recorded integrity.
fn cached_binary(dir: &Path) -> Option<PathBuf> {
    let binary = dir.join(binary_name());
    let raw = fs::read_to_string(dir.join(METADATA_FILE)).ok()?;
    let metadata: ExtractMetadata = serde_json::from_str(&raw).ok()?;
    let bytes = fs::read(&binary).ok()?;
    if bytes.len() as u64 == metadata.size && integrity_of(&bytes) == metadata.integrity {
        Some(binary)
    } else {
        None
    }
}

fn extract_to(dir: &Path, binary: &[u8], spec: Option<String>) -> Result<PathBuf> {
    fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    let target = dir.join(binary_name());
    let staging = dir.join(format!(".{}.{}.tmp", binary_name(), std::process::id()));
    fs::write(&staging, binary).with_context(|| format!("writing {}", staging.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&staging, fs::Permissions::from_mode(0o755))?;
    }
    fs::rename(&staging, &target).with_context(|| format!("installing {}", target.display()))?;

    let metadata = ExtractMetadata {
        integrity: integrity_of(binary),
        size: binary.len() as u64,
        spec,
    };
    fs::write(dir.join(METADATA_FILE), serde_json::to_string_pretty(&metadata)?)?;
    Ok(target)
}

fn prepare() -> Result<PathBuf> {
    let me = std::env::current_exe().context("locating own executable")?;
    let bytes = fs::read(&me).with_context(|| format!("reading {}", me.display()))?;
    let payload = find_payload(&bytes).with_context(|| format!("{} has no embedded runtime", me.display()))?;

    let key = hex::encode(Sha256::digest(payload.data));
    let dir = cache_root()?.join(key);
    if let Some(binary) = cached_binary(&dir) {
        return Ok(binary);
    }

    let binary = payload.decompress().context("decompressing embedded runtime")?;
    extract_to(&dir, &binary, payload.spec.clone())
}

#[cfg(unix)]
fn launch(binary: &Path) -> Result<i32> {
    use std::os::unix::process::CommandExt;
    let err = Command::new(binary).args(std::env::args_os().skip(1)).exec();
    bail!("exec {} failed: {}", binary.display(), err)
}

#[cfg(not(unix))]
fn launch(binary: &Path) -> Result<i32> {
    let status = Command::new(binary)
        .args(std::env::args_os().skip(1))
        .status()
        .with_context(|| format!("running {}", binary.display()))?;
    Ok(status.code().unwrap_or(1))
}

fn main() {
    let code = match prepare().and_then(|binary| launch(&binary)) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("smol-stub: {:#}", e);
            1
        }
    };
    std::process::exit(code);
}
