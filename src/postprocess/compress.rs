//! Self-extracting compressed binary format.
//!
//! ```text
//! [stub executable][\nSMOL_SPEC:<spec>\n]?[header: 24 bytes LE][payload]
//! header = magic u32 | algorithm u32 | original_size u64 | compressed_size u64
//! ```
//!
//! The stub finds its payload by scanning its own bytes for a known magic
//! whose header accounts for exactly the bytes that follow. One codec per
//! target platform, all from the DEFLATE family.

use flate2::read::{DeflateDecoder, GzDecoder, ZlibDecoder};
use flate2::write::{DeflateEncoder, GzEncoder, ZlibEncoder};
use flate2::Compression;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::models::{Arch, Platform};

pub const HEADER_LEN: usize = 24;

/// "SELF"
pub const MAGIC_LINUX: u32 = 0x5345_4C46;
/// "SCMP"
pub const MAGIC_DARWIN: u32 = 0x504D_4353;
/// "SEPE"
pub const MAGIC_WIN32: u32 = 0x5345_5045;

const MAGICS: [u32; 3] = [MAGIC_LINUX, MAGIC_DARWIN, MAGIC_WIN32];

const SPEC_PREFIX: &[u8] = b"\nSMOL_SPEC:";
/// Longest spec string searched for before a header.
const MAX_SPEC_LEN: usize = 1024;

#[derive(Debug, Error)]
pub enum FormatError {
    #[error("no compressed payload found")]
    NoPayload,

    #[error("unknown compression algorithm id {0}")]
    UnknownAlgorithm(u32),

    #[error("decompressed size {actual} does not match header ({expected})")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("payload is corrupt: {0}")]
    Corrupt(std::io::Error),

    #[error("input is not a {platform} executable: {reason}")]
    NotExecutable { platform: Platform, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Codec identifiers as stored in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    RawDeflate = 1,
    Zlib = 2,
    Gzip = 3,
}

impl Algorithm {
    pub fn id(&self) -> u32 {
        *self as u32
    }

    pub fn from_id(id: u32) -> Option<Self> {
        match id {
            1 => Some(Algorithm::RawDeflate),
            2 => Some(Algorithm::Zlib),
            3 => Some(Algorithm::Gzip),
            _ => None,
        }
    }

    pub fn for_platform(platform: Platform) -> Self {
        match platform {
            Platform::Linux => Algorithm::RawDeflate,
            Platform::Darwin => Algorithm::Zlib,
            Platform::Win32 => Algorithm::Gzip,
        }
    }
}

pub fn magic_for(platform: Platform) -> u32 {
    match platform {
        Platform::Linux => MAGIC_LINUX,
        Platform::Darwin => MAGIC_DARWIN,
        Platform::Win32 => MAGIC_WIN32,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadHeader {
    pub magic: u32,
    pub algorithm: u32,
    pub original_size: u64,
    pub compressed_size: u64,
}

impl PayloadHeader {
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..4].copy_from_slice(&self.magic.to_le_bytes());
        out[4..8].copy_from_slice(&self.algorithm.to_le_bytes());
        out[8..16].copy_from_slice(&self.original_size.to_le_bytes());
        out[16..24].copy_from_slice(&self.compressed_size.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < HEADER_LEN {
            return None;
        }
        let u32_at = |i: usize| u32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
        let u64_at = |i: usize| {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&bytes[i..i + 8]);
            u64::from_le_bytes(buf)
        };
        Some(PayloadHeader {
            magic: u32_at(0),
            algorithm: u32_at(4),
            original_size: u64_at(8),
            compressed_size: u64_at(16),
        })
    }
}

/// Compress `data` with the best ratio the codec offers.
pub fn compress(data: &[u8], algorithm: Algorithm) -> std::io::Result<Vec<u8>> {
    let level = Compression::best();
    match algorithm {
        Algorithm::RawDeflate => {
            let mut enc = DeflateEncoder::new(Vec::new(), level);
            enc.write_all(data)?;
            enc.finish()
        }
        Algorithm::Zlib => {
            let mut enc = ZlibEncoder::new(Vec::new(), level);
            enc.write_all(data)?;
            enc.finish()
        }
        Algorithm::Gzip => {
            let mut enc = GzEncoder::new(Vec::new(), level);
            enc.write_all(data)?;
            enc.finish()
        }
    }
}

pub fn decompress(data: &[u8], algorithm: Algorithm, expected_size: u64) -> Result<Vec<u8>, FormatError> {
    // Cap the preallocation so a forged header cannot request huge buffers
    let mut out = Vec::with_capacity(expected_size.min(512 * 1024 * 1024) as usize);
    match algorithm {
        Algorithm::RawDeflate => DeflateDecoder::new(data).read_to_end(&mut out),
        Algorithm::Zlib => ZlibDecoder::new(data).read_to_end(&mut out),
        Algorithm::Gzip => GzDecoder::new(data).read_to_end(&mut out),
    }
    .map_err(FormatError::Corrupt)?;
    if out.len() as u64 != expected_size {
        return Err(FormatError::SizeMismatch {
            expected: expected_size,
            actual: out.len() as u64,
        });
    }
    Ok(out)
}

/// Stub ++ optional spec line ++ header ++ compressed `binary`.
pub fn build_artifact(
    stub: &[u8],
    binary: &[u8],
    platform: Platform,
    spec: Option<&str>,
) -> std::io::Result<Vec<u8>> {
    let algorithm = Algorithm::for_platform(platform);
    let payload = compress(binary, algorithm)?;
    let header = PayloadHeader {
        magic: magic_for(platform),
        algorithm: algorithm.id(),
        original_size: binary.len() as u64,
        compressed_size: payload.len() as u64,
    };

    let mut out = Vec::with_capacity(stub.len() + HEADER_LEN + payload.len() + 64);
    out.extend_from_slice(stub);
    if let Some(spec) = spec {
        out.extend_from_slice(SPEC_PREFIX);
        out.extend_from_slice(spec.as_bytes());
        out.push(b'\n');
    }
    out.extend_from_slice(&header.to_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// A payload located inside an artifact.
#[derive(Debug)]
pub struct LocatedPayload<'a> {
    pub header: PayloadHeader,
    /// Offset of the header within the artifact
    pub offset: usize,
    pub data: &'a [u8],
    pub spec: Option<String>,
}

impl LocatedPayload<'_> {
    pub fn algorithm(&self) -> Result<Algorithm, FormatError> {
        Algorithm::from_id(self.header.algorithm)
            .ok_or(FormatError::UnknownAlgorithm(self.header.algorithm))
    }

    pub fn decompress(&self) -> Result<Vec<u8>, FormatError> {
        decompress(self.data, self.algorithm()?, self.header.original_size)
    }
}

/// Find the header whose `compressed_size` covers exactly the trailing bytes.
pub fn find_payload(bytes: &[u8]) -> Result<LocatedPayload<'_>, FormatError> {
    if bytes.len() < HEADER_LEN {
        return Err(FormatError::NoPayload);
    }
    let patterns: Vec<[u8; 4]> = MAGICS.iter().map(|m| m.to_le_bytes()).collect();

    for offset in 0..=(bytes.len() - HEADER_LEN) {
        let window = &bytes[offset..offset + 4];
        if !patterns.iter().any(|p| p == window) {
            continue;
        }
        let Some(header) = PayloadHeader::from_bytes(&bytes[offset..]) else {
            continue;
        };
        let remaining = (bytes.len() - offset - HEADER_LEN) as u64;
        if header.compressed_size != remaining || Algorithm::from_id(header.algorithm).is_none() {
            continue;
        }
        return Ok(LocatedPayload {
            header,
            offset,
            data: &bytes[offset + HEADER_LEN..],
            spec: read_spec(&bytes[..offset]),
        });
    }
    Err(FormatError::NoPayload)
}

fn read_spec(prefix: &[u8]) -> Option<String> {
    let body = prefix.strip_suffix(b"\n")?;
    let window_start = body.len().saturating_sub(MAX_SPEC_LEN + SPEC_PREFIX.len());
    let window = &body[window_start..];
    let start = window
        .windows(SPEC_PREFIX.len())
        .rposition(|w| w == SPEC_PREFIX)?;
    let spec = &window[start + SPEC_PREFIX.len()..];
    if spec.contains(&b'\n') {
        return None;
    }
    String::from_utf8(spec.to_vec()).ok()
}

/// Decompress the binary embedded in `artifact`.
pub fn extract(artifact: &[u8]) -> Result<Vec<u8>, FormatError> {
    find_payload(artifact)?.decompress()
}

/// Sizes before and after compression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionStats {
    pub original_size: u64,
    pub artifact_size: u64,
}

impl CompressionStats {
    /// Percentage saved relative to the input binary.
    pub fn savings_percent(&self) -> f64 {
        if self.original_size == 0 {
            return 0.0;
        }
        100.0 * (1.0 - self.artifact_size as f64 / self.original_size as f64)
    }
}

const MACHO_MAGICS: [[u8; 4]; 5] = [
    [0xcf, 0xfa, 0xed, 0xfe], // MH_MAGIC_64, little endian
    [0xce, 0xfa, 0xed, 0xfe], // MH_MAGIC
    [0xfe, 0xed, 0xfa, 0xcf], // MH_CIGAM_64
    [0xfe, 0xed, 0xfa, 0xce], // MH_CIGAM
    [0xca, 0xfe, 0xba, 0xbe], // universal
];

/// Check that `data` starts like an executable for `platform`: ELF on Linux,
/// Mach-O on macOS, and a DOS stub pointing at a `PE\0\0` header on Windows.
pub fn check_executable_format(data: &[u8], platform: Platform) -> Result<(), FormatError> {
    let reject = |reason: &str| {
        Err(FormatError::NotExecutable {
            platform,
            reason: reason.to_string(),
        })
    };
    match platform {
        Platform::Linux => {
            if !data.starts_with(b"\x7fELF") {
                return reject("missing ELF magic");
            }
        }
        Platform::Darwin => {
            if !MACHO_MAGICS.iter().any(|m| data.starts_with(m)) {
                return reject("missing Mach-O magic");
            }
        }
        Platform::Win32 => {
            if data.len() < 0x40 || !data.starts_with(b"MZ") {
                return reject("missing DOS header");
            }
            let pe_offset =
                u32::from_le_bytes([data[0x3c], data[0x3d], data[0x3e], data[0x3f]]) as usize;
            match data.get(pe_offset..pe_offset.saturating_add(4)) {
                Some(sig) if sig == b"PE\0\0" => {}
                _ => return reject("missing PE signature"),
            }
        }
    }
    Ok(())
}

/// Compress the file at `input` into a self-extracting artifact at `output`.
///
/// The input must be an executable of the target platform's format.
pub fn compress_file(
    stub: &Path,
    input: &Path,
    output: &Path,
    platform: Platform,
    spec: Option<&str>,
) -> Result<CompressionStats, FormatError> {
    let stub_bytes = std::fs::read(stub)?;
    let binary = std::fs::read(input)?;
    check_executable_format(&binary, platform)?;
    let artifact = build_artifact(&stub_bytes, &binary, platform, spec)?;
    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(output, &artifact)?;
    Ok(CompressionStats {
        original_size: binary.len() as u64,
        artifact_size: artifact.len() as u64,
    })
}

/// Tag written into the artifact's spec line.
pub fn spec_string(version: &str, platform: Platform, arch: Arch) -> String {
    format!("node@{}:{}-{}", version, platform, arch)
}

/// Stub executable for the target, if one can be found.
///
/// An explicit path always wins. Otherwise the `smol-stub` shipped next to
/// the running builder is used, but only for host-native targets.
pub fn locate_stub(explicit: Option<&Path>, platform: Platform, arch: Arch) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return path.is_file().then(|| path.to_path_buf());
    }
    if platform != Platform::host() || arch != Arch::host() {
        return None;
    }
    let name = if platform == Platform::Win32 {
        "smol-stub.exe"
    } else {
        "smol-stub"
    };
    let exe = std::env::current_exe().ok()?;
    let dir = exe.parent()?;
    // Test binaries live one level below the target dir in `deps/`
    [dir.join(name), dir.parent()?.join(name)]
        .into_iter()
        .find(|p| p.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_binary() -> Vec<u8> {
        let mut data = Vec::new();
        for i in 0..4096u32 {
            data.extend_from_slice(b"\x7fELF node runtime section ");
            data.extend_from_slice(&(i % 17).to_le_bytes());
        }
        data
    }

    #[test]
    fn test_header_layout() {
        let header = PayloadHeader {
            magic: MAGIC_LINUX,
            algorithm: 1,
            original_size: 0x0102,
            compressed_size: 0x0304,
        };
        let bytes = header.to_bytes();
        assert_eq!(&bytes[0..4], &[0x46, 0x4C, 0x45, 0x53]);
        assert_eq!(&bytes[4..8], &[1, 0, 0, 0]);
        assert_eq!(&bytes[8..10], &[0x02, 0x01]);
        assert_eq!(&bytes[16..18], &[0x04, 0x03]);
        assert_eq!(PayloadHeader::from_bytes(&bytes), Some(header));
    }

    #[test]
    fn test_platform_codecs_are_fixed() {
        assert_eq!(Algorithm::for_platform(Platform::Linux), Algorithm::RawDeflate);
        assert_eq!(Algorithm::for_platform(Platform::Darwin), Algorithm::Zlib);
        assert_eq!(Algorithm::for_platform(Platform::Win32), Algorithm::Gzip);
        assert_eq!(magic_for(Platform::Darwin), MAGIC_DARWIN);
    }

    #[test]
    fn test_artifact_with_spec_line() {
        let stub = b"#!stub-bytes\x00\x01".to_vec();
        let binary = sample_binary();
        for platform in [Platform::Linux, Platform::Darwin, Platform::Win32] {
            let spec = spec_string("v24.10.0", platform, Arch::X64);
            let artifact = build_artifact(&stub, &binary, platform, Some(&spec)).unwrap();
            assert!(artifact.len() < binary.len());

            let located = find_payload(&artifact).unwrap();
            assert_eq!(located.header.magic, magic_for(platform));
            assert_eq!(located.spec.as_deref(), Some(spec.as_str()));
            assert_eq!(located.decompress().unwrap(), binary);
        }
    }

    #[test]
    fn test_stub_containing_magic_is_skipped() {
        let mut stub = b"stub".to_vec();
        stub.extend_from_slice(&MAGIC_LINUX.to_le_bytes());
        stub.extend_from_slice(&[0u8; 40]);
        let binary = sample_binary();
        let artifact = build_artifact(&stub, &binary, Platform::Linux, None).unwrap();

        let located = find_payload(&artifact).unwrap();
        assert_eq!(located.offset, stub.len());
        assert!(located.spec.is_none());
        assert_eq!(extract(&artifact).unwrap(), binary);
    }

    #[test]
    fn test_truncated_artifact_has_no_payload() {
        let artifact = build_artifact(b"stub", &sample_binary(), Platform::Linux, None).unwrap();
        let truncated = &artifact[..artifact.len() - 10];
        assert!(matches!(find_payload(truncated), Err(FormatError::NoPayload)));
        assert!(matches!(find_payload(b"tiny"), Err(FormatError::NoPayload)));
    }

    #[test]
    fn test_forged_size_is_rejected() {
        let mut artifact = build_artifact(b"stub", &sample_binary(), Platform::Darwin, None).unwrap();
        // Bump original_size in the header
        artifact[4 + 8] ^= 0x01;
        assert!(matches!(extract(&artifact), Err(FormatError::SizeMismatch { .. })));
    }

    #[test]
    fn test_compress_file_stats() {
        let temp = tempfile::tempdir().unwrap();
        let stub = temp.path().join("stub");
        let input = temp.path().join("node");
        std::fs::write(&stub, b"stub").unwrap();
        std::fs::write(&input, sample_binary()).unwrap();

        let output = temp.path().join("out/Compressed/node");
        let stats = compress_file(&stub, &input, &output, Platform::Linux, None).unwrap();
        assert!(stats.savings_percent() > 50.0);
        assert_eq!(std::fs::metadata(&output).unwrap().len(), stats.artifact_size);
    }

    fn pe_image() -> Vec<u8> {
        let mut data = vec![0u8; 0x80];
        data[..2].copy_from_slice(b"MZ");
        data[0x3c..0x40].copy_from_slice(&0x40u32.to_le_bytes());
        data[0x40..0x44].copy_from_slice(b"PE\0\0");
        data
    }

    #[test]
    fn test_executable_formats_per_platform() {
        let elf = sample_binary();
        let macho = [0xcf, 0xfa, 0xed, 0xfe, 7, 0, 0, 1];
        let pe = pe_image();

        assert!(check_executable_format(&elf, Platform::Linux).is_ok());
        assert!(check_executable_format(&macho, Platform::Darwin).is_ok());
        assert!(check_executable_format(&[0xca, 0xfe, 0xba, 0xbe], Platform::Darwin).is_ok());
        assert!(check_executable_format(&pe, Platform::Win32).is_ok());

        assert!(check_executable_format(&macho, Platform::Linux).is_err());
        assert!(check_executable_format(&elf, Platform::Darwin).is_err());
        assert!(check_executable_format(&elf, Platform::Win32).is_err());
        assert!(check_executable_format(b"", Platform::Linux).is_err());
    }

    #[test]
    fn test_dos_header_without_pe_signature_is_rejected() {
        let mut pe = pe_image();
        pe[0x40..0x44].copy_from_slice(b"XX\0\0");
        assert!(check_executable_format(&pe, Platform::Win32).is_err());

        let mut pe = pe_image();
        pe[0x3c..0x40].copy_from_slice(&u32::MAX.to_le_bytes());
        assert!(check_executable_format(&pe, Platform::Win32).is_err());
        assert!(check_executable_format(b"MZ", Platform::Win32).is_err());
    }

    #[test]
    fn test_compress_file_refuses_script() {
        let temp = tempfile::tempdir().unwrap();
        let stub = temp.path().join("stub");
        let input = temp.path().join("node");
        std::fs::write(&stub, b"stub").unwrap();
        std::fs::write(&input, b"#!/bin/sh\necho v24.10.0\n").unwrap();

        let output = temp.path().join("out/Compressed/node");
        let err = compress_file(&stub, &input, &output, Platform::Linux, None).unwrap_err();
        assert!(matches!(err, FormatError::NotExecutable { platform: Platform::Linux, .. }));
        assert!(!output.exists());
    }

    #[test]
    fn test_explicit_stub_must_exist() {
        let temp = tempfile::tempdir().unwrap();
        let missing = temp.path().join("smol-stub");
        assert!(locate_stub(Some(&missing), Platform::host(), Arch::host()).is_none());
        std::fs::write(&missing, b"stub").unwrap();
        assert_eq!(
            locate_stub(Some(&missing), Platform::host(), Arch::host()),
            Some(missing)
        );
    }
}
