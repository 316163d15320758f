//! Patch integrity and version validation.
//!
//! Checks run against file contents only; nothing here touches the source
//! tree. Every check fails closed.

use once_cell::sync::Lazy;
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};

use super::conflicts::{analyze_patch_content, PatchAnalysis};
use super::metadata::{parse_metadata, PatchMetadata};
use super::version::Version;
use crate::error::{BuildError, Result};

static HUNK_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^@@ -\d+(?:,\d+)? \+\d+(?:,\d+)? @@").expect("Invalid hunk marker regex")
});

static HTML_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)<\s*(?:!doctype\s+html|html|head|body)[\s>]").expect("Invalid HTML tag regex")
});

/// A patch that passed integrity, metadata and version checks.
#[derive(Debug, Clone)]
pub struct ValidatedPatch {
    /// File name, used as the patch identity
    pub name: String,
    pub path: PathBuf,
    pub content: String,
    pub metadata: PatchMetadata,
    pub analysis: PatchAnalysis,
}

/// Integrity checks on raw patch text, in order: non-empty, not an HTML error
/// page, at least one unified-diff hunk.
pub fn check_patch_content(content: &str) -> std::result::Result<(), String> {
    if content.trim().is_empty() {
        return Err("patch file is empty".to_string());
    }
    let has_hunk = HUNK_RE.is_match(content);
    if !has_hunk && HTML_RE.is_match(content) {
        return Err("file is an HTML page, not a diff (failed download?)".to_string());
    }
    if !has_hunk {
        return Err("no unified-diff hunk marker (@@ -a,b +c,d @@) found".to_string());
    }
    Ok(())
}

/// Whether the file at `path` looks like a usable unified diff.
pub fn validate_patch_file(path: &Path) -> bool {
    match fs::read_to_string(path) {
        Ok(content) => check_patch_content(&content).is_ok(),
        Err(_) => false,
    }
}

/// Integrity, metadata and version compatibility for one patch.
pub fn validate_patch(path: &Path, target: &Version) -> Result<ValidatedPatch> {
    let name = patch_name(path);
    let invalid = |reason: String| BuildError::PatchValidation {
        patch: name.clone(),
        reason,
    };

    let content = fs::read_to_string(path)
        .map_err(|e| invalid(format!("cannot read {}: {}", path.display(), e)))?;
    check_patch_content(&content).map_err(invalid)?;

    let metadata = parse_metadata(&content).map_err(invalid)?;
    if metadata.is_unversioned() {
        log::warn!(
            "[Patch] [VALIDATE] {} has no @node-versions directive; assuming it applies to every version",
            name
        );
    } else if !metadata.supports(target) {
        let specs: Vec<String> = metadata.node_versions.iter().map(|s| s.to_string()).collect();
        return Err(invalid(format!(
            "not compatible with {} (@node-versions: {})",
            target,
            specs.join(", ")
        )));
    }

    let analysis = analyze_patch_content(&content);
    log::debug!(
        "[Patch] [VALIDATE] {} ok: {} file(s){}",
        name,
        analysis.files.len(),
        metadata
            .description
            .as_ref()
            .map(|d| format!(" ({})", d))
            .unwrap_or_default()
    );

    Ok(ValidatedPatch {
        name,
        path: path.to_path_buf(),
        content,
        metadata,
        analysis,
    })
}

/// Validate every patch before reporting. Each failure is logged; the first
/// one is returned with a count of the rest.
pub fn validate_all(paths: &[PathBuf], target: &Version) -> Result<Vec<ValidatedPatch>> {
    let mut validated = Vec::with_capacity(paths.len());
    let mut failures = Vec::new();

    for path in paths {
        match validate_patch(path, target) {
            Ok(patch) => validated.push(patch),
            Err(e) => {
                log::error!("[Patch] [VALIDATE] {}", e);
                failures.push(e);
            }
        }
    }

    let extra = failures.len().saturating_sub(1);
    match failures.into_iter().next() {
        None => Ok(validated),
        Some(BuildError::PatchValidation { patch, reason }) if extra > 0 => {
            Err(BuildError::PatchValidation {
                patch,
                reason: format!("{} (and {} more invalid patch(es))", reason, extra),
            })
        }
        Some(first) => Err(first),
    }
}

/// Confirm a patch left its mark: `expected_line` must appear in `file_path`.
pub fn validate_patch_application(file_path: &Path, expected_line: &str) -> Result<()> {
    let content = fs::read_to_string(file_path).map_err(|e| BuildError::PatchApplication {
        patch: file_path.display().to_string(),
        reason: format!("cannot read patched file: {}", e),
    })?;
    let wanted = expected_line.trim();
    if content.lines().any(|l| l.trim() == wanted) {
        Ok(())
    } else {
        Err(BuildError::PatchApplication {
            patch: file_path.display().to_string(),
            reason: format!("expected line not present after patching: {}", wanted),
        })
    }
}

pub fn patch_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const GOOD: &str = "\
# @node-versions: v24.0.0+
--- a/src/node.cc
+++ b/src/node.cc
@@ -1,3 +1,4 @@
 #include \"node.h\"
+#include \"smol.h\"
";

    fn write(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_integrity_checks() {
        assert!(check_patch_content("").is_err());
        assert!(check_patch_content("   \n").is_err());
        assert!(check_patch_content("<!DOCTYPE html><html><body>404</body></html>")
            .unwrap_err()
            .contains("HTML"));
        assert!(check_patch_content("--- a/x\n+++ b/x\n+no hunk\n").is_err());
        assert!(check_patch_content(GOOD).is_ok());
        assert!(check_patch_content("@@ -1 +1 @@\n-a\n+b\n").is_ok());
    }

    #[test]
    fn test_html_inside_a_real_diff_is_fine() {
        let content = "--- a/doc.html\n+++ b/doc.html\n@@ -1,1 +1,1 @@\n-<html>\n+<html lang=\"en\">\n";
        assert!(check_patch_content(content).is_ok());
    }

    #[test]
    fn test_validate_patch_file() {
        let temp = TempDir::new().unwrap();
        assert!(validate_patch_file(&write(temp.path(), "ok.patch", GOOD)));
        assert!(!validate_patch_file(&write(temp.path(), "empty.patch", "")));
        assert!(!validate_patch_file(&temp.path().join("missing.patch")));
    }

    #[test]
    fn test_version_excluded_fails() {
        let temp = TempDir::new().unwrap();
        let path = write(temp.path(), "old.patch", &GOOD.replace("v24.0.0+", "v20.0.0-v22.99.99"));
        let err = validate_patch(&path, &Version::new(24, 10, 0)).unwrap_err();
        match err {
            BuildError::PatchValidation { patch, reason } => {
                assert_eq!(patch, "old.patch");
                assert!(reason.contains("not compatible"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_validate_patch_success() {
        let temp = TempDir::new().unwrap();
        let path = write(temp.path(), "001-smol.patch", GOOD);
        let patch = validate_patch(&path, &Version::new(24, 10, 0)).unwrap();
        assert_eq!(patch.name, "001-smol.patch");
        assert!(patch.analysis.files.contains("src/node.cc"));
    }

    #[test]
    fn test_validate_all_reports_every_failure() {
        let temp = TempDir::new().unwrap();
        let paths = vec![
            write(temp.path(), "a.patch", GOOD),
            write(temp.path(), "b.patch", ""),
            write(temp.path(), "c.patch", "<html><body>rate limited</body></html>"),
        ];
        let err = validate_all(&paths, &Version::new(24, 10, 0)).unwrap_err();
        assert!(err.to_string().contains("b.patch"));
        assert!(err.to_string().contains("1 more"));
    }

    #[test]
    fn test_validate_patch_application() {
        let temp = TempDir::new().unwrap();
        let file = write(temp.path(), "node.cc", "#include \"node.h\"\n  #include \"smol.h\"\n");
        assert!(validate_patch_application(&file, "#include \"smol.h\"").is_ok());
        assert!(validate_patch_application(&file, "int missing;").is_err());
    }
}
