//! Static patch analysis and pairwise conflict detection.
//!
//! Analysis only looks at changed lines (`+`/`-`, file headers excluded). It is
//! tuned so that a reported hit is real; misses are tolerated.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use super::validator::ValidatedPatch;
use super::version::{specs_intersect, Version};

/// First release whose V8 tree already carries the corrected include paths.
pub const V8_INCLUDE_FIX_VERSION: Version = Version::new(24, 10, 0);

const SEA_FILES: [&str; 4] = [
    "src/node_sea.cc",
    "src/node_sea.h",
    "lib/sea.js",
    "lib/internal/sea.js",
];

static SEA_MARKER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(?:IsSingleExecutable|isSea|isSingleExecutable)\b").expect("Invalid SEA marker regex")
});

static V8_SRC_INCLUDE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^\s*#\s*include\s+"src/"#).expect("Invalid V8 include regex")
});

static HUNK_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^@@ -\d+(?:,(\d+))? \+\d+(?:,(\d+))? @@").expect("Invalid hunk header regex")
});

/// Lines still owed by the hunk being read, from its `@@` header.
#[derive(Debug, Default, Clone, Copy)]
struct HunkRemaining {
    old: usize,
    new: usize,
}

impl HunkRemaining {
    fn parse(line: &str) -> Option<Self> {
        let caps = HUNK_RE.captures(line)?;
        let count = |i: usize| caps.get(i).map_or(Some(1), |m| m.as_str().parse().ok());
        Some(HunkRemaining {
            old: count(1)?,
            new: count(2)?,
        })
    }

    fn is_open(&self) -> bool {
        self.old > 0 || self.new > 0
    }

    fn consume(&mut self, sign: char) {
        match sign {
            '+' => self.new = self.new.saturating_sub(1),
            '-' => self.old = self.old.saturating_sub(1),
            _ => {
                self.old = self.old.saturating_sub(1);
                self.new = self.new.saturating_sub(1);
            }
        }
    }
}

/// What a patch touches, derived from its diff body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchAnalysis {
    /// Repository-relative paths with at least one changed line
    pub files: BTreeSet<String>,
    /// Changes the single-executable detection accessor
    pub touches_sea_detection: bool,
    /// Rewrites `#include "src/..."` lines under `deps/v8/`
    pub rewrites_v8_includes: bool,
    /// First non-blank added line per file, used to confirm application
    pub first_additions: Vec<(String, String)>,
}

/// Scan a unified diff.
pub fn analyze_patch_content(content: &str) -> PatchAnalysis {
    let mut analysis = PatchAnalysis::default();
    let mut old_path: Option<String> = None;
    let mut current: Option<String> = None;
    let mut recorded_first: BTreeSet<String> = BTreeSet::new();
    let mut hunk = HunkRemaining::default();

    for line in content.lines() {
        if hunk.is_open() {
            // `-- x` inside a hunk is a removed line, not a file header
            let sign = match line.chars().next() {
                Some(c @ ('+' | '-')) => c,
                Some(' ') | None => ' ',
                _ => continue,
            };
            hunk.consume(sign);
            if sign == ' ' {
                continue;
            }
            let body = &line[1..];
            let Some(file) = current.as_ref() else {
                continue;
            };
            record_change(&mut analysis, &mut recorded_first, file, sign, body);
            continue;
        }

        if let Some(rest) = line.strip_prefix("--- ") {
            old_path = strip_diff_prefix(rest);
        } else if let Some(rest) = line.strip_prefix("+++ ") {
            current = strip_diff_prefix(rest).or_else(|| old_path.clone());
        } else if let Some(next) = HunkRemaining::parse(line) {
            hunk = next;
        }
    }

    analysis
}

fn record_change(
    analysis: &mut PatchAnalysis,
    recorded_first: &mut BTreeSet<String>,
    file: &str,
    sign: char,
    body: &str,
) {
    analysis.files.insert(file.to_string());

    if SEA_FILES.contains(&file) || SEA_MARKER_RE.is_match(body) {
        analysis.touches_sea_detection = true;
    }
    if file.starts_with("deps/v8/") && V8_SRC_INCLUDE_RE.is_match(body) {
        analysis.rewrites_v8_includes = true;
    }
    if sign == '+' && !body.trim().is_empty() && recorded_first.insert(file.to_string()) {
        analysis
            .first_additions
            .push((file.to_string(), body.trim_end().to_string()));
    }
}

/// `a/src/x.cc\t2024-01-01` -> `src/x.cc`; `/dev/null` -> None
fn strip_diff_prefix(raw: &str) -> Option<String> {
    let path = raw.split('\t').next().unwrap_or(raw).trim();
    if path == "/dev/null" || path.is_empty() {
        return None;
    }
    let path = path
        .strip_prefix("a/")
        .or_else(|| path.strip_prefix("b/"))
        .unwrap_or(path);
    Some(path.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictSeverity {
    /// Blocks the build before any patch is applied
    Error,
    /// Logged; the build continues
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchConflict {
    pub patch_a: String,
    /// Absent for rules about a single patch
    pub patch_b: Option<String>,
    pub severity: ConflictSeverity,
    pub message: String,
}

impl PatchConflict {
    fn pair(a: &str, b: &str, severity: ConflictSeverity, message: String) -> Self {
        PatchConflict {
            patch_a: a.to_string(),
            patch_b: Some(b.to_string()),
            severity,
            message,
        }
    }

    fn single(a: &str, severity: ConflictSeverity, message: String) -> Self {
        PatchConflict {
            patch_a: a.to_string(),
            patch_b: None,
            severity,
            message,
        }
    }

    pub fn is_error(&self) -> bool {
        match self.severity {
            ConflictSeverity::Error => true,
            ConflictSeverity::Warning => false,
        }
    }
}

impl fmt::Display for PatchConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.severity {
            ConflictSeverity::Error => "ERROR",
            ConflictSeverity::Warning => "WARNING",
        };
        match &self.patch_b {
            Some(b) => write!(f, "[{}] {} <-> {}: {}", level, self.patch_a, b, self.message),
            None => write!(f, "[{}] {}: {}", level, self.patch_a, self.message),
        }
    }
}

/// A `@requires`/`@conflicts` reference names a patch by file name, with or
/// without its extension.
fn refers_to(reference: &str, patch_name: &str) -> bool {
    if reference == patch_name {
        return true;
    }
    let stem = patch_name
        .strip_suffix(".patch")
        .or_else(|| patch_name.strip_suffix(".diff"))
        .unwrap_or(patch_name);
    reference == stem
}

fn mentions(list: &[String], patch_name: &str) -> bool {
    list.iter().any(|r| refers_to(r, patch_name))
}

/// Pairwise conflict rules over the whole validated set.
///
/// The result does not depend on input order: patches are considered sorted
/// by name and each pair is reported once, lower name first.
pub fn check_patch_conflicts(patches: &[ValidatedPatch], target: &Version) -> Vec<PatchConflict> {
    let mut sorted: Vec<&ValidatedPatch> = patches.iter().collect();
    sorted.sort_by(|a, b| a.name.cmp(&b.name));
    sorted.dedup_by(|a, b| a.name == b.name);

    let mut conflicts = Vec::new();

    for patch in &sorted {
        if patch.analysis.rewrites_v8_includes && *target >= V8_INCLUDE_FIX_VERSION {
            conflicts.push(PatchConflict::single(
                &patch.name,
                ConflictSeverity::Error,
                format!(
                    "rewrites deps/v8 include paths, but {} already ships the corrected paths (fixed in {})",
                    target, V8_INCLUDE_FIX_VERSION
                ),
            ));
        }

        for required in &patch.metadata.requires {
            if !sorted.iter().any(|p| refers_to(required, &p.name)) {
                conflicts.push(PatchConflict::single(
                    &patch.name,
                    ConflictSeverity::Error,
                    format!("@requires '{}' which is not in the patch set", required),
                ));
            }
        }
    }

    for (i, a) in sorted.iter().enumerate() {
        for b in sorted.iter().skip(i + 1) {
            let explicit = mentions(&a.metadata.conflicts, &b.name)
                || mentions(&b.metadata.conflicts, &a.name);
            if explicit {
                conflicts.push(PatchConflict::pair(
                    &a.name,
                    &b.name,
                    ConflictSeverity::Error,
                    "declared mutually exclusive via @conflicts".to_string(),
                ));
            }

            let shared_requirement = a
                .metadata
                .requires
                .iter()
                .find(|r| b.metadata.requires.iter().any(|s| s == *r));
            if let Some(required) = shared_requirement {
                if !specs_intersect(&a.metadata.node_versions, &b.metadata.node_versions) {
                    conflicts.push(PatchConflict::pair(
                        &a.name,
                        &b.name,
                        ConflictSeverity::Error,
                        format!(
                            "both require '{}' but their @node-versions ranges never overlap",
                            required
                        ),
                    ));
                }
            }

            let ordered = mentions(&a.metadata.requires, &b.name)
                || mentions(&b.metadata.requires, &a.name);
            let shared_files: Vec<&String> =
                a.analysis.files.intersection(&b.analysis.files).collect();
            if !shared_files.is_empty() && !ordered && !explicit {
                conflicts.push(PatchConflict::pair(
                    &a.name,
                    &b.name,
                    ConflictSeverity::Warning,
                    format!(
                        "both modify {} without an explicit @requires ordering",
                        shared_files
                            .iter()
                            .map(|f| f.as_str())
                            .collect::<Vec<_>>()
                            .join(", ")
                    ),
                ));
            }

            if a.analysis.touches_sea_detection && b.analysis.touches_sea_detection && !explicit {
                conflicts.push(PatchConflict::pair(
                    &a.name,
                    &b.name,
                    ConflictSeverity::Warning,
                    "both change single-executable detection".to_string(),
                ));
            }
        }
    }

    conflicts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::metadata::parse_metadata;
    use std::path::PathBuf;

    fn patch(name: &str, content: &str) -> ValidatedPatch {
        ValidatedPatch {
            name: name.to_string(),
            path: PathBuf::from(name),
            metadata: parse_metadata(content).unwrap(),
            analysis: analyze_patch_content(content),
            content: content.to_string(),
        }
    }

    fn diff(file: &str, added: &str) -> String {
        format!(
            "--- a/{f}\n+++ b/{f}\n@@ -1,1 +1,2 @@\n context\n+{a}\n",
            f = file,
            a = added
        )
    }

    const V24_10: Version = Version::new(24, 10, 0);

    #[test]
    fn test_analysis_collects_files_and_first_addition() {
        let content = format!(
            "{}{}",
            diff("src/node.cc", "int smol = 1;"),
            diff("lib/internal/main.js", "'use strict';")
        );
        let analysis = analyze_patch_content(&content);
        assert_eq!(analysis.files.len(), 2);
        assert!(analysis.files.contains("src/node.cc"));
        assert_eq!(
            analysis.first_additions[0],
            ("src/node.cc".to_string(), "int smol = 1;".to_string())
        );
        assert!(!analysis.touches_sea_detection);
    }

    #[test]
    fn test_dash_lines_inside_hunk_are_changes() {
        let content = "\
--- a/lib/internal/main.lua
+++ b/lib/internal/main.lua
@@ -1,2 +1,2 @@
--- old banner
+++ new banner
 return 1
--- a/src/node.cc
+++ b/src/node.cc
@@ -4 +4,2 @@
 int x;
+int smol = 1;
";
        let analysis = analyze_patch_content(content);
        let files: Vec<_> = analysis.files.iter().map(String::as_str).collect();
        assert_eq!(files, vec!["lib/internal/main.lua", "src/node.cc"]);
        assert_eq!(
            analysis.first_additions,
            vec![
                ("lib/internal/main.lua".to_string(), "++ new banner".to_string()),
                ("src/node.cc".to_string(), "int smol = 1;".to_string()),
            ]
        );
    }

    #[test]
    fn test_sea_detection_by_marker_and_file() {
        let by_marker = analyze_patch_content(&diff("src/node.cc", "if (IsSingleExecutable()) {}"));
        assert!(by_marker.touches_sea_detection);

        let by_file = analyze_patch_content(&diff("lib/sea.js", "module.exports = {};"));
        assert!(by_file.touches_sea_detection);

        // Context lines never count
        let context_only = "--- a/src/node.cc\n+++ b/src/node.cc\n@@ -1,2 +1,3 @@\n IsSingleExecutable();\n+int x;\n";
        assert!(!analyze_patch_content(context_only).touches_sea_detection);
    }

    #[test]
    fn test_v8_include_only_under_deps_v8() {
        let v8 = analyze_patch_content(&diff("deps/v8/src/api/api.cc", "#include \"src/base/macros.h\""));
        assert!(v8.rewrites_v8_includes);

        let elsewhere = analyze_patch_content(&diff("src/api.cc", "#include \"src/base/macros.h\""));
        assert!(!elsewhere.rewrites_v8_includes);
    }

    #[test]
    fn test_mutual_conflicts_reported_once_in_any_order() {
        let a = patch("a.patch", &format!("# @conflicts: b.patch\n{}", diff("x.cc", "1")));
        let b = patch("b.patch", &format!("# @conflicts: a\n{}", diff("y.cc", "2")));

        for set in [vec![a.clone(), b.clone()], vec![b.clone(), a.clone()]] {
            let conflicts = check_patch_conflicts(&set, &V24_10);
            let errors: Vec<_> = conflicts.iter().filter(|c| c.is_error()).collect();
            assert_eq!(errors.len(), 1);
            assert_eq!(errors[0].patch_a, "a.patch");
            assert_eq!(errors[0].patch_b.as_deref(), Some("b.patch"));
        }
    }

    #[test]
    fn test_missing_requirement_is_error() {
        let a = patch("a.patch", &format!("# @requires: base.patch\n{}", diff("x.cc", "1")));
        let conflicts = check_patch_conflicts(&[a], &V24_10);
        assert_eq!(conflicts.len(), 1);
        assert!(conflicts[0].is_error());
        assert!(conflicts[0].message.contains("base.patch"));
    }

    #[test]
    fn test_disjoint_versions_with_shared_requirement() {
        let base = patch("base.patch", &diff("b.cc", "0"));
        let old = patch(
            "old.patch",
            &format!("# @requires: base.patch\n# @node-versions: v22.0.0-v24.9.9\n{}", diff("x.cc", "1")),
        );
        let new = patch(
            "new.patch",
            &format!("# @requires: base.patch\n# @node-versions: v24.10.0+\n{}", diff("y.cc", "2")),
        );
        let conflicts = check_patch_conflicts(&[base, old, new], &V24_10);
        let errors: Vec<_> = conflicts.iter().filter(|c| c.is_error()).collect();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("never overlap"));
    }

    #[test]
    fn test_v8_include_rewrite_blocked_on_fixed_versions() {
        let fix = patch("v8.patch", &diff("deps/v8/src/heap/heap.cc", "#include \"src/heap/heap.h\""));
        assert!(check_patch_conflicts(&[fix.clone()], &V24_10)[0].is_error());
        assert!(check_patch_conflicts(&[fix], &Version::new(24, 9, 0)).is_empty());
    }

    #[test]
    fn test_shared_file_without_ordering_warns() {
        let a = patch("a.patch", &diff("src/node.cc", "1"));
        let b = patch("b.patch", &diff("src/node.cc", "2"));
        let conflicts = check_patch_conflicts(&[a.clone(), b.clone()], &V24_10);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].severity, ConflictSeverity::Warning);

        let ordered = patch("b.patch", &format!("# @requires: a.patch\n{}", diff("src/node.cc", "2")));
        assert!(check_patch_conflicts(&[a, ordered], &V24_10).is_empty());
    }

    #[test]
    fn test_two_sea_patches_warn() {
        let a = patch("a.patch", &diff("src/node_sea.cc", "1"));
        let b = patch("b.patch", &diff("lib/sea.js", "2"));
        let conflicts = check_patch_conflicts(&[a, b], &V24_10);
        assert_eq!(conflicts.len(), 1);
        assert!(conflicts[0].message.contains("single-executable"));
        assert!(!conflicts[0].is_error());
    }
}
