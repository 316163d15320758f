//! Patch header metadata.
//!
//! Directives live in comment lines before the first diff line:
//!
//! ```text
//! # @node-versions: v24.0.0-v24.9.9, v25.0.0+
//! # @description: Teach the SEA loader about compressed payloads
//! # @requires: 001-sea-base.patch
//! # @conflicts: 004-legacy-sea.patch
//! ```
//!
//! Accepted comment prefixes are `#`, `//`, `/*` and ` *`.

use once_cell::sync::Lazy;
use regex::Regex;

use super::version::{Version, VersionSpec};

static DIRECTIVE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(?:#|//|/\*|\*)\s*@([A-Za-z][\w-]*)\s*:?\s*(.*?)\s*(?:\*/)?\s*$")
        .expect("directive regex is valid")
});

/// Parsed header of one patch file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchMetadata {
    /// Empty means compatible with every version
    pub node_versions: Vec<VersionSpec>,
    pub description: Option<String>,
    pub requires: Vec<String>,
    pub conflicts: Vec<String>,
}

impl PatchMetadata {
    /// No `@node-versions` directive: applies everywhere, which is a risk signal.
    pub fn is_unversioned(&self) -> bool {
        self.node_versions.is_empty()
    }

    pub fn supports(&self, version: &Version) -> bool {
        self.is_unversioned() || self.node_versions.iter().any(|s| s.matches(version))
    }
}

/// Whether `line` starts the diff body.
pub fn is_diff_line(line: &str) -> bool {
    line.starts_with("diff ")
        || line.starts_with("--- ")
        || line.starts_with("+++ ")
        || line.starts_with("@@ ")
        || line.starts_with("Index: ")
}

/// Extract directives from the comment header of `content`.
///
/// Unknown directive names are ignored. An unparseable version specifier is
/// an error.
pub fn parse_metadata(content: &str) -> Result<PatchMetadata, String> {
    let mut meta = PatchMetadata::default();

    for line in content.lines() {
        if is_diff_line(line) {
            break;
        }
        let Some(caps) = DIRECTIVE_RE.captures(line) else {
            continue;
        };
        let key = caps[1].to_lowercase();
        let value = caps[2].trim();

        match key.as_str() {
            "node-versions" | "node-version" => {
                for spec in split_list(value) {
                    meta.node_versions.push(VersionSpec::parse(spec)?);
                }
            }
            "description" => {
                if !value.is_empty() {
                    meta.description = Some(value.to_string());
                }
            }
            "requires" => meta.requires.extend(split_list(value).map(String::from)),
            "conflicts" => meta.conflicts.extend(split_list(value).map(String::from)),
            _ => {}
        }
    }

    Ok(meta)
}

fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|s| !s.is_empty())
}
