//! Runtime version tags and patch version specifiers.
//!
//! A specifier is one of:
//! - `v24.10.0`          exact
//! - `v24.0.0-v24.9.9`   inclusive range
//! - `v24.10.0+`         that version and everything after it

use std::fmt;
use std::str::FromStr;

/// A `vMAJOR.MINOR.PATCH` release tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl Version {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Version {
            major,
            minor,
            patch,
        }
    }

    /// Parse `v24.10.0` or `24.10.0`. Pre-release suffixes are rejected.
    pub fn parse(s: &str) -> Result<Self, String> {
        let body = s.trim().trim_start_matches('v');
        let parts: Vec<&str> = body.split('.').collect();
        if parts.len() != 3 {
            return Err(format!("expected vMAJOR.MINOR.PATCH, got '{}'", s));
        }
        let num = |p: &str| {
            p.parse::<u32>()
                .map_err(|_| format!("'{}' is not a number in version '{}'", p, s))
        };
        Ok(Version::new(num(parts[0])?, num(parts[1])?, num(parts[2])?))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for Version {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Version::parse(s)
    }
}

/// One entry of a `@node-versions` directive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionSpec {
    Exact(Version),
    Range(Version, Version),
    AtLeast(Version),
}

impl VersionSpec {
    pub fn parse(s: &str) -> Result<Self, String> {
        let s = s.trim();
        if let Some(base) = s.strip_suffix('+') {
            return Ok(VersionSpec::AtLeast(Version::parse(base)?));
        }
        // `v24.0.0-v24.9.9`: split on the dash that starts the second tag
        if let Some(idx) = s.find("-v") {
            let low = Version::parse(&s[..idx])?;
            let high = Version::parse(&s[idx + 1..])?;
            if low > high {
                return Err(format!("range '{}' is inverted", s));
            }
            return Ok(VersionSpec::Range(low, high));
        }
        if !s.starts_with('v') {
            return Err(format!("unknown version specifier '{}'", s));
        }
        Ok(VersionSpec::Exact(Version::parse(s)?))
    }

    pub fn matches(&self, version: &Version) -> bool {
        match self {
            VersionSpec::Exact(v) => v == version,
            VersionSpec::Range(low, high) => low <= version && version <= high,
            VersionSpec::AtLeast(low) => low <= version,
        }
    }

    /// Closed interval; `None` as the upper bound means unbounded.
    fn bounds(&self) -> (Version, Option<Version>) {
        match self {
            VersionSpec::Exact(v) => (*v, Some(*v)),
            VersionSpec::Range(low, high) => (*low, Some(*high)),
            VersionSpec::AtLeast(low) => (*low, None),
        }
    }

    /// Whether some version satisfies both specifiers.
    pub fn overlaps(&self, other: &VersionSpec) -> bool {
        let (a_low, a_high) = self.bounds();
        let (b_low, b_high) = other.bounds();
        let low = a_low.max(b_low);
        match (a_high, b_high) {
            (Some(a), Some(b)) => low <= a.min(b),
            (Some(a), None) => low <= a,
            (None, Some(b)) => low <= b,
            (None, None) => true,
        }
    }
}

impl fmt::Display for VersionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionSpec::Exact(v) => write!(f, "{}", v),
            VersionSpec::Range(low, high) => write!(f, "{}-{}", low, high),
            VersionSpec::AtLeast(v) => write!(f, "{}+", v),
        }
    }
}

/// Whether two `@node-versions` lists admit a common version.
///
/// An empty list means "all versions".
pub fn specs_intersect(a: &[VersionSpec], b: &[VersionSpec]) -> bool {
    if a.is_empty() || b.is_empty() {
        return true;
    }
    a.iter().any(|x| b.iter().any(|y| x.overlaps(y)))
}
