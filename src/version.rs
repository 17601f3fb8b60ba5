//! Semantic version values for extensions and the server.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use crate::error::CoordinatorError;

/// Component at which two versions are compared or found to differ.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum VersionType {
    Patch,
    Minor,
    Major,
}

/// Most significant component in which two versions differ.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionDiff {
    None,
    Patch,
    Minor,
    Major,
}

impl VersionDiff {
    pub fn is_minor_or_major(&self) -> bool {
        matches!(self, VersionDiff::Minor | VersionDiff::Major)
    }
}

/// `major.minor.patch` with an optional suffix that takes no part in
/// ordering or equality.
#[derive(Debug, Clone)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    suffix: Option<String>,
}

impl Version {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
            suffix: None,
        }
    }

    pub fn parse(input: &str) -> Result<Self, CoordinatorError> {
        let err = || CoordinatorError::Parse {
            input: input.to_string(),
        };

        let (core, suffix) = match input.split_once('-') {
            Some((_, "")) => return Err(err()),
            Some((core, suffix)) => (core, Some(suffix.to_string())),
            None => (input, None),
        };

        let mut parts = core.split('.');
        let mut next = || -> Result<u32, CoordinatorError> {
            let part = parts.next().ok_or_else(err)?;
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(err());
            }
            part.parse().map_err(|_| err())
        };
        let (major, minor, patch) = (next()?, next()?, next()?);
        if parts.next().is_some() {
            return Err(err());
        }

        Ok(Self {
            major,
            minor,
            patch,
            suffix,
        })
    }

    /// Decode PostgreSQL's `server_version_num` setting.
    ///
    /// From 10 onwards the number is `major * 10000 + minor`; older servers
    /// use `major * 10000 + minor * 100 + patch`.
    pub fn from_server_version_num(num: u32) -> Self {
        if num >= 100_000 {
            Self::new(num / 10_000, num % 10_000, 0)
        } else {
            Self::new(num / 10_000, (num / 100) % 100, num % 100)
        }
    }

    /// pgvecto.rs 0.1.11 registered itself as 0.1.1 in `pg_extension`.
    pub fn remap_installed(self) -> Self {
        if self == Version::new(0, 1, 1) {
            Version::new(0, 1, 11)
        } else {
            self
        }
    }

    pub fn suffix(&self) -> Option<&str> {
        self.suffix.as_deref()
    }

    /// Compare only down to `granularity`; lower components are ignored.
    pub fn compare(&self, other: &Version, granularity: VersionType) -> Ordering {
        let major = self.major.cmp(&other.major);
        if major != Ordering::Equal || granularity == VersionType::Major {
            return major;
        }
        let minor = self.minor.cmp(&other.minor);
        if minor != Ordering::Equal || granularity == VersionType::Minor {
            return minor;
        }
        self.patch.cmp(&other.patch)
    }

    pub fn diff(&self, other: &Version) -> VersionDiff {
        if self.major != other.major {
            VersionDiff::Major
        } else if self.minor != other.minor {
            VersionDiff::Minor
        } else if self.patch != other.patch {
            VersionDiff::Patch
        } else {
            VersionDiff::None
        }
    }

    pub fn is_older_than(&self, other: &Version) -> bool {
        self.compare(other, VersionType::Patch) == Ordering::Less
    }

    pub fn is_equal(&self, other: &Version) -> bool {
        self.compare(other, VersionType::Patch) == Ordering::Equal
    }

    fn key(&self) -> (u32, u32, u32) {
        (self.major, self.minor, self.patch)
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Version {}

impl Hash for Version {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

impl FromStr for Version {
    type Err = CoordinatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Version::parse(s)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Half-open range `[min, max)` of supported versions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionRange {
    pub min: Version,
    pub max: Version,
}

impl VersionRange {
    pub const fn new(min: Version, max: Version) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, version: &Version) -> bool {
        *version >= self.min && *version < self.max
    }
}

impl fmt::Display for VersionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, ">={} <{}", self.min, self.max)
    }
}
