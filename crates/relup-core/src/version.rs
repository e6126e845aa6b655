//! Release version parsing and ordering.
//!
//! Versions are compared as a five-field tuple
//! `(major, minor, patch, stage, iteration)`. Three textual forms are
//! accepted, distinguished by the number of dots:
//!
//! | dots | form            | example  |
//! |------|-----------------|----------|
//! | 1    | `N.N[bN]`       | `1.2b3`  |
//! | 2    | `N.N.N[bN]`     | `1.2.3`  |
//! | 4    | `N.N.N.S.N`     | `1.2.3.2.0` |
//!
//! A trailing archive extension (`.zip`, `.tar.gz`) is stripped before
//! the dots are counted, so archive filenames such as
//! `app-mac-0.1.0.tar.gz` parse directly.
//!
//! The canonical [`Display`](std::fmt::Display) form is always the
//! five-field one and is what the manifest uses as version keys.

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use regex_lite::{Captures, Regex};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::VersionError;

/// Release stage of a version. Ordered `Alpha < Beta < Stable`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum ReleaseStage {
    Alpha = 0,
    Beta = 1,
    #[default]
    Stable = 2,
}

impl ReleaseStage {
    /// Map a single-letter stage marker. Unknown letters degrade to stable.
    fn from_letter(letter: &str) -> Self {
        match letter {
            "a" => ReleaseStage::Alpha,
            "b" => ReleaseStage::Beta,
            other => {
                tracing::debug!(stage = other, "unknown release stage letter, treating as stable");
                ReleaseStage::Stable
            }
        }
    }

    /// Map the numeric stage of the five-field form. Unknown numbers degrade to stable.
    fn from_number(number: u64) -> Self {
        match number {
            0 => ReleaseStage::Alpha,
            1 => ReleaseStage::Beta,
            2 => ReleaseStage::Stable,
            other => {
                tracing::debug!(stage = other, "unknown release stage number, treating as stable");
                ReleaseStage::Stable
            }
        }
    }
}

/// An immutable, totally ordered release version.
///
/// Field order matters: the derived `Ord` compares lexicographically in
/// declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    major: u64,
    minor: u64,
    patch: u64,
    stage: ReleaseStage,
    iteration: u64,
}

impl Version {
    pub fn new(major: u64, minor: u64, patch: u64, stage: ReleaseStage, iteration: u64) -> Self {
        Self {
            major,
            minor,
            patch,
            stage,
            iteration,
        }
    }

    /// Parse a version string or an archive filename containing one.
    pub fn parse(text: &str) -> Result<Self, VersionError> {
        let stripped = strip_archive_extension(text);
        let dots = stripped.matches('.').count();

        let (captures, stage) = match dots {
            1 => {
                let caps = captures(short_form(), stripped)?;
                let stage = stage_from_letter(&caps);
                (caps, stage)
            }
            2 => {
                let caps = captures(patch_form(), stripped)?;
                let stage = stage_from_letter(&caps);
                (caps, stage)
            }
            4 => {
                let caps = captures(full_form(), stripped)?;
                let stage = ReleaseStage::from_number(number(&caps, "stage", stripped)?);
                (caps, stage)
            }
            other => {
                tracing::error!(version = text, dots = other, "incorrect version format");
                return Err(VersionError::DotCount(other));
            }
        };

        Ok(Self {
            major: number(&captures, "major", stripped)?,
            minor: number(&captures, "minor", stripped)?,
            patch: optional_number(&captures, "patch", stripped)?,
            stage,
            iteration: optional_number(&captures, "iteration", stripped)?,
        })
    }

    pub fn major(&self) -> u64 {
        self.major
    }

    pub fn minor(&self) -> u64 {
        self.minor
    }

    pub fn patch(&self) -> u64 {
        self.patch
    }

    pub fn stage(&self) -> ReleaseStage {
        self.stage
    }

    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    /// The comparable five-field tuple.
    pub fn as_tuple(&self) -> (u64, u64, u64, u8, u64) {
        (
            self.major,
            self.minor,
            self.patch,
            self.stage as u8,
            self.iteration,
        )
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}.{}",
            self.major, self.minor, self.patch, self.stage as u8, self.iteration
        )
    }
}

impl FromStr for Version {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Version::parse(s)
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Version::parse(&text).map_err(serde::de::Error::custom)
    }
}

/// Strip a trailing `.tar.gz`, `.gz` or `.zip` extension.
pub fn strip_archive_extension(text: &str) -> &str {
    text.strip_suffix(".tar.gz")
        .or_else(|| text.strip_suffix(".zip"))
        .or_else(|| text.strip_suffix(".gz"))
        .unwrap_or(text)
}

fn short_form() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?P<major>\d+)\.(?P<minor>\d+)(?P<letter>[a-z])?(?P<iteration>\d+)?")
            .expect("static regex")
    })
}

fn patch_form() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?P<major>\d+)\.(?P<minor>\d+)\.(?P<patch>\d+)(?P<letter>[a-z])?(?P<iteration>\d+)?",
        )
        .expect("static regex")
    })
}

fn full_form() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?P<major>\d+)\.(?P<minor>\d+)\.(?P<patch>\d+)\.(?P<stage>\d+)\.(?P<iteration>\d+)",
        )
        .expect("static regex")
    })
}

fn captures<'t>(re: &Regex, text: &'t str) -> Result<Captures<'t>, VersionError> {
    re.captures(text)
        .ok_or_else(|| VersionError::Malformed(text.to_string()))
}

fn stage_from_letter(caps: &Captures<'_>) -> ReleaseStage {
    caps.name("letter")
        .map(|m| ReleaseStage::from_letter(m.as_str()))
        .unwrap_or_default()
}

fn number(caps: &Captures<'_>, group: &str, text: &str) -> Result<u64, VersionError> {
    caps.name(group)
        .ok_or_else(|| VersionError::Malformed(text.to_string()))?
        .as_str()
        .parse()
        .map_err(|_| VersionError::Malformed(text.to_string()))
}

fn optional_number(caps: &Captures<'_>, group: &str, text: &str) -> Result<u64, VersionError> {
    match caps.name(group) {
        Some(m) => m
            .as_str()
            .parse()
            .map_err(|_| VersionError::Malformed(text.to_string())),
        None => Ok(0),
    }
}
