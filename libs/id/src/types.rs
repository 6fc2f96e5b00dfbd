//! Identity types for stored objects.
//!
//! Objects are addressed by [`ObjectKey`]. The store assigns each object an
//! [`ObjectUid`] at creation and a [`ResourceVersion`] that advances on every
//! write.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{define_uid, IdError};

// =============================================================================
// Object Uid
// =============================================================================

define_uid!(ObjectUid, "uid");

// =============================================================================
// Object Key
// =============================================================================

/// Namespace used when a key is given without one.
pub const DEFAULT_NAMESPACE: &str = "default";

const MAX_NAMESPACE_LEN: usize = 63;
const MAX_NAME_LEN: usize = 253;

/// Namespaced key addressing a stored object (`namespace/name`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "KeyParts")]
pub struct ObjectKey {
    namespace: String,
    name: String,
}

impl ObjectKey {
    /// Creates a key after validating both segments.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Result<Self, IdError> {
        let namespace = namespace.into();
        let name = name.into();
        validate_segment("namespace", &namespace, MAX_NAMESPACE_LEN)?;
        validate_segment("name", &name, MAX_NAME_LEN)?;
        Ok(Self { namespace, name })
    }

    /// Returns the namespace segment.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Returns the name segment.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl FromStr for ObjectKey {
    type Err = IdError;

    /// Parses `namespace/name`, or a bare `name` in the default namespace.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(IdError::Empty);
        }

        match s.split_once('/') {
            Some((namespace, name)) => Self::new(namespace, name),
            None => Self::new(DEFAULT_NAMESPACE, s),
        }
    }
}

#[derive(Deserialize)]
struct KeyParts {
    #[serde(default = "default_namespace")]
    namespace: String,
    name: String,
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

impl TryFrom<KeyParts> for ObjectKey {
    type Error = IdError;

    fn try_from(parts: KeyParts) -> Result<Self, Self::Error> {
        Self::new(parts.namespace, parts.name)
    }
}

/// Checks a segment against DNS-style label rules: lowercase alphanumerics,
/// `-` and `.`, starting and ending with an alphanumeric.
fn validate_segment(segment: &'static str, value: &str, max_len: usize) -> Result<(), IdError> {
    let invalid = |reason| IdError::InvalidSegment {
        segment,
        value: value.to_string(),
        reason,
    };

    if value.is_empty() {
        return Err(IdError::Empty);
    }
    if value.len() > max_len {
        return Err(invalid("too long"));
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.')
    {
        return Err(invalid("only lowercase alphanumerics, '-' and '.' are allowed"));
    }

    let is_alnum = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit();
    let starts_ok = value.chars().next().is_some_and(is_alnum);
    let ends_ok = value.chars().last().is_some_and(is_alnum);
    if !starts_ok || !ends_ok {
        return Err(invalid("must start and end with an alphanumeric"));
    }

    Ok(())
}

// =============================================================================
// Resource Version
// =============================================================================

/// Monotonic per-object version used for optimistic concurrency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceVersion(u64);

impl ResourceVersion {
    /// The version assigned to a newly created object.
    pub const FIRST: Self = Self(1);

    /// Creates a version from a raw value.
    #[must_use]
    pub const fn new(version: u64) -> Self {
        Self(version)
    }

    /// Returns the underlying value.
    #[must_use]
    pub const fn value(&self) -> u64 {
        self.0
    }

    /// Returns the next version.
    #[must_use]
    pub const fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl Default for ResourceVersion {
    fn default() -> Self {
        Self::FIRST
    }
}

impl fmt::Display for ResourceVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for ResourceVersion {
    fn from(version: u64) -> Self {
        Self(version)
    }
}

impl Serialize for ResourceVersion {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_u64(self.0)
    }
}

impl<'de> Deserialize<'de> for ResourceVersion {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let version = u64::deserialize(deserializer)?;
        Ok(Self(version))
    }
}

// =============================================================================
// Tests
// =============================================================================
