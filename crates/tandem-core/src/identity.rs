//! Principal identities and unordered identity pairs.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque principal identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    /// Wrap an identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Identifier bytes, as mixed into derivation contexts.
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identity {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Unordered pair of identities.
///
/// # Invariants
///
/// - `low <= high`, so `IdentityPair::new(a, b) == IdentityPair::new(b, a)`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdentityPair {
    low: Identity,
    high: Identity,
}

impl IdentityPair {
    /// Build the pair in canonical order.
    pub fn new(a: Identity, b: Identity) -> Self {
        if a <= b { Self { low: a, high: b } } else { Self { low: b, high: a } }
    }

    /// Both members, lexicographically smaller first.
    pub fn members(&self) -> (&Identity, &Identity) {
        (&self.low, &self.high)
    }

    /// True if `id` is one of the two members.
    pub fn contains(&self, id: &Identity) -> bool {
        &self.low == id || &self.high == id
    }
}

impl fmt::Display for IdentityPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}<->{}", self.low, self.high)
    }
}
