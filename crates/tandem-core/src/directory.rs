//! Directory of published key bundles.
//!
//! The directory maps identities to the public key a responder publishes so
//! that initiators can encrypt a provisional first message before any
//! interaction. The engine only sees the [`Directory`] trait; lookups are
//! driven by the caller in response to `FetchBundle` actions.

#![allow(clippy::disallowed_types, reason = "Synchronous in-memory operations only")]
#![allow(clippy::expect_used, reason = "Mutex poisoning should cause a panic")]

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use tandem_crypto::PUBLIC_KEY_SIZE;

use crate::identity::Identity;

/// Published key bundle for one identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bundle {
    /// Responder's bundle public key
    pub public_key: [u8; PUBLIC_KEY_SIZE],
    /// Where the responder can be reached
    pub locator: String,
}

/// Lookup and publication of key bundles.
pub trait Directory {
    /// Bundle currently published for `identity`.
    fn fetch_bundle(&self, identity: &Identity) -> Option<Bundle>;

    /// Publish or replace the bundle for `identity`.
    fn publish_bundle(&self, identity: Identity, bundle: Bundle);
}

/// In-memory directory.
///
/// Thread-safe via Arc<Mutex<_>>. Clone shares the same underlying storage.
#[derive(Clone, Default)]
pub struct MemoryDirectory {
    inner: Arc<Mutex<HashMap<Identity, Bundle>>>,
}

impl MemoryDirectory {
    /// Create an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Withdraw the bundle for `identity`.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn withdraw(&self, identity: &Identity) -> Option<Bundle> {
        let mut inner = self.inner.lock().expect("MemoryDirectory mutex poisoned");
        inner.remove(identity)
    }
}

impl Directory for MemoryDirectory {
    fn fetch_bundle(&self, identity: &Identity) -> Option<Bundle> {
        let inner = self.inner.lock().expect("MemoryDirectory mutex poisoned");
        inner.get(identity).cloned()
    }

    fn publish_bundle(&self, identity: Identity, bundle: Bundle) {
        let mut inner = self.inner.lock().expect("MemoryDirectory mutex poisoned");
        inner.insert(identity, bundle);
    }
}
