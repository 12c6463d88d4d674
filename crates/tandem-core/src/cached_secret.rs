//! Cached secret store.
//!
//! Holds one secret per unordered identity pair. A handshake takes a
//! [`PairLease`] on its pair for its whole lifetime: the lease reads the
//! stored secret once on acquisition, writes the replacement at most once on
//! success, and releases the pair when dropped. A second lease on the same
//! pair fails with `PairBusy`, which serializes concurrent handshakes between
//! the same two parties while leaving other pairs independent.
//!
//! A first-contact session only earns its replacement secret once the SAS
//! has been compared. Its lease is turned into a [`PendingSecret`], which
//! releases the pair at once and writes later, and only if the stored value
//! is still the one the lease read.
//!
//! The store's mutex is held only for the duration of each call, never for
//! the lifetime of a lease.

#![allow(clippy::disallowed_types, reason = "Synchronous in-memory operations only")]
#![allow(clippy::expect_used, reason = "Mutex poisoning should cause a panic")]

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, PoisonError},
};

use tandem_crypto::SecretKey;

use crate::{error::HandshakeError, identity::IdentityPair};

/// Secret shared by an identity pair across sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedSecret(SecretKey);

impl CachedSecret {
    /// Wrap key material.
    pub fn new(key: SecretKey) -> Self {
        Self(key)
    }

    /// Key material, as fed into MACs and the key schedule.
    pub fn as_key(&self) -> &SecretKey {
        &self.0
    }
}

/// In-memory cached secret store.
///
/// Thread-safe via Arc<Mutex<_>>. Clone shares the same underlying storage.
#[derive(Clone, Default)]
pub struct CachedSecretStore {
    inner: Arc<Mutex<StoreInner>>,
}

#[derive(Default)]
struct StoreInner {
    secrets: HashMap<IdentityPair, CachedSecret>,
    leased: HashSet<IdentityPair>,
}

impl CachedSecretStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take exclusive access to one pair's entry.
    ///
    /// # Errors
    ///
    /// - `HandshakeError::PairBusy` if another lease on `pair` is alive
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn lease(&self, pair: IdentityPair) -> Result<PairLease, HandshakeError> {
        let mut inner = self.inner.lock().expect("CachedSecretStore mutex poisoned");

        if !inner.leased.insert(pair.clone()) {
            return Err(HandshakeError::PairBusy { pair: pair.to_string() });
        }
        let secret = inner.secrets.get(&pair).cloned();

        Ok(PairLease { store: Arc::clone(&self.inner), pair, secret, committed: false })
    }

    /// Current secret for `pair`, if any.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn get(&self, pair: &IdentityPair) -> Option<CachedSecret> {
        let inner = self.inner.lock().expect("CachedSecretStore mutex poisoned");
        inner.secrets.get(pair).cloned()
    }

    /// Overwrite the secret for `pair` outside a handshake.
    ///
    /// Used to seed or restore state.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn insert(&self, pair: IdentityPair, secret: CachedSecret) {
        let mut inner = self.inner.lock().expect("CachedSecretStore mutex poisoned");
        inner.secrets.insert(pair, secret);
    }

    /// Forget the secret for `pair`, forcing first-contact next time.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn remove(&self, pair: &IdentityPair) -> Option<CachedSecret> {
        let mut inner = self.inner.lock().expect("CachedSecretStore mutex poisoned");
        inner.secrets.remove(pair)
    }

    /// True if a lease on `pair` is currently alive.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn is_leased(&self, pair: &IdentityPair) -> bool {
        let inner = self.inner.lock().expect("CachedSecretStore mutex poisoned");
        inner.leased.contains(pair)
    }

    /// Number of pairs with a stored secret.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn len(&self) -> usize {
        let inner = self.inner.lock().expect("CachedSecretStore mutex poisoned");
        inner.secrets.len()
    }

    /// True if no secrets are stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Exclusive access to one pair's cached secret for one handshake.
///
/// Dropping the lease without calling [`PairLease::commit`] leaves the store
/// untouched.
pub struct PairLease {
    store: Arc<Mutex<StoreInner>>,
    pair: IdentityPair,
    secret: Option<CachedSecret>,
    committed: bool,
}

impl PairLease {
    /// The leased pair.
    pub fn pair(&self) -> &IdentityPair {
        &self.pair
    }

    /// Secret read when the lease was taken.
    pub fn cached_secret(&self) -> Option<&CachedSecret> {
        self.secret.as_ref()
    }

    /// Replace the stored secret and release the pair.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn commit(mut self, secret: CachedSecret) {
        let mut inner = self.store.lock().expect("CachedSecretStore mutex poisoned");
        inner.secrets.insert(self.pair.clone(), secret);
        inner.leased.remove(&self.pair);
        self.committed = true;
    }

    /// Release the pair now and hold `secret` back for a later
    /// [`PendingSecret::commit`].
    pub(crate) fn defer(mut self, secret: CachedSecret) -> PendingSecret {
        PendingSecret {
            store: Arc::clone(&self.store),
            pair: self.pair.clone(),
            expected: self.secret.take(),
            secret,
        }
    }
}

impl Drop for PairLease {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        let mut inner = self.store.lock().unwrap_or_else(PoisonError::into_inner);
        inner.leased.remove(&self.pair);
    }
}

impl std::fmt::Debug for PairLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PairLease")
            .field("pair", &self.pair)
            .field("has_secret", &self.secret.is_some())
            .finish_non_exhaustive()
    }
}

/// Replacement secret waiting for SAS confirmation.
///
/// Dropping it discards the secret and leaves the store untouched.
pub(crate) struct PendingSecret {
    store: Arc<Mutex<StoreInner>>,
    pair: IdentityPair,
    expected: Option<CachedSecret>,
    secret: CachedSecret,
}

impl PendingSecret {
    /// Write the secret if the pair still holds the value read at lease
    /// time. Returns false, writing nothing, if another handshake replaced
    /// it in between.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub(crate) fn commit(self) -> bool {
        let mut inner = self.store.lock().expect("CachedSecretStore mutex poisoned");
        if inner.secrets.get(&self.pair) != self.expected.as_ref() {
            return false;
        }
        inner.secrets.insert(self.pair, self.secret);
        true
    }
}

impl std::fmt::Debug for PendingSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingSecret").field("pair", &self.pair).finish_non_exhaustive()
    }
}
