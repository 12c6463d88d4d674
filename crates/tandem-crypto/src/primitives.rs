//! Hash, MAC and X25519 building blocks.
//!
//! Every multi-part input is length-prefixed before it reaches SHA-256 or
//! HMAC, so `("ab", "c")` and `("a", "bc")` never collide.

use std::fmt;

use hmac::{Hmac, Mac};
use sha2::{Digest as _, Sha256};
use subtle::ConstantTimeEq;
use x25519_dalek::{PublicKey, SharedSecret, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;

type HmacSha256 = Hmac<Sha256>;

/// Size of every symmetric key in bytes
pub const KEY_SIZE: usize = 32;

/// Size of an X25519 public key in bytes
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Size of a SHA-256 / HMAC-SHA256 output in bytes
pub const DIGEST_SIZE: usize = 32;

/// A SHA-256 digest or HMAC tag.
pub type Digest = [u8; DIGEST_SIZE];

/// 32 bytes of symmetric key material.
///
/// Zeroized on drop. Equality is constant time and `Debug` never prints the
/// key bytes.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretKey([u8; KEY_SIZE]);

impl SecretKey {
    /// Wrap raw key bytes.
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// The fixed all-zero key used where no transcript hash exists yet.
    pub fn null() -> Self {
        Self([0u8; KEY_SIZE])
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl PartialEq for SecretKey {
    fn eq(&self, other: &Self) -> bool {
        constant_time_eq(&self.0, &other.0)
    }
}

impl Eq for SecretKey {}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey(..)")
    }
}

/// Constant-time byte comparison.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

/// SHA-256 of a single byte string.
pub fn hash(data: &[u8]) -> Digest {
    let result = Sha256::digest(data);
    let mut out = [0u8; DIGEST_SIZE];
    out.copy_from_slice(&result);
    out
}

/// HMAC-SHA256 over the length-prefixed concatenation of `parts`.
pub fn mac(key: &[u8], parts: &[&[u8]]) -> Digest {
    let mac = keyed(key, parts);
    let result = mac.finalize().into_bytes();

    let mut out = [0u8; DIGEST_SIZE];
    out.copy_from_slice(&result);
    out
}

/// Verify an HMAC-SHA256 tag in constant time.
pub fn verify_mac(key: &[u8], parts: &[&[u8]], tag: &[u8]) -> bool {
    keyed(key, parts).verify_slice(tag).is_ok()
}

fn keyed(key: &[u8], parts: &[&[u8]]) -> HmacSha256 {
    let Ok(mut mac) = HmacSha256::new_from_slice(key) else {
        unreachable!("HMAC-SHA256 accepts any key size");
    };
    for part in parts {
        mac.update(&(part.len() as u32).to_be_bytes());
        mac.update(part);
    }
    mac
}

/// Running hash over the ordered handshake wire messages.
///
/// Each message is absorbed with its length so that message boundaries are
/// part of the hash.
#[derive(Clone, Default)]
pub struct Transcript {
    hasher: Sha256,
    messages: usize,
}

impl Transcript {
    /// Empty transcript.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one wire message, exactly as it was sent or received.
    pub fn absorb(&mut self, message: &[u8]) {
        self.hasher.update((message.len() as u64).to_be_bytes());
        self.hasher.update(message);
        self.messages += 1;
    }

    /// Number of messages absorbed so far.
    pub fn len(&self) -> usize {
        self.messages
    }

    /// True if nothing has been absorbed.
    pub fn is_empty(&self) -> bool {
        self.messages == 0
    }

    /// Hash of everything absorbed so far. The transcript stays usable.
    pub fn hash(&self) -> Digest {
        let result = self.hasher.clone().finalize();
        let mut out = [0u8; DIGEST_SIZE];
        out.copy_from_slice(&result);
        out
    }
}

impl fmt::Debug for Transcript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transcript").field("messages", &self.messages).finish()
    }
}

/// X25519 key pair.
///
/// The scalar is zeroized when the pair is dropped.
pub struct KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl KeyPair {
    /// Build a key pair from 32 caller-provided random bytes.
    ///
    /// The caller MUST provide cryptographically secure random bytes in
    /// production. The local copy of `bytes` is zeroized.
    pub fn from_secret_bytes(mut bytes: [u8; KEY_SIZE]) -> Self {
        let secret = StaticSecret::from(bytes);
        bytes.zeroize();
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Public curve point.
    pub fn public_key(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.public.to_bytes()
    }

    /// SHA-256 commitment to the public key.
    pub fn commitment(&self) -> Digest {
        hash(self.public.as_bytes())
    }

    /// Scalar multiplication with the peer's public point.
    ///
    /// # Errors
    ///
    /// - `WeakPublicKey`: the peer point is low-order and the result is zero
    pub fn diffie_hellman(
        &self,
        peer_public: &[u8; PUBLIC_KEY_SIZE],
    ) -> Result<SharedPoint, CryptoError> {
        let shared = self.secret.diffie_hellman(&PublicKey::from(*peer_public));
        if !shared.was_contributory() {
            return Err(CryptoError::WeakPublicKey);
        }
        Ok(SharedPoint(shared))
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair").field("public", &self.public.as_bytes()).finish_non_exhaustive()
    }
}

/// Result of one X25519 scalar multiplication. Zeroized on drop.
pub struct SharedPoint(SharedSecret);

impl SharedPoint {
    /// Serialized point.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        self.0.as_bytes()
    }
}

impl fmt::Debug for SharedPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedPoint(..)")
    }
}
