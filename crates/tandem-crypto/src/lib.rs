//! Tandem Cryptographic Primitives
//!
//! Cryptographic building blocks for Tandem two-party sessions. Pure functions
//! with deterministic outputs. Callers provide random bytes (ephemeral scalars)
//! so every derivation can be replayed in tests.
//!
//! # Key Lifecycle
//!
//! A handshake produces an X25519 shared point `Z` which is bound to the
//! handshake transcript and the cached secret of the identity pair. The
//! resulting derivation key `kdk2` is expanded into labelled subkeys, two of
//! which seed the per-direction message ratchets.
//!
//! ```text
//! X25519(own ephemeral, peer ephemeral) = Z
//!        │
//!        ▼ HMAC(transcript hash, Z)
//!       kdk
//!        │
//!        ▼ HMAC(kdk, protocol || algorithm || context || cached secret)
//!       kdk2 ──► MAC keys, SAS, next cached secret, initial indices
//!        │
//!        ▼
//! Master Key[index] ──► AEAD ──► Ciphertext
//!        │
//!        ▼ HMAC(master key, "MessageKey" || session || index)
//! Master Key[index + 1]
//! ```
//!
//! # Security
//!
//! Forward Secrecy:
//! - Ratchet advancement: the master key for index `n` is zeroized as soon as
//!   the key for `n + 1` is derived
//! - Ephemeral scalars are zeroized when the handshake concludes
//!
//! Key Erasure:
//! - Every secret type zeroizes its backing storage on drop
//! - `kdk2` is a one-way function of the cached secret; revealing it does not
//!   reveal the cached secret or earlier sessions' keys
//!
//! Authenticity:
//! - HMAC-SHA256 tag over (nonce, associated data, plaintext), then
//!   XChaCha20-Poly1305 over (plaintext, tag)
//! - Associated data carries the full ratchet index, so replays under a stale
//!   index fail closed

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod aead;
pub mod error;
pub mod kdf;
pub mod primitives;
pub mod ratchet;

pub use aead::{AEAD_OVERHEAD, decrypt, encrypt};
pub use error::CryptoError;
pub use kdf::{
    ALGORITHM_ID, KeySchedule, PROTOCOL_LABEL, ProvisionalKeys, Role, Sas, SessionKeys,
    SubkeyLabel, derive, next_master_key,
};
pub use primitives::{
    DIGEST_SIZE, Digest, KEY_SIZE, KeyPair, PUBLIC_KEY_SIZE, SecretKey, SharedPoint, Transcript,
    constant_time_eq, hash, mac, verify_mac,
};
pub use ratchet::{PUBLIC_INDEX_BITS, RatchetState, RatchetedMessage, public_portion};
