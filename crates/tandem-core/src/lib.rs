//! Tandem protocol core
//!
//! Two-party session establishment over an untrusted network. A handshake
//! agrees on per-direction ratchet keys, authenticates the peer either by a
//! short authentication string (first contact) or by a secret cached from the
//! previous session (resumption), and hands the result to an
//! [`EstablishedSession`].
//!
//! # Components
//!
//! - [`Handshake`]: sans-IO state machine for both roles
//! - [`CachedSecretStore`]: one secret per identity pair, leased per handshake
//! - [`Directory`]: published bundles for provisional first messages
//! - [`EstablishedSession`]: ratcheted application traffic and SAS status
//! - [`wire`]: CBOR messages exchanged between the parties
//!
//! Drivers feed wire bytes and time into the handshake and execute the
//! returned [`HandshakeAction`]s; randomness comes from an [`Environment`].

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod cached_secret;
pub mod directory;
pub mod env;
pub mod error;
pub mod handshake;
pub mod identity;
pub mod session;
pub mod wire;

pub use cached_secret::{CachedSecret, CachedSecretStore, PairLease};
pub use directory::{Bundle, Directory, MemoryDirectory};
pub use env::Environment;
pub use error::{ErrorKind, HandshakeError, SessionError, WireError};
pub use handshake::{
    DEFAULT_HANDSHAKE_TIMEOUT, Handshake, HandshakeAction, HandshakeConfig, HandshakeEvent,
    HandshakeMode, HandshakeState,
};
pub use identity::{Identity, IdentityPair};
pub use session::{EstablishedSession, SasChannel, SasVerification};
pub use tandem_crypto::{KeyPair, Role, Sas};
