//! Error types for the Tandem handshake and established sessions.
//!
//! Every handshake error is terminal for the affected session: the engine
//! moves to `Aborted`, discards ephemeral material and never writes the
//! cached secret store. Nothing is retried internally.

use std::{fmt, time::Duration};

use tandem_crypto::CryptoError;
use thiserror::Error;

use crate::handshake::HandshakeState;

/// Coarse classification shared by handshake and session errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Revealed ephemeral key does not match its earlier commitment
    CommitmentMismatch,
    /// A cached-secret or confirmation MAC failed to verify
    AuthenticationFailure,
    /// Provisional or ratcheted ciphertext failed to decrypt
    DecryptionFailure,
    /// Public index did not match the expected next value
    IndexMismatch,
    /// Ratchet index cannot advance further
    IndexExhausted,
    /// Awaited message did not arrive in time
    Timeout,
    /// Call not valid in the current state
    InvalidState,
    /// Message not valid in the current state or for this session
    UnexpectedMessage,
    /// Another handshake holds the identity pair
    PairBusy,
    /// Provisional message requested without a bundle
    MissingBundle,
    /// Wire bytes failed to decode
    Malformed,
    /// Peer reported that it aborted
    PeerAborted,
    /// Local caller cancelled the handshake
    Cancelled,
    /// SAS has not been confirmed yet
    SasUnverified,
    /// SAS comparison failed
    SasRejected,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Wire encoding errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Message exceeds the size limit
    #[error("message too large: {size} bytes (max {max})")]
    TooLarge {
        /// Actual size in bytes
        size: usize,
        /// Maximum allowed size
        max: usize,
    },

    /// CBOR encoding failed
    #[error("CBOR encode failed: {0}")]
    CborEncode(String),

    /// CBOR decoding failed
    #[error("CBOR decode failed: {0}")]
    CborDecode(String),

    /// Bytes decode but are not the canonical encoding of their value
    #[error("non-canonical encoding")]
    NonCanonical,
}

/// Errors raised by the handshake state machine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    /// Revealed ephemeral key hashes to something other than the commitment
    #[error("commitment mismatch: revealed ephemeral key does not match commitment")]
    CommitmentMismatch,

    /// MAC verification failed
    #[error("authentication failure at {stage}")]
    AuthenticationFailure {
        /// Which check failed
        stage: &'static str,
    },

    /// Provisional message failed to decrypt
    #[error("provisional message decryption failed: {0}")]
    DecryptionFailure(CryptoError),

    /// Awaited message did not arrive in time
    #[error("handshake timeout after {elapsed:?}")]
    Timeout {
        /// How long we waited
        elapsed: Duration,
    },

    /// Call not valid in the current state
    #[error("invalid state: cannot {operation} in {state:?}")]
    InvalidState {
        /// State when the call was made
        state: HandshakeState,
        /// Operation that was attempted
        operation: &'static str,
    },

    /// Message not valid in the current state or for this session
    #[error("unexpected {message} in {state:?}")]
    UnexpectedMessage {
        /// State when the message arrived
        state: HandshakeState,
        /// What arrived
        message: &'static str,
    },

    /// Another handshake for the same identity pair is in progress
    #[error("identity pair {pair} is busy")]
    PairBusy {
        /// Display form of the pair
        pair: String,
    },

    /// A first message was supplied but the directory had no bundle
    #[error("no bundle published for {peer}")]
    MissingBundle {
        /// Peer whose bundle was requested
        peer: String,
    },

    /// Wire bytes could not be decoded
    #[error("malformed message: {0}")]
    Malformed(#[from] WireError),

    /// Peer aborted its side of the handshake
    #[error("peer aborted: {reason}")]
    PeerAborted {
        /// Reason reported by the peer
        reason: String,
    },

    /// Local caller cancelled the handshake
    #[error("cancelled: {reason}")]
    Cancelled {
        /// Caller-supplied reason
        reason: String,
    },
}

impl HandshakeError {
    /// Coarse classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::CommitmentMismatch => ErrorKind::CommitmentMismatch,
            Self::AuthenticationFailure { .. } => ErrorKind::AuthenticationFailure,
            Self::DecryptionFailure(_) => ErrorKind::DecryptionFailure,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::InvalidState { .. } => ErrorKind::InvalidState,
            Self::UnexpectedMessage { .. } => ErrorKind::UnexpectedMessage,
            Self::PairBusy { .. } => ErrorKind::PairBusy,
            Self::MissingBundle { .. } => ErrorKind::MissingBundle,
            Self::Malformed(_) => ErrorKind::Malformed,
            Self::PeerAborted { .. } => ErrorKind::PeerAborted,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
        }
    }

    /// Returns true if this error indicates a broken or malicious peer.
    ///
    /// Timeouts, cancellation and a busy pair can be retried with a fresh
    /// handshake. Everything else points at tampering or a protocol bug.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Timeout { .. } | Self::Cancelled { .. } | Self::PairBusy { .. })
    }
}

/// Errors raised by an established session.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Public index does not match the expected next value
    #[error("index mismatch: expected {expected}, got {actual}")]
    IndexMismatch {
        /// Expected public index
        expected: u16,
        /// Received public index
        actual: u16,
    },

    /// Ciphertext failed to authenticate
    #[error("decryption failed: {reason}")]
    DecryptionFailure {
        /// Reason from the AEAD layer
        reason: &'static str,
    },

    /// Ratchet cannot advance; a fresh handshake is required
    #[error("ratchet index exhausted at {index}")]
    IndexExhausted {
        /// Index at exhaustion
        index: u64,
    },

    /// First-contact SAS has not been confirmed yet
    #[error("SAS not yet verified")]
    SasUnverified,

    /// First-contact SAS comparison failed
    #[error("SAS rejected")]
    SasRejected,

    /// Message belongs to another session
    #[error("message for session {actual:#018x}, expected {expected:#018x}")]
    WrongSession {
        /// This session's identifier
        expected: u64,
        /// Identifier carried by the message
        actual: u64,
    },

    /// Message is not an application message
    #[error("unexpected {message} in established session")]
    UnexpectedMessage {
        /// What arrived
        message: &'static str,
    },

    /// Wire bytes could not be decoded
    #[error("malformed message: {0}")]
    Malformed(#[from] WireError),
}

impl SessionError {
    /// Coarse classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::IndexMismatch { .. } => ErrorKind::IndexMismatch,
            Self::DecryptionFailure { .. } => ErrorKind::DecryptionFailure,
            Self::IndexExhausted { .. } => ErrorKind::IndexExhausted,
            Self::SasUnverified => ErrorKind::SasUnverified,
            Self::SasRejected => ErrorKind::SasRejected,
            Self::WrongSession { .. } | Self::UnexpectedMessage { .. } => {
                ErrorKind::UnexpectedMessage
            },
            Self::Malformed(_) => ErrorKind::Malformed,
        }
    }
}

impl From<CryptoError> for SessionError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::IndexMismatch { expected, actual } => {
                Self::IndexMismatch { expected, actual }
            },
            CryptoError::IndexExhausted { index } => Self::IndexExhausted { index },
            CryptoError::DecryptionFailed { reason } => Self::DecryptionFailure { reason },
            CryptoError::WeakPublicKey => Self::DecryptionFailure { reason: "weak public key" },
        }
    }
}
