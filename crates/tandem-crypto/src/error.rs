//! Error types for key schedule, AEAD and ratchet operations

use thiserror::Error;

/// Errors from the cryptographic layer
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    /// AEAD or HMAC tag did not verify
    #[error("decryption failed: {reason}")]
    DecryptionFailed {
        /// Reason for decryption failure
        reason: &'static str,
    },

    /// Public index portion on the wire is not the expected next value
    #[error("index mismatch: expected public index {expected}, got {actual}")]
    IndexMismatch {
        /// Public portion of the index the receiver expects next
        expected: u16,
        /// Public portion carried by the message
        actual: u16,
    },

    /// The ratchet index cannot advance any further
    #[error("ratchet index exhausted at {index}")]
    IndexExhausted {
        /// Index at which exhaustion was detected
        index: u64,
    },

    /// Peer public key produced an all-zero shared point
    #[error("peer public key is a low-order point")]
    WeakPublicKey,
}

impl CryptoError {
    /// Returns true if this error is fatal (unrecoverable)
    ///
    /// An index mismatch leaves the ratchet untouched, so the caller can wait
    /// for the expected message. Everything else either signals tampering or
    /// requires a fresh handshake.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::DecryptionFailed { .. } => true,
            Self::IndexExhausted { .. } => true,
            Self::WeakPublicKey => true,

            Self::IndexMismatch { .. } => false,
        }
    }
}
