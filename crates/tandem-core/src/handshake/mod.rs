//! Handshake state machine.
//!
//! One engine serves both roles. It uses the action pattern: methods take the
//! current time and raw wire bytes as input and return actions for the driver
//! to execute. The engine performs no I/O.
//!
//! # State Machine
//!
//! ```text
//! Initiator:
//! ┌──────┐ begin ┌────────────────┐ bundle ┌───────────┐ send_commit ┌───────────────────────┐
//! │ Idle │──────>│ AwaitingBundle │───────>│ Committed │────────────>│ AwaitingPeerEphemeral │
//! └──────┘       └────────────────┘ Start  └───────────┘   Commit    └───────────────────────┘
//!                                                                       │ EphemeralResponse
//!                                                                       ↓ (ConfirmInitiator sent)
//!                                   ┌─────────────┐  ConfirmResponder ┌──────────────────────┐
//!                                   │ Established │<──────────────────│ AwaitingConfirmation │
//!                                   └─────────────┘                   └──────────────────────┘
//!
//! Responder:
//! ┌──────┐ Start ┌───────────┐ Commit ┌───────────────────────┐ ConfirmInitiator ┌─────────────┐
//! │ Idle │──────>│ Committed │───────>│ AwaitingPeerEphemeral │─────────────────>│ Established │
//! └──────┘       └───────────┘        └───────────────────────┘ ConfirmResponder └─────────────┘
//!
//! Any non-terminal state ──error / timeout / cancel──> Aborted
//! ```
//!
//! # Modes
//!
//! The responder runs resumption mode iff it holds a cached secret for the
//! pair and the Commit carries a cached-secret MAC. Otherwise both sides fall
//! back to first-contact mode, which requires an out-of-band SAS comparison.
//! A party that holds a cached secret but sees no MAC from the peer reports
//! [`HandshakeEvent::CachedSecretMismatch`] and always requires the SAS.

mod engine;

use std::time::Duration;

pub use engine::Handshake;
use tandem_crypto::{Digest, Role, Sas};

use crate::{error::HandshakeError, identity::Identity};

/// Time allowed for each awaited handshake message.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Handshake state, shared by both roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandshakeState {
    /// Nothing sent or received
    Idle,
    /// Initiator waiting for the directory lookup
    AwaitingBundle,
    /// Start exchanged; provisional key live
    Committed,
    /// Waiting for the peer to reveal (or answer with) its ephemeral key
    AwaitingPeerEphemeral,
    /// Initiator sent its confirmation, waiting for the responder's
    AwaitingConfirmation,
    /// Keys delivered (terminal)
    Established,
    /// Handshake abandoned, no keys delivered (terminal)
    Aborted,
}

impl HandshakeState {
    /// True for `Established` and `Aborted`.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Established | Self::Aborted)
    }
}

/// How the handshake authenticated the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandshakeMode {
    /// No cached secret; SAS comparison authenticates the session
    FirstContact,
    /// Cached secret from the previous session authenticated both sides
    Resumption,
}

/// Handshake configuration
#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    /// Maximum wait for each awaited message
    pub timeout: Duration,
    /// Block application traffic until the SAS is confirmed in first-contact
    /// mode
    pub require_sas_in_first_contact: bool,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self { timeout: DEFAULT_HANDSHAKE_TIMEOUT, require_sas_in_first_contact: true }
    }
}

/// Authentication events.
///
/// Each party emits `Began` right before sending its confirmation and
/// `Accepted` after verifying the peer's. Both carry the same fingerprint
/// (hash of both ephemeral keys and the transcript), so every `Accepted`
/// can be matched to exactly one `Began` on the other side.
///
/// `CachedSecretMismatch` reports that this party holds a cached secret for
/// the pair but the peer did not prove knowledge of it. The handshake falls
/// back to first contact and the session needs a SAS comparison whatever the
/// configuration says.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandshakeEvent {
    /// This party committed to the derived keys
    Began {
        /// Role of the emitting party
        role: Role,
        /// Session fingerprint
        fingerprint: Digest,
    },
    /// This party verified the peer's confirmation
    Accepted {
        /// Role of the emitting party
        role: Role,
        /// Session fingerprint
        fingerprint: Digest,
    },
    /// The peer answered without the cached-secret MAC this party expected
    CachedSecretMismatch {
        /// Role of the emitting party
        role: Role,
    },
}

/// Actions returned by the handshake for the driver to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeAction {
    /// Send these wire bytes to the peer
    Send(Vec<u8>),

    /// Look up the peer's bundle and call `handle_bundle`
    FetchBundle {
        /// Identity to look up
        peer: Identity,
    },

    /// Provisional first message decrypted by the responder
    DeliverProvisional {
        /// Decrypted first message
        plaintext: Vec<u8>,
    },

    /// Show the SAS on the out-of-band channel
    PresentSas {
        /// Short authentication string
        sas: Sas,
    },

    /// Authentication event for audit
    Event(HandshakeEvent),

    /// Handshake completed; collect the session with `take_session`
    Established {
        /// Handshake session identifier
        session_id: u64,
        /// How the peer was authenticated
        mode: HandshakeMode,
    },

    /// Handshake abandoned
    Aborted {
        /// Cause of the abort
        error: HandshakeError,
    },
}
