//! CBOR wire messages.
//!
//! Every message travels inside a [`WireMessage`] envelope that names the
//! handshake session it belongs to. Handshake messages are absorbed into the
//! transcript exactly as they appear on the wire, so decoding is strict:
//!
//! - Unknown fields are rejected
//! - Bytes must be the canonical encoding of the decoded value; anything that
//!   decodes but re-encodes differently is rejected as non-canonical
//!
//! Together these make every accepted byte string map to exactly one value,
//! which is what lets a single flipped bit break the transcript instead of
//! silently decoding to the same message.

use serde::{Deserialize, Serialize};
use tandem_crypto::{Digest, PUBLIC_KEY_SIZE, RatchetedMessage};

use crate::{error::WireError, identity::Identity};

/// Largest accepted wire message in bytes.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Envelope for every message exchanged between two parties.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WireMessage {
    /// Handshake session identifier chosen by the initiator
    pub session_id: u64,
    /// Message body
    pub payload: Payload,
}

/// All message bodies, in protocol order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    /// Initiator opens the session, optionally with a provisional message
    Start(Start),
    /// Initiator commits to its ephemeral key
    Commit(Commit),
    /// Responder reveals its ephemeral key
    EphemeralResponse(EphemeralResponse),
    /// Initiator reveals its ephemeral key and confirms the schedule
    ConfirmInitiator(ConfirmInitiator),
    /// Responder confirms the schedule
    ConfirmResponder(ConfirmResponder),
    /// Sender abandoned the handshake
    Abort(Abort),
    /// Ratcheted application message
    Application(AppMessage),
}

impl Payload {
    /// Message name for logs and errors.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Start(_) => "Start",
            Self::Commit(_) => "Commit",
            Self::EphemeralResponse(_) => "EphemeralResponse",
            Self::ConfirmInitiator(_) => "ConfirmInitiator",
            Self::ConfirmResponder(_) => "ConfirmResponder",
            Self::Abort(_) => "Abort",
            Self::Application(_) => "Application",
        }
    }
}

/// First message from the initiator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Start {
    /// Initiator identity
    pub initiator: Identity,
    /// Intended responder identity
    pub responder: Identity,
    /// Provisional first message, present only when a bundle was available
    pub bootstrap: Option<Bootstrap>,
}

/// Provisional message encrypted to the responder's bundle key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Bootstrap {
    /// Initiator's bootstrap public key
    pub public_key: [u8; PUBLIC_KEY_SIZE],
    /// Public portion of the provisional index
    pub public_index: u16,
    /// AEAD ciphertext of the first message
    pub ciphertext: Vec<u8>,
}

/// Initiator's commitment to its ephemeral key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Commit {
    /// SHA-256 of the initiator's ephemeral public key
    pub commitment: Digest,
    /// Cached-secret MAC over (commitment, "initiator"), resumption only
    pub mac: Option<Digest>,
}

/// Responder's ephemeral key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EphemeralResponse {
    /// Responder's ephemeral public key
    pub public_key: [u8; PUBLIC_KEY_SIZE],
    /// Cached-secret MAC over (own commitment, "responder"), resumption only
    pub mac: Option<Digest>,
}

/// Initiator's key reveal and confirmation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfirmInitiator {
    /// Initiator's ephemeral public key, checked against the commitment
    pub public_key: [u8; PUBLIC_KEY_SIZE],
    /// MAC under the initiator's confirmation key
    pub mac: Digest,
}

/// Responder's confirmation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfirmResponder {
    /// MAC under the responder's confirmation key
    pub mac: Digest,
}

/// Handshake abandoned by the sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Abort {
    /// Error kind that caused the abort
    pub reason: String,
}

/// Ratcheted application message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppMessage {
    /// Public portion of the sender's index
    pub public_index: u16,
    /// AEAD ciphertext
    pub ciphertext: Vec<u8>,
}

impl From<RatchetedMessage> for AppMessage {
    fn from(msg: RatchetedMessage) -> Self {
        Self { public_index: msg.public_index, ciphertext: msg.ciphertext }
    }
}

impl From<AppMessage> for RatchetedMessage {
    fn from(msg: AppMessage) -> Self {
        Self { public_index: msg.public_index, ciphertext: msg.ciphertext }
    }
}

impl WireMessage {
    /// Wrap a payload for a session.
    pub fn new(session_id: u64, payload: Payload) -> Self {
        Self { session_id, payload }
    }

    /// Encode to CBOR.
    ///
    /// # Errors
    ///
    /// - `WireError::CborEncode` if serialization fails
    /// - `WireError::TooLarge` if the encoding exceeds [`MAX_MESSAGE_SIZE`]
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let mut buf = Vec::new();
        ciborium::ser::into_writer(self, &mut buf)
            .map_err(|e| WireError::CborEncode(e.to_string()))?;

        if buf.len() > MAX_MESSAGE_SIZE {
            return Err(WireError::TooLarge { size: buf.len(), max: MAX_MESSAGE_SIZE });
        }
        Ok(buf)
    }

    /// Decode from CBOR, rejecting oversized and non-canonical input.
    ///
    /// # Errors
    ///
    /// - `WireError::TooLarge` if `bytes` exceeds [`MAX_MESSAGE_SIZE`]
    /// - `WireError::CborDecode` if deserialization fails
    /// - `WireError::NonCanonical` if `bytes` is not the canonical encoding
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() > MAX_MESSAGE_SIZE {
            return Err(WireError::TooLarge { size: bytes.len(), max: MAX_MESSAGE_SIZE });
        }

        let message: Self =
            ciborium::de::from_reader(bytes).map_err(|e| WireError::CborDecode(e.to_string()))?;

        if message.encode()? != bytes {
            return Err(WireError::NonCanonical);
        }
        Ok(message)
    }
}
