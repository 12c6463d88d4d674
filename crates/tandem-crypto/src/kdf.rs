//! Key derivation schedule.
//!
//! `derive(key, label, context) = HMAC(key, label || context)`. The handshake
//! turns an X25519 shared point into a derivation key in two steps and then
//! expands it into one subkey per [`SubkeyLabel`]:
//!
//! ```text
//! kdk  = HMAC(transcript hash or null key, Z)
//! kdk2 = HMAC(kdk, PROTOCOL_LABEL || ALGORITHM_ID || context || cached secret)
//! key  = HMAC(kdk2, label || context)
//! ```
//!
//! Subkeys are derived under role-absolute labels (initiator / responder) and
//! mapped to sender / receiver by [`SessionKeys::for_role`], so both parties
//! compute the same values with the directions swapped.

use std::fmt;

use zeroize::Zeroize;

use crate::primitives::{Digest, SecretKey, SharedPoint, mac};

/// Protocol label mixed into every `kdk2`.
pub const PROTOCOL_LABEL: &[u8] = b"tandem-handshake-v1";

/// Algorithm identifier mixed into every `kdk2`.
pub const ALGORITHM_ID: &[u8] = b"X25519-SHA256-HMAC-XChaCha20Poly1305";

/// Initial indices keep the top two bits clear so a session has at least
/// 2^62 messages per direction before exhaustion.
const INDEX_MASK: u64 = u64::MAX >> 2;

/// Number of decimal digits in a SAS.
const SAS_MODULUS: u32 = 1_000_000;

/// Which side of the handshake a party plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Party that fetched the bundle and sent Start/Commit
    Initiator,
    /// Party that published the bundle and answered
    Responder,
}

impl Role {
    /// The other role.
    pub fn peer(self) -> Self {
        match self {
            Self::Initiator => Self::Responder,
            Self::Responder => Self::Initiator,
        }
    }

    /// Label mixed into cached-secret MACs.
    pub fn label(self) -> &'static [u8] {
        match self {
            Self::Initiator => b"initiator",
            Self::Responder => b"responder",
        }
    }
}

/// Distinct derivation labels. No two labels share a byte string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubkeyLabel {
    /// Master key for initiator → responder messages
    InitiatorMasterKey,
    /// Master key for responder → initiator messages
    ResponderMasterKey,
    /// Initiator's confirmation MAC key
    InitiatorMac,
    /// Responder's confirmation MAC key
    ResponderMac,
    /// Short authentication string
    Sas,
    /// Cached secret for the next handshake between this pair
    CachedSecret,
    /// Initial index for initiator → responder messages
    InitiatorIndex,
    /// Initial index for responder → initiator messages
    ResponderIndex,
    /// Master key for the pre-handshake bootstrap message
    ProvisionalMasterKey,
    /// Index for the pre-handshake bootstrap message
    ProvisionalIndex,
    /// Ratchet step from one master key to the next
    MessageKey,
}

impl SubkeyLabel {
    /// Byte string fed into the MAC.
    pub fn as_bytes(self) -> &'static [u8] {
        match self {
            Self::InitiatorMasterKey => b"InitiatorMasterKey",
            Self::ResponderMasterKey => b"ResponderMasterKey",
            Self::InitiatorMac => b"InitiatorMAC",
            Self::ResponderMac => b"ResponderMAC",
            Self::Sas => b"SAS",
            Self::CachedSecret => b"CachedSecret",
            Self::InitiatorIndex => b"InitiatorIndex",
            Self::ResponderIndex => b"ResponderIndex",
            Self::ProvisionalMasterKey => b"ProvisionalMasterKey",
            Self::ProvisionalIndex => b"ProvisionalIndex",
            Self::MessageKey => b"MessageKey",
        }
    }
}

/// Labelled derivation: `HMAC(key, label || context)`.
pub fn derive(key: &SecretKey, label: SubkeyLabel, context: &[u8]) -> SecretKey {
    SecretKey::from_bytes(mac(key.as_bytes(), &[label.as_bytes(), context]))
}

/// Ratchet step: the master key that follows `master_key` at `index`.
pub fn next_master_key(master_key: &SecretKey, session_id: &Digest, index: u64) -> SecretKey {
    let mut context = [0u8; 40];
    context[..32].copy_from_slice(session_id);
    context[32..].copy_from_slice(&index.to_be_bytes());
    derive(master_key, SubkeyLabel::MessageKey, &context)
}

/// Short authentication string compared by the two humans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Sas(u32);

impl Sas {
    /// Six-digit numeric value.
    pub fn value(self) -> u32 {
        self.0
    }

    fn from_key(key: &SecretKey) -> Self {
        let bytes = key.as_bytes();
        let raw = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        Self(raw % SAS_MODULUS)
    }
}

impl fmt::Display for Sas {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03} {:03}", self.0 / 1000, self.0 % 1000)
    }
}

/// Derivation key `kdk2` together with the context it was built for.
pub struct KeySchedule {
    kdk2: SecretKey,
    context: Vec<u8>,
}

impl KeySchedule {
    /// Run steps 1 and 2 of the schedule.
    ///
    /// `transcript_hash` keys step 1; `None` selects the fixed null key (used
    /// only for the provisional bootstrap). `cached_secret` of `None` encodes
    /// as an empty component, distinct from any 32-byte secret.
    pub fn new(
        shared: &SharedPoint,
        transcript_hash: Option<&Digest>,
        context: &[u8],
        cached_secret: Option<&SecretKey>,
    ) -> Self {
        let null = SecretKey::null();
        let step_key = transcript_hash.unwrap_or(null.as_bytes());

        let kdk = SecretKey::from_bytes(mac(step_key, &[shared.as_bytes().as_slice()]));
        let cs: &[u8] = match cached_secret {
            Some(cs) => cs.as_bytes(),
            None => &[],
        };
        let kdk2 = SecretKey::from_bytes(mac(kdk.as_bytes(), &[
            PROTOCOL_LABEL,
            ALGORITHM_ID,
            context,
            cs,
        ]));

        Self { kdk2, context: context.to_vec() }
    }

    /// Derive one labelled subkey.
    pub fn subkey(&self, label: SubkeyLabel) -> SecretKey {
        derive(&self.kdk2, label, &self.context)
    }

    /// Derive one labelled initial index.
    pub fn index(&self, label: SubkeyLabel) -> u64 {
        let key = self.subkey(label);
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&key.as_bytes()[..8]);
        let index = u64::from_be_bytes(raw) & INDEX_MASK;
        raw.zeroize();
        index
    }

    /// The derivation key itself.
    pub fn derivation_key(&self) -> &SecretKey {
        &self.kdk2
    }

    /// Expand the full subkey bundle from `role`'s point of view.
    pub fn session_keys(&self, role: Role) -> SessionKeys {
        SessionKeys::for_role(self, role)
    }

    /// Provisional key/index pair for the bootstrap message.
    pub fn provisional(&self) -> ProvisionalKeys {
        ProvisionalKeys {
            master_key: self.subkey(SubkeyLabel::ProvisionalMasterKey),
            index: self.index(SubkeyLabel::ProvisionalIndex),
        }
    }
}

impl fmt::Debug for KeySchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeySchedule").field("context_len", &self.context.len()).finish()
    }
}

impl Drop for KeySchedule {
    fn drop(&mut self) {
        self.context.zeroize();
    }
}

/// Key/index pair for the pre-handshake bootstrap message.
#[derive(Debug)]
pub struct ProvisionalKeys {
    /// Master key for the single provisional message
    pub master_key: SecretKey,
    /// Index bound into the provisional message's associated data
    pub index: u64,
}

/// Everything one completed handshake yields for one party.
///
/// Produced once, then forked into two ratchet states and dropped. All key
/// fields zeroize on drop.
#[derive(Debug)]
pub struct SessionKeys {
    /// Master key for messages this party sends
    pub sender_master_key: SecretKey,
    /// Master key for messages this party receives
    pub receiver_master_key: SecretKey,
    /// This party's confirmation MAC key
    pub sender_mac: SecretKey,
    /// The peer's confirmation MAC key
    pub receiver_mac: SecretKey,
    /// Short authentication string
    pub sas: Sas,
    /// Cached secret replacing the stored one for this pair
    pub new_cached_secret: SecretKey,
    /// Initial index for messages this party sends
    pub sender_index: u64,
    /// Initial index for messages this party receives
    pub receiver_index: u64,
}

impl SessionKeys {
    /// Map role-absolute subkeys onto sender / receiver for `role`.
    pub fn for_role(schedule: &KeySchedule, role: Role) -> Self {
        let (send_key, recv_key, send_mac, recv_mac, send_index, recv_index) = match role {
            Role::Initiator => (
                SubkeyLabel::InitiatorMasterKey,
                SubkeyLabel::ResponderMasterKey,
                SubkeyLabel::InitiatorMac,
                SubkeyLabel::ResponderMac,
                SubkeyLabel::InitiatorIndex,
                SubkeyLabel::ResponderIndex,
            ),
            Role::Responder => (
                SubkeyLabel::ResponderMasterKey,
                SubkeyLabel::InitiatorMasterKey,
                SubkeyLabel::ResponderMac,
                SubkeyLabel::InitiatorMac,
                SubkeyLabel::ResponderIndex,
                SubkeyLabel::InitiatorIndex,
            ),
        };

        let sas_key = schedule.subkey(SubkeyLabel::Sas);

        Self {
            sender_master_key: schedule.subkey(send_key),
            receiver_master_key: schedule.subkey(recv_key),
            sender_mac: schedule.subkey(send_mac),
            receiver_mac: schedule.subkey(recv_mac),
            sas: Sas::from_key(&sas_key),
            new_cached_secret: schedule.subkey(SubkeyLabel::CachedSecret),
            sender_index: schedule.index(send_index),
            receiver_index: schedule.index(recv_index),
        }
    }
}
