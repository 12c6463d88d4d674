//! Established sessions.
//!
//! A completed handshake yields an [`EstablishedSession`]: one ratchet per
//! direction plus the SAS verification status. In first-contact mode the
//! session refuses application traffic until the SAS has been confirmed on
//! the out-of-band channel (unless the handshake was configured otherwise).
//! The replacement cached secret of such a session is only stored once the
//! SAS matches.

use std::fmt;

use tandem_crypto::{RatchetState, Role, Sas};

use crate::{
    cached_secret::PendingSecret,
    error::SessionError,
    handshake::HandshakeMode,
    identity::Identity,
    wire::{AppMessage, Payload, WireMessage},
};

/// Out-of-band channel used to compare the SAS between humans.
pub trait SasChannel {
    /// Show the SAS to the local user.
    fn present_sas(&mut self, sas: Sas);

    /// Ask the local user whether the peer reported the same SAS.
    fn confirm_sas(&mut self, sas: Sas) -> bool;
}

/// SAS verification status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SasVerification {
    /// First-contact session, SAS not yet compared
    Unverified,
    /// SAS compared and matched
    Verified,
    /// Resumption session, or SAS confirmation disabled
    NotRequired,
    /// SAS compared and did not match (terminal)
    Rejected,
}

impl SasVerification {
    /// True if application traffic may flow.
    pub fn permits_traffic(self) -> bool {
        matches!(self, Self::Verified | Self::NotRequired)
    }
}

/// Parameters of a completed handshake.
pub(crate) struct SessionParams {
    pub session_id: u64,
    pub role: Role,
    pub local: Identity,
    pub peer: Identity,
    pub mode: HandshakeMode,
    pub sas: Sas,
    pub verification: SasVerification,
}

/// Ratchets and metadata of one established conversation.
pub struct EstablishedSession {
    params: SessionParams,
    send: RatchetState,
    receive: RatchetState,
    pending_secret: Option<PendingSecret>,
}

impl EstablishedSession {
    pub(crate) fn new(
        params: SessionParams,
        send: RatchetState,
        receive: RatchetState,
        pending_secret: Option<PendingSecret>,
    ) -> Self {
        Self { params, send, receive, pending_secret }
    }

    /// Handshake session identifier carried by every message.
    pub fn session_id(&self) -> u64 {
        self.params.session_id
    }

    /// Role this party played in the handshake.
    pub fn role(&self) -> Role {
        self.params.role
    }

    /// Local identity.
    pub fn local(&self) -> &Identity {
        &self.params.local
    }

    /// Peer identity.
    pub fn peer(&self) -> &Identity {
        &self.params.peer
    }

    /// How the peer was authenticated.
    pub fn mode(&self) -> HandshakeMode {
        self.params.mode
    }

    /// Short authentication string of this session.
    pub fn sas(&self) -> Sas {
        self.params.sas
    }

    /// Current SAS verification status.
    pub fn verification(&self) -> SasVerification {
        self.params.verification
    }

    /// Full index of the next outgoing message.
    pub fn send_index(&self) -> u64 {
        self.send.index()
    }

    /// Full index of the next expected incoming message.
    pub fn receive_index(&self) -> u64 {
        self.receive.index()
    }

    /// Compare the SAS over the out-of-band channel.
    ///
    /// Only an `Unverified` session asks the channel; every other status is
    /// returned unchanged. A mismatch is permanent.
    ///
    /// A match stores the session's replacement cached secret, unless another
    /// handshake for the same pair stored one first. A mismatch discards it.
    pub fn confirm_sas(&mut self, channel: &mut impl SasChannel) -> SasVerification {
        if self.params.verification != SasVerification::Unverified {
            return self.params.verification;
        }

        channel.present_sas(self.params.sas);
        let pending = self.pending_secret.take();
        self.params.verification = if channel.confirm_sas(self.params.sas) {
            tracing::info!(session_id = self.params.session_id, "SAS confirmed");
            if pending.is_some_and(|secret| !secret.commit()) {
                tracing::warn!(
                    session_id = self.params.session_id,
                    "cached secret replaced by another session, keeping it"
                );
            }
            SasVerification::Verified
        } else {
            tracing::warn!(session_id = self.params.session_id, "SAS rejected");
            SasVerification::Rejected
        };
        self.params.verification
    }

    /// Encrypt an application message and encode it for the wire.
    ///
    /// # Errors
    ///
    /// - `SasUnverified` / `SasRejected` if traffic is not yet permitted
    /// - `IndexExhausted` if the send ratchet cannot advance
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, SessionError> {
        self.check_traffic()?;

        let message = self.send.seal(plaintext)?;
        let wire =
            WireMessage::new(self.params.session_id, Payload::Application(AppMessage::from(message)));
        Ok(wire.encode()?)
    }

    /// Decode and decrypt an application message.
    ///
    /// The receive ratchet is untouched on every error.
    ///
    /// # Errors
    ///
    /// - `SasUnverified` / `SasRejected` if traffic is not yet permitted
    /// - `Malformed` if the bytes do not decode
    /// - `WrongSession` / `UnexpectedMessage` for messages not meant here
    /// - `IndexMismatch` if the message is not the expected next one
    /// - `DecryptionFailure` if authentication fails
    pub fn open(&mut self, bytes: &[u8]) -> Result<Vec<u8>, SessionError> {
        self.check_traffic()?;

        let wire = WireMessage::decode(bytes)?;
        if wire.session_id != self.params.session_id {
            return Err(SessionError::WrongSession {
                expected: self.params.session_id,
                actual: wire.session_id,
            });
        }

        match wire.payload {
            Payload::Application(message) => Ok(self.receive.open(&message.into())?),
            other => Err(SessionError::UnexpectedMessage { message: other.name() }),
        }
    }

    fn check_traffic(&self) -> Result<(), SessionError> {
        match self.params.verification {
            SasVerification::Verified | SasVerification::NotRequired => Ok(()),
            SasVerification::Unverified => Err(SessionError::SasUnverified),
            SasVerification::Rejected => Err(SessionError::SasRejected),
        }
    }
}

impl fmt::Debug for EstablishedSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EstablishedSession")
            .field("session_id", &self.params.session_id)
            .field("role", &self.params.role)
            .field("peer", &self.params.peer)
            .field("mode", &self.params.mode)
            .field("verification", &self.params.verification)
            .field("send_index", &self.send.index())
            .field("receive_index", &self.receive.index())
            .field("secret_pending", &self.pending_secret.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use tandem_crypto::SecretKey;

    use super::*;
    use crate::{
        cached_secret::{CachedSecret, CachedSecretStore},
        identity::IdentityPair,
    };

    struct Scripted {
        answer: bool,
        presented: Vec<Sas>,
    }

    impl SasChannel for Scripted {
        fn present_sas(&mut self, sas: Sas) {
            self.presented.push(sas);
        }

        fn confirm_sas(&mut self, _sas: Sas) -> bool {
            self.answer
        }
    }

    fn params(role: Role, verification: SasVerification) -> SessionParams {
        let (local, peer) = match role {
            Role::Initiator => ("alice", "bob"),
            Role::Responder => ("bob", "alice"),
        };
        SessionParams {
            session_id: 42,
            role,
            local: local.into(),
            peer: peer.into(),
            mode: HandshakeMode::FirstContact,
            sas: sas_of(&[1u8; 32]),
            verification,
        }
    }

    fn sas_of(seed: &[u8; 32]) -> Sas {
        // Any key schedule output will do; derive one from a fixed point
        let a = tandem_crypto::KeyPair::from_secret_bytes(*seed);
        let b = tandem_crypto::KeyPair::from_secret_bytes([2u8; 32]);
        let z = a.diffie_hellman(&b.public_key()).unwrap();
        tandem_crypto::KeySchedule::new(&z, None, b"ctx", None).session_keys(Role::Initiator).sas
    }

    fn pair(verification: SasVerification) -> (EstablishedSession, EstablishedSession) {
        let a_to_b = SecretKey::from_bytes([0xA1; 32]);
        let b_to_a = SecretKey::from_bytes([0xB2; 32]);
        let sid = [0x5A; 32];

        let alice = EstablishedSession::new(
            params(Role::Initiator, verification),
            RatchetState::new(a_to_b.clone(), 100, sid),
            RatchetState::new(b_to_a.clone(), 900, sid),
            None,
        );
        let bob = EstablishedSession::new(
            params(Role::Responder, verification),
            RatchetState::new(b_to_a, 900, sid),
            RatchetState::new(a_to_b, 100, sid),
            None,
        );
        (alice, bob)
    }

    /// Unverified session whose replacement secret waits in `store`.
    fn awaiting_secret(store: &CachedSecretStore, replacement: u8) -> EstablishedSession {
        let key = SecretKey::from_bytes([0xC3; 32]);
        let lease = store.lease(store_pair()).unwrap();
        let pending = lease.defer(CachedSecret::new(SecretKey::from_bytes([replacement; 32])));

        EstablishedSession::new(
            params(Role::Initiator, SasVerification::Unverified),
            RatchetState::new(key.clone(), 0, [0x5A; 32]),
            RatchetState::new(key, 0, [0x5A; 32]),
            Some(pending),
        )
    }

    fn store_pair() -> IdentityPair {
        IdentityPair::new("alice".into(), "bob".into())
    }

    #[test]
    fn messages_flow_both_ways_when_verification_not_required() {
        let (mut alice, mut bob) = pair(SasVerification::NotRequired);

        let wire = alice.seal(b"hi bob").unwrap();
        assert_eq!(bob.open(&wire).unwrap(), b"hi bob");

        let wire = bob.seal(b"hi alice").unwrap();
        assert_eq!(alice.open(&wire).unwrap(), b"hi alice");

        assert_eq!(alice.send_index(), 101);
        assert_eq!(bob.receive_index(), 101);
    }

    #[test]
    fn unverified_session_refuses_traffic() {
        let (mut alice, _) = pair(SasVerification::Unverified);
        assert_eq!(alice.seal(b"too early"), Err(SessionError::SasUnverified));
    }

    #[test]
    fn confirming_sas_unlocks_traffic() {
        let (mut alice, mut bob) = pair(SasVerification::Unverified);
        let mut channel = Scripted { answer: true, presented: Vec::new() };

        assert_eq!(alice.confirm_sas(&mut channel), SasVerification::Verified);
        assert_eq!(bob.confirm_sas(&mut channel), SasVerification::Verified);
        assert_eq!(channel.presented.len(), 2);

        let wire = alice.seal(b"verified").unwrap();
        assert_eq!(bob.open(&wire).unwrap(), b"verified");
    }

    #[test]
    fn rejected_sas_is_permanent() {
        let (mut alice, _) = pair(SasVerification::Unverified);
        let mut reject = Scripted { answer: false, presented: Vec::new() };
        let mut accept = Scripted { answer: true, presented: Vec::new() };

        assert_eq!(alice.confirm_sas(&mut reject), SasVerification::Rejected);
        assert_eq!(alice.confirm_sas(&mut accept), SasVerification::Rejected);
        assert!(accept.presented.is_empty());
        assert_eq!(alice.seal(b"no"), Err(SessionError::SasRejected));
    }

    #[test]
    fn confirmed_sas_stores_replacement_secret() {
        let store = CachedSecretStore::new();
        let mut session = awaiting_secret(&store, 9);
        assert!(store.is_empty());

        let mut channel = Scripted { answer: true, presented: Vec::new() };
        assert_eq!(session.confirm_sas(&mut channel), SasVerification::Verified);

        let expected = CachedSecret::new(SecretKey::from_bytes([9; 32]));
        assert_eq!(store.get(&store_pair()), Some(expected));
    }

    #[test]
    fn rejected_sas_discards_replacement_secret() {
        let store = CachedSecretStore::new();
        let old = CachedSecret::new(SecretKey::from_bytes([1; 32]));
        store.insert(store_pair(), old.clone());
        let mut session = awaiting_secret(&store, 9);

        let mut reject = Scripted { answer: false, presented: Vec::new() };
        assert_eq!(session.confirm_sas(&mut reject), SasVerification::Rejected);

        // A later confirmation attempt cannot resurrect it either
        let mut accept = Scripted { answer: true, presented: Vec::new() };
        session.confirm_sas(&mut accept);
        assert_eq!(store.get(&store_pair()), Some(old));
    }

    #[test]
    fn out_of_order_message_does_not_advance() {
        let (mut alice, mut bob) = pair(SasVerification::NotRequired);
        let first = alice.seal(b"one").unwrap();
        let second = alice.seal(b"two").unwrap();

        assert!(matches!(bob.open(&second), Err(SessionError::IndexMismatch { .. })));
        assert_eq!(bob.receive_index(), 100);
        assert_eq!(bob.open(&first).unwrap(), b"one");
        assert_eq!(bob.open(&second).unwrap(), b"two");
    }

    #[test]
    fn message_for_other_session_is_rejected() {
        let (mut alice, mut bob) = pair(SasVerification::NotRequired);
        let mut wire = WireMessage::decode(&alice.seal(b"x").unwrap()).unwrap();
        wire.session_id = 7;

        let result = bob.open(&wire.encode().unwrap());
        assert_eq!(result, Err(SessionError::WrongSession { expected: 42, actual: 7 }));
    }

    #[test]
    fn debug_is_redacted() {
        let (alice, _) = pair(SasVerification::NotRequired);
        let rendered = format!("{alice:?}");
        assert!(rendered.contains("send_index: 100"));
        assert!(!rendered.contains("SecretKey"));
    }
}
