//! Handshake engine for both roles.
//!
//! # Invariants
//!
//! - Every wire message before the confirmations is absorbed into the
//!   transcript exactly as sent or received
//! - Ephemeral scalars, derived keys and the pair lease live only while the
//!   state is non-terminal
//! - The cached secret store is written only on the transition to
//!   `Established`, or by the session once its SAS matches when that session
//!   requires a SAS comparison
//! - A fallback to first contact while this party holds a cached secret is
//!   reported and always requires the SAS
//! - An error in a non-terminal state moves the engine to `Aborted`; terminal
//!   states reject every call without changing

use std::{sync::Arc, time::Duration};

use tandem_crypto::{
    CryptoError, Digest, KeyPair, KeySchedule, PUBLIC_KEY_SIZE, RatchetState, RatchetedMessage,
    Role, SessionKeys, Transcript, constant_time_eq, hash, mac, verify_mac,
};

use super::{
    HandshakeAction, HandshakeConfig, HandshakeEvent, HandshakeMode, HandshakeState,
};
use crate::{
    cached_secret::{CachedSecret, CachedSecretStore, PairLease},
    directory::Bundle,
    env::Environment,
    error::{ErrorKind, HandshakeError},
    identity::{Identity, IdentityPair},
    session::{EstablishedSession, SasVerification, SessionParams},
    wire::{
        Abort, Bootstrap, Commit, ConfirmInitiator, ConfirmResponder, EphemeralResponse, Payload,
        Start, WireMessage,
    },
};

const CONFIRM_INITIATOR_LABEL: &[u8] = b"ConfirmInitiator";
const CONFIRM_RESPONDER_LABEL: &[u8] = b"ConfirmResponder";

/// Handshake-scoped material, dropped (and zeroized) on any terminal
/// transition.
#[derive(Default)]
struct Pending {
    ephemeral: Option<KeyPair>,
    peer_commitment: Option<Digest>,
    transcript: Transcript,
    cached_secret: Option<CachedSecret>,
    commit_mac_sent: bool,
    cached_secret_mismatch: bool,
    keys: Option<SessionKeys>,
    context: Vec<u8>,
    transcript_hash: Option<Digest>,
    fingerprint: Option<Digest>,
}

/// Handshake state machine for one session.
///
/// Generic over the environment so tests can drive randomness and time
/// deterministically. Time is passed to every method that needs it.
pub struct Handshake<E: Environment> {
    role: Role,
    state: HandshakeState,
    config: HandshakeConfig,
    env: E,
    store: CachedSecretStore,
    local: Identity,
    peer: Option<Identity>,
    session_id: Option<u64>,
    mode: Option<HandshakeMode>,
    bundle_key: Option<Arc<KeyPair>>,
    lease: Option<PairLease>,
    pending: Pending,
    last_activity: Option<E::Instant>,
    abort_notice: Option<ErrorKind>,
    session: Option<EstablishedSession>,
}

impl<E: Environment> Handshake<E> {
    /// Create an initiator in `Idle`.
    pub fn initiator(
        local: Identity,
        store: CachedSecretStore,
        env: E,
        config: HandshakeConfig,
    ) -> Self {
        Self::new(Role::Initiator, local, None, store, env, config)
    }

    /// Create a responder in `Idle`.
    ///
    /// `bundle_key` is the key pair behind the bundle this party published,
    /// shared by every responder handshake of this party. Without it,
    /// provisional messages cannot be decrypted.
    pub fn responder(
        local: Identity,
        bundle_key: Option<Arc<KeyPair>>,
        store: CachedSecretStore,
        env: E,
        config: HandshakeConfig,
    ) -> Self {
        Self::new(Role::Responder, local, bundle_key, store, env, config)
    }

    fn new(
        role: Role,
        local: Identity,
        bundle_key: Option<Arc<KeyPair>>,
        store: CachedSecretStore,
        env: E,
        config: HandshakeConfig,
    ) -> Self {
        Self {
            role,
            state: HandshakeState::Idle,
            config,
            env,
            store,
            local,
            peer: None,
            session_id: None,
            mode: None,
            bundle_key,
            lease: None,
            pending: Pending::default(),
            last_activity: None,
            abort_notice: None,
            session: None,
        }
    }

    /// Role this engine plays.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Current state.
    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Session identifier, once chosen (initiator) or learned (responder).
    pub fn session_id(&self) -> Option<u64> {
        self.session_id
    }

    /// Peer identity, once known.
    pub fn peer(&self) -> Option<&Identity> {
        self.peer.as_ref()
    }

    /// Authentication mode, once decided.
    pub fn mode(&self) -> Option<HandshakeMode> {
        self.mode
    }

    /// Take the established session. `None` before `Established` or if
    /// already taken.
    pub fn take_session(&mut self) -> Option<EstablishedSession> {
        self.session.take()
    }

    /// Start a handshake with `peer` (initiator only).
    ///
    /// Leases the identity pair and asks the driver to fetch the peer's
    /// bundle.
    ///
    /// # Errors
    ///
    /// - `InvalidState` if not an initiator in `Idle`
    /// - `PairBusy` if another handshake holds the pair
    pub fn begin(
        &mut self,
        peer: Identity,
        now: E::Instant,
    ) -> Result<Vec<HandshakeAction>, HandshakeError> {
        let result = self.begin_inner(peer, now);
        self.settle(result)
    }

    fn begin_inner(
        &mut self,
        peer: Identity,
        now: E::Instant,
    ) -> Result<Vec<HandshakeAction>, HandshakeError> {
        self.expect(Role::Initiator, HandshakeState::Idle, "begin")?;

        self.lease = Some(self.store.lease(IdentityPair::new(self.local.clone(), peer.clone()))?);
        self.session_id = Some(self.env.random_u64());
        self.peer = Some(peer.clone());

        self.last_activity = Some(now);
        self.transition(HandshakeState::AwaitingBundle);

        Ok(vec![HandshakeAction::FetchBundle { peer }])
    }

    /// Continue after the directory lookup (initiator only).
    ///
    /// Generates the ephemeral key and sends Start. If `first_message` is
    /// given it is encrypted under a provisional key derived from the
    /// bundle and attached to Start.
    ///
    /// # Errors
    ///
    /// - `InvalidState` if not an initiator in `AwaitingBundle`
    /// - `MissingBundle` if `first_message` is given without a bundle
    pub fn handle_bundle(
        &mut self,
        bundle: Option<Bundle>,
        first_message: Option<&[u8]>,
        now: E::Instant,
    ) -> Result<Vec<HandshakeAction>, HandshakeError> {
        let result = self.handle_bundle_inner(bundle, first_message, now);
        self.settle(result)
    }

    fn handle_bundle_inner(
        &mut self,
        bundle: Option<Bundle>,
        first_message: Option<&[u8]>,
        now: E::Instant,
    ) -> Result<Vec<HandshakeAction>, HandshakeError> {
        self.expect(Role::Initiator, HandshakeState::AwaitingBundle, "handle_bundle")?;
        let (session_id, peer) = self.session_peer()?;

        let bootstrap = match (bundle, first_message) {
            (_, None) => None,
            (None, Some(_)) => return Err(HandshakeError::MissingBundle { peer: peer.to_string() }),
            (Some(bundle), Some(message)) => Some(self.seal_provisional(&peer, &bundle, message)?),
        };

        self.pending.ephemeral = Some(KeyPair::from_secret_bytes(self.env.random_key()));
        self.pending.cached_secret = self.lease.as_ref().and_then(|l| l.cached_secret()).cloned();

        let start = Start { initiator: self.local.clone(), responder: peer, bootstrap };
        let bytes = WireMessage::new(session_id, Payload::Start(start)).encode()?;
        self.pending.transcript.absorb(&bytes);

        self.last_activity = Some(now);
        self.transition(HandshakeState::Committed);

        Ok(vec![HandshakeAction::Send(bytes)])
    }

    /// Send the commitment to the ephemeral key (initiator only).
    ///
    /// Carries a cached-secret MAC when the pair has a cached secret.
    ///
    /// # Errors
    ///
    /// - `InvalidState` if not an initiator in `Committed`
    pub fn send_commit(&mut self, now: E::Instant) -> Result<Vec<HandshakeAction>, HandshakeError> {
        let result = self.send_commit_inner(now);
        self.settle(result)
    }

    fn send_commit_inner(
        &mut self,
        now: E::Instant,
    ) -> Result<Vec<HandshakeAction>, HandshakeError> {
        self.expect(Role::Initiator, HandshakeState::Committed, "send_commit")?;
        let (session_id, _) = self.session_peer()?;
        let commitment = self.ephemeral("send_commit")?.commitment();

        let mac = self
            .pending
            .cached_secret
            .as_ref()
            .map(|cs| mac(cs.as_key().as_bytes(), &[&commitment, Role::Initiator.label()]));
        self.pending.commit_mac_sent = mac.is_some();

        let bytes =
            WireMessage::new(session_id, Payload::Commit(Commit { commitment, mac })).encode()?;
        self.pending.transcript.absorb(&bytes);

        self.last_activity = Some(now);
        self.transition(HandshakeState::AwaitingPeerEphemeral);

        Ok(vec![HandshakeAction::Send(bytes)])
    }

    /// Process wire bytes from the peer.
    ///
    /// # Errors
    ///
    /// - `InvalidState` if the handshake already finished
    /// - `Malformed` if the bytes do not decode
    /// - `UnexpectedMessage` for a message not valid in this state or session
    /// - `CommitmentMismatch`, `AuthenticationFailure`, `DecryptionFailure`
    ///   when a check fails
    /// - `PeerAborted` when the peer sent Abort
    /// - `PairBusy` if the responder cannot lease the pair
    pub fn handle_message(
        &mut self,
        bytes: &[u8],
        now: E::Instant,
    ) -> Result<Vec<HandshakeAction>, HandshakeError> {
        if self.state.is_terminal() {
            return Err(HandshakeError::InvalidState {
                state: self.state,
                operation: "handle_message",
            });
        }

        let result = self.handle_message_inner(bytes);
        if result.is_ok() {
            self.last_activity = Some(now);
        }
        self.settle(result)
    }

    fn handle_message_inner(&mut self, bytes: &[u8]) -> Result<Vec<HandshakeAction>, HandshakeError> {
        let message = WireMessage::decode(bytes)?;

        if self.session_id.is_some_and(|id| id != message.session_id) {
            return Err(HandshakeError::UnexpectedMessage {
                state: self.state,
                message: "message for another session",
            });
        }

        tracing::debug!(
            role = ?self.role,
            state = ?self.state,
            message = message.payload.name(),
            "handshake message received"
        );

        match (self.role, self.state, message.payload) {
            (_, _, Payload::Abort(abort)) => {
                Err(HandshakeError::PeerAborted { reason: abort.reason })
            },
            (Role::Responder, HandshakeState::Idle, Payload::Start(start)) => {
                self.on_start(message.session_id, start, bytes)
            },
            (Role::Responder, HandshakeState::Committed, Payload::Commit(commit)) => {
                self.on_commit(&commit, bytes)
            },
            (
                Role::Initiator,
                HandshakeState::AwaitingPeerEphemeral,
                Payload::EphemeralResponse(response),
            ) => self.on_ephemeral_response(&response, bytes),
            (
                Role::Responder,
                HandshakeState::AwaitingPeerEphemeral,
                Payload::ConfirmInitiator(confirm),
            ) => self.on_confirm_initiator(&confirm),
            (
                Role::Initiator,
                HandshakeState::AwaitingConfirmation,
                Payload::ConfirmResponder(confirm),
            ) => self.on_confirm_responder(&confirm),
            (_, state, payload) => {
                Err(HandshakeError::UnexpectedMessage { state, message: payload.name() })
            },
        }
    }

    /// Cancel the handshake.
    ///
    /// Returns the Abort message for the peer (when a session id exists) and
    /// an `Aborted` action. No-op in a terminal state.
    pub fn abort(&mut self, reason: &str) -> Vec<HandshakeAction> {
        if self.state.is_terminal() {
            return Vec::new();
        }
        self.abort_with(HandshakeError::Cancelled { reason: reason.to_string() })
    }

    /// Elapsed time since the last activity, if the timeout is exceeded.
    ///
    /// `Idle` and terminal states never time out.
    pub fn check_timeout(&self, now: E::Instant) -> Option<Duration> {
        if self.state == HandshakeState::Idle || self.state.is_terminal() {
            return None;
        }

        let elapsed = now - self.last_activity?;
        if elapsed > self.config.timeout { Some(elapsed) } else { None }
    }

    /// Process periodic maintenance.
    ///
    /// Aborts with `Timeout` once the awaited message is overdue.
    pub fn tick(&mut self, now: E::Instant) -> Vec<HandshakeAction> {
        match self.check_timeout(now) {
            Some(elapsed) => self.abort_with(HandshakeError::Timeout { elapsed }),
            None => Vec::new(),
        }
    }

    /// Abort message for the peer after a local failure.
    ///
    /// `None` while the handshake is running, after success, when the peer
    /// aborted first, or before a session id exists.
    pub fn abort_message(&self) -> Option<Vec<u8>> {
        if self.state != HandshakeState::Aborted {
            return None;
        }
        let reason = self.abort_notice?;
        let session_id = self.session_id?;

        WireMessage::new(session_id, Payload::Abort(Abort { reason: reason.to_string() }))
            .encode()
            .ok()
    }

    // Responder steps

    fn on_start(
        &mut self,
        session_id: u64,
        start: Start,
        raw: &[u8],
    ) -> Result<Vec<HandshakeAction>, HandshakeError> {
        if start.responder != self.local {
            return Err(HandshakeError::UnexpectedMessage {
                state: self.state,
                message: "Start for another responder",
            });
        }

        self.session_id = Some(session_id);
        self.peer = Some(start.initiator.clone());
        let lease = self.store.lease(IdentityPair::new(self.local.clone(), start.initiator.clone()))?;
        self.pending.cached_secret = lease.cached_secret().cloned();
        self.lease = Some(lease);

        self.pending.transcript.absorb(raw);

        let mut actions = Vec::new();
        if let Some(bootstrap) = &start.bootstrap {
            let plaintext = self.open_provisional(&start.initiator, bootstrap)?;
            actions.push(HandshakeAction::DeliverProvisional { plaintext });
        }

        self.transition(HandshakeState::Committed);
        Ok(actions)
    }

    fn on_commit(
        &mut self,
        commit: &Commit,
        raw: &[u8],
    ) -> Result<Vec<HandshakeAction>, HandshakeError> {
        let (session_id, _) = self.session_peer()?;
        self.pending.transcript.absorb(raw);

        let resumption = match (&self.pending.cached_secret, &commit.mac) {
            (Some(cs), Some(tag)) => {
                let parts: [&[u8]; 2] = [&commit.commitment, Role::Initiator.label()];
                if !verify_mac(cs.as_key().as_bytes(), &parts, tag) {
                    return Err(HandshakeError::AuthenticationFailure { stage: "Commit" });
                }
                true
            },
            _ => false,
        };

        let mut actions = Vec::new();
        if self.pending.cached_secret.is_some() && !resumption {
            actions.push(self.cached_secret_mismatch(session_id));
        }

        let ephemeral = KeyPair::from_secret_bytes(self.env.random_key());
        let public_key = ephemeral.public_key();
        let mac = match (&self.pending.cached_secret, resumption) {
            (Some(cs), true) => Some(mac(cs.as_key().as_bytes(), &[
                &ephemeral.commitment(),
                Role::Responder.label(),
            ])),
            _ => None,
        };

        let mode = if resumption { HandshakeMode::Resumption } else { HandshakeMode::FirstContact };
        self.mode = Some(mode);
        self.pending.peer_commitment = Some(commit.commitment);
        self.pending.ephemeral = Some(ephemeral);

        let response = EphemeralResponse { public_key, mac };
        let bytes =
            WireMessage::new(session_id, Payload::EphemeralResponse(response)).encode()?;
        self.pending.transcript.absorb(&bytes);

        self.transition(HandshakeState::AwaitingPeerEphemeral);
        actions.push(HandshakeAction::Send(bytes));
        Ok(actions)
    }

    fn on_confirm_initiator(
        &mut self,
        confirm: &ConfirmInitiator,
    ) -> Result<Vec<HandshakeAction>, HandshakeError> {
        let (session_id, peer) = self.session_peer()?;

        let Some(commitment) = self.pending.peer_commitment else {
            return Err(self.missing("peer commitment"));
        };
        if !constant_time_eq(&hash(&confirm.public_key), &commitment) {
            return Err(HandshakeError::CommitmentMismatch);
        }

        let transcript_hash = self.pending.transcript.hash();
        let context = session_context(&peer, &self.local, &transcript_hash);
        let keys = self.derive(&confirm.public_key, &transcript_hash, &context, "ConfirmInitiator")?;

        let parts: [&[u8]; 2] = [CONFIRM_INITIATOR_LABEL, &context];
        if !verify_mac(keys.receiver_mac.as_bytes(), &parts, &confirm.mac) {
            return Err(HandshakeError::AuthenticationFailure { stage: "ConfirmInitiator" });
        }

        let own_public = self.ephemeral("ConfirmInitiator")?.public_key();
        let fingerprint = fingerprint(&confirm.public_key, &own_public, &transcript_hash);

        let reply = ConfirmResponder {
            mac: mac(keys.sender_mac.as_bytes(), &[CONFIRM_RESPONDER_LABEL, &context]),
        };
        let bytes = WireMessage::new(session_id, Payload::ConfirmResponder(reply)).encode()?;

        let mut actions = vec![
            HandshakeAction::Event(HandshakeEvent::Accepted { role: self.role, fingerprint }),
            HandshakeAction::Event(HandshakeEvent::Began { role: self.role, fingerprint }),
            HandshakeAction::Send(bytes),
        ];
        actions.extend(self.establish(keys, transcript_hash, session_id, peer)?);
        Ok(actions)
    }

    // Initiator steps

    fn on_ephemeral_response(
        &mut self,
        response: &EphemeralResponse,
        raw: &[u8],
    ) -> Result<Vec<HandshakeAction>, HandshakeError> {
        let (session_id, peer) = self.session_peer()?;

        let mut mismatch = false;
        let mode = match (&response.mac, self.pending.commit_mac_sent, &self.pending.cached_secret) {
            (Some(tag), true, Some(cs)) => {
                let commitment = hash(&response.public_key);
                let parts: [&[u8]; 2] = [&commitment, Role::Responder.label()];
                if !verify_mac(cs.as_key().as_bytes(), &parts, tag) {
                    return Err(HandshakeError::AuthenticationFailure {
                        stage: "EphemeralResponse",
                    });
                }
                HandshakeMode::Resumption
            },
            (Some(_), _, _) => {
                return Err(HandshakeError::AuthenticationFailure {
                    stage: "EphemeralResponse without cached secret",
                });
            },
            (None, sent, _) => {
                mismatch = sent;
                HandshakeMode::FirstContact
            },
        };
        self.mode = Some(mode);

        let mut actions = Vec::new();
        if mismatch {
            actions.push(self.cached_secret_mismatch(session_id));
        }

        self.pending.transcript.absorb(raw);
        let transcript_hash = self.pending.transcript.hash();
        let context = session_context(&self.local, &peer, &transcript_hash);
        let keys =
            self.derive(&response.public_key, &transcript_hash, &context, "EphemeralResponse")?;

        let own_public = self.ephemeral("EphemeralResponse")?.public_key();
        let fingerprint = fingerprint(&own_public, &response.public_key, &transcript_hash);

        let confirm = ConfirmInitiator {
            public_key: own_public,
            mac: mac(keys.sender_mac.as_bytes(), &[CONFIRM_INITIATOR_LABEL, &context]),
        };
        let bytes = WireMessage::new(session_id, Payload::ConfirmInitiator(confirm)).encode()?;

        self.pending.keys = Some(keys);
        self.pending.context = context;
        self.pending.transcript_hash = Some(transcript_hash);
        self.pending.fingerprint = Some(fingerprint);

        self.transition(HandshakeState::AwaitingConfirmation);
        actions.push(HandshakeAction::Event(HandshakeEvent::Began { role: self.role, fingerprint }));
        actions.push(HandshakeAction::Send(bytes));
        Ok(actions)
    }

    fn on_confirm_responder(
        &mut self,
        confirm: &ConfirmResponder,
    ) -> Result<Vec<HandshakeAction>, HandshakeError> {
        let (session_id, peer) = self.session_peer()?;
        let (Some(keys), Some(transcript_hash), Some(fingerprint)) = (
            self.pending.keys.take(),
            self.pending.transcript_hash,
            self.pending.fingerprint,
        ) else {
            return Err(self.missing("session keys"));
        };

        let parts: [&[u8]; 2] = [CONFIRM_RESPONDER_LABEL, &self.pending.context];
        if !verify_mac(keys.receiver_mac.as_bytes(), &parts, &confirm.mac) {
            return Err(HandshakeError::AuthenticationFailure { stage: "ConfirmResponder" });
        }

        let mut actions =
            vec![HandshakeAction::Event(HandshakeEvent::Accepted { role: self.role, fingerprint })];
        actions.extend(self.establish(keys, transcript_hash, session_id, peer)?);
        Ok(actions)
    }

    // Shared steps

    /// Run the key schedule against the peer's revealed ephemeral key.
    fn derive(
        &self,
        peer_public: &[u8; PUBLIC_KEY_SIZE],
        transcript_hash: &Digest,
        context: &[u8],
        stage: &'static str,
    ) -> Result<SessionKeys, HandshakeError> {
        let shared = self
            .ephemeral(stage)?
            .diffie_hellman(peer_public)
            .map_err(|_| HandshakeError::AuthenticationFailure { stage })?;

        let cached_secret = match self.mode {
            Some(HandshakeMode::Resumption) => {
                self.pending.cached_secret.as_ref().map(CachedSecret::as_key)
            },
            _ => None,
        };

        let schedule = KeySchedule::new(&shared, Some(transcript_hash), context, cached_secret);
        Ok(schedule.session_keys(self.role))
    }

    fn establish(
        &mut self,
        keys: SessionKeys,
        transcript_hash: Digest,
        session_id: u64,
        peer: Identity,
    ) -> Result<Vec<HandshakeAction>, HandshakeError> {
        let Some(mode) = self.mode else {
            return Err(self.missing("mode"));
        };
        let Some(lease) = self.lease.take() else {
            return Err(self.missing("pair lease"));
        };

        let SessionKeys {
            sender_master_key,
            receiver_master_key,
            sas,
            new_cached_secret,
            sender_index,
            receiver_index,
            ..
        } = keys;

        let sas_required =
            self.config.require_sas_in_first_contact || self.pending.cached_secret_mismatch;
        let new_cached_secret = CachedSecret::new(new_cached_secret);
        let (verification, pending_secret) = match mode {
            HandshakeMode::FirstContact if sas_required => {
                (SasVerification::Unverified, Some(lease.defer(new_cached_secret)))
            },
            _ => {
                lease.commit(new_cached_secret);
                (SasVerification::NotRequired, None)
            },
        };

        let params = SessionParams {
            session_id,
            role: self.role,
            local: self.local.clone(),
            peer,
            mode,
            sas,
            verification,
        };
        self.session = Some(EstablishedSession::new(
            params,
            RatchetState::new(sender_master_key, sender_index, transcript_hash),
            RatchetState::new(receiver_master_key, receiver_index, transcript_hash),
            pending_secret,
        ));

        self.pending = Pending::default();
        self.bundle_key = None;
        self.transition(HandshakeState::Established);
        tracing::info!(role = ?self.role, session_id, ?mode, "handshake established");

        let mut actions = Vec::new();
        if mode == HandshakeMode::FirstContact {
            actions.push(HandshakeAction::PresentSas { sas });
        }
        actions.push(HandshakeAction::Established { session_id, mode });
        Ok(actions)
    }

    fn seal_provisional(
        &self,
        peer: &Identity,
        bundle: &Bundle,
        message: &[u8],
    ) -> Result<Bootstrap, HandshakeError> {
        let bootstrap_key = KeyPair::from_secret_bytes(self.env.random_key());
        let public_key = bootstrap_key.public_key();
        let shared = bootstrap_key
            .diffie_hellman(&bundle.public_key)
            .map_err(|_| HandshakeError::AuthenticationFailure { stage: "bundle key" })?;

        let mut ratchet = provisional_ratchet(&shared, &self.local, peer, &public_key);
        let sealed = ratchet.seal(message).map_err(HandshakeError::DecryptionFailure)?;

        Ok(Bootstrap { public_key, public_index: sealed.public_index, ciphertext: sealed.ciphertext })
    }

    fn open_provisional(
        &self,
        initiator: &Identity,
        bootstrap: &Bootstrap,
    ) -> Result<Vec<u8>, HandshakeError> {
        let Some(bundle_key) = &self.bundle_key else {
            return Err(HandshakeError::DecryptionFailure(CryptoError::DecryptionFailed {
                reason: "no bundle key",
            }));
        };
        let shared = bundle_key
            .diffie_hellman(&bootstrap.public_key)
            .map_err(HandshakeError::DecryptionFailure)?;

        let mut ratchet = provisional_ratchet(&shared, initiator, &self.local, &bootstrap.public_key);
        let message = RatchetedMessage {
            public_index: bootstrap.public_index,
            ciphertext: bootstrap.ciphertext.clone(),
        };
        let plaintext = ratchet.open(&message).map_err(|err| match err {
            CryptoError::IndexMismatch { .. } => {
                HandshakeError::DecryptionFailure(CryptoError::DecryptionFailed {
                    reason: "provisional index mismatch",
                })
            },
            other => HandshakeError::DecryptionFailure(other),
        })?;
        Ok(plaintext)
    }

    /// Move to `Aborted`, drop all pending material and the lease, and
    /// return the actions announcing it.
    fn abort_with(&mut self, error: HandshakeError) -> Vec<HandshakeAction> {
        self.fail(&error);

        let mut actions = Vec::new();
        if let Some(bytes) = self.abort_message() {
            actions.push(HandshakeAction::Send(bytes));
        }
        actions.push(HandshakeAction::Aborted { error });
        actions
    }

    fn fail(&mut self, error: &HandshakeError) {
        if self.state.is_terminal() {
            return;
        }

        tracing::warn!(
            role = ?self.role,
            state = ?self.state,
            session_id = ?self.session_id,
            kind = %error.kind(),
            %error,
            "handshake aborted"
        );

        self.abort_notice = match error {
            HandshakeError::PeerAborted { .. } => None,
            other => Some(other.kind()),
        };
        self.pending = Pending::default();
        self.bundle_key = None;
        self.lease = None;
        self.transition(HandshakeState::Aborted);
    }

    fn settle(
        &mut self,
        result: Result<Vec<HandshakeAction>, HandshakeError>,
    ) -> Result<Vec<HandshakeAction>, HandshakeError> {
        if let Err(error) = &result {
            self.fail(error);
        }
        result
    }

    fn transition(&mut self, next: HandshakeState) {
        tracing::debug!(
            role = ?self.role,
            session_id = ?self.session_id,
            from = ?self.state,
            to = ?next,
            "handshake transition"
        );
        self.state = next;
    }

    fn expect(
        &self,
        role: Role,
        state: HandshakeState,
        operation: &'static str,
    ) -> Result<(), HandshakeError> {
        if self.role != role || self.state != state {
            return Err(HandshakeError::InvalidState { state: self.state, operation });
        }
        Ok(())
    }

    fn session_peer(&self) -> Result<(u64, Identity), HandshakeError> {
        match (self.session_id, &self.peer) {
            (Some(session_id), Some(peer)) => Ok((session_id, peer.clone())),
            _ => Err(self.missing("session id")),
        }
    }

    fn ephemeral(&self, operation: &'static str) -> Result<&KeyPair, HandshakeError> {
        self.pending.ephemeral.as_ref().ok_or(HandshakeError::InvalidState {
            state: self.state,
            operation,
        })
    }

    /// Record that the peer did not prove the cached secret we hold.
    fn cached_secret_mismatch(&mut self, session_id: u64) -> HandshakeAction {
        tracing::warn!(
            role = ?self.role,
            session_id,
            "peer skipped the cached secret, falling back to first contact"
        );
        self.pending.cached_secret_mismatch = true;
        HandshakeAction::Event(HandshakeEvent::CachedSecretMismatch { role: self.role })
    }

    fn missing(&self, operation: &'static str) -> HandshakeError {
        HandshakeError::InvalidState { state: self.state, operation }
    }
}

impl<E: Environment> std::fmt::Debug for Handshake<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handshake")
            .field("role", &self.role)
            .field("state", &self.state)
            .field("local", &self.local)
            .field("peer", &self.peer)
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}

/// Length-prefixed concatenation of derivation context components.
fn encode_context(parts: &[&[u8]]) -> Vec<u8> {
    let mut out = Vec::with_capacity(parts.iter().map(|p| p.len() + 4).sum());
    for part in parts {
        out.extend_from_slice(&(part.len() as u32).to_be_bytes());
        out.extend_from_slice(part);
    }
    out
}

/// Context for the full schedule: both identities and the transcript hash.
fn session_context(initiator: &Identity, responder: &Identity, transcript_hash: &Digest) -> Vec<u8> {
    encode_context(&[initiator.as_bytes(), responder.as_bytes(), transcript_hash])
}

/// Ratchet for the single provisional message.
///
/// Keyed with the null key in the first schedule step; the context binds both
/// identities and the bootstrap public key.
fn provisional_ratchet(
    shared: &tandem_crypto::SharedPoint,
    initiator: &Identity,
    responder: &Identity,
    bootstrap_public: &[u8; PUBLIC_KEY_SIZE],
) -> RatchetState {
    let context = encode_context(&[initiator.as_bytes(), responder.as_bytes(), bootstrap_public]);
    let keys = KeySchedule::new(shared, None, &context, None).provisional();
    RatchetState::new(keys.master_key, keys.index, hash(&context))
}

/// Fingerprint shared by the `Began` / `Accepted` events of one session.
fn fingerprint(
    initiator_public: &[u8; PUBLIC_KEY_SIZE],
    responder_public: &[u8; PUBLIC_KEY_SIZE],
    transcript_hash: &Digest,
) -> Digest {
    hash(&[initiator_public.as_slice(), responder_public.as_slice(), transcript_hash.as_slice()].concat())
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Arc,
            atomic::{AtomicU64, Ordering},
        },
        time::Instant,
    };

    use super::*;

    #[derive(Clone)]
    struct TestEnv {
        counter: Arc<AtomicU64>,
    }

    impl TestEnv {
        fn new(seed: u64) -> Self {
            Self { counter: Arc::new(AtomicU64::new(seed)) }
        }
    }

    impl Environment for TestEnv {
        type Instant = Instant;

        fn now(&self) -> Instant {
            Instant::now()
        }

        fn random_bytes(&self, buffer: &mut [u8]) {
            // Deterministic for tests: each call gets a distinct fill
            let n = self.counter.fetch_add(1, Ordering::Relaxed);
            for (i, byte) in buffer.iter_mut().enumerate() {
                *byte = (n as u8).wrapping_mul(31).wrapping_add(i as u8) | 1;
            }
        }
    }

    fn initiator() -> Handshake<TestEnv> {
        Handshake::initiator(
            "alice".into(),
            CachedSecretStore::new(),
            TestEnv::new(1),
            HandshakeConfig::default(),
        )
    }

    #[test]
    fn begin_emits_fetch_bundle() {
        let mut hs = initiator();
        let t0 = Instant::now();

        let actions = hs.begin("bob".into(), t0).unwrap();

        assert_eq!(actions, vec![HandshakeAction::FetchBundle { peer: "bob".into() }]);
        assert_eq!(hs.state(), HandshakeState::AwaitingBundle);
        assert!(hs.session_id().is_some());
    }

    #[test]
    fn first_message_without_bundle_aborts() {
        let mut hs = initiator();
        let t0 = Instant::now();
        hs.begin("bob".into(), t0).unwrap();

        let result = hs.handle_bundle(None, Some(b"hello"), t0);

        assert!(matches!(result, Err(HandshakeError::MissingBundle { .. })));
        assert_eq!(hs.state(), HandshakeState::Aborted);
        assert!(hs.abort_message().is_some());
    }

    #[test]
    fn send_commit_before_bundle_is_invalid_and_aborts() {
        let mut hs = initiator();
        let t0 = Instant::now();
        hs.begin("bob".into(), t0).unwrap();

        let result = hs.send_commit(t0);

        assert!(matches!(result, Err(HandshakeError::InvalidState { .. })));
        assert_eq!(hs.state(), HandshakeState::Aborted);
    }

    #[test]
    fn responder_cannot_begin() {
        let mut hs = Handshake::responder(
            "bob".into(),
            None,
            CachedSecretStore::new(),
            TestEnv::new(2),
            HandshakeConfig::default(),
        );
        let result = hs.begin("alice".into(), Instant::now());
        assert!(matches!(result, Err(HandshakeError::InvalidState { .. })));
    }

    #[test]
    fn idle_never_times_out() {
        let hs = initiator();
        let later = Instant::now() + Duration::from_secs(3600);
        assert_eq!(hs.check_timeout(later), None);
    }

    #[test]
    fn timeout_aborts_and_releases_lease() {
        let store = CachedSecretStore::new();
        let mut hs = Handshake::initiator(
            "alice".into(),
            store.clone(),
            TestEnv::new(3),
            HandshakeConfig::default(),
        );
        let t0 = Instant::now();
        hs.begin("bob".into(), t0).unwrap();

        assert!(hs.tick(t0 + Duration::from_secs(10)).is_empty());

        let actions = hs.tick(t0 + Duration::from_secs(31));
        assert!(matches!(
            actions.last(),
            Some(HandshakeAction::Aborted { error: HandshakeError::Timeout { .. } })
        ));
        assert_eq!(hs.state(), HandshakeState::Aborted);
        assert!(!store.is_leased(&IdentityPair::new("alice".into(), "bob".into())));
    }

    #[test]
    fn cancel_sends_abort_once() {
        let mut hs = initiator();
        let t0 = Instant::now();
        hs.begin("bob".into(), t0).unwrap();

        let actions = hs.abort("user closed window");
        assert_eq!(actions.len(), 2);
        assert!(matches!(actions[0], HandshakeAction::Send(_)));

        assert!(hs.abort("again").is_empty());
    }

    #[test]
    fn context_encoding_is_unambiguous() {
        assert_ne!(encode_context(&[b"ab", b"c"]), encode_context(&[b"a", b"bc"]));
    }
}
