//! Shared in-memory driver for handshake integration tests.

#![allow(dead_code)]

use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Instant,
};

use tandem_core::{
    Bundle, CachedSecretStore, Directory, Environment, EstablishedSession, Handshake,
    HandshakeAction, HandshakeConfig, HandshakeError, HandshakeEvent, Identity, IdentityPair,
    KeyPair, MemoryDirectory, Sas, SasChannel,
};

/// Seeded environment: every call draws a fresh SHA-256 block of
/// (seed, counter).
#[derive(Clone)]
pub struct TestEnv {
    seed: u64,
    counter: Arc<AtomicU64>,
}

impl TestEnv {
    pub fn seeded(seed: u64) -> Self {
        Self { seed, counter: Arc::new(AtomicU64::new(0)) }
    }
}

impl Environment for TestEnv {
    type Instant = Instant;

    fn now(&self) -> Instant {
        Instant::now()
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        for chunk in buffer.chunks_mut(32) {
            let n = self.counter.fetch_add(1, Ordering::Relaxed);
            let mut input = [0u8; 16];
            input[..8].copy_from_slice(&self.seed.to_be_bytes());
            input[8..].copy_from_slice(&n.to_be_bytes());
            let block = tandem_crypto::hash(&input);
            chunk.copy_from_slice(&block[..chunk.len()]);
        }
    }
}

/// One party: its handshake plus everything the driver observed.
pub struct Party {
    pub identity: Identity,
    pub store: CachedSecretStore,
    pub env: TestEnv,
    pub config: HandshakeConfig,
    pub bundle_key: Option<Arc<KeyPair>>,
    pub hs: Handshake<TestEnv>,
    pub events: Vec<HandshakeEvent>,
    pub delivered: Vec<Vec<u8>>,
    pub presented: Option<Sas>,
    pub errors: Vec<HandshakeError>,
    pub sent: Vec<Vec<u8>>,
}

impl Party {
    pub fn initiator(name: &str, seed: u64) -> Self {
        Self::with_store(name, seed, CachedSecretStore::new(), HandshakeConfig::default(), false)
    }

    pub fn responder(name: &str, seed: u64, directory: &MemoryDirectory) -> Self {
        let mut party =
            Self::with_store(name, seed, CachedSecretStore::new(), HandshakeConfig::default(), true);
        party.publish(directory);
        party.reset_responder();
        party
    }

    fn with_store(
        name: &str,
        seed: u64,
        store: CachedSecretStore,
        config: HandshakeConfig,
        responder: bool,
    ) -> Self {
        let env = TestEnv::seeded(seed);
        let identity = Identity::new(name);
        let bundle_key =
            responder.then(|| Arc::new(KeyPair::from_secret_bytes(env.random_key())));
        let hs = Handshake::initiator(identity.clone(), store.clone(), env.clone(), config.clone());
        Self {
            identity,
            store,
            env,
            config,
            bundle_key,
            hs,
            events: Vec::new(),
            delivered: Vec::new(),
            presented: None,
            errors: Vec::new(),
            sent: Vec::new(),
        }
    }

    pub fn publish(&self, directory: &MemoryDirectory) {
        if let Some(key) = &self.bundle_key {
            directory.publish_bundle(self.identity.clone(), Bundle {
                public_key: key.public_key(),
                locator: format!("mem://{}", self.identity),
            });
        }
    }

    /// Fresh initiator handshake sharing this party's store.
    pub fn reset_initiator(&mut self) {
        self.hs = Handshake::initiator(
            self.identity.clone(),
            self.store.clone(),
            self.env.clone(),
            self.config.clone(),
        );
        self.clear_observations();
    }

    /// Fresh responder handshake sharing this party's store and bundle key.
    pub fn reset_responder(&mut self) {
        self.hs = Handshake::responder(
            self.identity.clone(),
            self.bundle_key.clone(),
            self.store.clone(),
            self.env.clone(),
            self.config.clone(),
        );
        self.clear_observations();
    }

    pub fn set_config(&mut self, config: HandshakeConfig) {
        self.config = config;
    }

    fn clear_observations(&mut self) {
        self.events.clear();
        self.delivered.clear();
        self.presented = None;
        self.errors.clear();
        self.sent.clear();
    }

    pub fn pair_with(&self, other: &Party) -> IdentityPair {
        IdentityPair::new(self.identity.clone(), other.identity.clone())
    }

    pub fn session(&mut self) -> Option<EstablishedSession> {
        self.hs.take_session()
    }

    /// Record actions, returning the wire bytes to deliver.
    fn record(&mut self, actions: Vec<HandshakeAction>, out: &mut VecDeque<Vec<u8>>) {
        for action in actions {
            match action {
                HandshakeAction::Send(bytes) => {
                    self.sent.push(bytes.clone());
                    out.push_back(bytes);
                },
                HandshakeAction::Event(event) => self.events.push(event),
                HandshakeAction::DeliverProvisional { plaintext } => self.delivered.push(plaintext),
                HandshakeAction::PresentSas { sas } => self.presented = Some(sas),
                HandshakeAction::FetchBundle { .. }
                | HandshakeAction::Established { .. }
                | HandshakeAction::Aborted { .. } => {},
            }
        }
    }

    /// Run one local step; on failure queue the Abort message.
    fn step(
        &mut self,
        out: &mut VecDeque<Vec<u8>>,
        f: impl FnOnce(&mut Handshake<TestEnv>) -> Result<Vec<HandshakeAction>, HandshakeError>,
    ) -> bool {
        let was_terminal = self.hs.state().is_terminal();
        match f(&mut self.hs) {
            Ok(actions) => {
                self.record(actions, out);
                true
            },
            Err(error) => {
                self.errors.push(error);
                if !was_terminal {
                    if let Some(bytes) = self.hs.abort_message() {
                        self.sent.push(bytes.clone());
                        out.push_back(bytes);
                    }
                }
                false
            },
        }
    }

    pub fn receive(&mut self, bytes: &[u8], now: Instant, out: &mut VecDeque<Vec<u8>>) {
        self.step(out, |hs| hs.handle_message(bytes, now));
    }
}

/// Flip one bit of the `message`-th delivered message.
#[derive(Debug, Clone, Copy)]
pub struct Tamper {
    pub message: usize,
    pub bit: usize,
}

/// Drive a full handshake from `alice` (initiator) to `bob` (responder).
pub fn run(
    alice: &mut Party,
    bob: &mut Party,
    directory: &MemoryDirectory,
    first_message: Option<&[u8]>,
    tamper: Option<Tamper>,
) {
    let now = Instant::now();
    let mut to_bob = VecDeque::new();
    let to_alice = VecDeque::new();
    let peer = bob.identity.clone();

    if !alice.step(&mut to_bob, |hs| hs.begin(peer.clone(), now)) {
        return;
    }
    let bundle = directory.fetch_bundle(&peer);
    if !alice.step(&mut to_bob, |hs| hs.handle_bundle(bundle, first_message, now)) {
        deliver_all(alice, bob, to_bob, to_alice, tamper, now);
        return;
    }
    alice.step(&mut to_bob, |hs| hs.send_commit(now));

    deliver_all(alice, bob, to_bob, to_alice, tamper, now);
}

fn deliver_all(
    alice: &mut Party,
    bob: &mut Party,
    mut to_bob: VecDeque<Vec<u8>>,
    mut to_alice: VecDeque<Vec<u8>>,
    tamper: Option<Tamper>,
    now: Instant,
) {
    let mut index = 0;
    while !to_bob.is_empty() || !to_alice.is_empty() {
        while let Some(mut bytes) = to_bob.pop_front() {
            apply(tamper, index, &mut bytes);
            index += 1;
            bob.receive(&bytes, now, &mut to_alice);
        }
        while let Some(mut bytes) = to_alice.pop_front() {
            apply(tamper, index, &mut bytes);
            index += 1;
            alice.receive(&bytes, now, &mut to_bob);
        }
    }
}

fn apply(tamper: Option<Tamper>, index: usize, bytes: &mut [u8]) {
    let Some(t) = tamper else { return };
    if t.message == index && !bytes.is_empty() {
        let bit = t.bit % (bytes.len() * 8);
        bytes[bit / 8] ^= 1 << (bit % 8);
    }
}

/// Humans comparing codes read out by the peer.
pub struct Humans {
    pub peer_sas: Option<Sas>,
    pub shown: Vec<Sas>,
}

impl Humans {
    pub fn hearing(peer_sas: Option<Sas>) -> Self {
        Self { peer_sas, shown: Vec::new() }
    }
}

impl SasChannel for Humans {
    fn present_sas(&mut self, sas: Sas) {
        self.shown.push(sas);
    }

    fn confirm_sas(&mut self, sas: Sas) -> bool {
        self.peer_sas == Some(sas)
    }
}

/// Every `Accepted` on one side has exactly one matching `Began` on the
/// other side.
pub fn accepted_match_began(receiver: &Party, sender: &Party) -> bool {
    receiver.events.iter().all(|event| match event {
        HandshakeEvent::Accepted { fingerprint, .. } => {
            sender
                .events
                .iter()
                .filter(|e| {
                    matches!(e, HandshakeEvent::Began { fingerprint: f, .. } if f == fingerprint)
                })
                .count()
                == 1
        },
        HandshakeEvent::Began { .. } | HandshakeEvent::CachedSecretMismatch { .. } => true,
    })
}

/// Both humans read their SAS to each other and confirm it, which stores the
/// replacement cached secret on each side.
pub fn confirm_both(
    alice: &mut Party,
    bob: &mut Party,
) -> (EstablishedSession, EstablishedSession) {
    let mut alice_session = alice.session().expect("alice session");
    let mut bob_session = bob.session().expect("bob session");

    alice_session.confirm_sas(&mut Humans::hearing(Some(bob_session.sas())));
    bob_session.confirm_sas(&mut Humans::hearing(Some(alice_session.sas())));
    (alice_session, bob_session)
}
