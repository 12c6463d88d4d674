//! Fuzz target for the responder state machine
//!
//! Delivers an arbitrary sequence of byte strings to a responder, optionally
//! preceded by a genuine Start so deeper states are reachable.
//!
//! # Invariants
//!
//! - `handle_message` never panics
//! - A responder never establishes from forged input
//! - Once terminal, the state never changes again
//! - An aborted responder holds no lease on the pair

#![no_main]

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Instant,
};

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use tandem_core::{
    CachedSecretStore, Environment, Handshake, HandshakeConfig, HandshakeState, IdentityPair,
    KeyPair,
};

#[derive(Clone)]
struct FuzzEnv {
    counter: Arc<AtomicU64>,
}

impl Environment for FuzzEnv {
    type Instant = Instant;

    fn now(&self) -> Instant {
        Instant::now()
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let block = tandem_crypto::hash(&n.to_be_bytes());
        for (i, byte) in buffer.iter_mut().enumerate() {
            *byte = block[i % block.len()];
        }
    }
}

#[derive(Debug, Arbitrary)]
struct Scenario {
    genuine_start: bool,
    messages: Vec<Vec<u8>>,
}

fuzz_target!(|scenario: Scenario| {
    let env = FuzzEnv { counter: Arc::new(AtomicU64::new(0)) };
    let store = CachedSecretStore::new();
    let bundle_key = Arc::new(KeyPair::from_secret_bytes(env.random_key()));
    let mut responder = Handshake::responder(
        "bob".into(),
        Some(bundle_key),
        store.clone(),
        env.clone(),
        HandshakeConfig::default(),
    );

    let mut inputs = Vec::new();
    if scenario.genuine_start {
        let mut initiator =
            Handshake::initiator("alice".into(), CachedSecretStore::new(), env, HandshakeConfig::default());
        let now = Instant::now();
        let _ = initiator.begin("bob".into(), now);
        if let Ok(actions) = initiator.handle_bundle(None, None, now) {
            for action in actions {
                if let tandem_core::HandshakeAction::Send(bytes) = action {
                    inputs.push(bytes);
                }
            }
        }
    }
    inputs.extend(scenario.messages.into_iter().take(16));

    for bytes in &inputs {
        let before = responder.state();
        let _ = responder.handle_message(bytes, Instant::now());

        if before.is_terminal() {
            assert_eq!(responder.state(), before);
        }
        assert_ne!(responder.state(), HandshakeState::Established);
    }

    if responder.state() == HandshakeState::Aborted {
        let pair = IdentityPair::new("alice".into(), "bob".into());
        assert!(!store.is_leased(&pair));
        assert!(store.is_empty());
    }
});
