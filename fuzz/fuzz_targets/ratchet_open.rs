//! Fuzz target for the message ratchet receive path
//!
//! A sender seals a few genuine messages; the fuzzer then interleaves them
//! with forged ones (arbitrary public index and ciphertext) on the receiver.
//!
//! # Invariants
//!
//! - `open` never panics
//! - A rejected message never advances the receiver
//! - Genuine messages delivered in order always open

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use tandem_crypto::{RatchetState, RatchetedMessage, SecretKey};

#[derive(Debug, Arbitrary)]
struct Scenario {
    master_key: [u8; 32],
    /// Starting index, masked to 62 bits like a real schedule
    index: u64,
    session_id: [u8; 32],
    steps: Vec<Step>,
}

#[derive(Debug, Arbitrary)]
enum Step {
    /// Seal a message and deliver it
    Genuine { plaintext: Vec<u8> },
    /// Deliver a forged message
    Forged { public_index: u16, ciphertext: Vec<u8> },
    /// Deliver a genuine message with one bit flipped
    Flipped { plaintext: Vec<u8>, bit: usize },
}

fuzz_target!(|scenario: Scenario| {
    let index = scenario.index & ((1 << 62) - 1);
    let mut sender =
        RatchetState::new(SecretKey::from_bytes(scenario.master_key), index, scenario.session_id);
    let mut receiver =
        RatchetState::new(SecretKey::from_bytes(scenario.master_key), index, scenario.session_id);

    for step in scenario.steps.into_iter().take(64) {
        let before = receiver.index();
        match step {
            Step::Genuine { plaintext } => {
                let Ok(message) = sender.seal(&plaintext) else { return };
                let opened = receiver.open(&message).expect("genuine in-order message must open");
                assert_eq!(opened, plaintext);
                assert_eq!(receiver.index(), before + 1);
            },
            Step::Forged { public_index, ciphertext } => {
                let forged = RatchetedMessage { public_index, ciphertext };
                if receiver.open(&forged).is_err() {
                    assert_eq!(receiver.index(), before);
                }
            },
            Step::Flipped { plaintext, bit } => {
                // Sealed on a replayed copy so the sender stays in step
                let mut shadow = RatchetState::new(
                    SecretKey::from_bytes(scenario.master_key),
                    index,
                    scenario.session_id,
                );
                while shadow.index() < sender.index() {
                    let Ok(_) = shadow.seal(&[]) else { return };
                }
                let Ok(mut message) = shadow.seal(&plaintext) else { return };
                let bit = bit % (message.ciphertext.len() * 8);
                message.ciphertext[bit / 8] ^= 1 << (bit % 8);

                assert!(receiver.open(&message).is_err());
                assert_eq!(receiver.index(), before);
            },
        }
    }
});
