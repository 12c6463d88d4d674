//! Per-direction message ratchet
//!
//! # Security Properties
//!
//! - Forward Secrecy: the master key for index `n` is zeroized as soon as the
//!   key for `n + 1` is derived, and the derivation is one-way
//! - Key Uniqueness: each index has its own master key, so the deterministic
//!   AEAD nonce is never reused
//! - Lock-step: the receiver only accepts the exact next index; a mismatching
//!   or undecryptable message leaves the state untouched

use std::fmt;

use crate::{
    aead,
    error::CryptoError,
    kdf::next_master_key,
    primitives::{DIGEST_SIZE, Digest, SecretKey},
};

/// Number of low-order index bits revealed on the wire.
pub const PUBLIC_INDEX_BITS: u32 = 16;

const PUBLIC_INDEX_MASK: u64 = (1 << PUBLIC_INDEX_BITS) - 1;

/// Public (low-order) portion of a full index.
pub fn public_portion(index: u64) -> u16 {
    (index & PUBLIC_INDEX_MASK) as u16
}

/// A ratcheted message as it travels on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RatchetedMessage {
    /// Low-order bits of the sender's index
    pub public_index: u16,
    /// AEAD ciphertext bound to the full index
    pub ciphertext: Vec<u8>,
}

/// Current master key and index for one direction of one session.
///
/// # Invariants
///
/// - Only the current master key is reachable; the previous one is zeroized
///   before this state is observable again
/// - `index` only increases
pub struct RatchetState {
    master_key: SecretKey,
    index: u64,
    session_id: Digest,
}

impl RatchetState {
    /// Start a ratchet from handshake output.
    pub fn new(master_key: SecretKey, index: u64, session_id: Digest) -> Self {
        Self { master_key, index, session_id }
    }

    /// Full index of the next message.
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Public portion of the next message's index.
    pub fn public_index(&self) -> u16 {
        public_portion(self.index)
    }

    #[cfg(test)]
    pub(crate) fn master_key(&self) -> &SecretKey {
        &self.master_key
    }

    /// Session identifier bound into every message.
    pub fn session_id(&self) -> &Digest {
        &self.session_id
    }

    /// Encrypt the next message and advance.
    ///
    /// # Errors
    ///
    /// - `IndexExhausted`: the index cannot be incremented; nothing is
    ///   encrypted and the state is unchanged
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<RatchetedMessage, CryptoError> {
        if self.index == u64::MAX {
            return Err(CryptoError::IndexExhausted { index: self.index });
        }

        let ciphertext =
            aead::encrypt(&self.master_key, &self.associated_data(self.index), plaintext);
        let message = RatchetedMessage { public_index: self.public_index(), ciphertext };

        self.advance();
        Ok(message)
    }

    /// Decrypt the next expected message and advance.
    ///
    /// # Errors
    ///
    /// - `IndexMismatch`: public index is not the expected next value
    /// - `DecryptionFailed`: authentication failed
    /// - `IndexExhausted`: the index cannot be incremented
    ///
    /// The state is unchanged on every error.
    pub fn open(&mut self, message: &RatchetedMessage) -> Result<Vec<u8>, CryptoError> {
        let expected = self.public_index();
        if message.public_index != expected {
            return Err(CryptoError::IndexMismatch { expected, actual: message.public_index });
        }

        if self.index == u64::MAX {
            return Err(CryptoError::IndexExhausted { index: self.index });
        }

        let plaintext = aead::decrypt(
            &self.master_key,
            &self.associated_data(self.index),
            &message.ciphertext,
        )?;

        self.advance();
        Ok(plaintext)
    }

    /// Replace the master key with its successor and increment the index.
    fn advance(&mut self) {
        let next = next_master_key(&self.master_key, &self.session_id, self.index);

        // Assignment drops (and zeroizes) the superseded key
        self.master_key = next;
        self.index += 1;
    }

    /// Session id followed by the full big-endian index.
    fn associated_data(&self, index: u64) -> [u8; DIGEST_SIZE + 8] {
        let mut ad = [0u8; DIGEST_SIZE + 8];
        ad[..DIGEST_SIZE].copy_from_slice(&self.session_id);
        ad[DIGEST_SIZE..].copy_from_slice(&index.to_be_bytes());
        ad
    }
}

impl fmt::Debug for RatchetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RatchetState").field("index", &self.index).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn pair(index: u64) -> (RatchetState, RatchetState) {
        let key = SecretKey::from_bytes([0x11; 32]);
        let sid = [0x22; 32];
        (RatchetState::new(key.clone(), index, sid), RatchetState::new(key, index, sid))
    }

    #[test]
    fn seal_open_roundtrip_in_lock_step() {
        let (mut sender, mut receiver) = pair(1000);

        for i in 0..5u8 {
            let msg = sender.seal(&[i; 10]).unwrap();
            assert_eq!(receiver.open(&msg).unwrap(), vec![i; 10]);
        }
        assert_eq!(sender.index(), 1005);
        assert_eq!(receiver.index(), 1005);
        assert_eq!(sender.master_key(), receiver.master_key());
    }

    #[test]
    fn seal_advances_master_key() {
        let (mut sender, _) = pair(0);
        let before = sender.master_key().clone();

        sender.seal(b"msg").unwrap();

        assert_ne!(&before, sender.master_key());
        assert_eq!(sender.index(), 1);
    }

    #[test]
    fn public_index_is_low_bits() {
        assert_eq!(public_portion(0x1234_5678_9ABC), 0x9ABC);
        assert_eq!(public_portion(u64::MAX), u16::MAX);
    }

    #[test]
    fn index_mismatch_leaves_state_untouched() {
        let (mut sender, mut receiver) = pair(7);
        let _first = sender.seal(b"first").unwrap();
        let second = sender.seal(b"second").unwrap();

        let before = receiver.master_key().clone();
        let result = receiver.open(&second);

        assert!(matches!(result, Err(CryptoError::IndexMismatch { expected: 7, actual: 8 })));
        assert_eq!(receiver.index(), 7);
        assert_eq!(&before, receiver.master_key());
    }

    #[test]
    fn failed_decryption_leaves_state_untouched() {
        let (mut sender, mut receiver) = pair(7);
        let mut msg = sender.seal(b"payload").unwrap();
        msg.ciphertext[3] ^= 0x40;

        assert!(matches!(receiver.open(&msg), Err(CryptoError::DecryptionFailed { .. })));
        assert_eq!(receiver.index(), 7);
    }

    #[test]
    fn replay_is_rejected() {
        let (mut sender, mut receiver) = pair(0);
        let msg = sender.seal(b"once").unwrap();

        receiver.open(&msg).unwrap();
        assert!(matches!(receiver.open(&msg), Err(CryptoError::IndexMismatch { .. })));
    }

    #[test]
    fn wrapped_public_index_with_stale_full_index_fails() {
        // Same public index, different full index: bound by associated data
        let (mut sender, _) = pair(0);
        let msg = sender.seal(b"old").unwrap();

        let key = SecretKey::from_bytes([0x11; 32]);
        let mut receiver = RatchetState::new(key, 1 << PUBLIC_INDEX_BITS, [0x22; 32]);

        assert!(matches!(receiver.open(&msg), Err(CryptoError::DecryptionFailed { .. })));
    }

    #[test]
    fn exhausted_index_is_an_error() {
        let (mut sender, _) = pair(u64::MAX);
        assert!(matches!(
            sender.seal(b"late"),
            Err(CryptoError::IndexExhausted { index: u64::MAX })
        ));
        assert_eq!(sender.index(), u64::MAX);
    }

    #[test]
    fn debug_does_not_print_key() {
        let (sender, _) = pair(3);
        let rendered = format!("{sender:?}");
        assert!(rendered.contains("index: 3"));
        assert!(!rendered.contains("17"));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// The current master key leaks. Every key reachable from it is
        /// tried against every message sealed before the leak.
        #[test]
        fn prop_revealed_master_key_cannot_open_earlier_messages(
            key in any::<[u8; 32]>(),
            session_id in any::<[u8; 32]>(),
            start in 0u64..(u64::MAX >> 2),
            sealed in 1usize..12,
            lookahead in 0usize..8,
        ) {
            let mut sender = RatchetState::new(SecretKey::from_bytes(key), start, session_id);
            let mut earlier_keys = Vec::new();
            let mut earlier = Vec::new();
            for i in 0..sealed {
                earlier_keys.push(sender.master_key().clone());
                let index = sender.index();
                earlier.push((index, sender.seal(&[i as u8; 16]).unwrap()));
            }

            let revealed = sender.master_key().clone();
            let mut attacker = RatchetState::new(revealed.clone(), sender.index(), session_id);
            let mut attempts = vec![revealed];
            for _ in 0..lookahead {
                attacker.seal(b"").unwrap();
                attempts.push(attacker.master_key().clone());
            }

            for attempt in &attempts {
                prop_assert!(!earlier_keys.contains(attempt));
                for (index, message) in &earlier {
                    let mut guess = RatchetState::new(attempt.clone(), *index, session_id);
                    prop_assert!(guess.open(message).is_err());
                    prop_assert_eq!(guess.index(), *index);
                }
            }
        }
    }
}
