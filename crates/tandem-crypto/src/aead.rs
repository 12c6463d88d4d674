//! Message encryption: HMAC-SHA256 tag inside `XChaCha20-Poly1305`
//!
//! ```text
//! cipher key || nonce = HKDF-Expand(master key, "tandem aead split")
//! tag                 = HMAC(cipher key, nonce || associated data || plaintext)
//! ciphertext          = XChaCha20-Poly1305(cipher key, nonce, plaintext || tag)
//! ```
//!
//! A master key encrypts exactly one message, so the deterministic nonce is
//! never reused under the same cipher key. Decryption fails closed: no
//! plaintext leaves this module unless both the Poly1305 tag and the HMAC tag
//! verify.

use chacha20poly1305::{
    XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit},
};
use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::{Zeroize, Zeroizing};

use crate::{
    error::CryptoError,
    primitives::{DIGEST_SIZE, KEY_SIZE, SecretKey, mac, verify_mac},
};

/// Info string for splitting a master key.
const SPLIT_LABEL: &[u8] = b"tandem aead split";

/// `XChaCha20` nonce size (24 bytes)
const NONCE_SIZE: usize = 24;

/// Poly1305 tag size (16 bytes)
const POLY1305_TAG_SIZE: usize = 16;

/// Bytes added to every plaintext: inner HMAC tag plus Poly1305 tag.
pub const AEAD_OVERHEAD: usize = DIGEST_SIZE + POLY1305_TAG_SIZE;

/// Cipher key and nonce derived from one master key.
struct Split {
    cipher_key: SecretKey,
    nonce: [u8; NONCE_SIZE],
}

impl Drop for Split {
    fn drop(&mut self) {
        self.nonce.zeroize();
    }
}

fn split(master_key: &SecretKey) -> Split {
    let Ok(hkdf) = Hkdf::<Sha256>::from_prk(master_key.as_bytes()) else {
        unreachable!("a 32-byte master key is a valid HKDF-SHA256 PRK");
    };

    let mut okm = Zeroizing::new([0u8; KEY_SIZE + NONCE_SIZE]);
    let Ok(()) = hkdf.expand(SPLIT_LABEL, okm.as_mut_slice()) else {
        unreachable!("56 bytes is a valid HKDF-SHA256 output length");
    };

    let mut cipher_key = [0u8; KEY_SIZE];
    cipher_key.copy_from_slice(&okm[..KEY_SIZE]);
    let mut nonce = [0u8; NONCE_SIZE];
    nonce.copy_from_slice(&okm[KEY_SIZE..]);

    Split { cipher_key: SecretKey::from_bytes(cipher_key), nonce }
}

/// Encrypt `plaintext` under a single-use master key.
///
/// `associated_data` is authenticated but not encrypted. Ratcheted messages
/// pass the session id and the full index here.
pub fn encrypt(master_key: &SecretKey, associated_data: &[u8], plaintext: &[u8]) -> Vec<u8> {
    let split = split(master_key);
    let tag = mac(split.cipher_key.as_bytes(), &[&split.nonce, associated_data, plaintext]);

    let mut inner = Zeroizing::new(Vec::with_capacity(plaintext.len() + DIGEST_SIZE));
    inner.extend_from_slice(plaintext);
    inner.extend_from_slice(&tag);

    let cipher = XChaCha20Poly1305::new(split.cipher_key.as_bytes().into());
    let Ok(ciphertext) = cipher.encrypt(XNonce::from_slice(&split.nonce), inner.as_slice()) else {
        unreachable!("XChaCha20-Poly1305 encryption cannot fail with valid inputs");
    };

    ciphertext
}

/// Decrypt a ciphertext produced by [`encrypt`].
///
/// # Errors
///
/// - `DecryptionFailed`: wrong key, wrong associated data, or tampering
pub fn decrypt(
    master_key: &SecretKey,
    associated_data: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.len() < AEAD_OVERHEAD {
        return Err(CryptoError::DecryptionFailed { reason: "ciphertext too short" });
    }

    let split = split(master_key);
    let cipher = XChaCha20Poly1305::new(split.cipher_key.as_bytes().into());

    let inner = Zeroizing::new(
        cipher
            .decrypt(XNonce::from_slice(&split.nonce), ciphertext)
            .map_err(|_| CryptoError::DecryptionFailed { reason: "authentication failed" })?,
    );

    let (plaintext, tag) = inner.split_at(inner.len() - DIGEST_SIZE);
    if !verify_mac(split.cipher_key.as_bytes(), &[&split.nonce, associated_data, plaintext], tag)
    {
        return Err(CryptoError::DecryptionFailed { reason: "tag mismatch" });
    }

    Ok(plaintext.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn master_key(fill: u8) -> SecretKey {
        SecretKey::from_bytes([fill; KEY_SIZE])
    }

    #[test]
    fn split_matches_fixed_vector() {
        let split = split(&master_key(0x11));

        assert_eq!(
            hex::encode(split.cipher_key.as_bytes()),
            "cd75437b004820c185fc3d43d469813a640afa8f9e1976c9617740a752c63f08"
        );
        assert_eq!(hex::encode(split.nonce), "9eed9ebb810cb6410a821f90a393ef24f5997c4b68007555");
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let key = master_key(1);
        let ciphertext = encrypt(&key, b"ad", b"Hello, World!");
        let plaintext = decrypt(&key, b"ad", &ciphertext).unwrap();

        assert_eq!(plaintext, b"Hello, World!");
    }

    #[test]
    fn encrypt_decrypt_empty_message() {
        let key = master_key(2);
        let ciphertext = encrypt(&key, b"", b"");

        assert_eq!(ciphertext.len(), AEAD_OVERHEAD);
        assert_eq!(decrypt(&key, b"", &ciphertext).unwrap(), b"");
    }

    #[test]
    fn ciphertext_overhead_is_fixed() {
        let key = master_key(3);
        let plaintext = vec![0x42u8; 64 * 1024];
        let ciphertext = encrypt(&key, b"ad", &plaintext);

        assert_eq!(ciphertext.len(), plaintext.len() + AEAD_OVERHEAD);
    }

    #[test]
    fn wrong_associated_data_fails() {
        let key = master_key(4);
        let ciphertext = encrypt(&key, b"index=7", b"secret");

        let result = decrypt(&key, b"index=8", &ciphertext);
        assert!(matches!(result, Err(CryptoError::DecryptionFailed { reason: "tag mismatch" })));
    }

    #[test]
    fn wrong_key_fails() {
        let ciphertext = encrypt(&master_key(5), b"ad", b"secret");

        let result = decrypt(&master_key(6), b"ad", &ciphertext);
        assert!(matches!(
            result,
            Err(CryptoError::DecryptionFailed { reason: "authentication failed" })
        ));
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let key = master_key(7);
        let mut ciphertext = encrypt(&key, b"ad", b"original message");
        ciphertext[0] ^= 0xFF;

        assert!(decrypt(&key, b"ad", &ciphertext).is_err());
    }

    #[test]
    fn truncated_ciphertext_fails() {
        let key = master_key(8);
        let ciphertext = encrypt(&key, b"ad", b"hi");

        let result = decrypt(&key, b"ad", &ciphertext[..AEAD_OVERHEAD - 1]);
        assert!(matches!(
            result,
            Err(CryptoError::DecryptionFailed { reason: "ciphertext too short" })
        ));
    }

    #[test]
    fn encryption_is_deterministic_per_key() {
        let key = master_key(9);
        assert_eq!(encrypt(&key, b"ad", b"same"), encrypt(&key, b"ad", b"same"));
        assert_ne!(encrypt(&key, b"ad", b"same"), encrypt(&master_key(10), b"ad", b"same"));
    }
}
