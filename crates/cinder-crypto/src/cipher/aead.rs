//! XChaCha20-Poly1305 drop-in for the 3DES conversation cipher.
//!
//! Keyed by HKDF over the same conversation keys, so switching ciphers
//! needs no change to the handshake.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::Zeroizing;

use super::MessageCipher;
use crate::error::CryptoError;
use crate::primitives;
use crate::x3dh::ConversationKeys;

const NONCE_LEN: usize = 24;
const TAG_LEN: usize = 16;
const AEAD_INFO: &[u8] = b"CinderXChaCha";

pub struct XChaChaCipher {
    cipher: XChaCha20Poly1305,
}

impl XChaChaCipher {
    pub fn new(keys: &ConversationKeys) -> Self {
        let mut ikm = Zeroizing::new([0u8; 56]);
        ikm[..24].copy_from_slice(&keys.enc_key);
        ikm[24..].copy_from_slice(&keys.mac_key);
        let key: Zeroizing<[u8; 32]> =
            Zeroizing::new(primitives::hkdf_array(ikm.as_slice(), &[0u8; 32], AEAD_INFO));
        Self {
            cipher: XChaCha20Poly1305::new(Key::from_slice(key.as_slice())),
        }
    }
}

impl MessageCipher for XChaChaCipher {
    /// `[24-byte nonce || ciphertext || 16-byte tag]`
    type Sealed = Vec<u8>;

    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(XNonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|e| CryptoError::EncryptionError(e.to_string()))?;

        let mut output = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        output.extend_from_slice(&nonce_bytes);
        output.extend_from_slice(&ciphertext);
        Ok(output)
    }

    fn open(&self, sealed: &Vec<u8>) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < NONCE_LEN + TAG_LEN {
            return Err(CryptoError::AuthenticationFailed);
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        self.cipher
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::AuthenticationFailed)
    }
}
