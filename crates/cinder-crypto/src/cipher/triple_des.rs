//! 3DES-CBC with PKCS#7 padding, authenticated by HMAC-SHA256 over
//! `iv || ciphertext` (encrypt-then-MAC).

use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;

use super::des::{TripleDes, BLOCK_LEN, TRIPLE_KEY_LEN};
use super::{MessageCipher, SealedMessage, IV_LEN, MAC_LEN};
use crate::error::CryptoError;
use crate::x3dh::ConversationKeys;

type HmacSha256 = Hmac<Sha256>;

/// Encrypt `plaintext` under a fresh random IV and tag the result.
pub fn encrypt(
    plaintext: &[u8],
    key: &[u8; TRIPLE_KEY_LEN],
    mac_key: &[u8; MAC_LEN],
) -> Result<SealedMessage, CryptoError> {
    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);
    encrypt_with_iv(plaintext, key, mac_key, iv)
}

fn encrypt_with_iv(
    plaintext: &[u8],
    key: &[u8; TRIPLE_KEY_LEN],
    mac_key: &[u8; MAC_LEN],
    iv: [u8; IV_LEN],
) -> Result<SealedMessage, CryptoError> {
    let cipher = TripleDes::new(key);
    let padded = pad(plaintext);

    let mut ciphertext = Vec::with_capacity(padded.len());
    let mut chain = u64::from_be_bytes(iv);
    for block in padded.chunks_exact(BLOCK_LEN) {
        chain = cipher.encrypt_block(read_block(block) ^ chain);
        ciphertext.extend_from_slice(&chain.to_be_bytes());
    }

    let mac = tag(mac_key, &iv, &ciphertext)?;
    Ok(SealedMessage {
        iv,
        ciphertext,
        mac,
    })
}

/// Check the tag, then decrypt and unpad.
///
/// The MAC is verified (in constant time) before any block is decrypted; a
/// mismatch never reaches the cipher.
pub fn decrypt(
    sealed: &SealedMessage,
    key: &[u8; TRIPLE_KEY_LEN],
    mac_key: &[u8; MAC_LEN],
) -> Result<Vec<u8>, CryptoError> {
    let mut mac = new_mac(mac_key)?;
    mac.update(&sealed.iv);
    mac.update(&sealed.ciphertext);
    if mac.verify_slice(&sealed.mac).is_err() {
        tracing::debug!(len = sealed.ciphertext.len(), "rejecting message with bad tag");
        return Err(CryptoError::AuthenticationFailed);
    }

    if sealed.ciphertext.is_empty() || sealed.ciphertext.len() % BLOCK_LEN != 0 {
        return Err(CryptoError::BadPadding);
    }

    let cipher = TripleDes::new(key);
    let mut plaintext = Vec::with_capacity(sealed.ciphertext.len());
    let mut chain = u64::from_be_bytes(sealed.iv);
    for block in sealed.ciphertext.chunks_exact(BLOCK_LEN) {
        let c = read_block(block);
        plaintext.extend_from_slice(&(cipher.decrypt_block(c) ^ chain).to_be_bytes());
        chain = c;
    }

    unpad(&mut plaintext)?;
    Ok(plaintext)
}

fn read_block(block: &[u8]) -> u64 {
    let mut buf = [0u8; BLOCK_LEN];
    buf.copy_from_slice(block);
    u64::from_be_bytes(buf)
}

fn new_mac(mac_key: &[u8; MAC_LEN]) -> Result<HmacSha256, CryptoError> {
    <HmacSha256 as Mac>::new_from_slice(mac_key)
        .map_err(|e| CryptoError::InvalidKey(format!("hmac key: {e}")))
}

fn tag(mac_key: &[u8; MAC_LEN], iv: &[u8], ciphertext: &[u8]) -> Result<[u8; MAC_LEN], CryptoError> {
    let mut mac = new_mac(mac_key)?;
    mac.update(iv);
    mac.update(ciphertext);
    Ok(mac.finalize().into_bytes().into())
}

/// PKCS#7: always appends 1..=8 bytes, each equal to the pad length.
fn pad(plaintext: &[u8]) -> Vec<u8> {
    let pad_len = BLOCK_LEN - plaintext.len() % BLOCK_LEN;
    let mut padded = Vec::with_capacity(plaintext.len() + pad_len);
    padded.extend_from_slice(plaintext);
    #[allow(clippy::cast_possible_truncation)] // pad_len is 1..=8
    padded.resize(plaintext.len() + pad_len, pad_len as u8);
    padded
}

fn unpad(buf: &mut Vec<u8>) -> Result<(), CryptoError> {
    let pad_len = usize::from(*buf.last().ok_or(CryptoError::BadPadding)?);
    if pad_len == 0 || pad_len > BLOCK_LEN || pad_len > buf.len() {
        return Err(CryptoError::BadPadding);
    }
    let body_len = buf.len() - pad_len;
    if buf[body_len..].iter().any(|&b| usize::from(b) != pad_len) {
        return Err(CryptoError::BadPadding);
    }
    buf.truncate(body_len);
    Ok(())
}

/// The conversation cipher keyed by the X3DH `encKey`/`macKey`.
pub struct TripleDesHmac {
    keys: ConversationKeys,
}

impl TripleDesHmac {
    pub fn new(keys: ConversationKeys) -> Self {
        Self { keys }
    }
}

impl MessageCipher for TripleDesHmac {
    type Sealed = SealedMessage;

    fn seal(&self, plaintext: &[u8]) -> Result<SealedMessage, CryptoError> {
        encrypt(plaintext, &self.keys.enc_key, &self.keys.mac_key)
    }

    fn open(&self, sealed: &SealedMessage) -> Result<Vec<u8>, CryptoError> {
        decrypt(sealed, &self.keys.enc_key, &self.keys.mac_key)
    }
}
