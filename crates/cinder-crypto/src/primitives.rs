//! Thin wrappers over X25519, Ed25519 and HKDF-SHA256.
//!
//! Everything here works on raw fixed-size byte arrays so that the rest of
//! the crate never has to juggle dalek key types. There is no protocol
//! knowledge in this module.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::error::CryptoError;

pub const KEY_LEN: usize = 32;
pub const SIGNATURE_LEN: usize = 64;

/// Largest output HKDF-SHA256 can expand to (255 hash blocks).
pub const HKDF_MAX_LEN: usize = 255 * 32;

/// X25519 scalar multiplication of `private_key` with `public_key`.
pub fn dh(private_key: &[u8; KEY_LEN], public_key: &[u8; KEY_LEN]) -> [u8; KEY_LEN] {
    let secret = StaticSecret::from(*private_key);
    let shared = secret.diffie_hellman(&PublicKey::from(*public_key));
    *shared.as_bytes()
}

/// Derive the X25519 public point for a private scalar.
pub fn x25519_public(private_key: &[u8; KEY_LEN]) -> [u8; KEY_LEN] {
    let secret = StaticSecret::from(*private_key);
    PublicKey::from(&secret).to_bytes()
}

/// Draw a fresh X25519 private scalar from the OS RNG.
pub fn x25519_private() -> [u8; KEY_LEN] {
    StaticSecret::random_from_rng(OsRng).to_bytes()
}

/// Draw a fresh 32-byte Ed25519 seed from the OS RNG.
pub fn ed25519_seed() -> [u8; KEY_LEN] {
    let mut seed = [0u8; KEY_LEN];
    OsRng.fill_bytes(&mut seed);
    seed
}

/// Derive the Ed25519 verifying key for a 32-byte seed.
pub fn ed25519_public(seed: &[u8; KEY_LEN]) -> [u8; KEY_LEN] {
    SigningKey::from_bytes(seed).verifying_key().to_bytes()
}

/// Sign `message` with the Ed25519 key expanded from `seed`.
pub fn sign(message: &[u8], seed: &[u8; KEY_LEN]) -> [u8; SIGNATURE_LEN] {
    SigningKey::from_bytes(seed).sign(message).to_bytes()
}

/// Verify an Ed25519 signature. Malformed public keys verify as `false`.
pub fn verify(
    signature: &[u8; SIGNATURE_LEN],
    message: &[u8],
    public_key: &[u8; KEY_LEN],
) -> bool {
    let Ok(verifying_key) = VerifyingKey::from_bytes(public_key) else {
        return false;
    };
    verifying_key
        .verify(message, &Signature::from_bytes(signature))
        .is_ok()
}

/// HKDF-SHA256 extract-then-expand producing exactly `length` bytes.
///
/// `PRK = HMAC(salt, ikm)`, then `T(i) = HMAC(PRK, T(i-1) || info || i)`
/// concatenated and truncated.
pub fn hkdf(ikm: &[u8], salt: &[u8], info: &[u8], length: usize) -> Result<Vec<u8>, CryptoError> {
    if length > HKDF_MAX_LEN {
        return Err(CryptoError::KeyDerivation(format!(
            "requested {length} bytes, HKDF-SHA256 allows at most {HKDF_MAX_LEN}"
        )));
    }
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut okm = vec![0u8; length];
    hk.expand(info, &mut okm)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    Ok(okm)
}

/// Fixed-size HKDF for the protocol's own key lengths.
pub(crate) fn hkdf_array<const N: usize>(ikm: &[u8], salt: &[u8], info: &[u8]) -> [u8; N] {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut okm = [0u8; N];
    hk.expand(info, &mut okm)
        .expect("protocol key lengths are valid for HKDF-SHA256");
    okm
}

/// Wipe a scratch buffer holding secret bytes.
pub(crate) fn wipe(buf: &mut Vec<u8>) {
    buf.zeroize();
}
