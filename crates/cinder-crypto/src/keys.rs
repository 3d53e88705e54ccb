//! Identity, signed-prekey and one-time-prekey key material.
//!
//! The identity carries two unrelated keypairs side by side: an X25519 pair
//! used only for Diffie-Hellman and an Ed25519 pair used only to sign the
//! signed prekey. They are drawn independently and never converted into one
//! another.

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::bundle::{Bundle, OneTimePreKeyPublic};
use crate::primitives::{self, KEY_LEN, SIGNATURE_LEN};

/// Prefix of every one-time prekey id; the suffix is a per-user sequence.
pub const ONE_TIME_PREKEY_ID_PREFIX: &str = "otpk-";

/// Long-lived per-user identity.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct IdentityKeyPair {
    /// X25519 public key.
    pub public_key: [u8; KEY_LEN],
    /// X25519 private scalar.
    pub private_key: [u8; KEY_LEN],
    /// Ed25519 verifying key.
    pub signing_public_key: [u8; KEY_LEN],
    /// Ed25519 seed.
    pub signing_private_key: [u8; KEY_LEN],
}

/// Medium-lived X25519 prekey signed by the identity's Ed25519 key.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SignedPreKeyPair {
    pub public_key: [u8; KEY_LEN],
    pub private_key: [u8; KEY_LEN],
    /// Ed25519 signature over `public_key`.
    pub signature: [u8; SIGNATURE_LEN],
}

/// Single-use X25519 prekey.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct OneTimePreKey {
    #[zeroize(skip)]
    pub id: String,
    pub public_key: [u8; KEY_LEN],
    pub private_key: [u8; KEY_LEN],
}

/// Per-handshake X25519 keypair generated by the initiator.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EphemeralKeyPair {
    pub public_key: [u8; KEY_LEN],
    pub private_key: [u8; KEY_LEN],
}

impl EphemeralKeyPair {
    pub fn generate() -> Self {
        let private_key = primitives::x25519_private();
        Self {
            public_key: primitives::x25519_public(&private_key),
            private_key,
        }
    }
}

impl OneTimePreKey {
    /// Public half, as published to the prekey store.
    pub fn to_public(&self) -> OneTimePreKeyPublic {
        OneTimePreKeyPublic {
            id: self.id.clone(),
            key: self.public_key,
        }
    }
}

impl SignedPreKeyPair {
    /// Check the signature against the identity that supposedly produced it.
    pub fn verify(&self, signing_public_key: &[u8; KEY_LEN]) -> bool {
        primitives::verify(&self.signature, &self.public_key, signing_public_key)
    }
}

/// Draw an X25519 identity pair and an independent Ed25519 signing pair.
pub fn generate_identity_key_pair() -> IdentityKeyPair {
    let private_key = primitives::x25519_private();
    let signing_private_key = primitives::ed25519_seed();
    IdentityKeyPair {
        public_key: primitives::x25519_public(&private_key),
        private_key,
        signing_public_key: primitives::ed25519_public(&signing_private_key),
        signing_private_key,
    }
}

/// Fresh X25519 pair whose public key is signed by `identity`.
pub fn generate_signed_pre_key(identity: &IdentityKeyPair) -> SignedPreKeyPair {
    let private_key = primitives::x25519_private();
    let public_key = primitives::x25519_public(&private_key);
    let signature = primitives::sign(&public_key, &identity.signing_private_key);
    SignedPreKeyPair {
        public_key,
        private_key,
        signature,
    }
}

/// `count` independent one-time prekeys with ids `otpk-0`, `otpk-1`, ...
pub fn generate_one_time_pre_keys(count: u32) -> Vec<OneTimePreKey> {
    generate_one_time_pre_keys_from(0, count)
}

/// Like [`generate_one_time_pre_keys`] but numbering from `start`, so that a
/// replenishment batch never reuses an id from an earlier batch.
pub fn generate_one_time_pre_keys_from(start: u32, count: u32) -> Vec<OneTimePreKey> {
    (start..start.saturating_add(count))
        .map(|n| {
            let private_key = primitives::x25519_private();
            OneTimePreKey {
                id: format!("{ONE_TIME_PREKEY_ID_PREFIX}{n}"),
                public_key: primitives::x25519_public(&private_key),
                private_key,
            }
        })
        .collect()
}

/// Everything a user's device holds: identity, current signed prekey, and
/// the private halves of every one-time prekey not yet used in a handshake.
pub struct KeyMaterial {
    pub identity: IdentityKeyPair,
    pub signed_pre_key: SignedPreKeyPair,
    one_time_pre_keys: Vec<OneTimePreKey>,
    next_prekey_index: u32,
}

impl KeyMaterial {
    /// Registration: new identity, signed prekey and `one_time_count` prekeys.
    pub fn generate(one_time_count: u32) -> Self {
        let identity = generate_identity_key_pair();
        let signed_pre_key = generate_signed_pre_key(&identity);
        Self {
            one_time_pre_keys: generate_one_time_pre_keys(one_time_count),
            next_prekey_index: one_time_count,
            identity,
            signed_pre_key,
        }
    }

    /// Public projection of this material.
    pub fn export_bundle(&self) -> Bundle {
        export_bundle(self)
    }

    /// Generate `count` more one-time prekeys continuing the id sequence and
    /// return their public halves for upload.
    pub fn replenish(&mut self, count: u32) -> Vec<OneTimePreKeyPublic> {
        let fresh = generate_one_time_pre_keys_from(self.next_prekey_index, count);
        self.next_prekey_index = self.next_prekey_index.saturating_add(count);
        let public = fresh.iter().map(OneTimePreKey::to_public).collect();
        self.one_time_pre_keys.extend(fresh);
        tracing::debug!(count, next = self.next_prekey_index, "replenished one-time prekeys");
        public
    }

    /// Replace the signed prekey. Handshakes already started against the old
    /// one can no longer be completed.
    pub fn rotate_signed_pre_key(&mut self) {
        self.signed_pre_key = generate_signed_pre_key(&self.identity);
    }

    pub fn one_time_pre_key(&self, id: &str) -> Option<&OneTimePreKey> {
        self.one_time_pre_keys.iter().find(|k| k.id == id)
    }

    /// Remove and return a one-time prekey's private half.
    pub fn take_one_time_pre_key(&mut self, id: &str) -> Option<OneTimePreKey> {
        let index = self.one_time_pre_keys.iter().position(|k| k.id == id)?;
        Some(self.one_time_pre_keys.remove(index))
    }

    pub fn one_time_pre_key_count(&self) -> usize {
        self.one_time_pre_keys.len()
    }
}

/// Project key material to its public bundle. No private field is copied.
pub fn export_bundle(material: &KeyMaterial) -> Bundle {
    Bundle {
        identity_key: material.identity.public_key,
        signing_public_key: Some(material.identity.signing_public_key),
        signed_pre_key: material.signed_pre_key.public_key,
        signed_pre_key_signature: material.signed_pre_key.signature,
        one_time_pre_keys: material
            .one_time_pre_keys
            .iter()
            .map(OneTimePreKey::to_public)
            .collect(),
    }
}

impl std::fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("public_key", &crate::encoding::encode(&self.public_key))
            .field(
                "signing_public_key",
                &crate::encoding::encode(&self.signing_public_key),
            )
            .finish_non_exhaustive()
    }
}

impl std::fmt::Debug for OneTimePreKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OneTimePreKey")
            .field("id", &self.id)
            .field("public_key", &crate::encoding::encode(&self.public_key))
            .finish_non_exhaustive()
    }
}
