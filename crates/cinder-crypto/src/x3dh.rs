//! X3DH key agreement for both roles.
//!
//! The initiator mixes `DH(IK_a, SPK_b) || DH(EK_a, IK_b) || DH(EK_a, SPK_b)
//! [|| DH(EK_a, OPK_b)]` into HKDF; the responder computes the same four
//! values from the other side. Term order is part of the KDF input and must
//! not change.
//!
//! The two derive functions are pure. Signature checking and prekey
//! bookkeeping live in [`initiate_with_bundle`] and [`respond`].

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::bundle::{Bundle, BundleTrust};
use crate::error::CryptoError;
use crate::keys::{EphemeralKeyPair, IdentityKeyPair, KeyMaterial, OneTimePreKey, SignedPreKeyPair};
use crate::primitives::{self, KEY_LEN, SIGNATURE_LEN};

/// HKDF info string for the master secret.
pub const X3DH_INFO: &[u8] = b"CinderX3DH";
const ENC_INFO: &[u8] = b"ENC";
const MAC_INFO: &[u8] = b"MAC";
const ZERO_SALT: [u8; 32] = [0u8; 32];

pub const ENC_KEY_LEN: usize = 24;
pub const MAC_KEY_LEN: usize = 32;

/// Raw Diffie-Hellman outputs, in KDF order.
#[derive(Zeroize)]
pub struct DhParts {
    pub dh1: [u8; KEY_LEN],
    pub dh2: [u8; KEY_LEN],
    pub dh3: [u8; KEY_LEN],
    pub dh4: Option<[u8; KEY_LEN]>,
}

/// Everything one side of the handshake derives. Zeroed on drop; keep only
/// the [`ConversationKeys`].
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct HandshakeResult {
    pub master_key: [u8; 32],
    pub enc_key: [u8; ENC_KEY_LEN],
    pub mac_key: [u8; MAC_KEY_LEN],
    pub dh_parts: DhParts,
    #[zeroize(skip)]
    pub used_one_time_pre_key_id: Option<String>,
}

/// Symmetric keys retained for the lifetime of a conversation.
/// No `PartialEq`: compare secret keys in constant time or not at all.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct ConversationKeys {
    pub enc_key: [u8; ENC_KEY_LEN],
    pub mac_key: [u8; MAC_KEY_LEN],
}

impl HandshakeResult {
    /// Keep the message keys and drop (and wipe) the rest.
    pub fn into_conversation_keys(self) -> ConversationKeys {
        ConversationKeys {
            enc_key: self.enc_key,
            mac_key: self.mac_key,
        }
    }
}

impl std::fmt::Debug for HandshakeResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandshakeResult")
            .field("has_dh4", &self.dh_parts.dh4.is_some())
            .field("used_one_time_pre_key_id", &self.used_one_time_pre_key_id)
            .finish_non_exhaustive()
    }
}

impl std::fmt::Debug for ConversationKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ConversationKeys([REDACTED])")
    }
}

/// Initiator side. The caller must already have verified
/// `receiver_signed_pre_key_sig`; the signature is accepted here only so the
/// argument list mirrors the published bundle.
pub fn initiator_derive_shared_secret(
    sender_identity: &IdentityKeyPair,
    sender_ephemeral: &EphemeralKeyPair,
    receiver_identity_pub: &[u8; KEY_LEN],
    receiver_signed_pre_key_pub: &[u8; KEY_LEN],
    _receiver_signed_pre_key_sig: &[u8; SIGNATURE_LEN],
    receiver_one_time_pre_key: Option<(&str, &[u8; KEY_LEN])>,
) -> HandshakeResult {
    let dh_parts = DhParts {
        dh1: primitives::dh(&sender_identity.private_key, receiver_signed_pre_key_pub),
        dh2: primitives::dh(&sender_ephemeral.private_key, receiver_identity_pub),
        dh3: primitives::dh(&sender_ephemeral.private_key, receiver_signed_pre_key_pub),
        dh4: receiver_one_time_pre_key
            .map(|(_, otpk)| primitives::dh(&sender_ephemeral.private_key, otpk)),
    };
    derive(dh_parts, receiver_one_time_pre_key.map(|(id, _)| id.to_owned()))
}

/// Responder side: the same four values from our private scalars and the
/// initiator's public keys.
pub fn responder_derive_shared_secret(
    receiver_identity: &IdentityKeyPair,
    receiver_signed_pre_key: &SignedPreKeyPair,
    receiver_one_time_pre_key: Option<&OneTimePreKey>,
    sender_identity_pub: &[u8; KEY_LEN],
    sender_ephemeral_pub: &[u8; KEY_LEN],
) -> HandshakeResult {
    let dh_parts = DhParts {
        dh1: primitives::dh(&receiver_signed_pre_key.private_key, sender_identity_pub),
        dh2: primitives::dh(&receiver_identity.private_key, sender_ephemeral_pub),
        dh3: primitives::dh(&receiver_signed_pre_key.private_key, sender_ephemeral_pub),
        dh4: receiver_one_time_pre_key
            .map(|otpk| primitives::dh(&otpk.private_key, sender_ephemeral_pub)),
    };
    derive(dh_parts, receiver_one_time_pre_key.map(|k| k.id.clone()))
}

fn derive(dh_parts: DhParts, used_one_time_pre_key_id: Option<String>) -> HandshakeResult {
    let mut ikm = Vec::with_capacity(4 * KEY_LEN);
    ikm.extend_from_slice(&dh_parts.dh1);
    ikm.extend_from_slice(&dh_parts.dh2);
    ikm.extend_from_slice(&dh_parts.dh3);
    if let Some(dh4) = &dh_parts.dh4 {
        ikm.extend_from_slice(dh4);
    }

    let master_key: [u8; 32] = primitives::hkdf_array(&ikm, &ZERO_SALT, X3DH_INFO);
    primitives::wipe(&mut ikm);

    HandshakeResult {
        enc_key: primitives::hkdf_array(&master_key, &ZERO_SALT, ENC_INFO),
        mac_key: primitives::hkdf_array(&master_key, &ZERO_SALT, MAC_INFO),
        master_key,
        dh_parts,
        used_one_time_pre_key_id,
    }
}

/// Initiator flow against a fetched bundle.
///
/// Refuses a bundle whose signature is present and wrong. When
/// `one_time_pre_key_id` is given it must name a prekey carried by the
/// bundle; a missing id is `PrekeyUnavailable` rather than a silent
/// three-term handshake.
pub fn initiate_with_bundle(
    sender_identity: &IdentityKeyPair,
    sender_ephemeral: &EphemeralKeyPair,
    bundle: &Bundle,
    one_time_pre_key_id: Option<&str>,
) -> Result<HandshakeResult, CryptoError> {
    if bundle.verify()? == BundleTrust::Unverified {
        tracing::warn!("bundle carries no signing key; signed prekey is unverified");
    }

    let one_time = match one_time_pre_key_id {
        Some(id) => {
            let otpk = bundle
                .one_time_pre_key(id)
                .ok_or_else(|| CryptoError::PrekeyUnavailable(id.to_owned()))?;
            Some((otpk.id.as_str(), &otpk.key))
        }
        None => None,
    };

    Ok(initiator_derive_shared_secret(
        sender_identity,
        sender_ephemeral,
        &bundle.identity_key,
        &bundle.signed_pre_key,
        &bundle.signed_pre_key_signature,
        one_time,
    ))
}

/// Responder flow. Consumes the named one-time prekey's private half from
/// `material`; if it is gone the handshake fails rather than falling back
/// to three terms, which would never match the initiator.
pub fn respond(
    material: &mut KeyMaterial,
    sender_identity_pub: &[u8; KEY_LEN],
    sender_ephemeral_pub: &[u8; KEY_LEN],
    one_time_pre_key_id: Option<&str>,
) -> Result<HandshakeResult, CryptoError> {
    let one_time = match one_time_pre_key_id {
        Some(id) => Some(material.take_one_time_pre_key(id).ok_or_else(|| {
            tracing::warn!(prekey = %id, "no private half for one-time prekey");
            CryptoError::PrekeyUnavailable(id.to_owned())
        })?),
        None => None,
    };

    Ok(responder_derive_shared_secret(
        &material.identity,
        &material.signed_pre_key,
        one_time.as_ref(),
        sender_identity_pub,
        sender_ephemeral_pub,
    ))
}
