//! Public prekey bundle as it crosses the wire.

use serde::{Deserialize, Serialize};

use crate::encoding::{base64_array, base64_option};
use crate::error::CryptoError;
use crate::primitives::{self, KEY_LEN, SIGNATURE_LEN};

/// Public half of a one-time prekey.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OneTimePreKeyPublic {
    pub id: String,
    #[serde(with = "base64_array")]
    pub key: [u8; KEY_LEN],
}

/// Everything a peer needs to start a handshake with us. Carries no private
/// material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bundle {
    #[serde(with = "base64_array")]
    pub identity_key: [u8; KEY_LEN],
    #[serde(default, with = "base64_option", skip_serializing_if = "Option::is_none")]
    pub signing_public_key: Option<[u8; KEY_LEN]>,
    #[serde(with = "base64_array")]
    pub signed_pre_key: [u8; KEY_LEN],
    #[serde(with = "base64_array")]
    pub signed_pre_key_signature: [u8; SIGNATURE_LEN],
    #[serde(default)]
    pub one_time_pre_keys: Vec<OneTimePreKeyPublic>,
}

/// Outcome of checking a bundle's signed prekey.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BundleTrust {
    /// The signature checked out against `signing_public_key`.
    Verified,
    /// No signing key was published, so nothing could be checked.
    Unverified,
}

impl Bundle {
    /// Verify the signed prekey signature.
    ///
    /// A present-but-wrong signature is an error; a missing signing key
    /// degrades the bundle to [`BundleTrust::Unverified`].
    pub fn verify(&self) -> Result<BundleTrust, CryptoError> {
        let Some(signing_public_key) = self.signing_public_key else {
            return Ok(BundleTrust::Unverified);
        };
        if primitives::verify(
            &self.signed_pre_key_signature,
            &self.signed_pre_key,
            &signing_public_key,
        ) {
            Ok(BundleTrust::Verified)
        } else {
            Err(CryptoError::InvalidSignature)
        }
    }

    /// Look up one of the published one-time prekeys by id.
    pub fn one_time_pre_key(&self, id: &str) -> Option<&OneTimePreKeyPublic> {
        self.one_time_pre_keys.iter().find(|k| k.id == id)
    }

    /// Copy of this bundle without any one-time prekeys.
    pub fn without_one_time_pre_keys(&self) -> Self {
        Self {
            one_time_pre_keys: Vec::new(),
            ..self.clone()
        }
    }
}
