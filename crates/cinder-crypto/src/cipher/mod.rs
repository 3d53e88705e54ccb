//! Symmetric message ciphers keyed by the handshake's conversation keys.
//!
//! The handshake only hands out [`ConversationKeys`](crate::x3dh::ConversationKeys);
//! anything implementing [`MessageCipher`] can consume them.

pub mod aead;
pub mod des;
pub mod triple_des;

use serde::{Deserialize, Serialize};

use crate::encoding::{base64_array, base64_vec};
use crate::error::CryptoError;

pub use aead::XChaChaCipher;
pub use triple_des::TripleDesHmac;

pub const IV_LEN: usize = 8;
pub const MAC_LEN: usize = 32;

/// A sealed message: one cipher per conversation, any number of messages.
pub trait MessageCipher {
    type Sealed;

    fn seal(&self, plaintext: &[u8]) -> Result<Self::Sealed, CryptoError>;

    /// Authenticate, then decrypt. Every failure is indistinguishable to the
    /// caller beyond "could not open".
    fn open(&self, sealed: &Self::Sealed) -> Result<Vec<u8>, CryptoError>;
}

/// Output of the 3DES-CBC + HMAC cipher, base64 on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedMessage {
    #[serde(with = "base64_array")]
    pub iv: [u8; IV_LEN],
    #[serde(with = "base64_vec")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "base64_array")]
    pub mac: [u8; MAC_LEN],
}
