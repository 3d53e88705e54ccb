pub mod bundle;
pub mod cipher;
pub mod encoding;
pub mod error;
pub mod keys;
pub mod primitives;
pub mod x3dh;

pub use bundle::{Bundle, BundleTrust, OneTimePreKeyPublic};
pub use cipher::{MessageCipher, SealedMessage, TripleDesHmac, XChaChaCipher};
pub use error::CryptoError;
pub use keys::{EphemeralKeyPair, IdentityKeyPair, KeyMaterial, OneTimePreKey, SignedPreKeyPair};
pub use x3dh::{ConversationKeys, HandshakeResult};
