use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("encryption failed: {0}")]
    EncryptionError(String),

    #[error("signed prekey signature is invalid")]
    InvalidSignature,

    #[error("bundle incomplete: {0}")]
    BundleIncomplete(String),

    #[error("one-time prekey unavailable: {0}")]
    PrekeyUnavailable(String),

    // Same text as AuthenticationFailed.
    #[error("message authentication failed")]
    AuthenticationFailed,

    #[error("message authentication failed")]
    BadPadding,
}

impl CryptoError {
    /// True for every failure that must be signalled to a peer as a single,
    /// indistinguishable "could not open message" outcome.
    pub fn is_authentication_failure(&self) -> bool {
        matches!(self, Self::AuthenticationFailed | Self::BadPadding)
    }
}
