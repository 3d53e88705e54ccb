use cinder_crypto::CryptoError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("signed prekey signature is invalid")]
    InvalidSignature,

    #[error("bundle incomplete: {0}")]
    BundleIncomplete(String),

    #[error("no bundle published for {0}")]
    BundleNotFound(String),

    #[error("one-time prekey gone: {0}")]
    PrekeyGone(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("session already finalized: {0}")]
    AlreadyFinalized(String),

    #[error("forbidden")]
    Forbidden,

    #[error("submitted keys do not match the initiated session")]
    SessionMaterialMismatch,

    #[error("missing or empty actor header")]
    Unauthenticated,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Any other cryptographic failure. Deliberately carries no detail.
    #[error("cryptographic verification failed")]
    Crypto,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<CryptoError> for ServerError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::InvalidSignature => Self::InvalidSignature,
            CryptoError::BundleIncomplete(msg) | CryptoError::InvalidKey(msg) => {
                Self::BundleIncomplete(msg)
            }
            other => {
                tracing::debug!(error = %other, "cryptographic failure");
                Self::Crypto
            }
        }
    }
}

impl From<rusqlite::Error> for ServerError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Storage(e.to_string())
    }
}
