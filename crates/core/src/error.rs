//! Error taxonomy shared by every component (§7).
//!
//! Each public, fallible operation in this crate returns `Result<T, RelayError>`.
//! Variants map 1:1 onto the kinds enumerated in the design: Configuration,
//! Network, Protocol, PublishRejected, Validation, NotFound, Timeout,
//! RateLimited, Cancelled, AuthRequired.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum RelayError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("relay rejected publish: {0}")]
    PublishRejected(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("operation timed out")]
    Timeout,

    #[error("rate limited")]
    RateLimited,

    #[error("operation cancelled")]
    Cancelled,

    #[error("relay requires authentication")]
    AuthRequired,
}

impl RelayError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn network(msg: impl Into<String>) -> Self {
        Self::Network(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;

/// Errors from the cryptography collaborator boundary (§6). Kept distinct
/// from `RelayError` because a failure here is almost always a caller bug
/// (bad key, unsupported scheme) rather than a runtime condition; call sites
/// convert via `From`.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CryptoError {
    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("unsupported encryption scheme")]
    UnsupportedScheme,
}

impl From<CryptoError> for RelayError {
    fn from(e: CryptoError) -> Self {
        RelayError::Validation(e.to_string())
    }
}
