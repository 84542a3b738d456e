// tripwire/src/error.rs
//
// Typed errors at library boundaries. Application plumbing (server loop,
// datastore writes, the binary) uses anyhow on top of these.

use thiserror::Error;

/// Token issuance failure. Fatal to the token-dependent path, never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenError {
    #[error("signing secret is unset or a known placeholder")]
    SecretUnavailable,
}

/// Why a presented token was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TokenRejection {
    #[error("malformed token")]
    Malformed,
    #[error("token expired")]
    Expired,
    #[error("token issued in the future")]
    FromFuture,
    #[error("token signature mismatch")]
    BadSignature,
    #[error("token replayed")]
    Replayed,
    /// The authority has no usable secret, so nothing can be verified.
    #[error("token verification unavailable")]
    Unverifiable,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config: {0}")]
    Io(#[from] std::io::Error),
    #[error("parsing config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame too large: {0} bytes")]
    TooLarge(usize),
    #[error("frame decode: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("frame io: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("detector `{0}` registered twice")]
    Duplicate(String),
}
