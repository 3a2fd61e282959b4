//! Error types for rscdm.
//!
//! Only synchronous misuse surfaces here. Asynchronous operation outcomes are
//! delivered as [`SuccessValue`](crate::types::SuccessValue)s through the
//! completion callbacks and never as errors.

use thiserror::Error;

/// Main error type for rscdm operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The session handle is stale or was never issued by this context.
    #[error("Session handle is invalid or has been destroyed")]
    InvalidSession,

    /// The instance handle is stale or was never issued by this context.
    #[error("Instance handle is invalid or has been destroyed")]
    InvalidInstance,

    /// The session is closing or closed and accepts no further operations.
    #[error("Session is closed")]
    SessionClosed,

    /// No backend implements the requested key system.
    #[error("Unsupported key system: {0}")]
    UnsupportedKeySystem(String),

    /// The init data could not be parsed for its declared type.
    #[error("Invalid init data: {0}")]
    InvalidInitData(String),

    /// A license request or response could not be parsed.
    #[error("Invalid license message: {0}")]
    InvalidLicenseMessage(String),

    /// The configuration file is missing a value or holds an invalid one.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// The client context could not set up its timer runtime.
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// JSON encode/decode error.
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// YAML decode error.
    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// Base64 decode error.
    #[error("Base64 decode error: {0}")]
    Base64DecodeError(#[from] base64::DecodeError),

    /// IO error.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Result type alias for rscdm operations.
pub type Result<T> = std::result::Result<T, Error>;
