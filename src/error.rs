//! Error types for dc-session
//!
//! One enum per layer. Every failure that reaches a caller ends either in a
//! delivered [`crate::Outcome`] or in a notification callback; nothing in here
//! is allowed to take the process down.

use thiserror::Error;

use crate::types::DcId;

/// Decoding failures in the wire codec.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("Unexpected end of input: needed {needed} bytes, {remaining} remaining")]
    UnexpectedEof { needed: usize, remaining: usize },

    #[error("Unexpected constructor {found:#010x}, expected {expected}")]
    UnexpectedConstructor { found: u32, expected: &'static str },

    #[error("Invalid length: {0}")]
    InvalidLength(usize),

    #[error("Invalid UTF-8 in string field")]
    InvalidString,

    #[error("Frame of {0} bytes exceeds the maximum frame size")]
    FrameTooLarge(usize),
}

/// Failures of the key-exchange handshake.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("No reachable endpoint among {tried} candidates")]
    UnreachableEndpoint { tried: usize },

    #[error("No candidate endpoints for {0}")]
    NoEndpoints(DcId),

    #[error("Server offered no recognised public key")]
    UnknownServerKey,

    #[error("Invalid Diffie-Hellman parameters: {0}")]
    InvalidDhParameters(String),

    #[error("Nonce mismatch in handshake step '{0}'")]
    NonceMismatch(&'static str),

    #[error("Handshake step '{0}' timed out")]
    HandshakeTimeout(&'static str),

    #[error("Failed to decrypt handshake answer")]
    DecryptionFailed,

    #[error("Failed to factorize server challenge {0:#018x}")]
    FactorizationFailed(u64),

    #[error("Server rejected the handshake: {0}")]
    Rejected(&'static str),

    #[error("Handshake protocol error: {0}")]
    Protocol(#[from] WireError),

    #[error("Handshake I/O error: {0}")]
    Io(String),
}

/// Failures of the encrypted transport.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Data center {0} is not authenticated")]
    NotAuthenticated(DcId),

    #[error("Failed to decrypt envelope from {0}")]
    DecryptionFailed(DcId),

    #[error("Connection to {0} lost")]
    ConnectionLost(DcId),

    #[error("No endpoints known for {0}")]
    UnknownDc(DcId),

    #[error("Frame error: {0}")]
    Wire(#[from] WireError),

    #[error("I/O error: {0}")]
    Io(String),
}

/// Terminal RPC failures delivered through an [`crate::Outcome`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    #[error("Server error {code}: {message}")]
    ServerError { code: i32, message: String },

    #[error("Request must be sent to {0}")]
    Moved(DcId),

    #[error("Request timed out")]
    Timeout,

    #[error("Request cancelled")]
    Cancelled,

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Configuration problems detected at construction time.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Umbrella error for the caller-facing API.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Authorization failed: {0}")]
    Auth(#[from] AuthError),

    #[error("Transport failed: {0}")]
    Transport(#[from] TransportError),

    #[error("RPC failed: {0}")]
    Rpc(#[from] RpcError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Unknown data center: {0}")]
    UnknownDc(DcId),
}

impl From<std::io::Error> for AuthError {
    fn from(e: std::io::Error) -> Self {
        AuthError::Io(e.to_string())
    }
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        TransportError::Io(e.to_string())
    }
}
