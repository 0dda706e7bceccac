//! Error types for the lease server and client.
//!
//! All fallible operations in this crate return [`Result<T>`], which uses
//! the [`Error`] enum for error variants.

/// Errors that can occur while leasing addresses.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// File system or network I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error (used when printing the configuration).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Malformed lease message received.
    ///
    /// The wire format is a fixed 12-byte record; anything of another length,
    /// or carrying an unknown type or code, is rejected.
    #[error("Invalid lease message: {0}")]
    InvalidMessage(String),

    /// Invalid configuration, including malformed resource lines.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Socket creation or configuration error.
    #[error("Socket error: {0}")]
    Socket(String),

    /// A resource was added after the address pool was frozen.
    #[error("Address pool is frozen; resources can only be added during start-up")]
    PoolFrozen,

    /// The server answered a DISCOVER with ERR_NO_RESOURCE.
    #[error("Server has no address resources available")]
    NoResource,
}

/// A specialized Result type for lease operations.
pub type Result<T> = std::result::Result<T, Error>;
