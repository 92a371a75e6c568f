//! Error types for rtperf-core

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for rtperf-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced to callers of the control-thread API.
///
/// Lifecycle misuse (stopping twice, pausing while stopped) is not an error;
/// those calls return sentinel values instead. What remains here are
/// configuration problems and failures of the remote-call transport itself.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration file error
    #[error("Configuration error: {0}")]
    Config(String),

    /// No configuration file at the expected location
    #[error("Config file not found at {0:?}")]
    ConfigNotFound(PathBuf),

    /// The engine worker is gone (thread exited or channel closed)
    #[error("Engine worker disconnected")]
    Disconnected,

    /// The engine rejected a remote call
    #[error("Remote call {op} failed: {message}")]
    Remote { op: String, message: String },

    /// No operation with this name in the operation table
    #[error("Unknown engine operation: {0}")]
    UnknownOperation(String),

    /// Wrong number of arguments for an operation
    #[error("Wrong arity for {op}: expected {expected}, got {got}")]
    Arity {
        op: &'static str,
        expected: usize,
        got: usize,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// TOML serialization error
    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}
