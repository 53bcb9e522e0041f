//! Client errors.

use std::fmt;

/// Errors surfaced by the client runtime.
#[derive(Debug)]
pub enum ClientError {
    /// Missing or inconsistent configuration.
    Config(String),
    /// Database error.
    Database(String),
    /// Network error.
    Network(String),
    /// IO error.
    Io(String),
    /// The named hub is not configured or not open.
    UnknownHub(String),
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::Config(e) => write!(f, "configuration error: {}", e),
            ClientError::Database(e) => write!(f, "database error: {}", e),
            ClientError::Network(e) => write!(f, "network error: {}", e),
            ClientError::Io(e) => write!(f, "io error: {}", e),
            ClientError::UnknownHub(name) => write!(f, "unknown hub: {}", name),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<std::io::Error> for ClientError {
    fn from(e: std::io::Error) -> Self {
        ClientError::Io(e.to_string())
    }
}

impl From<rusqlite::Error> for ClientError {
    fn from(e: rusqlite::Error) -> Self {
        ClientError::Database(e.to_string())
    }
}
