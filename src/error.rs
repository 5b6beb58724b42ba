//! Error taxonomy for the photon daemon
//!
//! Every variant is recovered at the connection boundary and turned into an
//! `error` response; none of them terminate the daemon.

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DaemonError {
    /// Malformed or unknown request. The connection survives.
    #[error("{0}")]
    Protocol(String),

    /// Photon source failed to compile or could not be read.
    #[error("Failed to load photon '{photon}': {message}")]
    Load { photon: String, message: String },

    /// The photon method itself failed.
    #[error("{message}")]
    Invocation { method: String, message: String },

    #[error("Timed out after {timeout:?} waiting for lock '{name}'")]
    LockTimeout { name: String, timeout: Duration },

    #[error("{what} not found: {name}")]
    NotFound { what: &'static str, name: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DaemonError {
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    pub fn load(photon: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Load {
            photon: photon.into(),
            message: message.to_string(),
        }
    }

    pub fn invocation(method: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Invocation {
            method: method.into(),
            message: message.to_string(),
        }
    }

    pub fn not_found(what: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            what,
            name: name.into(),
        }
    }

    /// Stable machine-readable code carried next to the message in error responses
    pub fn code(&self) -> &'static str {
        match self {
            Self::Protocol(_) => "protocol_error",
            Self::Load { .. } => "load_error",
            Self::Invocation { .. } => "invocation_error",
            Self::LockTimeout { .. } => "lock_timeout",
            Self::NotFound { .. } => "not_found",
            Self::Io(_) => "io_error",
            Self::Serialization(_) => "serialization_error",
        }
    }
}

pub type Result<T> = std::result::Result<T, DaemonError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(DaemonError::protocol("bad").code(), "protocol_error");
        assert_eq!(DaemonError::load("todo", "syntax").code(), "load_error");
        assert_eq!(
            DaemonError::LockTimeout {
                name: "write".to_string(),
                timeout: Duration::from_millis(10),
            }
            .code(),
            "lock_timeout"
        );
    }

    #[test]
    fn test_invocation_error_carries_thrown_message() {
        let err = DaemonError::invocation("add", "list is full");
        assert_eq!(err.to_string(), "list is full");
    }
}
