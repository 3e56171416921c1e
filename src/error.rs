//! Server error types.

use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

/// Result type for server start-up and configuration.
pub type Result<T> = std::result::Result<T, ServerError>;

/// Errors that can abort configuration or server start.
///
/// Nothing on the request path produces one of these; per-request
/// failures become a response status and an error-log line.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Option name not in the option table.
    #[error("unknown option: {0}")]
    UnknownOption(String),

    /// Option value could not be interpreted.
    #[error("invalid value for {name}: {value:?} ({reason})")]
    InvalidOption {
        /// Option name.
        name: &'static str,
        /// Offending value.
        value: String,
        /// What was wrong with it.
        reason: String,
    },

    /// Configuration file could not be read.
    #[error("cannot read config file {path}: {source}")]
    ConfigFile {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// Listening socket could not be created.
    #[error("failed to bind to {addr}: {source}")]
    BindFailed {
        /// Requested address.
        addr: SocketAddr,
        /// Underlying error.
        source: std::io::Error,
    },

    /// TLS context could not be initialised.
    #[error("TLS error: {0}")]
    Tls(String),

    /// Switching to `run_as_user` failed.
    #[error("cannot run as user {user}: {reason}")]
    Privileges {
        /// Target user.
        user: String,
        /// Failure description.
        reason: String,
    },

    /// Other I/O failure during start-up.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServerError {
    pub(crate) fn invalid(name: &'static str, value: &str, reason: impl Into<String>) -> Self {
        Self::InvalidOption {
            name,
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_option_message_names_the_option() {
        let err = ServerError::invalid("num_threads", "abc", "not a number");
        let msg = err.to_string();
        assert!(msg.contains("num_threads"));
        assert!(msg.contains("\"abc\""));
    }
}
