//! Error types for the recovery tool.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, RecoveryError>;

/// Errors that can occur while driving a recovery plan.
#[derive(Debug, Error)]
pub enum RecoveryError {
    /// Malformed hosts file, invalid mode, missing backup-manifest path or
    /// conflicting credentials. Raised before any remote work starts.
    #[error("configuration error: {0}")]
    Config(String),

    /// Dial, handshake, authentication or file-transfer failure.
    #[error("{0}")]
    Transport(String),

    /// The remote host key changed or the operator refused it.
    #[error("host key verification failed: {0}")]
    HostKey(String),

    /// A polled command exhausted its deadline. `output` carries the last
    /// combined output observed, so callers can match on server messages
    /// such as `Peer URLs already exists`.
    #[error("command '{command}' failed after timed out, error: {reason}")]
    CommandFailed {
        command: String,
        reason: String,
        output: String,
    },

    /// A command ran but its output failed a check outside of a polling loop.
    #[error("{0}")]
    Validation(String),

    /// Unparseable etcdctl JSON, unexpected member counts, promotion
    /// repeatedly refused.
    #[error("{0}")]
    Protocol(String),

    /// The operator cancelled an interactive prompt.
    #[error("{0}")]
    Aborted(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RecoveryError {
    /// Combined output of the last attempt of a timed-out command, when the
    /// error is a [`RecoveryError::CommandFailed`].
    pub fn command_output(&self) -> Option<&str> {
        match self {
            RecoveryError::CommandFailed { output, .. } => Some(output),
            _ => None,
        }
    }
}
