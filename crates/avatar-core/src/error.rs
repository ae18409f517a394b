//! Error types for the avatar gateway core

use std::time::Duration;
use thiserror::Error;

/// Result type alias for avatar operations
pub type AvatarResult<T> = Result<T, AvatarError>;

/// Errors that can occur while driving a conversational turn
#[derive(Error, Debug)]
pub enum AvatarError {
    /// A required request field was missing or empty.
    #[error("Missing {0}")]
    ClientInput(String),

    /// The assistant or speech API answered with a failure (or could not be reached).
    #[error("{service} error{}: {message}", .status.map(|s| format!(" {}", s)).unwrap_or_default())]
    RemoteService {
        service: &'static str,
        status: Option<u16>,
        message: String,
    },

    #[error("Run {run_id} ended with status {status}")]
    RunFailed { run_id: String, status: String },

    #[error("Run {run_id} did not complete within {after:?}")]
    RunTimedOut { run_id: String, after: Duration },

    /// The assistant reply is not the expected JSON message array.
    #[error("Invalid response format: {0}")]
    InvalidResponseFormat(String),

    #[error(transparent)]
    ExternalTool(#[from] ExternalToolError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AvatarError {
    pub(crate) fn remote(service: &'static str, status: Option<u16>, message: impl Into<String>) -> Self {
        AvatarError::RemoteService {
            service,
            status,
            message: message.into(),
        }
    }

    /// True for errors caused by the caller's request rather than by an upstream.
    pub fn is_client_error(&self) -> bool {
        matches!(self, AvatarError::ClientInput(_))
    }
}

/// Failure of an external command-line tool.
#[derive(Error, Debug)]
pub enum ExternalToolError {
    #[error("{program}: failed to start: {reason}")]
    Spawn { program: String, reason: String },

    #[error("{program}: exited with {}: {stderr}", .exit_code.map(|c| format!("code {}", c)).unwrap_or_else(|| "signal".to_string()))]
    Exit {
        program: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("{program}: timed out after {after:?}")]
    Timeout { program: String, after: Duration },
}
