use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::session::LifecycleState;

/// Result alias for session and pool operations.
pub type SessionResult<T> = Result<T, SessionError>;

/// Errors that can occur while spawning, driving, or pooling engine sessions.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("file not found: {}", .0.display())]
    MissingFile(PathBuf),
    #[error("file not readable: {}: {source}", path.display())]
    Unreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to spawn engine: {0}")]
    EngineStart(String),
    #[error("engine terminated during startup with exit code {0}")]
    EngineExited(u32),
    #[error("engine did not show its prompt within {0:?}")]
    StartupTimeout(Duration),
    #[error("syntax error, unbalanced parentheses in command: {0}")]
    Syntax(String),
    #[error("transport failure while executing `{command}`: {reason}")]
    Transport { command: String, reason: String },
    #[error("invalid session transition from {from:?} to {to:?}")]
    InvalidTransition {
        from: LifecycleState,
        to: LifecycleState,
    },
    #[error("session is {0:?}, expected Active")]
    NotActive(LifecycleState),
    #[error("unexpected engine reply: {0}")]
    UnexpectedReply(String),
    #[error("failed to read results: {0}")]
    ResultRead(String),
    #[error("log sink error: {0}")]
    LogSink(String),
    #[error("dimension mismatch: expected {expected} {what}, got {actual}")]
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("pool worker panicked: {0}")]
    WorkerPanicked(String),
    #[error("failed to build worker pool: {0}")]
    PoolBuild(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl SessionError {
    pub(crate) fn engine_start(err: impl Into<String>) -> Self {
        SessionError::EngineStart(err.into())
    }

    pub(crate) fn unexpected(message: impl Into<String>) -> Self {
        SessionError::UnexpectedReply(message.into())
    }

    pub(crate) fn transport(command: impl Into<String>, reason: impl Into<String>) -> Self {
        SessionError::Transport {
            command: command.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn dimension(what: &'static str, expected: usize, actual: usize) -> Self {
        SessionError::DimensionMismatch {
            what,
            expected,
            actual,
        }
    }

    /// True when the error leaves the session unable to accept further commands.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            SessionError::Transport { .. }
                | SessionError::EngineExited(_)
                | SessionError::StartupTimeout(_)
        )
    }
}
