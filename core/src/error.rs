use runbridge_protocol::SessionId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("{message}")]
    Validation { message: String },

    #[error("an execution is already running for session {session_id}")]
    AlreadyRunning { session_id: SessionId },

    #[error("no active session {session_id}")]
    NoSuchSession { session_id: SessionId },

    #[error("session {session_id} is not running")]
    NotRunning { session_id: SessionId },

    #[error("a stream is already attached to session {session_id}")]
    StreamBusy { session_id: SessionId },

    #[error("failed to start job: {source}")]
    Spawn {
        #[source]
        source: std::io::Error,
    },

    #[error("failed to deliver input to the job")]
    InputClosed,
}

impl SessionError {
    pub(crate) fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub(crate) fn spawn(source: std::io::Error) -> Self {
        Self::Spawn { source }
    }
}
