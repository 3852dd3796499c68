use serde::Deserialize;
use serde::Serialize;

use crate::session_id::SessionId;

/// Body of `POST /api/execute`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExecuteParams {
    /// Path handed to the job. Required; validated before any session is
    /// created.
    #[serde(default)]
    pub path: String,

    /// Extra arguments as one shell-style string, split server-side.
    #[serde(default)]
    pub args: String,

    #[serde(default = "default_session_id")]
    pub session_id: SessionId,
}

/// Body of `POST /api/input`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InputParams {
    #[serde(default = "default_session_id")]
    pub session_id: SessionId,

    #[serde(default)]
    pub input: String,
}

/// Body of `POST /api/kill`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KillParams {
    pub session_id: SessionId,
}

fn default_session_id() -> SessionId {
    SessionId::new("default")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiOk {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ApiOk {
    pub fn new() -> Self {
        Self {
            success: true,
            message: None,
        }
    }

    pub fn with_message(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
        }
    }
}

impl Default for ApiOk {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiFailure {
    pub error: String,
    pub success: bool,
}

impl ApiFailure {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            success: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
}

impl HealthResponse {
    pub fn ok() -> Self {
        Self {
            status: "ok".to_string(),
        }
    }
}
