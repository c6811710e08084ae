use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    InvalidRequest,
    TurnInProgress,
    AgentUnavailable,
    StreamError,
}

impl ErrorType {
    pub fn as_urn(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "urn:turn-relay:error:invalid_request",
            Self::TurnInProgress => "urn:turn-relay:error:turn_in_progress",
            Self::AgentUnavailable => "urn:turn-relay:error:agent_unavailable",
            Self::StreamError => "urn:turn-relay:error:stream_error",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "Invalid Request",
            Self::TurnInProgress => "Turn In Progress",
            Self::AgentUnavailable => "Agent Unavailable",
            Self::StreamError => "Stream Error",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidRequest => 400,
            Self::TurnInProgress => 409,
            Self::AgentUnavailable => 503,
            Self::StreamError => 500,
        }
    }
}

/// RFC 7807 problem body returned for every rejected request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub type_: String,
    pub title: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    #[serde(flatten, default, skip_serializing_if = "Map::is_empty")]
    pub extensions: Map<String, Value>,
}

impl ProblemDetails {
    pub fn new(error_type: ErrorType, detail: Option<String>) -> Self {
        Self {
            type_: error_type.as_urn().to_string(),
            title: error_type.title().to_string(),
            status: error_type.status_code(),
            detail,
            instance: None,
            extensions: Map::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
    #[error("a turn is already in progress: {session_id}")]
    TurnInProgress { session_id: String },
    #[error("no remote agent is connected")]
    AgentUnavailable,
    #[error("stream error: {message}")]
    StreamError { message: String },
}

impl RelayError {
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::InvalidRequest { .. } => ErrorType::InvalidRequest,
            Self::TurnInProgress { .. } => ErrorType::TurnInProgress,
            Self::AgentUnavailable => ErrorType::AgentUnavailable,
            Self::StreamError { .. } => ErrorType::StreamError,
        }
    }

    pub fn to_problem_details(&self) -> ProblemDetails {
        let mut problem = ProblemDetails::new(self.error_type(), Some(self.to_string()));

        if let Self::TurnInProgress { session_id } = self {
            problem
                .extensions
                .insert("sessionId".to_string(), Value::String(session_id.clone()));
        }
        problem
    }
}

impl From<RelayError> for ProblemDetails {
    fn from(value: RelayError) -> Self {
        value.to_problem_details()
    }
}

impl From<&RelayError> for ProblemDetails {
    fn from(value: &RelayError) -> Self {
        value.to_problem_details()
    }
}
