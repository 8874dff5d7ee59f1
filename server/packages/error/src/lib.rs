use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    InvalidRequest,
    Unauthenticated,
    UnsupportedMediaType,
    AttachmentRejected,
    SessionUnavailable,
    ConfigUnavailable,
    StreamNotFound,
    StreamConflict,
    InvocationFailed,
    BackendStream,
    SideChannel,
    NotFound,
    Internal,
}

impl ErrorType {
    pub fn as_urn(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "urn:chat-relay:error:invalid_request",
            Self::Unauthenticated => "urn:chat-relay:error:unauthenticated",
            Self::UnsupportedMediaType => "urn:chat-relay:error:unsupported_media_type",
            Self::AttachmentRejected => "urn:chat-relay:error:attachment_rejected",
            Self::SessionUnavailable => "urn:chat-relay:error:session_unavailable",
            Self::ConfigUnavailable => "urn:chat-relay:error:config_unavailable",
            Self::StreamNotFound => "urn:chat-relay:error:stream_not_found",
            Self::StreamConflict => "urn:chat-relay:error:stream_conflict",
            Self::InvocationFailed => "urn:chat-relay:error:invocation_failed",
            Self::BackendStream => "urn:chat-relay:error:backend_stream",
            Self::SideChannel => "urn:chat-relay:error:side_channel",
            Self::NotFound => "urn:chat-relay:error:not_found",
            Self::Internal => "urn:chat-relay:error:internal",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "Invalid Request",
            Self::Unauthenticated => "Unauthenticated",
            Self::UnsupportedMediaType => "Unsupported Media Type",
            Self::AttachmentRejected => "Attachment Rejected",
            Self::SessionUnavailable => "Session Unavailable",
            Self::ConfigUnavailable => "Configuration Unavailable",
            Self::StreamNotFound => "Stream Not Found",
            Self::StreamConflict => "Stream Already Active",
            Self::InvocationFailed => "Invocation Failed",
            Self::BackendStream => "Backend Stream Error",
            Self::SideChannel => "Side Channel Error",
            Self::NotFound => "Not Found",
            Self::Internal => "Internal Error",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidRequest => 400,
            Self::Unauthenticated => 401,
            Self::UnsupportedMediaType => 415,
            Self::AttachmentRejected => 413,
            Self::SessionUnavailable => 502,
            Self::ConfigUnavailable => 502,
            Self::StreamNotFound => 404,
            Self::StreamConflict => 409,
            Self::InvocationFailed => 502,
            Self::BackendStream => 502,
            Self::SideChannel => 502,
            Self::NotFound => 404,
            Self::Internal => 500,
        }
    }
}

/// RFC 7807 body returned for every failure that happens before a stream opens.
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

/// Payload of the single `error` event emitted into an already-open stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamErrorEvent {
    #[serde(rename = "type")]
    pub type_: String,
    pub content: String,
    pub metadata: StreamErrorMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamErrorMetadata {
    pub session_id: String,
    pub error_kind: ErrorType,
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
    #[error("unauthenticated: {message}")]
    Unauthenticated { message: String },
    #[error("unsupported media type: {message}")]
    UnsupportedMediaType { message: String },
    #[error("attachment rejected: {filename}: {message}")]
    AttachmentRejected { filename: String, message: String },
    #[error("session unavailable: {message}")]
    SessionUnavailable {
        session_id: Option<String>,
        message: String,
    },
    #[error("configuration unavailable: {message}")]
    ConfigUnavailable { message: String },
    #[error("no active stream for session {session_id}")]
    StreamNotFound { session_id: String },
    #[error("session {session_id} already has an active stream")]
    StreamConflict { session_id: String },
    #[error("agent invocation failed: {message}")]
    InvocationFailed {
        status: Option<u16>,
        message: String,
    },
    #[error("agent stream failed: {message}")]
    BackendStream { message: String },
    #[error("side channel poll failed: {message}")]
    SideChannel { message: String },
    #[error("no route for {path}")]
    NotFound { path: String },
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl RelayError {
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    pub fn backend_stream(message: impl Into<String>) -> Self {
        Self::BackendStream {
            message: message.into(),
        }
    }

    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::InvalidRequest { .. } => ErrorType::InvalidRequest,
            Self::Unauthenticated { .. } => ErrorType::Unauthenticated,
            Self::UnsupportedMediaType { .. } => ErrorType::UnsupportedMediaType,
            Self::AttachmentRejected { .. } => ErrorType::AttachmentRejected,
            Self::SessionUnavailable { .. } => ErrorType::SessionUnavailable,
            Self::ConfigUnavailable { .. } => ErrorType::ConfigUnavailable,
            Self::StreamNotFound { .. } => ErrorType::StreamNotFound,
            Self::StreamConflict { .. } => ErrorType::StreamConflict,
            Self::InvocationFailed { .. } => ErrorType::InvocationFailed,
            Self::BackendStream { .. } => ErrorType::BackendStream,
            Self::SideChannel { .. } => ErrorType::SideChannel,
            Self::NotFound { .. } => ErrorType::NotFound,
            Self::Internal { .. } => ErrorType::Internal,
        }
    }

    pub fn to_problem_details(&self) -> ProblemDetails {
        let mut problem = ProblemDetails::new(self.error_type(), Some(self.to_string()));
        let mut extensions = Map::new();
        match self {
            Self::AttachmentRejected { filename, .. } => {
                extensions.insert("filename".to_string(), Value::String(filename.clone()));
            }
            Self::SessionUnavailable {
                session_id: Some(session_id),
                ..
            }
            | Self::StreamNotFound { session_id }
            | Self::StreamConflict { session_id } => {
                extensions.insert("sessionId".to_string(), Value::String(session_id.clone()));
            }
            Self::InvocationFailed {
                status: Some(status),
                ..
            } => {
                extensions.insert(
                    "upstreamStatus".to_string(),
                    Value::Number(serde_json::Number::from(*status)),
                );
            }
            _ => {}
        }
        problem.extensions = extensions;
        problem
    }

    pub fn to_stream_event(&self, session_id: &str) -> StreamErrorEvent {
        StreamErrorEvent {
            type_: "error".to_string(),
            content: self.to_string(),
            metadata: StreamErrorMetadata {
                session_id: session_id.to_string(),
                error_kind: self.error_type(),
            },
        }
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

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn stream_event_matches_wire_shape() {
        let err = RelayError::backend_stream("upstream reset");
        let value = serde_json::to_value(err.to_stream_event("s-1")).expect("serialize");
        assert_eq!(
            value,
            json!({
                "type": "error",
                "content": "agent stream failed: upstream reset",
                "metadata": {"session_id": "s-1", "error_kind": "backend_stream"}
            })
        );
    }

    #[test]
    fn problem_details_carry_status_and_extensions() {
        let err = RelayError::InvocationFailed {
            status: Some(503),
            message: "agent overloaded".to_string(),
        };
        let problem = err.to_problem_details();
        assert_eq!(problem.status, 502);
        assert_eq!(problem.type_, "urn:chat-relay:error:invocation_failed");
        assert_eq!(problem.extensions["upstreamStatus"], json!(503));
    }

    #[test]
    fn unknown_route_and_busy_session_have_their_own_kinds() {
        let missing = RelayError::NotFound {
            path: "/v2/nothing".to_string(),
        }
        .to_problem_details();
        assert_eq!(missing.status, 404);
        assert_eq!(missing.title, "Not Found");
        assert_eq!(missing.type_, "urn:chat-relay:error:not_found");

        let busy = RelayError::StreamConflict {
            session_id: "s-1".to_string(),
        }
        .to_problem_details();
        assert_eq!(busy.status, 409);
        assert_eq!(busy.type_, "urn:chat-relay:error:stream_conflict");
        assert_eq!(busy.extensions["sessionId"], json!("s-1"));
    }
}
