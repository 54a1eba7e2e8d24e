//! Error Types
//!
//! One taxonomy for every failure the chat pipeline can hit. Transport and
//! parse failures are caught at the router boundary and turned into panel
//! notifications; they never escape as panics.

use thiserror::Error;

/// Text shown in place of an answer when a request fails before any output.
pub const NO_OUTPUT_PLACEHOLDER: &str =
    "The model did not respond. Check that the backend is running and reachable.";

#[derive(Error, Debug)]
pub enum ChatError {
    /// Network or HTTP failure talking to the backend
    #[error("Transport error: {message}")]
    Transport {
        message: String,
        status: Option<u16>,
    },

    /// Missing or rejected credential
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Malformed tool-call payload or backend response body
    #[error("Parse error: {0}")]
    Parse(String),

    /// User stop or supersession by a newer request on the same panel
    #[error("Request aborted")]
    Aborted,

    /// Tool-call type with no registered handler
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type ChatResult<T> = Result<T, ChatError>;

impl ChatError {
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport {
            message: msg.into(),
            status: None,
        }
    }

    pub fn auth(msg: impl Into<String>) -> Self {
        Self::Auth(msg.into())
    }

    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Map a non-success HTTP status to the matching error kind.
    pub fn from_status(status: u16, body: &str, backend: &str) -> Self {
        match status {
            401 | 403 => Self::Auth(format!("{} rejected the credential ({})", backend, status)),
            _ => Self::Transport {
                message: format!("{} returned {}: {:.300}", backend, status, body),
                status: Some(status),
            },
        }
    }

    /// Only transport failures are worth a fallback attempt or a health check.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted)
    }

    /// The `"Error: <detail>"` form used by callers that want text, not a Result.
    pub fn to_error_text(&self) -> String {
        format!("Error: {}", self)
    }

    /// Text for the panel's early-end notice.
    pub fn user_message(&self) -> String {
        match self {
            Self::Auth(detail) => format!(
                "Authentication failed: {}. Set an API key in the configuration.",
                detail
            ),
            Self::Aborted => "Generation stopped.".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<reqwest::Error> for ChatError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport {
            status: err.status().map(|s| s.as_u16()),
            message: err.to_string(),
        }
    }
}

impl From<ChatError> for String {
    fn from(err: ChatError) -> String {
        err.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert!(matches!(
            ChatError::from_status(401, "nope", "openai"),
            ChatError::Auth(_)
        ));
        assert!(matches!(
            ChatError::from_status(403, "", "openai"),
            ChatError::Auth(_)
        ));
        match ChatError::from_status(502, "bad gateway", "ollama") {
            ChatError::Transport { status, message } => {
                assert_eq!(status, Some(502));
                assert!(message.contains("bad gateway"));
            }
            other => panic!("expected transport error, got {:?}", other),
        }
    }

    #[test]
    fn test_only_transport_is_recoverable() {
        assert!(ChatError::transport("reset").is_recoverable());
        assert!(!ChatError::auth("missing key").is_recoverable());
        assert!(!ChatError::Aborted.is_recoverable());
        assert!(!ChatError::parse("bad json").is_recoverable());
    }

    #[test]
    fn test_error_text_prefix() {
        let err = ChatError::transport("connection refused");
        assert_eq!(
            err.to_error_text(),
            "Error: Transport error: connection refused"
        );
    }

    #[test]
    fn test_auth_user_message_is_actionable() {
        let msg = ChatError::auth("openai rejected the credential (401)").user_message();
        assert!(msg.contains("API key"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: ChatError = io_err.into();
        assert!(matches!(err, ChatError::Io(_)));
    }
}
