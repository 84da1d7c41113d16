//! Error types for the conversation pipeline.

use compass_core::error::CompassError;
use compass_insight::InsightError;

/// Errors from the text-generation backend.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("backend returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("stream failed: {0}")]
    Stream(String),
    #[error("malformed stream payload: {0}")]
    Decode(String),
    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

/// Errors from the chat pipeline.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("message cannot be empty")]
    EmptyMessage,
    #[error("message exceeds maximum length of {0} characters")]
    MessageTooLong(usize),
    #[error("conversation not found: {0}")]
    ConversationNotFound(uuid::Uuid),
    #[error("signal provider {provider} failed: {message}")]
    Provider {
        provider: &'static str,
        message: String,
    },
    #[error("model error: {0}")]
    Model(#[from] ModelError),
    #[error("prompt library error: {0}")]
    Prompt(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<CompassError> for ChatError {
    fn from(err: CompassError) -> Self {
        ChatError::Storage(err.to_string())
    }
}

impl From<InsightError> for ChatError {
    fn from(err: InsightError) -> Self {
        ChatError::Storage(err.to_string())
    }
}

impl ChatError {
    /// Whether the caller sent something invalid, as opposed to a server fault.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ChatError::EmptyMessage | ChatError::MessageTooLong(_) | ChatError::ConversationNotFound(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_chat_error_display() {
        assert_eq!(ChatError::EmptyMessage.to_string(), "message cannot be empty");
        assert_eq!(
            ChatError::MessageTooLong(4000).to_string(),
            "message exceeds maximum length of 4000 characters"
        );

        let id = Uuid::nil();
        assert_eq!(
            ChatError::ConversationNotFound(id).to_string(),
            "conversation not found: 00000000-0000-0000-0000-000000000000"
        );

        let err = ChatError::Provider {
            provider: "style",
            message: "db locked".to_string(),
        };
        assert_eq!(err.to_string(), "signal provider style failed: db locked");

        let err = ChatError::Prompt("missing base".to_string());
        assert_eq!(err.to_string(), "prompt library error: missing base");
    }

    #[test]
    fn test_model_error_display() {
        let err = ModelError::Status {
            status: 503,
            body: "overloaded".to_string(),
        };
        assert_eq!(err.to_string(), "backend returned status 503: overloaded");

        let chat: ChatError = err.into();
        assert!(matches!(chat, ChatError::Model(_)));
        assert!(chat.to_string().starts_with("model error: "));
    }

    #[test]
    fn test_chat_error_from_compass_error() {
        let chat_err: ChatError = CompassError::Storage("connection lost".to_string()).into();
        assert!(matches!(chat_err, ChatError::Storage(_)));
        assert!(chat_err.to_string().contains("connection lost"));
    }

    #[test]
    fn test_client_error_classification() {
        assert!(ChatError::EmptyMessage.is_client_error());
        assert!(ChatError::ConversationNotFound(Uuid::new_v4()).is_client_error());
        assert!(!ChatError::Storage("x".to_string()).is_client_error());
        assert!(!ChatError::Model(ModelError::Stream("reset".to_string())).is_client_error());
    }
}
