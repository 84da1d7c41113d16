//! HTTP side of the client: opening chat streams and fetching history.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use compass_core::config::ClientConfig;
use compass_core::types::ConversationTurn;

use crate::error::ClientError;

/// Raw response body of a chat stream.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, ClientError>> + Send>>;

/// Request body for `POST /chat/stream`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingMessage {
    pub user_message: String,
    pub conversation_id: Uuid,
}

#[derive(Debug, Deserialize)]
struct TurnsBody {
    turns: Vec<ConversationTurn>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

/// Connection to the chat server.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Open a stream for one user message.
    async fn open(&self, message: &OutgoingMessage) -> Result<ByteStream, ClientError>;

    /// Every stored turn of a conversation.
    async fn history(&self, conversation_id: Uuid) -> Result<Vec<ConversationTurn>, ClientError>;
}

/// [`ChatTransport`] over HTTP with a bearer token.
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpTransport {
    pub fn new(config: &ClientConfig, token: impl Into<String>) -> Result<Self, ClientError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, ClientError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let text = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&text)
            .map(|body| body.message)
            .unwrap_or(text);
        Err(ClientError::Status {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl ChatTransport for HttpTransport {
    async fn open(&self, message: &OutgoingMessage) -> Result<ByteStream, ClientError> {
        let url = format!("{}/chat/stream", self.base_url);
        debug!(conversation_id = %message.conversation_id, "Opening chat stream");
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .header("accept", "text/event-stream")
            .json(message)
            .send()
            .await?;
        let response = Self::check(response).await?;

        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()).map_err(ClientError::from));
        Ok(Box::pin(stream))
    }

    async fn history(&self, conversation_id: Uuid) -> Result<Vec<ConversationTurn>, ClientError> {
        let url = format!("{}/conversations/{}/turns", self.base_url, conversation_id);
        let response = self.client.get(&url).bearer_auth(&self.token).send().await?;
        let body: TurnsBody = Self::check(response).await?.json().await?;
        Ok(body.turns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outgoing_message_is_camel_case() {
        let message = OutgoingMessage {
            user_message: "hi".into(),
            conversation_id: Uuid::nil(),
        };
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["userMessage"], "hi");
        assert_eq!(json["conversationId"], "00000000-0000-0000-0000-000000000000");
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let config = ClientConfig {
            base_url: "http://127.0.0.1:3040/".into(),
            ..ClientConfig::default()
        };
        let transport = HttpTransport::new(&config, "token").unwrap();
        assert_eq!(transport.base_url, "http://127.0.0.1:3040");
    }
}
