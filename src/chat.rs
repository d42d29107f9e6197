//! Response-generation collaborator client
//!
//! The collaborator maps a transcript to reply text plus an opaque device
//! action; its `message` field is raw and must pass the reply filter before
//! it is spoken.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{ChatConfig, REQUEST_TIMEOUT};
use crate::{Error, Result};

/// Request body for the collaborator endpoint
#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    query: &'a str,
    context: serde_json::Value,
}

/// Reply from the response-generation collaborator
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatReply {
    /// Raw reply text (unfiltered)
    #[serde(default)]
    pub message: String,

    /// Opaque device action identifier, passed through unmodified
    #[serde(default, rename = "actionType")]
    pub action_type: String,

    /// Opaque action parameters, validated only by the action executor
    #[serde(default, rename = "actionParams")]
    pub action_params: serde_json::Value,

    /// Emotion tag for the reply
    #[serde(default, rename = "emotionType")]
    pub emotion_type: String,
}

/// Produces an assistant reply for a user transcript
#[async_trait]
pub trait ResponseGenerator: Send + Sync {
    /// Generate a reply for `query`
    async fn generate(&self, query: &str) -> Result<ChatReply>;
}

/// HTTP client for the remote collaborator
pub struct ChatClient {
    client: reqwest::Client,
    url: String,
}

impl ChatClient {
    /// Create a client for the configured collaborator endpoint
    #[must_use]
    pub fn new(config: &ChatConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: config.url.clone(),
        }
    }
}

#[async_trait]
impl ResponseGenerator for ChatClient {
    async fn generate(&self, query: &str) -> Result<ChatReply> {
        tracing::debug!(query, "requesting reply");

        let request = ChatRequest {
            query,
            context: serde_json::json!({ "source": "voice" }),
        };

        let response = self
            .client
            .post(&self.url)
            .timeout(REQUEST_TIMEOUT)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "collaborator error");
            return Err(Error::Chat(format!("collaborator error {status}: {body}")));
        }

        let reply: ChatReply = response.json().await?;
        tracing::debug!(
            message_len = reply.message.len(),
            action = %reply.action_type,
            emotion = %reply.emotion_type,
            "reply received"
        );
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_parses_with_missing_fields() {
        let reply: ChatReply = serde_json::from_str(r#"{"message":"好的"}"#).unwrap();
        assert_eq!(reply.message, "好的");
        assert!(reply.action_type.is_empty());
        assert!(reply.action_params.is_null());
    }

    #[test]
    fn reply_passes_action_params_through() {
        let reply: ChatReply = serde_json::from_str(
            r#"{"message":"开始清洁","actionType":"start_clean","actionParams":{"mode":"spot","times":2},"emotionType":"neutral"}"#,
        )
        .unwrap();
        assert_eq!(reply.action_type, "start_clean");
        assert_eq!(reply.action_params["mode"], "spot");
        assert_eq!(reply.action_params["times"], 2);
    }
}
