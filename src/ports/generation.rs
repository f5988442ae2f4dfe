//! Generation Service Interface
//!
//! The engine talks to the text-generation backend through
//! [`GenerationPort`]. The backend is opaque: it receives a chat-style
//! message list and either returns text or fails.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Speaker of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

/// One turn of the conversation sent to the generation service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// Sampling settings for a single call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModelConfig {
    pub model: String,
    pub temperature: f32,
    pub top_p: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model: "default".to_string(),
            temperature: 0.8,
            top_p: 0.95,
            top_k: None,
            max_tokens: None,
        }
    }
}

/// Failure reported by the generation service.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GenerationError {
    /// The call was cancelled through its token
    #[error("generation aborted")]
    Aborted,

    /// The service answered with no usable text
    #[error("empty response from generation service")]
    Empty,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("generation service misconfigured: {0}")]
    Configuration(String),
}

impl GenerationError {
    /// Empty responses and transport errors are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Empty | Self::Transport(_))
    }
}

/// The text-generation backend.
#[async_trait]
pub trait GenerationPort: Send + Sync {
    /// Reports configuration problems before a run starts.
    fn check_ready(&self) -> Result<(), GenerationError> {
        Ok(())
    }

    /// Sends the messages and returns the generated text.
    ///
    /// Implementations must return [`GenerationError::Aborted`] promptly
    /// once `cancel` fires.
    async fn complete(
        &self,
        messages: &[ChatMessage],
        config: &ModelConfig,
        cancel: &CancellationToken,
    ) -> Result<String, GenerationError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_role_serializes_lowercase() {
        let json = serde_json::to_string(&ChatMessage::assistant("hi")).unwrap();
        assert_eq!(json, r#"{"role":"assistant","content":"hi"}"#);
    }

    #[test]
    fn test_retryable_errors() {
        assert!(GenerationError::Empty.is_retryable());
        assert!(GenerationError::Transport("reset".into()).is_retryable());
        assert!(!GenerationError::Aborted.is_retryable());
        assert!(!GenerationError::Configuration("no key".into()).is_retryable());
    }

    #[test]
    fn test_model_config_defaults_fill_missing_fields() {
        let config: ModelConfig = serde_yaml::from_str("model: writer").unwrap();
        assert_eq!(config.model, "writer");
        assert_eq!(config.temperature, ModelConfig::default().temperature);
        assert!(config.max_tokens.is_none());
    }
}
