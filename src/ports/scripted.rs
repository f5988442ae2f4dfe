//! Scripted Generator
//!
//! A [`GenerationPort`] that replays a queue of prepared replies and
//! records every request it receives. Used by the engine tests and by the
//! CLI to replay a workflow offline from a responses file.
//!
//! # Responses File Format
//!
//! ```yaml
//! - '[{"title": "Chapter 1", "content": "..."}]'
//! - error: connection reset
//! - plain text reply
//! ```

use std::collections::VecDeque;
use std::error::Error;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use log::debug;
use serde::Deserialize;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use super::generation::{ChatMessage, GenerationError, GenerationPort, ModelConfig};

/// A prepared reply.
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    /// Return this text
    Text(String),
    /// Fail with this error
    Fail(GenerationError),
    /// Wait for the gate before returning the text
    Gated {
        gate: Arc<Notify>,
        text: String,
        /// Stop waiting with `Aborted` when the token fires
        honor_cancel: bool,
    },
}

#[derive(Deserialize)]
#[serde(untagged)]
enum FileReply {
    Error { error: String },
    Text(String),
}

/// One recorded call.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub messages: Vec<ChatMessage>,
    pub config: ModelConfig,
}

impl RecordedRequest {
    /// Concatenated content of every message, for assertions.
    pub fn transcript(&self) -> String {
        self.messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Content of the last message.
    pub fn last_content(&self) -> &str {
        self.messages.last().map(|m| m.content.as_str()).unwrap_or("")
    }
}

#[derive(Default)]
struct Script {
    replies: VecDeque<ScriptedReply>,
    requests: Vec<RecordedRequest>,
}

/// Replays queued replies in order.
#[derive(Default)]
pub struct ScriptedGenerator {
    script: Mutex<Script>,
}

impl ScriptedGenerator {
    /// Creates a generator with no queued replies.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a generator that returns each text in turn.
    pub fn with_texts<I, S>(texts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let generator = Self::new();
        for text in texts {
            generator.push_text(text);
        }
        generator
    }

    /// Loads replies from a YAML list.
    ///
    /// Each item is either a string (returned as text) or a mapping with an
    /// `error` key (returned as a transport error).
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self, Box<dyn Error>> {
        let content = fs::read_to_string(path.as_ref())?;
        let replies: Vec<FileReply> = serde_yaml::from_str(&content)?;

        let generator = Self::new();
        for reply in replies {
            match reply {
                FileReply::Text(text) => generator.push_text(text),
                FileReply::Error { error } => {
                    generator.push(ScriptedReply::Fail(GenerationError::Transport(error)))
                }
            }
        }
        Ok(generator)
    }

    pub fn push(&self, reply: ScriptedReply) {
        self.lock().replies.push_back(reply);
    }

    pub fn push_text(&self, text: impl Into<String>) {
        self.push(ScriptedReply::Text(text.into()));
    }

    pub fn push_error(&self, error: GenerationError) {
        self.push(ScriptedReply::Fail(error));
    }

    /// Queues a reply that is held back until the returned gate is notified.
    pub fn push_gated(&self, text: impl Into<String>, honor_cancel: bool) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.push(ScriptedReply::Gated {
            gate: Arc::clone(&gate),
            text: text.into(),
            honor_cancel,
        });
        gate
    }

    /// Returns every request received so far.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.lock().requests.clone()
    }

    pub fn request_count(&self) -> usize {
        self.lock().requests.len()
    }

    pub fn remaining(&self) -> usize {
        self.lock().replies.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl GenerationPort for ScriptedGenerator {
    fn check_ready(&self) -> Result<(), GenerationError> {
        if self.lock().replies.is_empty() {
            return Err(GenerationError::Configuration(
                "no scripted responses loaded".to_string(),
            ));
        }
        Ok(())
    }

    async fn complete(
        &self,
        messages: &[ChatMessage],
        config: &ModelConfig,
        cancel: &CancellationToken,
    ) -> Result<String, GenerationError> {
        if cancel.is_cancelled() {
            return Err(GenerationError::Aborted);
        }

        let reply = {
            let mut script = self.lock();
            script.requests.push(RecordedRequest {
                messages: messages.to_vec(),
                config: config.clone(),
            });
            script.replies.pop_front()
        };

        debug!("Scripted reply for request with {} messages", messages.len());

        match reply {
            Some(ScriptedReply::Text(text)) => Ok(text),
            Some(ScriptedReply::Fail(error)) => Err(error),
            Some(ScriptedReply::Gated {
                gate,
                text,
                honor_cancel,
            }) => {
                if honor_cancel {
                    tokio::select! {
                        _ = gate.notified() => Ok(text),
                        _ = cancel.cancelled() => Err(GenerationError::Aborted),
                    }
                } else {
                    gate.notified().await;
                    Ok(text)
                }
            }
            None => Err(GenerationError::Transport(
                "scripted responses exhausted".to_string(),
            )),
        }
    }
}
