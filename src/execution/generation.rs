//! Generation Calls
//!
//! Retry and continuation policy around the generation service:
//! - empty responses and transport errors are retried with exponential
//!   backoff; an abort is returned at once
//! - when an instruction asks for items up to some index and a response
//!   stops short, the conversation is extended with the raw response and a
//!   request to continue, for a bounded number of extra rounds

use log::{debug, info, warn};
use tokio_util::sync::CancellationToken;

use crate::config::RetryPolicy;
use crate::error::NodeFailure;
use crate::ports::generation::{ChatMessage, GenerationError, GenerationPort, ModelConfig};
use crate::text::numerals::leading_index;
use crate::text::response::parse_entries;
use crate::workflow::model::OutputEntry;

/// Calls the service, retrying transient failures.
pub async fn complete_with_retry(
    port: &dyn GenerationPort,
    messages: &[ChatMessage],
    config: &ModelConfig,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> Result<String, GenerationError> {
    let mut attempt: u32 = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(GenerationError::Aborted);
        }

        let result = match port.complete(messages, config, cancel).await {
            Ok(text) if text.trim().is_empty() => Err(GenerationError::Empty),
            other => other,
        };

        match result {
            Ok(text) => return Ok(text),
            Err(e) if e.is_retryable() && attempt < policy.max_retries => {
                let delay = policy.delay(attempt);
                warn!(
                    "Generation attempt {} failed: {}; retrying in {} ms",
                    attempt + 1,
                    e,
                    delay.as_millis()
                );

                if !delay.is_zero() {
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(GenerationError::Aborted),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Result of a generation with continuation.
#[derive(Debug, Clone)]
pub struct Generated {
    /// Parsed entries of every round, in round order
    pub entries: Vec<OutputEntry>,
    /// Number of continuation rounds after the first call
    pub continuations: u32,
}

/// Settings of one generation with continuation.
pub struct GenerationRequest<'a> {
    pub config: &'a ModelConfig,
    pub retry: &'a RetryPolicy,
    pub cancel: &'a CancellationToken,
    /// Last index the instruction asks for
    pub target: Option<u32>,
    pub max_rounds: u32,
}

/// Generates entries, continuing until the target index is reached.
///
/// `is_active` is checked after every call; once it reports false the
/// result is discarded with [`NodeFailure::Stale`].
pub async fn generate_entries<F>(
    port: &dyn GenerationPort,
    mut conversation: Vec<ChatMessage>,
    request: GenerationRequest<'_>,
    is_active: F,
) -> Result<Generated, NodeFailure>
where
    F: Fn() -> bool + Sync,
{
    let text = complete_with_retry(
        port,
        &conversation,
        request.config,
        request.retry,
        request.cancel,
    )
    .await?;
    if !is_active() {
        return Err(NodeFailure::Stale);
    }

    let mut entries = parse_entries(&text);
    let mut last_text = text;
    let mut continuations = 0;

    let Some(target) = request.target else {
        return Ok(Generated {
            entries,
            continuations,
        });
    };

    while continuations < request.max_rounds {
        let reached = match last_numbered_index(&entries) {
            Some(reached) if reached < target => reached,
            _ => break,
        };

        continuations += 1;
        info!(
            "Output reached item {} of {}; requesting continuation {}",
            reached, target, continuations
        );

        conversation.push(ChatMessage::assistant(last_text));
        conversation.push(ChatMessage::user(format!(
            "Continue from item {} through item {} in the same format. Do not repeat earlier items.",
            reached + 1,
            target
        )));

        let text = complete_with_retry(
            port,
            &conversation,
            request.config,
            request.retry,
            request.cancel,
        )
        .await?;
        if !is_active() {
            return Err(NodeFailure::Stale);
        }

        let more = parse_entries(&text);
        let progressed = last_numbered_index(&more).map_or(false, |next| next > reached);
        entries.extend(more);
        last_text = text;

        if !progressed {
            debug!("Continuation made no progress past item {}", reached);
            break;
        }
    }

    Ok(Generated {
        entries,
        continuations,
    })
}

/// Index of the last numbered item among the entries.
///
/// Titles are read first; untitled entries are scanned line by line.
pub fn last_numbered_index(entries: &[OutputEntry]) -> Option<u32> {
    entries
        .iter()
        .filter_map(|entry| {
            leading_index(&entry.title)
                .or_else(|| entry.content.lines().filter_map(leading_index).last())
        })
        .last()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::scripted::ScriptedGenerator;

    fn chapters(from: u32, to: u32) -> String {
        let items: Vec<serde_json::Value> = (from..=to)
            .map(|i| serde_json::json!({"title": format!("Chapter {}", i), "content": "beat"}))
            .collect();
        serde_json::Value::Array(items).to_string()
    }

    async fn retry(generator: &ScriptedGenerator) -> Result<String, GenerationError> {
        complete_with_retry(
            generator,
            &[ChatMessage::user("go")],
            &ModelConfig::default(),
            &RetryPolicy::immediate(),
            &CancellationToken::new(),
        )
        .await
    }

    async fn generate(
        generator: &ScriptedGenerator,
        target: Option<u32>,
        active: bool,
    ) -> Result<Generated, NodeFailure> {
        let config = ModelConfig::default();
        let retry = RetryPolicy::immediate();
        let cancel = CancellationToken::new();
        generate_entries(
            generator,
            vec![ChatMessage::user("Generate 30 chapters")],
            GenerationRequest {
                config: &config,
                retry: &retry,
                cancel: &cancel,
                target,
                max_rounds: 5,
            },
            || active,
        )
        .await
    }

    #[tokio::test]
    async fn test_retry_after_transport_error() {
        let generator = ScriptedGenerator::new();
        generator.push_error(GenerationError::Transport("reset".into()));
        generator.push_text("ok");

        assert_eq!(retry(&generator).await.unwrap(), "ok");
        assert_eq!(generator.request_count(), 2);
    }

    #[tokio::test]
    async fn test_empty_response_is_retried() {
        let generator = ScriptedGenerator::with_texts(["  ", "filled"]);
        assert_eq!(retry(&generator).await.unwrap(), "filled");
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let generator = ScriptedGenerator::new();
        for _ in 0..4 {
            generator.push_error(GenerationError::Transport("down".into()));
        }

        let result = retry(&generator).await;
        assert!(matches!(result, Err(GenerationError::Transport(_))));
        assert_eq!(generator.request_count(), 3);
    }

    #[tokio::test]
    async fn test_abort_is_not_retried() {
        let generator = ScriptedGenerator::new();
        generator.push_error(GenerationError::Aborted);
        generator.push_text("never");

        assert_eq!(retry(&generator).await, Err(GenerationError::Aborted));
        assert_eq!(generator.request_count(), 1);
    }

    #[tokio::test]
    async fn test_configuration_error_is_not_retried() {
        let generator = ScriptedGenerator::new();
        generator.push_error(GenerationError::Configuration("no key".into()));

        assert!(retry(&generator).await.is_err());
        assert_eq!(generator.request_count(), 1);
    }

    #[tokio::test]
    async fn test_continuation_until_target() {
        let generator =
            ScriptedGenerator::with_texts([chapters(1, 12), chapters(13, 24), chapters(25, 30)]);

        let generated = generate(&generator, Some(30), true).await.unwrap();

        assert_eq!(generated.entries.len(), 30);
        assert_eq!(generated.continuations, 2);
        assert_eq!(last_numbered_index(&generated.entries), Some(30));

        let requests = generator.requests();
        assert_eq!(requests.len(), 3);
        let second = &requests[1].messages;
        assert_eq!(second.len(), 3);
        assert_eq!(second[1], ChatMessage::assistant(chapters(1, 12)));
        assert!(second[2].content.contains("from item 13 through item 30"));
        assert!(requests[2].last_content().contains("from item 25"));
    }

    #[tokio::test]
    async fn test_continuation_capped_at_max_rounds() {
        let generator = ScriptedGenerator::new();
        for i in 1..=10 {
            generator.push_text(chapters(i, i));
        }

        let generated = generate(&generator, Some(30), true).await.unwrap();

        assert_eq!(generated.continuations, 5);
        assert_eq!(generated.entries.len(), 6);
        assert_eq!(generator.request_count(), 6);
    }

    #[tokio::test]
    async fn test_no_continuation_without_target() {
        let generator = ScriptedGenerator::with_texts([chapters(1, 3), chapters(4, 6)]);

        let generated = generate(&generator, None, true).await.unwrap();
        assert_eq!(generated.entries.len(), 3);
        assert_eq!(generator.request_count(), 1);
    }

    #[tokio::test]
    async fn test_stops_when_no_progress() {
        let generator = ScriptedGenerator::with_texts([chapters(1, 5), chapters(3, 5)]);

        let generated = generate(&generator, Some(10), true).await.unwrap();
        assert_eq!(generated.continuations, 1);
        assert_eq!(generator.request_count(), 2);
    }

    #[tokio::test]
    async fn test_inactive_run_discards_result() {
        let generator = ScriptedGenerator::with_texts([chapters(1, 3)]);
        let result = generate(&generator, None, false).await;
        assert_eq!(result.unwrap_err(), NodeFailure::Stale);
    }

    #[test]
    fn test_last_numbered_index_reads_content_lines() {
        let entries = vec![
            OutputEntry::new("", "1. Arrival\n2. Storm\n3. Flight"),
            OutputEntry::new("Notes", "no numbers"),
        ];
        assert_eq!(last_numbered_index(&entries), Some(3));
        assert_eq!(last_numbered_index(&[]), None);
    }
}
