//! Item processor: one work item from prompt to parsed result
//!
//! Each attempt takes a gate slot, calls the completion backend under a
//! timeout, and releases the slot before any backoff sleep so waiting items
//! don't hold capacity. Outcomes map onto [`ItemError`]:
//!
//! | Completion outcome          | Result                              |
//! |-----------------------------|-------------------------------------|
//! | text that parses            | `Ok(worldbook)`, saved as a roll    |
//! | text that doesn't parse     | `Permanent`                         |
//! | overflow                    | `Overflow` (caller splits the item) |
//! | timeout/rate limit/network  | retry with backoff, then `Permanent`|
//! | provider error              | `Permanent`                         |
//! | gate aborted / cancelled    | `Aborted`                           |

use super::cancel::CancellationToken;
use super::gate::ConcurrencyGate;
use super::prompt::{PromptBuilder, PromptInput};
use crate::completion::{complete_with_timeout, CompletionClient};
use crate::config::{PipelineConfig, RetryPolicy};
use crate::storage::{StateStore, StorageError};
use crate::worldbook::{parse_response, Worldbook};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// How processing one item ended, when it didn't produce a result.
#[derive(Debug, Error)]
pub enum ItemError {
    /// The run was paused. Not a failure.
    #[error("aborted")]
    Aborted,

    /// The prompt was too large for the provider
    #[error("overflow: {0}")]
    Overflow(String),

    /// Unrecoverable for this item
    #[error("{0}")]
    Permanent(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Everything needed to process one item, owned so it can move into a task.
#[derive(Debug, Clone)]
pub struct ItemRequest {
    pub index: usize,
    pub total: usize,
    pub title: String,
    pub content: String,
    /// Accepted result of the nearest preceding done item
    pub previous: Option<Worldbook>,
}

impl ItemRequest {
    fn prompt_input(&self) -> PromptInput<'_> {
        PromptInput {
            index: self.index,
            total: self.total,
            title: &self.title,
            content: &self.content,
            previous: self.previous.as_ref(),
        }
    }
}

/// Drives single items through the completion backend.
pub struct ItemProcessor {
    client: Arc<dyn CompletionClient>,
    gate: ConcurrencyGate,
    store: Arc<dyn StateStore>,
    prompts: PromptBuilder,
    retry: RetryPolicy,
    timeout: Duration,
}

impl ItemProcessor {
    pub fn new(
        client: Arc<dyn CompletionClient>,
        gate: ConcurrencyGate,
        store: Arc<dyn StateStore>,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            client,
            gate,
            store,
            prompts: PromptBuilder::new(config.prompt.clone()),
            retry: config.retry.clone(),
            timeout: config.request_timeout(),
        }
    }

    /// Process one item.
    pub async fn process(
        &self,
        request: &ItemRequest,
        cancel: &CancellationToken,
    ) -> Result<Worldbook, ItemError> {
        let prompt = self.prompts.build(&request.prompt_input());
        let index = request.index;
        let title = request.title.as_str();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            if cancel.is_cancelled() {
                return Err(ItemError::Aborted);
            }

            let outcome = {
                let _permit = self.gate.acquire().await.map_err(|_| ItemError::Aborted)?;
                tracing::debug!(index, title, attempt, "calling completion backend");
                complete_with_timeout(self.client.as_ref(), &prompt, self.timeout).await
            };

            let error = match outcome {
                Ok(text) => {
                    return match parse_response(&text) {
                        Ok(result) => {
                            self.store.save_roll_result(index, &result)?;
                            tracing::debug!(index, title, entries = result.entry_count(), "item parsed");
                            Ok(result)
                        }
                        Err(e) => {
                            tracing::warn!(index, title, error = %e, "response could not be parsed");
                            Err(ItemError::Permanent(format!("parse failure: {}", e)))
                        }
                    };
                }
                Err(e) => e,
            };

            if error.is_overflow() {
                tracing::info!(index, title, error = %error, "input overflow");
                return Err(ItemError::Overflow(error.to_string()));
            }

            if !error.is_transient() {
                tracing::warn!(index, title, error = %error, "permanent completion failure");
                return Err(ItemError::Permanent(error.to_string()));
            }

            if attempt >= self.retry.max_attempts {
                tracing::warn!(index, title, attempt, error = %error, "retries exhausted");
                return Err(ItemError::Permanent(format!(
                    "{} (gave up after {} attempts)",
                    error, attempt
                )));
            }

            let delay = self.retry.delay_for(attempt);
            tracing::info!(
                index,
                title,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "transient failure, backing off"
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return Err(ItemError::Aborted),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::{CompletionError, ScriptedClient};
    use crate::storage::{OpenStore, SqliteStateStore};

    const ALICE: &str = r#"{"Characters": {"Alice": {"keywords": ["Alice"], "content": "A knight."}}}"#;

    struct Harness {
        client: Arc<ScriptedClient>,
        store: Arc<SqliteStateStore>,
        gate: ConcurrencyGate,
        processor: ItemProcessor,
    }

    fn harness(client: ScriptedClient, config: PipelineConfig) -> Harness {
        let client = Arc::new(client);
        let store = Arc::new(SqliteStateStore::open_in_memory().unwrap());
        let gate = ConcurrencyGate::new(config.concurrency);
        let processor = ItemProcessor::new(client.clone(), gate.clone(), store.clone(), &config);
        Harness {
            client,
            store,
            gate,
            processor,
        }
    }

    fn fast_retry(max_attempts: u32) -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.retry = RetryPolicy {
            max_attempts,
            base_delay_ms: 10,
            max_delay_ms: 40,
        };
        config
    }

    fn request(content: &str) -> ItemRequest {
        ItemRequest {
            index: 0,
            total: 1,
            title: "chunk1".to_string(),
            content: content.to_string(),
            previous: None,
        }
    }

    #[tokio::test]
    async fn success_records_roll_result() {
        let h = harness(
            ScriptedClient::new().with_response("alpha", ALICE),
            PipelineConfig::default(),
        );
        let result = h
            .processor
            .process(&request("alpha"), &CancellationToken::new())
            .await
            .unwrap();

        assert!(result.get("Characters", "Alice").is_some());
        let rolls = h.store.list_roll_results(0).unwrap();
        assert_eq!(rolls.len(), 1);
        assert_eq!(rolls[0].result, result);
    }

    #[tokio::test]
    async fn transient_failure_is_retried() {
        tokio::time::pause();
        let h = harness(
            ScriptedClient::new().with_replies(
                "alpha",
                vec![
                    Err(CompletionError::RateLimited("429".into())),
                    Err(CompletionError::Network("reset".into())),
                    Ok(ALICE.to_string()),
                ],
            ),
            fast_retry(3),
        );
        let result = h
            .processor
            .process(&request("alpha"), &CancellationToken::new())
            .await;
        assert!(result.is_ok());
        assert_eq!(h.client.calls(), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_are_permanent() {
        tokio::time::pause();
        let h = harness(
            ScriptedClient::new().with_failure("alpha", CompletionError::Network("down".into())),
            fast_retry(3),
        );
        let err = h
            .processor
            .process(&request("alpha"), &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            ItemError::Permanent(reason) => assert!(reason.contains("3 attempts"), "{}", reason),
            other => panic!("expected Permanent, got {:?}", other),
        }
        assert_eq!(h.client.calls(), 3);
    }

    #[tokio::test]
    async fn overflow_is_not_retried() {
        let h = harness(
            ScriptedClient::new().with_failure(
                "alpha",
                CompletionError::Overflow("context length exceeded".into()),
            ),
            fast_retry(5),
        );
        let err = h
            .processor
            .process(&request("alpha"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ItemError::Overflow(_)));
        assert_eq!(h.client.calls(), 1);
    }

    #[tokio::test]
    async fn parse_failure_is_permanent_without_retry() {
        let h = harness(
            ScriptedClient::new().with_response("alpha", "I cannot help with that."),
            fast_retry(5),
        );
        let err = h
            .processor
            .process(&request("alpha"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ItemError::Permanent(ref r) if r.starts_with("parse failure")));
        assert_eq!(h.client.calls(), 1);
        assert!(h.store.list_roll_results(0).unwrap().is_empty());
    }

    #[tokio::test]
    async fn provider_error_is_permanent() {
        let h = harness(
            ScriptedClient::new()
                .with_failure("alpha", CompletionError::Provider("invalid api key".into())),
            fast_retry(5),
        );
        let err = h
            .processor
            .process(&request("alpha"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ItemError::Permanent(_)));
        assert_eq!(h.client.calls(), 1);
    }

    #[tokio::test]
    async fn slow_call_times_out_as_transient() {
        tokio::time::pause();
        let mut config = fast_retry(2);
        config.request_timeout_secs = 1;
        let h = harness(
            ScriptedClient::new()
                .with_response("alpha", ALICE)
                .with_delay(Duration::from_secs(30)),
            config,
        );
        let err = h
            .processor
            .process(&request("alpha"), &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            ItemError::Permanent(reason) => assert!(reason.contains("timed out"), "{}", reason),
            other => panic!("expected Permanent, got {:?}", other),
        }
        assert_eq!(h.client.calls(), 2);
    }

    #[tokio::test]
    async fn cancelled_token_aborts_before_calling() {
        let h = harness(ScriptedClient::new().with_fallback(ALICE), PipelineConfig::default());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = h.processor.process(&request("alpha"), &cancel).await.unwrap_err();
        assert!(matches!(err, ItemError::Aborted));
        assert_eq!(h.client.calls(), 0);
    }

    #[tokio::test]
    async fn cancel_during_backoff_aborts() {
        let mut config = PipelineConfig::default();
        config.retry.base_delay_ms = 60_000;
        config.retry.max_delay_ms = 60_000;
        let h = harness(
            ScriptedClient::new().with_failure("alpha", CompletionError::Network("down".into())),
            config,
        );
        let processor = Arc::new(h.processor);
        let cancel = CancellationToken::new();

        let task = {
            let processor = processor.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { processor.process(&request("alpha"), &cancel).await })
        };
        while h.client.calls() == 0 {
            tokio::task::yield_now().await;
        }
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("backoff should be interrupted")
            .unwrap();
        assert!(matches!(result, Err(ItemError::Aborted)));
        assert_eq!(h.client.calls(), 1);
    }

    #[tokio::test]
    async fn aborted_gate_surfaces_as_aborted() {
        let h = harness(ScriptedClient::new().with_fallback(ALICE), PipelineConfig::default());
        h.gate.abort();
        let err = h
            .processor
            .process(&request("alpha"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ItemError::Aborted));
    }

    #[tokio::test]
    async fn prompt_carries_previous_context() {
        let h = harness(ScriptedClient::new().with_fallback(ALICE), PipelineConfig::default());
        let previous = parse_response(ALICE).unwrap();
        let mut req = request("beta");
        req.previous = Some(previous);
        h.processor.process(&req, &CancellationToken::new()).await.unwrap();
        let prompts = h.client.prompts();
        assert!(prompts[0].contains("[Characters] Alice"));
        assert!(prompts[0].ends_with("beta"));
    }
}
