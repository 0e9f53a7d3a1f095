//! Completion service client — the generative-text backend the pipeline drives
//!
//! Defines the client trait and the error taxonomy the item processor relies on.
//! Two implementations:
//! - `CommandClient`: spawns a configured command, prompt on stdin, text on stdout (production)
//! - `ScriptedClient`: returns preconfigured responses (testing)
//!
//! Providers rarely expose a typed error taxonomy, so failures are classified
//! from their message text by `classify_error_text`. Swap that one function to
//! support a provider with different wording.

use async_trait::async_trait;
use dashmap::DashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Errors from completion calls.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompletionError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("input exceeds provider capacity: {0}")]
    Overflow(String),
    #[error("provider error: {0}")]
    Provider(String),
    #[error("network error: {0}")]
    Network(String),
}

impl CompletionError {
    /// Classify a raw provider message into an error variant.
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        match classify_error_text(&message) {
            ErrorClass::RateLimited => Self::RateLimited(message),
            ErrorClass::Timeout => Self::Timeout(Duration::ZERO),
            ErrorClass::Overflow => Self::Overflow(message),
            ErrorClass::Network => Self::Network(message),
            ErrorClass::Provider => Self::Provider(message),
        }
    }

    /// Worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::RateLimited(_) | Self::Network(_)
        )
    }

    pub fn is_overflow(&self) -> bool {
        matches!(self, Self::Overflow(_))
    }
}

/// Coarse class of a provider failure message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    RateLimited,
    Timeout,
    Overflow,
    Network,
    Provider,
}

const RATE_LIMIT_PATTERNS: &[&str] = &[
    "rate limit",
    "rate_limit",
    "too many requests",
    "429",
    "quota",
    "resource_exhausted",
];

const TIMEOUT_PATTERNS: &[&str] = &["timed out", "timeout", "deadline"];

const OVERFLOW_PATTERNS: &[&str] = &[
    "too long",
    "too large",
    "token limit",
    "context length",
    "context_length",
    "maximum context",
    "max_tokens",
    "exceeded",
    "exceeds",
    "413",
];

const NETWORK_PATTERNS: &[&str] = &[
    "network",
    "connection",
    "econnreset",
    "econnrefused",
    "socket",
    "dns",
    "502",
    "503",
    "504",
    "overloaded",
    "unavailable",
];

/// Map a provider error message onto an [`ErrorClass`].
///
/// Order matters: "rate limit exceeded" is a rate limit, not an overflow.
pub fn classify_error_text(message: &str) -> ErrorClass {
    let lower = message.to_lowercase();
    let hit = |patterns: &[&str]| patterns.iter().any(|p| lower.contains(p));

    if hit(RATE_LIMIT_PATTERNS) {
        ErrorClass::RateLimited
    } else if hit(TIMEOUT_PATTERNS) {
        ErrorClass::Timeout
    } else if hit(OVERFLOW_PATTERNS) {
        ErrorClass::Overflow
    } else if hit(NETWORK_PATTERNS) {
        ErrorClass::Network
    } else {
        ErrorClass::Provider
    }
}

/// Client trait for the completion backend.
///
/// Abstracts over transport (subprocess, HTTP, scripted) so the pipeline
/// doesn't depend on how the provider is reached.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    /// Submit a prompt and return the generated text.
    async fn complete(&self, prompt: &str) -> Result<String, CompletionError>;
}

/// Race a completion call against a timer. Whichever settles first wins.
pub async fn complete_with_timeout(
    client: &dyn CompletionClient,
    prompt: &str,
    timeout: Duration,
) -> Result<String, CompletionError> {
    match tokio::time::timeout(timeout, client.complete(prompt)).await {
        Ok(result) => result,
        Err(_) => Err(CompletionError::Timeout(timeout)),
    }
}

/// Production client: runs a command per prompt.
///
/// The prompt is written to the child's stdin; stdout is the completion.
/// A non-zero exit is classified from stderr.
#[derive(Debug, Clone)]
pub struct CommandClient {
    program: String,
    args: Vec<String>,
}

impl CommandClient {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Parse a whitespace-separated command line such as `llm -m gpt-4o`.
    pub fn from_command_line(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self::new(program, parts.collect()))
    }
}

#[async_trait]
impl CompletionClient for CommandClient {
    async fn complete(&self, prompt: &str) -> Result<String, CompletionError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CompletionError::Provider(format!("spawn {}: {}", self.program, e)))?;

        // Feed stdin from its own task so a chatty child can't deadlock us on a full pipe.
        let writer = child.stdin.take().map(|mut stdin| {
            let prompt = prompt.to_string();
            tokio::spawn(async move { stdin.write_all(prompt.as_bytes()).await })
        });

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| CompletionError::Network(format!("wait: {}", e)))?;

        if let Some(writer) = writer {
            if let Ok(Err(e)) = writer.await {
                tracing::debug!(program = %self.program, error = %e, "prompt write did not complete");
            }
        }

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let message = if stderr.trim().is_empty() {
                format!("{} exited with {}", self.program, output.status)
            } else {
                stderr.trim().to_string()
            };
            Err(CompletionError::from_message(message))
        }
    }
}

/// One scripted reply.
#[derive(Debug, Clone)]
enum Reply {
    Text(String),
    Fail(CompletionError),
}

/// A rule matching prompts that contain `needle`, replaying `replies` in order.
/// The last reply repeats once the script runs out.
#[derive(Debug)]
struct Rule {
    needle: String,
    replies: Vec<Reply>,
}

/// Scripted client for testing — returns preconfigured responses.
///
/// Rules match on a substring of the prompt (usually a unique token in the
/// chunk content). The first matching rule wins. Unmatched prompts get the
/// fallback reply, or a provider error when none is set.
pub struct ScriptedClient {
    rules: Vec<Rule>,
    fallback: Option<Reply>,
    delay: Duration,
    hits: DashMap<String, usize>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl Default for ScriptedClient {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedClient {
    pub fn new() -> Self {
        Self {
            rules: Vec::new(),
            fallback: None,
            delay: Duration::ZERO,
            hits: DashMap::new(),
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Reply with `text` to prompts containing `needle`.
    pub fn with_response(self, needle: impl Into<String>, text: impl Into<String>) -> Self {
        self.with_replies(needle, vec![Ok(text.into())])
    }

    /// Fail prompts containing `needle` with `error`.
    pub fn with_failure(self, needle: impl Into<String>, error: CompletionError) -> Self {
        self.with_replies(needle, vec![Err(error)])
    }

    /// Replay a sequence of outcomes for prompts containing `needle`.
    pub fn with_replies(
        mut self,
        needle: impl Into<String>,
        replies: Vec<Result<String, CompletionError>>,
    ) -> Self {
        let replies = replies
            .into_iter()
            .map(|r| match r {
                Ok(text) => Reply::Text(text),
                Err(e) => Reply::Fail(e),
            })
            .collect();
        self.rules.push(Rule {
            needle: needle.into(),
            replies,
        });
        self
    }

    /// Reply with `text` to every prompt no rule matches.
    pub fn with_fallback(mut self, text: impl Into<String>) -> Self {
        self.fallback = Some(Reply::Text(text.into()));
        self
    }

    /// Sleep before answering, to hold calls in flight.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Total number of calls made.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Number of calls whose prompt matched `needle`'s rule.
    pub fn calls_for(&self, needle: &str) -> usize {
        self.hits.get(needle).map(|c| *c).unwrap_or(0)
    }

    /// Highest number of calls observed in flight at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Every prompt received, in arrival order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    fn next_reply(&self, prompt: &str) -> Reply {
        for rule in &self.rules {
            if prompt.contains(&rule.needle) {
                let mut count = self.hits.entry(rule.needle.clone()).or_insert(0);
                let idx = (*count).min(rule.replies.len().saturating_sub(1));
                *count += 1;
                return rule.replies.get(idx).cloned().unwrap_or_else(|| {
                    Reply::Fail(CompletionError::Provider(format!(
                        "empty script for '{}'",
                        rule.needle
                    )))
                });
            }
        }
        self.fallback.clone().unwrap_or_else(|| {
            Reply::Fail(CompletionError::Provider(
                "no scripted response for prompt".to_string(),
            ))
        })
    }
}

#[async_trait]
impl CompletionClient for ScriptedClient {
    async fn complete(&self, prompt: &str) -> Result<String, CompletionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(prompt.to_string());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let reply = self.next_reply(prompt);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        match reply {
            Reply::Text(text) => Ok(text),
            Reply::Fail(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_overflow_messages() {
        for msg in [
            "This model's maximum context length is 128000 tokens",
            "Request too long",
            "input token limit exceeded",
            "HTTP 413 payload too large",
        ] {
            assert_eq!(classify_error_text(msg), ErrorClass::Overflow, "{}", msg);
        }
    }

    #[test]
    fn rate_limit_wins_over_exceeded() {
        assert_eq!(
            classify_error_text("Rate limit exceeded, retry later"),
            ErrorClass::RateLimited
        );
        assert_eq!(classify_error_text("quota exceeded"), ErrorClass::RateLimited);
    }

    #[test]
    fn classifies_network_and_provider() {
        assert_eq!(classify_error_text("connection reset by peer"), ErrorClass::Network);
        assert_eq!(classify_error_text("503 Service Unavailable"), ErrorClass::Network);
        assert_eq!(classify_error_text("request timed out"), ErrorClass::Timeout);
        assert_eq!(classify_error_text("invalid api key"), ErrorClass::Provider);
    }

    #[test]
    fn transient_excludes_overflow_and_provider() {
        assert!(CompletionError::Network("x".into()).is_transient());
        assert!(CompletionError::RateLimited("x".into()).is_transient());
        assert!(CompletionError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(!CompletionError::Overflow("x".into()).is_transient());
        assert!(!CompletionError::Provider("x".into()).is_transient());
        assert!(CompletionError::from_message("context length exceeded").is_overflow());
    }

    #[tokio::test]
    async fn scripted_client_replays_in_order() {
        let client = ScriptedClient::new().with_replies(
            "chunk-b",
            vec![
                Err(CompletionError::Network("reset".into())),
                Ok("second".into()),
            ],
        );

        let first = client.complete("prompt chunk-b").await;
        assert!(matches!(first, Err(CompletionError::Network(_))));
        assert_eq!(client.complete("prompt chunk-b").await.unwrap(), "second");
        // last reply repeats
        assert_eq!(client.complete("prompt chunk-b").await.unwrap(), "second");
        assert_eq!(client.calls_for("chunk-b"), 3);
        assert_eq!(client.calls(), 3);
    }

    #[tokio::test]
    async fn scripted_client_without_match_fails() {
        let client = ScriptedClient::new();
        let err = client.complete("anything").await.unwrap_err();
        assert!(matches!(err, CompletionError::Provider(_)));

        let client = ScriptedClient::new().with_fallback("{}");
        assert_eq!(client.complete("anything").await.unwrap(), "{}");
    }

    #[tokio::test]
    async fn timeout_wins_over_slow_call() {
        tokio::time::pause();
        let client = ScriptedClient::new()
            .with_fallback("late")
            .with_delay(Duration::from_secs(10));

        let err = complete_with_timeout(&client, "p", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err, CompletionError::Timeout(Duration::from_secs(1)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_client_echoes_stdin() {
        let client = CommandClient::from_command_line("cat").unwrap();
        let text = client.complete("hello").await.unwrap();
        assert_eq!(text, "hello");
    }
}
