//! Pipeline configuration
//!
//! Every field has a default, so a YAML file only needs the keys it changes:
//!
//! ```yaml
//! concurrency: 5
//! mode: batched
//! batch_size: 4
//! retry:
//!   max_attempts: 5
//! history:
//!   squash_duplicate_titles: false
//! ```

use crate::pipeline::DispatchMode;
use crate::worldbook::{HistoryPolicy, MergeMode};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Errors loading or validating configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Retry and backoff for transient completion failures
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts per item, including the first
    pub max_attempts: u32,
    /// Delay before the first retry; doubles each attempt
    pub base_delay_ms: u64,
    /// Upper bound on any single delay
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based): base · 2^(retry-1), capped.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(32);
        let ms = self.base_delay_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(ms.min(self.max_delay_ms))
    }
}

/// What goes into each prompt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptConfig {
    /// Global extraction instructions placed first in every prompt
    pub instructions: String,
    /// Include a summary of the preceding item's accepted result
    pub include_previous_context: bool,
    /// Per-entry content budget in the previous-result summary (chars)
    pub summary_chars_per_entry: usize,
    /// Cap on entries listed in the previous-result summary
    pub max_summary_entries: usize,
    /// Tell the model which chapter/ordinal the chunk is
    pub force_chapter_marker: bool,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            instructions: "Read the text below and extract worldbook entries: characters, \
                           locations, organizations, items and notable events. Use only \
                           information stated in the text."
                .to_string(),
            include_previous_context: true,
            summary_chars_per_entry: 120,
            max_summary_entries: 40,
            force_chapter_marker: false,
        }
    }
}

/// Top-level pipeline configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Maximum concurrent completion calls
    pub concurrency: usize,
    pub mode: DispatchMode,
    /// Window size for `DispatchMode::Batched`
    pub batch_size: usize,
    /// Upper bound on one completion call
    pub request_timeout_secs: u64,
    /// Items shorter than this are failed instead of split on overflow
    pub min_split_chars: usize,
    pub merge_mode: MergeMode,
    pub retry: RetryPolicy,
    pub prompt: PromptConfig,
    pub history: HistoryPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            concurrency: 3,
            mode: DispatchMode::Sequential,
            batch_size: 5,
            request_timeout_secs: 120,
            min_split_chars: crate::pipeline::MIN_SPLIT_CHARS,
            merge_mode: MergeMode::Incremental,
            retry: RetryPolicy::default(),
            prompt: PromptConfig::default(),
            history: HistoryPolicy::default(),
        }
    }
}

impl PipelineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and validate YAML.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::Invalid("concurrency must be at least 1".into()));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid("batch_size must be at least 1".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_attempts must be at least 1".into()));
        }
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid("request_timeout_secs must be positive".into()));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn with_mode(mut self, mode: DispatchMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }
}
