//! Worldbook: a resumable LLM chunk pipeline
//!
//! Turns a long text into a structured worldbook (categorized named entries
//! with keywords and content) by driving each chunk through a completion
//! backend and folding the results together.
//!
//! # Core Concepts
//!
//! - **Work items**: ordered text chunks with a lifecycle status
//! - **Scheduler**: sequential or bounded-parallel dispatch with pause/resume
//! - **Accumulator**: the running worldbook, with per-merge history and rollback
//! - **State store**: durable run state so an interrupted run resumes where it stopped
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use worldbook::{
//!     OpenStore, PipelineConfig, PipelineContext, Scheduler, ScriptedClient, SqliteStateStore,
//!     WorkItem,
//! };
//!
//! # tokio_test::block_on(async {
//! let store = Arc::new(SqliteStateStore::open_in_memory().unwrap());
//! let client = Arc::new(ScriptedClient::new().with_fallback(
//!     r#"{"Characters": {"Alice": {"keywords": ["Alice"], "content": "A knight."}}}"#,
//! ));
//! let config = PipelineConfig::default();
//!
//! let mut ctx = PipelineContext::new(
//!     vec![WorkItem::new("chunk1", "Alice rode north.")],
//!     "fingerprint",
//!     store.clone(),
//!     config.history.clone(),
//! );
//! let mut scheduler = Scheduler::new(client, store, config);
//! let summary = scheduler.run(&mut ctx).await.unwrap();
//!
//! assert_eq!(summary.succeeded, 1);
//! assert!(ctx.worldbook().get("Characters", "Alice").is_some());
//! # });
//! ```

pub mod completion;
pub mod config;
pub mod pipeline;
pub mod splitter;
pub mod storage;
pub mod worldbook;

pub use completion::{CommandClient, CompletionClient, CompletionError, ScriptedClient};
pub use config::{ConfigError, PipelineConfig, PromptConfig, RetryPolicy};
pub use pipeline::{
    DispatchMode, ItemStatus, PersistedRunState, PipelineContext, PipelineError, PipelineEvent,
    RunState, RunSummary, Scheduler, WorkItem,
};
pub use storage::{OpenStore, SqliteStateStore, StateStore, StorageError, StorageResult};
pub use worldbook::{Accumulator, Entry, HistoryPolicy, HistoryRecord, MergeMode, Worldbook};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
