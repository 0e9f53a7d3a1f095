//! The chunk processing pipeline
//!
//! Work items flow from an ordered queue through the [`Scheduler`], which
//! admits completion calls through a [`ConcurrencyGate`], hands each item to
//! the [`ItemProcessor`], and folds results into the context's accumulator.
//! Run state is persisted so a paused or interrupted run can resume.

mod cancel;
mod context;
mod error;
mod events;
mod gate;
mod item;
mod processor;
mod prompt;
mod scheduler;

pub use cancel::CancellationToken;
pub use context::{first_not_done, fingerprint, PersistedRunState, PipelineContext, QueueCounts};
pub use error::{PipelineError, PipelineResult};
pub use events::{event_channel, EventReceiver, EventSender, PipelineEvent, RunState};
pub use gate::{ConcurrencyGate, GateError, GatePermit};
pub use item::{split_item, split_point, ItemStatus, SplitError, WorkItem, MIN_SPLIT_CHARS};
pub use processor::{ItemError, ItemProcessor, ItemRequest};
pub use prompt::{PromptBuilder, PromptInput};
pub use scheduler::{DispatchMode, PauseHandle, RepairSummary, RunSummary, Scheduler};
