//! Run state machine and progress notifications

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Scheduler lifecycle.
///
/// `Idle → Running → {Paused, Completed, Failed}`; `Paused → Running` on
/// resume, `Paused → Idle` on abandon.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    #[default]
    Idle,
    Running,
    Paused,
    Completed,
    /// Stopped by a store error or broken invariant
    Failed,
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Progress notification sent by the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    StateChanged {
        state: RunState,
    },
    ItemStarted {
        index: usize,
        title: String,
    },
    ItemCompleted {
        index: usize,
        title: String,
        /// Entries the merge changed
        changes: usize,
    },
    ItemFailed {
        index: usize,
        title: String,
        reason: String,
    },
    /// The item at `index` was replaced by `<title>-1` and `<title>-2`
    ItemSplit {
        index: usize,
        title: String,
    },
    Progress {
        done: usize,
        total: usize,
    },
    /// Run state written; `cursor` is the first item not done
    Persisted {
        cursor: usize,
    },
}

pub type EventSender = mpsc::UnboundedSender<PipelineEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<PipelineEvent>;

/// Create a progress channel for [`Scheduler::with_events`](super::Scheduler::with_events).
pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}
