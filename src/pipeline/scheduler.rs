//! Pipeline scheduler
//!
//! Dispatches work items through the item processor in one of three modes:
//!
//! - **Sequential**: strict queue order; each prompt sees the preceding
//!   item's accepted result.
//! - **Independent**: every not-done item at once, bounded by the gate. Items
//!   only see results that were done when they were dispatched. Items that
//!   overflowed are split after the wave and their halves run sequentially.
//! - **Batched**: independent mode over fixed-size windows, so each window
//!   sees the previous one's results. Run state is persisted at window
//!   boundaries instead of after every item.
//!
//! Item tasks never touch the queue or the accumulator. Their outcomes come
//! back through the join loop, which is the only place merges happen.

use super::cancel::CancellationToken;
use super::context::PipelineContext;
use super::error::{PipelineError, PipelineResult};
use super::events::{EventSender, PipelineEvent, RunState};
use super::gate::ConcurrencyGate;
use super::item::ItemStatus;
use super::processor::{ItemError, ItemProcessor, ItemRequest};
use crate::completion::CompletionClient;
use crate::config::PipelineConfig;
use crate::storage::StateStore;
use crate::worldbook::{EntryChange, Worldbook};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::task::JoinSet;

/// How items are dispatched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    #[default]
    Sequential,
    Independent,
    Batched,
}

/// Outcome counts for one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub succeeded: usize,
    pub failed: usize,
    /// Items replaced by two halves after an overflow
    pub split: usize,
    /// The run stopped on a pause rather than running out of work
    pub paused: bool,
}

/// Outcome counts for a repair pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RepairSummary {
    pub succeeded: usize,
    pub still_failed: usize,
    pub split: usize,
}

/// Pauses a running scheduler from another task.
///
/// No new items are dispatched and queued gate waiters are released. Calls
/// already in flight finish and their results are still merged.
#[derive(Debug, Clone)]
pub struct PauseHandle {
    cancel: CancellationToken,
    gate: ConcurrencyGate,
}

impl PauseHandle {
    pub fn pause(&self) {
        tracing::info!("pause requested");
        self.cancel.cancel();
        self.gate.abort();
    }

    pub fn is_paused(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

enum Settled {
    Done,
    Failed,
    Split,
    Aborted,
}

/// Owns the run state machine and drives a [`PipelineContext`] through it.
pub struct Scheduler {
    processor: Arc<ItemProcessor>,
    gate: ConcurrencyGate,
    config: PipelineConfig,
    cancel: CancellationToken,
    state: RunState,
    events: Option<EventSender>,
}

impl Scheduler {
    pub fn new(
        client: Arc<dyn CompletionClient>,
        store: Arc<dyn StateStore>,
        config: PipelineConfig,
    ) -> Self {
        let gate = ConcurrencyGate::new(config.concurrency);
        let processor = Arc::new(ItemProcessor::new(client, gate.clone(), store, &config));
        Self {
            processor,
            gate,
            config,
            cancel: CancellationToken::new(),
            state: RunState::Idle,
            events: None,
        }
    }

    /// Send progress notifications to `events`.
    pub fn with_events(mut self, events: EventSender) -> Self {
        self.events = Some(events);
        self
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn pause_handle(&self) -> PauseHandle {
        PauseHandle {
            cancel: self.cancel.clone(),
            gate: self.gate.clone(),
        }
    }

    /// Process every item not yet done, starting from the first one.
    pub async fn run(&mut self, ctx: &mut PipelineContext) -> PipelineResult<RunSummary> {
        self.ensure_not_running("run")?;
        self.begin();
        tracing::info!(
            mode = ?self.config.mode,
            items = ctx.items().len(),
            cursor = ctx.cursor(),
            concurrency = self.config.concurrency,
            "run started"
        );

        let mut summary = RunSummary::default();
        let outcome = match self.config.mode {
            DispatchMode::Sequential => {
                let end = ctx.items().len();
                self.process_span(ctx, 0, end, &mut summary).await.map(|_| ())
            }
            DispatchMode::Independent => {
                let end = ctx.items().len();
                self.run_window(ctx, 0, end, &mut summary).await.map(|_| ())
            }
            DispatchMode::Batched => self.run_batched(ctx, &mut summary).await,
        };
        self.finish(ctx, outcome)?;

        summary.paused = self.state == RunState::Paused;
        tracing::info!(
            succeeded = summary.succeeded,
            failed = summary.failed,
            split = summary.split,
            paused = summary.paused,
            "run finished"
        );
        Ok(summary)
    }

    /// Continue a paused (or restored) run from its first item not done.
    pub async fn resume(&mut self, ctx: &mut PipelineContext) -> PipelineResult<RunSummary> {
        match self.state {
            RunState::Paused | RunState::Idle => self.run(ctx).await,
            state => Err(PipelineError::InvalidState {
                action: "resume",
                state,
            }),
        }
    }

    /// Re-run every failed item with the same split-on-overflow policy.
    pub async fn repair(&mut self, ctx: &mut PipelineContext) -> PipelineResult<RepairSummary> {
        self.ensure_not_running("repair")?;
        self.begin();
        tracing::info!(failed = ctx.counts().failed, "repair pass started");

        let mut summary = RunSummary::default();
        let outcome = self.repair_failed(ctx, &mut summary).await;
        self.finish(ctx, outcome)?;

        Ok(RepairSummary {
            succeeded: summary.succeeded,
            still_failed: summary.failed,
            split: summary.split,
        })
    }

    /// Give up on a paused run: forget its persisted state.
    pub fn abandon(&mut self, ctx: &PipelineContext) -> PipelineResult<()> {
        self.ensure_not_running("abandon")?;
        ctx.store().clear_run_state()?;
        tracing::info!("run abandoned");
        self.set_state(RunState::Idle);
        Ok(())
    }

    /// Generate a new candidate for one item without accepting it.
    ///
    /// The candidate is kept as a roll result; use [`accept_roll`](Self::accept_roll)
    /// to make it the item's result.
    pub async fn reroll(&mut self, ctx: &PipelineContext, index: usize) -> PipelineResult<Worldbook> {
        self.ensure_not_running("reroll")?;
        let request = ctx.request_for(index)?;
        self.gate.reset();
        let cancel = CancellationToken::new();
        self.processor
            .process(&request, &cancel)
            .await
            .map_err(|e| match e {
                ItemError::Storage(e) => PipelineError::Storage(e),
                other => PipelineError::ItemFailed {
                    index,
                    reason: other.to_string(),
                },
            })
    }

    /// Accept a stored candidate as the item's result and merge it.
    pub fn accept_roll(
        &mut self,
        ctx: &mut PipelineContext,
        index: usize,
        roll_id: i64,
    ) -> PipelineResult<Vec<EntryChange>> {
        self.ensure_not_running("accept a roll")?;
        let roll = ctx
            .store()
            .list_roll_results(index)?
            .into_iter()
            .find(|r| r.id == roll_id)
            .ok_or(PipelineError::RollNotFound { index, id: roll_id })?;

        let title = ctx.item_mut(index)?.title.clone();
        let changes = ctx
            .accumulator_mut()
            .merge(&roll.result, index, &title, self.config.merge_mode)?;
        ctx.item_mut(index)?.mark_done(roll.result);
        ctx.persist()?;
        tracing::info!(index, roll_id, changes = changes.len(), "roll accepted");
        Ok(changes)
    }

    /// Roll the accumulation back to before history record `sequence_id`.
    ///
    /// History is ordered by merge time, not queue position, so every item
    /// whose record is removed returns to pending and the next run
    /// regenerates it.
    pub fn rollback(&mut self, ctx: &mut PipelineContext, sequence_id: i64) -> PipelineResult<Worldbook> {
        self.ensure_not_running("roll back")?;
        let removed: HashSet<String> = ctx
            .store()
            .list_history()?
            .into_iter()
            .filter(|r| r.sequence_id >= sequence_id)
            .map(|r| r.title)
            .collect();
        let restored = ctx.accumulator_mut().rollback(sequence_id)?;

        let affected: Vec<usize> = ctx
            .items()
            .iter()
            .enumerate()
            .filter(|(_, item)| removed.contains(&item.title))
            .map(|(index, _)| index)
            .collect();
        for &index in &affected {
            ctx.item_mut(index)?.reset();
        }
        tracing::info!(sequence_id, reset = affected.len(), "rolled back");
        ctx.persist()?;
        self.emit(PipelineEvent::Persisted {
            cursor: ctx.cursor(),
        });
        Ok(restored)
    }

    fn ensure_not_running(&self, action: &'static str) -> PipelineResult<()> {
        if self.state == RunState::Running {
            return Err(PipelineError::InvalidState {
                action,
                state: self.state,
            });
        }
        Ok(())
    }

    fn begin(&mut self) {
        self.cancel.reset();
        self.gate.reset();
        self.set_state(RunState::Running);
    }

    /// Persist the final run state and settle the state machine.
    fn finish(&mut self, ctx: &PipelineContext, outcome: PipelineResult<()>) -> PipelineResult<()> {
        if let Err(e) = outcome.and_then(|_| self.persist(ctx)) {
            tracing::error!(error = %e, "run stopped");
            self.set_state(RunState::Failed);
            return Err(e);
        }
        if self.cancel.is_cancelled() {
            self.set_state(RunState::Paused);
        } else {
            self.set_state(RunState::Completed);
        }
        Ok(())
    }

    fn set_state(&mut self, state: RunState) {
        self.state = state;
        self.emit(PipelineEvent::StateChanged { state });
    }

    fn emit(&self, event: PipelineEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    fn persist(&self, ctx: &PipelineContext) -> PipelineResult<()> {
        ctx.persist()?;
        self.emit(PipelineEvent::Persisted {
            cursor: ctx.cursor(),
        });
        Ok(())
    }

    /// Persist after an item unless this mode persists per batch.
    fn checkpoint(&self, ctx: &PipelineContext) -> PipelineResult<()> {
        if self.config.mode == DispatchMode::Batched {
            return Ok(());
        }
        self.persist(ctx)
    }

    fn start_item(&self, ctx: &mut PipelineContext, index: usize) -> PipelineResult<ItemRequest> {
        let request = ctx.request_for(index)?;
        ctx.item_mut(index)?.mark_processing();
        tracing::debug!(index, title = %request.title, "item started");
        self.emit(PipelineEvent::ItemStarted {
            index,
            title: request.title.clone(),
        });
        Ok(request)
    }

    /// Apply one item outcome to the queue and accumulator.
    fn settle(
        &self,
        ctx: &mut PipelineContext,
        index: usize,
        outcome: Result<Worldbook, ItemError>,
        summary: &mut RunSummary,
    ) -> PipelineResult<Settled> {
        let title = ctx.item_mut(index)?.title.clone();
        let settled = match outcome {
            Ok(result) => {
                let changes = ctx
                    .accumulator_mut()
                    .merge(&result, index, &title, self.config.merge_mode)?;
                ctx.item_mut(index)?.mark_done(result);
                summary.succeeded += 1;
                tracing::debug!(index, title = %title, changes = changes.len(), "item done");
                self.emit(PipelineEvent::ItemCompleted {
                    index,
                    title,
                    changes: changes.len(),
                });
                Settled::Done
            }
            Err(ItemError::Aborted) => {
                ctx.item_mut(index)?.reset();
                tracing::debug!(index, title = %title, "item aborted");
                return Ok(Settled::Aborted);
            }
            Err(ItemError::Overflow(reason)) => {
                if ctx.split_in_place(index, self.config.min_split_chars)? {
                    summary.split += 1;
                    tracing::info!(index, title = %title, reason = %reason, "item split after overflow");
                    self.emit(PipelineEvent::ItemSplit { index, title });
                    Settled::Split
                } else {
                    summary.failed += 1;
                    let reason = ctx.item(index).and_then(|i| i.failure_reason.clone()).unwrap_or(reason);
                    tracing::warn!(index, title = %title, reason = %reason, "item overflowed and cannot be split");
                    self.emit(PipelineEvent::ItemFailed { index, title, reason });
                    Settled::Failed
                }
            }
            Err(ItemError::Permanent(reason)) => {
                ctx.item_mut(index)?.mark_failed(reason.clone());
                summary.failed += 1;
                tracing::warn!(index, title = %title, reason = %reason, "item failed");
                self.emit(PipelineEvent::ItemFailed { index, title, reason });
                Settled::Failed
            }
            Err(ItemError::Storage(e)) => return Err(e.into()),
        };

        let counts = ctx.counts();
        self.emit(PipelineEvent::Progress {
            done: counts.done,
            total: counts.total(),
        });
        self.checkpoint(ctx)?;
        Ok(settled)
    }

    /// Process items in `[start, end)` one at a time, skipping done ones.
    ///
    /// A split replaces the current item with its halves and extends the span
    /// by one. Returns the span's end after any splits.
    async fn process_span(
        &self,
        ctx: &mut PipelineContext,
        start: usize,
        mut end: usize,
        summary: &mut RunSummary,
    ) -> PipelineResult<usize> {
        let mut index = start;
        while index < end {
            if self.cancel.is_cancelled() {
                break;
            }
            if ctx.item(index).map_or(true, |i| i.is_done()) {
                index += 1;
                continue;
            }

            let request = self.start_item(ctx, index)?;
            let outcome = self.processor.process(&request, &self.cancel).await;
            match self.settle(ctx, index, outcome, summary)? {
                // The first half now sits at `index`
                Settled::Split => end += 1,
                Settled::Aborted => break,
                Settled::Done | Settled::Failed => index += 1,
            }
        }
        Ok(end)
    }

    /// Dispatch every not-done item in `[start, end)` concurrently, then split
    /// and sequentially process the ones that overflowed.
    ///
    /// Returns the window's end after any splits.
    async fn run_window(
        &self,
        ctx: &mut PipelineContext,
        start: usize,
        mut end: usize,
        summary: &mut RunSummary,
    ) -> PipelineResult<usize> {
        let mut tasks = JoinSet::new();
        for index in start..end {
            if self.cancel.is_cancelled() {
                break;
            }
            if ctx.item(index).map_or(true, |i| i.is_done()) {
                continue;
            }
            let request = self.start_item(ctx, index)?;
            let processor = self.processor.clone();
            let cancel = self.cancel.clone();
            tasks.spawn(async move {
                let outcome = processor.process(&request, &cancel).await;
                (index, outcome)
            });
        }

        let mut overflowed = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let (index, outcome) =
                joined.map_err(|e| PipelineError::Internal(format!("item task failed: {}", e)))?;
            match outcome {
                Err(ItemError::Overflow(reason)) => {
                    tracing::debug!(index, reason = %reason, "overflow deferred until wave settles");
                    ctx.item_mut(index)?.reset();
                    overflowed.push((index, reason));
                }
                other => {
                    self.settle(ctx, index, other, summary)?;
                }
            }
        }

        overflowed.sort_by_key(|(index, _)| *index);
        let mut shift = 0;
        for (original, reason) in overflowed {
            if self.cancel.is_cancelled() {
                // Left pending; a resume will overflow and split it again
                break;
            }
            let index = original + shift;
            ctx.item_mut(index)?.mark_processing();
            match self.settle(ctx, index, Err(ItemError::Overflow(reason)), summary)? {
                Settled::Split => {
                    let span_end = self.process_span(ctx, index, index + 2, summary).await?;
                    let added = span_end - index - 1;
                    shift += added;
                    end += added;
                }
                _ => continue,
            }
        }
        Ok(end)
    }

    async fn run_batched(&self, ctx: &mut PipelineContext, summary: &mut RunSummary) -> PipelineResult<()> {
        let batch_size = self.config.batch_size.max(1);
        let mut start = ctx.cursor();
        while start < ctx.items().len() {
            if self.cancel.is_cancelled() {
                break;
            }
            let end = (start + batch_size).min(ctx.items().len());
            tracing::debug!(start, end, "batch started");
            start = self.run_window(ctx, start, end, summary).await?;
            self.persist(ctx)?;
        }
        Ok(())
    }

    async fn repair_failed(&self, ctx: &mut PipelineContext, summary: &mut RunSummary) -> PipelineResult<()> {
        let mut index = 0;
        while index < ctx.items().len() {
            if self.cancel.is_cancelled() {
                break;
            }
            if ctx.item(index).map(|i| i.status) != Some(ItemStatus::Failed) {
                index += 1;
                continue;
            }
            index = self.process_span(ctx, index, index + 1, summary).await?;
        }
        Ok(())
    }
}
