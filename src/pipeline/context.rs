//! Per-run pipeline context and its persisted form
//!
//! A `PipelineContext` owns the work-item queue and the accumulator for one
//! input. The scheduler borrows it mutably for the duration of a run; between
//! runs callers use it to inspect, edit and reset items.

use super::error::{PipelineError, PipelineResult};
use super::item::{split_item, ItemStatus, WorkItem};
use super::processor::ItemRequest;
use crate::storage::{StateStore, StorageResult};
use crate::worldbook::{Accumulator, HistoryPolicy, Worldbook};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

// Fixed namespace so the same input always fingerprints the same.
const FINGERPRINT_NS: uuid::Uuid = uuid::Uuid::from_bytes([
    0x3a, 0x51, 0x0e, 0x84, 0x6f, 0x2b, 0x4c, 0x7d, 0x9e, 0x13, 0xc5, 0x60, 0x8a, 0xf2, 0x17, 0xbb,
]);

/// Content hash deciding whether a stored run belongs to this input.
pub fn fingerprint(text: &str) -> String {
    uuid::Uuid::new_v5(&FINGERPRINT_NS, text.as_bytes()).to_string()
}

/// Index of the first item not done, or `items.len()` when all are.
pub fn first_not_done(items: &[WorkItem]) -> usize {
    items
        .iter()
        .position(|item| !item.is_done())
        .unwrap_or(items.len())
}

/// Everything needed to resume a run after restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedRunState {
    /// First item not done
    pub cursor: usize,
    pub work_items: Vec<WorkItem>,
    pub accumulated_worldbook: Worldbook,
    /// Caller-owned settings carried with the run
    #[serde(default)]
    pub aux_data: Value,
    pub file_fingerprint: String,
    pub timestamp: DateTime<Utc>,
}

impl PersistedRunState {
    pub fn new(
        work_items: Vec<WorkItem>,
        accumulated_worldbook: Worldbook,
        file_fingerprint: impl Into<String>,
    ) -> Self {
        Self {
            cursor: first_not_done(&work_items),
            work_items,
            accumulated_worldbook,
            aux_data: Value::Null,
            file_fingerprint: file_fingerprint.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Item counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub pending: usize,
    pub processing: usize,
    pub done: usize,
    pub failed: usize,
}

impl QueueCounts {
    pub fn total(&self) -> usize {
        self.pending + self.processing + self.done + self.failed
    }
}

/// The queue and accumulator for one input.
pub struct PipelineContext {
    items: Vec<WorkItem>,
    accumulator: Accumulator,
    store: Arc<dyn StateStore>,
    fingerprint: String,
    aux_data: Value,
}

impl PipelineContext {
    /// A fresh run over `items`.
    pub fn new(
        items: Vec<WorkItem>,
        fingerprint: impl Into<String>,
        store: Arc<dyn StateStore>,
        policy: HistoryPolicy,
    ) -> Self {
        Self {
            items,
            accumulator: Accumulator::new(store.clone(), policy),
            store,
            fingerprint: fingerprint.into(),
            aux_data: Value::Null,
        }
    }

    /// Rebuild the stored run if it belongs to the input with `fingerprint`.
    ///
    /// Items persisted mid-flight come back as pending.
    pub fn restore(
        store: Arc<dyn StateStore>,
        fingerprint: &str,
        policy: HistoryPolicy,
    ) -> StorageResult<Option<Self>> {
        let Some(state) = store.load_run_state()? else {
            return Ok(None);
        };
        if state.file_fingerprint != fingerprint {
            tracing::info!(
                stored = %state.file_fingerprint,
                current = %fingerprint,
                "stored run belongs to a different input"
            );
            return Ok(None);
        }

        let mut items = state.work_items;
        for item in items.iter_mut().filter(|i| i.status == ItemStatus::Processing) {
            item.reset();
        }
        tracing::info!(
            items = items.len(),
            cursor = first_not_done(&items),
            "restored run state"
        );

        Ok(Some(Self {
            items,
            accumulator: Accumulator::new(store.clone(), policy)
                .with_worldbook(state.accumulated_worldbook),
            store,
            fingerprint: state.file_fingerprint,
            aux_data: state.aux_data,
        }))
    }

    pub fn items(&self) -> &[WorkItem] {
        &self.items
    }

    pub fn item(&self, index: usize) -> Option<&WorkItem> {
        self.items.get(index)
    }

    pub(crate) fn item_mut(&mut self, index: usize) -> PipelineResult<&mut WorkItem> {
        self.items
            .get_mut(index)
            .ok_or(PipelineError::ItemNotFound(index))
    }

    pub fn accumulator(&self) -> &Accumulator {
        &self.accumulator
    }

    pub(crate) fn accumulator_mut(&mut self) -> &mut Accumulator {
        &mut self.accumulator
    }

    /// The accumulated result so far.
    pub fn worldbook(&self) -> &Worldbook {
        self.accumulator.current()
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn aux_data(&self) -> &Value {
        &self.aux_data
    }

    pub fn set_aux_data(&mut self, aux_data: Value) {
        self.aux_data = aux_data;
    }

    /// First item not done; where a resume starts.
    pub fn cursor(&self) -> usize {
        first_not_done(&self.items)
    }

    pub fn is_complete(&self) -> bool {
        self.cursor() == self.items.len()
    }

    pub fn counts(&self) -> QueueCounts {
        let mut counts = QueueCounts::default();
        for item in &self.items {
            match item.status {
                ItemStatus::Pending => counts.pending += 1,
                ItemStatus::Processing => counts.processing += 1,
                ItemStatus::Done => counts.done += 1,
                ItemStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }

    /// Indices of failed items with their reasons.
    pub fn failures(&self) -> Vec<(usize, &str)> {
        self.items
            .iter()
            .enumerate()
            .filter(|(_, item)| item.status == ItemStatus::Failed)
            .map(|(i, item)| (i, item.failure_reason.as_deref().unwrap_or("")))
            .collect()
    }

    pub fn snapshot(&self) -> PersistedRunState {
        PersistedRunState {
            cursor: self.cursor(),
            work_items: self.items.clone(),
            accumulated_worldbook: self.accumulator.current().clone(),
            aux_data: self.aux_data.clone(),
            file_fingerprint: self.fingerprint.clone(),
            timestamp: Utc::now(),
        }
    }

    /// Write the current run state.
    pub fn persist(&self) -> StorageResult<()> {
        self.store.save_run_state(&self.snapshot())
    }

    /// Replace an item's content; it returns to pending with no result.
    ///
    /// Candidates generated from the old content are dropped.
    pub fn edit_item(&mut self, index: usize, content: impl Into<String>) -> PipelineResult<()> {
        let item = self.item_mut(index)?;
        if item.is_in_flight() {
            return Err(PipelineError::ItemInFlight(index));
        }
        item.content = content.into();
        item.reset();
        self.store.clear_roll_results(index)?;
        Ok(())
    }

    /// Return an item to pending so the next run regenerates it.
    pub fn reset_item(&mut self, index: usize) -> PipelineResult<()> {
        let item = self.item_mut(index)?;
        if item.is_in_flight() {
            return Err(PipelineError::ItemInFlight(index));
        }
        item.reset();
        Ok(())
    }

    /// The request for processing the item at `index`, with the result of the
    /// nearest preceding done item as context.
    pub(crate) fn request_for(&self, index: usize) -> PipelineResult<ItemRequest> {
        let item = self.item(index).ok_or(PipelineError::ItemNotFound(index))?;
        let previous = self.items[..index]
            .iter()
            .rev()
            .find(|i| i.is_done())
            .and_then(|i| i.result.clone());
        Ok(ItemRequest {
            index,
            total: self.items.len(),
            title: item.title.clone(),
            content: item.content.clone(),
            previous,
        })
    }

    /// Replace the item at `index` with its two halves.
    ///
    /// Returns false, with the item marked failed, when it is below the split
    /// floor. Roll results of later items move with them.
    pub(crate) fn split_in_place(&mut self, index: usize, min_chars: usize) -> PipelineResult<bool> {
        let item = self.item(index).ok_or(PipelineError::ItemNotFound(index))?;
        match split_item(item, min_chars) {
            Ok((first, second)) => {
                self.store.clear_roll_results(index)?;
                self.store.shift_roll_results(index + 1, 1)?;
                self.items.splice(index..=index, [first, second]);
                Ok(true)
            }
            Err(e) => {
                self.items[index].mark_failed(e.to_string());
                Ok(false)
            }
        }
    }
}
