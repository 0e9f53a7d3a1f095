//! The accumulator: owner of the cumulative worldbook
//!
//! Every merge snapshots the current state, applies the delta to a copy,
//! diffs the two and, if anything changed, appends a history record before
//! the copy becomes current. Rollback restores a record's pre-merge snapshot
//! and truncates history from that record on.

use super::diff::{diff_worldbooks, EntryChange};
use super::history::{HistoryPolicy, HistoryRecord};
use super::types::Worldbook;
use crate::storage::{StateStore, StorageError, StorageResult};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// How a delta is combined with the accumulation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeMode {
    /// Add new entries; union keywords and append new content on existing ones
    #[default]
    Incremental,
    /// Delta entries overwrite existing ones
    Replace,
}

/// Owns the accumulated worldbook and its history.
pub struct Accumulator {
    current: Worldbook,
    store: Arc<dyn StateStore>,
    policy: HistoryPolicy,
}

impl Accumulator {
    pub fn new(store: Arc<dyn StateStore>, policy: HistoryPolicy) -> Self {
        Self {
            current: Worldbook::new(),
            store,
            policy,
        }
    }

    /// Start from an existing accumulation (e.g. a restored run).
    pub fn with_worldbook(mut self, worldbook: Worldbook) -> Self {
        self.current = worldbook;
        self
    }

    pub fn current(&self) -> &Worldbook {
        &self.current
    }

    pub fn policy(&self) -> &HistoryPolicy {
        &self.policy
    }

    /// Merge `delta` from the item at `index` titled `title`.
    ///
    /// Returns the changed entries. Nothing is written when the merge changes
    /// nothing. If the history record can't be appended, the accumulation and
    /// the existing history are left as they were.
    pub fn merge(
        &mut self,
        delta: &Worldbook,
        index: usize,
        title: &str,
        mode: MergeMode,
    ) -> StorageResult<Vec<EntryChange>> {
        let previous = self.current.clone();
        let mut next = previous.clone();
        match mode {
            MergeMode::Incremental => apply_incremental(&mut next, delta),
            MergeMode::Replace => apply_replace(&mut next, delta),
        }

        let changes = diff_worldbooks(&previous, &next);
        if changes.is_empty() {
            tracing::debug!(index, title, "merge produced no changes");
            return Ok(changes);
        }

        let record = HistoryRecord::unsaved(index, title, previous, next.clone(), changes.clone());
        let id = self.store.append_history(&record)?;
        tracing::debug!(index, title, sequence_id = id, changed = changes.len(), "merged");
        self.current = next;

        // Older records go only once the new one is stored
        if self.policy.squashes(title) {
            for older in self.store.list_history()? {
                if older.title == title && older.sequence_id < id {
                    self.store.delete_history(older.sequence_id)?;
                }
            }
        }
        Ok(changes)
    }

    /// Restore the snapshot taken before record `sequence_id`, deleting it and
    /// every later record.
    pub fn rollback(&mut self, sequence_id: i64) -> StorageResult<Worldbook> {
        let record = self
            .store
            .get_history(sequence_id)?
            .ok_or(StorageError::HistoryNotFound(sequence_id))?;
        let removed = self.store.delete_history_from(sequence_id)?;
        tracing::info!(sequence_id, removed, "rolled back history");

        self.current = record.previous_snapshot.clone();
        Ok(record.previous_snapshot)
    }

    /// All history records in sequence order.
    pub fn history(&self) -> StorageResult<Vec<HistoryRecord>> {
        self.store.list_history()
    }

    /// Drop all history. The accumulation itself is kept.
    pub fn clear_history(&self) -> StorageResult<usize> {
        self.store.clear_history()
    }
}

fn apply_incremental(target: &mut Worldbook, delta: &Worldbook) {
    for (category, name, entry) in delta.entries() {
        match target.get_mut(category, name) {
            Some(existing) => {
                existing.add_keywords(entry.keywords.iter().cloned());
                existing.append_content(&entry.content);
            }
            None => {
                target.insert(category, name, entry.clone());
            }
        }
    }
}

fn apply_replace(target: &mut Worldbook, delta: &Worldbook) {
    for (category, name, entry) in delta.entries() {
        target.insert(category, name, entry.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::PersistedRunState;
    use crate::storage::{OpenStore, RollResult, SqliteStateStore};
    use crate::worldbook::{ChangeKind, Entry, CONTENT_SEPARATOR};
    use std::sync::atomic::{AtomicBool, Ordering};

    fn accumulator(policy: HistoryPolicy) -> Accumulator {
        let store = Arc::new(SqliteStateStore::open_in_memory().unwrap());
        Accumulator::new(store, policy)
    }

    fn wb(category: &str, name: &str, keywords: &[&str], content: &str) -> Worldbook {
        Worldbook::new().with_entry(category, name, Entry::new(keywords.iter().copied(), content))
    }

    #[test]
    fn disjoint_merges_yield_union() {
        let mut acc = accumulator(HistoryPolicy::default());
        let a = wb("Characters", "Alice", &["Alice"], "A knight.");
        let b = wb("Places", "Keep", &["keep"], "A fortress.");
        acc.merge(&a, 0, "A", MergeMode::Incremental).unwrap();
        acc.merge(&b, 1, "B", MergeMode::Incremental).unwrap();

        assert_eq!(acc.current().entry_count(), 2);
        assert_eq!(acc.current().get("Characters", "Alice"), a.get("Characters", "Alice"));
        assert_eq!(acc.current().get("Places", "Keep"), b.get("Places", "Keep"));
    }

    #[test]
    fn remerging_same_delta_is_a_noop() {
        let mut acc = accumulator(HistoryPolicy::keep_all());
        let delta = wb("Characters", "Alice", &["Alice", "Al"], "A knight.");
        let first = acc.merge(&delta, 0, "A", MergeMode::Incremental).unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].kind, ChangeKind::Add);

        let second = acc.merge(&delta, 0, "A", MergeMode::Incremental).unwrap();
        assert!(second.is_empty());
        assert_eq!(acc.history().unwrap().len(), 1);
    }

    #[test]
    fn incremental_unions_keywords_and_appends_content() {
        let mut acc = accumulator(HistoryPolicy::default());
        acc.merge(&wb("C", "Alice", &["Alice"], "A knight."), 0, "A", MergeMode::Incremental)
            .unwrap();
        let changes = acc
            .merge(&wb("C", "Alice", &["Lady Alice"], "Later a queen."), 1, "B", MergeMode::Incremental)
            .unwrap();

        assert_eq!(changes[0].kind, ChangeKind::Modify);
        let entry = acc.current().get("C", "Alice").unwrap();
        assert_eq!(entry.keywords, vec!["Alice", "Lady Alice"]);
        assert_eq!(entry.content, format!("A knight.{}Later a queen.", CONTENT_SEPARATOR));
    }

    #[test]
    fn replace_overwrites_entries() {
        let mut acc = accumulator(HistoryPolicy::default());
        acc.merge(&wb("C", "Alice", &["Alice"], "A knight."), 0, "A", MergeMode::Incremental)
            .unwrap();
        let replacement = wb("C", "Alice", &["Queen"], "A queen.");
        acc.merge(&replacement, 1, "B", MergeMode::Replace).unwrap();
        assert_eq!(acc.current().get("C", "Alice"), replacement.get("C", "Alice"));
    }

    #[test]
    fn rollback_restores_pre_merge_snapshot() {
        let mut acc = accumulator(HistoryPolicy::default());
        acc.merge(&wb("C", "A", &["a"], "one"), 0, "A", MergeMode::Incremental).unwrap();
        let before_b = acc.current().clone();
        acc.merge(&wb("C", "B", &["b"], "two"), 1, "B", MergeMode::Incremental).unwrap();
        acc.merge(&wb("C", "C", &["c"], "three"), 2, "C", MergeMode::Incremental).unwrap();

        let history = acc.history().unwrap();
        assert_eq!(history.len(), 3);
        let b_id = history[1].sequence_id;

        let restored = acc.rollback(b_id).unwrap();
        assert_eq!(restored, before_b);
        assert_eq!(acc.current(), &before_b);

        let remaining = acc.history().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].title, "A");
    }

    #[test]
    fn rollback_unknown_record_is_an_error() {
        let mut acc = accumulator(HistoryPolicy::default());
        let err = acc.rollback(42).unwrap_err();
        assert!(matches!(err, StorageError::HistoryNotFound(42)));
    }

    #[test]
    fn duplicate_titles_are_squashed() {
        let mut acc = accumulator(HistoryPolicy::default());
        acc.merge(&wb("C", "A", &["a"], "one"), 0, "chunk1", MergeMode::Incremental).unwrap();
        acc.merge(&wb("C", "B", &["b"], "two"), 0, "chunk1", MergeMode::Incremental).unwrap();

        let history = acc.history().unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].changed_entries[0].entry_name, "B");
    }

    #[test]
    fn allow_listed_titles_repeat() {
        let mut acc = accumulator(HistoryPolicy::default());
        acc.merge(&wb("C", "A", &["a"], "one"), 0, "optimization pass", MergeMode::Incremental)
            .unwrap();
        acc.merge(&wb("C", "B", &["b"], "two"), 0, "optimization pass", MergeMode::Incremental)
            .unwrap();
        assert_eq!(acc.history().unwrap().len(), 2);
    }

    #[test]
    fn keep_all_policy_keeps_duplicate_titles() {
        let mut acc = accumulator(HistoryPolicy::keep_all());
        acc.merge(&wb("C", "A", &["a"], "one"), 0, "chunk1", MergeMode::Incremental).unwrap();
        acc.merge(&wb("C", "B", &["b"], "two"), 0, "chunk1", MergeMode::Incremental).unwrap();
        assert_eq!(acc.history().unwrap().len(), 2);
    }

    /// SQLite store whose history appends can be switched off.
    struct FlakyAppends {
        inner: SqliteStateStore,
        reject: AtomicBool,
    }

    impl StateStore for FlakyAppends {
        fn save_run_state(&self, state: &PersistedRunState) -> StorageResult<()> {
            self.inner.save_run_state(state)
        }
        fn load_run_state(&self) -> StorageResult<Option<PersistedRunState>> {
            self.inner.load_run_state()
        }
        fn clear_run_state(&self) -> StorageResult<()> {
            self.inner.clear_run_state()
        }
        fn append_history(&self, record: &HistoryRecord) -> StorageResult<i64> {
            if self.reject.load(Ordering::SeqCst) {
                return Err(StorageError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "disk full",
                )));
            }
            self.inner.append_history(record)
        }
        fn list_history(&self) -> StorageResult<Vec<HistoryRecord>> {
            self.inner.list_history()
        }
        fn get_history(&self, sequence_id: i64) -> StorageResult<Option<HistoryRecord>> {
            self.inner.get_history(sequence_id)
        }
        fn delete_history(&self, sequence_id: i64) -> StorageResult<bool> {
            self.inner.delete_history(sequence_id)
        }
        fn delete_history_from(&self, sequence_id: i64) -> StorageResult<usize> {
            self.inner.delete_history_from(sequence_id)
        }
        fn clear_history(&self) -> StorageResult<usize> {
            self.inner.clear_history()
        }
        fn save_roll_result(&self, item_index: usize, result: &Worldbook) -> StorageResult<i64> {
            self.inner.save_roll_result(item_index, result)
        }
        fn list_roll_results(&self, item_index: usize) -> StorageResult<Vec<RollResult>> {
            self.inner.list_roll_results(item_index)
        }
        fn clear_roll_results(&self, item_index: usize) -> StorageResult<usize> {
            self.inner.clear_roll_results(item_index)
        }
        fn shift_roll_results(&self, from_index: usize, delta: usize) -> StorageResult<()> {
            self.inner.shift_roll_results(from_index, delta)
        }
    }

    #[test]
    fn failed_append_keeps_squashable_history() {
        let store = Arc::new(FlakyAppends {
            inner: SqliteStateStore::open_in_memory().unwrap(),
            reject: AtomicBool::new(false),
        });
        let mut acc = Accumulator::new(store.clone(), HistoryPolicy::default());
        acc.merge(&wb("C", "A", &["a"], "one"), 0, "chunk1", MergeMode::Incremental).unwrap();
        let before = acc.current().clone();

        store.reject.store(true, Ordering::SeqCst);
        let err = acc
            .merge(&wb("C", "B", &["b"], "two"), 0, "chunk1", MergeMode::Incremental)
            .unwrap_err();
        assert!(matches!(err, StorageError::Io(_)));

        assert_eq!(acc.current(), &before);
        let history = acc.history().unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].changed_entries[0].entry_name, "A");
    }
}
