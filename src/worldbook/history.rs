//! History records produced by accepted merges

use super::diff::EntryChange;
use super::types::Worldbook;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An immutable snapshot-diff pair from one accepted merge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    /// Assigned by the store on append; monotonically increasing, never reused
    pub sequence_id: i64,
    /// Queue index of the work item that produced the delta
    pub work_item_index: usize,
    pub title: String,
    pub previous_snapshot: Worldbook,
    pub resulting_snapshot: Worldbook,
    pub changed_entries: Vec<EntryChange>,
    pub timestamp: DateTime<Utc>,
}

impl HistoryRecord {
    /// A record not yet appended to a store (`sequence_id` is 0).
    pub fn unsaved(
        work_item_index: usize,
        title: impl Into<String>,
        previous_snapshot: Worldbook,
        resulting_snapshot: Worldbook,
        changed_entries: Vec<EntryChange>,
    ) -> Self {
        Self {
            sequence_id: 0,
            work_item_index,
            title: title.into(),
            previous_snapshot,
            resulting_snapshot,
            changed_entries,
            timestamp: Utc::now(),
        }
    }
}

/// How repeated titles are kept in history.
///
/// With `squash_duplicate_titles` on, history holds the latest record per
/// title: appending a record deletes earlier records with the same title,
/// unless the title is listed in `repeatable_titles`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryPolicy {
    pub squash_duplicate_titles: bool,
    pub repeatable_titles: Vec<String>,
}

impl Default for HistoryPolicy {
    fn default() -> Self {
        Self {
            squash_duplicate_titles: true,
            repeatable_titles: vec![
                "optimization pass".to_string(),
                "evolution summary".to_string(),
            ],
        }
    }
}

impl HistoryPolicy {
    /// Keep every record (full audit log).
    pub fn keep_all() -> Self {
        Self {
            squash_duplicate_titles: false,
            repeatable_titles: Vec::new(),
        }
    }

    /// Whether earlier records titled `title` should be dropped on append.
    pub fn squashes(&self, title: &str) -> bool {
        self.squash_duplicate_titles && !self.repeatable_titles.iter().any(|t| t == title)
    }
}
