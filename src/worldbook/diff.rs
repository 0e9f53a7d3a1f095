//! Entry-level diff between two worldbook snapshots

use super::types::{Entry, Worldbook};
use serde::{Deserialize, Serialize};

/// What happened to an entry between two snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Add,
    Modify,
    Delete,
}

/// One changed entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryChange {
    pub kind: ChangeKind,
    pub category: String,
    pub entry_name: String,
    pub old_value: Option<Entry>,
    pub new_value: Option<Entry>,
}

/// Diff `before` against `after`.
///
/// Added: present only in `after`. Modified: present in both with a different
/// value. Deleted: present only in `before`. Output is in category then entry
/// name order.
pub fn diff_worldbooks(before: &Worldbook, after: &Worldbook) -> Vec<EntryChange> {
    let mut changes = Vec::new();

    for (category, name, new) in after.entries() {
        match before.get(category, name) {
            None => changes.push(EntryChange {
                kind: ChangeKind::Add,
                category: category.to_string(),
                entry_name: name.to_string(),
                old_value: None,
                new_value: Some(new.clone()),
            }),
            Some(old) if old != new => changes.push(EntryChange {
                kind: ChangeKind::Modify,
                category: category.to_string(),
                entry_name: name.to_string(),
                old_value: Some(old.clone()),
                new_value: Some(new.clone()),
            }),
            Some(_) => {}
        }
    }

    for (category, name, old) in before.entries() {
        if after.get(category, name).is_none() {
            changes.push(EntryChange {
                kind: ChangeKind::Delete,
                category: category.to_string(),
                entry_name: name.to_string(),
                old_value: Some(old.clone()),
                new_value: None,
            });
        }
    }

    changes.sort_by(|a, b| {
        (a.category.as_str(), a.entry_name.as_str()).cmp(&(b.category.as_str(), b.entry_name.as_str()))
    });
    changes
}
