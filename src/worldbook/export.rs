//! Export formats for a finished worldbook

use super::types::Worldbook;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Output document shape.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    /// `category → entry → {keywords, content}`
    #[default]
    Tree,
    /// Flattened entries interchange document
    Entries,
}

/// One entry in the flattened interchange format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportedEntry {
    pub uid: u64,
    /// Primary trigger keys
    pub key: Vec<String>,
    pub keysecondary: Vec<String>,
    /// Entry name
    pub comment: String,
    pub content: String,
    /// Always inserted, regardless of keys
    pub constant: bool,
    /// Require a secondary key match as well
    pub selective: bool,
    /// Insertion priority; lower goes first
    pub order: u32,
    pub position: u32,
    pub disable: bool,
    /// Source category
    pub group: String,
    pub add_memo: bool,
    pub exclude_recursion: bool,
    pub probability: u32,
    pub use_probability: bool,
    pub depth: u32,
}

/// The flattened document: entries keyed by their uid as a string.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntriesDocument {
    pub entries: BTreeMap<String, ExportedEntry>,
}

const DEFAULT_ORDER: u32 = 100;
const DEFAULT_DEPTH: u32 = 4;

/// Flatten a worldbook into the entries document.
///
/// Uids follow category then entry-name order, starting at 0.
pub fn to_entries_document(wb: &Worldbook) -> EntriesDocument {
    let entries = wb
        .entries()
        .enumerate()
        .map(|(uid, (category, name, entry))| {
            let uid = uid as u64;
            let key = if entry.keywords.is_empty() {
                vec![name.to_string()]
            } else {
                entry.keywords.clone()
            };
            let exported = ExportedEntry {
                uid,
                key,
                keysecondary: Vec::new(),
                comment: name.to_string(),
                content: entry.content.clone(),
                constant: false,
                selective: true,
                order: DEFAULT_ORDER,
                position: 0,
                disable: false,
                group: category.to_string(),
                add_memo: true,
                exclude_recursion: false,
                probability: 100,
                use_probability: true,
                depth: DEFAULT_DEPTH,
            };
            (uid.to_string(), exported)
        })
        .collect();
    EntriesDocument { entries }
}

/// Render `wb` as pretty-printed JSON in the chosen format.
pub fn export(wb: &Worldbook, format: ExportFormat) -> serde_json::Result<String> {
    match format {
        ExportFormat::Tree => serde_json::to_string_pretty(wb),
        ExportFormat::Entries => serde_json::to_string_pretty(&to_entries_document(wb)),
    }
}
