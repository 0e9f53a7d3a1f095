//! Worldbook: categorized named entries with keywords and content

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Separator placed between content fragments appended by incremental merges.
pub const CONTENT_SEPARATOR: &str = "\n\n---\n\n";

/// A single named entry inside a category.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// Trigger keywords, deduplicated, first-seen order
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub content: String,
}

impl Entry {
    pub fn new<I, S>(keywords: I, content: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut entry = Self {
            keywords: Vec::new(),
            content: content.into(),
        };
        entry.add_keywords(keywords);
        entry
    }

    /// Union keywords into this entry. Returns true if any were new.
    pub fn add_keywords<I, S>(&mut self, keywords: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut changed = false;
        for kw in keywords {
            let kw = kw.into();
            let kw = kw.trim();
            if kw.is_empty() || self.keywords.iter().any(|k| k == kw) {
                continue;
            }
            self.keywords.push(kw.to_string());
            changed = true;
        }
        changed
    }

    /// Whether `fragment` already appears at the start of this entry's content
    /// or of any fragment appended after a separator.
    pub fn has_content_prefix(&self, fragment: &str) -> bool {
        let fragment = fragment.trim();
        if fragment.is_empty() {
            return true;
        }
        self.content
            .split(CONTENT_SEPARATOR)
            .any(|segment| segment.trim_start().starts_with(fragment))
    }

    /// Append `fragment` beneath a separator unless it duplicates existing content.
    pub fn append_content(&mut self, fragment: &str) -> bool {
        if self.has_content_prefix(fragment) {
            return false;
        }
        let fragment = fragment.trim();
        if self.content.trim().is_empty() {
            self.content = fragment.to_string();
        } else {
            self.content.push_str(CONTENT_SEPARATOR);
            self.content.push_str(fragment);
        }
        true
    }
}

/// Category name → entry name → entry.
///
/// Also the shape of every per-item structured result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Worldbook {
    categories: BTreeMap<String, BTreeMap<String, Entry>>,
}

impl Worldbook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an entry, creating the category as needed.
    pub fn insert(
        &mut self,
        category: impl Into<String>,
        name: impl Into<String>,
        entry: Entry,
    ) -> Option<Entry> {
        self.categories
            .entry(category.into())
            .or_default()
            .insert(name.into(), entry)
    }

    /// Builder-style insert.
    pub fn with_entry(
        mut self,
        category: impl Into<String>,
        name: impl Into<String>,
        entry: Entry,
    ) -> Self {
        self.insert(category, name, entry);
        self
    }

    pub fn get(&self, category: &str, name: &str) -> Option<&Entry> {
        self.categories.get(category).and_then(|c| c.get(name))
    }

    pub fn get_mut(&mut self, category: &str, name: &str) -> Option<&mut Entry> {
        self.categories.get_mut(category).and_then(|c| c.get_mut(name))
    }

    pub fn category(&self, category: &str) -> Option<&BTreeMap<String, Entry>> {
        self.categories.get(category)
    }

    pub fn categories(&self) -> impl Iterator<Item = (&String, &BTreeMap<String, Entry>)> {
        self.categories.iter()
    }

    /// Every (category, name, entry) triple in category then name order.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &str, &Entry)> {
        self.categories.iter().flat_map(|(cat, entries)| {
            entries
                .iter()
                .map(move |(name, entry)| (cat.as_str(), name.as_str(), entry))
        })
    }

    pub fn remove(&mut self, category: &str, name: &str) -> Option<Entry> {
        let cat = self.categories.get_mut(category)?;
        let removed = cat.remove(name);
        if cat.is_empty() {
            self.categories.remove(category);
        }
        removed
    }

    pub fn entry_count(&self) -> usize {
        self.categories.values().map(|c| c.len()).sum()
    }

    pub fn category_count(&self) -> usize {
        self.categories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entry_count() == 0
    }
}
