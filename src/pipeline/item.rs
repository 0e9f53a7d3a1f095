//! Work items: one chunk of input text plus its lifecycle status

use crate::worldbook::Worldbook;
use serde::{Deserialize, Serialize};

/// Default floor below which an item is not split further.
pub const MIN_SPLIT_CHARS: usize = 500;

/// Lifecycle status of a work item.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    #[default]
    Pending,
    Processing,
    Done,
    Failed,
}

impl std::fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// One unit of the ordered queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Human label; composite after splits ("chunk3-1")
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub status: ItemStatus,
    #[serde(default)]
    pub failure_reason: Option<String>,
    /// Set only while `status` is `Done`
    #[serde(default)]
    pub result: Option<Worldbook>,
}

impl WorkItem {
    pub fn new(title: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            content: content.into(),
            status: ItemStatus::Pending,
            failure_reason: None,
            result: None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.status == ItemStatus::Done
    }

    pub fn is_in_flight(&self) -> bool {
        self.status == ItemStatus::Processing
    }

    /// Length in characters, the unit split floors are expressed in.
    pub fn char_len(&self) -> usize {
        self.content.chars().count()
    }

    pub(crate) fn mark_processing(&mut self) {
        self.status = ItemStatus::Processing;
        self.failure_reason = None;
    }

    /// Accept a result, replacing any earlier one whole.
    pub(crate) fn mark_done(&mut self, result: Worldbook) {
        self.status = ItemStatus::Done;
        self.failure_reason = None;
        self.result = Some(result);
    }

    pub(crate) fn mark_failed(&mut self, reason: impl Into<String>) {
        self.status = ItemStatus::Failed;
        self.failure_reason = Some(reason.into());
        self.result = None;
    }

    /// Back to pending with no result.
    pub(crate) fn reset(&mut self) {
        self.status = ItemStatus::Pending;
        self.failure_reason = None;
        self.result = None;
    }
}

/// Why an item could not be split.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SplitError {
    #[error("unsplittable: {len} chars is below the {min} char split floor")]
    TooSmall { len: usize, min: usize },
}

/// Split an item into two halves titled `<title>-1` and `<title>-2`.
///
/// The halves concatenate back to the original content exactly. Items
/// shorter than `min_chars` are refused.
pub fn split_item(item: &WorkItem, min_chars: usize) -> Result<(WorkItem, WorkItem), SplitError> {
    let len = item.char_len();
    if len < min_chars.max(2) {
        return Err(SplitError::TooSmall {
            len,
            min: min_chars.max(2),
        });
    }
    let at = split_point(&item.content);
    let (head, tail) = item.content.split_at(at);
    Ok((
        WorkItem::new(format!("{}-1", item.title), head),
        WorkItem::new(format!("{}-2", item.title), tail),
    ))
}

const SENTENCE_ENDS: &[char] = &['.', '!', '?', '。', '！', '？', '…', ';', '；'];

/// Byte offset at which to cut `text` into two non-empty halves.
///
/// Prefers the paragraph break nearest the middle, then the nearest sentence
/// end, then the character midpoint. Breaks are only considered within the
/// middle half of the text so neither side ends up a sliver.
pub fn split_point(text: &str) -> usize {
    let boundaries: Vec<usize> = text.char_indices().map(|(i, _)| i).collect();
    let char_len = boundaries.len();
    if char_len < 2 {
        return text.len();
    }
    let mid = boundaries[char_len / 2];
    let lo = boundaries[char_len / 4];
    let hi = boundaries[(char_len * 3 / 4).min(char_len - 1)];
    let in_window = |pos: usize| pos > 0 && pos < text.len() && pos >= lo && pos <= hi;

    let nearest = |candidates: Vec<usize>| {
        candidates
            .into_iter()
            .filter(|&p| in_window(p))
            .min_by_key(|&p| p.abs_diff(mid))
    };

    // Cut just after a newline run so the first half keeps its line break.
    let paragraph_breaks: Vec<usize> = text
        .char_indices()
        .filter(|&(_, c)| c == '\n')
        .map(|(i, _)| i + 1)
        .filter(|&p| !text[p..].starts_with('\n'))
        .collect();
    if let Some(p) = nearest(paragraph_breaks) {
        return p;
    }

    let sentence_ends: Vec<usize> = text
        .char_indices()
        .filter(|&(_, c)| SENTENCE_ENDS.contains(&c))
        .map(|(i, c)| i + c.len_utf8())
        .collect();
    if let Some(p) = nearest(sentence_ends) {
        return p;
    }

    mid
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paragraphs(n: usize, len: usize) -> String {
        (0..n)
            .map(|i| format!("{}{}", i, "x".repeat(len)))
            .collect::<Vec<_>>()
            .join("\n")
    }

    #[test]
    fn split_reconstructs_original() {
        let item = WorkItem::new("chunk3", paragraphs(8, 120));
        let (a, b) = split_item(&item, MIN_SPLIT_CHARS).unwrap();
        assert_eq!(format!("{}{}", a.content, b.content), item.content);
        assert!(a.char_len() < item.char_len());
        assert!(b.char_len() < item.char_len());
        assert_eq!(a.title, "chunk3-1");
        assert_eq!(b.title, "chunk3-2");
        assert_eq!(a.status, ItemStatus::Pending);
    }

    #[test]
    fn split_prefers_paragraph_break_near_middle() {
        let text = paragraphs(4, 200);
        let at = split_point(&text);
        assert!(text[..at].ends_with('\n'));
        // Second paragraph boundary is the middle one
        assert!(text[at..].starts_with('2'));
    }

    #[test]
    fn split_falls_back_to_sentence_end() {
        let text = format!("{}. {}", "a".repeat(300), "b".repeat(300));
        let at = split_point(&text);
        assert!(text[..at].ends_with('.'));
    }

    #[test]
    fn split_falls_back_to_midpoint() {
        let text = "z".repeat(1000);
        assert_eq!(split_point(&text), 500);
    }

    #[test]
    fn split_is_char_boundary_safe() {
        let text = "世界".repeat(400);
        let item = WorkItem::new("w", text.clone());
        let (a, b) = split_item(&item, MIN_SPLIT_CHARS).unwrap();
        assert_eq!(a.content.clone() + &b.content, text);
        assert_eq!(a.char_len(), 400);
    }

    #[test]
    fn split_refuses_items_below_floor() {
        let item = WorkItem::new("tiny", "short text");
        let err = split_item(&item, MIN_SPLIT_CHARS).unwrap_err();
        assert_eq!(err, SplitError::TooSmall { len: 10, min: 500 });
        assert!(err.to_string().starts_with("unsplittable"));
    }

    #[test]
    fn status_transitions() {
        let mut item = WorkItem::new("a", "b");
        item.mark_processing();
        assert!(item.is_in_flight());
        item.mark_failed("boom");
        assert_eq!(item.failure_reason.as_deref(), Some("boom"));
        item.mark_done(Worldbook::new());
        assert!(item.is_done());
        assert!(item.failure_reason.is_none());
        item.reset();
        assert_eq!(item.status, ItemStatus::Pending);
        assert!(item.result.is_none());
    }
}
