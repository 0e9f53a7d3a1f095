//! Naive paragraph chunker for building the initial queue
//!
//! Packs whole paragraphs into chunks of at most `max_chars` characters. A
//! single paragraph longer than that becomes its own chunk; the pipeline
//! splits it further if the provider overflows.

use crate::pipeline::WorkItem;

pub const DEFAULT_CHUNK_CHARS: usize = 8_000;

/// Split `text` into work items titled `chunk1`, `chunk2`, ...
pub fn split_text(text: &str, max_chars: usize) -> Vec<WorkItem> {
    let max_chars = max_chars.max(1);
    let mut chunks: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;

    for paragraph in text.split("\n\n").map(str::trim).filter(|p| !p.is_empty()) {
        let len = paragraph.chars().count();
        if current_len > 0 && current_len + 2 + len > max_chars {
            chunks.push(std::mem::take(&mut current));
            current_len = 0;
        }
        if current_len > 0 {
            current.push_str("\n\n");
            current_len += 2;
        }
        current.push_str(paragraph);
        current_len += len;
    }
    if !current.is_empty() {
        chunks.push(current);
    }

    chunks
        .into_iter()
        .enumerate()
        .map(|(i, content)| WorkItem::new(format!("chunk{}", i + 1), content))
        .collect()
}
