//! The worldbook data model and the accumulator that builds it
//!
//! A worldbook maps category → entry name → {keywords, content}. Each item's
//! parsed response is itself a worldbook (a delta); the `Accumulator` folds
//! deltas into the running result and keeps a history of every merge.

mod accumulator;
mod diff;
mod export;
mod history;
mod parse;
mod types;

pub use accumulator::{Accumulator, MergeMode};
pub use diff::{diff_worldbooks, ChangeKind, EntryChange};
pub use export::{export, to_entries_document, EntriesDocument, ExportFormat, ExportedEntry};
pub use history::{HistoryPolicy, HistoryRecord};
pub use parse::{parse_response, parse_response_with_stage, ParseError, ParseStage};
pub use types::{Entry, Worldbook, CONTENT_SEPARATOR};
