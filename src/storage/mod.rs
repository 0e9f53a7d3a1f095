//! Storage backends for the pipeline
//!
//! The scheduler and accumulator persist through the `StateStore` trait.
//! The primary implementation is `SqliteStateStore`.

mod sqlite;
mod traits;

pub use sqlite::SqliteStateStore;
pub use traits::{OpenStore, RollResult, StateStore, StorageError, StorageResult};
