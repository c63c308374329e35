//! Vector index lifecycle.
//!
//! - `vectors`: the in-memory index and exact nearest-neighbour search
//! - `storage`: the per-taxonomy directory format
//! - `store`: cache + disk tiers with copy-on-write publication

pub mod storage;
pub mod store;
pub mod vectors;

pub use storage::{IndexDirectory, IndexStorageError};
pub use store::{validate_taxonomy_name, IndexStats, IndexStore};
pub use vectors::{EntryMeta, IndexError, IndexedDocument, VectorIndex};
