//! # River Search Store
//!
//! Contract of the search backend the river mirrors into, plus the small
//! persistent state built on top of it:
//!
//! - [`SearchBackend`]: bulk write, scrollable read, refresh, single-document
//!   access. Production deployments implement it against their document
//!   store; [`MemoryBackend`] is the in-process reference used by tests.
//! - [`WatermarkStore`]: per-project datetime properties (the incremental
//!   watermark) persisted as ordinary documents in a private index.

mod backend;
mod error;
mod memory;
mod watermark;

pub use backend::{BulkOp, DocumentRef, ScrollCursor, SearchBackend, SearchHit};
pub use error::{Result, SearchStoreError};
pub use memory::{MemoryBackend, StoredDocument};
pub use watermark::WatermarkStore;
