//! Store adapter contracts for the memory fabric.
//!
//! Three abstract stores back the recall and archival tiers:
//! - **Relational**: keyed CRUD over memory entries plus text candidates.
//! - **Graph**: typed entity edges with bounded traversal.
//! - **Vector**: embeddings with cosine top-k.
//!
//! Each adapter reports its own health; the fabric tolerates any subset
//! being unavailable and keeps serving reads from the remaining tiers.
//! `SurrealDB` backs all three in production (embedded `SurrealKV`, or the
//! in-memory engine for tests); pure in-memory implementations exist for
//! unit tests and degraded deployments.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

mod db;
mod error;
mod mem;
mod surreal;
mod traits;

pub use db::Database;
pub use error::{StoreError, StoreResult};
pub use mem::{MemGraphStore, MemRelationalStore, MemTaskStore, MemVectorStore};
pub use surreal::{SurrealGraphStore, SurrealRelationalStore, SurrealTaskStore, SurrealVectorStore};
pub use traits::{
    GraphStore, RelationalStore, ScoredPoint, StoreHealth, TaskStore, VectorStore,
};

/// Content hash used for the fabric's dedup window and for graph edge keys.
#[must_use]
pub fn content_hash(text: &str) -> String {
    blake3::hash(text.trim().to_lowercase().as_bytes())
        .to_hex()
        .to_string()
}
