//! Tiered memory fabric.
//!
//! Four tiers behind one search surface:
//! - **core**: markdown files, always in prompt assembly;
//! - **recall**: relational rows, written through synchronously;
//! - **archival**: graph edges + vectors, derived asynchronously;
//! - **external**: on-demand file/URL content, chunked when referenced.
//!
//! Saves are write-through to recall with eventual archival derivation;
//! searches fan out to BM25, vector, and graph legs in parallel and fuse
//! the results. Pressure compresses old turns and demotes stale entries;
//! promotion mirrors hot archival entries back into recall.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

mod core_tier;
mod derive;
mod error;
mod extract;
mod fabric;
mod ranker;

pub use core_tier::CoreContext;
pub use derive::DerivationStatus;
pub use error::{MemoryError, MemoryResult};
pub use extract::{Extraction, extract_heuristic, query_terms};
pub use fabric::{FabricHealth, MemoryConfig, MemoryFabric, RankerWeights, RememberOptions};
pub use ranker::{RankedHit, fuse};
