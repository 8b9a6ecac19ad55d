//! `SurrealDB` connection handle.
//!
//! One embedded connection backs the relational, graph, vector, and task
//! adapters. `SurrealKV` persists under `data/memory/`; the in-memory
//! engine serves tests.

use crate::error::{StoreError, StoreResult};

/// `SurrealDB` engine wrapper shared by the adapters.
#[derive(Clone)]
pub struct Database {
    inner: surrealdb::Surreal<surrealdb::engine::any::Any>,
}

impl Database {
    /// Connect to an embedded `SurrealDB` with `SurrealKV` storage rooted
    /// at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Connection`] if the connection fails.
    pub async fn connect_embedded(path: &str) -> StoreResult<Self> {
        Self::connect(&format!("surrealkv://{path}"), "main").await
    }

    /// Connect to an in-memory `SurrealDB` (tests, throwaway runs).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Connection`] if the connection fails.
    pub async fn connect_memory() -> StoreResult<Self> {
        Self::connect("mem://", "test").await
    }

    async fn connect(endpoint: &str, db: &str) -> StoreResult<Self> {
        let conn: surrealdb::Surreal<surrealdb::engine::any::Any> = surrealdb::Surreal::init();
        conn.connect(endpoint)
            .await
            .map_err(|e: surrealdb::Error| StoreError::Connection(e.to_string()))?;
        conn.use_ns("itak")
            .use_db(db)
            .await
            .map_err(|e: surrealdb::Error| StoreError::Connection(e.to_string()))?;
        Ok(Self { inner: conn })
    }

    /// The underlying client, for the adapters in this crate.
    pub(crate) fn client(&self) -> &surrealdb::Surreal<surrealdb::engine::any::Any> {
        &self.inner
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}
