//! Backing store abstraction shared by the queue and the registry.
//!
//! Every piece of shared mutable state lives behind the [`Store`] trait, which
//! exposes only the primitives the rest of the crate needs:
//!
//! - list push and blocking pop with a timeout (the task queue)
//! - list length (queue depth)
//! - hash set / get-all (task and worker records)
//! - key scan by prefix and key delete (sweeps and registry scans)
//!
//! Two implementations are provided:
//!
//! - [`RedisStore`]: the production store
//! - [`MemoryStore`]: an in-process store with identical semantics, used for
//!   `memory://` URLs and tests
//!
//! # Example
//!
//! ```rust,ignore
//! use filter_fleet::store;
//!
//! let store = store::connect("redis://localhost:6379").await?;
//! store.push("image_tasks", "some-id").await?;
//! ```

pub mod memory;
pub mod redis_store;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;

/// URL scheme selecting the in-process store.
pub const MEMORY_SCHEME: &str = "memory://";

/// Errors raised by store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// The store rejected or failed a command.
    #[error("Store command failed: {0}")]
    Command(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_connection_dropped()
            || err.is_connection_refusal()
            || err.is_io_error()
            || err.is_timeout()
        {
            StoreError::Unavailable(err.to_string())
        } else {
            StoreError::Command(err.to_string())
        }
    }
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// The key-value primitives the fleet relies on.
///
/// Implementations must make `blocking_pop` an atomic arbitration point: a
/// value pushed once is returned to exactly one caller.
#[async_trait]
pub trait Store: Send + Sync {
    /// Checks that the store is reachable.
    async fn ping(&self) -> StoreResult<()>;

    /// Pushes a value onto the head of a list.
    async fn push(&self, list: &str, value: &str) -> StoreResult<()>;

    /// Pops a value from the tail of a list, waiting up to `timeout`.
    ///
    /// Returns `Ok(None)` when nothing arrived in time.
    async fn blocking_pop(&self, list: &str, timeout: Duration) -> StoreResult<Option<String>>;

    /// Returns the length of a list (zero when it does not exist).
    async fn list_len(&self, list: &str) -> StoreResult<usize>;

    /// Writes the given fields into a hash, creating it if needed.
    async fn hash_set(&self, key: &str, fields: &[(String, String)]) -> StoreResult<()>;

    /// Reads every field of a hash. Missing keys yield an empty map.
    async fn hash_get_all(&self, key: &str) -> StoreResult<HashMap<String, String>>;

    /// Lists every key starting with `prefix`.
    async fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<String>>;

    /// Deletes a key, returning whether it existed.
    async fn delete(&self, key: &str) -> StoreResult<bool>;
}

/// Shared handle to a store, cloned into every component.
pub type SharedStore = Arc<dyn Store>;

/// Opens a store from a URL.
///
/// `memory://` (optionally followed by a name, which is ignored) yields a fresh
/// [`MemoryStore`]; anything else is handed to the Redis client.
pub async fn connect(url: &str) -> StoreResult<SharedStore> {
    if url.starts_with(MEMORY_SCHEME) {
        tracing::debug!(url = url, "Using in-process memory store");
        return Ok(Arc::new(MemoryStore::new()));
    }

    let store = RedisStore::connect(url).await?;
    tracing::debug!(url = url, "Connected to Redis store");
    Ok(Arc::new(store))
}
