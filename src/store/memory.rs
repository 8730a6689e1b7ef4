//! In-process implementation of the [`Store`] trait.
//!
//! Mirrors the Redis semantics the fleet depends on: lists are pushed at the
//! head and popped from the tail, blocking pops park until a push wakes them or
//! the timeout expires, and each pushed value is handed to exactly one popper.
//!
//! The store can be taken "offline" to exercise store-unavailable paths.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{Store, StoreError, StoreResult};

#[derive(Debug)]
enum Entry {
    List(VecDeque<String>),
    Hash(HashMap<String, String>),
}

/// Store kept entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, Entry>>,
    pushed: Notify,
    offline: AtomicBool,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates losing (or regaining) the connection to the store.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Drops every key, like `FLUSHDB`.
    pub fn flush(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_online(&self) -> StoreResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(
                "memory store is offline".to_string(),
            ));
        }
        Ok(())
    }

    fn wrong_type(key: &str) -> StoreError {
        StoreError::Command(format!(
            "WRONGTYPE operation against key '{}' holding the wrong kind of value",
            key
        ))
    }

    fn try_pop(&self, list: &str) -> StoreResult<Option<String>> {
        let mut entries = self.lock();
        let (value, now_empty) = match entries.get_mut(list) {
            None => return Ok(None),
            Some(Entry::List(items)) => {
                let value = items.pop_back();
                (value, items.is_empty())
            }
            Some(Entry::Hash(_)) => return Err(Self::wrong_type(list)),
        };
        // Redis removes lists once they become empty.
        if now_empty {
            entries.remove(list);
        }
        Ok(value)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn ping(&self) -> StoreResult<()> {
        self.check_online()
    }

    async fn push(&self, list: &str, value: &str) -> StoreResult<()> {
        self.check_online()?;
        {
            let mut entries = self.lock();
            match entries
                .entry(list.to_string())
                .or_insert_with(|| Entry::List(VecDeque::new()))
            {
                Entry::List(items) => items.push_front(value.to_string()),
                Entry::Hash(_) => return Err(Self::wrong_type(list)),
            }
        }
        self.pushed.notify_waiters();
        Ok(())
    }

    async fn blocking_pop(&self, list: &str, timeout: Duration) -> StoreResult<Option<String>> {
        let deadline = Instant::now() + timeout;

        loop {
            self.check_online()?;

            // Register interest before checking so a push between the check
            // and the await is not missed.
            let notified = self.pushed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(value) = self.try_pop(list)? {
                return Ok(Some(value));
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.try_pop(list);
            }
        }
    }

    async fn list_len(&self, list: &str) -> StoreResult<usize> {
        self.check_online()?;
        match self.lock().get(list) {
            None => Ok(0),
            Some(Entry::List(items)) => Ok(items.len()),
            Some(Entry::Hash(_)) => Err(Self::wrong_type(list)),
        }
    }

    async fn hash_set(&self, key: &str, fields: &[(String, String)]) -> StoreResult<()> {
        self.check_online()?;
        if fields.is_empty() {
            return Ok(());
        }
        let mut entries = self.lock();
        match entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::Hash(HashMap::new()))
        {
            Entry::Hash(hash) => {
                for (field, value) in fields {
                    hash.insert(field.clone(), value.clone());
                }
                Ok(())
            }
            Entry::List(_) => Err(Self::wrong_type(key)),
        }
    }

    async fn hash_get_all(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        self.check_online()?;
        match self.lock().get(key) {
            None => Ok(HashMap::new()),
            Some(Entry::Hash(hash)) => Ok(hash.clone()),
            Some(Entry::List(_)) => Err(Self::wrong_type(key)),
        }
    }

    async fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        self.check_online()?;
        Ok(self
            .lock()
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        self.check_online()?;
        Ok(self.lock().remove(key).is_some())
    }
}
