//! Memoized range-query responses.
//!
//! [`QueryCache::get_or_compute`] hands out `Arc`s: two lookups with equal
//! keys and no write to the session in between return the same allocation
//! (`Arc::ptr_eq`). Keys are structural; a different `end` is a different
//! entry even when the computed contents are equal. Any write to a session
//! drops every entry of that session.

use std::{
    any::Any,
    collections::{hash_map::Entry, HashMap},
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;
use serde::Serialize;

use crate::models::{RecordKind, SessionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum QueryKind {
    Records(RecordKind),
    ThreadActivity,
    LiveAllocations,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryKey {
    pub session_id: SessionId,
    pub kind: QueryKind,
    pub start: i64,
    pub end: i64,
}

impl QueryKey {
    pub fn new(session_id: SessionId, kind: QueryKind, start: i64, end: i64) -> Self {
        Self {
            session_id,
            kind,
            start,
            end,
        }
    }
}

type CachedValue = Arc<dyn Any + Send + Sync>;

#[derive(Default)]
struct CacheState {
    entries: HashMap<QueryKey, CachedValue>,
    /// Bumped on every invalidation; a computation that started under an
    /// older generation is returned but not stored.
    generations: HashMap<SessionId, u64>,
}

impl CacheState {
    fn generation(&self, session_id: SessionId) -> u64 {
        self.generations.get(&session_id).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

#[derive(Default)]
pub struct QueryCache {
    state: Mutex<CacheState>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl QueryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lookup<T: Send + Sync + 'static>(&self, key: &QueryKey) -> (Option<Arc<T>>, u64) {
        let state = self.state.lock();
        let hit = state
            .entries
            .get(key)
            .and_then(|value| Arc::clone(value).downcast::<T>().ok());
        (hit, state.generation(key.session_id))
    }

    /// Return the cached response for `key`, or run `compute` and cache its
    /// result. Errors are returned as-is and never cached.
    pub async fn get_or_compute<T, E, F, Fut>(&self, key: QueryKey, compute: F) -> Result<Arc<T>, E>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let (hit, generation) = self.lookup::<T>(&key);
        if let Some(hit) = hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(hit);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let computed = Arc::new(compute().await?);

        let mut state = self.state.lock();
        if state.generation(key.session_id) != generation {
            return Ok(computed);
        }

        match state.entries.entry(key) {
            // Another caller computed the same key concurrently; keep theirs
            // so both observe one instance.
            Entry::Occupied(mut occupied) => {
                match Arc::clone(occupied.get()).downcast::<T>() {
                    Ok(existing) => Ok(existing),
                    Err(_) => {
                        occupied.insert(computed.clone());
                        Ok(computed)
                    }
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(computed.clone());
                Ok(computed)
            }
        }
    }

    /// Drop every entry for the session. Returns how many were dropped.
    pub fn invalidate_session(&self, session_id: SessionId) -> usize {
        let mut state = self.state.lock();
        *state.generations.entry(session_id).or_insert(0) += 1;
        let before = state.entries.len();
        state.entries.retain(|key, _| key.session_id != session_id);
        before - state.entries.len()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.state.lock().entries.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}
