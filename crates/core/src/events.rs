//! Cursor bookkeeping for activity consumers.
//!
//! Every open SSE stream registers the id it has read up to. The pruning
//! task uses the minimum as a floor so no stream ever observes a gap
//! because of retention.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Clone, Default)]
pub struct CursorRegistry {
    inner: Arc<Mutex<HashMap<u64, i64>>>,
    next: Arc<AtomicU64>,
}

impl CursorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a consumer starting at `cursor`. Dropping the guard
    /// unregisters it.
    pub fn register(&self, cursor: i64) -> CursorGuard {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        self.inner.lock().unwrap().insert(id, cursor);
        CursorGuard {
            registry: self.clone(),
            id,
        }
    }

    /// The lowest cursor any live consumer still needs, if any.
    pub fn floor(&self) -> Option<i64> {
        self.inner.lock().unwrap().values().min().copied()
    }

    fn advance(&self, id: u64, cursor: i64) {
        if let Some(entry) = self.inner.lock().unwrap().get_mut(&id) {
            if cursor > *entry {
                *entry = cursor;
            }
        }
    }

    fn remove(&self, id: u64) {
        self.inner.lock().unwrap().remove(&id);
    }
}

pub struct CursorGuard {
    registry: CursorRegistry,
    id: u64,
}

impl CursorGuard {
    pub fn advance(&self, cursor: i64) {
        self.registry.advance(self.id, cursor);
    }
}

impl Drop for CursorGuard {
    fn drop(&mut self) {
        self.registry.remove(self.id);
    }
}
