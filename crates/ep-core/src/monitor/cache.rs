//! TTL-bounded snapshot cache.
//!
//! Virtual pools read their candidate set on every connection; recomputing
//! the filter each time would walk all nodes per request. One writer
//! refreshes, many readers copy out.

use std::time::{Duration, Instant};

use parking_lot::RwLock;

use super::Snapshot;

#[derive(Default)]
struct CacheInner {
    nodes: Vec<Snapshot>,
    last_update: Option<Instant>,
}

pub struct NodeCache {
    inner: RwLock<CacheInner>,
    ttl: Duration,
}

impl NodeCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: RwLock::new(CacheInner::default()),
            ttl,
        }
    }

    /// The cached slice, or `None` when stale (the caller refreshes).
    pub fn get(&self) -> Option<Vec<Snapshot>> {
        let inner = self.inner.read();
        let fresh = inner
            .last_update
            .is_some_and(|at| at.elapsed() <= self.ttl);
        fresh.then(|| inner.nodes.clone())
    }

    pub fn update(&self, nodes: Vec<Snapshot>) {
        let mut inner = self.inner.write();
        inner.nodes = nodes;
        inner.last_update = Some(Instant::now());
    }

    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.nodes.clear();
        inner.last_update = None;
    }
}
