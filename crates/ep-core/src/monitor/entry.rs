//! Monitor-owned per-node state and its read-only snapshots.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};

use ep_config::Mode;
use serde::Serialize;

/// Mutable state for one node. Owned exclusively by the monitor; everything
/// else sees it through [`Snapshot`] copies or the member registry's weak
/// link.
#[derive(Debug)]
pub struct EntryHandle {
    tag: String,
    name: String,
    uri: String,
    listen_address: String,
    port: u16,
    mode: Mode,

    available: AtomicBool,
    initial_check_done: AtomicBool,
    blacklisted: AtomicBool,
    /// Milliseconds; −1 means never probed successfully.
    last_latency_ms: AtomicI64,
    failure_count: AtomicU32,
    active: AtomicI64,
}

impl EntryHandle {
    pub fn new(tag: String, name: String, uri: String, listen_address: String, port: u16, mode: Mode) -> Self {
        Self {
            tag,
            name,
            uri,
            listen_address,
            port,
            mode,
            available: AtomicBool::new(false),
            initial_check_done: AtomicBool::new(false),
            blacklisted: AtomicBool::new(false),
            last_latency_ms: AtomicI64::new(-1),
            failure_count: AtomicU32::new(0),
            active: AtomicI64::new(0),
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn record_failure(&self, cause: &str) {
        let count = self.failure_count.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::debug!(tag = %self.tag, cause, count, "node failure recorded");
    }

    pub fn record_success(&self) {
        self.failure_count.store(0, Ordering::Relaxed);
    }

    pub fn blacklist(&self) {
        self.blacklisted.store(true, Ordering::Relaxed);
        tracing::warn!(tag = %self.tag, name = %self.name, "node blacklisted");
    }

    pub fn clear_blacklist(&self) {
        if self.blacklisted.swap(false, Ordering::Relaxed) {
            tracing::info!(tag = %self.tag, name = %self.name, "node blacklist cleared");
        }
    }

    pub fn is_blacklisted(&self) -> bool {
        self.blacklisted.load(Ordering::Relaxed)
    }

    /// Record one probe round-trip. A success marks the node available and
    /// completes the initial check; a failure only toggles availability,
    /// keeping the last known latency.
    pub fn set_probe_result(&self, reachable: bool, latency_ms: i64) {
        if reachable {
            self.last_latency_ms.store(latency_ms, Ordering::Relaxed);
            self.initial_check_done.store(true, Ordering::Relaxed);
        }
        self.available.store(reachable, Ordering::Relaxed);
    }

    pub fn inc_active(&self) {
        self.active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_active(&self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            tag: self.tag.clone(),
            name: self.name.clone(),
            listen_address: self.listen_address.clone(),
            port: self.port,
            mode: self.mode,
            available: self.available.load(Ordering::Relaxed),
            initial_check_done: self.initial_check_done.load(Ordering::Relaxed),
            last_latency_ms: self.last_latency_ms.load(Ordering::Relaxed),
            failure_count: self.failure_count.load(Ordering::Relaxed),
            active_connections: self.active.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of a node; cheap to copy, safe to hold across awaits.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub tag: String,
    pub name: String,
    pub listen_address: String,
    pub port: u16,
    pub mode: Mode,
    pub available: bool,
    pub initial_check_done: bool,
    pub last_latency_ms: i64,
    pub failure_count: u32,
    pub active_connections: i64,
}

#[cfg(test)]
impl Snapshot {
    /// Test shorthand: a healthy snapshot with the given tag/name/latency.
    pub fn for_test(tag: &str, name: &str, latency_ms: i64) -> Self {
        Self {
            tag: tag.into(),
            name: name.into(),
            listen_address: "127.0.0.1".into(),
            port: 0,
            mode: Mode::MultiPort,
            available: true,
            initial_check_done: true,
            last_latency_ms: latency_ms,
            failure_count: 0,
            active_connections: 0,
        }
    }
}
