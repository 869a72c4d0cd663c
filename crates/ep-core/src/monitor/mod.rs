//! Node supervisor: owns the entry handles, runs the probe loop and
//! publishes snapshots to every frontend.
//!
//! The probe loop dials the configured probe target *through* each node's
//! outbound connector, so a probe exercises the same path real traffic
//! takes. Probe failures and tunnel failures land in the same shared member
//! state; blacklisting converges both.

mod cache;
mod entry;

pub use cache::NodeCache;
pub use entry::{EntryHandle, Snapshot};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ep_config::{Mode, NodeConfig};
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::member::MemberRegistry;
use crate::outbound::{ConnectorFactory, OutboundConnector};

/// One probe round-trip may not outlive this.
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Stable node identity derived from the source URI (FNV-1a 64).
/// Tags survive reloads because the URI does.
pub fn tag_of(uri: &str) -> String {
    let mut h: u64 = 0xcbf2_9ce4_8422_2325;
    for b in uri.as_bytes() {
        h ^= u64::from(*b);
        h = h.wrapping_mul(0x100_0000_01b3);
    }
    format!("node-{h:016x}")
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub mode: Mode,
    /// `host:port` dialled through each node.
    pub probe_target: String,
    pub probe_interval: Duration,
    pub failure_threshold: u32,
    pub blacklist_duration: Duration,
    /// Address the per-node listeners bind to; published in snapshots.
    pub listen_address: String,
}

#[derive(Default)]
struct NodeSet {
    entries: Vec<Arc<EntryHandle>>,
    connectors: HashMap<String, Arc<dyn OutboundConnector>>,
    credentials: HashMap<String, (String, String)>,
}

pub struct Monitor {
    cfg: MonitorConfig,
    probe_target: RwLock<String>,
    registry: Arc<MemberRegistry>,
    nodes: RwLock<NodeSet>,
}

impl Monitor {
    pub fn new(registry: Arc<MemberRegistry>, cfg: MonitorConfig) -> Arc<Self> {
        Arc::new(Self {
            probe_target: RwLock::new(cfg.probe_target.clone()),
            cfg,
            registry,
            nodes: RwLock::new(NodeSet::default()),
        })
    }

    pub fn registry(&self) -> &Arc<MemberRegistry> {
        &self.registry
    }

    pub fn failure_threshold(&self) -> u32 {
        self.cfg.failure_threshold
    }

    pub fn blacklist_duration(&self) -> Duration {
        self.cfg.blacklist_duration
    }

    pub fn mode(&self) -> Mode {
        self.cfg.mode
    }

    pub fn probe_target(&self) -> String {
        self.probe_target.read().clone()
    }

    /// Settings updates apply to the next probe round.
    pub fn set_probe_target(&self, target: String) {
        *self.probe_target.write() = target;
    }

    /// Build one entry handle per configured node, in config order, and wire
    /// each into the member registry. Replaces any previous set (reload).
    pub fn install_nodes(&self, nodes: &[NodeConfig], factory: &dyn ConnectorFactory) {
        let mut set = NodeSet::default();
        for node in nodes {
            let tag = tag_of(node.node_key());
            let entry = Arc::new(EntryHandle::new(
                tag.clone(),
                node.name.clone(),
                node.uri.clone(),
                self.cfg.listen_address.clone(),
                node.port,
                self.cfg.mode,
            ));
            self.registry.acquire(&tag).attach_entry(&entry);

            match factory.create(node) {
                Ok(conn) => {
                    set.connectors.insert(tag.clone(), conn);
                }
                Err(e) => {
                    tracing::warn!(tag = %tag, name = %node.name, error = %e,
                        "no outbound connector for node; it will stay unavailable");
                }
            }
            set.credentials
                .insert(tag, (node.username.clone(), node.password.clone()));
            set.entries.push(entry);
        }
        let count = set.entries.len();
        *self.nodes.write() = set;
        tracing::info!(nodes = count, mode = %self.cfg.mode.as_str(), "monitor installed node set");
    }

    pub fn entries(&self) -> Vec<Arc<EntryHandle>> {
        self.nodes.read().entries.clone()
    }

    pub fn entry(&self, tag: &str) -> Option<Arc<EntryHandle>> {
        self.nodes
            .read()
            .entries
            .iter()
            .find(|e| e.tag() == tag)
            .cloned()
    }

    pub fn connector(&self, tag: &str) -> Option<Arc<dyn OutboundConnector>> {
        self.nodes.read().connectors.get(tag).cloned()
    }

    /// The node's listener credentials (multi-port auth).
    pub fn node_credentials(&self, tag: &str) -> Option<(String, String)> {
        self.nodes.read().credentials.get(tag).cloned()
    }

    /// All nodes, config order.
    pub fn snapshot(&self) -> Vec<Snapshot> {
        self.nodes.read().entries.iter().map(|e| e.snapshot()).collect()
    }

    /// Healthy nodes only: drops blacklisted tags (triggering lazy expiry),
    /// nodes that never passed their first probe, and unavailable nodes.
    pub fn snapshot_filtered(&self, only_healthy: bool) -> Vec<Snapshot> {
        if !only_healthy {
            return self.snapshot();
        }
        let now = Instant::now();
        let entries = self.entries();
        let mut out = Vec::with_capacity(entries.len());
        for entry in entries {
            if self.registry.is_blacklisted(entry.tag(), now) {
                continue;
            }
            let snap = entry.snapshot();
            if !snap.initial_check_done || !snap.available {
                continue;
            }
            out.push(snap);
        }
        out
    }

    /// Periodic probe loop; one concurrent probe task per node per tick.
    pub fn spawn_probe_loop(
        self: &Arc<Self>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(monitor.cfg.probe_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => monitor.probe_all(),
                    _ = shutdown.recv() => {
                        tracing::debug!("probe loop stopping");
                        return;
                    }
                }
            }
        })
    }

    fn probe_all(self: &Arc<Self>) {
        let target = self.probe_target();
        let Some((host, port)) = split_host_port(&target) else {
            tracing::warn!(probe_target = %target, "invalid probe target, skipping probe round");
            return;
        };
        for entry in self.entries() {
            let Some(connector) = self.connector(entry.tag()) else {
                continue;
            };
            let state = self.registry.acquire(entry.tag());
            let host = host.clone();
            let threshold = self.cfg.failure_threshold;
            let duration = self.cfg.blacklist_duration;
            tokio::spawn(async move {
                let t0 = Instant::now();
                let result =
                    tokio::time::timeout(PROBE_TIMEOUT, connector.connect(&host, port)).await;
                match result {
                    Ok(Ok(_stream)) => {
                        let ms = t0.elapsed().as_millis() as i64;
                        entry.set_probe_result(true, ms);
                        state.record_success();
                        tracing::trace!(tag = %entry.tag(), latency_ms = ms, "probe ok");
                    }
                    Ok(Err(e)) => {
                        entry.set_probe_result(false, -1);
                        state.record_failure("probe", threshold, duration);
                        tracing::debug!(tag = %entry.tag(), error = %e, "probe failed");
                    }
                    Err(_) => {
                        entry.set_probe_result(false, -1);
                        state.record_failure("probe timeout", threshold, duration);
                        tracing::debug!(tag = %entry.tag(), "probe timed out");
                    }
                }
            });
        }
    }
}

/// Count how many of `nodes` can reach `probe_target` through a fresh
/// connector within `timeout`; the subscription-refresh gate.
pub async fn count_reachable(
    nodes: &[NodeConfig],
    factory: &dyn ConnectorFactory,
    probe_target: &str,
    timeout: Duration,
) -> usize {
    let Some((host, port)) = split_host_port(probe_target) else {
        return 0;
    };
    let mut set = tokio::task::JoinSet::new();
    for node in nodes {
        let Ok(connector) = factory.create(node) else {
            continue;
        };
        let host = host.clone();
        set.spawn(async move {
            tokio::time::timeout(PROBE_TIMEOUT, connector.connect(&host, port))
                .await
                .map_or(false, |r| r.is_ok())
        });
    }
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);
    let mut reachable = 0;
    loop {
        tokio::select! {
            joined = set.join_next() => match joined {
                Some(Ok(true)) => reachable += 1,
                Some(_) => {}
                None => break,
            },
            _ = &mut deadline => break,
        }
    }
    reachable
}

fn split_host_port(target: &str) -> Option<(String, u16)> {
    let (host, port) = target.rsplit_once(':')?;
    let port = port.parse().ok()?;
    if host.is_empty() {
        return None;
    }
    Some((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbound::FnConnectorFactory;

    fn test_monitor(names: &[&str]) -> Arc<Monitor> {
        let monitor = Monitor::new(
            Arc::new(MemberRegistry::new()),
            MonitorConfig {
                mode: Mode::MultiPort,
                probe_target: "example.com:80".into(),
                probe_interval: Duration::from_secs(3600),
                failure_threshold: 3,
                blacklist_duration: Duration::from_secs(60),
                listen_address: "127.0.0.1".into(),
            },
        );
        let nodes: Vec<NodeConfig> = names
            .iter()
            .map(|n| NodeConfig {
                name: (*n).to_string(),
                uri: format!("ss://{n}@h:1#{n}"),
                ..NodeConfig::default()
            })
            .collect();
        let factory = FnConnectorFactory(
            |_: &NodeConfig| -> anyhow::Result<Arc<dyn OutboundConnector>> {
                anyhow::bail!("no transports in this test")
            },
        );
        monitor.install_nodes(&nodes, &factory);
        monitor
    }

    #[test]
    fn filtered_snapshot_excludes_unchecked_unavailable_and_blacklisted() {
        let monitor = test_monitor(&["checked", "down", "fresh", "listed"]);
        let entries = monitor.entries();
        entries[0].set_probe_result(true, 20);
        entries[1].set_probe_result(true, 20);
        entries[1].set_probe_result(false, -1); // checked once, now down
        // entries[2] never probed
        entries[3].set_probe_result(true, 20);
        monitor.registry().acquire(entries[3].tag()).record_failure(
            "t",
            1,
            Duration::from_secs(60),
        );

        let names: Vec<String> = monitor
            .snapshot_filtered(true)
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names, ["checked"]);
        // unfiltered view keeps config order and everything in it
        assert_eq!(monitor.snapshot_filtered(false).len(), 4);
        assert_eq!(monitor.snapshot()[2].name, "fresh");
    }

    #[test]
    fn tags_are_stable_and_distinct() {
        let a = tag_of("ss://a@h:1#a");
        assert_eq!(a, tag_of("ss://a@h:1#a"));
        assert_ne!(a, tag_of("ss://b@h:2#b"));
        assert!(a.starts_with("node-"));
    }

    #[test]
    fn split_host_port_parses() {
        assert_eq!(
            split_host_port("www.apple.com:80"),
            Some(("www.apple.com".into(), 80))
        );
        assert_eq!(split_host_port("plainhost"), None);
        assert_eq!(split_host_port(":80"), None);
    }
}
