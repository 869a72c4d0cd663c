//! Virtual pools: regex-filtered slices of the node set, each exposed on
//! its own port with its own selection strategy.
//!
//! A virtual pool never dials upstream transports itself. It chains a
//! CONNECT through the selected node's *multi-port listener*, so
//! failure/success/active bookkeeping happens exactly once per traffic
//! connection, in the multi-port frontend. Keep that layering.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use ep_config::{Mode, MultiPortConfig, VirtualPoolConfig};
use parking_lot::RwLock;
use regex::Regex;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::inbound::http::{
    authorized, read_request, relay, write_response, CLIENT_READ_TIMEOUT,
};
use crate::monitor::{Monitor, NodeCache, Snapshot};
use crate::select::{Selector, Strategy, WeightParams};

/// Candidate sets are recomputed at most this often.
const CACHE_TTL: Duration = Duration::from_secs(30);
/// Dial bound for the hop to the node's multi-port listener.
const CHAIN_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub name: String,
    pub regular: String,
    pub address: String,
    pub port: u16,
    pub strategy: String,
    pub max_latency_ms: u64,
    pub node_count: usize,
    pub running: bool,
}

pub struct VirtualPool {
    cfg: VirtualPoolConfig,
    multi_port: MultiPortConfig,
    /// Whether the chained CONNECT needs the global multi-port credentials.
    chain_auth: bool,
    regex: Regex,
    strategy: Strategy,
    selector: Selector,
    monitor: Arc<Monitor>,
    cache: NodeCache,
    running: AtomicBool,
}

impl VirtualPool {
    pub fn new(
        cfg: VirtualPoolConfig,
        monitor: Arc<Monitor>,
        multi_port: MultiPortConfig,
        mode: Mode,
    ) -> anyhow::Result<Arc<Self>> {
        let regex = Regex::new(&cfg.regular)
            .map_err(|e| anyhow::anyhow!("compile regex for pool {:?}: {e}", cfg.name))?;
        let strategy: Strategy = cfg
            .strategy
            .parse()
            .map_err(|e| anyhow::anyhow!("pool {:?}: {e}", cfg.name))?;
        Ok(Arc::new(Self {
            chain_auth: mode.has_node_listeners(),
            cfg,
            multi_port,
            regex,
            strategy,
            selector: Selector::new(),
            monitor,
            cache: NodeCache::new(CACHE_TTL),
            running: AtomicBool::new(false),
        }))
    }

    pub fn name(&self) -> &str {
        &self.cfg.name
    }

    pub fn status(&self) -> PoolStatus {
        PoolStatus {
            name: self.cfg.name.clone(),
            regular: self.cfg.regular.clone(),
            address: self.cfg.address.clone(),
            port: self.cfg.port,
            strategy: self.strategy.as_str().to_string(),
            max_latency_ms: self.cfg.max_latency_ms,
            node_count: self.matching_nodes().len(),
            running: self.running.load(Ordering::Relaxed),
        }
    }

    /// Candidate slice, TTL-cached. A stale or empty cache refreshes on
    /// the spot; the run loop also refreshes on a ticker.
    pub fn matching_nodes(&self) -> Vec<Snapshot> {
        if let Some(cached) = self.cache.get() {
            if !cached.is_empty() {
                return cached;
            }
        }
        self.refresh_cache();
        self.cache.get().unwrap_or_default()
    }

    /// Healthy ∧ regex-matched ∧ within the latency bound (when set and the
    /// node has a positive measurement).
    fn refresh_cache(&self) {
        let matched: Vec<Snapshot> = self
            .monitor
            .snapshot_filtered(true)
            .into_iter()
            .filter(|node| self.regex.is_match(&node.name))
            .filter(|node| {
                self.cfg.max_latency_ms == 0
                    || node.last_latency_ms <= 0
                    || node.last_latency_ms as u64 <= self.cfg.max_latency_ms
            })
            .collect();
        self.cache.update(matched);
    }

    pub(crate) async fn run(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        self.running.store(true, Ordering::Relaxed);
        self.refresh_cache();
        let mut ticker = tokio::time::interval(CACHE_TTL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // immediate first tick, cache is already warm

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let pool = Arc::clone(&self);
                        tokio::spawn(async move { pool.handle(stream, peer).await });
                    }
                    Err(e) => {
                        tracing::error!(pool = %self.cfg.name, error = %e, "virtual pool accept error");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                _ = ticker.tick() => self.refresh_cache(),
                _ = shutdown.recv() => {
                    self.running.store(false, Ordering::Relaxed);
                    tracing::info!(pool = %self.cfg.name, "virtual pool stopped");
                    return;
                }
            }
        }
    }

    async fn handle(&self, mut client: TcpStream, peer: SocketAddr) {
        let req = match read_request(&mut client, CLIENT_READ_TIMEOUT).await {
            Ok(req) => req,
            Err(e) => {
                tracing::debug!(pool = %self.cfg.name, %peer, error = %e, "read request failed");
                return;
            }
        };

        if (!self.cfg.username.is_empty() || !self.cfg.password.is_empty())
            && !authorized(&req, &self.cfg.username, &self.cfg.password)
        {
            let _ = write_response(
                &mut client,
                "407 Proxy Authentication Required",
                &[("Proxy-Authenticate", "Basic realm=\"Virtual Pool\"")],
            )
            .await;
            return;
        }

        let (host, port) = match req.host_port() {
            Ok(target) => target,
            Err(_) => {
                let _ = write_response(&mut client, "400 Bad Request", &[]).await;
                return;
            }
        };

        let nodes = self.matching_nodes();
        let selected = self
            .selector
            .select(self.strategy, &nodes, &WeightParams::default(), false)
            .cloned();
        let Some(selected) = selected else {
            tracing::warn!(pool = %self.cfg.name, "no candidate nodes");
            let _ = write_response(&mut client, "503 Service Unavailable", &[]).await;
            return;
        };
        tracing::debug!(
            pool = %self.cfg.name,
            node = %selected.name,
            node_port = selected.port,
            strategy = self.strategy.as_str(),
            candidates = nodes.len(),
            "virtual pool dispatch"
        );

        let upstream = match self.chain_connect(&selected, &host, port).await {
            Ok(stream) => stream,
            Err(ChainError::Dial(e)) => {
                tracing::warn!(pool = %self.cfg.name, node = %selected.name, error = %e, "chain dial failed");
                let _ = write_response(&mut client, "502 Bad Gateway", &[]).await;
                return;
            }
            Err(ChainError::Status(code, reason)) => {
                tracing::warn!(pool = %self.cfg.name, node = %selected.name, code, "upstream refused tunnel");
                let _ = write_response(&mut client, &format!("{code} {reason}"), &[]).await;
                return;
            }
        };

        if write_response(&mut client, "200 Connection Established", &[])
            .await
            .is_err()
        {
            return;
        }

        let initial = if req.is_connect() {
            req.buffered.clone()
        } else {
            // forward request travels through the established tunnel
            let Ok(mut head) = req.serialize_origin_form() else {
                return;
            };
            head.extend_from_slice(&req.buffered);
            head
        };
        let _ = relay(client, upstream, &initial).await;
    }

    /// Open a tunnel to `host:port` via the node's multi-port listener.
    async fn chain_connect(
        &self,
        node: &Snapshot,
        host: &str,
        port: u16,
    ) -> Result<TcpStream, ChainError> {
        let proxy_addr = format!("{}:{}", self.proxy_host(node), node.port);
        let mut upstream = tokio::time::timeout(
            CHAIN_DIAL_TIMEOUT,
            TcpStream::connect(proxy_addr.as_str()),
        )
        .await
        .map_err(|_| ChainError::Dial(io::Error::new(io::ErrorKind::TimedOut, "chain dial")))?
        .map_err(ChainError::Dial)?;

        let mut connect = format!("CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n");
        if self.chain_auth && !self.multi_port.username.is_empty() {
            let token = STANDARD.encode(format!(
                "{}:{}",
                self.multi_port.username, self.multi_port.password
            ));
            connect.push_str(&format!("Proxy-Authorization: Basic {token}\r\n"));
        }
        connect.push_str("\r\n");
        upstream
            .write_all(connect.as_bytes())
            .await
            .map_err(ChainError::Dial)?;

        let (code, reason) = read_status(&mut upstream).await.map_err(ChainError::Dial)?;
        if code != 200 {
            return Err(ChainError::Status(code, reason));
        }
        Ok(upstream)
    }

    /// Host for the chained hop: the node's listen address when concrete,
    /// else the multi-port bind address, else loopback.
    fn proxy_host(&self, node: &Snapshot) -> String {
        for candidate in [&node.listen_address, &self.multi_port.address] {
            if !candidate.is_empty() && candidate != "0.0.0.0" {
                return candidate.clone();
            }
        }
        "127.0.0.1".to_string()
    }
}

enum ChainError {
    Dial(io::Error),
    Status(u16, String),
}

/// Read the upstream response head, returning status code and reason.
async fn read_status(stream: &mut TcpStream) -> io::Result<(u16, String)> {
    let mut reader = BufReader::new(stream);
    let mut status_line = String::new();
    reader.read_line(&mut status_line).await?;
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).await?;
        if line.trim().is_empty() {
            break;
        }
    }
    let mut parts = status_line.split_whitespace();
    let _version = parts.next();
    let code = parts
        .next()
        .and_then(|c| c.parse::<u16>().ok())
        .ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "bad upstream status line")
        })?;
    let reason = parts.collect::<Vec<_>>().join(" ");
    let reason = if reason.is_empty() {
        "Bad Gateway".to_string()
    } else {
        reason
    };
    Ok((code, reason))
}

pub struct VirtualPoolManager {
    pools: RwLock<Vec<Arc<VirtualPool>>>,
    handles: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl VirtualPoolManager {
    /// Bind and start every configured pool; any bind or regex error fails
    /// startup as a whole.
    pub async fn start(
        configs: &[VirtualPoolConfig],
        monitor: Arc<Monitor>,
        multi_port: MultiPortConfig,
        mode: Mode,
        shutdown: &broadcast::Sender<()>,
    ) -> anyhow::Result<Arc<Self>> {
        let manager = Arc::new(Self {
            pools: RwLock::new(Vec::new()),
            handles: parking_lot::Mutex::new(Vec::new()),
        });
        for cfg in configs {
            let name = cfg.name.clone();
            let addr = format!("{}:{}", cfg.address, cfg.port);
            let pool = VirtualPool::new(
                cfg.clone(),
                Arc::clone(&monitor),
                multi_port.clone(),
                mode,
            )?;
            let listener = TcpListener::bind(addr.as_str())
                .await
                .map_err(|e| anyhow::anyhow!("virtual pool {name:?} listen on {addr}: {e}"))?;
            tracing::info!(
                pool = %name,
                %addr,
                strategy = %cfg.strategy,
                nodes = pool.matching_nodes().len(),
                "virtual pool started"
            );
            let handle = tokio::spawn(Arc::clone(&pool).run(listener, shutdown.subscribe()));
            manager.handles.lock().push(handle);
            manager.pools.write().push(pool);
        }
        Ok(manager)
    }

    pub fn pool(&self, name: &str) -> Option<Arc<VirtualPool>> {
        self.pools.read().iter().find(|p| p.name() == name).cloned()
    }

    pub fn status(&self) -> Vec<PoolStatus> {
        self.pools.read().iter().map(|p| p.status()).collect()
    }

    pub fn pool_count(&self) -> usize {
        self.pools.read().len()
    }
}
