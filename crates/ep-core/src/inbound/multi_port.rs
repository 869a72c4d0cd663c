//! Multi-port frontend: one listener per node, dispatch without selection.
//!
//! The node behind each port is fixed, but shared member state is still
//! consulted and updated, so a blacklist earned through pool traffic or
//! probes refuses multi-port connections too.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::inbound::http::{authorized, read_request, write_response, CLIENT_READ_TIMEOUT};
use crate::inbound::{run_tunnel, REALM_HEADER};
use crate::monitor::Monitor;

struct NodeListener {
    port: u16,
    handle: JoinHandle<()>,
}

pub struct MultiPortManager {
    monitor: Arc<Monitor>,
    bind_address: String,
    listeners: Mutex<HashMap<String, NodeListener>>,
    shutdown: broadcast::Sender<()>,
}

impl MultiPortManager {
    pub fn new(
        monitor: Arc<Monitor>,
        bind_address: String,
        shutdown: broadcast::Sender<()>,
    ) -> Arc<Self> {
        Arc::new(Self {
            monitor,
            bind_address,
            listeners: Mutex::new(HashMap::new()),
            shutdown,
        })
    }

    /// Reconcile listeners with the monitor's current node set: start
    /// missing ones, retire listeners whose node is gone or moved port.
    /// In-flight tunnels are detached tasks and drain naturally.
    pub async fn sync(self: &Arc<Self>) -> io::Result<()> {
        let entries = self.monitor.entries();
        let wanted: HashMap<String, u16> =
            entries.iter().map(|e| (e.tag().to_string(), e.port())).collect();

        {
            let mut listeners = self.listeners.lock();
            listeners.retain(|tag, listener| {
                let keep = wanted.get(tag) == Some(&listener.port);
                if !keep {
                    tracing::info!(tag = %tag, port = listener.port, "retiring node listener");
                    listener.handle.abort();
                }
                keep
            });
        }

        for entry in entries {
            let tag = entry.tag().to_string();
            if self.listeners.lock().contains_key(&tag) {
                continue;
            }
            let port = entry.port();
            let listener = match TcpListener::bind((self.bind_address.as_str(), port)).await {
                Ok(l) => l,
                Err(e) => {
                    tracing::warn!(tag = %tag, port, error = %e, "cannot bind node listener, skipping");
                    continue;
                }
            };
            tracing::info!(tag = %tag, name = %entry.name(), port, "node listener started");

            let manager = Arc::clone(self);
            let mut shutdown = self.shutdown.subscribe();
            let loop_tag = tag.clone();
            let handle = tokio::spawn(async move {
                loop {
                    tokio::select! {
                        accepted = listener.accept() => match accepted {
                            Ok((stream, peer)) => {
                                let manager = Arc::clone(&manager);
                                let tag = loop_tag.clone();
                                tokio::spawn(async move {
                                    manager.handle(&tag, stream, peer).await;
                                });
                            }
                            Err(e) => {
                                tracing::error!(tag = %loop_tag, error = %e, "node listener accept error");
                                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                            }
                        },
                        _ = shutdown.recv() => return,
                    }
                }
            });
            self.listeners
                .lock()
                .insert(tag, NodeListener { port, handle });
        }
        Ok(())
    }

    pub fn stop_all(&self) {
        let mut listeners = self.listeners.lock();
        for (tag, listener) in listeners.drain() {
            tracing::debug!(tag = %tag, "node listener stopped");
            listener.handle.abort();
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    async fn handle(&self, tag: &str, mut client: TcpStream, peer: SocketAddr) {
        let Some(entry) = self.monitor.entry(tag) else {
            return;
        };
        let req = match read_request(&mut client, CLIENT_READ_TIMEOUT).await {
            Ok(req) => req,
            Err(e) => {
                tracing::debug!(%peer, tag, error = %e, "failed to read client request");
                return;
            }
        };

        let (username, password) = self.node_credentials(tag);
        if !authorized(&req, &username, &password) {
            let _ = write_response(
                &mut client,
                "407 Proxy Authentication Required",
                &[REALM_HEADER],
            )
            .await;
            return;
        }

        // a blacklist earned anywhere refuses fixed-node traffic too
        if self
            .monitor
            .registry()
            .is_blacklisted(tag, Instant::now())
        {
            tracing::debug!(tag, %peer, "refusing connection to blacklisted node");
            let _ = write_response(&mut client, "503 Service Unavailable", &[]).await;
            return;
        }

        let Some(connector) = self.monitor.connector(tag) else {
            let _ = write_response(&mut client, "502 Bad Gateway", &[]).await;
            return;
        };
        let state = self.monitor.registry().acquire(tag);

        tracing::debug!(%peer, tag, name = %entry.name(), "multi-port dispatch");
        let _ = run_tunnel(
            client,
            req,
            connector,
            state,
            self.monitor.failure_threshold(),
            self.monitor.blacklist_duration(),
            tag,
        )
        .await;
    }

    fn node_credentials(&self, tag: &str) -> (String, String) {
        self.monitor
            .node_credentials(tag)
            .unwrap_or_default()
    }
}
