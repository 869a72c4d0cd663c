//! Pool frontend: one listener, per-connection upstream selection.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use ep_config::ListenerConfig;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

use crate::inbound::http::{authorized, read_request, write_response, CLIENT_READ_TIMEOUT};
use crate::inbound::{run_tunnel, REALM_HEADER};
use crate::monitor::Monitor;
use crate::select::{Selector, Strategy, WeightParams};

pub struct PoolFrontend {
    address: String,
    port: u16,
    username: String,
    password: String,
    strategy: Strategy,
    selector: Selector,
    monitor: Arc<Monitor>,
}

impl PoolFrontend {
    pub fn new(listener: &ListenerConfig, strategy: Strategy, monitor: Arc<Monitor>) -> Arc<Self> {
        Arc::new(Self {
            address: listener.address.clone(),
            port: listener.port,
            username: listener.username.clone(),
            password: listener.password.clone(),
            strategy,
            selector: Selector::new(),
            monitor,
        })
    }

    /// Bind the configured listener; failures here are fatal at startup.
    pub async fn bind(&self) -> io::Result<TcpListener> {
        TcpListener::bind((self.address.as_str(), self.port)).await
    }

    /// Accept loop; returns when shutdown fires.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> io::Result<()> {
        tracing::info!(
            address = %self.address,
            port = self.port,
            strategy = self.strategy.as_str(),
            "pool frontend listening"
        );
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let frontend = Arc::clone(&self);
                        tokio::spawn(async move { frontend.handle(stream, peer).await });
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "pool accept error");
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                },
                _ = shutdown.recv() => {
                    tracing::info!("pool frontend shutting down");
                    return Ok(());
                }
            }
        }
    }

    async fn handle(&self, mut client: TcpStream, peer: SocketAddr) {
        let req = match read_request(&mut client, CLIENT_READ_TIMEOUT).await {
            Ok(req) => req,
            Err(e) => {
                tracing::debug!(%peer, error = %e, "failed to read client request");
                return;
            }
        };

        if !authorized(&req, &self.username, &self.password) {
            let _ = write_response(
                &mut client,
                "407 Proxy Authentication Required",
                &[REALM_HEADER],
            )
            .await;
            return;
        }

        let candidates = self.monitor.snapshot_filtered(true);
        let selected = self
            .selector
            .select(self.strategy, &candidates, &WeightParams::default(), false)
            .cloned();
        let Some(selected) = selected else {
            tracing::warn!(%peer, "no available upstream for pool connection");
            let _ = write_response(&mut client, "503 Service Unavailable", &[]).await;
            return;
        };

        let Some(connector) = self.monitor.connector(&selected.tag) else {
            tracing::warn!(tag = %selected.tag, "selected node has no connector");
            let _ = write_response(&mut client, "502 Bad Gateway", &[]).await;
            return;
        };
        let state = self.monitor.registry().acquire(&selected.tag);

        tracing::debug!(%peer, tag = %selected.tag, name = %selected.name, "pool dispatch");
        let _ = run_tunnel(
            client,
            req,
            connector,
            state,
            self.monitor.failure_threshold(),
            self.monitor.blacklist_duration(),
            &selected.tag,
        )
        .await;
    }
}
