//! Outbound adapter seam.
//!
//! The core never interprets proxy URI schemes itself; a
//! [`ConnectorFactory`] turns a node into an [`OutboundConnector`] and real
//! transports (VMess, Trojan, …) plug in behind that trait. The built-in
//! factory covers plain TCP and HTTP CONNECT upstreams, which is also the
//! primitive the virtual pools chain through.

mod direct;
mod http_upstream;

pub use direct::Direct;
pub use http_upstream::HttpUpstream;

use std::sync::Arc;

use ep_config::NodeConfig;
use tokio::net::TcpStream;

/// Establishes a TCP connection to `host:port` through some transport.
#[async_trait::async_trait]
pub trait OutboundConnector: Send + Sync + std::fmt::Debug + 'static {
    async fn connect(&self, host: &str, port: u16) -> std::io::Result<TcpStream>;
}

/// Builds the connector for one configured node.
pub trait ConnectorFactory: Send + Sync {
    fn create(&self, node: &NodeConfig) -> anyhow::Result<Arc<dyn OutboundConnector>>;
}

/// Scheme-dispatching factory: `http`/`https` upstream proxies and
/// `direct` are built in; other schemes need an external adapter.
#[derive(Debug, Default)]
pub struct DefaultConnectorFactory;

impl ConnectorFactory for DefaultConnectorFactory {
    fn create(&self, node: &NodeConfig) -> anyhow::Result<Arc<dyn OutboundConnector>> {
        let scheme = node
            .uri
            .split_once("://")
            .map(|(s, _)| s.to_ascii_lowercase())
            .unwrap_or_default();
        match scheme.as_str() {
            "http" | "https" => Ok(Arc::new(HttpUpstream::from_uri(&node.uri)?)),
            "direct" => Ok(Arc::new(Direct)),
            other => anyhow::bail!("no transport adapter registered for scheme {other:?}"),
        }
    }
}

/// Closure-backed factory for tests and embedders.
pub struct FnConnectorFactory<F>(pub F);

impl<F> ConnectorFactory for FnConnectorFactory<F>
where
    F: Fn(&NodeConfig) -> anyhow::Result<Arc<dyn OutboundConnector>> + Send + Sync,
{
    fn create(&self, node: &NodeConfig) -> anyhow::Result<Arc<dyn OutboundConnector>> {
        (self.0)(node)
    }
}
