//! Dispatch frontends: the listeners that accept client proxy connections.

pub mod http;
pub mod multi_port;
pub mod pool;

pub use multi_port::MultiPortManager;
pub use pool::PoolFrontend;

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;

use crate::member::{ActiveGuard, MemberState};
use crate::outbound::OutboundConnector;

use self::http::{relay, write_response, ProxyRequest};

pub(crate) const REALM_HEADER: (&str, &str) =
    ("Proxy-Authenticate", "Basic realm=\"easy-proxies\"");

/// Dial the upstream through `connector` and splice until close, with the
/// full failure/success/active bookkeeping every frontend shares.
pub(crate) async fn run_tunnel(
    mut client: TcpStream,
    req: ProxyRequest,
    connector: Arc<dyn OutboundConnector>,
    state: Arc<MemberState>,
    threshold: u32,
    blacklist_duration: Duration,
    tag: &str,
) -> io::Result<()> {
    let (host, port) = match req.host_port() {
        Ok(target) => target,
        Err(e) => {
            write_response(&mut client, "400 Bad Request", &[]).await?;
            return Err(e);
        }
    };

    let _active = ActiveGuard::new(state.clone());

    // No dial deadline here: the transport adapter owns its own timeouts
    // and long-lived tunnels are expected.
    let upstream = match connector.connect(&host, port).await {
        Ok(stream) => stream,
        Err(e) => {
            state.record_failure("outbound dial", threshold, blacklist_duration);
            tracing::debug!(tag, host, port, error = %e, "outbound dial failed");
            write_response(&mut client, "502 Bad Gateway", &[]).await?;
            return Err(e);
        }
    };

    let initial = if req.is_connect() {
        write_response(&mut client, "200 Connection established", &[]).await?;
        req.buffered.clone()
    } else {
        let mut head = req.serialize_origin_form()?;
        head.extend_from_slice(&req.buffered);
        head
    };

    match relay(client, upstream, &initial).await {
        Ok((up, down)) => {
            state.record_success();
            tracing::trace!(tag, host, port, up, down, "tunnel closed");
            Ok(())
        }
        Err(e) => {
            state.record_failure("tunnel", threshold, blacklist_duration);
            tracing::debug!(tag, host, port, error = %e, "tunnel failed");
            Err(e)
        }
    }
}
