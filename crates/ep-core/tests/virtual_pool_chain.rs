//! Virtual pool chaining over real sockets: regex + latency candidate
//! filtering, the CONNECT hop through the node's multi-port listener with
//! the global multi-port credentials, and cross-frontend blacklist
//! visibility.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ep_config::{Mode, MultiPortConfig, NodeConfig, VirtualPoolConfig};
use ep_core::outbound::{FnConnectorFactory, OutboundConnector};
use ep_core::{tag_of, MemberRegistry, Monitor, MonitorConfig, MultiPortManager, VirtualPoolManager};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

#[derive(Debug)]
struct ToAddr(SocketAddr);

#[async_trait::async_trait]
impl OutboundConnector for ToAddr {
    async fn connect(&self, _host: &str, _port: u16) -> io::Result<TcpStream> {
        TcpStream::connect(self.0).await
    }
}

async fn spawn_named_upstream(name: &'static str) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let _ = stream.write_all(name.as_bytes()).await;
                let _ = stream.shutdown().await;
                let mut buf = [0u8; 256];
                while matches!(stream.read(&mut buf).await, Ok(n) if n > 0) {}
            });
        }
    });
    addr
}

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

struct Harness {
    monitor: Arc<Monitor>,
    registry: Arc<MemberRegistry>,
    vpool_port: u16,
    node_ports: Vec<(String, u16)>,
    _shutdown: broadcast::Sender<()>,
}

const MP_USER: &str = "mp_user";
const MP_PASS: &str = "mp_pass";

/// Full multi-port + virtual-pool stack on loopback. `nodes` carries
/// (name, latency_ms, upstream payload name).
async fn start_stack(
    nodes: Vec<(&'static str, i64)>,
    vpool: VirtualPoolConfig,
) -> Harness {
    let registry = Arc::new(MemberRegistry::new());
    let monitor = Monitor::new(
        Arc::clone(&registry),
        MonitorConfig {
            mode: Mode::MultiPort,
            probe_target: "127.0.0.1:1".into(),
            probe_interval: Duration::from_secs(3600),
            failure_threshold: 2,
            blacklist_duration: Duration::from_secs(60),
            listen_address: "127.0.0.1".into(),
        },
    );

    let mut configs = Vec::new();
    let mut connectors: std::collections::HashMap<String, Arc<dyn OutboundConnector>> =
        std::collections::HashMap::new();
    let mut node_ports = Vec::new();
    let mut latencies = Vec::new();
    for (name, latency) in nodes {
        let upstream = spawn_named_upstream(name).await;
        let uri = format!("ss://{name}@host:1#{name}");
        let port = free_port();
        node_ports.push((name.to_string(), port));
        connectors.insert(uri.clone(), Arc::new(ToAddr(upstream)) as Arc<dyn OutboundConnector>);
        latencies.push(latency);
        configs.push(NodeConfig {
            name: name.to_string(),
            uri,
            port,
            username: MP_USER.into(),
            password: MP_PASS.into(),
            ..NodeConfig::default()
        });
    }

    let factory = FnConnectorFactory(move |node: &NodeConfig| {
        connectors
            .get(&node.uri)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no connector"))
    });
    monitor.install_nodes(&configs, &factory);
    for (entry, latency) in monitor.entries().into_iter().zip(latencies) {
        entry.set_probe_result(true, latency);
    }

    let (shutdown, _) = broadcast::channel(4);
    let multi_port = MultiPortManager::new(
        Arc::clone(&monitor),
        "127.0.0.1".into(),
        shutdown.clone(),
    );
    multi_port.sync().await.unwrap();

    let multi_port_cfg = MultiPortConfig {
        address: "127.0.0.1".into(),
        base_port: 0,
        username: MP_USER.into(),
        password: MP_PASS.into(),
    };
    let vpool_port = vpool.port;
    VirtualPoolManager::start(
        &[vpool],
        Arc::clone(&monitor),
        multi_port_cfg,
        Mode::MultiPort,
        &shutdown,
    )
    .await
    .unwrap();

    Harness {
        monitor,
        registry,
        vpool_port,
        node_ports,
        _shutdown: shutdown,
    }
}

fn fast_pool(port: u16) -> VirtualPoolConfig {
    VirtualPoolConfig {
        name: "fast".into(),
        regular: "^HK".into(),
        address: "127.0.0.1".into(),
        port,
        username: String::new(),
        password: String::new(),
        strategy: "sequential".into(),
        max_latency_ms: 200,
    }
}

async fn connect_via(
    addr: SocketAddr,
    extra_headers: &str,
) -> (String, String) {
    let mut client = TcpStream::connect(addr).await.unwrap();
    let req = format!(
        "CONNECT target.example:80 HTTP/1.1\r\nHost: target.example:80\r\n{extra_headers}\r\n"
    );
    client.write_all(req.as_bytes()).await.unwrap();
    let mut reader = BufReader::new(&mut client);
    let mut status = String::new();
    reader.read_line(&mut status).await.unwrap();
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        if line.trim().is_empty() {
            break;
        }
    }
    let mut payload = Vec::new();
    if status.contains("200") {
        reader.read_to_end(&mut payload).await.unwrap();
    }
    (status.trim().to_string(), String::from_utf8_lossy(&payload).into_owned())
}

#[tokio::test]
async fn chains_to_the_single_matching_node() {
    // HK-2 exceeds the latency bound, SG-1 fails the regex: only HK-1 remains
    let harness = start_stack(
        vec![("HK-1", 50), ("HK-2", 300), ("SG-1", 80)],
        fast_pool(free_port()),
    )
    .await;

    for _ in 0..3 {
        let (status, payload) =
            connect_via(([127, 0, 0, 1], harness.vpool_port).into(), "").await;
        assert!(status.contains("200"), "unexpected status {status}");
        assert_eq!(payload, "HK-1");
    }
}

#[tokio::test]
async fn multi_port_listener_requires_the_global_credentials() {
    let harness = start_stack(vec![("HK-1", 50)], fast_pool(free_port())).await;
    let (_, port) = harness.node_ports[0].clone();

    // direct hit without credentials is refused
    let (status, _) = connect_via(([127, 0, 0, 1], port).into(), "").await;
    assert!(status.contains("407"), "expected 407, got {status}");

    // the virtual pool injects them, so the chained request succeeds
    let (status, payload) =
        connect_via(([127, 0, 0, 1], harness.vpool_port).into(), "").await;
    assert!(status.contains("200"));
    assert_eq!(payload, "HK-1");
}

#[tokio::test]
async fn own_credentials_gate_the_virtual_pool() {
    let mut pool = fast_pool(free_port());
    pool.username = "vp".into();
    pool.password = "secret".into();
    let harness = start_stack(vec![("HK-1", 50)], pool).await;
    let addr: SocketAddr = ([127, 0, 0, 1], harness.vpool_port).into();

    let (status, _) = connect_via(addr, "").await;
    assert!(status.contains("407"), "expected 407, got {status}");

    use base64::Engine as _;
    let token = base64::engine::general_purpose::STANDARD.encode("vp:secret");
    let header = format!("Proxy-Authorization: Basic {token}\r\n");
    let (status, payload) = connect_via(addr, &header).await;
    assert!(status.contains("200"), "expected 200, got {status}");
    assert_eq!(payload, "HK-1");
}

#[tokio::test]
async fn no_matching_candidates_is_a_503() {
    let harness = start_stack(vec![("SG-1", 10)], fast_pool(free_port())).await;
    let (status, _) = connect_via(([127, 0, 0, 1], harness.vpool_port).into(), "").await;
    assert!(status.contains("503"), "expected 503, got {status}");
}

#[tokio::test]
async fn shared_blacklist_refuses_multi_port_traffic() {
    // hybrid semantics: a blacklist earned elsewhere (threshold failures on
    // the shared state) refuses connections on the node's own listener
    let harness = start_stack(vec![("HK-1", 50)], fast_pool(free_port())).await;
    let tag = tag_of("ss://HK-1@host:1#HK-1");
    let (_, port) = harness.node_ports[0].clone();

    let state = harness.registry.acquire(&tag);
    state.record_failure("pool traffic", 2, Duration::from_secs(60));
    state.record_failure("pool traffic", 2, Duration::from_secs(60));
    assert!(harness.registry.is_blacklisted(&tag, Instant::now()));

    use base64::Engine as _;
    let token = base64::engine::general_purpose::STANDARD.encode("mp_user:mp_pass");
    let header = format!("Proxy-Authorization: Basic {token}\r\n");
    let (status, _) = connect_via(([127, 0, 0, 1], port).into(), &header).await;
    assert!(status.contains("503"), "expected 503, got {status}");

    // and the virtual pool no longer sees the node either
    assert!(harness.monitor.snapshot_filtered(true).is_empty());
}
