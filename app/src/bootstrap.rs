//! Build the runtime from config and block until shutdown.
//!
//! Wiring order: node sources → normalisation → member registry → monitor
//! (probe loop) → frontends for the configured mode → virtual pools →
//! subscription refresh → management API → signal wait.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use ep_config::{Config, NodeSource};
use ep_core::api::ApiContext;
use ep_core::{
    DefaultConnectorFactory, MemberRegistry, Monitor, MonitorConfig, MultiPortManager,
    PoolFrontend, Selector, Strategy, VirtualPoolManager,
};
use ep_subscribe::Refresher;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};

use crate::cli::Args;

pub async fn run(args: Args, mut cfg: Config) -> Result<()> {
    // Resolve node sources. Subscriptions take priority over the nodes
    // file; both append to the inline array.
    cfg.merge_file_nodes().context("load nodes file")?;
    if !cfg.subscriptions.is_empty() && !args.check {
        let fetched =
            ep_subscribe::fetch_all(&cfg.subscriptions, cfg.subscription_refresh.timeout).await;
        cfg.merge_subscription_nodes(fetched);
    }

    if args.check {
        return check(cfg);
    }

    cfg.normalize().context("normalize config")?;

    let (shutdown_tx, _) = broadcast::channel::<()>(8);
    let registry = Arc::new(MemberRegistry::new());
    let monitor = Monitor::new(
        Arc::clone(&registry),
        MonitorConfig {
            mode: cfg.mode,
            probe_target: cfg.management.probe_target.clone(),
            probe_interval: cfg.management.probe_interval,
            failure_threshold: cfg.pool.failure_threshold,
            blacklist_duration: cfg.pool.blacklist_duration,
            listen_address: cfg.multi_port.address.clone(),
        },
    );
    let factory = Arc::new(DefaultConnectorFactory);
    monitor.install_nodes(&cfg.nodes, factory.as_ref());
    monitor.spawn_probe_loop(shutdown_tx.subscribe());

    // Frontends for the configured mode.
    if cfg.mode.has_pool_listener() {
        let strategy: Strategy = cfg
            .pool
            .mode
            .parse()
            .map_err(|e| anyhow!("pool.mode: {e}"))?;
        let pool = PoolFrontend::new(&cfg.listener, strategy, Arc::clone(&monitor));
        let listener = pool.bind().await.with_context(|| {
            format!("bind pool listener {}:{}", cfg.listener.address, cfg.listener.port)
        })?;
        let shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            if let Err(e) = pool.serve(listener, shutdown).await {
                tracing::error!(error = %e, "pool frontend terminated");
            }
        });
    }

    let multi_port = if cfg.mode.has_node_listeners() {
        let manager = MultiPortManager::new(
            Arc::clone(&monitor),
            cfg.multi_port.address.clone(),
            shutdown_tx.clone(),
        );
        manager.sync().await.context("start multi-port listeners")?;
        tracing::info!(
            listeners = manager.listener_count(),
            base_port = cfg.multi_port.base_port,
            "multi-port frontends started"
        );
        Some(manager)
    } else {
        None
    };

    let vpools = if cfg.virtual_pools.is_empty() {
        None
    } else {
        Some(
            VirtualPoolManager::start(
                &cfg.virtual_pools,
                Arc::clone(&monitor),
                cfg.multi_port.clone(),
                cfg.mode,
                &shutdown_tx,
            )
            .await
            .context("start virtual pools")?,
        )
    };

    if !args.no_banner {
        print_startup_summary(&cfg, vpools.as_deref());
    }

    let shared_cfg = Arc::new(Mutex::new(cfg));

    // Subscription refresh: the refresher fetches on a cadence, the applier
    // below gates and swaps the node set.
    let mut refresh_trigger: Option<Arc<dyn Fn() -> bool + Send + Sync>> = None;
    {
        let cfg = shared_cfg.lock();
        if cfg.subscription_refresh.enabled && !cfg.subscriptions.is_empty() {
            let (updates_tx, updates_rx) = mpsc::channel(1);
            let (refresher, trigger) = Refresher::new(
                cfg.subscriptions.clone(),
                cfg.subscription_refresh.clone(),
                updates_tx,
            );
            tokio::spawn(refresher.run(shutdown_tx.subscribe()));
            refresh_trigger = Some(Arc::new(move || trigger.fire()));

            tokio::spawn(apply_subscription_updates(
                updates_rx,
                Arc::clone(&shared_cfg),
                Arc::clone(&monitor),
                Arc::clone(&registry),
                multi_port.clone(),
                Arc::clone(&factory),
            ));
        }
    }

    // Management API.
    let management_listen = {
        let cfg = shared_cfg.lock();
        cfg.management_enabled().then(|| cfg.management.listen.clone())
    };
    if let Some(listen) = management_listen {
        let listener = tokio::net::TcpListener::bind(listen.as_str())
            .await
            .with_context(|| format!("bind management listener {listen}"))?;
        let ctx = Arc::new(ApiContext {
            monitor: Arc::clone(&monitor),
            selector: Selector::new(),
            vpools: vpools.clone(),
            refresh: refresh_trigger,
            config: Arc::clone(&shared_cfg),
        });
        let shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            if let Err(e) = ep_core::api::serve(listener, ctx, shutdown).await {
                tracing::error!(error = %e, "management API terminated");
            }
        });
    }

    wait_for_signal().await;
    tracing::info!("shutting down");
    let _ = shutdown_tx.send(());
    if let Some(manager) = multi_port {
        manager.stop_all();
    }
    // Accept loops exit on the broadcast; in-flight tunnels drain until the
    // process exits.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    Ok(())
}

/// `--check`: parse and normalise only, no listeners, no probes.
fn check(mut cfg: Config) -> Result<()> {
    if cfg.nodes.is_empty() && !cfg.subscriptions.is_empty() {
        println!(
            "configuration OK ({} subscription source(s), nodes resolved at start)",
            cfg.subscriptions.len()
        );
        return Ok(());
    }
    cfg.normalize().context("normalize config")?;
    println!(
        "configuration OK (mode {}, {} node(s), {} virtual pool(s))",
        cfg.mode.as_str(),
        cfg.nodes.len(),
        cfg.virtual_pools.len()
    );
    Ok(())
}

async fn apply_subscription_updates(
    mut updates: mpsc::Receiver<Vec<ep_config::NodeConfig>>,
    shared_cfg: Arc<Mutex<Config>>,
    monitor: Arc<Monitor>,
    registry: Arc<MemberRegistry>,
    multi_port: Option<Arc<MultiPortManager>>,
    factory: Arc<DefaultConnectorFactory>,
) {
    while let Some(nodes) = updates.recv().await {
        let (probe_target, refresh_cfg) = {
            let cfg = shared_cfg.lock();
            (
                cfg.management.probe_target.clone(),
                cfg.subscription_refresh.clone(),
            )
        };

        // Gate: never swap to a set with too few reachable nodes.
        let reachable = ep_core::monitor::count_reachable(
            &nodes,
            factory.as_ref(),
            &probe_target,
            refresh_cfg.health_check_timeout,
        )
        .await;
        if reachable < refresh_cfg.min_available_nodes {
            tracing::warn!(
                reachable,
                required = refresh_cfg.min_available_nodes,
                "refreshed subscription set below minimum, keeping current nodes"
            );
            continue;
        }

        let swapped = {
            let mut cfg = shared_cfg.lock();
            let port_map = cfg.build_port_map();
            cfg.nodes.retain(|n| n.source == NodeSource::Inline);
            cfg.merge_subscription_nodes(nodes);
            match cfg.normalize_with_port_map(&port_map) {
                Ok(()) => {
                    // reload semantics: member state is cleared wholesale
                    registry.reset();
                    monitor.install_nodes(&cfg.nodes, factory.as_ref());
                    if let Err(e) = cfg.save_nodes() {
                        tracing::warn!(error = %e, "failed to persist refreshed nodes");
                    }
                    tracing::info!(nodes = cfg.nodes.len(), "subscription refresh applied");
                    true
                }
                Err(e) => {
                    tracing::error!(error = %e, "refreshed node set failed normalisation, keeping current nodes");
                    false
                }
            }
        };

        if swapped {
            if let Some(manager) = &multi_port {
                if let Err(e) = manager.sync().await {
                    tracing::error!(error = %e, "multi-port listener sync failed");
                }
            }
        }
    }
}

/// Startup summary, virtual-pool entry points included.
fn print_startup_summary(cfg: &Config, vpools: Option<&VirtualPoolManager>) {
    tracing::info!(
        mode = cfg.mode.as_str(),
        nodes = cfg.nodes.len(),
        "easy-proxies started"
    );
    if cfg.mode.has_pool_listener() {
        tracing::info!(
            "pool endpoint: http://{}:{}",
            cfg.listener.address,
            cfg.listener.port
        );
    }
    if cfg.mode.has_node_listeners() {
        tracing::info!(
            "multi-port endpoints: http://{}:{}..",
            cfg.multi_port.address,
            cfg.multi_port.base_port
        );
    }
    let Some(vpools) = vpools else { return };
    tracing::info!("virtual pool entry points:");
    for status in vpools.status() {
        let auth = cfg
            .virtual_pools
            .iter()
            .find(|p| p.name == status.name)
            .filter(|p| !p.username.is_empty())
            .map(|p| format!("{}:{}@", p.username, p.password))
            .unwrap_or_default();
        tracing::info!(
            "  [{}] {} (nodes: {}, strategy: {}) http://{}{}:{}",
            status.port,
            status.name,
            status.node_count,
            status.strategy,
            auth,
            status.address,
            status.port
        );
    }
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, "cannot install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => tracing::info!("received SIGINT"),
            _ = sigterm.recv() => tracing::info!("received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("received ctrl-c");
    }
}
