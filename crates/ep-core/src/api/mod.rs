//! Management HTTP surface: the selection APIs, node listing, blacklist
//! release, settings and the subscription refresh trigger.
//!
//! Parameter validation is strict: unknown strategy, bad regex, bad
//! numbers → 400; an empty candidate set after filtering → 404.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post, put};
use axum::Router;
use ep_config::Config;
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::broadcast;

use crate::monitor::{Monitor, Snapshot};
use crate::select::{Selector, Strategy, WeightParams};
use crate::vpool::VirtualPoolManager;

/// Everything the handlers need; shared behind an `Arc`.
pub struct ApiContext {
    pub monitor: Arc<Monitor>,
    pub selector: Selector,
    pub vpools: Option<Arc<VirtualPoolManager>>,
    /// Fires a manual subscription refresh; `None` when no subscriptions
    /// are configured. Returns false when one is already pending.
    pub refresh: Option<Arc<dyn Fn() -> bool + Send + Sync>>,
    /// Shared with the bootstrap/refresh path, which rebuilds the node set
    /// under the same lock.
    pub config: Arc<Mutex<Config>>,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct AvailableQuery {
    count: Option<String>,
    regular: Option<String>,
    strategy: Option<String>,
    latency_weight: Option<String>,
    success_rate_weight: Option<String>,
    weight_mode: Option<String>,
    weighted_random: Option<String>,
}

#[derive(Debug)]
struct ResolvedQuery {
    count: usize,
    regular: Option<Regex>,
    strategy: Strategy,
    params: WeightParams,
    weighted_random: bool,
}

fn resolve_query(q: &AvailableQuery, mode: ep_config::Mode) -> Result<ResolvedQuery, ApiError> {
    if !mode.has_node_listeners() {
        return Err(ApiError::bad_request(
            "this API is only available in multi-port or hybrid mode",
        ));
    }

    let count = match q.count.as_deref() {
        None | Some("") => 1,
        Some(raw) => {
            let count: usize = raw
                .parse()
                .map_err(|_| ApiError::bad_request("count must be an integer"))?;
            if !(1..=100).contains(&count) {
                return Err(ApiError::bad_request("count must be between 1 and 100"));
            }
            count
        }
    };

    let strategy: Strategy = q
        .strategy
        .as_deref()
        .filter(|s| !s.is_empty())
        .unwrap_or("sequential")
        .parse()
        .map_err(|e: crate::select::UnknownStrategy| ApiError::bad_request(e.to_string()))?;

    let regular = match q.regular.as_deref().filter(|s| !s.is_empty()) {
        Some(pattern) => Some(
            Regex::new(pattern)
                .map_err(|e| ApiError::bad_request(format!("invalid regular expression: {e}")))?,
        ),
        None => None,
    };

    // unparseable weight numbers degrade to the balanced defaults
    let params = WeightParams::from_query(
        q.weight_mode.as_deref().unwrap_or(""),
        q.latency_weight.as_deref().unwrap_or(""),
        q.success_rate_weight.as_deref().unwrap_or(""),
    )
    .unwrap_or_default();

    let weighted_random = match q.weighted_random.as_deref() {
        None | Some("") => false,
        Some("true") | Some("1") => true,
        Some("false") | Some("0") => false,
        Some(_) => return Err(ApiError::bad_request("weighted_random must be a boolean")),
    };

    Ok(ResolvedQuery {
        count,
        regular,
        strategy,
        params,
        weighted_random,
    })
}

fn filter_candidates(
    nodes: Vec<Snapshot>,
    regular: Option<&Regex>,
) -> Result<Vec<Snapshot>, ApiError> {
    let nodes = match regular {
        Some(re) => nodes
            .into_iter()
            .filter(|n| re.is_match(&n.name))
            .collect::<Vec<_>>(),
        None => nodes,
    };
    if nodes.is_empty() {
        return Err(ApiError::not_found("no available nodes"));
    }
    Ok(nodes)
}

#[derive(Debug, Serialize)]
pub struct AvailableNode {
    tag: String,
    name: String,
    proxy_url: String,
    latency_ms: i64,
}

impl ApiContext {
    /// `http://[user:pass@]host:port`, host rewritten to `external_ip`
    /// when the node listens on the wildcard address.
    fn proxy_url(&self, node: &Snapshot) -> String {
        let config = self.config.lock();
        let mut addr = node.listen_address.clone();
        if (addr.is_empty() || addr == "0.0.0.0") && !config.external_ip.is_empty() {
            addr = config.external_ip.clone();
        }
        let username = &config.multi_port.username;
        let password = &config.multi_port.password;
        if username.is_empty() || password.is_empty() {
            format!("http://{}:{}", addr, node.port)
        } else {
            format!("http://{}:{}@{}:{}", username, password, addr, node.port)
        }
    }

    fn to_response(&self, node: &Snapshot) -> AvailableNode {
        AvailableNode {
            tag: node.tag.clone(),
            name: node.name.clone(),
            proxy_url: self.proxy_url(node),
            latency_ms: node.last_latency_ms,
        }
    }
}

async fn get_available_node(
    State(ctx): State<Arc<ApiContext>>,
    Query(q): Query<AvailableQuery>,
) -> Result<Json<AvailableNode>, ApiError> {
    let resolved = resolve_query(&q, ctx.monitor.mode())?;
    let nodes = filter_candidates(ctx.monitor.snapshot_filtered(true), resolved.regular.as_ref())?;
    let selected = ctx
        .selector
        .select(
            resolved.strategy,
            &nodes,
            &resolved.params,
            resolved.weighted_random,
        )
        .ok_or_else(|| ApiError::not_found("no available nodes"))?;
    Ok(Json(ctx.to_response(selected)))
}

async fn get_available_nodes(
    State(ctx): State<Arc<ApiContext>>,
    Query(q): Query<AvailableQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let resolved = resolve_query(&q, ctx.monitor.mode())?;
    let nodes = filter_candidates(ctx.monitor.snapshot_filtered(true), resolved.regular.as_ref())?;
    let selected = if resolved.count <= 1 {
        ctx.selector
            .select(
                resolved.strategy,
                &nodes,
                &resolved.params,
                resolved.weighted_random,
            )
            .cloned()
            .map(|s| vec![s])
            .unwrap_or_default()
    } else {
        ctx.selector.select_multiple(
            resolved.strategy,
            &nodes,
            resolved.count,
            &resolved.params,
            resolved.weighted_random,
        )
    };
    if selected.is_empty() {
        return Err(ApiError::not_found("no available nodes"));
    }
    let out: Vec<AvailableNode> = selected.iter().map(|s| ctx.to_response(s)).collect();
    Ok(Json(json!({ "nodes": out })))
}

async fn list_nodes(State(ctx): State<Arc<ApiContext>>) -> Json<serde_json::Value> {
    Json(json!({ "nodes": ctx.monitor.snapshot() }))
}

#[derive(Debug, Deserialize)]
struct ReleaseQuery {
    tag: String,
}

async fn release_node(
    State(ctx): State<Arc<ApiContext>>,
    Query(q): Query<ReleaseQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if ctx.monitor.entry(&q.tag).is_none() {
        return Err(ApiError::not_found(format!("unknown tag {:?}", q.tag)));
    }
    ctx.monitor.registry().force_release(&q.tag);
    tracing::info!(tag = %q.tag, "blacklist force-released");
    Ok(Json(json!({ "released": q.tag })))
}

#[derive(Debug, Serialize)]
struct SettingsView {
    external_ip: String,
    probe_target: String,
    skip_cert_verify: bool,
}

async fn get_settings(State(ctx): State<Arc<ApiContext>>) -> Json<SettingsView> {
    let config = ctx.config.lock();
    Json(SettingsView {
        external_ip: config.external_ip.clone(),
        probe_target: config.management.probe_target.clone(),
        skip_cert_verify: config.skip_cert_verify,
    })
}

#[derive(Debug, Deserialize)]
struct SettingsUpdate {
    external_ip: Option<String>,
    probe_target: Option<String>,
    skip_cert_verify: Option<bool>,
}

async fn put_settings(
    State(ctx): State<Arc<ApiContext>>,
    Json(update): Json<SettingsUpdate>,
) -> Result<Json<SettingsView>, ApiError> {
    let view = {
        let mut config = ctx.config.lock();
        if let Some(external_ip) = update.external_ip {
            config.external_ip = external_ip;
        }
        if let Some(probe_target) = update.probe_target {
            ctx.monitor.set_probe_target(probe_target.clone());
            config.management.probe_target = probe_target;
        }
        if let Some(skip) = update.skip_cert_verify {
            config.skip_cert_verify = skip;
        }
        if let Err(e) = config.save_settings() {
            tracing::error!(error = %e, "failed to persist settings");
            return Err(ApiError {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                message: format!("persist settings: {e}"),
            });
        }
        SettingsView {
            external_ip: config.external_ip.clone(),
            probe_target: config.management.probe_target.clone(),
            skip_cert_verify: config.skip_cert_verify,
        }
    };
    Ok(Json(view))
}

async fn trigger_refresh(
    State(ctx): State<Arc<ApiContext>>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let Some(refresh) = &ctx.refresh else {
        return Err(ApiError::not_found("no subscriptions configured"));
    };
    if refresh() {
        Ok((
            StatusCode::ACCEPTED,
            Json(json!({ "status": "refresh scheduled" })),
        ))
    } else {
        Ok((
            StatusCode::CONFLICT,
            Json(json!({ "error": "refresh already pending" })),
        ))
    }
}

async fn virtual_pools(State(ctx): State<Arc<ApiContext>>) -> Json<serde_json::Value> {
    let pools = ctx
        .vpools
        .as_ref()
        .map(|m| m.status())
        .unwrap_or_default();
    Json(json!({ "pools": pools }))
}

pub fn router(ctx: Arc<ApiContext>) -> Router {
    Router::new()
        .route("/api/nodes", get(list_nodes))
        .route("/api/nodes/get_available_node", get(get_available_node))
        .route("/api/nodes/get_available_nodes", get(get_available_nodes))
        .route("/api/nodes/release", post(release_node))
        .route("/api/settings", get(get_settings))
        .route("/api/settings", put(put_settings))
        .route("/api/subscriptions/refresh", post(trigger_refresh))
        .route("/api/virtual_pools", get(virtual_pools))
        .with_state(ctx)
}

/// Serve on an already-bound listener until shutdown fires.
pub async fn serve(
    listener: tokio::net::TcpListener,
    ctx: Arc<ApiContext>,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(listen = %addr, "management API listening");
    }
    axum::serve(listener, router(ctx))
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ep_config::Mode;

    fn query(pairs: &[(&str, &str)]) -> AvailableQuery {
        let mut q = AvailableQuery::default();
        for (k, v) in pairs {
            let v = Some((*v).to_string());
            match *k {
                "count" => q.count = v,
                "regular" => q.regular = v,
                "strategy" => q.strategy = v,
                "latency_weight" => q.latency_weight = v,
                "success_rate_weight" => q.success_rate_weight = v,
                "weight_mode" => q.weight_mode = v,
                "weighted_random" => q.weighted_random = v,
                _ => unreachable!(),
            }
        }
        q
    }

    #[test]
    fn rejects_pool_mode() {
        let err = resolve_query(&query(&[]), Mode::Pool).unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn strict_validation() {
        assert!(resolve_query(&query(&[("strategy", "fastest")]), Mode::Hybrid).is_err());
        assert!(resolve_query(&query(&[("count", "0")]), Mode::Hybrid).is_err());
        assert!(resolve_query(&query(&[("count", "101")]), Mode::Hybrid).is_err());
        assert!(resolve_query(&query(&[("count", "abc")]), Mode::Hybrid).is_err());
        assert!(resolve_query(&query(&[("weighted_random", "maybe")]), Mode::Hybrid).is_err());

        // bad weight numbers are not an error, they fall back to defaults
        let fallback = resolve_query(&query(&[("latency_weight", "x")]), Mode::Hybrid).unwrap();
        assert_eq!(fallback.params, WeightParams::default());

        let ok = resolve_query(
            &query(&[("strategy", "weighted"), ("weighted_random", "true"), ("count", "2")]),
            Mode::MultiPort,
        )
        .unwrap();
        assert_eq!(ok.count, 2);
        assert_eq!(ok.strategy, Strategy::Weighted);
        assert!(ok.weighted_random);
    }

    #[test]
    fn regex_filter_and_empty_set() {
        let nodes = vec![
            Snapshot::for_test("a", "HK-1", 10),
            Snapshot::for_test("b", "SG-1", 20),
        ];
        let re = Regex::new("^HK").unwrap();
        let filtered = filter_candidates(nodes.clone(), Some(&re)).unwrap();
        assert_eq!(filtered.len(), 1);

        let re = Regex::new("^US").unwrap();
        let err = filter_candidates(nodes, Some(&re)).unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);

        let bad = resolve_query(&query(&[("regular", "([")]), Mode::Hybrid).unwrap_err();
        assert_eq!(bad.status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn weighted_best_pair_orders_by_latency() {
        // latencies 10/100/500 with no failures: top two by latency-first
        // weighting come back fastest-first
        let nodes = vec![
            Snapshot::for_test("a", "n10", 10),
            Snapshot::for_test("b", "n100", 100),
            Snapshot::for_test("c", "n500", 500),
        ];
        let resolved = resolve_query(
            &query(&[
                ("count", "2"),
                ("strategy", "weighted"),
                ("weight_mode", "latency_first"),
            ]),
            Mode::MultiPort,
        )
        .unwrap();
        let selector = Selector::new();
        let out = selector.select_multiple(
            resolved.strategy,
            &nodes,
            resolved.count,
            &resolved.params,
            resolved.weighted_random,
        );
        let tags: Vec<&str> = out.iter().map(|s| s.tag.as_str()).collect();
        assert_eq!(tags, ["a", "b"]);
    }
}
