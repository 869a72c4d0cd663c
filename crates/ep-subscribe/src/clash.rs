//! Clash YAML proxies, re-rendered to standard share URIs.
//!
//! Only the proxy types this server dispatches are converted; anything else
//! in the document is ignored.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use ep_config::NodeConfig;
use serde::Deserialize;
use url::form_urlencoded;

use crate::SubscribeError;

#[derive(Debug, Deserialize)]
struct ClashDoc {
    #[serde(default)]
    proxies: Vec<ClashProxy>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ClashProxy {
    name: String,
    #[serde(rename = "type")]
    kind: String,
    server: String,
    port: u16,
    uuid: String,
    password: String,
    cipher: String,
    network: String,
    tls: bool,
    #[serde(rename = "skip-cert-verify")]
    skip_cert_verify: bool,
    servername: String,
    sni: String,
    flow: String,
    #[serde(rename = "ws-opts")]
    ws_opts: Option<WsOpts>,
    #[serde(rename = "grpc-opts")]
    grpc_opts: Option<GrpcOpts>,
    #[serde(rename = "reality-opts")]
    reality_opts: Option<RealityOpts>,
    #[serde(rename = "client-fingerprint")]
    client_fingerprint: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WsOpts {
    path: String,
    headers: std::collections::HashMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct GrpcOpts {
    #[serde(rename = "grpc-service-name")]
    grpc_service_name: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RealityOpts {
    #[serde(rename = "public-key")]
    public_key: String,
    #[serde(rename = "short-id")]
    short_id: String,
}

pub(crate) fn parse_clash_yaml(content: &str) -> Result<Vec<NodeConfig>, SubscribeError> {
    let doc: ClashDoc =
        serde_yaml::from_str(content).map_err(|e| SubscribeError::Parse(e.to_string()))?;
    Ok(doc
        .proxies
        .into_iter()
        .filter_map(|p| {
            let uri = proxy_to_uri(&p)?;
            Some(NodeConfig {
                name: p.name.clone(),
                uri,
                ..NodeConfig::default()
            })
        })
        .collect())
}

fn proxy_to_uri(p: &ClashProxy) -> Option<String> {
    match p.kind.to_ascii_lowercase().as_str() {
        "vmess" => Some(build_vmess(p)),
        "vless" => Some(build_vless(p)),
        "trojan" => Some(build_trojan(p)),
        "ss" | "shadowsocks" => Some(build_shadowsocks(p)),
        "hysteria2" | "hy2" => Some(build_hysteria2(p)),
        _ => None,
    }
}

fn sni_of(p: &ClashProxy) -> &str {
    if !p.servername.is_empty() {
        &p.servername
    } else {
        &p.sni
    }
}

fn fragment(name: &str) -> String {
    form_urlencoded::byte_serialize(name.as_bytes()).collect()
}

struct Query(form_urlencoded::Serializer<'static, String>);

impl Query {
    fn new() -> Self {
        Self(form_urlencoded::Serializer::new(String::new()))
    }

    fn push(&mut self, key: &str, value: &str) {
        self.0.append_pair(key, value);
    }

    /// "?k=v&…" or empty when nothing was pushed.
    fn finish(mut self) -> String {
        let q = self.0.finish();
        if q.is_empty() {
            q
        } else {
            format!("?{q}")
        }
    }
}

fn push_ws(q: &mut Query, p: &ClashProxy) {
    if let Some(ws) = &p.ws_opts {
        if !ws.path.is_empty() {
            q.push("path", &ws.path);
        }
        if let Some(host) = ws.headers.get("Host") {
            q.push("host", host);
        }
    }
}

fn build_vmess(p: &ClashProxy) -> String {
    let mut q = Query::new();
    if !p.network.is_empty() && p.network != "tcp" {
        q.push("type", &p.network);
    }
    if p.tls {
        q.push("security", "tls");
        let sni = sni_of(p);
        if !sni.is_empty() {
            q.push("sni", sni);
        }
    }
    push_ws(&mut q, p);
    if !p.client_fingerprint.is_empty() {
        q.push("fp", &p.client_fingerprint);
    }
    format!(
        "vmess://{}@{}:{}{}#{}",
        p.uuid,
        p.server,
        p.port,
        q.finish(),
        fragment(&p.name)
    )
}

fn build_vless(p: &ClashProxy) -> String {
    let mut q = Query::new();
    q.push("encryption", "none");
    if !p.network.is_empty() && p.network != "tcp" {
        q.push("type", &p.network);
    }
    if !p.flow.is_empty() {
        q.push("flow", &p.flow);
    }
    if p.tls {
        q.push("security", "tls");
        let sni = sni_of(p);
        if !sni.is_empty() {
            q.push("sni", sni);
        }
    }
    if let Some(reality) = &p.reality_opts {
        q.push("security", "reality");
        if !reality.public_key.is_empty() {
            q.push("pbk", &reality.public_key);
        }
        if !reality.short_id.is_empty() {
            q.push("sid", &reality.short_id);
        }
        if !p.servername.is_empty() {
            q.push("sni", &p.servername);
        }
    }
    push_ws(&mut q, p);
    if let Some(grpc) = &p.grpc_opts {
        if !grpc.grpc_service_name.is_empty() {
            q.push("serviceName", &grpc.grpc_service_name);
        }
    }
    if !p.client_fingerprint.is_empty() {
        q.push("fp", &p.client_fingerprint);
    }
    format!(
        "vless://{}@{}:{}{}#{}",
        p.uuid,
        p.server,
        p.port,
        q.finish(),
        fragment(&p.name)
    )
}

fn build_trojan(p: &ClashProxy) -> String {
    let mut q = Query::new();
    if !p.network.is_empty() && p.network != "tcp" {
        q.push("type", &p.network);
    }
    let sni = sni_of(p);
    if !sni.is_empty() {
        q.push("sni", sni);
    }
    if p.skip_cert_verify {
        q.push("allowInsecure", "1");
    }
    push_ws(&mut q, p);
    if !p.client_fingerprint.is_empty() {
        q.push("fp", &p.client_fingerprint);
    }
    format!(
        "trojan://{}@{}:{}{}#{}",
        p.password,
        p.server,
        p.port,
        q.finish(),
        fragment(&p.name)
    )
}

fn build_shadowsocks(p: &ClashProxy) -> String {
    let userinfo = STANDARD.encode(format!("{}:{}", p.cipher, p.password));
    format!(
        "ss://{}@{}:{}#{}",
        userinfo,
        p.server,
        p.port,
        fragment(&p.name)
    )
}

fn build_hysteria2(p: &ClashProxy) -> String {
    let mut q = Query::new();
    let sni = sni_of(p);
    if !sni.is_empty() {
        q.push("sni", sni);
    }
    if p.skip_cert_verify {
        q.push("insecure", "1");
    }
    format!(
        "hysteria2://{}@{}:{}{}#{}",
        p.password,
        p.server,
        p.port,
        q.finish(),
        fragment(&p.name)
    )
}
