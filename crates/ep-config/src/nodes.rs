//! Node descriptions and the line-oriented nodes file.
//!
//! A node is one upstream proxy expressed as a URI. The URI doubles as the
//! node's stable identity (its *tag* is derived from it), which is what keeps
//! port assignments stable across reloads.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Where a node configuration originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeSource {
    /// Defined directly in the config `nodes:` array.
    #[default]
    Inline,
    /// Loaded from the external nodes file.
    File,
    /// Fetched from a subscription URL.
    Subscription,
}

/// A single upstream proxy endpoint expressed as a URI.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    pub uri: String,
    #[serde(default, skip_serializing_if = "is_zero_port")]
    pub port: u16,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub password: String,
    /// Runtime only, never persisted.
    #[serde(skip)]
    pub source: NodeSource,
}

fn is_zero_port(p: &u16) -> bool {
    *p == 0
}

impl NodeConfig {
    /// Stable identity used to preserve port assignments across reloads.
    pub fn node_key(&self) -> &str {
        &self.uri
    }

    /// Node name taken from the URI fragment (`#name`), percent-decoded.
    pub fn name_from_uri(&self) -> Option<String> {
        let frag = self.uri.split_once('#')?.1;
        if frag.is_empty() {
            return None;
        }
        Some(percent_decode(frag))
    }
}

const URI_SCHEMES: &[&str] = &[
    "vmess://",
    "vless://",
    "trojan://",
    "ss://",
    "ssr://",
    "hysteria://",
    "hysteria2://",
    "hy2://",
    // local testing / chaining
    "http://",
    "https://",
];

/// True when the line starts with a recognised proxy URI scheme.
pub fn is_proxy_uri(line: &str) -> bool {
    let lower = line.to_ascii_lowercase();
    URI_SCHEMES.iter().any(|s| lower.starts_with(s))
}

/// Parse a nodes file body: one URI per line, `#` comments and blank lines
/// skipped, unrecognised lines dropped.
pub fn parse_nodes_content(content: &str) -> Vec<NodeConfig> {
    content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .filter(|l| is_proxy_uri(l))
        .map(|l| NodeConfig {
            uri: l.to_string(),
            ..NodeConfig::default()
        })
        .collect()
}

/// Write nodes back out, one URI per line, re-encoding the node name into
/// the URI fragment so the file round-trips names.
pub fn write_nodes_file(path: &Path, nodes: &[NodeConfig]) -> std::io::Result<()> {
    let mut out = String::new();
    for node in nodes {
        let uri = if node.name.is_empty() {
            node.uri.clone()
        } else {
            let base = node.uri.split_once('#').map_or(node.uri.as_str(), |(b, _)| b);
            format!("{}#{}", base, percent_encode(&node.name))
        };
        out.push_str(&uri);
        out.push('\n');
    }
    std::fs::write(path, out)
}

fn percent_decode(s: &str) -> String {
    let mut bytes = Vec::with_capacity(s.len());
    let mut iter = s.bytes();
    while let Some(b) = iter.next() {
        match b {
            b'%' => {
                let hi = iter.next();
                let lo = iter.next();
                match (hi.and_then(hex_val), lo.and_then(hex_val)) {
                    (Some(h), Some(l)) => bytes.push(h << 4 | l),
                    _ => bytes.push(b'%'),
                }
            }
            b'+' => bytes.push(b' '),
            other => bytes.push(other),
        }
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

fn percent_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}
