//! Subscription content detection.
//!
//! Providers serve one of three shapes: a base64 blob wrapping URI lines
//! (classic v2ray), a Clash YAML document (has a `proxies:` key), or plain
//! URI lines. Detection is heuristic, in that order.

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine as _;
use ep_config::nodes::parse_nodes_content;
use ep_config::NodeConfig;

use crate::{clash, SubscribeError};

pub fn parse_content(content: &str) -> Result<Vec<NodeConfig>, SubscribeError> {
    let mut content = content.trim().to_string();

    if let Some(decoded) = try_base64(&content) {
        content = decoded;
    }
    if content.contains("proxies:") {
        return clash::parse_clash_yaml(&content);
    }
    Ok(parse_nodes_content(&content))
}

/// Base64 heuristic: no URI scheme marker anywhere, and the whole body
/// (newlines stripped) decodes.
fn try_base64(content: &str) -> Option<String> {
    if content.is_empty() || content.contains("://") {
        return None;
    }
    let compact: String = content
        .chars()
        .filter(|c| !c.is_ascii_whitespace())
        .collect();
    let bytes = STANDARD
        .decode(&compact)
        .or_else(|_| STANDARD_NO_PAD.decode(&compact))
        .ok()?;
    String::from_utf8(bytes).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_uri_lines() {
        let nodes = parse_content("ss://a@h:1#one\nvmess://id@h:2#two\n").unwrap();
        assert_eq!(nodes.len(), 2);
    }

    #[test]
    fn base64_wrapped_lines() {
        let body = STANDARD.encode("trojan://pw@h:443#hk\nss://a@h:1#sg\n");
        let nodes = parse_content(&body).unwrap();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].uri, "trojan://pw@h:443#hk");
    }

    #[test]
    fn uri_body_is_not_mistaken_for_base64() {
        // valid base64 alphabet, but the scheme marker wins
        let nodes = parse_content("ss://YWJjZA@h:1#x").unwrap();
        assert_eq!(nodes.len(), 1);
    }

    #[test]
    fn clash_yaml_detected() {
        let body = "proxies:\n  - name: hk-1\n    type: trojan\n    server: h\n    port: 443\n    password: pw\n";
        let nodes = parse_content(body).unwrap();
        assert_eq!(nodes.len(), 1);
        assert!(nodes[0].uri.starts_with("trojan://pw@h:443"));
        assert_eq!(nodes[0].name, "hk-1");
    }
}
