//! Subscription handling: fetch remote node lists, detect their format
//! (base64 blob, Clash YAML, plain URI lines) and keep them fresh.

use std::time::Duration;

use ep_config::{Config, NodeConfig};

mod clash;
mod http;
pub mod parse;
pub mod refresh;

pub use http::fetch_text;
pub use refresh::{RefreshTrigger, Refresher};

#[derive(Debug, thiserror::Error)]
pub enum SubscribeError {
    #[error("fetch error: {0}")]
    Fetch(String),
    #[error("subscription returned status {0}")]
    Status(u16),
    #[error("parse error: {0}")]
    Parse(String),
}

/// Fetch every configured subscription and return the merged node list.
///
/// A failing source is skipped with a warning; the caller decides whether
/// the remainder is enough to proceed.
pub async fn fetch_all(entries: &[String], timeout: Duration) -> Vec<NodeConfig> {
    let mut nodes = Vec::new();
    for entry in entries {
        let (sub_name, url) = Config::parse_subscription_entry(entry);
        match fetch_one(url, timeout).await {
            Ok(mut fetched) => {
                tracing::info!(count = fetched.len(), url, "loaded subscription");
                if let Some(sub_name) = sub_name {
                    for node in &mut fetched {
                        if node.name.is_empty() {
                            if let Some(n) = node.name_from_uri() {
                                node.name = n;
                            }
                        }
                        if !node.name.is_empty() {
                            node.name = format!("{}|{}", node.name, sub_name);
                        }
                    }
                }
                nodes.extend(fetched);
            }
            Err(e) => {
                tracing::warn!(url, error = %e, "failed to load subscription, skipping");
            }
        }
    }
    nodes
}

async fn fetch_one(url: &str, timeout: Duration) -> Result<Vec<NodeConfig>, SubscribeError> {
    let body = http::fetch_text(url, timeout).await?;
    parse::parse_content(&body)
}
