//! Tracing initialisation, guarded so repeated calls are safe.
//!
//! The filter comes from `RUST_LOG` when set, otherwise from the config's
//! `log_level`. Level changes after init require a reload-capable
//! subscriber; we take the simpler route of initialising once and letting
//! `set_level` adjust only when it runs before first init wins.

use std::sync::OnceLock;

use tracing_subscriber::{reload, EnvFilter};

static RELOAD_HANDLE: OnceLock<reload::Handle<EnvFilter, tracing_subscriber::Registry>> =
    OnceLock::new();

fn filter_for(level: &str) -> EnvFilter {
    let level = if level.is_empty() { "info" } else { level };
    let directive = std::env::var("RUST_LOG").unwrap_or_else(|_| level.to_string());
    EnvFilter::new(directive)
}

/// Initialise the subscriber once; later calls are no-ops.
pub fn init(level: &str) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    if RELOAD_HANDLE.get().is_some() {
        return;
    }
    let (filter, handle) = reload::Layer::new(filter_for(level));
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(true).compact();
    if tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .is_ok()
    {
        let _ = RELOAD_HANDLE.set(handle);
    }
}

/// Swap the active filter for the config-provided level (unless `RUST_LOG`
/// overrides it).
pub fn set_level(level: &str) {
    if level.is_empty() || std::env::var("RUST_LOG").is_ok() {
        return;
    }
    if let Some(handle) = RELOAD_HANDLE.get() {
        let _ = handle.reload(filter_for(level));
    }
}
