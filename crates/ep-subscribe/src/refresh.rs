//! Periodic subscription refresh.
//!
//! The refresher owns the fetch cadence only: every `interval` (or on a
//! manual trigger from the management API) it re-downloads all sources and
//! hands the merged node list to the runtime over a channel. The receiver
//! decides whether the new set is good enough to swap in (the
//! `min_available_nodes` gate needs live probing, which lives next to the
//! monitor, not here).

use ep_config::{NodeConfig, SubscriptionRefreshConfig};
use tokio::sync::{broadcast, mpsc};

use crate::fetch_all;

/// Handle for the management API's manual refresh endpoint.
#[derive(Clone)]
pub struct RefreshTrigger(mpsc::Sender<()>);

impl RefreshTrigger {
    /// Returns false when a refresh is already queued.
    pub fn fire(&self) -> bool {
        self.0.try_send(()).is_ok()
    }
}

pub struct Refresher {
    entries: Vec<String>,
    settings: SubscriptionRefreshConfig,
    updates: mpsc::Sender<Vec<NodeConfig>>,
    trigger_rx: mpsc::Receiver<()>,
}

impl Refresher {
    pub fn new(
        entries: Vec<String>,
        settings: SubscriptionRefreshConfig,
        updates: mpsc::Sender<Vec<NodeConfig>>,
    ) -> (Self, RefreshTrigger) {
        let (trigger_tx, trigger_rx) = mpsc::channel(1);
        (
            Self {
                entries,
                settings,
                updates,
                trigger_rx,
            },
            RefreshTrigger(trigger_tx),
        )
    }

    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.settings.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // the immediate first tick; startup already fetched

        tracing::info!(
            interval = %humantime::format_duration(self.settings.interval),
            sources = self.entries.len(),
            "subscription refresh started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                Some(()) = self.trigger_rx.recv() => {
                    tracing::info!("manual subscription refresh triggered");
                }
                _ = shutdown.recv() => {
                    tracing::debug!("subscription refresh stopping");
                    return;
                }
            }

            let nodes = fetch_all(&self.entries, self.settings.timeout).await;
            if nodes.is_empty() {
                tracing::warn!("subscription refresh produced no nodes, keeping current set");
                continue;
            }
            if self.updates.send(nodes).await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn trigger_queues_at_most_one_refresh() {
        let (updates, _updates_rx) = mpsc::channel(1);
        let (mut refresher, trigger) = Refresher::new(
            vec!["https://example.com/sub".into()],
            SubscriptionRefreshConfig::default(),
            updates,
        );
        assert!(trigger.fire());
        assert!(!trigger.fire(), "second fire should report already pending");
        assert!(refresher.trigger_rx.recv().await.is_some());
        assert!(trigger.fire());
    }
}
