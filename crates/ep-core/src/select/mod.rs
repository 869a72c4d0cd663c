//! Selection strategies over a candidate snapshot slice. Pure ranking — no
//! I/O; every frontend and the management API share this engine.

mod weighted;

pub use weighted::{calculate_weight, WeightParams};

use std::collections::HashSet;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::monitor::Snapshot;

#[derive(Debug, thiserror::Error)]
#[error("invalid strategy {0:?} (supported: sequential/random/balance/weighted)")]
pub struct UnknownStrategy(pub String);

/// How to pick an upstream from a candidate set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strategy {
    /// Round-robin over the candidate list.
    #[default]
    Sequential,
    /// Uniform draw.
    Random,
    /// Least active connections, first occurrence wins ties.
    Balance,
    /// Latency/success scoring; argmax or weight-proportional draw.
    Weighted,
}

impl FromStr for Strategy {
    type Err = UnknownStrategy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sequential" => Ok(Self::Sequential),
            "random" => Ok(Self::Random),
            "balance" => Ok(Self::Balance),
            "weighted" => Ok(Self::Weighted),
            other => Err(UnknownStrategy(other.to_string())),
        }
    }
}

impl Strategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sequential => "sequential",
            Self::Random => "random",
            Self::Balance => "balance",
            Self::Weighted => "weighted",
        }
    }
}

/// Per-frontend selector state: an atomic round-robin counter and a seeded
/// RNG behind its own mutex, used only within one selection call.
pub struct Selector {
    rr: AtomicU64,
    rng: Mutex<StdRng>,
}

impl Default for Selector {
    fn default() -> Self {
        Self::new()
    }
}

impl Selector {
    pub fn new() -> Self {
        Self {
            rr: AtomicU64::new(0),
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Pick one candidate. `weighted_random` switches the weighted strategy
    /// between the deterministic argmax and the weight-proportional draw.
    pub fn select<'a>(
        &self,
        strategy: Strategy,
        nodes: &'a [Snapshot],
        params: &WeightParams,
        weighted_random: bool,
    ) -> Option<&'a Snapshot> {
        if nodes.is_empty() {
            return None;
        }
        let idx = match strategy {
            Strategy::Sequential => self.next_rr(nodes.len()),
            Strategy::Random => self.rng.lock().gen_range(0..nodes.len()),
            Strategy::Balance => least_active_index(nodes),
            Strategy::Weighted => {
                if weighted_random {
                    weighted::select_weighted_index(nodes, params, &mut *self.rng.lock())
                } else {
                    weighted::select_best_index(nodes, params)
                }
            }
        };
        nodes.get(idx)
    }

    /// Up to `count` distinct candidates; the full set when `count` covers it.
    pub fn select_multiple(
        &self,
        strategy: Strategy,
        nodes: &[Snapshot],
        count: usize,
        params: &WeightParams,
        weighted_random: bool,
    ) -> Vec<Snapshot> {
        if nodes.is_empty() || count == 0 {
            return Vec::new();
        }
        if count >= nodes.len() {
            return nodes.to_vec();
        }
        match strategy {
            Strategy::Sequential => {
                let base = self.next_rr(nodes.len());
                (0..count)
                    .map(|i| nodes[(base + i) % nodes.len()].clone())
                    .collect()
            }
            Strategy::Random => {
                let mut rng = self.rng.lock();
                let mut used = HashSet::new();
                let mut out = Vec::with_capacity(count);
                // uniform draws with dedup; bounded so a degenerate RNG can't spin
                let mut attempts = 0usize;
                while out.len() < count && attempts < nodes.len() * 16 {
                    attempts += 1;
                    let idx = rng.gen_range(0..nodes.len());
                    if used.insert(idx) {
                        out.push(nodes[idx].clone());
                    }
                }
                let mut fill = 0;
                while out.len() < count {
                    if used.insert(fill) {
                        out.push(nodes[fill].clone());
                    }
                    fill += 1;
                }
                out
            }
            Strategy::Balance => {
                let mut order: Vec<usize> = (0..nodes.len()).collect();
                order.sort_by_key(|&i| nodes[i].active_connections);
                order.truncate(count);
                order.into_iter().map(|i| nodes[i].clone()).collect()
            }
            Strategy::Weighted => {
                if weighted_random {
                    weighted::select_multiple_weighted(nodes, count, params, &mut *self.rng.lock())
                } else {
                    weighted::select_multiple_best(nodes, count, params)
                }
            }
        }
    }

    fn next_rr(&self, len: usize) -> usize {
        (self.rr.fetch_add(1, Ordering::Relaxed) % len as u64) as usize
    }
}

fn least_active_index(nodes: &[Snapshot]) -> usize {
    let mut best = 0;
    for (i, node) in nodes.iter().enumerate().skip(1) {
        if node.active_connections < nodes[best].active_connections {
            best = i;
        }
    }
    best
}
