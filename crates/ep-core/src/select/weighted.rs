//! Latency/success scoring.
//!
//! Each candidate gets `latency_score · λ + success_score · σ` with λ+σ = 1.
//! Latency is normalised as `1000 / (ms + 1)` so 10 ms ≈ 91, 100 ms ≈ 9.9,
//! 500 ms ≈ 2; success is a step function over availability and the failure
//! streak. `select_best` is deterministic; `select_weighted` draws with
//! probability proportional to weight.

use rand::Rng;

use crate::monitor::Snapshot;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeightParams {
    pub latency_factor: f64,
    pub success_factor: f64,
}

impl Default for WeightParams {
    fn default() -> Self {
        Self::BALANCED
    }
}

impl WeightParams {
    pub const LATENCY_FIRST: Self = Self {
        latency_factor: 0.8,
        success_factor: 0.2,
    };
    pub const STABLE_FIRST: Self = Self {
        latency_factor: 0.3,
        success_factor: 0.7,
    };
    pub const BALANCED: Self = Self {
        latency_factor: 0.6,
        success_factor: 0.4,
    };

    pub fn preset(mode: &str) -> Option<Self> {
        match mode {
            "latency_first" => Some(Self::LATENCY_FIRST),
            "stable_first" => Some(Self::STABLE_FIRST),
            "balanced" => Some(Self::BALANCED),
            _ => None,
        }
    }

    /// Resolve query parameters: a preset name wins; otherwise an explicit
    /// pair is normalised to sum 1; otherwise the balanced default. Bad
    /// floats in the explicit pair are an error, an unknown preset is not.
    pub fn from_query(
        weight_mode: &str,
        latency_weight: &str,
        success_rate_weight: &str,
    ) -> Result<Self, std::num::ParseFloatError> {
        if !weight_mode.is_empty() {
            return Ok(Self::preset(weight_mode).unwrap_or_default());
        }
        if latency_weight.is_empty() && success_rate_weight.is_empty() {
            return Ok(Self::default());
        }
        let latency: f64 = if latency_weight.is_empty() {
            0.0
        } else {
            latency_weight.parse()?
        };
        let success: f64 = if success_rate_weight.is_empty() {
            0.0
        } else {
            success_rate_weight.parse()?
        };
        let total = latency + success;
        if total > 0.0 {
            Ok(Self {
                latency_factor: latency / total,
                success_factor: success / total,
            })
        } else {
            Ok(Self::default())
        }
    }
}

pub fn calculate_weight(node: &Snapshot, params: &WeightParams) -> f64 {
    let latency_score = if node.last_latency_ms < 0 {
        50.0
    } else {
        1000.0 / (node.last_latency_ms as f64 + 1.0)
    };

    let success_score = if !node.initial_check_done {
        50.0
    } else if !node.available {
        1.0
    } else if node.failure_count > 0 {
        100.0 / (f64::from(node.failure_count) + 1.0)
    } else {
        100.0
    };

    latency_score * params.latency_factor + success_score * params.success_factor
}

/// Argmax; strictly-greater comparison keeps the first occurrence on ties,
/// so the result is a pure function of the slice and params.
pub(super) fn select_best_index(nodes: &[Snapshot], params: &WeightParams) -> usize {
    let mut best = 0;
    let mut best_weight = f64::MIN;
    for (i, node) in nodes.iter().enumerate() {
        let w = calculate_weight(node, params);
        if w > best_weight {
            best_weight = w;
            best = i;
        }
    }
    best
}

/// Draw with probability proportional to weight; uniform when the total
/// weight is not positive.
pub(super) fn select_weighted_index<R: Rng>(
    nodes: &[Snapshot],
    params: &WeightParams,
    rng: &mut R,
) -> usize {
    let weights: Vec<f64> = nodes
        .iter()
        .map(|n| calculate_weight(n, params))
        .collect();
    let total: f64 = weights.iter().sum();
    if total <= 0.0 {
        return rng.gen_range(0..nodes.len());
    }
    let r = rng.gen::<f64>() * total;
    let mut cumulative = 0.0;
    for (i, w) in weights.iter().enumerate() {
        cumulative += w;
        if r <= cumulative {
            return i;
        }
    }
    // float rounding can leave r a hair past the sum
    nodes.len() - 1
}

/// Sample without replacement by repeated weighted draws over the
/// shrinking pool.
pub(super) fn select_multiple_weighted<R: Rng>(
    nodes: &[Snapshot],
    count: usize,
    params: &WeightParams,
    rng: &mut R,
) -> Vec<Snapshot> {
    let mut remaining = nodes.to_vec();
    let mut out = Vec::with_capacity(count);
    while out.len() < count && !remaining.is_empty() {
        let idx = select_weighted_index(&remaining, params, rng);
        out.push(remaining.swap_remove(idx));
    }
    out
}

/// Stable-sort by score descending, take the top `count`.
pub(super) fn select_multiple_best(
    nodes: &[Snapshot],
    count: usize,
    params: &WeightParams,
) -> Vec<Snapshot> {
    let mut scored: Vec<(f64, &Snapshot)> = nodes
        .iter()
        .map(|n| (calculate_weight(n, params), n))
        .collect();
    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    scored
        .into_iter()
        .take(count)
        .map(|(_, n)| n.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn node(tag: &str, latency: i64, failures: u32, available: bool, checked: bool) -> Snapshot {
        let mut s = Snapshot::for_test(tag, tag, latency);
        s.failure_count = failures;
        s.available = available;
        s.initial_check_done = checked;
        s
    }

    #[test]
    fn score_matches_the_formula() {
        let p = WeightParams::BALANCED;
        // healthy, 10ms: 1000/11 * 0.6 + 100 * 0.4
        let healthy = node("a", 10, 0, true, true);
        let expect = 1000.0 / 11.0 * 0.6 + 100.0 * 0.4;
        assert!((calculate_weight(&healthy, &p) - expect).abs() < 1e-9);

        // untested latency scores 50
        let untested = node("b", -1, 0, true, true);
        let expect = 50.0 * 0.6 + 100.0 * 0.4;
        assert!((calculate_weight(&untested, &p) - expect).abs() < 1e-9);

        // checked but down scores success 1
        let down = node("c", 30, 0, false, true);
        let expect = 1000.0 / 31.0 * 0.6 + 1.0 * 0.4;
        assert!((calculate_weight(&down, &p) - expect).abs() < 1e-9);

        // unchecked scores success 50
        let fresh = node("d", -1, 0, false, false);
        let expect = 50.0 * 0.6 + 50.0 * 0.4;
        assert!((calculate_weight(&fresh, &p) - expect).abs() < 1e-9);

        // failures divide the success score
        let flaky = node("e", 10, 3, true, true);
        let expect = 1000.0 / 11.0 * 0.6 + 25.0 * 0.4;
        assert!((calculate_weight(&flaky, &p) - expect).abs() < 1e-9);
    }

    #[test]
    fn presets_and_normalisation() {
        assert_eq!(
            WeightParams::from_query("latency_first", "", "").unwrap(),
            WeightParams::LATENCY_FIRST
        );
        // unknown preset falls back to balanced, no error
        assert_eq!(
            WeightParams::from_query("bogus", "", "").unwrap(),
            WeightParams::BALANCED
        );
        let p = WeightParams::from_query("", "3", "1").unwrap();
        assert!((p.latency_factor - 0.75).abs() < 1e-9);
        assert!((p.success_factor - 0.25).abs() < 1e-9);
        assert!(WeightParams::from_query("", "abc", "").is_err());
    }

    #[test]
    fn select_best_is_deterministic() {
        let nodes = vec![
            node("slow", 500, 0, true, true),
            node("fast", 10, 0, true, true),
            node("mid", 100, 0, true, true),
        ];
        for _ in 0..10 {
            assert_eq!(select_best_index(&nodes, &WeightParams::LATENCY_FIRST), 1);
        }
    }

    #[test]
    fn weighted_draw_tracks_the_weights() {
        let nodes = vec![node("fast", 10, 0, true, true), node("slow", 900, 0, true, true)];
        let p = WeightParams::LATENCY_FIRST;
        let wf = calculate_weight(&nodes[0], &p);
        let ws = calculate_weight(&nodes[1], &p);
        let expected = wf / (wf + ws);

        let mut rng = StdRng::seed_from_u64(7);
        let trials = 20_000;
        let mut fast = 0;
        for _ in 0..trials {
            if select_weighted_index(&nodes, &p, &mut rng) == 0 {
                fast += 1;
            }
        }
        let observed = f64::from(fast) / f64::from(trials);
        assert!(
            (observed - expected).abs() < 0.02,
            "observed {observed}, expected {expected}"
        );
    }

    #[test]
    fn multiple_best_orders_by_score() {
        let nodes = vec![
            node("c", 500, 0, true, true),
            node("a", 10, 0, true, true),
            node("b", 100, 0, true, true),
        ];
        let out = select_multiple_best(&nodes, 2, &WeightParams::LATENCY_FIRST);
        let tags: Vec<&str> = out.iter().map(|s| s.tag.as_str()).collect();
        assert_eq!(tags, ["a", "b"]);
    }

    #[test]
    fn multiple_weighted_is_without_replacement() {
        let nodes = vec![
            node("a", 10, 0, true, true),
            node("b", 20, 0, true, true),
            node("c", 30, 0, true, true),
        ];
        let mut rng = StdRng::seed_from_u64(42);
        let out = select_multiple_weighted(&nodes, 3, &WeightParams::BALANCED, &mut rng);
        let mut tags: Vec<&str> = out.iter().map(|s| s.tag.as_str()).collect();
        tags.sort_unstable();
        assert_eq!(tags, ["a", "b", "c"]);
    }
}
