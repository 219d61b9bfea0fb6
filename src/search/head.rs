//! One search head: an independent forest of candidate prefixes with its
//! own rng. Leaf selection balances exploitation of low-latency prefixes
//! against exploration of under-sampled ones, and persistent failures
//! push a prefix out of contention.

use std::cmp::Ordering;
use std::net::IpAddr;

use rand_chacha::ChaCha20Rng;
use tracing::warn;

use crate::cidr::Prefix;

use super::SearchConfig;

/// Exploration constant for leaf selection, scaled by the probe timeout
/// so the exploration bonus lives in the same unit as the latency mean.
/// 1.5 keeps roughly UCB1-like pressure toward under-sampled leaves
/// without drowning out a clear latency signal.
const EXPLORATION_C: f64 = 1.5;

#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct PrefixStats {
    pub samples: u64,
    pub ok: u64,
    pub fail: u64,
    pub sum_score: f64,
    pub min_score: f64,
}

impl PrefixStats {
    fn new() -> Self {
        Self {
            min_score: f64::INFINITY,
            ..Self::default()
        }
    }

    /// Mean score over ok probes only; failures feed `fail_rate` instead
    /// so a lossy prefix cannot fake a good mean.
    pub fn mean(&self) -> f64 {
        self.sum_score / (self.ok.max(1) as f64)
    }

    pub fn fail_rate(&self) -> f64 {
        self.fail as f64 / (self.samples.max(1) as f64)
    }

    fn record(&mut self, ok: bool, score_ms: f64) {
        self.samples += 1;
        if ok {
            self.ok += 1;
            self.sum_score += score_ms;
            if score_ms < self.min_score {
                self.min_score = score_ms;
            }
        } else {
            self.fail += 1;
        }
    }
}

#[derive(Clone, Debug)]
pub(crate) struct PrefixNode {
    pub prefix: Prefix,
    pub stats: PrefixStats,
    pub depth_bits: u8,
}

impl PrefixNode {
    fn new(prefix: Prefix) -> Self {
        Self {
            prefix,
            stats: PrefixStats::new(),
            depth_bits: prefix.bits(),
        }
    }
}

pub(crate) struct HeadState {
    pub id: usize,
    rng: ChaCha20Rng,
    /// Live leaves only. A split replaces the parent with its children;
    /// beam eviction removes the worst leaves outright. Both count as
    /// frozen nodes.
    nodes: Vec<PrefixNode>,
    pub total_samples: u64,
    pub frozen: u64,
}

impl HeadState {
    pub fn new(id: usize, rng: ChaCha20Rng, roots: &[Prefix], cfg: &SearchConfig) -> Self {
        let mut head = Self {
            id,
            rng,
            nodes: roots.iter().copied().map(PrefixNode::new).collect(),
            total_samples: 0,
            frozen: 0,
        };
        head.enforce_beam(cfg, 0.0);
        head
    }

    /// Selection score, lower is better. Unsampled leaves are taken
    /// first. Sampled leaves weigh the ok-mean (or the failure penalty
    /// when nothing succeeded yet), inflated by the failure rate, minus
    /// an exploration bonus that decays as samples accumulate.
    fn selection_score(&self, node: &PrefixNode, timeout_ms: f64) -> f64 {
        let st = &node.stats;
        if st.samples == 0 {
            return f64::NEG_INFINITY;
        }
        let base = if st.ok > 0 {
            st.mean()
        } else {
            timeout_ms * 2.0
        };
        let explore = EXPLORATION_C
            * timeout_ms
            * ((self.total_samples.max(1) as f64).ln() / st.samples as f64).sqrt();
        base * (1.0 + st.fail_rate()) - explore
    }

    /// Leaf indices ordered best-first: score, then fewer samples, then
    /// prefix order.
    fn ranked(&self, timeout_ms: f64) -> Vec<usize> {
        let mut idx: Vec<usize> = (0..self.nodes.len()).collect();
        idx.sort_by(|&a, &b| {
            let na = &self.nodes[a];
            let nb = &self.nodes[b];
            self.selection_score(na, timeout_ms)
                .partial_cmp(&self.selection_score(nb, timeout_ms))
                .unwrap_or(Ordering::Equal)
                .then_with(|| na.stats.samples.cmp(&nb.stats.samples))
                .then_with(|| na.prefix.cmp(&nb.prefix))
        });
        idx
    }

    /// Picks the most promising leaf within the beam and samples a random
    /// address inside it. Returns None when no live leaf remains.
    pub fn pick(&mut self, cfg: &SearchConfig, timeout_ms: f64) -> Option<(Prefix, IpAddr)> {
        if self.nodes.is_empty() {
            return None;
        }
        let ranked = self.ranked(timeout_ms);
        let best = ranked[..ranked.len().min(cfg.beam.max(1))][0];
        let prefix = self.nodes[best].prefix;
        let ip = prefix.random_addr(&mut self.rng);
        Some((prefix, ip))
    }

    /// Records one completed probe against the leaf that produced it and
    /// evaluates the split trigger. Returns the leaf's (samples, ok,
    /// fail) counters after the update. A leaf evicted while the probe
    /// was in flight is accounted as a one-off.
    pub fn record(
        &mut self,
        prefix: Prefix,
        ok: bool,
        score_ms: f64,
        cfg: &SearchConfig,
        timeout_ms: f64,
    ) -> (u64, u64, u64) {
        self.total_samples += 1;
        let Some(idx) = self.nodes.iter().position(|n| n.prefix == prefix) else {
            return (1, ok as u64, (!ok) as u64);
        };
        self.nodes[idx].stats.record(ok, score_ms);
        let st = self.nodes[idx].stats;
        self.maybe_split(idx, cfg, timeout_ms);
        (st.samples, st.ok, st.fail)
    }

    fn maybe_split(&mut self, idx: usize, cfg: &SearchConfig, timeout_ms: f64) {
        let node = &self.nodes[idx];
        let (step, cap) = if node.prefix.is_ipv4() {
            (cfg.split_step_v4, cfg.max_bits_v4)
        } else {
            (cfg.split_step_v6, cfg.max_bits_v6)
        };
        if step == 0 || node.stats.samples < cfg.min_samples_split {
            return;
        }
        if node.prefix.bits() as u32 + step as u32 > cap as u32 {
            return;
        }
        let interesting = node.stats.ok >= 1
            || (node.stats.fail_rate() < 1.0 && self.ranked(timeout_ms)[0] == idx);
        if !interesting {
            return;
        }

        let children = match node.prefix.split(step) {
            Ok(children) => children,
            Err(e) => {
                // Trigger conditions should make this unreachable; keep
                // the run alive regardless.
                warn!(head = self.id, error = %e, "split rejected");
                return;
            }
        };

        self.nodes.swap_remove(idx);
        self.frozen += 1;
        self.nodes.extend(children.into_iter().map(PrefixNode::new));
        self.enforce_beam(cfg, timeout_ms);
    }

    /// Caps the live leaf set at the beam width, evicting the
    /// worst-ranked leaves.
    fn enforce_beam(&mut self, cfg: &SearchConfig, timeout_ms: f64) {
        let beam = cfg.beam.max(1);
        if self.nodes.len() <= beam {
            return;
        }
        let ranked = self.ranked(timeout_ms);
        let keep: Vec<PrefixNode> = ranked[..beam].iter().map(|&i| self.nodes[i].clone()).collect();
        self.frozen += (self.nodes.len() - beam) as u64;
        self.nodes = keep;
    }

    pub fn live_leaves(&self) -> usize {
        self.nodes.len()
    }

    pub fn deepest_bits(&self) -> u8 {
        self.nodes.iter().map(|n| n.depth_bits).max().unwrap_or(0)
    }

    pub fn best_observed_ms(&self) -> Option<f64> {
        let best = self
            .nodes
            .iter()
            .map(|n| n.stats.min_score)
            .fold(f64::INFINITY, f64::min);
        best.is_finite().then_some(best)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn cfg() -> SearchConfig {
        SearchConfig {
            beam: 8,
            min_samples_split: 4,
            split_step_v4: 1,
            max_bits_v4: 25,
            ..SearchConfig::default()
        }
    }

    fn head_with(roots: &[&str], cfg: &SearchConfig) -> HeadState {
        let roots: Vec<Prefix> = roots.iter().map(|s| Prefix::parse(s).unwrap()).collect();
        HeadState::new(0, ChaCha20Rng::seed_from_u64(1), &roots, cfg)
    }

    #[test]
    fn test_unsampled_leaves_picked_first() {
        let cfg = cfg();
        let mut head = head_with(&["1.1.1.0/24", "2.2.2.0/24"], &cfg);
        let (first, _) = head.pick(&cfg, 3000.0).unwrap();
        head.record(first, true, 50.0, &cfg, 3000.0);
        let (second, _) = head.pick(&cfg, 3000.0).unwrap();
        assert_ne!(first, second, "the unsampled leaf must come first");
    }

    #[test]
    fn test_low_mean_preferred_once_sampled() {
        let cfg = cfg();
        let mut head = head_with(&["1.1.1.0/24", "2.2.2.0/24"], &cfg);
        let fast = Prefix::parse("1.1.1.0/24").unwrap();
        let slow = Prefix::parse("2.2.2.0/24").unwrap();
        for _ in 0..3 {
            head.record(fast, true, 20.0, &cfg, 3000.0);
            head.record(slow, true, 900.0, &cfg, 3000.0);
        }
        let (picked, ip) = head.pick(&cfg, 3000.0).unwrap();
        assert_eq!(picked, fast);
        assert!(fast.contains(ip));
    }

    #[test]
    fn test_persistent_failures_back_off() {
        let cfg = cfg();
        let mut head = head_with(&["1.1.1.0/24", "2.2.2.0/24"], &cfg);
        let dead = Prefix::parse("1.1.1.0/24").unwrap();
        let alive = Prefix::parse("2.2.2.0/24").unwrap();
        for _ in 0..3 {
            head.record(dead, false, 6000.0, &cfg, 3000.0);
            head.record(alive, true, 800.0, &cfg, 3000.0);
        }
        let (picked, _) = head.pick(&cfg, 3000.0).unwrap();
        assert_eq!(picked, alive, "all-failing prefix must rank worse");
    }

    #[test]
    fn test_split_replaces_parent_with_children() {
        let cfg = cfg();
        let mut head = head_with(&["1.1.1.0/24"], &cfg);
        let parent = Prefix::parse("1.1.1.0/24").unwrap();
        for _ in 0..cfg.min_samples_split {
            head.record(parent, true, 30.0, &cfg, 3000.0);
        }
        assert_eq!(head.live_leaves(), 2, "parent should split into two /25s");
        assert_eq!(head.frozen, 1);
        let (picked, _) = head.pick(&cfg, 3000.0).unwrap();
        assert_eq!(picked.bits(), 25);
        assert!(parent.contains(picked.addr()));
    }

    #[test]
    fn test_no_split_past_family_cap() {
        let mut cfg = cfg();
        cfg.max_bits_v4 = 24;
        let mut head = head_with(&["1.1.1.0/24"], &cfg);
        let parent = Prefix::parse("1.1.1.0/24").unwrap();
        for _ in 0..20 {
            head.record(parent, true, 30.0, &cfg, 3000.0);
        }
        assert_eq!(head.live_leaves(), 1, "leaf at the cap stays live, unsplit");
        assert_eq!(head.frozen, 0);
        assert!(head.pick(&cfg, 3000.0).is_some());
    }

    #[test]
    fn test_beam_eviction_bounds_live_set() {
        let mut cfg = cfg();
        cfg.beam = 2;
        cfg.split_step_v4 = 2;
        cfg.max_bits_v4 = 26;
        let mut head = head_with(&["1.1.1.0/24"], &cfg);
        let parent = Prefix::parse("1.1.1.0/24").unwrap();
        for _ in 0..cfg.min_samples_split {
            head.record(parent, true, 30.0, &cfg, 3000.0);
        }
        assert_eq!(head.live_leaves(), 2, "four children cut to beam width");
        assert!(head.frozen >= 3, "parent plus evicted children are frozen");
    }

    #[test]
    fn test_stats_mean_ignores_failures() {
        let mut st = PrefixStats::new();
        st.record(true, 100.0);
        st.record(false, 6000.0);
        st.record(true, 200.0);
        assert_eq!(st.mean(), 150.0);
        assert_eq!(st.samples, 3);
        assert_eq!(st.fail, 1);
        assert!((st.fail_rate() - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(st.min_score, 100.0);
    }
}
