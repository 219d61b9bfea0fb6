//! The adaptive Monte-Carlo prefix search engine. Multiple diversified
//! heads explore a shared input prefix set; a fixed-size worker pool
//! keeps probes in flight against the network; per-prefix statistics
//! drive leaf selection and prefix splitting; winners accumulate in a
//! shared deduplicating top-N.

mod head;
mod topn;

use std::collections::{BTreeMap, HashSet};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::cidr::{self, Prefix};
use crate::probe::{HttpProber, ProbeConfig, ProbeOutcome, Prober};

use head::HeadState;
pub use topn::TopN;

#[derive(Clone, Debug)]
pub struct SearchConfig {
    pub budget: usize,
    pub top_n: usize,
    pub concurrency: usize,
    pub heads: usize,
    pub beam: usize,
    pub split_step_v4: u8,
    pub split_step_v6: u8,
    pub min_samples_split: u64,
    pub max_bits_v4: u8,
    pub max_bits_v6: u8,
    pub seed: i64,
    pub verbose: bool,
    pub collect_failures: bool,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            budget: 2000,
            top_n: 20,
            concurrency: 200,
            heads: 4,
            beam: 32,
            split_step_v4: 2,
            split_step_v6: 4,
            min_samples_split: 20,
            max_bits_v4: 24,
            max_bits_v6: 56,
            seed: 0,
            verbose: false,
            collect_failures: false,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct SearchRequest {
    pub cidrs: Vec<String>,
    pub cidr_file: Option<PathBuf>,
    pub probe: ProbeConfig,
}

/// One row of the final ranking: a probed address, the leaf prefix it was
/// drawn from, and that leaf's counters at recording time.
#[derive(Clone, Debug, Serialize)]
pub struct TopResult {
    pub ip: IpAddr,
    pub prefix: Prefix,
    pub ok: bool,
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub connect_ms: u64,
    pub tls_ms: u64,
    pub ttfb_ms: u64,
    pub total_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace: Option<BTreeMap<String, String>>,
    pub when: DateTime<Utc>,
    pub score_ms: f64,
    pub prefix_samples: u64,
    pub prefix_ok: u64,
    pub prefix_fail: u64,
}

impl TopResult {
    pub fn from_outcome(
        outcome: ProbeOutcome,
        prefix: Prefix,
        score_ms: f64,
        prefix_samples: u64,
        prefix_ok: u64,
        prefix_fail: u64,
    ) -> Self {
        Self {
            ip: outcome.ip,
            prefix,
            ok: outcome.ok,
            status: outcome.status,
            error: outcome.error,
            connect_ms: outcome.connect_ms,
            tls_ms: outcome.tls_ms,
            ttfb_ms: outcome.ttfb_ms,
            total_ms: outcome.total_ms,
            trace: outcome.trace,
            when: outcome.when,
            score_ms,
            prefix_samples,
            prefix_ok,
            prefix_fail,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct HeadSummary {
    pub id: usize,
    pub live_leaves: usize,
    pub frozen: u64,
    pub samples: u64,
    pub deepest_bits: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub best_ms: Option<f64>,
}

#[derive(Clone, Debug, Serialize)]
pub struct RunSummary {
    /// Effective rng seed; echo it back via --seed to reproduce the
    /// dispatch sequence.
    pub seed: i64,
    pub dispatched: u64,
    pub completed: u64,
    pub ok: u64,
    pub fail: u64,
    pub elapsed_ms: u64,
    pub heads: Vec<HeadSummary>,
}

#[derive(Clone, Debug, Serialize)]
pub struct RunResult {
    pub top: Vec<TopResult>,
    pub summary: RunSummary,
}

/// Parses and dedupes the request's prefixes, builds the network prober
/// and runs the search.
pub async fn run(
    cancel: CancellationToken,
    cfg: SearchConfig,
    req: SearchRequest,
) -> Result<RunResult> {
    let mut roots = cidr::parse_cidrs(&req.cidrs).context("parse --cidr")?;
    if let Some(path) = &req.cidr_file {
        roots.extend(cidr::read_cidrs_from_file(path)?);
    }
    if roots.is_empty() {
        bail!("no prefixes to search: provide --cidr or --cidr-file");
    }

    let probe_cfg = req.probe.normalized();
    let timeout = probe_cfg.timeout;
    let prober: Arc<dyn Prober> = Arc::new(HttpProber::new(probe_cfg)?);
    run_with_prober(cancel, cfg, roots, prober, timeout).await
}

/// Engine entry point with an injectable prober; `probe_timeout` feeds
/// the failure penalty and the exploration scale.
pub async fn run_with_prober(
    cancel: CancellationToken,
    cfg: SearchConfig,
    roots: Vec<Prefix>,
    prober: Arc<dyn Prober>,
    probe_timeout: Duration,
) -> Result<RunResult> {
    let roots = dedupe(roots);
    if roots.is_empty() {
        bail!("no prefixes to search");
    }
    let started = Instant::now();

    let seed = effective_seed(cfg.seed);
    let head_count = cfg.heads.max(1);
    let heads: Vec<Mutex<HeadState>> = (0..head_count)
        .map(|i| {
            let rng = ChaCha20Rng::seed_from_u64((seed as u64) ^ (i as u64));
            Mutex::new(HeadState::new(i, rng, &roots, &cfg))
        })
        .collect();

    let timeout_ms = probe_timeout.as_millis().max(1) as f64;
    let engine = Arc::new(Engine {
        topn: TopN::new(cfg.top_n),
        timeout_ms,
        progress_every: (cfg.budget / 50).max(1) as u64,
        budget: cfg.budget as u64,
        heads,
        prober,
        cancel: cancel.clone(),
        dispatched: AtomicU64::new(0),
        completed: AtomicU64::new(0),
        ok_probes: AtomicU64::new(0),
        failed_probes: AtomicU64::new(0),
        cfg,
    });

    info!(
        seed,
        heads = head_count,
        prefixes = roots.len(),
        budget = engine.cfg.budget,
        "search starting"
    );

    let sem = Arc::new(Semaphore::new(engine.cfg.concurrency.max(1)));
    let mut tasks: JoinSet<()> = JoinSet::new();
    let mut cursor = 0usize;
    let mut sent = 0usize;

    while sent < engine.cfg.budget {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            permit = sem.clone().acquire_owned() => match permit {
                Ok(p) => p,
                Err(_) => break,
            },
        };
        // Reap finished workers so the join set stays small.
        while tasks.try_join_next().is_some() {}

        // Round-robin across heads, skipping exhausted ones.
        let mut picked = None;
        for offset in 0..head_count {
            let h = (cursor + offset) % head_count;
            let choice = engine.heads[h].lock().pick(&engine.cfg, engine.timeout_ms);
            if let Some((prefix, ip)) = choice {
                picked = Some((h, prefix, ip));
                cursor = (h + 1) % head_count;
                break;
            }
        }
        let Some((head_idx, prefix, ip)) = picked else {
            drop(permit);
            debug!("all heads exhausted, stopping early");
            break;
        };

        sent += 1;
        engine.dispatched.fetch_add(1, Ordering::Relaxed);
        let engine = engine.clone();
        tasks.spawn(async move {
            let _permit = permit;
            let probe_started = Instant::now();
            let outcome = tokio::select! {
                biased;
                _ = engine.cancel.cancelled() => {
                    ProbeOutcome::tagged_failure(ip, "canceled", probe_started.elapsed())
                }
                outcome = engine.prober.probe(ip) => outcome,
            };
            engine.complete(head_idx, prefix, outcome);
        });
    }

    // Budget (or cancellation) reached: drain whatever is in flight.
    while tasks.join_next().await.is_some() {}

    let completed = engine.completed.load(Ordering::Relaxed);
    if completed == 0 {
        bail!("no probes completed");
    }

    let heads_summary: Vec<HeadSummary> = engine
        .heads
        .iter()
        .map(|h| {
            let h = h.lock();
            HeadSummary {
                id: h.id,
                live_leaves: h.live_leaves(),
                frozen: h.frozen,
                samples: h.total_samples,
                deepest_bits: h.deepest_bits(),
                best_ms: h.best_observed_ms(),
            }
        })
        .collect();

    let summary = RunSummary {
        seed,
        dispatched: engine.dispatched.load(Ordering::Relaxed),
        completed,
        ok: engine.ok_probes.load(Ordering::Relaxed),
        fail: engine.failed_probes.load(Ordering::Relaxed),
        elapsed_ms: started.elapsed().as_millis() as u64,
        heads: heads_summary,
    };
    info!(
        completed = summary.completed,
        ok = summary.ok,
        fail = summary.fail,
        elapsed_ms = summary.elapsed_ms,
        "search finished"
    );

    Ok(RunResult {
        top: engine.topn.snapshot(),
        summary,
    })
}

struct Engine {
    cfg: SearchConfig,
    timeout_ms: f64,
    budget: u64,
    progress_every: u64,
    heads: Vec<Mutex<HeadState>>,
    topn: TopN,
    prober: Arc<dyn Prober>,
    cancel: CancellationToken,
    dispatched: AtomicU64,
    completed: AtomicU64,
    ok_probes: AtomicU64,
    failed_probes: AtomicU64,
}

impl Engine {
    /// Completion path for one probe: stats update and split evaluation
    /// under the owning head's lock, then the shared top-N.
    fn complete(&self, head_idx: usize, prefix: Prefix, outcome: ProbeOutcome) {
        let score_ms = if outcome.ok {
            outcome.total_ms as f64
        } else {
            self.timeout_ms * 2.0
        };

        let (samples, ok, fail) = self.heads[head_idx].lock().record(
            prefix,
            outcome.ok,
            score_ms,
            &self.cfg,
            self.timeout_ms,
        );

        if outcome.ok {
            self.ok_probes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_probes.fetch_add(1, Ordering::Relaxed);
        }

        if outcome.ok || self.cfg.collect_failures {
            self.topn
                .consider(TopResult::from_outcome(outcome, prefix, score_ms, samples, ok, fail));
        }

        let done = self.completed.fetch_add(1, Ordering::Relaxed) + 1;
        if self.cfg.verbose && done % self.progress_every == 0 {
            self.report_progress(done);
        }
    }

    fn report_progress(&self, done: u64) {
        let mut active_heads = 0usize;
        let mut beam_max = 0usize;
        for head in &self.heads {
            let head = head.lock();
            let live = head.live_leaves();
            if live > 0 {
                active_heads += 1;
            }
            beam_max = beam_max.max(live);
        }
        let top1 = self
            .topn
            .best()
            .map(|r| format!("{:.1}ms", r.score_ms))
            .unwrap_or_else(|| "-".to_string());
        info!(
            completed = done,
            budget = self.budget,
            top1 = %top1,
            active_heads,
            beam_max,
            "progress"
        );
    }
}

fn effective_seed(seed: i64) -> i64 {
    if seed != 0 {
        return seed;
    }
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(1);
    if nanos == 0 {
        1
    } else {
        nanos
    }
}

fn dedupe(roots: Vec<Prefix>) -> Vec<Prefix> {
    let mut seen = HashSet::new();
    roots.into_iter().filter(|p| seen.insert(*p)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::net::IpAddr;

    /// Deterministic prober: latency derived from the last v4 octet, a
    /// fixed timestamp, and an invocation counter for budget accounting.
    struct FakeProber {
        calls: AtomicU64,
    }

    impl FakeProber {
        fn new() -> Self {
            Self {
                calls: AtomicU64::new(0),
            }
        }

        fn latency_for(ip: IpAddr) -> u64 {
            let IpAddr::V4(v4) = ip else { return 500 };
            let octet = v4.octets()[3] as u64;
            if octet < 128 {
                octet
            } else {
                // Upper half of the /24 responds strictly slower.
                328 - octet
            }
        }
    }

    #[async_trait]
    impl Prober for FakeProber {
        async fn probe(&self, ip: IpAddr) -> ProbeOutcome {
            self.calls.fetch_add(1, Ordering::Relaxed);
            let total_ms = Self::latency_for(ip);
            ProbeOutcome {
                ip,
                ok: true,
                status: 200,
                error: None,
                connect_ms: 1,
                tls_ms: 2,
                ttfb_ms: total_ms,
                total_ms,
                trace: None,
                when: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            }
        }
    }

    fn scenario_cfg() -> SearchConfig {
        SearchConfig {
            budget: 32,
            top_n: 3,
            concurrency: 1,
            heads: 1,
            beam: 4,
            min_samples_split: 8,
            split_step_v4: 1,
            max_bits_v4: 25,
            seed: 1,
            ..SearchConfig::default()
        }
    }

    async fn run_scenario(cfg: SearchConfig) -> RunResult {
        let roots = vec![Prefix::parse("1.1.1.0/24").unwrap()];
        run_with_prober(
            CancellationToken::new(),
            cfg,
            roots,
            Arc::new(FakeProber::new()),
            Duration::from_secs(3),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_engine_splits_and_finds_fast_half() {
        let res = run_scenario(scenario_cfg()).await;

        assert_eq!(res.summary.dispatched, 32);
        assert_eq!(res.summary.completed, 32);
        let head = &res.summary.heads[0];
        assert!(head.frozen >= 1, "the /24 should have split");
        assert_eq!(head.deepest_bits, 25);

        let best = &res.top[0];
        let fast_half = Prefix::parse("1.1.1.0/25").unwrap();
        assert!(
            fast_half.contains(best.ip),
            "top entry must come from the fast lower half, got {}",
            best.ip
        );
        assert!(
            best.score_ms < 73.0,
            "lower-half latencies beat anything the upper half can produce"
        );
    }

    #[tokio::test]
    async fn test_budget_is_exact_upper_bound() {
        let prober = Arc::new(FakeProber::new());
        let cfg = SearchConfig {
            budget: 10,
            concurrency: 4,
            heads: 2,
            seed: 5,
            ..SearchConfig::default()
        };
        let roots = vec![Prefix::parse("1.1.1.0/24").unwrap()];
        let res = run_with_prober(
            CancellationToken::new(),
            cfg,
            roots,
            prober.clone(),
            Duration::from_secs(3),
        )
        .await
        .unwrap();
        assert_eq!(prober.calls.load(Ordering::Relaxed), 10);
        assert_eq!(res.summary.dispatched, 10);
    }

    #[tokio::test]
    async fn test_identical_seeds_produce_identical_jsonl() {
        let mut jsons = Vec::new();
        for _ in 0..2 {
            let mut cfg = scenario_cfg();
            cfg.seed = 7;
            let res = run_scenario(cfg).await;
            let mut buf = Vec::new();
            for row in &res.top {
                serde_json::to_writer(&mut buf, row).unwrap();
                buf.push(b'\n');
            }
            jsons.push(String::from_utf8(buf).unwrap());
        }
        assert_eq!(jsons[0], jsons[1]);
    }

    #[tokio::test]
    async fn test_duplicate_roots_are_deduped() {
        let roots = vec![
            Prefix::parse("1.1.1.0/24").unwrap(),
            Prefix::parse("1.1.1.7/24").unwrap(),
        ];
        let cfg = SearchConfig {
            budget: 4,
            concurrency: 1,
            heads: 1,
            seed: 3,
            ..SearchConfig::default()
        };
        let res = run_with_prober(
            CancellationToken::new(),
            cfg,
            roots,
            Arc::new(FakeProber::new()),
            Duration::from_secs(3),
        )
        .await
        .unwrap();
        assert_eq!(res.summary.heads[0].live_leaves, 1);
    }

    #[tokio::test]
    async fn test_cancellation_stops_dispatch() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let cfg = SearchConfig {
            budget: 1000,
            concurrency: 1,
            heads: 1,
            seed: 2,
            ..SearchConfig::default()
        };
        let roots = vec![Prefix::parse("1.1.1.0/24").unwrap()];
        let err = run_with_prober(
            cancel,
            cfg,
            roots,
            Arc::new(FakeProber::new()),
            Duration::from_secs(3),
        )
        .await;
        // Cancelled before anything ran: no probes completed.
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn test_failures_excluded_from_top_by_default() {
        struct FailingProber;

        #[async_trait]
        impl Prober for FailingProber {
            async fn probe(&self, ip: IpAddr) -> ProbeOutcome {
                let mut out =
                    ProbeOutcome::tagged_failure(ip, "connect refused", Duration::from_millis(1));
                out.when = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
                out
            }
        }

        let cfg = SearchConfig {
            budget: 6,
            concurrency: 1,
            heads: 1,
            seed: 4,
            ..SearchConfig::default()
        };
        let roots = vec![Prefix::parse("1.1.1.0/24").unwrap()];
        let res = run_with_prober(
            CancellationToken::new(),
            cfg.clone(),
            roots.clone(),
            Arc::new(FailingProber),
            Duration::from_secs(3),
        )
        .await
        .unwrap();
        assert!(res.top.is_empty());
        assert_eq!(res.summary.fail, 6);

        let mut with_failures = cfg;
        with_failures.collect_failures = true;
        let res = run_with_prober(
            CancellationToken::new(),
            with_failures,
            roots,
            Arc::new(FailingProber),
            Duration::from_secs(3),
        )
        .await
        .unwrap();
        assert!(!res.top.is_empty());
        assert_eq!(res.top[0].score_ms, 6000.0);
    }
}
