use std::fs::File;
use std::io::{self, Write};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use mcis::output::{self, OutputFormat};
use mcis::probe::ProbeConfig;
use mcis::search::{self, SearchConfig, SearchRequest};

/// Monte-Carlo IP searcher: finds the fastest HTTPS-responding addresses
/// inside large prefixes under a bounded probe budget.
#[derive(Parser, Debug)]
#[command(name = "mcis", version, about)]
struct Cli {
    /// CIDR to search (repeatable), e.g. 1.1.0.0/16 or 2606:4700::/32
    #[arg(long = "cidr")]
    cidr: Vec<String>,

    /// File with one CIDR per line; `#` starts a comment
    #[arg(long = "cidr-file")]
    cidr_file: Option<PathBuf>,

    /// Total probe budget (number of addresses to probe)
    #[arg(long, default_value_t = 2000)]
    budget: usize,

    /// Number of best addresses to keep and output
    #[arg(long = "top", default_value_t = 20)]
    top: usize,

    /// Probe worker pool size
    #[arg(long, default_value_t = 200)]
    concurrency: usize,

    /// Number of diversified search heads
    #[arg(long, default_value_t = 4)]
    heads: usize,

    /// Max live candidate prefixes per head
    #[arg(long, default_value_t = 32)]
    beam: usize,

    /// Per-probe deadline, e.g. 3s or 500ms
    #[arg(long, default_value = "3s", value_parser = parse_duration)]
    timeout: Duration,

    /// TLS SNI server name
    #[arg(long, default_value = "example.com")]
    sni: String,

    /// HTTP Host header
    #[arg(long = "host-header", default_value = "example.com")]
    host_header: String,

    /// HTTP path to request
    #[arg(long, default_value = "/cdn-cgi/trace")]
    path: String,

    /// Output format
    #[arg(long = "out", value_enum, default_value = "jsonl")]
    out: OutputFormat,

    /// Write output to a file instead of stdout
    #[arg(long = "out-file")]
    out_file: Option<PathBuf>,

    /// Prefix-bit increment when splitting an IPv4 prefix
    #[arg(long = "split-step-v4", default_value_t = 2)]
    split_step_v4: u8,

    /// Prefix-bit increment when splitting an IPv6 prefix
    #[arg(long = "split-step-v6", default_value_t = 4)]
    split_step_v6: u8,

    /// Samples required on a prefix before it can split
    #[arg(long = "min-samples-split", default_value_t = 20)]
    min_samples_split: u64,

    /// Deepest IPv4 prefix to drill down to
    #[arg(long = "max-bits-v4", default_value_t = 24)]
    max_bits_v4: u8,

    /// Deepest IPv6 prefix to drill down to
    #[arg(long = "max-bits-v6", default_value_t = 56)]
    max_bits_v6: u8,

    /// RNG seed; 0 picks a time-based seed (echoed in the debug summary)
    #[arg(long, default_value_t = 0)]
    seed: i64,

    /// Admit failed probes into the top-N ranking
    #[arg(long = "collect-failures")]
    collect_failures: bool,

    /// Verbose progress to stderr
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "info" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    if cli.cidr.is_empty() && cli.cidr_file.is_none() {
        bail!("at least one of --cidr or --cidr-file is required");
    }

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let cfg = SearchConfig {
        budget: cli.budget,
        top_n: cli.top,
        concurrency: cli.concurrency,
        heads: cli.heads,
        beam: cli.beam,
        split_step_v4: cli.split_step_v4,
        split_step_v6: cli.split_step_v6,
        min_samples_split: cli.min_samples_split,
        max_bits_v4: cli.max_bits_v4,
        max_bits_v6: cli.max_bits_v6,
        seed: cli.seed,
        verbose: cli.verbose,
        collect_failures: cli.collect_failures,
    };
    let req = SearchRequest {
        cidrs: cli.cidr,
        cidr_file: cli.cidr_file,
        probe: ProbeConfig {
            timeout: cli.timeout,
            sni: cli.sni,
            host_header: cli.host_header,
            path: cli.path,
        },
    };

    let res = search::run(cancel, cfg, req).await?;

    match cli.out_file {
        Some(path) => {
            let mut f = File::create(&path)
                .with_context(|| format!("create output file {}", path.display()))?;
            output::write(&mut f, cli.out, &res)?;
            f.flush().context("flush output file")?;
        }
        None => {
            let stdout = io::stdout();
            let mut w = stdout.lock();
            output::write(&mut w, cli.out, &res)?;
            w.flush().context("flush stdout")?;
        }
    }
    Ok(())
}

fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut term = match signal(SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!("install SIGTERM handler: {e}");
                    let _ = tokio::signal::ctrl_c().await;
                    info!("interrupt received, finishing up");
                    cancel.cancel();
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        info!("interrupt received, finishing up");
        cancel.cancel();
    });
}

/// Parses durations in the flag-friendly forms `3s`, `500ms`, `2m`, or a
/// bare number of seconds.
fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        return ms
            .trim()
            .parse::<u64>()
            .map(Duration::from_millis)
            .map_err(|e| format!("bad milliseconds value: {e}"));
    }
    if let Some(secs) = s.strip_suffix('s') {
        return parse_secs(secs.trim());
    }
    if let Some(mins) = s.strip_suffix('m') {
        return mins
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite() && *v >= 0.0)
            .map(|v| Duration::from_secs_f64(v * 60.0))
            .ok_or_else(|| format!("bad minutes value: {s:?}"));
    }
    parse_secs(s)
}

fn parse_secs(s: &str) -> Result<Duration, String> {
    s.parse::<f64>()
        .ok()
        .filter(|v| v.is_finite() && *v >= 0.0)
        .map(Duration::from_secs_f64)
        .ok_or_else(|| format!("bad seconds value: {s:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration_forms() {
        assert_eq!(parse_duration("3s").unwrap(), Duration::from_secs(3));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("1.5s").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse_duration("4").unwrap(), Duration::from_secs(4));
        assert!(parse_duration("soon").is_err());
        assert!(parse_duration("-1s").is_err());
    }

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::parse_from(["mcis", "--cidr", "1.1.0.0/16"]);
        assert_eq!(cli.budget, 2000);
        assert_eq!(cli.top, 20);
        assert_eq!(cli.concurrency, 200);
        assert_eq!(cli.heads, 4);
        assert_eq!(cli.beam, 32);
        assert_eq!(cli.timeout, Duration::from_secs(3));
        assert_eq!(cli.sni, "example.com");
        assert_eq!(cli.path, "/cdn-cgi/trace");
        assert_eq!(cli.out, OutputFormat::Jsonl);
        assert_eq!(cli.split_step_v4, 2);
        assert_eq!(cli.split_step_v6, 4);
        assert_eq!(cli.min_samples_split, 20);
        assert_eq!(cli.max_bits_v4, 24);
        assert_eq!(cli.max_bits_v6, 56);
        assert_eq!(cli.seed, 0);
        assert!(!cli.verbose);
    }

    #[test]
    fn test_cli_repeatable_cidr() {
        let cli = Cli::parse_from([
            "mcis", "--cidr", "1.1.0.0/16", "--cidr", "2606:4700::/32", "-v",
        ]);
        assert_eq!(cli.cidr.len(), 2);
        assert!(cli.verbose);
    }
}
