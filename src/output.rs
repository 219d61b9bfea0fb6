//! Result rendering: JSONL, CSV, tab-separated text, and an indented
//! debug dump of the full run.

use std::io::Write;

use anyhow::{bail, Context, Result};
use clap::ValueEnum;

use crate::search::{RunResult, TopResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Jsonl,
    Csv,
    Text,
    Debug,
}

pub fn write<W: Write>(w: &mut W, format: OutputFormat, res: &RunResult) -> Result<()> {
    match format {
        OutputFormat::Jsonl => write_jsonl(w, &res.top),
        OutputFormat::Csv => write_csv(w, &res.top),
        OutputFormat::Text => write_text(w, &res.top),
        OutputFormat::Debug => write_debug(w, res),
    }
}

pub fn write_jsonl<W: Write>(w: &mut W, rows: &[TopResult]) -> Result<()> {
    for row in rows {
        serde_json::to_writer(&mut *w, row).context("encode result row")?;
        w.write_all(b"\n").context("write result row")?;
    }
    Ok(())
}

const CSV_HEADER: &str = "rank,ip,prefix,ok,status,connect_ms,tls_ms,ttfb_ms,total_ms,\
score_ms,samples_prefix,ok_prefix,fail_prefix,colo";

pub fn write_csv<W: Write>(w: &mut W, rows: &[TopResult]) -> Result<()> {
    writeln!(w, "{CSV_HEADER}").context("write csv header")?;
    for (i, row) in rows.iter().enumerate() {
        writeln!(
            w,
            "{},{},{},{},{},{},{},{},{},{:.2},{},{},{},{}",
            i + 1,
            row.ip,
            row.prefix,
            row.ok,
            row.status,
            row.connect_ms,
            row.tls_ms,
            row.ttfb_ms,
            row.total_ms,
            row.score_ms,
            row.prefix_samples,
            row.prefix_ok,
            row.prefix_fail,
            csv_field(colo(row)),
        )
        .context("write csv row")?;
    }
    Ok(())
}

pub fn write_text<W: Write>(w: &mut W, rows: &[TopResult]) -> Result<()> {
    for (i, row) in rows.iter().enumerate() {
        writeln!(
            w,
            "{}\t{}\t{:.1}ms\tok={}\tstatus={}\tprefix={}\tcolo={}",
            i + 1,
            row.ip,
            row.score_ms,
            row.ok,
            row.status,
            row.prefix,
            colo(row),
        )
        .context("write text row")?;
    }
    Ok(())
}

pub fn write_debug<W: Write>(w: &mut W, res: &RunResult) -> Result<()> {
    serde_json::to_writer_pretty(&mut *w, res).context("encode run result")?;
    w.write_all(b"\n").context("write run result")?;
    Ok(())
}

fn colo(row: &TopResult) -> &str {
    row.trace
        .as_ref()
        .and_then(|t| t.get("colo"))
        .map(String::as_str)
        .unwrap_or("")
}

/// Quotes a CSV field only when it needs it. Every other column here is
/// numeric or an address, so this only ever fires on trace values.
fn csv_field(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

/// Parses a format name for callers that do not go through the CLI.
pub fn parse_format(s: &str) -> Result<OutputFormat> {
    match s {
        "jsonl" => Ok(OutputFormat::Jsonl),
        "csv" => Ok(OutputFormat::Csv),
        "text" => Ok(OutputFormat::Text),
        "debug" => Ok(OutputFormat::Debug),
        other => bail!("unknown output format {other:?} (expected jsonl|csv|text|debug)"),
    }
}
