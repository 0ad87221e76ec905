//! Result export: CSV, top-N config list, full sorted list, clean IPs
//!
//! Everything lands under `results/` with a timestamp in the name, and an
//! existing file is never overwritten — a numeric suffix is appended
//! instead.

use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use tracing::info;

use crate::{
    sweep::SweepHit,
    types::{Endpoint, Via},
};

/// Output directory, created on demand
pub const RESULTS_DIR: &str = "results";

/// One endpoint in the final report, already scored
#[derive(Debug, Clone)]
pub struct ReportRow {
    pub endpoint: Endpoint,
    /// Composite score; 0 for dead endpoints
    pub score: f64,
    pub throughput_mbps: Option<f64>,
    /// Full TCP+TLS handshake time from the latency pass
    pub latency_ms: Option<f64>,
    pub ttfb_ms: Option<f64>,
    pub alive: bool,
    /// Host names that resolved to this endpoint
    pub domains: Vec<String>,
    /// Member config URIs (substituted when the input was a template)
    pub uris: Vec<String>,
    /// Host that served the ranked sample
    pub via: Option<Via>,
    pub error_kind: Option<String>,
}

/// Assembled outcome of a measure run, rows ordered alive-best-first then
/// dead.
#[derive(Debug, Clone, Default)]
pub struct ScanReport {
    pub rows: Vec<ReportRow>,
    /// Input lines skipped as malformed
    pub malformed_inputs: usize,
    /// Hosts that failed to resolve
    pub dns_failures: usize,
    /// Whether the run was interrupted (partial results)
    pub cancelled: bool,
}

impl ScanReport {
    pub fn alive_rows(&self) -> impl Iterator<Item = &ReportRow> {
        self.rows.iter().filter(|r| r.alive)
    }
}

/// Paths written by [`export_results`]
#[derive(Debug, Clone)]
pub struct ExportPaths {
    pub csv: PathBuf,
    pub configs: PathBuf,
    pub full: PathBuf,
}

fn timestamp() -> String {
    chrono::Local::now().format("%Y%m%d_%H%M%S").to_string()
}

fn results_dir() -> Result<PathBuf> {
    let dir = PathBuf::from(RESULTS_DIR);
    fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
    Ok(dir)
}

/// Next free variant of `dir/name`: `name`, `name-1`, `name-2`, …
pub fn unique_path(dir: &Path, name: &str) -> PathBuf {
    let first = dir.join(name);
    if !first.exists() {
        return first;
    }
    let (stem, ext) = match name.rsplit_once('.') {
        Some((s, e)) => (s.to_string(), format!(".{e}")),
        None => (name.to_string(), String::new()),
    };
    for i in 1.. {
        let candidate = dir.join(format!("{stem}-{i}{ext}"));
        if !candidate.exists() {
            return candidate;
        }
    }
    unreachable!()
}

/// Format an optional float with the given precision, empty when absent
fn num(v: Option<f64>, precision: usize) -> String {
    match v {
        Some(v) if v >= 0.0 => format!("{v:.precision$}"),
        _ => String::new(),
    }
}

/// RFC 4180-style CSV: header row, LF endings, numeric fields unquoted.
pub fn write_csv<W: Write>(report: &ScanReport, w: W) -> Result<()> {
    let mut csv = csv::WriterBuilder::new().terminator(csv::Terminator::Any(b'\n')).from_writer(w);
    csv.write_record([
        "ip",
        "port",
        "score",
        "throughput_mbps",
        "latency_ms",
        "ttfb_ms",
        "alive",
        "n_domains",
        "n_configs",
        "via",
    ])?;
    for row in &report.rows {
        csv.write_record([
            row.endpoint.ip.to_string(),
            row.endpoint.port.to_string(),
            format!("{:.3}", row.score),
            num(row.throughput_mbps, 2),
            num(row.latency_ms, 1),
            num(row.ttfb_ms, 1),
            row.alive.to_string(),
            row.domains.len().to_string(),
            row.uris.len().to_string(),
            row.via.map(|v| v.to_string()).unwrap_or_default(),
        ])?;
    }
    csv.flush()?;
    Ok(())
}

/// Reference line for rows that carry no URI (domain-JSON or bare-IP runs)
fn bare_line(row: &ReportRow) -> String {
    let doms = row.domains.iter().take(3).cloned().collect::<Vec<_>>().join(", ");
    let extra = if row.domains.len() > 3 {
        format!(" (+{} more)", row.domains.len() - 3)
    } else {
        String::new()
    };
    if row.alive {
        format!("{}  # score={:.3} domains={}{}", row.endpoint, row.score, doms, extra)
    } else {
        format!("{}  # DEAD domains={}{}", row.endpoint, doms, extra)
    }
}

/// Best-first URI list, at most `top` entries (0 = everything alive).
pub fn write_top_configs<W: Write>(report: &ScanReport, mut w: W, top: usize) -> Result<()> {
    let limit = if top == 0 { usize::MAX } else { top };
    let mut n = 0usize;
    'outer: for row in report.alive_rows() {
        if row.uris.is_empty() {
            writeln!(w, "{}", bare_line(row))?;
            n += 1;
            if n >= limit {
                break;
            }
            continue;
        }
        for uri in &row.uris {
            writeln!(w, "{uri}")?;
            n += 1;
            if n >= limit {
                break 'outer;
            }
        }
    }
    Ok(())
}

/// Every URI sorted best to worst, dead endpoints at the bottom.
pub fn write_full_sorted<W: Write>(report: &ScanReport, mut w: W) -> Result<()> {
    for row in &report.rows {
        if row.uris.is_empty() {
            writeln!(w, "{}", bare_line(row))?;
        } else {
            for uri in &row.uris {
                writeln!(w, "{uri}")?;
            }
        }
    }
    Ok(())
}

/// Write the three report files. `csv_override` / `configs_override` honor
/// `-o` and `--output-configs`, still without clobbering anything.
pub fn export_results(
    report: &ScanReport,
    stem: &str,
    top: usize,
    csv_override: Option<&Path>,
    configs_override: Option<&Path>,
) -> Result<ExportPaths> {
    let dir = results_dir()?;
    let ts = timestamp();

    let csv_path = match csv_override {
        Some(p) => sidestep(p),
        None => unique_path(&dir, &format!("{stem}_{ts}_results.csv")),
    };
    let configs_path = match configs_override {
        Some(p) => sidestep(p),
        None => {
            let name = if top == 0 {
                format!("{stem}_{ts}_all_sorted.txt")
            } else {
                format!("{stem}_{ts}_top{top}.txt")
            };
            unique_path(&dir, &name)
        }
    };
    let full_path = unique_path(&dir, &format!("{stem}_{ts}_full_sorted.txt"));

    let csv_file = fs::File::create(&csv_path)
        .with_context(|| format!("writing {}", csv_path.display()))?;
    write_csv(report, csv_file)?;

    let cfg_file = fs::File::create(&configs_path)
        .with_context(|| format!("writing {}", configs_path.display()))?;
    write_top_configs(report, cfg_file, top)?;

    let full_file = fs::File::create(&full_path)
        .with_context(|| format!("writing {}", full_path.display()))?;
    write_full_sorted(report, full_file)?;

    info!(
        "💾 results saved: {} | {} | {}",
        csv_path.display(),
        configs_path.display(),
        full_path.display()
    );
    Ok(ExportPaths { csv: csv_path, configs: configs_path, full: full_path })
}

/// Keep an explicit output path from clobbering an existing file
fn sidestep(p: &Path) -> PathBuf {
    let dir = p.parent().unwrap_or_else(|| Path::new("."));
    let name = p.file_name().and_then(|n| n.to_str()).unwrap_or("out.txt");
    unique_path(dir, name)
}

/// Write the sweep output: one `ip[:port]` per line, best first.
pub fn export_clean_ips(hits: &[SweepHit]) -> Result<PathBuf> {
    let dir = results_dir()?;
    let path = unique_path(&dir, &format!("clean_ips_{}.txt", timestamp()));
    let mut f = fs::File::create(&path).with_context(|| format!("writing {}", path.display()))?;
    for hit in hits {
        writeln!(f, "{}", hit.endpoint)?;
    }
    info!("💾 {} clean IPs saved to {}", hits.len(), path.display());
    Ok(path)
}
