//! cfray CLI — headless front-end over the scanner engines
//!
//! Exit codes: 0 success, 1 malformed input, 2 runtime error,
//! 130 interrupted.

use std::{path::PathBuf, process::ExitCode, time::Duration};

use anyhow::Result;
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use cfray::{
    engine::Scanner,
    export,
    input::{self, LoadedInput},
    latency::LatencyParams,
    speed::{self, SpeedParams},
    sweep::{self, SweepConfig, SweepHit},
    types::{CleanMode, SpeedMode, LATENCY_WORKERS, SPEED_WORKERS, SWEEP_WORKERS},
    ScanReport,
};

// ── CLI ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Parser)]
#[command(
    name = "cfray",
    version,
    about = "⚡ Test VLESS/VMess configs for latency + download speed, find clean Cloudflare IPs",
    long_about = "Latency-tests every edge IP behind the input configs, speed-tests the best\n\
                  through a progressive funnel, and exports the top proxy URIs.\n\
                  --find-clean sweeps the published Cloudflare ranges instead."
)]
struct Cli {
    /// Input file: proxy URIs, a domains JSON, or (with --template) an address list
    #[arg(short = 'i', long)]
    input: Option<PathBuf>,

    /// Subscription URL (plain or base64 body)
    #[arg(long)]
    sub: Option<String>,

    /// Base URI whose edge address is replaced per input address
    #[arg(long)]
    template: Option<String>,

    /// Speed funnel preset
    #[arg(short = 'm', long, default_value = "normal",
          value_parser = ["quick", "normal", "thorough"])]
    mode: String,

    /// Custom rounds, e.g. "1MB:200,5MB:50,20MB:20" (K=0 tests all)
    #[arg(long)]
    rounds: Option<String>,

    /// Latency/sweep workers (default 50, sweeps 300)
    #[arg(short = 'w', long)]
    workers: Option<usize>,

    /// Download workers
    #[arg(long, default_value_t = SPEED_WORKERS)]
    speed_workers: usize,

    /// Latency handshake timeout (seconds)
    #[arg(long, default_value_t = 5.0)]
    timeout: f64,

    /// Download timeout (seconds)
    #[arg(long, default_value_t = 30.0)]
    speed_timeout: f64,

    /// Latency only, skip every download round
    #[arg(long)]
    skip_download: bool,

    /// Export the top N configs (0 = all, sorted best to worst)
    #[arg(long, default_value_t = 50)]
    top: usize,

    /// Plain text output (this binary is always headless; an external
    /// dashboard may subscribe to the event stream)
    #[arg(long)]
    no_tui: bool,

    /// CSV output path
    #[arg(short = 'o', long)]
    output: Option<PathBuf>,

    /// Top-config list output path
    #[arg(long)]
    output_configs: Option<PathBuf>,

    /// Sweep the CDN ranges for clean IPs instead of measuring configs
    #[arg(long)]
    find_clean: bool,

    /// Sweep scope
    #[arg(long, default_value = "normal",
          value_parser = ["quick", "normal", "full", "mega"])]
    clean_mode: String,

    /// Override the built-in ranges: a file or comma-separated CIDRs
    #[arg(long)]
    subnets: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

const EXIT_MALFORMED: u8 = 1;
const EXIT_RUNTIME: u8 = 2;
const EXIT_INTERRUPTED: u8 = 130;

// ── Entry Point ──────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    setup_logging(&cli.log_level);

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("💥 {e:#}");
            ExitCode::from(EXIT_RUNTIME)
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    if cli.no_tui {
        // headless is the only mode here; the dashboard is a separate
        // consumer of the event stream
        info!("running headless");
    }
    let scanner = Scanner::new();

    let cancel = scanner.cancel_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("🛑 interrupt — draining in-flight probes, partial results will be exported");
            cancel.cancel();
        }
    });

    if cli.find_clean {
        run_clean(&scanner, &cli).await
    } else {
        run_measure(&scanner, &cli).await
    }
}

// ── Clean-IP sweep ───────────────────────────────────────────────────────────

fn parse_clean_mode(s: &str) -> CleanMode {
    match s {
        "quick" => CleanMode::Quick,
        "full" => CleanMode::Full,
        "mega" => CleanMode::Mega,
        _ => CleanMode::Normal,
    }
}

async fn run_clean(scanner: &Scanner, cli: &Cli) -> Result<ExitCode> {
    let mode = parse_clean_mode(&cli.clean_mode);
    let subnets = match &cli.subnets {
        Some(arg) => match sweep::parse_subnets_arg(arg) {
            Ok(nets) => Some(nets),
            Err(e) => {
                error!("{e:#}");
                return Ok(ExitCode::from(EXIT_MALFORMED));
            }
        },
        None => None,
    };

    let cfg = SweepConfig {
        mode,
        workers: cli.workers.unwrap_or(SWEEP_WORKERS),
        timeout: Duration::from_secs_f64(cli.timeout),
        ..Default::default()
    };
    info!("🔍 clean IP finder — mode {}, {} workers", mode.label(), cfg.workers);

    let hits = scanner.sweep(&cfg, subnets, None).await;
    print_clean_results(&hits);

    if hits.is_empty() {
        info!("no clean IPs found, nothing saved");
    } else {
        export::export_clean_ips(&hits)?;
    }

    // With a template, found IPs feed straight into the speed pipeline
    if let Some(template) = &cli.template {
        if !hits.is_empty() && !scanner.cancel_flag().is_cancelled() {
            let addrs: Vec<String> = hits.iter().map(|h| h.endpoint.to_string()).collect();
            let loaded = match input::generate_from_template(template, &addrs) {
                Ok(l) => l,
                Err(e) => {
                    error!("{e}");
                    return Ok(ExitCode::from(EXIT_MALFORMED));
                }
            };
            info!("⚡ continuing into speed test with {} generated configs", loaded.seeds.len());
            return measure_and_export(scanner, cli, loaded, "clean").await;
        }
    }

    if scanner.cancel_flag().is_cancelled() {
        return Ok(ExitCode::from(EXIT_INTERRUPTED));
    }
    Ok(ExitCode::SUCCESS)
}

fn print_clean_results(hits: &[SweepHit]) {
    println!("{:=<50}", "");
    println!("{:>4} {:<22} {:>8}", "#", "Address", "Latency");
    println!("{:=<50}", "");
    for (i, hit) in hits.iter().take(30).enumerate() {
        println!("{:>4} {:<22} {:>6.0}ms", i + 1, hit.endpoint.to_string(), hit.tls_ms);
    }
    if hits.len() > 30 {
        println!("     ...and {} more", hits.len() - 30);
    }
}

// ── Config measurement ───────────────────────────────────────────────────────

fn parse_speed_mode(s: &str) -> SpeedMode {
    match s {
        "quick" => SpeedMode::Quick,
        "thorough" => SpeedMode::Thorough,
        _ => SpeedMode::Normal,
    }
}

/// Load configs by the input-shape priority: template + address list,
/// subscription, then input file. A malformed template surfaces as
/// [`cfray::ScanError::MalformedUri`] so the caller can exit 1.
async fn load_configs(cli: &Cli) -> Result<LoadedInput> {
    if let Some(template) = &cli.template {
        let Some(path) = &cli.input else {
            anyhow::bail!("--template requires -i with an address list");
        };
        let addrs = input::load_addresses(path)?;
        return Ok(input::generate_from_template(template, &addrs)?);
    }
    if let Some(url) = &cli.sub {
        return input::fetch_subscription(url).await;
    }
    if let Some(path) = &cli.input {
        return input::load_input_file(path);
    }
    anyhow::bail!("one of --input, --sub, or --template is required (or --find-clean)");
}

async fn run_measure(scanner: &Scanner, cli: &Cli) -> Result<ExitCode> {
    let loaded = match load_configs(cli).await {
        Ok(l) => l,
        Err(e) => {
            if let Some(cfray::ScanError::MalformedUri { .. }) = e.downcast_ref() {
                error!("{e}");
                return Ok(ExitCode::from(EXIT_MALFORMED));
            }
            return Err(e);
        }
    };
    info!("📥 loaded {} entries from {}", loaded.seeds.len(), loaded.source);
    if loaded.malformed > 0 {
        warn!("⚠️ skipped {} malformed input lines", loaded.malformed);
    }
    if loaded.seeds.is_empty() {
        error!("no valid configs in input");
        return Ok(ExitCode::from(EXIT_MALFORMED));
    }

    let stem = cli
        .input
        .as_ref()
        .and_then(|p| p.file_stem())
        .and_then(|s| s.to_str())
        .map(str::to_string)
        .unwrap_or_else(|| if cli.sub.is_some() { "sub".into() } else { "scan".into() });

    measure_and_export(scanner, cli, loaded, &stem).await
}

async fn measure_and_export(
    scanner: &Scanner,
    cli: &Cli,
    loaded: LoadedInput,
    stem: &str,
) -> Result<ExitCode> {
    let latency_params = LatencyParams {
        workers: cli.workers.unwrap_or(LATENCY_WORKERS),
        timeout: Duration::from_secs_f64(cli.timeout),
        ..Default::default()
    };

    let speed_params = if cli.skip_download {
        None
    } else {
        let rounds = match &cli.rounds {
            Some(arg) => match speed::parse_rounds_arg(arg) {
                Ok(r) => r,
                Err(e) => {
                    error!("invalid --rounds: {e}");
                    return Ok(ExitCode::from(EXIT_MALFORMED));
                }
            },
            None => parse_speed_mode(&cli.mode).rounds(),
        };
        Some(SpeedParams {
            workers: cli.speed_workers,
            timeout: Duration::from_secs_f64(cli.speed_timeout),
            rounds,
        })
    };

    let report = scanner
        .measure(loaded.seeds, &latency_params, speed_params.as_ref(), loaded.malformed)
        .await;

    print_report(&report);
    export::export_results(
        &report,
        stem,
        cli.top,
        cli.output.as_deref(),
        cli.output_configs.as_deref(),
    )?;

    if report.cancelled {
        return Ok(ExitCode::from(EXIT_INTERRUPTED));
    }
    Ok(ExitCode::SUCCESS)
}

fn print_report(report: &ScanReport) {
    let alive = report.alive_rows().count();
    println!("{:=<78}", "");
    println!(
        "{:>4} {:<20} {:>4} {:>8} {:>8} {:>9} {:>7}",
        "#", "Endpoint", "Dom", "Conn ms", "TTFB ms", "Mbps", "Score"
    );
    println!("{:=<78}", "");
    for (rank, row) in report.rows.iter().take(50).enumerate() {
        let conn = row.latency_ms.map(|v| format!("{v:7.1}")).unwrap_or_else(|| "      -".into());
        let ttfb = row.ttfb_ms.map(|v| format!("{v:7.1}")).unwrap_or_else(|| "      -".into());
        let mbps = row
            .throughput_mbps
            .map(|v| format!("{v:8.2}"))
            .unwrap_or_else(|| "       -".into());
        let score = if row.alive { format!("{:6.3}", row.score) } else { "  dead".into() };
        println!(
            "{:>4} {:<20} {:>4} {} {} {} {}",
            rank + 1,
            row.endpoint.to_string(),
            row.domains.len(),
            conn,
            ttfb,
            mbps,
            score
        );
    }
    println!();
    println!(
        "{} alive, {} dead, {} dns failures, {} malformed lines",
        alive,
        report.rows.len() - alive,
        report.dns_failures,
        report.malformed_inputs
    );
}

// ── Helpers ──────────────────────────────────────────────────────────────────

fn setup_logging(level: &str) {
    let env_filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(env_filter).with_target(false).init();
}
