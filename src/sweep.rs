//! Clean-IP sweep engine
//!
//! Expands the published CDN subnets into candidate addresses at the
//! selected sampling density, probes each with a bounded worker pool, and
//! optionally verifies CDN ownership from the response headers. Hits are
//! streamed in completion order; the final list is sorted by handshake
//! time.

use std::{
    net::Ipv4Addr,
    path::Path,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{Context, Result};
use ipnet::Ipv4Net;
use rand::seq::SliceRandom;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    sync::{broadcast, mpsc},
    time::timeout,
};
use tracing::{debug, info};

use crate::{
    error::ScanError,
    tls::TlsDialer,
    types::{CancelFlag, CdnSignature, CleanMode, Endpoint, ScanEvent, CF_SUBNETS, CLOUDFLARE_SIG, SWEEP_WORKERS, LATENCY_TIMEOUT},
};

/// Sweep parameters
#[derive(Debug, Clone)]
pub struct SweepConfig {
    /// Sampling density and verification level
    pub mode: CleanMode,
    /// Concurrent probes
    pub workers: usize,
    /// Per-probe handshake budget
    pub timeout: Duration,
    /// CDN identity the verification step checks for
    pub signature: CdnSignature,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            mode: CleanMode::Normal,
            workers: SWEEP_WORKERS,
            timeout: LATENCY_TIMEOUT,
            signature: CLOUDFLARE_SIG,
        }
    }
}

/// One reachable (and, in verified modes, confirmed) edge
#[derive(Debug, Clone, Copy)]
pub struct SweepHit {
    pub endpoint: Endpoint,
    /// Full TCP + TLS handshake time
    pub tls_ms: f64,
}

/// The built-in published ranges
pub fn builtin_subnets() -> Vec<Ipv4Net> {
    CF_SUBNETS.iter().map(|s| s.parse().expect("builtin cidr")).collect()
}

/// `--subnets` accepts a file (one CIDR per line, `#` comments) or a
/// comma-separated list.
pub fn parse_subnets_arg(arg: &str) -> Result<Vec<Ipv4Net>> {
    let entries: Vec<String> = if Path::new(arg).is_file() {
        std::fs::read_to_string(arg)
            .with_context(|| format!("reading subnet list {arg}"))?
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .map(str::to_string)
            .collect()
    } else {
        arg.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect()
    };
    let mut nets = Vec::with_capacity(entries.len());
    for e in &entries {
        let net: Ipv4Net = e
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid CIDR {e:?} in --subnets"))?;
        nets.push(net.trunc());
    }
    if nets.is_empty() {
        anyhow::bail!("--subnets produced no CIDRs");
    }
    Ok(nets)
}

/// Split into deduplicated /24 blocks; longer prefixes pass through whole.
fn split_to_24s(subnets: &[Ipv4Net]) -> Vec<Ipv4Net> {
    let mut seen = std::collections::HashSet::new();
    let mut blocks = Vec::new();
    for net in subnets {
        let net = net.trunc();
        if net.prefix_len() <= 24 {
            for block in net.subnets(24).expect("prefix <= 24") {
                if seen.insert(u32::from(block.network())) {
                    blocks.push(block);
                }
            }
        } else if seen.insert(u32::from(net.network())) {
            blocks.push(net);
        }
    }
    blocks
}

/// Expand subnets into candidate IPs. `sample_per_24 == 0` takes every
/// host address; network and broadcast addresses of each /24 (and of any
/// shorter block) are never candidates, while /31 and /32 blocks yield
/// their one or two addresses directly.
pub fn enumerate_candidates(subnets: &[Ipv4Net], sample_per_24: usize) -> Vec<Ipv4Addr> {
    let mut rng = rand::thread_rng();
    let mut blocks = split_to_24s(subnets);
    blocks.shuffle(&mut rng);

    let mut ips = Vec::new();
    for block in blocks {
        let hosts: Vec<Ipv4Addr> = block.hosts().collect();
        if sample_per_24 > 0 && sample_per_24 < hosts.len() {
            ips.extend(hosts.choose_multiple(&mut rng, sample_per_24).copied());
        } else {
            ips.extend(hosts);
        }
    }
    ips
}

/// Probe a single candidate: handshake, then optional header check.
/// Returns the handshake time of a confirmed edge.
async fn probe_one(
    dialer: &TlsDialer,
    endpoint: Endpoint,
    sig: &CdnSignature,
    verify: bool,
    budget: Duration,
) -> Result<f64, ScanError> {
    let (mut stream, timing) =
        dialer.connect(endpoint.ip, endpoint.port, sig.probe_sni, budget).await?;

    if verify {
        let req = format!(
            "HEAD / HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
            sig.probe_sni
        );
        let verified = async {
            stream.write_all(req.as_bytes()).await.ok()?;
            let mut buf = Vec::with_capacity(1024);
            let mut tmp = [0u8; 512];
            loop {
                let n = stream.read(&mut tmp).await.ok()?;
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&tmp[..n]);
                if buf.windows(4).any(|w| w == b"\r\n\r\n") || buf.len() > 2048 {
                    break;
                }
            }
            Some(headers_match(&String::from_utf8_lossy(&buf), sig))
        };
        let ok = timeout(budget, verified).await.ok().flatten().unwrap_or(false);
        if !ok {
            return Err(ScanError::TlsHandshake("no cdn signature".into()));
        }
    }

    Ok(timing.tls_ms)
}

/// Header check: `Server` value starts with the signature token, or the
/// trace header is present at all. Case-insensitive on names and values.
fn headers_match(response: &str, sig: &CdnSignature) -> bool {
    for line in response.split("\r\n").skip(1) {
        if line.is_empty() {
            break;
        }
        let Some((name, value)) = line.split_once(':') else { continue };
        let name = name.trim();
        if name.eq_ignore_ascii_case("server")
            && value.trim().to_ascii_lowercase().starts_with(sig.server_prefix)
        {
            return true;
        }
        if name.eq_ignore_ascii_case(sig.trace_header) {
            return true;
        }
    }
    false
}

/// Run the sweep. Hits stream through `tx` as probes complete; the
/// returned list is sorted by ascending handshake time. Cancellation stops
/// admission and keeps everything already recorded.
pub async fn run(
    cfg: &SweepConfig,
    subnets: &[Ipv4Net],
    dialer: Arc<TlsDialer>,
    cancel: CancelFlag,
    events: broadcast::Sender<ScanEvent>,
    tx: Option<mpsc::Sender<SweepHit>>,
) -> Vec<SweepHit> {
    let ips = enumerate_candidates(subnets, cfg.mode.sample_per_24());
    let mut candidates: Vec<Endpoint> = ips
        .iter()
        .flat_map(|ip| cfg.mode.ports().iter().map(|p| Endpoint::new(*ip, *p)))
        .collect();
    candidates.shuffle(&mut rand::thread_rng());

    let total = candidates.len();
    info!(
        "🔍 sweeping {} candidates ({} mode, {} workers)",
        total,
        cfg.mode.label(),
        cfg.workers
    );
    let _ = events.send(ScanEvent::PhaseStarted { phase: "sweep".into(), total });

    let candidates = Arc::new(candidates);
    let cursor = Arc::new(AtomicUsize::new(0));
    let (res_tx, mut res_rx) = mpsc::channel::<Option<SweepHit>>(1024);

    let verify = cfg.mode.verify();
    let sig = cfg.signature;
    let budget = cfg.timeout;
    for _ in 0..cfg.workers.max(1) {
        let candidates = candidates.clone();
        let cursor = cursor.clone();
        let res_tx = res_tx.clone();
        let dialer = dialer.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                if cancel.is_cancelled() {
                    break;
                }
                let i = cursor.fetch_add(1, Ordering::Relaxed);
                let Some(endpoint) = candidates.get(i).copied() else { break };
                let hit = match probe_one(&dialer, endpoint, &sig, verify, budget).await {
                    Ok(tls_ms) => Some(SweepHit { endpoint, tls_ms }),
                    Err(e) => {
                        debug!("probe {endpoint}: {}", e.kind_label());
                        None
                    }
                };
                if res_tx.send(hit).await.is_err() {
                    break;
                }
            }
        });
    }
    drop(res_tx);

    let mut hits = Vec::new();
    let mut done = 0usize;
    while let Some(res) = res_rx.recv().await {
        done += 1;
        if let Some(hit) = res {
            if let Some(tx) = &tx {
                let _ = tx.send(hit).await;
            }
            hits.push(hit);
        }
        if done % 500 == 0 || done == total {
            let _ = events.send(ScanEvent::Progress { done, total, found: hits.len() });
        }
    }

    hits.sort_by(|a, b| {
        a.tls_ms
            .partial_cmp(&b.tls_ms)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.endpoint.cmp(&b.endpoint))
    });
    info!("✅ sweep done: {} clean of {} probed", hits.len(), done);
    hits
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn builtin_table_enumerates_exactly() {
        let ips = enumerate_candidates(&builtin_subnets(), 0);
        assert_eq!(ips.len(), 1_511_808);
        let unique: HashSet<u32> = ips.iter().map(|ip| u32::from(*ip)).collect();
        assert_eq!(unique.len(), ips.len(), "duplicate addresses");
        // no /24 network or broadcast addresses anywhere
        assert!(ips.iter().all(|ip| {
            let last = ip.octets()[3];
            last != 0 && last != 255
        }));
    }

    #[test]
    fn quick_sampling_takes_one_per_24() {
        let net: Ipv4Net = "192.0.2.0/24".parse().unwrap();
        let ips = enumerate_candidates(&[net], 1);
        assert_eq!(ips.len(), 1);
        let last = ips[0].octets()[3];
        assert!(last >= 1 && last <= 254);
    }

    #[test]
    fn small_prefixes_yield_their_addresses() {
        let net31: Ipv4Net = "192.0.2.6/31".parse().unwrap();
        let ips = enumerate_candidates(&[net31.trunc()], 0);
        assert_eq!(ips.len(), 2);

        let net32: Ipv4Net = "192.0.2.9/32".parse().unwrap();
        let ips = enumerate_candidates(&[net32], 0);
        assert_eq!(ips, vec![Ipv4Addr::new(192, 0, 2, 9)]);
    }

    #[test]
    fn overlapping_subnets_deduplicate() {
        let a: Ipv4Net = "192.0.2.0/23".parse().unwrap();
        let b: Ipv4Net = "192.0.2.0/24".parse().unwrap();
        let ips = enumerate_candidates(&[a, b], 0);
        assert_eq!(ips.len(), 2 * 254);
        let unique: HashSet<&Ipv4Addr> = ips.iter().collect();
        assert_eq!(unique.len(), ips.len());
    }

    #[test]
    fn subnet_arg_parses_comma_list() {
        let nets = parse_subnets_arg("192.0.2.0/24, 198.51.100.0/24").unwrap();
        assert_eq!(nets.len(), 2);
        assert!(parse_subnets_arg("not-a-cidr").is_err());
    }

    #[test]
    fn header_matching_follows_signature() {
        let sig = CLOUDFLARE_SIG;
        let ok = "HTTP/1.1 200 OK\r\nServer: cloudflare\r\nContent-Length: 0\r\n\r\n";
        assert!(headers_match(ok, &sig));
        let ok2 = "HTTP/1.1 403 Forbidden\r\nSERVER: Cloudflare-nginx\r\n\r\n";
        assert!(headers_match(ok2, &sig));
        let ray = "HTTP/1.1 200 OK\r\nCF-RAY: 8721abc-FRA\r\n\r\n";
        assert!(headers_match(ray, &sig));
        let no = "HTTP/1.1 200 OK\r\nServer: nginx\r\n\r\n";
        assert!(!headers_match(no, &sig));
        // a Server value merely containing the token elsewhere is not a match
        let infix = "HTTP/1.1 200 OK\r\nServer: fronted-by-cloudflare\r\n\r\n";
        assert!(!headers_match(infix, &sig));
    }
}
