//! Progressive speed rounds and composite scoring
//!
//! A funnel of one to three download rounds with growing file sizes. Each
//! round's results are ranked by the composite score and only the top
//! slice moves on. Downloads go to the CDN speed endpoint; 429s and
//! blocked sizes fail over to the mirror through the accountant.

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    sync::{broadcast, mpsc},
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::{
    error::ScanError,
    ratelimit::Accountant,
    tls::TlsDialer,
    types::{
        CancelFlag, Endpoint, LatencyResult, RoundSpec, ScanEvent, SpeedMode, SpeedSample, Via,
        MIRROR_HOST, MIRROR_PATH, SPEED_HOST, SPEED_PATH, SPEED_TIMEOUT, SPEED_WORKERS,
    },
};

/// Below this many alive endpoints the funnel is pointless: every round
/// tests the whole set.
pub const SMALL_SET: usize = 50;

/// Speed-phase parameters
#[derive(Debug, Clone)]
pub struct SpeedParams {
    /// Concurrent downloads (each worker is sequential)
    pub workers: usize,
    /// Base download budget; large files extend it
    pub timeout: Duration,
    /// Round table before the candidate count is known
    pub rounds: Vec<RoundSpec>,
}

impl Default for SpeedParams {
    fn default() -> Self {
        Self {
            workers: SPEED_WORKERS,
            timeout: SPEED_TIMEOUT,
            rounds: SpeedMode::Normal.rounds(),
        }
    }
}

/// A round with its cap resolved against the alive set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Round {
    pub size: u64,
    pub keep: usize,
}

/// Resolve round specs against the alive count. Small sets ignore every
/// cap; otherwise a cap never exceeds what is actually alive.
pub fn plan_rounds(specs: &[RoundSpec], alive: usize) -> Vec<Round> {
    if alive == 0 {
        return Vec::new();
    }
    let small = alive < SMALL_SET;
    specs
        .iter()
        .map(|spec| {
            let keep = if small {
                alive
            } else {
                spec.keep.unwrap_or(alive).min(alive)
            };
            Round { size: spec.size, keep }
        })
        .filter(|r| r.keep > 0)
        .collect()
}

/// `"1MB"`, `"500KB"`, `"2.5MB"`, or a bare byte count.
pub fn parse_size(s: &str) -> Result<u64, ScanError> {
    let s = s.trim().to_ascii_uppercase();
    let (digits, mul) = if let Some(d) = s.strip_suffix("GB") {
        (d, 1_000_000_000u64)
    } else if let Some(d) = s.strip_suffix("MB") {
        (d, 1_000_000)
    } else if let Some(d) = s.strip_suffix("KB") {
        (d, 1_000)
    } else if let Some(d) = s.strip_suffix('B') {
        (d, 1)
    } else {
        (s.as_str(), 1)
    };
    let n: f64 = digits
        .trim()
        .parse()
        .map_err(|_| ScanError::MalformedUri { uri: s.clone() })?;
    if n <= 0.0 {
        return Err(ScanError::MalformedUri { uri: s });
    }
    Ok((n * mul as f64) as u64)
}

/// `--rounds "S:K,…"`; `K = 0` means the whole alive set.
pub fn parse_rounds_arg(s: &str) -> Result<Vec<RoundSpec>, ScanError> {
    let mut out = Vec::new();
    for piece in s.split(',') {
        let piece = piece.trim();
        if piece.is_empty() {
            continue;
        }
        let (size, keep) = piece
            .split_once(':')
            .ok_or_else(|| ScanError::MalformedUri { uri: piece.to_string() })?;
        let size = parse_size(size)?;
        let keep: usize = keep
            .trim()
            .parse()
            .map_err(|_| ScanError::MalformedUri { uri: piece.to_string() })?;
        out.push(RoundSpec { size, keep: if keep == 0 { None } else { Some(keep) } });
    }
    if out.is_empty() {
        return Err(ScanError::MalformedUri { uri: s.to_string() });
    }
    Ok(out)
}

// ==================== SCORING ====================

/// Inputs of one endpoint's composite score
#[derive(Debug, Clone, Copy)]
pub struct Candidate {
    pub endpoint: Endpoint,
    pub throughput_mbps: f64,
    pub tls_ms: f64,
    pub ttfb_ms: f64,
}

/// A scored endpoint
#[derive(Debug, Clone, Copy)]
pub struct Scored {
    pub endpoint: Endpoint,
    pub score: f64,
    pub throughput_mbps: f64,
    pub tls_ms: f64,
    pub ttfb_ms: f64,
}

fn span(values: impl Iterator<Item = f64> + Clone) -> (f64, f64) {
    let min = values.clone().fold(f64::INFINITY, f64::min);
    let max = values.fold(f64::NEG_INFINITY, f64::max);
    (min, max)
}

fn norm(v: f64, min: f64, max: f64) -> f64 {
    if !(max - min).is_finite() || max - min <= f64::EPSILON {
        return 0.0;
    }
    ((v - min) / (max - min)).clamp(0.0, 1.0)
}

/// Min-max composite over the current candidate set:
/// `0.50·norm(throughput) + 0.35·(1 − norm(latency)) + 0.15·(1 − norm(ttfb))`.
/// Result is ordered best first with `(score desc, tls asc, ip asc)`
/// tie-breakers.
pub fn composite_scores(cands: &[Candidate]) -> Vec<Scored> {
    let (tp_min, tp_max) = span(cands.iter().map(|c| c.throughput_mbps));
    let (lat_min, lat_max) = span(cands.iter().map(|c| c.tls_ms));
    let (ttfb_min, ttfb_max) = span(cands.iter().map(|c| c.ttfb_ms));

    let mut scored: Vec<Scored> = cands
        .iter()
        .map(|c| {
            let score = 0.50 * norm(c.throughput_mbps, tp_min, tp_max)
                + 0.35 * (1.0 - norm(c.tls_ms, lat_min, lat_max))
                + 0.15 * (1.0 - norm(c.ttfb_ms, ttfb_min, ttfb_max));
            Scored {
                endpoint: c.endpoint,
                score,
                throughput_mbps: c.throughput_mbps,
                tls_ms: c.tls_ms,
                ttfb_ms: c.ttfb_ms,
            }
        })
        .collect();
    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.tls_ms.partial_cmp(&b.tls_ms).unwrap_or(std::cmp::Ordering::Equal))
            .then_with(|| a.endpoint.cmp(&b.endpoint))
    });
    scored
}

/// Pick the next round's candidates: this round's successes ranked by
/// composite score, then endpoints that failed this round but carry an
/// earlier success (they stay eligible), ordered by that earlier
/// throughput.
fn next_candidates(
    round_samples: &BTreeMap<Endpoint, SpeedSample>,
    best_earlier: &BTreeMap<Endpoint, SpeedSample>,
    latency: &BTreeMap<Endpoint, LatencyResult>,
    keep: usize,
) -> Vec<Endpoint> {
    let cands: Vec<Candidate> = round_samples
        .values()
        .filter(|s| s.ok())
        .map(|s| Candidate {
            endpoint: s.endpoint,
            throughput_mbps: s.throughput_mbps,
            tls_ms: latency
                .get(&s.endpoint)
                .and_then(|l| l.tls_ms)
                .unwrap_or(f64::MAX),
            ttfb_ms: s.ttfb_ms,
        })
        .collect();
    let mut out: Vec<Endpoint> = composite_scores(&cands).iter().map(|s| s.endpoint).collect();

    let mut leftovers: Vec<&SpeedSample> = best_earlier
        .values()
        .filter(|s| s.ok() && !round_samples.get(&s.endpoint).map_or(false, |r| r.ok()))
        .filter(|s| !out.contains(&s.endpoint))
        .collect();
    leftovers.sort_by(|a, b| {
        b.throughput_mbps
            .partial_cmp(&a.throughput_mbps)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.endpoint.cmp(&b.endpoint))
    });
    out.extend(leftovers.into_iter().map(|s| s.endpoint));
    out.truncate(keep);
    out
}

// ==================== DOWNLOAD PROBE ====================

struct DownloadOutcome {
    sample: SpeedSample,
    /// Parsed Retry-After when the response was a 429
    retry_after: Option<u64>,
}

fn failed_sample(
    endpoint: Endpoint,
    round_id: usize,
    size: u64,
    via: Via,
    status: u16,
    kind: &str,
) -> SpeedSample {
    SpeedSample {
        endpoint,
        round_id,
        bytes_requested: size,
        bytes_received: 0,
        ttfb_ms: -1.0,
        elapsed_ms: -1.0,
        throughput_mbps: 0.0,
        http_status: status,
        via,
        error_kind: Some(kind.to_string()),
    }
}

/// One range-GET against the speed endpoint (direct) or the mirror.
async fn download_one(
    dialer: &TlsDialer,
    endpoint: Endpoint,
    round_id: usize,
    size: u64,
    via: Via,
    base_timeout: Duration,
) -> DownloadOutcome {
    let (host, path, range) = match via {
        Via::Direct => (SPEED_HOST, format!("{SPEED_PATH}?bytes={size}"), None),
        Via::Mirror => (MIRROR_HOST, MIRROR_PATH.to_string(), Some(size)),
    };
    // Big files get proportionally more time than the base budget
    let dl_timeout = base_timeout.max(Duration::from_secs(30 + 2 * (size / 1_000_000)));
    let conn_timeout = base_timeout.min(Duration::from_secs(15));

    let fail = |status: u16, kind: &str| DownloadOutcome {
        sample: failed_sample(endpoint, round_id, size, via, status, kind),
        retry_after: None,
    };

    let (mut stream, _timing) =
        match dialer.connect(endpoint.ip, endpoint.port, host, conn_timeout).await {
            Ok(ok) => ok,
            Err(e) => return fail(0, e.kind_label()),
        };

    let range_hdr = match range {
        Some(n) => format!("Range: bytes=0-{}\r\n", n - 1),
        None => String::new(),
    };
    let req = format!(
        "GET {path} HTTP/1.1\r\nHost: {host}\r\n\
         User-Agent: Mozilla/5.0 (X11; Linux x86_64) Chrome/120\r\n\
         Accept: */*\r\n{range_hdr}Connection: close\r\n\r\n"
    );
    let t_req = Instant::now();
    if stream.write_all(req.as_bytes()).await.is_err() {
        return fail(0, "write");
    }

    // Headers
    let mut buf: Vec<u8> = Vec::with_capacity(4096);
    let header_end = loop {
        let mut tmp = [0u8; 4096];
        let n = match timeout(conn_timeout.min(Duration::from_secs(10)), stream.read(&mut tmp)).await
        {
            Ok(Ok(n)) => n,
            _ => return fail(0, "timeout"),
        };
        if n == 0 {
            return fail(0, "empty");
        }
        buf.extend_from_slice(&tmp[..n]);
        if let Some(pos) = find_header_end(&buf) {
            break pos;
        }
        if buf.len() > 65_536 {
            return fail(0, "hdr-too-big");
        }
    };
    let ttfb_ms = t_req.elapsed().as_secs_f64() * 1000.0;

    let head = String::from_utf8_lossy(&buf[..header_end]).into_owned();
    let status = parse_status(&head);
    match status {
        429 => {
            return DownloadOutcome {
                sample: failed_sample(endpoint, round_id, size, via, 429, "429"),
                retry_after: parse_retry_after(&head),
            }
        }
        403 => return fail(403, "403"),
        200 | 206 => {}
        other => return fail(other, "http"),
    }

    // Body
    let mut total = (buf.len() - header_end) as u64;
    let mut last_byte = Instant::now();
    let mut tmp = vec![0u8; 65_536];
    while total < size {
        let left = dl_timeout.saturating_sub(t_req.elapsed());
        if left.is_zero() {
            break;
        }
        match timeout(left.min(Duration::from_secs(10)), stream.read(&mut tmp)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => {
                total += n as u64;
                last_byte = Instant::now();
            }
            _ => break,
        }
    }

    if total == 0 {
        return fail(status, "no-data");
    }
    let elapsed_ms = last_byte.duration_since(t_req).as_secs_f64() * 1000.0;
    let throughput_mbps = if elapsed_ms > 0.0 {
        8.0 * total as f64 / (elapsed_ms / 1000.0) / 1e6
    } else {
        0.0
    };
    DownloadOutcome {
        sample: SpeedSample {
            endpoint,
            round_id,
            bytes_requested: size,
            bytes_received: total,
            ttfb_ms,
            elapsed_ms,
            throughput_mbps,
            http_status: status,
            via,
            error_kind: None,
        },
        retry_after: None,
    }
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

fn parse_status(head: &str) -> u16 {
    head.lines()
        .next()
        .and_then(|l| l.split_whitespace().nth(1))
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

fn parse_retry_after(head: &str) -> Option<u64> {
    head.lines().find_map(|l| {
        let (name, value) = l.split_once(':')?;
        if name.trim().eq_ignore_ascii_case("retry-after") {
            value.trim().parse().ok()
        } else {
            None
        }
    })
}

// ==================== ROUND RUNNER ====================

/// Per-endpoint probe: routes through the accountant, downloads, and
/// applies the 429/403 mirror-retry policy.
async fn probe_endpoint(
    dialer: &TlsDialer,
    accountant: &Accountant,
    cancel: &CancelFlag,
    endpoint: Endpoint,
    round_id: usize,
    size: u64,
    base_timeout: Duration,
) -> Option<SpeedSample> {
    let mut force_mirror = false;
    let mut last: Option<SpeedSample> = None;

    for _attempt in 0..2 {
        if cancel.is_cancelled() {
            break;
        }
        let via = if force_mirror {
            Via::Mirror
        } else {
            accountant.route(cancel).await?
        };

        let outcome = download_one(dialer, endpoint, round_id, size, via, base_timeout).await;
        let sample = outcome.sample;

        if sample.ok() {
            if via == Via::Mirror {
                accountant.report_mirror(true).await;
            }
            return Some(sample);
        }

        match (via, sample.http_status) {
            (Via::Direct, 429) => {
                accountant.report_429(outcome.retry_after).await;
                force_mirror = true;
            }
            (Via::Direct, 403) if size >= 25_000_000 => {
                debug!("{endpoint}: {size}B blocked direct, retrying via mirror");
                force_mirror = true;
            }
            (Via::Mirror, _) => {
                accountant.report_mirror(false).await;
                warn!("{endpoint}: mirror download failed ({:?})", sample.error_kind);
                last = Some(sample);
                break;
            }
            _ => {
                last = Some(sample);
                break;
            }
        }
        last = Some(sample);
    }
    last
}

/// Run the whole funnel. `alive` is every endpoint that survived the
/// latency pass. Returns each endpoint's samples across rounds.
pub async fn run_rounds(
    alive: &[Endpoint],
    latency: &BTreeMap<Endpoint, LatencyResult>,
    params: &SpeedParams,
    dialer: Arc<TlsDialer>,
    accountant: Arc<Accountant>,
    cancel: CancelFlag,
    events: broadcast::Sender<ScanEvent>,
) -> BTreeMap<Endpoint, Vec<SpeedSample>> {
    let plan = plan_rounds(&params.rounds, alive.len());
    let mut all_samples: BTreeMap<Endpoint, Vec<SpeedSample>> = BTreeMap::new();
    if plan.is_empty() {
        return all_samples;
    }

    // Round 1 enters in latency order, fastest handshake first
    let mut ordered: Vec<Endpoint> = alive.to_vec();
    ordered.sort_by(|a, b| {
        let la = latency.get(a).and_then(|l| l.tls_ms).unwrap_or(f64::MAX);
        let lb = latency.get(b).and_then(|l| l.tls_ms).unwrap_or(f64::MAX);
        la.partial_cmp(&lb).unwrap_or(std::cmp::Ordering::Equal).then_with(|| a.cmp(b))
    });

    let small_set = alive.len() < SMALL_SET;
    let mut best_earlier: BTreeMap<Endpoint, SpeedSample> = BTreeMap::new();
    let mut candidates: Vec<Endpoint> = ordered.clone();

    for (round_id, round) in plan.iter().enumerate() {
        if cancel.is_cancelled() {
            break;
        }
        candidates.truncate(round.keep);
        info!(
            "🚀 speed round {} — {} x {} endpoints",
            round_id + 1,
            RoundSpec { size: round.size, keep: Some(round.keep) }.label(),
            candidates.len()
        );
        let _ = events.send(ScanEvent::RoundStarted {
            round: round_id + 1,
            size: round.size,
            candidates: candidates.len(),
        });

        // Very large files keep fewer streams in flight
        let workers = if round.size >= 50_000_000 {
            params.workers.min(6)
        } else if round.size >= 10_000_000 {
            params.workers.min(8)
        } else {
            params.workers
        }
        .max(1);

        let round_samples = run_one_round(
            &candidates,
            round_id,
            round.size,
            workers,
            params.timeout,
            &dialer,
            &accountant,
            &cancel,
            &events,
        )
        .await;

        // Small sets skip the funnel entirely: every round retests the
        // whole alive set.
        candidates = if small_set {
            ordered.clone()
        } else {
            next_candidates(
                &round_samples,
                &best_earlier,
                latency,
                plan.get(round_id + 1).map(|r| r.keep).unwrap_or(round.keep),
            )
        };

        for (endpoint, sample) in round_samples {
            if sample.ok() {
                best_earlier.insert(endpoint, sample.clone());
            }
            all_samples.entry(endpoint).or_default().push(sample);
        }
    }

    all_samples
}

#[allow(clippy::too_many_arguments)]
async fn run_one_round(
    candidates: &[Endpoint],
    round_id: usize,
    size: u64,
    workers: usize,
    base_timeout: Duration,
    dialer: &Arc<TlsDialer>,
    accountant: &Arc<Accountant>,
    cancel: &CancelFlag,
    events: &broadcast::Sender<ScanEvent>,
) -> BTreeMap<Endpoint, SpeedSample> {
    let total = candidates.len();
    let targets = Arc::new(candidates.to_vec());
    let cursor = Arc::new(AtomicUsize::new(0));
    let (res_tx, mut res_rx) = mpsc::channel::<SpeedSample>(64);

    for _ in 0..workers {
        let targets = targets.clone();
        let cursor = cursor.clone();
        let res_tx = res_tx.clone();
        let dialer = dialer.clone();
        let accountant = accountant.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                if cancel.is_cancelled() {
                    break;
                }
                let i = cursor.fetch_add(1, Ordering::Relaxed);
                let Some(endpoint) = targets.get(i).copied() else { break };
                if let Some(sample) = probe_endpoint(
                    &dialer,
                    &accountant,
                    &cancel,
                    endpoint,
                    round_id,
                    size,
                    base_timeout,
                )
                .await
                {
                    if res_tx.send(sample).await.is_err() {
                        break;
                    }
                }
            }
        });
    }
    drop(res_tx);

    let mut out = BTreeMap::new();
    while let Some(sample) = res_rx.recv().await {
        let _ = events.send(ScanEvent::SampleRecorded {
            endpoint: sample.endpoint,
            round: round_id + 1,
            mbps: sample.throughput_mbps,
        });
        let done = out.len() + 1;
        if done % 10 == 0 || done == total {
            let _ = events.send(ScanEvent::Progress { done, total, found: done });
        }
        out.insert(sample.endpoint, sample);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ep(d: u8) -> Endpoint {
        Endpoint::new(Ipv4Addr::new(104, 16, 0, d), 443)
    }

    fn ok_sample(endpoint: Endpoint, round_id: usize, mbps: f64, ttfb: f64) -> SpeedSample {
        SpeedSample {
            endpoint,
            round_id,
            bytes_requested: 1_000_000,
            bytes_received: 1_000_000,
            ttfb_ms: ttfb,
            elapsed_ms: 1000.0,
            throughput_mbps: mbps,
            http_status: 200,
            via: Via::Direct,
            error_kind: None,
        }
    }

    fn lat(endpoint: Endpoint, tls: f64) -> (Endpoint, LatencyResult) {
        (
            endpoint,
            LatencyResult {
                endpoint,
                alive: true,
                tcp_ms: Some(tls / 2.0),
                tls_ms: Some(tls),
                error_kind: None,
            },
        )
    }

    #[test]
    fn size_parsing() {
        assert_eq!(parse_size("1MB").unwrap(), 1_000_000);
        assert_eq!(parse_size("500KB").unwrap(), 500_000);
        assert_eq!(parse_size("2.5MB").unwrap(), 2_500_000);
        assert_eq!(parse_size("1GB").unwrap(), 1_000_000_000);
        assert_eq!(parse_size("1234").unwrap(), 1234);
        assert_eq!(parse_size("64B").unwrap(), 64);
        assert!(parse_size("eleven").is_err());
        assert!(parse_size("-5MB").is_err());
    }

    #[test]
    fn rounds_override_parses_verbatim() {
        let specs = parse_rounds_arg("1MB:200,5MB:50,20MB:20").unwrap();
        assert_eq!(
            specs,
            vec![
                RoundSpec { size: 1_000_000, keep: Some(200) },
                RoundSpec { size: 5_000_000, keep: Some(50) },
                RoundSpec { size: 20_000_000, keep: Some(20) },
            ]
        );
        assert_eq!(
            parse_rounds_arg("5MB:0").unwrap(),
            vec![RoundSpec { size: 5_000_000, keep: None }]
        );
        assert!(parse_rounds_arg("5MB").is_err());
        assert!(parse_rounds_arg("").is_err());
    }

    #[test]
    fn normal_funnel_reduces_200_to_50_to_20() {
        let plan = plan_rounds(&SpeedMode::Normal.rounds(), 200);
        assert_eq!(
            plan,
            vec![
                Round { size: 1_000_000, keep: 200 },
                Round { size: 5_000_000, keep: 50 },
                Round { size: 20_000_000, keep: 20 },
            ]
        );
    }

    #[test]
    fn small_sets_ignore_caps() {
        let plan = plan_rounds(&SpeedMode::Normal.rounds(), 30);
        assert!(plan.iter().all(|r| r.keep == 30));
        // 49 is still small, 50 is not
        let plan = plan_rounds(&SpeedMode::Normal.rounds(), 49);
        assert!(plan.iter().all(|r| r.keep == 49));
        let plan = plan_rounds(&SpeedMode::Normal.rounds(), 50);
        assert_eq!(plan[1].keep, 50);
        assert_eq!(plan[2].keep, 20);
    }

    #[test]
    fn caps_never_exceed_alive() {
        let plan = plan_rounds(&SpeedMode::Thorough.rounds(), 60);
        assert_eq!(plan[0].keep, 60);
        assert_eq!(plan[1].keep, 20);
        let plan = plan_rounds(&SpeedMode::Normal.rounds(), 0);
        assert!(plan.is_empty());
    }

    #[test]
    fn higher_throughput_wins_at_equal_latency() {
        let cands = vec![
            Candidate { endpoint: ep(1), throughput_mbps: 80.0, tls_ms: 100.0, ttfb_ms: 50.0 },
            Candidate { endpoint: ep(2), throughput_mbps: 40.0, tls_ms: 100.0, ttfb_ms: 50.0 },
            Candidate { endpoint: ep(3), throughput_mbps: 10.0, tls_ms: 100.0, ttfb_ms: 50.0 },
        ];
        let scored = composite_scores(&cands);
        assert_eq!(scored[0].endpoint, ep(1));
        assert_eq!(scored[2].endpoint, ep(3));
        assert!(scored[0].score > scored[1].score);
        assert!(scored[1].score > scored[2].score);
    }

    #[test]
    fn scores_stay_in_unit_range() {
        let cands = vec![
            Candidate { endpoint: ep(1), throughput_mbps: 500.0, tls_ms: 20.0, ttfb_ms: 5.0 },
            Candidate { endpoint: ep(2), throughput_mbps: 0.1, tls_ms: 4000.0, ttfb_ms: 900.0 },
        ];
        for s in composite_scores(&cands) {
            assert!(s.score >= 0.0 && s.score <= 1.0);
        }
    }

    #[test]
    fn ties_break_by_latency_then_ip() {
        let cands = vec![
            Candidate { endpoint: ep(9), throughput_mbps: 50.0, tls_ms: 80.0, ttfb_ms: 40.0 },
            Candidate { endpoint: ep(1), throughput_mbps: 50.0, tls_ms: 80.0, ttfb_ms: 40.0 },
        ];
        let scored = composite_scores(&cands);
        assert_eq!(scored[0].endpoint, ep(1), "ip ascending breaks the tie");
    }

    #[test]
    fn next_round_keeps_top_scorers() {
        let latency: BTreeMap<_, _> = (1..=4).map(|i| lat(ep(i), 100.0)).collect();
        let mut round: BTreeMap<Endpoint, SpeedSample> = BTreeMap::new();
        round.insert(ep(1), ok_sample(ep(1), 0, 10.0, 50.0));
        round.insert(ep(2), ok_sample(ep(2), 0, 90.0, 50.0));
        round.insert(ep(3), ok_sample(ep(3), 0, 40.0, 50.0));
        round.insert(ep(4), ok_sample(ep(4), 0, 70.0, 50.0));
        let picked = next_candidates(&round, &BTreeMap::new(), &latency, 2);
        assert_eq!(picked, vec![ep(2), ep(4)]);
    }

    #[test]
    fn round_failures_stay_eligible_via_earlier_success() {
        let latency: BTreeMap<_, _> = (1..=3).map(|i| lat(ep(i), 100.0)).collect();
        let mut round: BTreeMap<Endpoint, SpeedSample> = BTreeMap::new();
        round.insert(ep(1), ok_sample(ep(1), 1, 50.0, 40.0));
        // ep(2) failed this round but succeeded in an earlier one
        round.insert(
            ep(2),
            failed_sample(ep(2), 1, 5_000_000, Via::Direct, 0, "timeout"),
        );
        let mut earlier = BTreeMap::new();
        earlier.insert(ep(2), ok_sample(ep(2), 0, 80.0, 30.0));
        let picked = next_candidates(&round, &earlier, &latency, 3);
        assert_eq!(picked, vec![ep(1), ep(2)]);
    }

    #[test]
    fn http_head_parsing() {
        let head = "HTTP/1.1 429 Too Many Requests\r\nRetry-After: 90\r\n\r\n";
        assert_eq!(parse_status(head), 429);
        assert_eq!(parse_retry_after(head), Some(90));
        assert_eq!(parse_status("HTTP/1.1 206 Partial Content\r\n\r\n"), 206);
        assert_eq!(parse_retry_after("HTTP/1.1 200 OK\r\n\r\n"), None);
        assert_eq!(
            find_header_end(b"HTTP/1.1 200 OK\r\nA: b\r\n\r\nBODY"),
            Some(25)
        );
    }
}
