//! Orchestration: wires the engines into the two pipelines
//!
//! `sweep` probes raw subnet candidates; `measure` takes parsed configs
//! through resolve → latency → speed → score. Engines run strictly in
//! sequence and publish progress on a broadcast channel that an optional
//! dashboard can subscribe to; cancellation keeps partial results
//! exportable.

use std::{collections::BTreeMap, sync::Arc};

use ipnet::Ipv4Net;
use tokio::sync::{broadcast, mpsc};
use tracing::info;

use crate::{
    export::{ReportRow, ScanReport},
    input::Seed,
    latency::{self, LatencyParams},
    ratelimit::{Accountant, RateBudget},
    speed::{self, Candidate, SpeedParams},
    sweep::{self, SweepConfig, SweepHit},
    tls::TlsDialer,
    types::{CancelFlag, Endpoint, ScanEvent, SpeedSample},
};

pub use crate::uri::{substitute, substitute_host};

/// The core scanner: owns the TLS dialer, the event channel, and the
/// cancel flag shared by every engine.
pub struct Scanner {
    dialer: Arc<TlsDialer>,
    events: broadcast::Sender<ScanEvent>,
    cancel: CancelFlag,
}

impl Scanner {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            dialer: Arc::new(TlsDialer::new()),
            events,
            cancel: CancelFlag::new(),
        }
    }

    /// Subscribe to progress events (dashboard, logging, tests)
    pub fn subscribe(&self) -> broadcast::Receiver<ScanEvent> {
        self.events.subscribe()
    }

    /// The shared cancel signal; raise it from a Ctrl-C handler
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Run a clean-IP sweep. `subnets` defaults to the built-in published
    /// table; hits stream through `tx` in completion order while the
    /// returned list is sorted by handshake time.
    pub async fn sweep(
        &self,
        cfg: &SweepConfig,
        subnets: Option<Vec<Ipv4Net>>,
        tx: Option<mpsc::Sender<SweepHit>>,
    ) -> Vec<SweepHit> {
        let subnets = subnets.unwrap_or_else(sweep::builtin_subnets);
        let hits = sweep::run(
            cfg,
            &subnets,
            self.dialer.clone(),
            self.cancel.clone(),
            self.events.clone(),
            tx,
        )
        .await;
        let _ = self.events.send(ScanEvent::Finished { cancelled: self.cancel.is_cancelled() });
        hits
    }

    /// Run the measurement pipeline over loaded seeds. `speed_params`
    /// `None` (or an empty round table) means latency-only.
    pub async fn measure(
        &self,
        seeds: Vec<Seed>,
        latency_params: &LatencyParams,
        speed_params: Option<&SpeedParams>,
        malformed_inputs: usize,
    ) -> ScanReport {
        let (resolved, dns_failures) =
            latency::resolve_seeds(seeds, latency_params, &self.cancel).await;
        let groups = latency::build_groups(resolved);
        info!("🧭 {} unique endpoints after resolution", groups.len());

        let latency_map = latency::measure_latency(
            &groups,
            latency_params,
            self.dialer.clone(),
            self.cancel.clone(),
            self.events.clone(),
        )
        .await;

        let alive: Vec<Endpoint> = latency_map
            .values()
            .filter(|r| r.alive)
            .map(|r| r.endpoint)
            .collect();

        let samples = match speed_params {
            Some(params) if !params.rounds.is_empty() && !alive.is_empty() => {
                let accountant =
                    Arc::new(Accountant::new(RateBudget::default(), self.events.clone()));
                speed::run_rounds(
                    &alive,
                    &latency_map,
                    params,
                    self.dialer.clone(),
                    accountant,
                    self.cancel.clone(),
                    self.events.clone(),
                )
                .await
            }
            _ => BTreeMap::new(),
        };

        let speed_ran = !samples.is_empty();
        let cancelled = self.cancel.is_cancelled();
        let _ = self.events.send(ScanEvent::Finished { cancelled });

        let mut report = assemble_report(&groups, &latency_map, &samples, speed_ran);
        report.malformed_inputs = malformed_inputs;
        report.dns_failures = dns_failures;
        report.cancelled = cancelled;
        report
    }
}

impl Default for Scanner {
    fn default() -> Self {
        Self::new()
    }
}

/// The deepest successful sample decides an endpoint's final numbers
fn final_sample(samples: &[SpeedSample]) -> Option<&SpeedSample> {
    samples.iter().filter(|s| s.ok()).max_by_key(|s| s.round_id)
}

/// Build the ordered report: scored endpoints best first, then alive
/// endpoints that never completed a download, then dead ones.
fn assemble_report(
    groups: &[latency::Group],
    latency_map: &BTreeMap<Endpoint, crate::types::LatencyResult>,
    samples: &BTreeMap<Endpoint, Vec<SpeedSample>>,
    speed_ran: bool,
) -> ScanReport {
    let mut rows: Vec<ReportRow> = Vec::with_capacity(groups.len());

    // Composite scores over the final candidate set
    let scored: BTreeMap<Endpoint, f64> = if speed_ran {
        let cands: Vec<Candidate> = groups
            .iter()
            .filter_map(|g| {
                let lat = latency_map.get(&g.endpoint)?;
                if !lat.alive {
                    return None;
                }
                let sample = samples.get(&g.endpoint).and_then(|s| final_sample(s))?;
                Some(Candidate {
                    endpoint: g.endpoint,
                    throughput_mbps: sample.throughput_mbps,
                    tls_ms: lat.tls_ms.unwrap_or(f64::MAX),
                    ttfb_ms: sample.ttfb_ms,
                })
            })
            .collect();
        speed::composite_scores(&cands).into_iter().map(|s| (s.endpoint, s.score)).collect()
    } else {
        // Latency-only runs rank by handshake time alone
        let alive: Vec<(Endpoint, f64)> = groups
            .iter()
            .filter_map(|g| {
                let lat = latency_map.get(&g.endpoint)?;
                lat.alive.then(|| (g.endpoint, lat.tls_ms.unwrap_or(f64::MAX)))
            })
            .collect();
        let min = alive.iter().map(|(_, t)| *t).fold(f64::INFINITY, f64::min);
        let max = alive.iter().map(|(_, t)| *t).fold(f64::NEG_INFINITY, f64::max);
        alive
            .into_iter()
            .map(|(e, t)| {
                let score = if max - min <= f64::EPSILON {
                    1.0
                } else {
                    (1.0 - (t - min) / (max - min)).clamp(0.0, 1.0)
                };
                (e, score)
            })
            .collect()
    };

    for group in groups {
        let lat = latency_map.get(&group.endpoint);
        let alive = lat.map_or(false, |l| l.alive);
        let endpoint_samples = samples.get(&group.endpoint);
        let sample = endpoint_samples.and_then(|s| final_sample(s));
        let last_error = endpoint_samples
            .and_then(|s| s.iter().rev().find_map(|x| x.error_kind.clone()));
        rows.push(ReportRow {
            endpoint: group.endpoint,
            score: scored.get(&group.endpoint).copied().unwrap_or(0.0),
            throughput_mbps: sample.map(|s| s.throughput_mbps),
            latency_ms: lat.and_then(|l| l.tls_ms),
            ttfb_ms: sample.map(|s| s.ttfb_ms),
            alive,
            domains: group.domains.clone(),
            uris: group.configs.iter().map(|c| c.raw_uri.clone()).collect(),
            via: sample.map(|s| s.via),
            error_kind: lat.and_then(|l| l.error_kind.clone()).or(last_error),
        });
    }

    // (score desc, latency asc, ip asc); dead endpoints at the bottom
    rows.sort_by(|a, b| {
        b.alive
            .cmp(&a.alive)
            .then_with(|| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal))
            .then_with(|| {
                let la = a.latency_ms.unwrap_or(f64::MAX);
                let lb = b.latency_ms.unwrap_or(f64::MAX);
                la.partial_cmp(&lb).unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| a.endpoint.cmp(&b.endpoint))
    });

    ScanReport { rows, ..Default::default() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{LatencyResult, Via};
    use crate::uri::ProxyConfig;
    use std::net::Ipv4Addr;

    fn ep(d: u8) -> Endpoint {
        Endpoint::new(Ipv4Addr::new(104, 16, 0, d), 443)
    }

    fn group(d: u8, uri: Option<&str>) -> latency::Group {
        latency::Group {
            endpoint: ep(d),
            configs: uri.map(|u| vec![ProxyConfig::parse(u).unwrap()]).unwrap_or_default(),
            domains: vec![format!("host-{d}.example")],
        }
    }

    fn lat(d: u8, alive: bool, tls: f64) -> (Endpoint, LatencyResult) {
        (
            ep(d),
            LatencyResult {
                endpoint: ep(d),
                alive,
                tcp_ms: alive.then_some(tls / 2.0),
                tls_ms: alive.then_some(tls),
                error_kind: (!alive).then(|| "timeout".into()),
            },
        )
    }

    fn sample(d: u8, round_id: usize, mbps: f64) -> SpeedSample {
        SpeedSample {
            endpoint: ep(d),
            round_id,
            bytes_requested: 1_000_000,
            bytes_received: 1_000_000,
            ttfb_ms: 100.0,
            elapsed_ms: 500.0,
            throughput_mbps: mbps,
            http_status: 200,
            via: Via::Direct,
            error_kind: None,
        }
    }

    #[test]
    fn latency_only_orders_by_handshake() {
        let groups = vec![group(1, None), group(2, None), group(3, None)];
        let latency: BTreeMap<_, _> =
            vec![lat(1, true, 200.0), lat(2, true, 50.0), lat(3, false, 0.0)].into_iter().collect();
        let report = assemble_report(&groups, &latency, &BTreeMap::new(), false);
        assert_eq!(report.rows[0].endpoint, ep(2));
        assert_eq!(report.rows[1].endpoint, ep(1));
        assert!(!report.rows[2].alive);
        assert_eq!(report.rows[2].score, 0.0);
        assert_eq!(report.rows[2].error_kind.as_deref(), Some("timeout"));
    }

    #[test]
    fn deepest_round_wins_the_final_sample() {
        let groups = vec![group(1, None)];
        let latency: BTreeMap<_, _> = vec![lat(1, true, 80.0)].into_iter().collect();
        let mut samples = BTreeMap::new();
        samples.insert(ep(1), vec![sample(1, 0, 10.0), sample(1, 1, 55.0)]);
        let report = assemble_report(&groups, &latency, &samples, true);
        assert_eq!(report.rows[0].throughput_mbps, Some(55.0));
    }

    #[test]
    fn endpoints_without_any_download_rank_after_scored() {
        let groups = vec![group(1, None), group(2, None)];
        let latency: BTreeMap<_, _> =
            vec![lat(1, true, 50.0), lat(2, true, 40.0)].into_iter().collect();
        let mut samples = BTreeMap::new();
        samples.insert(ep(1), vec![sample(1, 0, 30.0)]);
        // ep(2) has a failed sample only
        samples.insert(
            ep(2),
            vec![SpeedSample { error_kind: Some("timeout".into()), bytes_received: 0, ..sample(2, 0, 0.0) }],
        );
        let report = assemble_report(&groups, &latency, &samples, true);
        assert_eq!(report.rows[0].endpoint, ep(1));
        assert!(report.rows[0].score > 0.0);
        assert_eq!(report.rows[1].endpoint, ep(2));
        assert_eq!(report.rows[1].score, 0.0);
        assert_eq!(report.rows[1].error_kind.as_deref(), Some("timeout"));
    }

    #[test]
    fn report_rows_carry_group_uris() {
        let uri = "vless://u@104.16.0.1:443?security=tls&sni=s.io#x";
        let groups = vec![group(1, Some(uri))];
        let latency: BTreeMap<_, _> = vec![lat(1, true, 60.0)].into_iter().collect();
        let report = assemble_report(&groups, &latency, &BTreeMap::new(), false);
        assert_eq!(report.rows[0].uris, vec![uri.to_string()]);
        assert_eq!(report.rows[0].domains, vec!["host-1.example".to_string()]);
    }
}
