//! DNS resolution, grouping by edge IP, and the latency pass
//!
//! Configs pointing at the same resolved IP are folded into one [`Group`];
//! a host resolving to several IPs joins a group per IP. The group map is
//! built once and read-only afterwards.

use std::{
    collections::{BTreeMap, BTreeSet},
    net::{Ipv4Addr, SocketAddr},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::{
    net::lookup_host,
    sync::{broadcast, mpsc, Semaphore},
    task::JoinSet,
    time::timeout,
};
use tracing::{debug, info};

use crate::{
    input::Seed,
    tls::TlsDialer,
    types::{
        CancelFlag, Endpoint, LatencyResult, ScanEvent, DNS_TIMEOUT, LATENCY_TIMEOUT,
        LATENCY_WORKERS,
    },
    uri::ProxyConfig,
};

/// Parameters of the resolve + latency phase
#[derive(Debug, Clone)]
pub struct LatencyParams {
    /// Concurrent latency probes
    pub workers: usize,
    /// Handshake budget per endpoint
    pub timeout: Duration,
    /// Per-host resolution budget
    pub dns_timeout: Duration,
}

impl Default for LatencyParams {
    fn default() -> Self {
        Self {
            workers: LATENCY_WORKERS,
            timeout: LATENCY_TIMEOUT,
            dns_timeout: DNS_TIMEOUT,
        }
    }
}

/// Everything known about one edge IP: the configs that point at it and
/// the host names that resolved to it.
#[derive(Debug, Clone)]
pub struct Group {
    pub endpoint: Endpoint,
    /// Member configs, unique by raw URI
    pub configs: Vec<ProxyConfig>,
    /// Host names that resolved here, sorted
    pub domains: Vec<String>,
}

impl Group {
    /// Server name for this group's probes: the primary config's SNI,
    /// else its host, else the bare IP.
    pub fn sni(&self) -> String {
        if let Some(c) = self.configs.first() {
            if !c.sni.is_empty() {
                return c.sni.clone();
            }
            return c.host.clone();
        }
        self.domains
            .first()
            .cloned()
            .unwrap_or_else(|| self.endpoint.ip.to_string())
    }
}

/// Resolve every seed to its IPv4 addresses. Literal IPs and pre-resolved
/// seeds skip the lookup. Returns the seeds paired with their addresses
/// plus the count of hosts that failed to resolve (those configs drop).
pub async fn resolve_seeds(
    seeds: Vec<Seed>,
    params: &LatencyParams,
    cancel: &CancelFlag,
) -> (Vec<(Seed, Vec<Ipv4Addr>)>, usize) {
    let sem = Arc::new(Semaphore::new(100));
    let mut set: JoinSet<(Seed, Vec<Ipv4Addr>)> = JoinSet::new();
    let dns_timeout = params.dns_timeout;

    for seed in seeds {
        if cancel.is_cancelled() {
            break;
        }
        let sem = sem.clone();
        set.spawn(async move {
            if let Some(ip) = seed.ip {
                return (seed, vec![ip]);
            }
            if let Ok(ip) = seed.host.parse::<Ipv4Addr>() {
                return (seed, vec![ip]);
            }
            if seed.host.parse::<std::net::Ipv6Addr>().is_ok() {
                // IPv6 edges are out of scope
                return (seed, Vec::new());
            }
            let _permit = sem.acquire_owned().await.expect("semaphore closed");
            let target = (seed.host.clone(), seed.port);
            let ips = match timeout(dns_timeout, lookup_host(target)).await {
                Ok(Ok(addrs)) => {
                    let mut v: Vec<Ipv4Addr> = addrs
                        .filter_map(|a| match a {
                            SocketAddr::V4(sa) => Some(*sa.ip()),
                            SocketAddr::V6(_) => None,
                        })
                        .collect();
                    v.sort_unstable();
                    v.dedup();
                    v
                }
                _ => {
                    debug!("dns failure for {}", seed.host);
                    Vec::new()
                }
            };
            (seed, ips)
        });
    }

    let mut resolved = Vec::new();
    let mut failed = 0usize;
    while let Some(joined) = set.join_next().await {
        if let Ok((seed, ips)) = joined {
            if ips.is_empty() {
                failed += 1;
            } else {
                resolved.push((seed, ips));
            }
        }
    }
    (resolved, failed)
}

/// Fold resolved seeds into the per-endpoint group map. Pure; the result
/// is never mutated afterwards.
pub fn build_groups(resolved: Vec<(Seed, Vec<Ipv4Addr>)>) -> Vec<Group> {
    let mut by_endpoint: BTreeMap<Endpoint, (Vec<ProxyConfig>, BTreeSet<String>)> =
        BTreeMap::new();
    for (seed, ips) in resolved {
        for ip in ips {
            let endpoint = Endpoint::new(ip, seed.port);
            let entry = by_endpoint.entry(endpoint).or_default();
            entry.1.insert(seed.host.clone());
            if let Some(config) = &seed.config {
                if !entry.0.iter().any(|c| c.raw_uri == config.raw_uri) {
                    entry.0.push(config.clone());
                }
            }
        }
    }
    by_endpoint
        .into_iter()
        .map(|(endpoint, (configs, domains))| Group {
            endpoint,
            configs,
            domains: domains.into_iter().collect(),
        })
        .collect()
}

/// Probe every group once. Alive means the TLS handshake finished inside
/// the timeout; dead endpoints leave the funnel here.
pub async fn measure_latency(
    groups: &[Group],
    params: &LatencyParams,
    dialer: Arc<TlsDialer>,
    cancel: CancelFlag,
    events: broadcast::Sender<ScanEvent>,
) -> BTreeMap<Endpoint, LatencyResult> {
    let total = groups.len();
    let _ = events.send(ScanEvent::PhaseStarted { phase: "latency".into(), total });
    info!("⏱️  latency pass over {} endpoints ({} workers)", total, params.workers);

    let targets: Arc<Vec<(Endpoint, String)>> =
        Arc::new(groups.iter().map(|g| (g.endpoint, g.sni())).collect());
    let cursor = Arc::new(AtomicUsize::new(0));
    let (res_tx, mut res_rx) = mpsc::channel::<LatencyResult>(256);

    let budget = params.timeout;
    for _ in 0..params.workers.max(1) {
        let targets = targets.clone();
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
                let Some((endpoint, sni)) = targets.get(i).cloned() else { break };
                let result = match dialer.connect(endpoint.ip, endpoint.port, &sni, budget).await
                {
                    Ok((stream, timing)) => {
                        drop(stream);
                        LatencyResult {
                            endpoint,
                            alive: true,
                            tcp_ms: Some(timing.tcp_ms),
                            tls_ms: Some(timing.tls_ms),
                            error_kind: None,
                        }
                    }
                    Err(e) => LatencyResult {
                        endpoint,
                        alive: false,
                        tcp_ms: None,
                        tls_ms: None,
                        error_kind: Some(e.kind_label().to_string()),
                    },
                };
                if res_tx.send(result).await.is_err() {
                    break;
                }
            }
        });
    }
    drop(res_tx);

    let mut out = BTreeMap::new();
    let mut alive = 0usize;
    while let Some(res) = res_rx.recv().await {
        if res.alive {
            alive += 1;
        }
        out.insert(res.endpoint, res);
        let done = out.len();
        if done % 50 == 0 || done == total {
            let _ = events.send(ScanEvent::Progress { done, total, found: alive });
        }
    }
    let dead = out.len() - alive;
    let _ = events.send(ScanEvent::LatencyDone { alive, dead });
    info!("✅ latency done: {alive} alive, {dead} dead");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed(host: &str, port: u16, uri: Option<&str>) -> Seed {
        Seed {
            host: host.to_string(),
            port,
            ip: host.parse().ok(),
            config: uri.map(|u| ProxyConfig::parse(u).unwrap()),
        }
    }

    #[test]
    fn groups_fold_configs_by_endpoint() {
        let a = seed("1.1.1.1", 443, Some("vless://u@1.1.1.1:443#a"));
        let b = seed("1.1.1.1", 443, Some("vless://u@1.1.1.1:443#b"));
        let dup = seed("1.1.1.1", 443, Some("vless://u@1.1.1.1:443#a"));
        let resolved = vec![
            (a, vec![Ipv4Addr::new(1, 1, 1, 1)]),
            (b, vec![Ipv4Addr::new(1, 1, 1, 1)]),
            (dup, vec![Ipv4Addr::new(1, 1, 1, 1)]),
        ];
        let groups = build_groups(resolved);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].configs.len(), 2);
        assert_eq!(groups[0].domains, vec!["1.1.1.1"]);
    }

    #[test]
    fn multi_ip_host_joins_every_group() {
        let s = seed("edge.example", 443, Some("vless://u@edge.example:443?sni=s.io#x"));
        let ips = vec![Ipv4Addr::new(104, 16, 0, 1), Ipv4Addr::new(104, 16, 0, 2)];
        let groups = build_groups(vec![(s, ips)]);
        assert_eq!(groups.len(), 2);
        for g in &groups {
            assert_eq!(g.configs.len(), 1);
            assert_eq!(g.domains, vec!["edge.example"]);
            assert_eq!(g.sni(), "s.io");
        }
    }

    #[test]
    fn ports_separate_endpoints() {
        let a = seed("1.1.1.1", 443, None);
        let b = seed("1.1.1.1", 8443, None);
        let groups = build_groups(vec![
            (a, vec![Ipv4Addr::new(1, 1, 1, 1)]),
            (b, vec![Ipv4Addr::new(1, 1, 1, 1)]),
        ]);
        assert_eq!(groups.len(), 2);
    }

    #[test]
    fn group_sni_falls_back_host_then_ip() {
        let with_host = seed("edge.example", 443, Some("vless://u@edge.example:443#x"));
        let groups = build_groups(vec![(with_host, vec![Ipv4Addr::new(1, 0, 0, 1)])]);
        assert_eq!(groups[0].sni(), "edge.example");

        let bare = seed("d.example", 443, None);
        let groups = build_groups(vec![(bare, vec![Ipv4Addr::new(1, 0, 0, 2)])]);
        assert_eq!(groups[0].sni(), "d.example");
    }

    #[tokio::test]
    async fn literal_ip_seeds_skip_dns() {
        let seeds = vec![seed("8.8.8.8", 443, None)];
        let (resolved, failed) = resolve_seeds(seeds, &LatencyParams::default(), &CancelFlag::new()).await;
        assert_eq!(failed, 0);
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].1, vec![Ipv4Addr::new(8, 8, 8, 8)]);
    }

    #[tokio::test]
    async fn ipv6_literals_are_dropped() {
        let seeds = vec![seed("2606:4700::1", 443, None)];
        let (resolved, failed) = resolve_seeds(seeds, &LatencyParams::default(), &CancelFlag::new()).await;
        assert!(resolved.is_empty());
        assert_eq!(failed, 1);
    }
}
