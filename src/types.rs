//! Shared types and constants for the scanner engines

use std::{
    fmt,
    net::Ipv4Addr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use serde::{Deserialize, Serialize};

// ==================== CONSTANTS ====================

/// Cloudflare published IPv4 ranges (https://www.cloudflare.com/ips-v4/)
pub const CF_SUBNETS: &[&str] = &[
    "173.245.48.0/20",
    "103.21.244.0/22",
    "103.22.200.0/22",
    "103.31.4.0/22",
    "141.101.64.0/18",
    "108.162.192.0/18",
    "190.93.240.0/20",
    "188.114.96.0/20",
    "197.234.240.0/22",
    "198.41.128.0/17",
    "162.158.0.0/15",
    "104.16.0.0/13",
    "104.24.0.0/14",
    "172.64.0.0/13",
];

/// Speed-test endpoint on the primary CDN
pub const SPEED_HOST: &str = "speed.cloudflare.com";
/// Range-download path on the speed host (`?bytes=N` selects the size)
pub const SPEED_PATH: &str = "/__down";

/// Mirror CDN host serving identical large files, used when the primary
/// rate-limits
pub const MIRROR_HOST: &str = "cloudflaremirrors.com";
/// A large static file on the mirror, fetched with a `Range` header
pub const MIRROR_PATH: &str = "/archlinux/iso/latest/archlinux-x86_64.iso";

/// Default latency-probe workers
pub const LATENCY_WORKERS: usize = 50;
/// Default download workers
pub const SPEED_WORKERS: usize = 10;
/// Default sweep workers
pub const SWEEP_WORKERS: usize = 300;
/// Default latency/probe handshake timeout
pub const LATENCY_TIMEOUT: Duration = Duration::from_secs(5);
/// Default download timeout
pub const SPEED_TIMEOUT: Duration = Duration::from_secs(30);
/// Default DNS resolution timeout
pub const DNS_TIMEOUT: Duration = Duration::from_secs(3);

/// How a CDN identifies itself on the wire. Verification accepts an edge
/// when the `Server` header starts with `server_prefix` or when the trace
/// header is present at all.
#[derive(Debug, Clone, Copy)]
pub struct CdnSignature {
    /// Human name
    pub name: &'static str,
    /// SNI used for anonymous probes (must be served by every edge)
    pub probe_sni: &'static str,
    /// Case-insensitive prefix of the `Server` response header
    pub server_prefix: &'static str,
    /// CDN-specific trace header, e.g. the ray id
    pub trace_header: &'static str,
}

/// Cloudflare signature
pub const CLOUDFLARE_SIG: CdnSignature = CdnSignature {
    name: "Cloudflare",
    probe_sni: "speed.cloudflare.com",
    server_prefix: "cloudflare",
    trace_header: "cf-ray",
};

/// Known CDN signatures, primary first
pub const CDN_SIGNATURES: &[CdnSignature] = &[CLOUDFLARE_SIG];

// ==================== MODES ====================

/// Clean-IP sweep scope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CleanMode {
    /// 1 random IP per /24, no header verification
    Quick,
    /// 3 random IPs per /24 + CDN verify
    Normal,
    /// Every host address + CDN verify (~1.5M probes)
    Full,
    /// Every host address on ports 443 and 8443 (~3M probes)
    Mega,
}

impl CleanMode {
    /// Random samples per /24 block; 0 means all host addresses
    pub fn sample_per_24(self) -> usize {
        match self {
            CleanMode::Quick => 1,
            CleanMode::Normal => 3,
            CleanMode::Full | CleanMode::Mega => 0,
        }
    }

    /// Whether the probe issues the HEAD verification request
    pub fn verify(self) -> bool {
        !matches!(self, CleanMode::Quick)
    }

    /// Ports probed per candidate IP
    pub fn ports(self) -> &'static [u16] {
        match self {
            CleanMode::Mega => &[443, 8443],
            _ => &[443],
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            CleanMode::Quick => "quick",
            CleanMode::Normal => "normal",
            CleanMode::Full => "full",
            CleanMode::Mega => "mega",
        }
    }
}

/// Speed-funnel preset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpeedMode {
    Quick,
    Normal,
    Thorough,
}

impl SpeedMode {
    /// The preset's rounds as (file size, candidate cap); `None` caps
    /// nothing
    pub fn rounds(self) -> Vec<RoundSpec> {
        match self {
            SpeedMode::Quick => vec![
                RoundSpec { size: 1_000_000, keep: None },
                RoundSpec { size: 5_000_000, keep: None },
            ],
            SpeedMode::Normal => vec![
                RoundSpec { size: 1_000_000, keep: None },
                RoundSpec { size: 5_000_000, keep: Some(50) },
                RoundSpec { size: 20_000_000, keep: Some(20) },
            ],
            SpeedMode::Thorough => vec![
                RoundSpec { size: 5_000_000, keep: None },
                RoundSpec { size: 25_000_000, keep: Some(20) },
                RoundSpec { size: 50_000_000, keep: Some(10) },
            ],
        }
    }
}

/// One speed round: download `size` bytes from each of at most `keep`
/// candidates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundSpec {
    /// Bytes requested per endpoint
    pub size: u64,
    /// Candidate cap entering this round; `None` = the whole alive set
    pub keep: Option<usize>,
}

impl RoundSpec {
    /// Short human label, e.g. `5MB`
    pub fn label(&self) -> String {
        if self.size >= 1_000_000 {
            format!("{}MB", self.size / 1_000_000)
        } else {
            format!("{}KB", self.size / 1_000)
        }
    }
}

// ==================== CORE STRUCTS ====================

/// An edge address under test
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Endpoint {
    /// IPv4 address
    pub ip: Ipv4Addr,
    /// TLS port (443, or 8443 in mega sweeps)
    pub port: u16,
}

impl Endpoint {
    pub fn new(ip: Ipv4Addr, port: u16) -> Self {
        Self { ip, port }
    }
}

impl fmt::Display for Endpoint {
    /// `ip` alone on 443, `ip:port` otherwise
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.port == 443 {
            write!(f, "{}", self.ip)
        } else {
            write!(f, "{}:{}", self.ip, self.port)
        }
    }
}

/// Outcome of one latency probe
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatencyResult {
    /// Probed endpoint
    pub endpoint: Endpoint,
    /// TLS handshake completed within the timeout
    pub alive: bool,
    /// TCP connect time
    pub tcp_ms: Option<f64>,
    /// Full TCP + TLS time from connect start
    pub tls_ms: Option<f64>,
    /// Short error label when dead
    pub error_kind: Option<String>,
}

/// Which host served a download
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Via {
    /// The CDN speed-test endpoint
    Direct,
    /// The mirror CDN
    Mirror,
}

impl fmt::Display for Via {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Via::Direct => write!(f, "direct"),
            Via::Mirror => write!(f, "mirror"),
        }
    }
}

/// Outcome of one download probe
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeedSample {
    /// Probed endpoint
    pub endpoint: Endpoint,
    /// Zero-based round index
    pub round_id: usize,
    /// Bytes asked for
    pub bytes_requested: u64,
    /// Bytes actually received
    pub bytes_received: u64,
    /// Request issue to first body byte
    pub ttfb_ms: f64,
    /// Request issue to last body byte
    pub elapsed_ms: f64,
    /// 8·bytes/(elapsed/1000)/1e6
    pub throughput_mbps: f64,
    /// HTTP status of the response, 0 when none arrived
    pub http_status: u16,
    /// Host that served the bytes
    pub via: Via,
    /// Short error label when the probe failed
    pub error_kind: Option<String>,
}

impl SpeedSample {
    /// A sample that produced usable bytes
    pub fn ok(&self) -> bool {
        self.error_kind.is_none() && self.bytes_received > 0
    }
}

// ==================== EVENTS ====================

/// Progress events broadcast by the engines. An optional dashboard and the
/// exporter both consume these; the core renders nothing itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ScanEvent {
    /// A phase began
    PhaseStarted { phase: String, total: usize },
    /// Work-unit progress inside the current phase
    Progress { done: usize, total: usize, found: usize },
    /// Latency pass finished
    LatencyDone { alive: usize, dead: usize },
    /// A speed round began
    RoundStarted { round: usize, size: u64, candidates: usize },
    /// A download finished
    SampleRecorded { endpoint: Endpoint, round: usize, mbps: f64 },
    /// Direct requests are paused; countdown for UI rendering
    RateLimitPause { seconds_left: u64 },
    /// Requests now flow through the mirror CDN
    MirrorActive { host: String },
    /// Direct requests resumed
    MirrorReleased,
    /// The run is over (completed or cancelled)
    Finished { cancelled: bool },
}

// ==================== CANCELLATION ====================

/// Cooperative cancel signal shared by every engine. Workers stop admitting
/// new work when raised; in-flight probes run out their own timeouts.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_display_hides_default_port() {
        let e = Endpoint::new(Ipv4Addr::new(104, 16, 1, 1), 443);
        assert_eq!(e.to_string(), "104.16.1.1");
        let e = Endpoint::new(Ipv4Addr::new(104, 16, 1, 1), 8443);
        assert_eq!(e.to_string(), "104.16.1.1:8443");
    }

    #[test]
    fn clean_mode_table() {
        assert_eq!(CleanMode::Quick.sample_per_24(), 1);
        assert!(!CleanMode::Quick.verify());
        assert_eq!(CleanMode::Normal.sample_per_24(), 3);
        assert!(CleanMode::Normal.verify());
        assert_eq!(CleanMode::Full.sample_per_24(), 0);
        assert_eq!(CleanMode::Mega.ports(), &[443, 8443]);
    }

    #[test]
    fn round_labels() {
        assert_eq!(RoundSpec { size: 5_000_000, keep: None }.label(), "5MB");
        assert_eq!(RoundSpec { size: 500_000, keep: Some(10) }.label(), "500KB");
    }
}
