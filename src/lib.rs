//! cfray — Cloudflare edge-IP quality scanner
//!
//! Tests VLESS/VMess configs for latency and download speed, ranks edges
//! by a composite score, and sweeps the published ranges for clean IPs.

// ── Core ────────────────────────────────────────────────────────────────────
pub mod error;
pub mod types;
pub mod uri;

// ── Input ───────────────────────────────────────────────────────────────────
pub mod input;

// ── Engines ─────────────────────────────────────────────────────────────────
pub mod latency;
pub mod ratelimit;
pub mod speed;
pub mod sweep;
pub mod tls;

// ── Output & Orchestration ──────────────────────────────────────────────────
pub mod engine;
pub mod export;

// ── Re-exports ──────────────────────────────────────────────────────────────

/// Shared types for use across all modules
pub use types::{
    CancelFlag, CdnSignature, CleanMode, Endpoint, LatencyResult, RoundSpec, ScanEvent,
    SpeedMode, SpeedSample, Via, CDN_SIGNATURES, CF_SUBNETS, CLOUDFLARE_SIG,
};

pub use engine::{substitute, substitute_host, Scanner};
pub use error::ScanError;
pub use export::{ScanReport, ReportRow};
pub use uri::{Protocol, ProtocolKind, ProxyConfig, Security, Transport};
