//! Error taxonomy
//!
//! Per-endpoint errors are values carried in results; they never abort a
//! run. Only output-path I/O and CLI contract violations are fatal.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScanError {
    /// Input line failed to parse; the line is skipped and counted
    #[error("malformed uri: {uri}")]
    MalformedUri { uri: String },

    /// Host did not resolve; the config is dropped
    #[error("dns lookup failed: {host}")]
    DnsFailure { host: String },

    /// Connect or handshake exceeded its timeout
    #[error("probe timed out")]
    ProbeTimeout,

    /// TCP connection refused or reset
    #[error("connection refused")]
    ProbeRefused,

    /// TCP established but the TLS handshake failed
    #[error("tls handshake failed: {0}")]
    TlsHandshake(String),

    /// HTTP 429 from the speed host; owned by the rate-limit accountant
    #[error("rate limited, retry after {retry_after}s")]
    RateLimited { retry_after: u64 },

    /// HTTP 403 for a large file; retried via the mirror
    #[error("download size blocked (403)")]
    BlockedSize,

    /// Disk write failure, missing argument — surfaced with exit code 2
    #[error("{0}")]
    Unrecoverable(String),
}

impl ScanError {
    /// Stable short label for CSV columns and events
    pub fn kind_label(&self) -> &'static str {
        match self {
            ScanError::MalformedUri { .. } => "malformed-uri",
            ScanError::DnsFailure { .. } => "dns",
            ScanError::ProbeTimeout => "timeout",
            ScanError::ProbeRefused => "refused",
            ScanError::TlsHandshake(_) => "tls",
            ScanError::RateLimited { .. } => "429",
            ScanError::BlockedSize => "403",
            ScanError::Unrecoverable(_) => "fatal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_are_stable() {
        assert_eq!(ScanError::ProbeTimeout.kind_label(), "timeout");
        assert_eq!(
            ScanError::RateLimited { retry_after: 60 }.kind_label(),
            "429"
        );
        assert_eq!(
            ScanError::MalformedUri { uri: "x".into() }.kind_label(),
            "malformed-uri"
        );
    }
}
