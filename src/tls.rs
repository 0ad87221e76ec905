//! Shared TLS dialer
//!
//! Edges are probed by raw IP, so certificate names can never match and
//! verification is skipped on purpose. All HTTP spoken over these streams
//! is HTTP/1.1, so only that ALPN is offered.

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
    time::{Duration, Instant},
};

use rustls::{client::ClientConfig, pki_types::ServerName};
use tokio::{net::TcpStream, time::timeout};
use tokio_rustls::{client::TlsStream, TlsConnector};

use crate::error::ScanError;

/// Timings of one successful dial
#[derive(Debug, Clone, Copy)]
pub struct DialTiming {
    /// TCP connect time
    pub tcp_ms: f64,
    /// Full TCP + TLS time from connect start
    pub tls_ms: f64,
}

/// Reusable connector with the probe-friendly client config
pub struct TlsDialer {
    connector: TlsConnector,
}

impl TlsDialer {
    pub fn new() -> Self {
        let mut cfg = ClientConfig::builder_with_provider(
            rustls::crypto::aws_lc_rs::default_provider().into(),
        )
        .with_safe_default_protocol_versions()
        .unwrap()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerifier))
        .with_no_client_auth();
        cfg.alpn_protocols = vec![b"http/1.1".to_vec()];
        Self {
            connector: TlsConnector::from(Arc::new(cfg)),
        }
    }

    /// TCP connect + TLS handshake with `sni`, all inside `deadline`.
    pub async fn connect(
        &self,
        ip: Ipv4Addr,
        port: u16,
        sni: &str,
        deadline: Duration,
    ) -> Result<(TlsStream<TcpStream>, DialTiming), ScanError> {
        let server_name = ServerName::try_from(sni.to_string())
            .map_err(|_| ScanError::TlsHandshake(format!("invalid server name {sni:?}")))?;

        let start = Instant::now();
        let addr = SocketAddr::new(IpAddr::V4(ip), port);
        let tcp = match timeout(deadline, TcpStream::connect(addr)).await {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => return Err(ScanError::from_io(&e)),
            Err(_) => return Err(ScanError::ProbeTimeout),
        };
        let tcp_ms = start.elapsed().as_secs_f64() * 1000.0;

        let left = deadline.saturating_sub(start.elapsed());
        if left.is_zero() {
            return Err(ScanError::ProbeTimeout);
        }
        let tls = match timeout(left, self.connector.connect(server_name, tcp)).await {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => return Err(ScanError::TlsHandshake(e.to_string())),
            Err(_) => return Err(ScanError::ProbeTimeout),
        };
        let tls_ms = start.elapsed().as_secs_f64() * 1000.0;

        Ok((tls, DialTiming { tcp_ms, tls_ms }))
    }
}

impl Default for TlsDialer {
    fn default() -> Self {
        Self::new()
    }
}

impl ScanError {
    fn from_io(e: &std::io::Error) -> Self {
        use std::io::ErrorKind;
        match e.kind() {
            ErrorKind::TimedOut => ScanError::ProbeTimeout,
            _ => ScanError::ProbeRefused,
        }
    }
}

#[derive(Debug)]
struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::ED25519,
        ]
    }
}
