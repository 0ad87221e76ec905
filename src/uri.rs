//! VLESS / VMess URI codec
//!
//! Parses proxy share links into a [`ProxyConfig`], emits them back, and
//! substitutes edge addresses into templates while keeping the camouflage
//! SNI and Host header untouched. Unknown query parameters survive a
//! round-trip verbatim; only the fields the engines need are decoded.

use base64::{
    engine::general_purpose::{STANDARD, URL_SAFE},
    Engine as _,
};
use serde_json::{Map, Value};
use url::Url;

use crate::{error::ScanError, types::Endpoint};

/// Stream transport announced by the config
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Transport {
    #[default]
    Tcp,
    Ws,
    Grpc,
    H2,
    Xhttp,
}

impl Transport {
    fn from_label(s: &str) -> Self {
        match s {
            "ws" | "websocket" => Transport::Ws,
            "grpc" => Transport::Grpc,
            "h2" | "http" => Transport::H2,
            "xhttp" => Transport::Xhttp,
            _ => Transport::Tcp,
        }
    }
}

/// Stream security layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Security {
    #[default]
    None,
    Tls,
    Reality,
}

impl Security {
    fn from_label(s: &str) -> Self {
        match s {
            "tls" => Security::Tls,
            "reality" => Security::Reality,
            _ => Security::None,
        }
    }
}

/// Protocol tag plus the payload preserved for lossless emission
#[derive(Debug, Clone, PartialEq)]
pub enum Protocol {
    /// Raw query pairs in input order; values stay percent-encoded
    Vless { params: Vec<(String, Option<String>)> },
    /// The decoded JSON object of the share link
    Vmess { fields: Map<String, Value> },
}

/// Protocol tag without payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolKind {
    Vless,
    Vmess,
}

/// A parsed proxy URI
#[derive(Debug, Clone, PartialEq)]
pub struct ProxyConfig {
    /// Protocol payload
    pub protocol: Protocol,
    /// User id, kept opaque
    pub uuid: String,
    /// Server address: literal IP or DNS name (IPv6 bracket-stripped)
    pub host: String,
    /// Server port
    pub port: u16,
    /// Stream transport
    pub transport: Transport,
    /// Security layer
    pub security: Security,
    /// TLS server name, empty when absent
    pub sni: String,
    /// Transport path (ws/xhttp), decoded
    pub path: String,
    /// HTTP Host header for ws/h2 transports, empty when absent
    pub host_header: String,
    /// Display name, decoded
    pub remark: String,
    /// The URI this config was parsed from
    pub raw_uri: String,
}

impl ProxyConfig {
    /// Parse a share link. Unrecognized schemes and undecodable payloads
    /// fail with the offending input attached.
    pub fn parse(uri: &str) -> Result<Self, ScanError> {
        let uri = uri.trim();
        if uri.starts_with("vless://") {
            parse_vless(uri)
        } else if uri.starts_with("vmess://") {
            parse_vmess(uri)
        } else {
            Err(malformed(uri))
        }
    }

    pub fn kind(&self) -> ProtocolKind {
        match self.protocol {
            Protocol::Vless { .. } => ProtocolKind::Vless,
            Protocol::Vmess { .. } => ProtocolKind::Vmess,
        }
    }

    /// Decoded value of a VLESS query parameter
    pub fn param(&self, key: &str) -> Option<String> {
        match &self.protocol {
            Protocol::Vless { params } => params.iter().find(|(k, _)| k == key).map(|(_, v)| {
                let raw = v.as_deref().unwrap_or("");
                urlencoding::decode(raw).map(|c| c.into_owned()).unwrap_or_else(|_| raw.to_string())
            }),
            Protocol::Vmess { .. } => None,
        }
    }

    /// Serialize back into a share link. Path and remark are re-encoded;
    /// VMess base64 is emitted padded. Query-pair order is preserved.
    pub fn emit(&self) -> String {
        match &self.protocol {
            Protocol::Vless { params } => {
                let mut out = format!("vless://{}@{}:{}", self.uuid, host_for_uri(&self.host), self.port);
                if !params.is_empty() {
                    out.push('?');
                    let joined: Vec<String> = params
                        .iter()
                        .map(|(k, v)| match v {
                            Some(v) => format!("{k}={v}"),
                            None => k.clone(),
                        })
                        .collect();
                    out.push_str(&joined.join("&"));
                }
                if !self.remark.is_empty() {
                    out.push('#');
                    out.push_str(&urlencoding::encode(&self.remark));
                }
                out
            }
            Protocol::Vmess { fields } => {
                let mut fields = fields.clone();
                fields.insert("add".into(), Value::String(self.host.clone()));
                set_vmess_port(&mut fields, self.port);
                fields.insert("ps".into(), Value::String(self.remark.clone()));
                let json = Value::Object(fields).to_string();
                format!("vmess://{}", STANDARD.encode(json.as_bytes()))
            }
        }
    }

    /// Copy with a different display name
    pub fn with_remark(mut self, remark: &str) -> Self {
        self.remark = remark.to_string();
        self.raw_uri = self.emit();
        self
    }
}

/// Swap the edge address of a template, leaving every camouflage field
/// (SNI, Host header, path, uuid, security, transport, remark) untouched.
pub fn substitute(template: &ProxyConfig, endpoint: &Endpoint) -> ProxyConfig {
    substitute_host(template, &endpoint.ip.to_string(), Some(endpoint.port))
}

/// General form of [`substitute`]: the replacement may be a DNS name, and
/// the template's port is kept when the address carries none.
pub fn substitute_host(template: &ProxyConfig, host: &str, port: Option<u16>) -> ProxyConfig {
    let mut out = template.clone();
    out.host = host.trim_start_matches('[').trim_end_matches(']').to_string();
    if let Some(p) = port {
        out.port = p;
    }
    out.raw_uri = out.emit();
    out
}

fn malformed(uri: &str) -> ScanError {
    ScanError::MalformedUri { uri: uri.to_string() }
}

/// Bracket IPv6 literals for the authority component
fn host_for_uri(host: &str) -> String {
    if host.contains(':') {
        format!("[{host}]")
    } else {
        host.to_string()
    }
}

fn parse_vless(uri: &str) -> Result<ProxyConfig, ScanError> {
    let url = Url::parse(uri).map_err(|_| malformed(uri))?;

    let uuid = url.username().to_string();
    if uuid.is_empty() {
        return Err(malformed(uri));
    }
    let host = url
        .host_str()
        .ok_or_else(|| malformed(uri))?
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string();
    let port = url.port().unwrap_or(443);

    // Keep raw pairs so unknown parameters round-trip byte-for-byte.
    let params: Vec<(String, Option<String>)> = url
        .query()
        .map(|q| {
            q.split('&')
                .filter(|s| !s.is_empty())
                .map(|pair| match pair.split_once('=') {
                    Some((k, v)) => (k.to_string(), Some(v.to_string())),
                    None => (pair.to_string(), None),
                })
                .collect()
        })
        .unwrap_or_default();

    let remark = url
        .fragment()
        .map(|f| urlencoding::decode(f).map(|c| c.into_owned()).unwrap_or_else(|_| f.to_string()))
        .unwrap_or_default();

    let decoded = |key: &str| -> String {
        params
            .iter()
            .find(|(k, _)| k == key)
            .and_then(|(_, v)| v.as_deref())
            .map(|raw| {
                urlencoding::decode(raw).map(|c| c.into_owned()).unwrap_or_else(|_| raw.to_string())
            })
            .unwrap_or_default()
    };

    let transport = Transport::from_label(&decoded("type"));
    let security = Security::from_label(&decoded("security"));
    let sni = decoded("sni");
    let path = decoded("path");
    let host_header = decoded("host");

    Ok(ProxyConfig {
        protocol: Protocol::Vless { params },
        uuid,
        host,
        port,
        transport,
        security,
        sni,
        path,
        host_header,
        remark,
        raw_uri: uri.to_string(),
    })
}

fn parse_vmess(uri: &str) -> Result<ProxyConfig, ScanError> {
    let payload = uri.strip_prefix("vmess://").ok_or_else(|| malformed(uri))?;
    // Some share lists append a #remark even to vmess links
    let (payload, frag) = match payload.split_once('#') {
        Some((p, f)) => (p, Some(f)),
        None => (payload, None),
    };

    let bytes = decode_b64_forgiving(payload).ok_or_else(|| malformed(uri))?;
    let value: Value = serde_json::from_slice(&bytes).map_err(|_| malformed(uri))?;
    let fields = match value {
        Value::Object(m) => m,
        _ => return Err(malformed(uri)),
    };

    let text = |key: &str| -> String {
        fields.get(key).and_then(Value::as_str).unwrap_or_default().to_string()
    };

    let host = text("add");
    if host.is_empty() {
        return Err(malformed(uri));
    }
    let port = match fields.get("port") {
        Some(Value::Number(n)) => n.as_u64().and_then(|p| u16::try_from(p).ok()),
        Some(Value::String(s)) => s.parse::<u16>().ok(),
        _ => None,
    }
    .unwrap_or(443);

    let uuid = text("id");
    if uuid.is_empty() {
        return Err(malformed(uri));
    }

    let remark = match frag {
        Some(f) => urlencoding::decode(f).map(|c| c.into_owned()).unwrap_or_else(|_| f.to_string()),
        None => text("ps"),
    };

    let transport = Transport::from_label(&text("net"));
    let security = Security::from_label(&text("tls"));
    let sni = text("sni");
    let path = text("path");
    let host_header = text("host");

    Ok(ProxyConfig {
        protocol: Protocol::Vmess { fields },
        uuid,
        host,
        port,
        transport,
        security,
        sni,
        path,
        host_header,
        remark,
        raw_uri: uri.to_string(),
    })
}

/// Keep the JSON type the link used for its port (usually a string)
fn set_vmess_port(fields: &mut Map<String, Value>, port: u16) {
    let as_number = matches!(fields.get("port"), Some(Value::Number(_)));
    let value = if as_number {
        Value::Number(port.into())
    } else {
        Value::String(port.to_string())
    };
    fields.insert("port".into(), value);
}

/// Base64 decode tolerating missing padding, whitespace, and either the
/// standard or the URL-safe alphabet.
pub(crate) fn decode_b64_forgiving(input: &str) -> Option<Vec<u8>> {
    let compact: String = input.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.is_empty() {
        return None;
    }
    let padded = match compact.len() % 4 {
        0 => compact,
        n => format!("{}{}", compact, "=".repeat(4 - n)),
    };
    STANDARD.decode(&padded).ok().or_else(|| URL_SAFE.decode(&padded).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const VLESS: &str = "vless://2f5b3670-5e29-4a43-b9a7-1cd0e7b3a1aa@104.16.1.1:443\
        ?type=ws&security=tls&sni=shield.example.io&host=shield.example.io&path=%2Fws&fp=chrome\
        #edge%20one";

    fn vmess_uri(json: &str) -> String {
        format!("vmess://{}", STANDARD.encode(json.as_bytes()))
    }

    #[test]
    fn vless_parse_extracts_fields() {
        let c = ProxyConfig::parse(VLESS).unwrap();
        assert_eq!(c.kind(), ProtocolKind::Vless);
        assert_eq!(c.uuid, "2f5b3670-5e29-4a43-b9a7-1cd0e7b3a1aa");
        assert_eq!(c.host, "104.16.1.1");
        assert_eq!(c.port, 443);
        assert_eq!(c.transport, Transport::Ws);
        assert_eq!(c.security, Security::Tls);
        assert_eq!(c.sni, "shield.example.io");
        assert_eq!(c.path, "/ws");
        assert_eq!(c.host_header, "shield.example.io");
        assert_eq!(c.remark, "edge one");
        assert_eq!(c.param("fp").as_deref(), Some("chrome"));
    }

    #[test]
    fn vless_round_trip_is_structurally_equal() {
        let first = ProxyConfig::parse(VLESS).unwrap();
        let second = ProxyConfig::parse(&first.emit()).unwrap();
        assert_eq!(first.uuid, second.uuid);
        assert_eq!(first.host, second.host);
        assert_eq!(first.port, second.port);
        assert_eq!(first.transport, second.transport);
        assert_eq!(first.security, second.security);
        assert_eq!(first.sni, second.sni);
        assert_eq!(first.path, second.path);
        assert_eq!(first.host_header, second.host_header);
        assert_eq!(first.remark, second.remark);
        assert_eq!(first.protocol, second.protocol);
    }

    #[test]
    fn vless_unknown_params_survive() {
        let uri = "vless://u@h.io:2053?type=grpc&serviceName=svc&pbk=KEY&sid=ab12&spx=%2F&mode=gun#x";
        let c = ProxyConfig::parse(uri).unwrap();
        let emitted = c.emit();
        for piece in ["serviceName=svc", "pbk=KEY", "sid=ab12", "spx=%2F", "mode=gun"] {
            assert!(emitted.contains(piece), "{piece} missing from {emitted}");
        }
        assert_eq!(c.transport, Transport::Grpc);
    }

    #[test]
    fn vmess_parse_matches_share_format() {
        let uri = vmess_uri(
            r#"{"v":"2","ps":"t","add":"1.2.3.4","port":"443","id":"uuid","aid":"0","net":"ws","type":"none","host":"s.io","path":"/","tls":"tls","sni":"s.io"}"#,
        );
        let c = ProxyConfig::parse(&uri).unwrap();
        assert_eq!(c.kind(), ProtocolKind::Vmess);
        assert_eq!(c.host, "1.2.3.4");
        assert_eq!(c.port, 443);
        assert_eq!(c.transport, Transport::Ws);
        assert_eq!(c.security, Security::Tls);
        assert_eq!(c.sni, "s.io");
        assert_eq!(c.remark, "t");
    }

    #[test]
    fn vmess_round_trip_keeps_unknown_keys() {
        let uri = vmess_uri(
            r#"{"v":"2","ps":"n","add":"edge.example.com","port":443,"id":"abc","scy":"auto","alpn":"h2,http/1.1","custom":"kept"}"#,
        );
        let first = ProxyConfig::parse(&uri).unwrap();
        let second = ProxyConfig::parse(&first.emit()).unwrap();
        assert_eq!(first.host, second.host);
        assert_eq!(first.port, second.port);
        assert_eq!(first.uuid, second.uuid);
        match &second.protocol {
            Protocol::Vmess { fields } => {
                assert_eq!(fields.get("custom").and_then(Value::as_str), Some("kept"));
                // numeric port stays numeric
                assert!(matches!(fields.get("port"), Some(Value::Number(_))));
            }
            _ => panic!("not vmess"),
        }
    }

    #[test]
    fn vmess_unpadded_base64_is_accepted() {
        let uri = vmess_uri(r#"{"add":"h.io","port":"443","id":"u"}"#);
        let trimmed = uri.trim_end_matches('=').to_string();
        assert!(ProxyConfig::parse(&trimmed).is_ok());
    }

    #[test]
    fn substitution_swaps_only_the_edge() {
        let template = ProxyConfig::parse(VLESS).unwrap();
        let endpoint = Endpoint::new(Ipv4Addr::new(172, 64, 9, 9), 8443);
        let out = substitute(&template, &endpoint);
        assert_eq!(out.host, "172.64.9.9");
        assert_eq!(out.port, 8443);
        assert_eq!(out.sni, template.sni);
        assert_eq!(out.path, template.path);
        assert_eq!(out.uuid, template.uuid);
        assert_eq!(out.security, template.security);
        assert_eq!(out.transport, template.transport);
        assert_eq!(out.remark, template.remark);
        assert_eq!(out.host_header, template.host_header);
        // and the emitted URI reflects the new edge
        let reparsed = ProxyConfig::parse(&out.raw_uri).unwrap();
        assert_eq!(reparsed.host, "172.64.9.9");
        assert_eq!(reparsed.port, 8443);
    }

    #[test]
    fn vmess_substitution_keeps_camouflage() {
        let uri = vmess_uri(
            r#"{"v":"2","ps":"t","add":"old.example.com","port":"443","id":"u1","net":"ws","host":"cdn.site","path":"/dl","tls":"tls","sni":"cdn.site"}"#,
        );
        let template = ProxyConfig::parse(&uri).unwrap();
        let out = substitute(&template, &Endpoint::new(Ipv4Addr::new(104, 24, 0, 7), 443));
        let reparsed = ProxyConfig::parse(&out.raw_uri).unwrap();
        assert_eq!(reparsed.host, "104.24.0.7");
        assert_eq!(reparsed.sni, "cdn.site");
        assert_eq!(reparsed.host_header, "cdn.site");
        assert_eq!(reparsed.path, "/dl");
    }

    #[test]
    fn ipv6_hosts_parse_bracket_stripped() {
        let c = ProxyConfig::parse("vless://u@[2606:4700::1]:443?security=tls#v6").unwrap();
        assert_eq!(c.host, "2606:4700::1");
        assert!(c.emit().contains("[2606:4700::1]:443"));
    }

    #[test]
    fn malformed_inputs_are_rejected() {
        for bad in [
            "ss://b3BhcXVl",
            "vmess://%%%not-base64%%%",
            "vmess://aGVsbG8gd29ybGQ",     // decodes, but not JSON
            "vless://no-at-sign.example",
            "",
            "just words",
        ] {
            match ProxyConfig::parse(bad) {
                Err(ScanError::MalformedUri { uri }) => assert_eq!(uri, bad.trim()),
                other => panic!("expected MalformedUri for {bad:?}, got {other:?}"),
            }
        }
    }

    #[test]
    fn remark_is_re_encoded_on_emit() {
        let c = ProxyConfig::parse("vless://u@h.io:443#with%20space%2Fslash").unwrap();
        assert_eq!(c.remark, "with space/slash");
        assert!(c.emit().ends_with("#with%20space%2Fslash"));
    }
}
