//! Input loading
//!
//! Five input shapes, detected in priority order: explicit template +
//! address list, subscription URL (plain or base64 body), domain-JSON
//! file, plain text of URIs, and clean-IP-only runs that carry no configs
//! at all.

use std::{net::Ipv4Addr, path::Path, time::Duration};

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::{
    error::ScanError,
    uri::{decode_b64_forgiving, substitute_host, ProxyConfig},
};

/// One unit of work for the resolver: a host to resolve (or an already
/// known IP) plus the config that produced it, when there is one.
#[derive(Debug, Clone)]
pub struct Seed {
    /// DNS name or literal IP
    pub host: String,
    /// Port the config points at
    pub port: u16,
    /// Pre-resolved address (domain-JSON inputs carry one)
    pub ip: Option<Ipv4Addr>,
    /// Originating config; `None` for bare candidates
    pub config: Option<ProxyConfig>,
}

impl Seed {
    fn from_config(config: ProxyConfig) -> Self {
        Seed {
            host: config.host.clone(),
            port: config.port,
            ip: config.host.parse().ok(),
            config: Some(config),
        }
    }
}

/// Loader output: seeds plus bookkeeping for the end-of-run report
#[derive(Debug, Default)]
pub struct LoadedInput {
    pub seeds: Vec<Seed>,
    /// Lines that failed to parse and were skipped
    pub malformed: usize,
    /// Human label of where the seeds came from
    pub source: String,
}

/// Parse newline-separated URIs: blank lines and `#` comments ignored,
/// malformed lines skipped and counted, duplicates (by raw URI) collapsed.
pub fn parse_uri_lines(text: &str) -> (Vec<ProxyConfig>, usize) {
    let mut configs: Vec<ProxyConfig> = Vec::new();
    let mut seen: std::collections::HashSet<String> = std::collections::HashSet::new();
    let mut malformed = 0usize;
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match ProxyConfig::parse(line) {
            Ok(c) => {
                if seen.insert(c.raw_uri.clone()) {
                    configs.push(c);
                }
            }
            Err(ScanError::MalformedUri { uri }) => {
                debug!("skipping malformed line: {uri}");
                malformed += 1;
            }
            Err(_) => malformed += 1,
        }
    }
    (configs, malformed)
}

/// A subscription body is either the plain text above or its base64. The
/// decode is accepted when the decoded bytes start (after whitespace) with
/// a known scheme.
pub fn decode_subscription_body(body: &str) -> String {
    if let Some(bytes) = decode_b64_forgiving(body.trim()) {
        let text = String::from_utf8_lossy(&bytes);
        let head = text.trim_start();
        if head.starts_with("vless://") || head.starts_with("vmess://") {
            return text.into_owned();
        }
    }
    body.to_string()
}

/// Fetch a subscription URL and parse its body.
pub async fn fetch_subscription(url: &str) -> Result<LoadedInput> {
    if !url.starts_with("http://") && !url.starts_with("https://") {
        anyhow::bail!("--sub only accepts http:// or https:// URLs");
    }
    let client = reqwest::Client::builder()
        .user_agent("Mozilla/5.0")
        .timeout(Duration::from_secs(15))
        .build()
        .context("building http client")?;
    let body = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("fetching subscription {url}"))?
        .text()
        .await
        .context("reading subscription body")?;

    let (configs, malformed) = parse_uri_lines(&decode_subscription_body(&body));
    Ok(LoadedInput {
        seeds: configs.into_iter().map(Seed::from_config).collect(),
        malformed,
        source: url.to_string(),
    })
}

#[derive(Debug, Deserialize)]
struct DomainRecord {
    #[serde(default)]
    domain: String,
    #[serde(default)]
    ipv4: String,
}

#[derive(Debug, Deserialize)]
struct DomainFile {
    data: Vec<DomainRecord>,
}

/// Parse the `{"data":[{"domain":…,"ipv4":…},…]}` shape.
fn parse_domain_json(text: &str) -> Option<Vec<DomainRecord>> {
    let parsed: DomainFile = serde_json::from_str(text).ok()?;
    let records: Vec<DomainRecord> =
        parsed.data.into_iter().filter(|r| !r.domain.is_empty()).collect();
    if records.is_empty() {
        None
    } else {
        Some(records)
    }
}

/// Load an input file: a domain-JSON document or newline URIs.
pub fn load_input_file(path: &Path) -> Result<LoadedInput> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;

    if let Some(records) = parse_domain_json(&raw) {
        let seeds = records
            .into_iter()
            .map(|r| Seed {
                ip: r.ipv4.parse().ok(),
                host: r.domain,
                port: 443,
                config: None,
            })
            .collect();
        return Ok(LoadedInput {
            seeds,
            malformed: 0,
            source: path.display().to_string(),
        });
    }

    let (configs, malformed) = parse_uri_lines(&raw);
    Ok(LoadedInput {
        seeds: configs.into_iter().map(Seed::from_config).collect(),
        malformed,
        source: path.display().to_string(),
    })
}

/// Load an address list for template substitution: a JSON array, a JSON
/// object holding one (strings or `{domain:…}` records), or plain lines.
pub fn load_addresses(path: &Path) -> Result<Vec<String>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    Ok(parse_address_list(&raw))
}

fn parse_address_list(raw: &str) -> Vec<String> {
    if let Ok(value) = serde_json::from_str::<Value>(raw) {
        let list = match &value {
            Value::Array(items) => Some(items),
            Value::Object(map) => ["addresses", "domains", "ips", "data"]
                .iter()
                .find_map(|k| map.get(*k).and_then(Value::as_array)),
            _ => None,
        };
        if let Some(items) = list {
            return items
                .iter()
                .filter_map(|v| match v {
                    Value::String(s) if !s.is_empty() => Some(s.clone()),
                    Value::Object(m) => {
                        m.get("domain").and_then(Value::as_str).map(str::to_string)
                    }
                    _ => None,
                })
                .collect();
        }
    }
    raw.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_string)
        .collect()
}

/// Split an `addr[:port]` line; bracketed IPv6 literals pass through whole.
fn split_addr_port(addr: &str) -> (&str, Option<u16>) {
    if addr.starts_with('[') {
        return (addr, None);
    }
    match addr.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => {
            (host, port.parse().ok())
        }
        _ => (addr, None),
    }
}

/// Substitute every address into the template. Remarks are rewritten to
/// `cfg-<n>-<addr>` so generated entries stay tellable apart.
pub fn generate_from_template(template: &str, addresses: &[String]) -> Result<LoadedInput, ScanError> {
    let template = ProxyConfig::parse(template)?;
    let mut seeds = Vec::with_capacity(addresses.len());
    for (i, addr) in addresses.iter().enumerate() {
        let addr = addr.trim();
        if addr.is_empty() {
            continue;
        }
        let (host, port) = split_addr_port(addr);
        let short: String = host.chars().take(20).collect();
        let config = substitute_host(&template, host, port)
            .with_remark(&format!("cfg-{}-{}", i + 1, short));
        seeds.push(Seed::from_config(config));
    }
    if seeds.is_empty() {
        warn!("template produced no configs from {} addresses", addresses.len());
    }
    Ok(LoadedInput {
        seeds,
        malformed: 0,
        source: format!("template ({} addresses)", addresses.len()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{engine::general_purpose::STANDARD, Engine as _};

    #[test]
    fn uri_lines_skip_comments_and_dedupe() {
        let text = "# list\n\nvless://a@h.io:443#x\nvless://a@h.io:443#x\nnot-a-uri\n";
        let (configs, malformed) = parse_uri_lines(text);
        assert_eq!(configs.len(), 1);
        assert_eq!(malformed, 1);
    }

    #[test]
    fn base64_subscription_with_duplicates_loads_one_config() {
        let body = STANDARD.encode("vless://a@h:443#x\nvless://a@h:443#x\n");
        let decoded = decode_subscription_body(&body);
        let (configs, _) = parse_uri_lines(&decoded);
        assert_eq!(configs.len(), 1);
    }

    #[test]
    fn plain_subscription_body_passes_through() {
        let body = "vless://a@h:443#x\n";
        assert_eq!(decode_subscription_body(body), body);
        // random base64 that does not decode to a scheme stays as-is
        let noise = STANDARD.encode("hello there, world");
        assert_eq!(decode_subscription_body(&noise), noise);
    }

    #[test]
    fn urlsafe_unpadded_subscription_decodes() {
        use base64::engine::general_purpose::URL_SAFE_NO_PAD;
        let body = URL_SAFE_NO_PAD.encode("vmess://not-checked-here\n");
        assert!(decode_subscription_body(&body).starts_with("vmess://"));
    }

    #[test]
    fn domain_json_yields_preresolved_seeds() {
        let text = r#"{"data":[{"domain":"a.example","ipv4":"104.16.0.5"},{"domain":"b.example","ipv4":""}]}"#;
        let records = parse_domain_json(text).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].ipv4, "104.16.0.5");
    }

    #[test]
    fn address_lists_accept_json_and_lines() {
        assert_eq!(
            parse_address_list(r#"["1.1.1.1","8.8.8.8"]"#),
            vec!["1.1.1.1", "8.8.8.8"]
        );
        assert_eq!(
            parse_address_list(r#"{"addresses":["x.example"]}"#),
            vec!["x.example"]
        );
        assert_eq!(
            parse_address_list(r#"{"data":[{"domain":"d.example","ipv4":"1.2.3.4"}]}"#),
            vec!["d.example"]
        );
        assert_eq!(
            parse_address_list("# c\n1.0.0.1\n\n1.1.1.1:8443\n"),
            vec!["1.0.0.1", "1.1.1.1:8443"]
        );
    }

    #[test]
    fn template_generation_substitutes_each_address() {
        let template = "vless://u@X:443?type=ws&security=tls&sni=s.io#t";
        let addrs = vec!["1.1.1.1".to_string(), "1.0.0.1:8443".to_string()];
        let loaded = generate_from_template(template, &addrs).unwrap();
        assert_eq!(loaded.seeds.len(), 2);
        let c0 = loaded.seeds[0].config.as_ref().unwrap();
        let c1 = loaded.seeds[1].config.as_ref().unwrap();
        assert_eq!(c0.host, "1.1.1.1");
        assert_eq!(c0.port, 443);
        assert_eq!(c1.host, "1.0.0.1");
        assert_eq!(c1.port, 8443);
        assert_eq!(c0.sni, "s.io");
        assert_eq!(c1.sni, "s.io");
        assert!(c0.remark.starts_with("cfg-1-"));
    }

    #[test]
    fn addr_port_split_handles_plain_and_bracketed() {
        assert_eq!(split_addr_port("1.1.1.1:8443"), ("1.1.1.1", Some(8443)));
        assert_eq!(split_addr_port("1.1.1.1"), ("1.1.1.1", None));
        assert_eq!(split_addr_port("d.example"), ("d.example", None));
        assert_eq!(split_addr_port("[::1]"), ("[::1]", None));
    }
}
