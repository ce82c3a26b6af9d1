use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

pub const MQTT_PLAIN_PORT: u16 = 1883;
pub const MQTT_TLS_PORT: u16 = 8883;
const MQTT_TLS_ALT_PORT: u16 = 8884;

/// A broker port and whether the listener on it is expected to speak TLS.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BrokerPort {
    pub port: u16,
    pub tls: bool,
}

impl BrokerPort {
    pub const fn plain(port: u16) -> Self {
        Self { port, tls: false }
    }

    pub const fn tls(port: u16) -> Self {
        Self { port, tls: true }
    }

    /// Port with TLS inferred from the well-known MQTT assignments.
    pub fn well_known(port: u16) -> Self {
        Self {
            port,
            tls: matches!(port, MQTT_TLS_PORT | MQTT_TLS_ALT_PORT),
        }
    }

    pub fn label(&self) -> &'static str {
        match (self.port, self.tls) {
            (MQTT_PLAIN_PORT, false) => "MQTT (plain)",
            (MQTT_TLS_PORT, true) => "MQTT over TLS",
            (MQTT_TLS_ALT_PORT, true) => "MQTT over TLS (alt)",
            (_, true) => "non-standard MQTT over TLS",
            (_, false) => "non-standard MQTT (plain)",
        }
    }
}

/// One (host, port) pair to be probed and, if open, assessed.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct PortCandidate {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl PortCandidate {
    pub fn new(host: impl Into<String>, port: BrokerPort) -> Self {
        Self {
            host: host.into(),
            port: port.port,
            tls: port.tls,
        }
    }
}

impl std::fmt::Display for PortCandidate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// The fixed MQTT port set scanned by default: plaintext 1883, TLS 8883.
pub fn default_broker_ports() -> Vec<BrokerPort> {
    vec![BrokerPort::plain(MQTT_PLAIN_PORT), BrokerPort::tls(MQTT_TLS_PORT)]
}

/// Parse a broker port list into a deduplicated, ordered port set.
///
/// Entries are separated by commas, whitespace or newlines:
/// - single port number: `1883`
/// - inclusive range: `1883-1885`
/// - TLS override suffix: `9000/tls` or `8883/plain`
/// - comments: everything after `#` on a line is ignored
///
/// Without a suffix, TLS is inferred from the well-known assignments.
pub fn parse_broker_ports(s: &str) -> Result<Vec<BrokerPort>> {
    let mut out: Vec<BrokerPort> = Vec::new();
    let mut seen = std::collections::HashSet::new();

    for (idx, raw_line) in s.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw_line.split('#').next().map(str::trim).unwrap_or("");
        if line.is_empty() {
            continue;
        }

        for entry in line
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|e| !e.is_empty())
        {
            let (spec, tls_override) = match entry.split_once('/') {
                Some((spec, "tls")) => (spec, Some(true)),
                Some((spec, "plain")) => (spec, Some(false)),
                Some((_, other)) => {
                    bail!("line {line_no}: unknown transport suffix `/{other}` in `{entry}`")
                }
                None => (entry, None),
            };

            let (start, end) = match spec.split_once('-') {
                Some((a, b)) => {
                    let start = parse_port_str(a.trim())
                        .with_context(|| format!("line {line_no}: invalid start in range: {a}"))?;
                    let end = parse_port_str(b.trim())
                        .with_context(|| format!("line {line_no}: invalid end in range: {b}"))?;
                    if start > end {
                        bail!("line {line_no}: invalid range {start}-{end} (start > end)");
                    }
                    (start, end)
                }
                None => {
                    let p = parse_port_str(spec)
                        .with_context(|| format!("line {line_no}: invalid port value: {spec}"))?;
                    (p, p)
                }
            };

            for p in start..=end {
                if seen.insert(p) {
                    let port = match tls_override {
                        Some(tls) => BrokerPort { port: p, tls },
                        None => BrokerPort::well_known(p),
                    };
                    out.push(port);
                }
            }
        }
    }

    Ok(out)
}

/// Load a broker port list from a file path.
pub fn load_broker_ports_from_path(path: impl AsRef<Path>) -> Result<Vec<BrokerPort>> {
    let content = fs::read_to_string(path.as_ref())
        .with_context(|| format!("failed to read ports file: {}", path.as_ref().display()))?;
    parse_broker_ports(&content)
}

/// Interpret `arg` as a path if such a file exists, otherwise as an inline list.
/// An empty result falls back to the default port set.
pub fn resolve_broker_ports(arg: Option<&str>) -> Result<Vec<BrokerPort>> {
    let ports = match arg {
        None => return Ok(default_broker_ports()),
        Some(a) if Path::new(a).is_file() => load_broker_ports_from_path(a)?,
        Some(a) => parse_broker_ports(a)?,
    };
    if ports.is_empty() {
        Ok(default_broker_ports())
    } else {
        Ok(ports)
    }
}

fn parse_port_str(s: &str) -> Result<u16> {
    let val: u32 = s.parse::<u32>().map_err(|e| anyhow::anyhow!(e))?;
    if val == 0 || val > 65535 {
        bail!("port out of range: {val}");
    }
    Ok(val as u16)
}
