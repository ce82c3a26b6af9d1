use std::net::IpAddr;
use std::str::FromStr;

use ipnet::{IpNet, Ipv4Net};

use crate::error::{EngineResult, ScanError};
use crate::netdetect;

/// A host specification: one address or name, or an IPv4 network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanTarget {
    Host(String),
    Network(Ipv4Net),
}

impl ScanTarget {
    /// Expand into concrete hosts. A `/24` yields `.1` through `.254`.
    pub fn expand(&self) -> EngineResult<Vec<String>> {
        match self {
            ScanTarget::Host(h) => Ok(vec![h.clone()]),
            ScanTarget::Network(net) => Ok(netdetect::expand_ipv4_hosts(*net)?
                .into_iter()
                .map(|ip| ip.to_string())
                .collect()),
        }
    }
}

impl FromStr for ScanTarget {
    type Err = ScanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let t = s.trim();
        if t.is_empty() {
            return Err(ScanError::InvalidTarget("empty target".into()));
        }

        if t.contains('/') {
            return match t.parse::<IpNet>() {
                Ok(IpNet::V4(n4)) => {
                    if n4.prefix_len() < netdetect::MAX_PREFIX_WIDTH {
                        return Err(ScanError::UnsupportedPrefix(n4.prefix_len()));
                    }
                    Ok(ScanTarget::Network(n4.trunc()))
                }
                Ok(IpNet::V6(_)) => Err(ScanError::InvalidTarget(format!(
                    "{t}: IPv6 networks cannot be expanded, give a single address"
                ))),
                Err(e) => Err(ScanError::InvalidTarget(format!("{t}: {e}"))),
            };
        }

        if let Ok(ip) = t.parse::<IpAddr>() {
            return Ok(ScanTarget::Host(ip.to_string()));
        }

        if is_valid_hostname(t) {
            Ok(ScanTarget::Host(t.to_ascii_lowercase()))
        } else {
            Err(ScanError::InvalidTarget(format!(
                "{t}: not an IP address, CIDR network or host name"
            )))
        }
    }
}

impl std::fmt::Display for ScanTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScanTarget::Host(h) => f.write_str(h),
            ScanTarget::Network(n) => write!(f, "{n}"),
        }
    }
}

fn is_valid_hostname(s: &str) -> bool {
    s.len() <= 253
        && s.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        })
}
