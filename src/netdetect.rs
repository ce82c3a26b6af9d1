use crate::error::{EngineResult, ScanError};
use if_addrs::{get_if_addrs, IfAddr};
use ipnet::Ipv4Net;
use std::collections::HashSet;
use std::net::Ipv4Addr;
use tracing::debug;

/// Widest network the scanner will expand. Anything broader is refused.
pub const MAX_PREFIX_WIDTH: u8 = 24;

/// Detect local non-loopback IPv4 addresses and convert each to its /24 network.
///
/// For example, an interface IP `192.168.1.42` becomes `192.168.1.0/24`.
/// Duplicates are removed and the result is sorted.
pub fn detect_local_cidrs() -> EngineResult<Vec<Ipv4Net>> {
    let mut set = HashSet::<Ipv4Net>::new();
    for iface in get_if_addrs()? {
        if let IfAddr::V4(v4) = iface.addr {
            let ip = v4.ip;
            if ip.is_loopback() || ip.is_link_local() {
                continue;
            }
            debug!(interface = %iface.name, %ip, "found local IPv4 interface");
            set.insert(ipv4_to_default_cidr(ip));
        }
    }
    let mut cidrs: Vec<Ipv4Net> = set.into_iter().collect();
    cidrs.sort_by_key(|n| (u32::from(n.network()), n.prefix_len()));
    Ok(cidrs)
}

/// Convert an IPv4 address into its enclosing /24 network.
pub fn ipv4_to_default_cidr(ip: Ipv4Addr) -> Ipv4Net {
    let o = ip.octets();
    let net = Ipv4Addr::new(o[0], o[1], o[2], 0);
    Ipv4Net::new(net, MAX_PREFIX_WIDTH).unwrap_or_else(|_| Ipv4Net::from(net))
}

/// Expand an IPv4 network into the host addresses worth scanning.
///
/// Network and broadcast addresses are skipped for /24 through /30. A /31
/// yields both addresses and a /32 its single address. Networks wider than
/// /24 are refused to keep a single scan bounded.
pub fn expand_ipv4_hosts(net: Ipv4Net) -> EngineResult<Vec<Ipv4Addr>> {
    let prefix = net.prefix_len();
    if prefix < MAX_PREFIX_WIDTH {
        return Err(ScanError::UnsupportedPrefix(prefix));
    }
    let start = u32::from(net.network());
    let end = u32::from(net.broadcast());
    let hosts = match prefix {
        32 => vec![net.network()],
        31 => vec![Ipv4Addr::from(start), Ipv4Addr::from(end)],
        _ => (start + 1..end).map(Ipv4Addr::from).collect(),
    };
    Ok(hosts)
}
