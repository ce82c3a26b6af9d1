use ipnet::Ipv4Net;
use mqtt_recon::netdetect::{expand_ipv4_hosts, ipv4_to_default_cidr};
use mqtt_recon::{ScanError, ScanTarget};
use std::net::Ipv4Addr;

#[test]
fn default_cidr_is_24() {
    let cidr = ipv4_to_default_cidr(Ipv4Addr::new(192, 168, 42, 99));
    assert_eq!(cidr.to_string(), "192.168.42.0/24");
}

#[test]
fn slash_24_expands_to_254_hosts() {
    let target: ScanTarget = "10.0.0.0/24".parse().unwrap();
    let hosts = target.expand().unwrap();

    assert_eq!(hosts.len(), 254);
    assert_eq!(hosts.first().map(String::as_str), Some("10.0.0.1"));
    assert_eq!(hosts.last().map(String::as_str), Some("10.0.0.254"));
    assert!(!hosts.iter().any(|h| h == "10.0.0.0" || h == "10.0.0.255"));
}

#[test]
fn host_bits_in_network_are_ignored() {
    let target: ScanTarget = "10.0.0.77/24".parse().unwrap();
    assert_eq!(target.to_string(), "10.0.0.0/24");
}

#[test]
fn expand_excludes_network_and_broadcast() {
    let net = Ipv4Net::new(Ipv4Addr::new(10, 0, 0, 0), 30).unwrap();
    assert_eq!(
        expand_ipv4_hosts(net).unwrap(),
        vec![Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2)]
    );
}

#[test]
fn wide_networks_and_garbage_are_rejected() {
    assert!(matches!(
        "10.0.0.0/16".parse::<ScanTarget>(),
        Err(ScanError::UnsupportedPrefix(16))
    ));
    assert!(matches!(
        "bad host!".parse::<ScanTarget>(),
        Err(ScanError::InvalidTarget(_))
    ));
}

#[test]
fn single_hosts_pass_through() {
    let t: ScanTarget = "Broker.Lab".parse().unwrap();
    assert_eq!(t.expand().unwrap(), vec!["broker.lab".to_string()]);
    let t: ScanTarget = "192.168.1.20".parse().unwrap();
    assert_eq!(t.expand().unwrap(), vec!["192.168.1.20".to_string()]);
}
