//! Allow-list seed collection
//!
//! Turns the user-supplied host and IP lists, the configured nameservers
//! and the fixed infrastructure endpoints into one deduplicated set of
//! addresses.

use crate::{config::SeedConfig, resolver::Resolver};
use kntrl_common::{ALLOW_CLOUD_METADATA, ALLOW_LINK_LOCAL_METADATA, ALLOW_LOOPBACK};
use log::{debug, warn};
use std::{collections::BTreeSet, net::Ipv4Addr, path::Path};

/// Addresses that are always allowed
pub fn fixed_addresses() -> [Ipv4Addr; 3] {
    [
        Ipv4Addr::from(ALLOW_LOOPBACK),
        Ipv4Addr::from(ALLOW_LINK_LOCAL_METADATA),
        Ipv4Addr::from(ALLOW_CLOUD_METADATA),
    ]
}

/// Split a comma-separated host list, dropping empty items
pub fn parse_hosts(hosts: &str) -> Vec<String> {
    hosts
        .split(',')
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse a comma-separated IPv4 list, skipping invalid literals
pub fn parse_ips(ips: &str) -> Vec<Ipv4Addr> {
    ips.split(',')
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .filter_map(|ip| match ip.parse::<Ipv4Addr>() {
            Ok(addr) => Some(addr),
            Err(_) => {
                warn!("ignoring invalid IPv4 address in allow list: {}", ip);
                None
            }
        })
        .collect()
}

/// Nameservers declared in resolv.conf content
///
/// Returns `(hosts, ips)`: entries that are IPv4 literals and entries
/// that still need resolving. IPv6 nameservers are ignored.
pub fn parse_resolv_conf(content: &str) -> (Vec<String>, Vec<Ipv4Addr>) {
    let mut hosts = Vec::new();
    let mut ips = Vec::new();

    for line in content.lines() {
        let mut fields = line.split_whitespace();
        if fields.next() != Some("nameserver") {
            continue;
        }
        let Some(server) = fields.next() else {
            continue;
        };

        if let Ok(addr) = server.parse::<Ipv4Addr>() {
            ips.push(addr);
        } else if server.parse::<std::net::IpAddr>().is_err() {
            hosts.push(server.to_string());
        }
    }

    (hosts, ips)
}

fn read_nameservers(path: &Path) -> (Vec<String>, Vec<Ipv4Addr>) {
    match std::fs::read_to_string(path) {
        Ok(content) => parse_resolv_conf(&content),
        Err(e) => {
            debug!("no nameservers from {:?}: {}", path, e);
            (Vec::new(), Vec::new())
        }
    }
}

/// Collect the full, deduplicated seed set
///
/// Hosts that fail to resolve are skipped with a warning.
pub async fn collect<R: Resolver>(config: &SeedConfig, resolver: &R) -> BTreeSet<Ipv4Addr> {
    let (mut hosts, mut addrs) = match &config.resolv_conf {
        Some(path) => read_nameservers(path),
        None => (Vec::new(), Vec::new()),
    };

    if config.allowed_hosts.trim().is_empty() {
        debug!("no provided allowed hosts");
    }
    hosts.extend(parse_hosts(&config.allowed_hosts));
    addrs.extend(parse_ips(&config.allowed_ips));

    let mut seeds: BTreeSet<Ipv4Addr> = addrs.into_iter().collect();

    for host in &hosts {
        let resolved = resolver.resolve_host(host).await;
        if resolved.is_empty() {
            warn!("allowed host {} did not resolve to any IPv4 address", host);
        }
        for addr in resolved {
            debug!("allowed host {} -> {}", host, addr);
            seeds.insert(addr);
        }
    }

    seeds.extend(fixed_addresses());
    seeds
}
