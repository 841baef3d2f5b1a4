//! DNS resolution
//!
//! Forward lookups seed the allow-list from host names; reverse lookups
//! name the destinations seen at runtime. Neither ever fails the caller:
//! errors are logged and yield an empty answer.

use hickory_resolver::{
    config::{ResolverConfig, ResolverOpts},
    TokioAsyncResolver,
};
use log::{debug, warn};
use std::{
    future::Future,
    net::{IpAddr, Ipv4Addr},
};

/// Name recorded when a destination has no reverse mapping
pub const UNRESOLVED: &str = ".";

/// Forward and reverse IPv4 name resolution
pub trait Resolver: Send + Sync {
    /// IPv4 addresses for `host`, empty if it cannot be resolved
    fn resolve_host(&self, host: &str) -> impl Future<Output = Vec<Ipv4Addr>> + Send;

    /// Names for `addr`, empty if it has no reverse mapping
    fn reverse(&self, addr: Ipv4Addr) -> impl Future<Output = Vec<String>> + Send;
}

/// Resolver backed by the host's DNS configuration
pub struct SystemResolver {
    inner: TokioAsyncResolver,
}

impl SystemResolver {
    /// Build from /etc/resolv.conf, falling back to the library defaults
    pub fn from_system_conf() -> Self {
        let inner = match TokioAsyncResolver::tokio_from_system_conf() {
            Ok(resolver) => resolver,
            Err(e) => {
                warn!("system resolver configuration unavailable ({}), using defaults", e);
                TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
            }
        };
        Self { inner }
    }
}

impl Resolver for SystemResolver {
    async fn resolve_host(&self, host: &str) -> Vec<Ipv4Addr> {
        match self.inner.lookup_ip(host).await {
            Ok(lookup) => lookup
                .iter()
                .filter_map(|ip| match ip {
                    IpAddr::V4(v4) => Some(v4),
                    IpAddr::V6(_) => None,
                })
                .collect(),
            Err(e) => {
                warn!("failed to resolve host {}: {}", host, e);
                Vec::new()
            }
        }
    }

    async fn reverse(&self, addr: Ipv4Addr) -> Vec<String> {
        match self.inner.reverse_lookup(IpAddr::V4(addr)).await {
            Ok(lookup) => lookup.iter().map(|name| name.to_string()).collect(),
            Err(e) => {
                debug!("reverse lookup for {} failed: {}", addr, e);
                Vec::new()
            }
        }
    }
}

/// Reverse names for `addr`, or the [`UNRESOLVED`] sentinel
pub async fn names_or_sentinel<R: Resolver>(resolver: &R, addr: Ipv4Addr) -> Vec<String> {
    let names = resolver.reverse(addr).await;
    if names.is_empty() {
        vec![UNRESOLVED.to_string()]
    } else {
        names
    }
}
