//! In-memory stand-ins for the kernel map and DNS

use crate::{allow::AllowList, resolver::Resolver, types::addr_to_key};
use aya::maps::MapError;
use kntrl_common::ALLOW_PRESENT;
use std::{
    collections::{BTreeMap, HashMap},
    net::Ipv4Addr,
    sync::Mutex,
};

/// Allow list backed by a `BTreeMap`, keyed like the kernel map
#[derive(Default)]
pub struct MemoryAllowList {
    entries: BTreeMap<u32, u32>,
    fail: bool,
}

impl MemoryAllowList {
    /// A list whose every write fails
    pub fn failing() -> Self {
        Self {
            entries: BTreeMap::new(),
            fail: true,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl AllowList for MemoryAllowList {
    fn put(&mut self, addr: Ipv4Addr) -> Result<(), MapError> {
        if self.fail {
            return Err(MapError::OutOfBounds {
                index: addr_to_key(addr),
                max_entries: 0,
            });
        }
        self.entries.insert(addr_to_key(addr), ALLOW_PRESENT);
        Ok(())
    }

    fn lookup(&self, addr: Ipv4Addr) -> Result<Option<u32>, MapError> {
        Ok(self.entries.get(&addr_to_key(addr)).copied())
    }
}

/// Resolver answering from fixed tables, recording forward lookups
#[derive(Default)]
pub struct StaticResolver {
    hosts: HashMap<String, Vec<Ipv4Addr>>,
    names: HashMap<Ipv4Addr, Vec<String>>,
    queries: Mutex<Vec<String>>,
}

impl StaticResolver {
    pub fn with_host(mut self, host: &str, addrs: &[Ipv4Addr]) -> Self {
        self.hosts.insert(host.to_string(), addrs.to_vec());
        self
    }

    pub fn with_reverse(mut self, addr: Ipv4Addr, name: &str) -> Self {
        self.names.entry(addr).or_default().push(name.to_string());
        self
    }

    /// Hosts passed to `resolve_host`, in call order
    pub fn queried(&self) -> Vec<String> {
        self.queries.lock().map(|q| q.clone()).unwrap_or_default()
    }
}

impl Resolver for StaticResolver {
    async fn resolve_host(&self, host: &str) -> Vec<Ipv4Addr> {
        if let Ok(mut queries) = self.queries.lock() {
            queries.push(host.to_string());
        }
        self.hosts.get(host).cloned().unwrap_or_default()
    }

    async fn reverse(&self, addr: Ipv4Addr) -> Vec<String> {
        self.names.get(&addr).cloned().unwrap_or_default()
    }
}
