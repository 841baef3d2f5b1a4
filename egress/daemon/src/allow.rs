//! Allow-list management
//!
//! The allow map is shared with the kernel program, which consults it in
//! trace mode. Userspace only ever adds entries; a run never shrinks it.

use crate::{
    error::EngineError,
    types::{addr_to_key, key_to_addr},
};
use aya::maps::{HashMap, Map, MapData, MapError};
use kntrl_common::{ALLOW_PRESENT, MAP_ALLOW};
use log::{debug, error, info};
use std::{collections::HashSet, net::Ipv4Addr};

/// Capability boundary over the shared allow map
///
/// A single `put` is atomic per key; nothing here assumes more than that.
pub trait AllowList {
    /// Mark `addr` as permitted. Putting an existing address is not an error.
    fn put(&mut self, addr: Ipv4Addr) -> Result<(), MapError>;

    /// Presence marker for `addr`, if any
    fn lookup(&self, addr: Ipv4Addr) -> Result<Option<u32>, MapError>;
}

/// The kernel allow map
pub struct AllowMap {
    inner: HashMap<MapData, u32, u32>,
}

impl AllowMap {
    pub fn new(map: Map) -> Result<Self, EngineError> {
        let inner = HashMap::try_from(map).map_err(|source| EngineError::Map {
            map: MAP_ALLOW,
            source,
        })?;
        Ok(Self { inner })
    }

    /// Every address currently in the map
    pub fn addresses(&self) -> Vec<Ipv4Addr> {
        self.inner.keys().filter_map(Result::ok).map(key_to_addr).collect()
    }
}

impl AllowList for AllowMap {
    fn put(&mut self, addr: Ipv4Addr) -> Result<(), MapError> {
        self.inner.insert(addr_to_key(addr), ALLOW_PRESENT, 0)
    }

    fn lookup(&self, addr: Ipv4Addr) -> Result<Option<u32>, MapError> {
        match self.inner.get(&addr_to_key(addr), 0) {
            Ok(value) => Ok(Some(value)),
            Err(MapError::KeyNotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Seeds the allow list and widens it from observed traffic
pub struct AllowManager<A> {
    list: A,
    suffixes: Vec<String>,
    extended: HashSet<Ipv4Addr>,
}

impl<A: AllowList> AllowManager<A> {
    pub fn new(list: A, suffixes: Vec<String>) -> Self {
        Self {
            list,
            suffixes,
            extended: HashSet::new(),
        }
    }

    /// Write every seed address; a failed write is fatal
    pub fn seed<I>(&mut self, addrs: I) -> Result<usize, EngineError>
    where
        I: IntoIterator<Item = Ipv4Addr>,
    {
        let mut count = 0;
        for addr in addrs {
            self.list.put(addr).map_err(|source| EngineError::Map {
                map: MAP_ALLOW,
                source,
            })?;
            debug!("allow-list seeded with {}", addr);
            count += 1;
        }
        info!("allow-list seeded with {} address(es)", count);
        Ok(count)
    }

    /// First name containing one of the allow suffixes
    pub fn matching_name<'n>(&self, names: &'n [String]) -> Option<&'n str> {
        names
            .iter()
            .find(|name| self.suffixes.iter().any(|suffix| name.contains(suffix.as_str())))
            .map(String::as_str)
    }

    /// Widen the allow list if any of `names` matches an allow suffix
    ///
    /// Returns whether `addr` matched. Write failures are logged, never
    /// propagated.
    pub fn observe(&mut self, addr: Ipv4Addr, names: &[String]) -> bool {
        let Some(name) = self.matching_name(names) else {
            return false;
        };

        if let Err(e) = self.list.put(addr) {
            error!("failed to update allow list (map) with {}: {}", addr, e);
            return false;
        }

        if self.extended.insert(addr) {
            info!("allow-list extended: {} ({})", addr, name);
        }
        true
    }

    /// Addresses added from observed traffic during this run
    pub fn extended(&self) -> usize {
        self.extended.len()
    }

    pub fn list(&self) -> &A {
        &self.list
    }
}
