//! Address pool management.
//!
//! The pool is a FIFO of (address, netmask) resources. Start-up loads it from
//! the configuration and then freezes it; from then on entries only leave the
//! pool through [`AddressPool::allocate`] and come back through
//! [`AddressPool::release`].
//!
//! The pool does not know about sessions. Keeping an address out of the pool
//! while a lease holds it, and never releasing the same entry twice, is the
//! job of the session state machine.

use std::collections::{HashSet, VecDeque};
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

/// One leasable resource: an address and the netmask handed out with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PoolEntry {
    pub address: Ipv4Addr,
    pub netmask: u32,
}

impl PoolEntry {
    pub fn new(address: Ipv4Addr, netmask: u32) -> Self {
        Self { address, netmask }
    }
}

impl std::fmt::Display for PoolEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.address, self.netmask)
    }
}

/// FIFO of free address resources.
#[derive(Debug, Default)]
pub struct AddressPool {
    /// Free entries; the front is offered next.
    free: VecDeque<PoolEntry>,
    /// Every resource added while loading, allocated or not.
    configured: HashSet<PoolEntry>,
    /// Number of resources added while loading, duplicates included.
    capacity: usize,
    frozen: bool,
}

impl AddressPool {
    /// Creates an empty pool in loading mode.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a frozen pool holding `entries` in the given order.
    pub fn from_entries<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = PoolEntry>,
    {
        let mut pool = Self::new();
        for entry in entries {
            pool.push_configured(entry);
        }
        pool.freeze();
        pool
    }

    /// Clears the pool and returns it to loading mode.
    pub fn initialize(&mut self) {
        self.free.clear();
        self.configured.clear();
        self.capacity = 0;
        self.frozen = false;
    }

    /// Appends a configured resource.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PoolFrozen`] once [`freeze`](Self::freeze) was called.
    pub fn add_resource(&mut self, entry: PoolEntry) -> Result<()> {
        if self.frozen {
            return Err(Error::PoolFrozen);
        }
        self.push_configured(entry);
        Ok(())
    }

    fn push_configured(&mut self, entry: PoolEntry) {
        self.free.push_back(entry);
        self.configured.insert(entry);
        self.capacity += 1;
    }

    /// Ends loading mode.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Takes the oldest free entry, or `None` when the pool is exhausted.
    pub fn allocate(&mut self) -> Option<PoolEntry> {
        let entry = self.free.pop_front();
        if let Some(entry) = entry {
            debug!("Allocated {} ({} left)", entry, self.free.len());
        }
        entry
    }

    /// Returns an entry to the back of the pool.
    pub fn release(&mut self, entry: PoolEntry) {
        self.free.push_back(entry);
        debug!("Released {} ({} free)", entry, self.free.len());
    }

    /// Returns true if `entry` is one of the configured resources.
    ///
    /// This looks at the configuration only; whether the entry is currently
    /// free or leased does not matter.
    pub fn validate(&self, entry: PoolEntry) -> bool {
        self.configured.contains(&entry)
    }

    /// Number of free entries.
    pub fn len(&self) -> usize {
        self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.free.is_empty()
    }

    /// Number of configured resources.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Free entries in allocation order.
    pub fn iter(&self) -> impl Iterator<Item = &PoolEntry> {
        self.free.iter()
    }
}
