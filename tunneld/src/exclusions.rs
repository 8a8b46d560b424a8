//! Reference counting for excluded addresses
//!
//! Several hops may ask for the same address to bypass the tunnel (the entry
//! server of a multihop connection is excluded by both hops, for example).
//! The backend route must be installed when the first hop needs it and removed
//! when the last one lets go; this table tells the caller when those edges happen.

use crate::interface::IpPrefix;
use std::collections::HashMap;

/// Excluded address -> number of hops that currently require it
#[derive(Debug, Default)]
pub struct ExclusionTable {
    counts: HashMap<IpPrefix, usize>,
}

impl ExclusionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a reference. Returns true on the 0 -> 1 transition, i.e. when the
    /// caller must install the exclusion route.
    pub fn increment(&mut self, address: IpPrefix) -> bool {
        let count = self.counts.entry(address).or_insert(0);
        *count += 1;
        *count == 1
    }

    /// Drop a reference. Returns true on the 1 -> 0 transition, i.e. when the
    /// caller must delete the exclusion route.
    ///
    /// Unknown addresses are ignored: teardown may run after an activation
    /// that failed before it counted anything.
    pub fn decrement(&mut self, address: IpPrefix) -> bool {
        match self.counts.get_mut(&address) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => {
                self.counts.remove(&address);
                true
            }
            None => false,
        }
    }

    /// Current reference count (0 when absent)
    pub fn count(&self, address: &IpPrefix) -> usize {
        self.counts.get(address).copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    /// Empty the table, returning every address that was still excluded
    pub fn drain(&mut self) -> Vec<IpPrefix> {
        let mut addresses: Vec<IpPrefix> = self.counts.drain().map(|(addr, _)| addr).collect();
        addresses.sort();
        addresses
    }
}
