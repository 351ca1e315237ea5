use std::collections::HashSet;

use parking_lot::Mutex;
use rand::Rng;
use tracing::{debug, info};

use super::{is_safe_to_use, remap_address, validate_cidr, Address, NetError, Subnet};

/// Pools refuse subnets larger than a /16
pub const MIN_POOL_PREFIX_LEN: u8 = 16;

/// An external subnet paired with the internal subnet it maps onto
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolEntry {
    /// Consumer-visible block
    pub external: Subnet,
    /// Block routed inside the cluster
    pub internal: Subnet,
}

/// Pool usage summary
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolStatus {
    /// Total number of external addresses across all entries
    pub capacity: u64,
    /// Number of addresses currently allocated
    pub used: u64,
}

/// An address handed out by [`IpPool::allocate`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Allocation {
    /// Address consumers connect to
    pub external: Address,
    /// Same offset within the internal block
    pub internal: Address,
}

#[derive(Default)]
struct PoolInner {
    entries: Vec<PoolEntry>,
    in_use: HashSet<Address>,
}

/// Pool of external addresses that can be bound to jobs
///
/// Thread-safe via an internal mutex; no lock is held across an await point.
#[derive(Default)]
pub struct IpPool {
    inner: Mutex<PoolInner>,
}

impl IpPool {
    /// Create an empty pool
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a pool from `(external, internal)` CIDR pairs
    pub fn from_pairs<'a>(
        pairs: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Result<Self, NetError> {
        let pool = Self::new();
        for (external, internal) in pairs {
            pool.add_entry(external, internal)?;
        }
        Ok(pool)
    }

    /// Register a new external/internal subnet pair
    pub fn add_entry(&self, external_cidr: &str, internal_cidr: &str) -> Result<PoolEntry, NetError> {
        let external = validate_cidr(external_cidr)?;
        let internal = validate_cidr(internal_cidr)?;

        for subnet in [&external, &internal] {
            if subnet.prefix_len() < MIN_POOL_PREFIX_LEN {
                return Err(NetError::SubnetTooLarge {
                    subnet: subnet.to_string(),
                    min_prefix: MIN_POOL_PREFIX_LEN,
                });
            }
        }

        if external.size() != internal.size() {
            return Err(NetError::SizeMismatch {
                source_subnet: external.to_string(),
                dest_subnet: internal.to_string(),
            });
        }

        let mut inner = self.inner.lock();
        if let Some(existing) = inner.entries.iter().find(|e| e.external.overlaps(&external)) {
            return Err(NetError::Overlap {
                subnet: external.to_string(),
                existing: existing.external.to_string(),
            });
        }

        let entry = PoolEntry { external, internal };
        inner.entries.push(entry);
        info!(external = %external, internal = %internal, "Added subnet to IP pool");
        Ok(entry)
    }

    /// Remove the entry whose external subnet is `external_cidr`
    ///
    /// Addresses already allocated from it stay allocated until released.
    pub fn remove_by_external(&self, external_cidr: &str) -> Result<bool, NetError> {
        let external = validate_cidr(external_cidr)?;
        let mut inner = self.inner.lock();
        let before = inner.entries.len();
        inner.entries.retain(|e| e.external != external);
        Ok(inner.entries.len() != before)
    }

    /// Snapshot of all entries
    pub fn entries(&self) -> Vec<PoolEntry> {
        self.inner.lock().entries.clone()
    }

    /// Capacity and usage of the pool
    pub fn status(&self) -> PoolStatus {
        let inner = self.inner.lock();
        PoolStatus {
            capacity: inner.entries.iter().map(|e| e.external.size()).sum(),
            used: inner.in_use.len() as u64,
        }
    }

    /// Hand out a free external address that is safe to bind to a job
    pub fn allocate(&self) -> Result<Allocation, NetError> {
        let mut inner = self.inner.lock();
        let total: u64 = inner.entries.iter().map(|e| e.external.size()).sum();
        if total == 0 {
            return Err(NetError::Exhausted);
        }

        let start = rand::thread_rng().gen_range(0..total);
        for step in 0..total {
            let Some((entry, external)) = locate(&inner.entries, (start + step) % total) else {
                continue;
            };
            if !is_safe_to_use(external) || inner.in_use.contains(&external) {
                continue;
            }

            let internal = remap_address(external, &entry.external, &entry.internal)?;
            inner.in_use.insert(external);
            debug!(external = %external, internal = %internal, "Allocated address from pool");
            return Ok(Allocation { external, internal });
        }

        Err(NetError::Exhausted)
    }

    /// Return an address to the pool. Returns false if it was not allocated.
    pub fn release(&self, external: Address) -> bool {
        self.inner.lock().in_use.remove(&external)
    }

    /// Whether an address is currently allocated
    pub fn is_allocated(&self, external: Address) -> bool {
        self.inner.lock().in_use.contains(&external)
    }

    /// Map an external address to its internal counterpart
    pub fn to_internal(&self, external: Address) -> Option<Address> {
        let inner = self.inner.lock();
        let entry = inner.entries.iter().find(|e| e.external.contains(external))?;
        remap_address(external, &entry.external, &entry.internal).ok()
    }

    /// Map an internal address to its external counterpart
    pub fn to_external(&self, internal: Address) -> Option<Address> {
        let inner = self.inner.lock();
        let entry = inner.entries.iter().find(|e| e.internal.contains(internal))?;
        remap_address(internal, &entry.internal, &entry.external).ok()
    }
}

/// Resolve a flat index over all entries to an entry and its external address
fn locate(entries: &[PoolEntry], mut index: u64) -> Option<(PoolEntry, Address)> {
    for entry in entries {
        let size = entry.external.size();
        if index < size {
            return Some((*entry, entry.external.nth(index)?));
        }
        index -= size;
    }
    None
}
