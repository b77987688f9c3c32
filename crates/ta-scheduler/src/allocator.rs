// allocator.rs — Bounded-capacity pools that gate subgoal dispatch.
//
// Pools are named: `subgoals` is the global concurrency pool and
// `capability:<name>` pools limit subgoals that require a capability.
// A resource with no registered pool is unconstrained.
//
// Acquisition never blocks. When a pool is full the caller defers the
// dispatch to a later tick; that is not a failure.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// Name of the global concurrent-subgoals pool.
pub const GLOBAL_POOL: &str = "subgoals";

/// Pool name for a required capability.
pub fn capability_pool(capability: &str) -> String {
    format!("capability:{}", capability)
}

/// Capacity and current allocation of one pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolUsage {
    pub capacity: usize,
    pub in_use: usize,
}

impl PoolUsage {
    pub fn available(&self) -> usize {
        self.capacity.saturating_sub(self.in_use)
    }
}

#[derive(Debug, Default)]
pub struct ResourceAllocator {
    pools: Mutex<BTreeMap<String, PoolUsage>>,
}

impl ResourceAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`set_capacity`](Self::set_capacity).
    pub fn with_pool(self, resource: impl Into<String>, capacity: usize) -> Self {
        self.set_capacity(&resource.into(), capacity);
        self
    }

    /// Register a pool or change its capacity.
    ///
    /// In-flight allocations are untouched. Lowering a capacity below the
    /// current allocation only prevents new acquisitions until enough
    /// leases are released.
    pub fn set_capacity(&self, resource: &str, capacity: usize) {
        let mut pools = self.pools();
        let pool = pools.entry(resource.to_string()).or_insert(PoolUsage {
            capacity,
            in_use: 0,
        });
        if pool.capacity != capacity {
            tracing::info!(
                resource,
                from = pool.capacity,
                to = capacity,
                in_use = pool.in_use,
                "pool capacity changed"
            );
        }
        pool.capacity = capacity;
    }

    /// Take `amount` units from one pool if they are available.
    pub fn try_acquire(&self, resource: &str, amount: usize) -> bool {
        let mut pools = self.pools();
        match pools.get_mut(resource) {
            None => true,
            Some(pool) if pool.available() >= amount => {
                pool.in_use += amount;
                true
            }
            Some(_) => false,
        }
    }

    /// Return `amount` units to a pool.
    pub fn release(&self, resource: &str, amount: usize) {
        let mut pools = self.pools();
        Self::release_locked(&mut pools, resource, amount);
    }

    /// Acquire every request or none of them.
    ///
    /// The returned [`Lease`] releases its allocation when dropped, so every
    /// exit path of the holder gives the capacity back.
    pub fn try_lease(self: &Arc<Self>, requests: &[(String, usize)]) -> Option<Lease> {
        let mut wanted: BTreeMap<&str, usize> = BTreeMap::new();
        for (resource, amount) in requests {
            *wanted.entry(resource.as_str()).or_default() += amount;
        }

        let mut pools = self.pools();
        let fits = wanted.iter().all(|(resource, amount)| {
            pools
                .get(*resource)
                .map_or(true, |pool| pool.available() >= *amount)
        });
        if !fits {
            return None;
        }

        let mut held = Vec::with_capacity(wanted.len());
        for (resource, amount) in wanted {
            if let Some(pool) = pools.get_mut(resource) {
                pool.in_use += amount;
                held.push((resource.to_string(), amount));
            }
        }
        drop(pools);

        Some(Lease {
            allocator: Arc::clone(self),
            held,
        })
    }

    pub fn usage(&self, resource: &str) -> Option<PoolUsage> {
        self.pools().get(resource).copied()
    }

    /// Capacity and allocation of every registered pool.
    pub fn snapshot(&self) -> BTreeMap<String, PoolUsage> {
        self.pools().clone()
    }

    fn release_locked(pools: &mut BTreeMap<String, PoolUsage>, resource: &str, amount: usize) {
        let Some(pool) = pools.get_mut(resource) else {
            return;
        };
        if amount > pool.in_use {
            tracing::warn!(
                resource,
                amount,
                in_use = pool.in_use,
                "release exceeds allocation; clamping to zero"
            );
        }
        pool.in_use = pool.in_use.saturating_sub(amount);
    }

    fn pools(&self) -> MutexGuard<'_, BTreeMap<String, PoolUsage>> {
        self.pools.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Capacity held by one dispatched execution.
#[derive(Debug)]
pub struct Lease {
    allocator: Arc<ResourceAllocator>,
    held: Vec<(String, usize)>,
}

impl Lease {
    /// Pools and amounts held (unconstrained resources are omitted).
    pub fn held(&self) -> &[(String, usize)] {
        &self.held
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        let mut pools = self.allocator.pools();
        for (resource, amount) in self.held.drain(..) {
            ResourceAllocator::release_locked(&mut pools, &resource, amount);
        }
    }
}
