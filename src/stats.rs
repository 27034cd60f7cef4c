//! Process-wide counters. Every public entry holds the single dispatcher
//! mutex for its whole duration (see `crate::dispatch`), so these counters
//! are updated under that lock and need no atomics of their own -- matching
//! the concurrency model's "sequential consistency over all public
//! operations" guarantee.

#[derive(Clone, Copy, Default, Debug)]
pub struct StatCount {
    pub allocated: u64,
    pub freed: u64,
    pub current: i64,
    pub peak: i64,
}

impl StatCount {
    pub fn increase(&mut self, amount: usize) {
        self.allocated += amount as u64;
        self.current += amount as i64;
        if self.current > self.peak {
            self.peak = self.current;
        }
    }

    pub fn decrease(&mut self, amount: usize) {
        self.freed += amount as u64;
        self.current -= amount as i64;
    }
}

/// A snapshot of the allocator's process-wide counters, returned by
/// `crate::dispatch::stats_snapshot`. Not part of the compatibility surface --
/// purely diagnostic.
#[derive(Clone, Copy, Default, Debug)]
pub struct Stats {
    /// Bytes reserved from the OS across every live pool.
    pub reserved: StatCount,
    /// Pool counts, by tier.
    pub small_pools: StatCount,
    pub general_pools: StatCount,
    pub direct_pools: StatCount,
    /// Allocation/free call counts, by tier.
    pub small_allocs: StatCount,
    pub general_allocs: StatCount,
    pub direct_allocs: StatCount,
    /// Failed allocations (kernel exhaustion or pool cap reached).
    pub alloc_failures: u64,
    /// Free calls abandoned due to a stray pointer, double-free, unaligned
    /// pointer, or corrupted header.
    pub rejected_frees: u64,
    /// Canary mismatches detected on free. The free still proceeds.
    pub corruption_events: u64,
    /// First-fit searches performed by the general tier.
    pub general_searches: u64,
    /// General-tier blocks split to satisfy a smaller request than their capacity.
    pub splits: u64,
    /// General-tier adjacent free blocks merged into one.
    pub coalesces: u64,
}
