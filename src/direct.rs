//! The direct tier: one dedicated pool per allocation, released immediately
//! on free. No free list, no coalescing -- each pool holds exactly one block
//! spanning the remainder of the pool.

use core::ptr::NonNull;
use log::warn;

use crate::os;
use crate::registry::Registry;
use crate::stats::Stats;
use crate::types::{
    DirectBlock, PoolHeader, Tier, DIRECT_BLOCK_HEADER_SIZE, MAGIC_LIVE, MAX_ALIGN,
    POOL_HEADER_SIZE, SHRINK_FRACTION_DEN, SHRINK_FRACTION_NUM,
};

/// Allocate a dedicated pool for exactly `request` bytes.
pub fn allocate(registry: &mut Registry, stats: &mut Stats, request: usize) -> Option<NonNull<u8>> {
    let pool_size = os::align_up_pages(POOL_HEADER_SIZE + DIRECT_BLOCK_HEADER_SIZE + request);
    let pages = match os::alloc_pages(pool_size) {
        Some(p) => p,
        None => {
            stats.alloc_failures += 1;
            return None;
        }
    };
    unsafe {
        let pool = pages.as_ptr() as *mut PoolHeader;
        core::ptr::write(
            pool,
            PoolHeader {
                base: pages.as_ptr(),
                size: pool_size,
                tier: Tier::Direct,
                next: core::ptr::null_mut(),
                tier_head: core::ptr::null_mut(),
                class_next: core::ptr::null_mut(),
            },
        );
        let block = pages.as_ptr().add(POOL_HEADER_SIZE) as *mut DirectBlock;
        core::ptr::write(
            block,
            DirectBlock {
                user_size: request,
                magic: MAGIC_LIVE,
            },
        );
        registry.register(pool);
        stats.direct_pools.increase(1);
        stats.direct_allocs.increase(request);
        stats.reserved.increase(pool_size);
        NonNull::new((*block).payload())
    }
}

unsafe fn block_from_ptr(ptr: *mut u8) -> *mut DirectBlock {
    ptr.sub(DIRECT_BLOCK_HEADER_SIZE) as *mut DirectBlock
}

/// Free `ptr`'s dedicated pool. `pool` must be the pool the registry resolved for `ptr`.
pub fn free(registry: &mut Registry, stats: &mut Stats, pool: *mut PoolHeader, ptr: *mut u8) -> bool {
    unsafe {
        if (ptr as usize) % MAX_ALIGN != 0 {
            warn!("direct tier: unaligned pointer {:p} on free", ptr);
            stats.rejected_frees += 1;
            return false;
        }
        let block = block_from_ptr(ptr);
        if (*block).magic != MAGIC_LIVE {
            warn!("direct tier: corrupted or already-freed pointer at {:p}", ptr);
            stats.rejected_frees += 1;
            return false;
        }
        stats.direct_allocs.decrease((*block).user_size);
        stats.direct_pools.decrease(1);
        stats.reserved.decrease((*pool).size);
        let size = (*pool).size;
        let base = (*pool).base;
        registry.unregister(pool);
        os::free_pages(NonNull::new_unchecked(base), size);
        true
    }
}

pub fn user_size(ptr: *mut u8) -> usize {
    unsafe { (*block_from_ptr(ptr)).user_size }
}

/// Record a new logical size for a direct block kept in place by a shrink
/// within `SHRINK_FRACTION` -- so a later reallocation's copy length reflects
/// what the caller actually asked for, not the original request.
pub fn set_user_size(ptr: *mut u8, new_size: usize) {
    unsafe { (*block_from_ptr(ptr)).user_size = new_size };
}

/// Whether a direct block should be reallocated rather than kept in place.
/// Pure growth always reallocates; pure shrink below `SHRINK_FRACTION` also
/// reallocates; a shrink within the ratio keeps the existing pointer.
pub fn should_migrate(current_capacity: usize, new_size: usize) -> bool {
    if new_size > current_capacity {
        return true;
    }
    new_size * SHRINK_FRACTION_DEN < current_capacity * SHRINK_FRACTION_NUM
}

/// The capacity available in a direct pool's single block (its usable region,
/// which may exceed the recorded user size by rounding to page granularity).
pub fn capacity_of(pool: *mut PoolHeader) -> usize {
    unsafe { (*pool).size - POOL_HEADER_SIZE - DIRECT_BLOCK_HEADER_SIZE }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_then_free_releases_pages() {
        let mut registry = Registry::new();
        let mut stats = Stats::default();
        let p = allocate(&mut registry, &mut stats, 10_000_000).unwrap();
        let pool = registry.resolve(p.as_ptr()).unwrap();
        assert!(free(&mut registry, &mut stats, pool, p.as_ptr()));
        assert_eq!(stats.direct_pools.current, 0);
    }

    #[test]
    fn shrink_within_ratio_keeps_pointer_pure_shrink_below_reallocates() {
        assert!(!should_migrate(1000, 600));
        assert!(should_migrate(1000, 400));
        assert!(should_migrate(1000, 1500));
    }
}
