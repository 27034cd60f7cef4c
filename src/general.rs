//! The general tier: a chain of variable-size pools, each holding an
//! intrusive doubly-linked boundary-tag block list over its address range,
//! searched first-fit and coalesced on free.

use core::ptr::NonNull;
use log::warn;

use crate::os;
use crate::registry::Registry;
use crate::stats::Stats;
use crate::types::{
    align_up, GeneralBlock, PoolHeader, Tier, GENERAL_BLOCK_HEADER_SIZE, MAGIC_FREED,
    MAGIC_LIVE, MAX_ALIGN, MAX_POOLS, MIN_BLOCK, POOL_HEADER_SIZE,
};

/// Capacity (payload + canary, alignment-padded) a block must have to serve `request`.
fn needed_capacity(request: usize) -> usize {
    align_up(request + core::mem::size_of::<u32>(), MAX_ALIGN)
}

unsafe fn block_of(pool: *mut PoolHeader) -> *mut GeneralBlock {
    (*pool).tier_head as *mut GeneralBlock
}

fn pool_is_general(pool: *mut PoolHeader) -> bool {
    unsafe { (*pool).tier == Tier::General }
}

fn general_pool_count(registry: &Registry) -> usize {
    registry.iter().filter(|p| pool_is_general(*p)).count()
}

fn largest_general_pool_size(registry: &Registry) -> usize {
    registry
        .iter()
        .filter(|p| pool_is_general(*p))
        .map(|p| unsafe { (*p).size })
        .max()
        .unwrap_or(0)
}

/// First-fit search across every general pool, in registry order.
unsafe fn find_fit(registry: &Registry, stats: &mut Stats, need: usize) -> Option<(*mut PoolHeader, *mut GeneralBlock)> {
    for pool in registry.iter().filter(|p| pool_is_general(*p)) {
        let mut block = block_of(pool);
        while !block.is_null() {
            stats.general_searches += 1;
            if (*block).free && (*block).size >= need {
                return Some((pool, block));
            }
            block = (*block).next;
        }
    }
    None
}

/// Carve a fresh pool sized to satisfy at least `need` bytes of payload,
/// register it, and return it with its one initial free block.
pub(crate) unsafe fn grow(registry: &mut Registry, stats: &mut Stats, need: usize) -> Option<*mut PoolHeader> {
    if general_pool_count(registry) >= MAX_POOLS {
        return None;
    }
    let min_required = POOL_HEADER_SIZE + GENERAL_BLOCK_HEADER_SIZE + need + GENERAL_BLOCK_HEADER_SIZE + MIN_BLOCK;
    let largest = largest_general_pool_size(registry);
    let target = core::cmp::max(2 * largest, min_required);
    let pool_size = os::align_up_pages(target);

    let pages = os::alloc_pages(pool_size)?;
    let pool = pages.as_ptr() as *mut PoolHeader;
    let usable = pool_size - POOL_HEADER_SIZE;
    let first_block = pages.as_ptr().add(POOL_HEADER_SIZE) as *mut GeneralBlock;
    core::ptr::write(
        pool,
        PoolHeader {
            base: pages.as_ptr(),
            size: pool_size,
            tier: Tier::General,
            next: core::ptr::null_mut(),
            tier_head: first_block as *mut u8,
            class_next: core::ptr::null_mut(),
        },
    );
    core::ptr::write(
        first_block,
        GeneralBlock {
            size: usable - GENERAL_BLOCK_HEADER_SIZE,
            user_size: 0,
            next: core::ptr::null_mut(),
            prev: core::ptr::null_mut(),
            magic: MAGIC_FREED,
            free: true,
        },
    );
    registry.register(pool);
    stats.general_pools.increase(1);
    stats.reserved.increase(pool_size);
    Some(pool)
}

/// Split `block` (capacity `block.size`) after its first `need` bytes if the
/// residue is worth keeping as its own free block.
unsafe fn maybe_split(block: *mut GeneralBlock, need: usize, stats: &mut Stats) {
    let capacity = (*block).size;
    if capacity < need + GENERAL_BLOCK_HEADER_SIZE + MIN_BLOCK {
        return;
    }
    stats.splits += 1;
    let residue = ((*block).payload() as usize + need) as *mut GeneralBlock;
    core::ptr::write(
        residue,
        GeneralBlock {
            size: capacity - need - GENERAL_BLOCK_HEADER_SIZE,
            user_size: 0,
            next: (*block).next,
            prev: block,
            magic: MAGIC_FREED,
            free: true,
        },
    );
    if !(*block).next.is_null() {
        (*(*block).next).prev = residue;
    }
    (*block).next = residue;
    (*block).size = need;
}

unsafe fn commit_allocation(block: *mut GeneralBlock, request: usize, stats: &mut Stats) -> *mut u8 {
    let need = needed_capacity(request);
    maybe_split(block, need, stats);
    (*block).user_size = request;
    (*block).magic = MAGIC_LIVE;
    (*block).free = false;
    (*block).write_canary();
    (*block).payload()
}

/// Allocate `request` bytes from the general tier, growing the tier with a
/// fresh pool if no existing pool has a large enough free block.
pub fn allocate(registry: &mut Registry, stats: &mut Stats, request: usize) -> Option<NonNull<u8>> {
    let need = needed_capacity(request);
    unsafe {
        if let Some((_, block)) = find_fit(registry, stats, need) {
            stats.general_allocs.increase(request);
            return NonNull::new(commit_allocation(block, request, stats));
        }
        let pool = grow(registry, stats, need);
        if pool.is_none() {
            stats.alloc_failures += 1;
            return None;
        }
        match find_fit(registry, stats, need) {
            Some((_, block)) => {
                stats.general_allocs.increase(request);
                NonNull::new(commit_allocation(block, request, stats))
            }
            None => {
                stats.alloc_failures += 1;
                None
            }
        }
    }
}

unsafe fn block_from_ptr(ptr: *mut u8) -> *mut GeneralBlock {
    ptr.sub(GENERAL_BLOCK_HEADER_SIZE) as *mut GeneralBlock
}

enum Validation {
    Ok(*mut GeneralBlock),
    Rejected,
}

unsafe fn validate(ptr: *mut u8) -> Validation {
    if (ptr as usize) % MAX_ALIGN != 0 {
        warn!("general tier: unaligned pointer {:p} on free/reallocate", ptr);
        return Validation::Rejected;
    }
    let block = block_from_ptr(ptr);
    match (*block).magic {
        MAGIC_FREED => {
            warn!("general tier: double-free detected at {:p}", ptr);
            Validation::Rejected
        }
        MAGIC_LIVE if (*block).size == 0 => {
            warn!("general tier: corrupted header (zero size) at {:p}", ptr);
            Validation::Rejected
        }
        MAGIC_LIVE => Validation::Ok(block),
        _ => {
            warn!("general tier: stray or corrupted pointer at {:p}", ptr);
            Validation::Rejected
        }
    }
}

unsafe fn coalesce(block: *mut GeneralBlock, stats: &mut Stats) {
    let next = (*block).next;
    if !next.is_null() && (*next).free {
        (*block).size += GENERAL_BLOCK_HEADER_SIZE + (*next).size;
        (*block).next = (*next).next;
        if !(*block).next.is_null() {
            (*(*block).next).prev = block;
        }
        stats.coalesces += 1;
    }
    let prev = (*block).prev;
    if !prev.is_null() && (*prev).free {
        (*prev).size += GENERAL_BLOCK_HEADER_SIZE + (*block).size;
        (*prev).next = (*block).next;
        if !(*prev).next.is_null() {
            (*(*prev).next).prev = prev;
        }
        stats.coalesces += 1;
    }
}

/// Free `ptr`, which the caller has already resolved into a general-tier pool.
/// Returns `false` if the free was rejected (logged, abandoned, no state changed).
pub fn free(stats: &mut Stats, ptr: *mut u8) -> bool {
    unsafe {
        let block = match validate(ptr) {
            Validation::Ok(b) => b,
            Validation::Rejected => {
                stats.rejected_frees += 1;
                return false;
            }
        };
        if !(*block).canary_ok() {
            warn!("general tier: canary violation at {:p}; block returned to circulation", ptr);
            stats.corruption_events += 1;
        }
        stats.general_allocs.decrease((*block).user_size);
        (*block).magic = MAGIC_FREED;
        (*block).free = true;
        coalesce(block, stats);
        true
    }
}

pub enum ReallocOutcome {
    /// The original pointer remains valid; its contents were preserved in place.
    SameBlock(*mut u8),
    /// The tier could not satisfy the request in place; caller must migrate.
    Migrate,
}

/// Apply the general-tier in-place reallocation strategy (shrink, or grow via
/// forward-coalescing); returns `Migrate` when neither applies so the
/// dispatcher can allocate-copy-free instead.
pub fn reallocate(stats: &mut Stats, ptr: *mut u8, new_size: usize) -> ReallocOutcome {
    let need = needed_capacity(new_size);
    unsafe {
        let block = block_from_ptr(ptr);
        if (*block).size >= need {
            maybe_split(block, need, stats);
            (*block).user_size = new_size;
            (*block).write_canary();
            return ReallocOutcome::SameBlock(ptr);
        }
        let next = (*block).next;
        if !next.is_null() && (*next).free && (*block).size + GENERAL_BLOCK_HEADER_SIZE + (*next).size >= need {
            (*block).size += GENERAL_BLOCK_HEADER_SIZE + (*next).size;
            (*block).next = (*next).next;
            if !(*block).next.is_null() {
                (*(*block).next).prev = block;
            }
            stats.coalesces += 1;
            maybe_split(block, need, stats);
            (*block).user_size = new_size;
            (*block).write_canary();
            return ReallocOutcome::SameBlock(ptr);
        }
        ReallocOutcome::Migrate
    }
}

/// The user-visible size currently recorded for a live general-tier block.
pub fn user_size(ptr: *mut u8) -> usize {
    unsafe { (*block_from_ptr(ptr)).user_size }
}
