//! The small tier: fixed-size slots served out of slab-style pools, one
//! singly-linked free list per size class.

use core::ptr::NonNull;
use log::warn;

use crate::os;
use crate::registry::Registry;
use crate::stats::Stats;
use crate::types::{
    align_up, class_for_size, PoolHeader, SizeClass, SmallBlock, Tier, MAGIC_FREED, MAGIC_LIVE,
    MAX_ALIGN, NUM_SMALL_CLASSES, POOL_HEADER_SIZE, SLOTS_PER_POOL, SMALL_BLOCK_HEADER_SIZE,
};

fn slot_stride(slot_size: usize) -> usize {
    SMALL_BLOCK_HEADER_SIZE + align_up(slot_size, MAX_ALIGN)
}

/// Carve a fresh slab pool for `class`, threading every slot onto its free list.
unsafe fn create_slab_pool(
    class: &mut SizeClass,
    class_index: usize,
    registry: &mut Registry,
    stats: &mut Stats,
) -> Option<()> {
    let stride = slot_stride(class.slot_size);
    let needed = POOL_HEADER_SIZE + stride * SLOTS_PER_POOL;
    let pool_size = os::align_up_pages(needed);

    let pages = os::alloc_pages(pool_size)?;
    let pool = pages.as_ptr() as *mut PoolHeader;
    core::ptr::write(
        pool,
        PoolHeader {
            base: pages.as_ptr(),
            size: pool_size,
            tier: Tier::Small,
            next: core::ptr::null_mut(),
            tier_head: core::ptr::null_mut(),
            class_next: class.pools,
        },
    );
    class.pools = pool;
    registry.register(pool);
    stats.small_pools.increase(1);
    stats.reserved.increase(pool_size);

    let base = pages.as_ptr().add(POOL_HEADER_SIZE);
    let mut head = class.free_list;
    for i in (0..SLOTS_PER_POOL).rev() {
        let slot = base.add(i * stride) as *mut SmallBlock;
        core::ptr::write(
            slot,
            SmallBlock {
                magic: MAGIC_FREED,
                class_index: class_index as u8,
                free: true,
                next: head,
            },
        );
        head = slot;
    }
    class.free_list = head;
    Some(())
}

/// Allocate `request` bytes (`request <= SMALL_MAX`) from the small tier.
pub fn allocate(
    classes: &mut [SizeClass; NUM_SMALL_CLASSES],
    registry: &mut Registry,
    stats: &mut Stats,
    request: usize,
) -> Option<NonNull<u8>> {
    let idx = class_for_size(request)?;
    unsafe {
        if classes[idx].free_list.is_null() {
            create_slab_pool(&mut classes[idx], idx, registry, stats)?;
        }
        let block = classes[idx].free_list;
        classes[idx].free_list = (*block).next;
        (*block).magic = MAGIC_LIVE;
        (*block).free = false;
        stats.small_allocs.increase(classes[idx].slot_size);
        NonNull::new((*block).payload())
    }
}

unsafe fn block_from_ptr(ptr: *mut u8) -> *mut SmallBlock {
    ptr.sub(SMALL_BLOCK_HEADER_SIZE) as *mut SmallBlock
}

/// Free `ptr`, which the caller has already resolved into a small-tier pool.
pub fn free(classes: &mut [SizeClass; NUM_SMALL_CLASSES], stats: &mut Stats, ptr: *mut u8) -> bool {
    unsafe {
        if (ptr as usize) % MAX_ALIGN != 0 {
            warn!("small tier: unaligned pointer {:p} on free", ptr);
            stats.rejected_frees += 1;
            return false;
        }
        let block = block_from_ptr(ptr);
        if (*block).magic == MAGIC_FREED {
            warn!("small tier: double-free detected at {:p}", ptr);
            stats.rejected_frees += 1;
            return false;
        }
        if (*block).magic != MAGIC_LIVE {
            warn!("small tier: stray or corrupted pointer at {:p}", ptr);
            stats.rejected_frees += 1;
            return false;
        }
        let idx = (*block).class_index as usize;
        if idx >= NUM_SMALL_CLASSES {
            warn!("small tier: corrupted class index at {:p}", ptr);
            stats.rejected_frees += 1;
            return false;
        }
        stats.small_allocs.decrease(classes[idx].slot_size);
        (*block).magic = MAGIC_FREED;
        (*block).free = true;
        (*block).next = classes[idx].free_list;
        classes[idx].free_list = block;
        true
    }
}

/// The class index recorded in a live small-tier block's header.
pub fn class_index_of(ptr: *mut u8) -> usize {
    unsafe { (*block_from_ptr(ptr)).class_index as usize }
}

pub fn slot_size(classes: &[SizeClass; NUM_SMALL_CLASSES], class_index: usize) -> usize {
    classes[class_index].slot_size
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::make_size_classes;

    #[test]
    fn allocate_and_free_roundtrip() {
        let mut classes = make_size_classes();
        let mut registry = Registry::new();
        let mut stats = Stats::default();

        let p1 = allocate(&mut classes, &mut registry, &mut stats, 24).unwrap();
        let p2 = allocate(&mut classes, &mut registry, &mut stats, 24).unwrap();
        let p3 = allocate(&mut classes, &mut registry, &mut stats, 24).unwrap();
        assert!(free(&mut classes, &mut stats, p2.as_ptr()));
        assert!(free(&mut classes, &mut stats, p1.as_ptr()));
        assert!(free(&mut classes, &mut stats, p3.as_ptr()));
    }

    #[test]
    fn slab_pool_is_created_lazily_and_reused() {
        let mut classes = make_size_classes();
        let mut registry = Registry::new();
        let mut stats = Stats::default();

        for _ in 0..(SLOTS_PER_POOL + 1) {
            allocate(&mut classes, &mut registry, &mut stats, 24).unwrap();
        }
        assert_eq!(stats.small_pools.current, 2);
    }

    #[test]
    fn freed_slot_keeps_its_class_index() {
        let mut classes = make_size_classes();
        let mut registry = Registry::new();
        let mut stats = Stats::default();
        let p = allocate(&mut classes, &mut registry, &mut stats, 100).unwrap();
        let idx = class_index_of(p.as_ptr());
        assert!(free(&mut classes, &mut stats, p.as_ptr()));
        unsafe {
            let block = block_from_ptr(p.as_ptr());
            assert_eq!((*block).class_index as usize, idx);
        }
    }

    #[test]
    fn double_free_is_rejected() {
        let mut classes = make_size_classes();
        let mut registry = Registry::new();
        let mut stats = Stats::default();
        let p = allocate(&mut classes, &mut registry, &mut stats, 24).unwrap();
        assert!(free(&mut classes, &mut stats, p.as_ptr()));
        assert!(!free(&mut classes, &mut stats, p.as_ptr()));
    }
}
