//! The public entry points. Every one of them acquires the single
//! process-wide mutex on entry and releases it on every exit path; the real
//! work happens in `*_internal` helpers that never try to reacquire it, so
//! the lock is never taken twice on the same thread.
//!
//! Dispatch on `allocate` is by requested size. Dispatch on `free` and
//! `reallocate` is by the pool's recorded tier, resolved through the
//! registry -- never by the size of the call itself, since a shrinking or
//! growing reallocation may need to cross tiers.

use core::ptr;
use core::ptr::NonNull;

use spin::Mutex;

use crate::direct;
use crate::general;
use crate::init::ensure_init;
use crate::registry::Registry;
use crate::small;
use crate::stats::Stats;
use crate::types::{class_for_size, make_size_classes, tier_for_size, SizeClass, Tier, NUM_SMALL_CLASSES};

pub struct AllocatorState {
    pub registry: Registry,
    pub classes: [SizeClass; NUM_SMALL_CLASSES],
    pub stats: Stats,
}

impl AllocatorState {
    pub const fn new() -> Self {
        AllocatorState {
            registry: Registry::new(),
            classes: make_size_classes(),
            stats: Stats {
                reserved: crate::stats::StatCount { allocated: 0, freed: 0, current: 0, peak: 0 },
                small_pools: crate::stats::StatCount { allocated: 0, freed: 0, current: 0, peak: 0 },
                general_pools: crate::stats::StatCount { allocated: 0, freed: 0, current: 0, peak: 0 },
                direct_pools: crate::stats::StatCount { allocated: 0, freed: 0, current: 0, peak: 0 },
                small_allocs: crate::stats::StatCount { allocated: 0, freed: 0, current: 0, peak: 0 },
                general_allocs: crate::stats::StatCount { allocated: 0, freed: 0, current: 0, peak: 0 },
                direct_allocs: crate::stats::StatCount { allocated: 0, freed: 0, current: 0, peak: 0 },
                alloc_failures: 0,
                rejected_frees: 0,
                corruption_events: 0,
                general_searches: 0,
                splits: 0,
                coalesces: 0,
            },
        }
    }
}

// Every pointer reachable from `AllocatorState` (pool/block headers, free-list
// links) is only ever touched while holding `STATE`'s lock, so handing the
// whole state across threads is sound even though raw pointers are `!Send`.
unsafe impl Send for AllocatorState {}

pub static STATE: Mutex<AllocatorState> = Mutex::new(AllocatorState::new());

fn allocate_internal(state: &mut AllocatorState, n: usize) -> Option<NonNull<u8>> {
    if n == 0 {
        return None;
    }
    match tier_for_size(n) {
        Tier::Small => small::allocate(&mut state.classes, &mut state.registry, &mut state.stats, n),
        Tier::General => general::allocate(&mut state.registry, &mut state.stats, n),
        Tier::Direct => direct::allocate(&mut state.registry, &mut state.stats, n),
    }
}

fn free_internal(state: &mut AllocatorState, p: NonNull<u8>) {
    let pool = match state.registry.resolve(p.as_ptr()) {
        Some(pool) => pool,
        None => {
            log::warn!("free: {:p} does not belong to any registered pool", p.as_ptr());
            state.stats.rejected_frees += 1;
            return;
        }
    };
    match unsafe { (*pool).tier } {
        Tier::Small => {
            small::free(&mut state.classes, &mut state.stats, p.as_ptr());
        }
        Tier::General => {
            general::free(&mut state.stats, p.as_ptr());
        }
        Tier::Direct => {
            direct::free(&mut state.registry, &mut state.stats, pool, p.as_ptr());
        }
    }
}

unsafe fn migrate(state: &mut AllocatorState, old: NonNull<u8>, old_user_size: usize, new_size: usize) -> Option<NonNull<u8>> {
    let new_ptr = allocate_internal(state, new_size)?;
    let copy_len = core::cmp::min(old_user_size, new_size);
    ptr::copy_nonoverlapping(old.as_ptr(), new_ptr.as_ptr(), copy_len);
    free_internal(state, old);
    Some(new_ptr)
}

fn reallocate_internal(state: &mut AllocatorState, p: Option<NonNull<u8>>, n: usize) -> Option<NonNull<u8>> {
    let p = match p {
        None => return allocate_internal(state, n),
        Some(p) => p,
    };
    if n == 0 {
        free_internal(state, p);
        return None;
    }

    let pool = match state.registry.resolve(p.as_ptr()) {
        Some(pool) => pool,
        None => {
            log::warn!("reallocate: {:p} does not belong to any registered pool", p.as_ptr());
            state.stats.rejected_frees += 1;
            return None;
        }
    };
    let old_tier = unsafe { (*pool).tier };
    let new_tier = tier_for_size(n);

    unsafe {
        match (old_tier, new_tier) {
            (Tier::Small, Tier::Small) => {
                let old_idx = small::class_index_of(p.as_ptr());
                // class_for_size(n) is Some because new_tier == Small implies n <= SMALL_MAX
                let new_idx = class_for_size(n).unwrap();
                if new_idx <= old_idx {
                    Some(p)
                } else {
                    let slot_size = small::slot_size(&state.classes, old_idx);
                    migrate(state, p, slot_size, n)
                }
            }
            (Tier::Small, _) => {
                let old_idx = small::class_index_of(p.as_ptr());
                let slot_size = small::slot_size(&state.classes, old_idx);
                migrate(state, p, slot_size, n)
            }
            (Tier::General, Tier::General) => match general::reallocate(&mut state.stats, p.as_ptr(), n) {
                general::ReallocOutcome::SameBlock(ptr) => NonNull::new(ptr),
                general::ReallocOutcome::Migrate => {
                    let old_user_size = general::user_size(p.as_ptr());
                    migrate(state, p, old_user_size, n)
                }
            },
            (Tier::General, _) => {
                let old_user_size = general::user_size(p.as_ptr());
                migrate(state, p, old_user_size, n)
            }
            (Tier::Direct, Tier::Small) | (Tier::Direct, Tier::General) => {
                let old_user_size = direct::user_size(p.as_ptr());
                migrate(state, p, old_user_size, n)
            }
            (Tier::Direct, Tier::Direct) => {
                let capacity = direct::capacity_of(pool);
                if direct::should_migrate(capacity, n) {
                    let old_user_size = direct::user_size(p.as_ptr());
                    migrate(state, p, old_user_size, n)
                } else {
                    direct::set_user_size(p.as_ptr(), n);
                    Some(p)
                }
            }
        }
    }
}

/// `n == 0` returns null; otherwise returns an aligned pointer to at least
/// `n` bytes, chosen by tier according to `n`.
pub fn allocate(n: usize) -> *mut u8 {
    if !ensure_init() {
        return ptr::null_mut();
    }
    let mut state = STATE.lock();
    allocate_internal(&mut state, n).map_or(ptr::null_mut(), NonNull::as_ptr)
}

/// `p == null` is a no-op. Resolves `p` to its owning pool and dispatches to
/// that pool's tier-specific free; a stray pointer is logged and abandoned.
pub fn free(p: *mut u8) {
    if p.is_null() {
        return;
    }
    if !ensure_init() {
        return;
    }
    let mut state = STATE.lock();
    if let Some(p) = NonNull::new(p) {
        free_internal(&mut state, p);
    }
}

/// `p == null` behaves as `allocate(n)`. `n == 0` behaves as `free(p)` and
/// returns null. Otherwise applies the per-tier reallocation protocol,
/// migrating across tiers when the new size crosses a boundary.
pub fn reallocate(p: *mut u8, n: usize) -> *mut u8 {
    if !ensure_init() {
        return ptr::null_mut();
    }
    let mut state = STATE.lock();
    reallocate_internal(&mut state, NonNull::new(p), n).map_or(ptr::null_mut(), NonNull::as_ptr)
}

/// Allocates `count * size` bytes, zeroed. Fails to null on multiplication
/// overflow as well as on ordinary exhaustion.
pub fn zero_allocate(count: usize, size: usize) -> *mut u8 {
    let total = match count.checked_mul(size) {
        Some(t) => t,
        None => return ptr::null_mut(),
    };
    if !ensure_init() {
        return ptr::null_mut();
    }
    let mut state = STATE.lock();
    match allocate_internal(&mut state, total) {
        Some(p) => {
            unsafe { ptr::write_bytes(p.as_ptr(), 0, total) };
            p.as_ptr()
        }
        None => ptr::null_mut(),
    }
}

/// A snapshot of the process-wide counters. Diagnostic only; not part of the
/// compatibility surface.
pub fn stats_snapshot() -> Stats {
    STATE.lock().stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{GENERAL_MAX, SMALL_MAX};

    #[test]
    fn allocate_zero_returns_null() {
        assert!(allocate(0).is_null());
    }

    #[test]
    fn boundary_sizes_select_expected_tiers() {
        let mut state = AllocatorState::new();
        assert!(matches!(
            unsafe {
                let p = allocate_internal(&mut state, SMALL_MAX).unwrap();
                state.registry.resolve(p.as_ptr()).map(|pool| (*pool).tier)
            },
            Some(Tier::Small)
        ));
        assert!(matches!(
            unsafe {
                let p = allocate_internal(&mut state, SMALL_MAX + 1).unwrap();
                state.registry.resolve(p.as_ptr()).map(|pool| (*pool).tier)
            },
            Some(Tier::General)
        ));
        assert!(matches!(
            unsafe {
                let p = allocate_internal(&mut state, GENERAL_MAX).unwrap();
                state.registry.resolve(p.as_ptr()).map(|pool| (*pool).tier)
            },
            Some(Tier::General)
        ));
        assert!(matches!(
            unsafe {
                let p = allocate_internal(&mut state, GENERAL_MAX + 1).unwrap();
                state.registry.resolve(p.as_ptr()).map(|pool| (*pool).tier)
            },
            Some(Tier::Direct)
        ));
    }

    #[test]
    fn reallocate_null_is_allocate() {
        let mut state = AllocatorState::new();
        let p = reallocate_internal(&mut state, None, 24).unwrap();
        assert!(state.registry.resolve(p.as_ptr()).is_some());
    }

    #[test]
    fn reallocate_zero_frees_and_returns_null() {
        let mut state = AllocatorState::new();
        let p = allocate_internal(&mut state, 24).unwrap();
        let result = reallocate_internal(&mut state, Some(p), 0);
        assert!(result.is_none());
    }

    #[test]
    fn cross_tier_round_trip_preserves_contents() {
        let mut state = AllocatorState::new();
        let p = allocate_internal(&mut state, 24).unwrap();
        unsafe {
            for i in 0..24u8 {
                ptr::write(p.as_ptr().add(i as usize), i);
            }
        }
        let p = reallocate_internal(&mut state, Some(p), 1000).unwrap();
        let p = reallocate_internal(&mut state, Some(p), 10_000_000).unwrap();
        let p = reallocate_internal(&mut state, Some(p), 1000).unwrap();
        let p = reallocate_internal(&mut state, Some(p), 24).unwrap();
        unsafe {
            for i in 0..24u8 {
                assert_eq!(ptr::read(p.as_ptr().add(i as usize)), i);
            }
        }
    }

    #[test]
    fn small_alloc_free_middle_then_cross_tier_realloc() {
        let mut state = AllocatorState::new();
        let p1 = allocate_internal(&mut state, 24).unwrap();
        let p2 = allocate_internal(&mut state, 24).unwrap();
        let p3 = allocate_internal(&mut state, 24).unwrap();
        free_internal(&mut state, p2);
        let p2 = allocate_internal(&mut state, 24).unwrap();
        let p2 = reallocate_internal(&mut state, Some(p2), 1000).unwrap();
        assert!(matches!(
            state.registry.resolve(p2.as_ptr()).map(|pool| unsafe { (*pool).tier }),
            Some(Tier::General)
        ));
        free_internal(&mut state, p1);
        free_internal(&mut state, p3);
        free_internal(&mut state, p2);
    }
}
