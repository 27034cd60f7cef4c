//! The pool registry: a process-wide singly-linked list of every live pool
//! header, regardless of tier. This is the only mechanism used to answer
//! "which pool owns this address?" on free and reallocate -- there is no
//! per-pointer hash table.

use crate::types::PoolHeader;

pub struct Registry {
    head: *mut PoolHeader,
}

impl Registry {
    pub const fn new() -> Self {
        Registry {
            head: core::ptr::null_mut(),
        }
    }

    /// Insert a freshly created pool at the head of the registry.
    pub fn register(&mut self, pool: *mut PoolHeader) {
        unsafe {
            (*pool).next = self.head;
        }
        self.head = pool;
    }

    /// Splice a pool out of the registry. `pool` must currently be registered.
    pub fn unregister(&mut self, pool: *mut PoolHeader) {
        let mut cursor = &mut self.head as *mut *mut PoolHeader;
        unsafe {
            loop {
                let current = *cursor;
                debug_assert!(!current.is_null(), "unregistering a pool not in the registry");
                if current == pool {
                    *cursor = (*current).next;
                    (*current).next = core::ptr::null_mut();
                    return;
                }
                cursor = &mut (*current).next as *mut *mut PoolHeader;
            }
        }
    }

    /// Resolve `addr` to the unique registered pool whose byte range contains it.
    pub fn resolve(&self, addr: *const u8) -> Option<*mut PoolHeader> {
        let mut cursor = self.head;
        unsafe {
            while !cursor.is_null() {
                if (*cursor).contains(addr) {
                    return Some(cursor);
                }
                cursor = (*cursor).next;
            }
        }
        None
    }

    pub fn iter(&self) -> RegistryIter {
        RegistryIter { cursor: self.head }
    }
}

pub struct RegistryIter {
    cursor: *mut PoolHeader,
}

impl Iterator for RegistryIter {
    type Item = *mut PoolHeader;

    fn next(&mut self) -> Option<*mut PoolHeader> {
        if self.cursor.is_null() {
            return None;
        }
        let current = self.cursor;
        unsafe {
            self.cursor = (*current).next;
        }
        Some(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Tier;

    unsafe fn leak_pool(base: *mut u8, size: usize, tier: Tier) -> *mut PoolHeader {
        let header = base as *mut PoolHeader;
        core::ptr::write(
            header,
            PoolHeader {
                base,
                size,
                tier,
                next: core::ptr::null_mut(),
                tier_head: core::ptr::null_mut(),
                class_next: core::ptr::null_mut(),
            },
        );
        header
    }

    #[test]
    fn resolve_finds_owning_pool() {
        let mut buf_a = [0u8; 256];
        let mut buf_b = [0u8; 256];
        let mut registry = Registry::new();
        unsafe {
            let a = leak_pool(buf_a.as_mut_ptr(), buf_a.len(), Tier::General);
            let b = leak_pool(buf_b.as_mut_ptr(), buf_b.len(), Tier::Small);
            registry.register(a);
            registry.register(b);

            assert_eq!(registry.resolve(buf_a.as_ptr().add(10)), Some(a));
            assert_eq!(registry.resolve(buf_b.as_ptr().add(10)), Some(b));
            assert_eq!(registry.resolve(buf_b.as_ptr().add(1000)), None);
        }
    }

    #[test]
    fn unregister_splices_correctly() {
        let mut buf_a = [0u8; 256];
        let mut buf_b = [0u8; 256];
        let mut buf_c = [0u8; 256];
        let mut registry = Registry::new();
        unsafe {
            let a = leak_pool(buf_a.as_mut_ptr(), buf_a.len(), Tier::General);
            let b = leak_pool(buf_b.as_mut_ptr(), buf_b.len(), Tier::General);
            let c = leak_pool(buf_c.as_mut_ptr(), buf_c.len(), Tier::General);
            registry.register(a);
            registry.register(b);
            registry.register(c);

            registry.unregister(b);
            assert_eq!(registry.resolve(buf_b.as_ptr()), None);
            assert_eq!(registry.resolve(buf_a.as_ptr()), Some(a));
            assert_eq!(registry.resolve(buf_c.as_ptr()), Some(c));
            assert_eq!(registry.iter().count(), 2);
        }
    }
}
