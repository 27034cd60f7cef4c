//! Process-wide, idempotent initialization. Must run before the first
//! allocation; verifies the kernel's page size matches the configured
//! assumption and creates the first general-tier pool so the tier never has
//! to special-case an empty registry.

use spin::Once;

use crate::dispatch::STATE;
use crate::general;
use crate::os;

static INIT_OK: Once<bool> = Once::new();

/// Runs the one-time initialization if it hasn't already, returning whether
/// the allocator is fit to serve requests. Safe to call from every public
/// entry point; subsequent calls are free (the result is cached).
pub fn ensure_init() -> bool {
    *INIT_OK.call_once(|| {
        let actual = os::query_page_size();
        if actual != os::CONFIGURED_PAGE_SIZE {
            log::error!(
                "page size mismatch: kernel reports {} bytes, allocator configured for {}; refusing to serve",
                actual,
                os::CONFIGURED_PAGE_SIZE
            );
            return false;
        }
        let mut state = STATE.lock();
        unsafe { general::grow(&mut state.registry, &mut state.stats, 0).is_some() }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        assert!(ensure_init());
        assert!(ensure_init());
    }
}
