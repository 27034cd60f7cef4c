//! The OS-page provider: the allocator's sole external collaborator for address
//! space. Every pool, regardless of tier, is backed by one call to
//! [`alloc_pages`] and released by one call to [`free_pages`]. Nothing above
//! this module ever asks the OS for memory directly.

use core::ptr::NonNull;
use log::warn;

#[cfg(unix)]
use libc::{mmap, munmap, MAP_ANONYMOUS, MAP_FAILED, MAP_PRIVATE, PROT_READ, PROT_WRITE};

#[cfg(windows)]
use winapi::um::memoryapi::{VirtualAlloc, VirtualFree};
#[cfg(windows)]
use winapi::um::sysinfoapi::GetSystemInfo;
#[cfg(windows)]
use winapi::um::winnt::{MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_READWRITE};

/// The page size assumed by the allocator, verified against the kernel's
/// actual page size during `crate::init::ensure_init`.
pub const CONFIGURED_PAGE_SIZE: usize = 4096;

/// Ask the kernel for its page size. Used once, at initialization, to verify
/// `CONFIGURED_PAGE_SIZE` matches reality (per the initialization contract,
/// a mismatch is a hard initialization failure).
#[cfg(unix)]
pub fn query_page_size() -> usize {
    let result = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if result > 0 {
        result as usize
    } else {
        CONFIGURED_PAGE_SIZE
    }
}

#[cfg(windows)]
pub fn query_page_size() -> usize {
    unsafe {
        let mut info = core::mem::zeroed();
        GetSystemInfo(&mut info);
        info.dwPageSize as usize
    }
}

pub const fn align_up_pages(n: usize) -> usize {
    let mask = CONFIGURED_PAGE_SIZE - 1;
    (n + mask) & !mask
}

/// Acquire a page-aligned, zero-committed, writable region of exactly `size`
/// bytes (already page-aligned by the caller). Returns `None` on kernel
/// refusal; failures here surface to the caller as the usual null-on-exhaustion
/// allocation failure, never as a panic or abort.
#[cfg(unix)]
pub fn alloc_pages(size: usize) -> Option<NonNull<u8>> {
    debug_assert_eq!(size % CONFIGURED_PAGE_SIZE, 0);
    if size == 0 {
        return None;
    }
    let p = unsafe {
        mmap(
            core::ptr::null_mut(),
            size,
            PROT_READ | PROT_WRITE,
            MAP_PRIVATE | MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if p == MAP_FAILED || p.is_null() {
        warn!("mmap failed for {} bytes: errno {}", size, errno::errno());
        return None;
    }
    NonNull::new(p as *mut u8)
}

#[cfg(unix)]
pub fn free_pages(ptr: NonNull<u8>, size: usize) {
    debug_assert_eq!(size % CONFIGURED_PAGE_SIZE, 0);
    let rc = unsafe { munmap(ptr.as_ptr() as *mut _, size) };
    if rc != 0 {
        warn!(
            "munmap failed for {:p} ({} bytes): errno {}",
            ptr.as_ptr(),
            size,
            errno::errno()
        );
    }
}

#[cfg(windows)]
pub fn alloc_pages(size: usize) -> Option<NonNull<u8>> {
    debug_assert_eq!(size % CONFIGURED_PAGE_SIZE, 0);
    if size == 0 {
        return None;
    }
    let p = unsafe {
        VirtualAlloc(
            core::ptr::null_mut(),
            size,
            MEM_RESERVE | MEM_COMMIT,
            PAGE_READWRITE,
        )
    };
    if p.is_null() {
        warn!("VirtualAlloc failed for {} bytes", size);
        return None;
    }
    NonNull::new(p as *mut u8)
}

#[cfg(windows)]
pub fn free_pages(ptr: NonNull<u8>, _size: usize) {
    let ok = unsafe { VirtualFree(ptr.as_ptr() as *mut _, 0, MEM_RELEASE) };
    if ok == 0 {
        warn!("VirtualFree failed for {:p}", ptr.as_ptr());
    }
}
