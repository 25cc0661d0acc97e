//! Page-granularity allocation for thread control blocks.
//!
//! Every thread lives in exactly one 4 KiB page: the TCB at the base, the
//! kernel stack growing down from the top. This facade hands out zeroed,
//! page-aligned pages from the global allocator; a bare-metal embedder
//! supplies that allocator.

use core::alloc::Layout;
use core::ptr::NonNull;
use portable_atomic::{AtomicUsize, Ordering};

extern crate alloc;

/// Size and alignment of a thread page.
pub const PAGE_SIZE: usize = 4096;

static ALLOCATED: AtomicUsize = AtomicUsize::new(0);
static FREED: AtomicUsize = AtomicUsize::new(0);

fn page_layout() -> Layout {
    // PAGE_SIZE is a power of two, so this cannot fail.
    Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).unwrap()
}

/// Allocate a zeroed, page-aligned page, or `None` when memory is exhausted.
pub fn alloc_zeroed_page() -> Option<NonNull<u8>> {
    let page = NonNull::new(unsafe { alloc::alloc::alloc_zeroed(page_layout()) })?;
    ALLOCATED.fetch_add(1, Ordering::AcqRel);
    Some(page)
}

/// Return a page obtained from [`alloc_zeroed_page`].
///
/// # Safety
///
/// `page` must have come from [`alloc_zeroed_page`] and must not be used
/// afterwards.
pub unsafe fn free_page(page: NonNull<u8>) {
    unsafe { alloc::alloc::dealloc(page.as_ptr(), page_layout()) };
    FREED.fetch_add(1, Ordering::AcqRel);
}

/// Pages currently live: (allocated, freed).
pub fn stats() -> (usize, usize) {
    (
        ALLOCATED.load(Ordering::Acquire),
        FREED.load(Ordering::Acquire),
    )
}
