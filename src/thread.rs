//! Thread control blocks.
//!
//! A thread owns exactly one 4 KiB page. The TCB sits at the bottom of the
//! page and the kernel stack grows downward from the top:
//!
//! ```text
//!      4 kB +---------------------------------+
//!           |          kernel stack           |
//!           |               |                 |
//!           |               v                 |
//!           |         grows downward          |
//!           +---------------------------------+
//!           |             magic               |
//!           |              ...                |
//!           |             status              |
//!           |              tid                |
//!      0 kB +---------------------------------+
//! ```
//!
//! The stack must never grow into the TCB. `magic` is the last struct field,
//! so an overflowing stack clobbers it first and the corruption is caught by
//! the validity assertion on the next access.

use crate::container_of;
use crate::fixed::Fixed;
use crate::list::{List, ListElem};
use crate::mem::PAGE_SIZE;
use crate::sync::Lock;
use core::ffi::c_void;
use core::fmt;
use core::mem::size_of;
use core::ptr;

/// Lowest priority.
pub const PRI_MIN: i32 = 0;
/// Default priority.
pub const PRI_DEFAULT: i32 = 31;
/// Highest priority.
pub const PRI_MAX: i32 = 63;

/// Sentinel detecting stack overflow into the TCB.
pub const THREAD_MAGIC: u32 = 0xCD6A_BF4B;

/// Capacity of the name field, including the terminator.
const NAME_CAP: usize = 16;

/// Thread identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tid(pub(crate) i32);

/// Sentinel tid for embedders that want an error encoding instead of
/// [`crate::errors::CreateError`].
pub const TID_ERROR: Tid = Tid(-1);

impl Tid {
    pub fn as_i32(self) -> i32 {
        self.0
    }
}

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStatus {
    /// Executing on the CPU.
    Running,
    /// Eligible to run, sitting in the ready queue.
    Ready,
    /// Waiting for an unblock; not scheduled.
    Blocked,
    /// About to be destroyed; its page is freed by its successor.
    Dying,
}

/// Entry point of a kernel thread.
pub type ThreadFunc = fn(aux: *mut c_void);

/// A thread control block.
///
/// `#[repr(C)]` so that queue nodes can be mapped back to their TCB and so
/// a port's switch stub can address the saved stack pointer at a fixed
/// offset.
#[repr(C)]
pub struct Thread {
    pub(crate) tid: Tid,
    pub(crate) status: ThreadStatus,
    pub(crate) name: [u8; NAME_CAP],
    /// Saved stack pointer, maintained by the architecture switch.
    pub(crate) sp: *mut u8,
    /// Effective priority; in the donation policy this may exceed
    /// `base_priority` while donors wait on held locks.
    pub(crate) priority: i32,
    pub(crate) base_priority: i32,
    /// Lock this thread is blocked acquiring, if any. Non-owning.
    pub(crate) wanted_lock: *mut Lock,
    /// Locks currently held, linked through `Lock::elem`.
    pub(crate) held_locks: List,
    pub(crate) nice: i32,
    pub(crate) recent_cpu: Fixed,
    /// Ready-queue / waiter-list membership.
    pub(crate) elem: ListElem,
    /// All-threads list membership.
    pub(crate) all_elem: ListElem,
    /// Must equal [`THREAD_MAGIC`] for any live TCB.
    pub(crate) magic: u32,
}

impl Thread {
    /// A blank TCB for static placement (the boot thread). Fields are
    /// filled in by [`Thread::init`].
    pub(crate) const fn empty() -> Thread {
        Thread {
            tid: Tid(0),
            status: ThreadStatus::Blocked,
            name: [0; NAME_CAP],
            sp: ptr::null_mut(),
            priority: 0,
            base_priority: 0,
            wanted_lock: ptr::null_mut(),
            held_locks: List::new(),
            nice: 0,
            recent_cpu: Fixed::ZERO,
            elem: ListElem::new(),
            all_elem: ListElem::new(),
            magic: 0,
        }
    }

    /// Initialize a TCB in place.
    ///
    /// The caller links the thread into the all-threads list and builds its
    /// stack frames; after `init` the thread is Blocked.
    ///
    /// # Safety
    ///
    /// `t` must point to writable storage for a `Thread` at the base of the
    /// thread's page (or to the boot thread's static slot).
    pub(crate) unsafe fn init(t: *mut Thread, name: &str, priority: i32, mlfqs: bool) {
        unsafe {
            assert!(!t.is_null());
            assert!((PRI_MIN..=PRI_MAX).contains(&priority));

            (*t).status = ThreadStatus::Blocked;
            (*t).name = [0; NAME_CAP];
            let n = name.len().min(NAME_CAP - 1);
            (&mut (*t).name)[..n].copy_from_slice(&name.as_bytes()[..n]);
            (*t).sp = t.cast::<u8>().add(PAGE_SIZE);
            if mlfqs {
                (*t).nice = 0;
                (*t).recent_cpu = Fixed::ZERO;
                (*t).priority = PRI_MAX;
            } else {
                (*t).priority = priority;
                (*t).base_priority = priority;
                (*t).wanted_lock = ptr::null_mut();
            }
            (*t).held_locks.init();
            (*t).magic = THREAD_MAGIC;
        }
    }

    pub fn tid(&self) -> Tid {
        self.tid
    }

    pub fn status(&self) -> ThreadStatus {
        self.status
    }

    /// Effective priority.
    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn nice(&self) -> i32 {
        self.nice
    }

    pub fn name(&self) -> &str {
        let n = self.name.iter().position(|&b| b == 0).unwrap_or(NAME_CAP);
        core::str::from_utf8(&self.name[..n]).unwrap_or("?")
    }

    /// Map a ready-queue / waiter-list node back to its TCB.
    ///
    /// # Safety
    ///
    /// `e` must be the `elem` field of a live `Thread`.
    pub(crate) unsafe fn from_elem(e: *mut ListElem) -> *mut Thread {
        unsafe { container_of!(e, Thread, elem) }
    }

    /// Map an all-threads list node back to its TCB.
    ///
    /// # Safety
    ///
    /// `e` must be the `all_elem` field of a live `Thread`.
    pub(crate) unsafe fn from_all_elem(e: *mut ListElem) -> *mut Thread {
        unsafe { container_of!(e, Thread, all_elem) }
    }

    /// Whether `t` appears to point at a live TCB. A magic mismatch means
    /// the thread's stack overflowed into the struct.
    pub(crate) unsafe fn is_valid(t: *const Thread) -> bool {
        unsafe { !t.is_null() && (*t).magic == THREAD_MAGIC }
    }
}

// A TCB is handed between interrupt and thread contexts under interrupts-off
// critical sections; the raw link fields make it !Send by default.
unsafe impl Send for Thread {}
unsafe impl Sync for Thread {}

/// Frame executed last: the trampoline's caller record.
#[repr(C)]
pub(crate) struct EntryFrame {
    /// Fake return address; [`kernel_thread`] never returns.
    pub(crate) ret: usize,
    pub(crate) function: ThreadFunc,
    pub(crate) aux: *mut c_void,
}

/// Frame consumed by the first dispatch: returns into [`kernel_thread`].
#[repr(C)]
pub(crate) struct FirstDispatchFrame {
    pub(crate) ret: usize,
}

/// Frame consumed by the architecture switch: returns into the port's
/// first-dispatch stub, frame pointer cleared to terminate backtraces.
#[repr(C)]
pub(crate) struct SwitchFrame {
    pub(crate) ret: usize,
    pub(crate) fp: usize,
}

/// Carve a frame of type `T` from the top of `t`'s unused stack.
///
/// # Safety
///
/// `t` must be a valid TCB whose stack has room for the frame.
pub(crate) unsafe fn alloc_frame<T>(t: *mut Thread) -> *mut T {
    unsafe {
        debug_assert!(Thread::is_valid(t));
        debug_assert_eq!(size_of::<T>() % size_of::<usize>(), 0);
        (*t).sp = (*t).sp.sub(size_of::<T>());
        (*t).sp.cast()
    }
}

/// Basis of every kernel thread: the first dispatch lands here via the
/// pre-built frames. The scheduler runs with interrupts off, so they are
/// enabled before entering the thread's function; a function that returns
/// kills its thread.
pub(crate) fn kernel_thread(function: ThreadFunc, aux: *mut c_void) -> ! {
    crate::intr::enable();
    function(aux);
    crate::sched::exit();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem;

    #[test]
    fn init_fills_tcb() {
        let page = mem::alloc_zeroed_page().unwrap();
        let t = page.as_ptr() as *mut Thread;
        unsafe {
            Thread::init(t, "worker", PRI_DEFAULT, false);
            assert_eq!((*t).status, ThreadStatus::Blocked);
            assert_eq!((*t).priority, PRI_DEFAULT);
            assert_eq!((*t).base_priority, PRI_DEFAULT);
            assert!((*t).wanted_lock.is_null());
            assert_eq!((*t).magic, THREAD_MAGIC);
            assert_eq!((*t).name(), "worker");
            assert_eq!((*t).sp, t.cast::<u8>().add(mem::PAGE_SIZE));
            assert!(Thread::is_valid(t));
            mem::free_page(page);
        }
    }

    #[test]
    fn mlfqs_init_ignores_requested_priority() {
        let page = mem::alloc_zeroed_page().unwrap();
        let t = page.as_ptr() as *mut Thread;
        unsafe {
            Thread::init(t, "bsd", 10, true);
            assert_eq!((*t).priority, PRI_MAX);
            assert_eq!((*t).nice, 0);
            assert_eq!((*t).recent_cpu, Fixed::ZERO);
            mem::free_page(page);
        }
    }

    #[test]
    fn names_truncate_at_fifteen_chars() {
        let page = mem::alloc_zeroed_page().unwrap();
        let t = page.as_ptr() as *mut Thread;
        unsafe {
            Thread::init(t, "a-very-long-thread-name", PRI_DEFAULT, false);
            assert_eq!((*t).name(), "a-very-long-thr");
            assert_eq!((*t).name().len(), 15);
            mem::free_page(page);
        }
    }

    #[test]
    fn magic_mismatch_is_detected() {
        let page = mem::alloc_zeroed_page().unwrap();
        let t = page.as_ptr() as *mut Thread;
        unsafe {
            Thread::init(t, "victim", PRI_DEFAULT, false);
            (*t).magic = 0; // simulated stack overflow
            assert!(!Thread::is_valid(t));
            mem::free_page(page);
        }
    }

    #[test]
    fn frames_stack_downward() {
        let page = mem::alloc_zeroed_page().unwrap();
        let t = page.as_ptr() as *mut Thread;
        unsafe {
            Thread::init(t, "framed", PRI_DEFAULT, false);
            let top = (*t).sp;
            let ef: *mut EntryFrame = alloc_frame(t);
            let df: *mut FirstDispatchFrame = alloc_frame(t);
            let sf: *mut SwitchFrame = alloc_frame(t);
            assert_eq!(ef.cast::<u8>(), top.sub(size_of::<EntryFrame>()));
            assert!(df.cast::<u8>() < ef.cast::<u8>());
            assert!(sf.cast::<u8>() < df.cast::<u8>());
            assert_eq!((*t).sp, sf.cast::<u8>());
            mem::free_page(page);
        }
    }

    #[test]
    fn tid_formatting() {
        assert_eq!(std::format!("{}", Tid(7)), "7");
        assert_eq!(std::format!("{}", TID_ERROR), "-1");
    }
}
