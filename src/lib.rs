#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![forbid(unreachable_pub)]

//! Preemptive kernel thread scheduling for a single-CPU system.
//!
//! This library manages the full lifecycle of kernel threads — creation,
//! blocking, readiness, running, termination — and decides which thread runs
//! on every timer tick. Two policies are selectable at boot:
//!
//! - **Priority round-robin** with priority donation through locks: the
//!   ready queue is sorted by effective priority, equal priorities share the
//!   CPU in FIFO order, and a thread blocked on a lock lends its priority to
//!   the holder, transitively along the chain of held locks.
//! - **4.4BSD multilevel feedback queue** (`mlfqs`): priorities are derived
//!   from per-thread recent-CPU and system load-average estimators that the
//!   timer tick drives; `nice` biases a thread's share.
//!
//! # Quick Start
//!
//! ```ignore
//! use core::ffi::c_void;
//!
//! fn worker(_aux: *mut c_void) {
//!     loop { /* thread work */ }
//! }
//!
//! fn kernel_main() {
//!     // Interrupts are still off this early in boot.
//!     kthreads::init(false);
//!     kthreads::start();
//!
//!     kthreads::create("worker", kthreads::PRI_DEFAULT, worker, core::ptr::null_mut())
//!         .expect("failed to create thread");
//! }
//! ```
//!
//! The platform supplies two things: a timer interrupt that calls
//! [`on_tick`] between [`intr::external_enter`] and [`intr::external_exit`],
//! and an [`Arch`] implementation that performs the register-level thread
//! switch. Everything else — the ready queue, tick bookkeeping, donation,
//! the feedback-queue estimators, semaphores, locks, condition variables —
//! lives here.
//!
//! # Architecture
//!
//! - Interrupts-off critical sections as the sole mutual exclusion
//! - Intrusive, sentinel-terminated queues embedded in the TCB
//! - One 4 KiB page per thread: TCB at the base, stack growing down
//! - A dying thread's page is reclaimed by its successor in the switch tail

// Core modules
pub mod arch;
pub mod errors;
pub mod fixed;
pub mod intr;
pub mod list;
pub mod mem;
pub mod sched;
pub mod sync;
pub mod thread;
pub mod time;

#[cfg(test)]
extern crate std;

extern crate alloc;

// Panic handler for bare-metal
#[cfg(all(not(test), not(feature = "std-shim")))]
use core::panic::PanicInfo;

#[cfg(all(not(test), not(feature = "std-shim")))]
#[panic_handler]
fn panic(_info: &PanicInfo) -> ! {
    // On panic, mask interrupts and halt.
    use arch::Arch;
    arch::DefaultArch::disable_interrupts();
    loop {
        core::hint::spin_loop();
    }
}

// ============================================================================
// Public API
// ============================================================================

// Architecture abstraction
pub use arch::{Arch, DefaultArch, StubArch};

// Scheduler operations
pub use sched::{
    block, create, current, current_tid, exit, foreach, get_load_avg, get_nice, get_priority,
    get_recent_cpu, init, lookup, mlfqs_enabled, name, on_tick, print_stats, schedule_tail,
    set_activate_hook, set_nice, set_priority, start, swap_to_highest, unblock, yield_now,
    TIME_SLICE,
};

// Threads
pub use thread::{
    Thread, ThreadFunc, ThreadStatus, Tid, PRI_DEFAULT, PRI_MAX, PRI_MIN, THREAD_MAGIC, TID_ERROR,
};

// Synchronization primitives
pub use sync::{Condvar, Lock, Semaphore};

// Supporting types
pub use errors::{CreateError, CreateResult};
pub use fixed::Fixed;
pub use list::{List, ListElem};
pub use mem::PAGE_SIZE;
pub use time::{ticks, TickCounter, TIMER_FREQ};

#[cfg(test)]
pub(crate) mod testutil {
    //! Shared plumbing for the host test suite. The scheduler is one global
    //! instance, so tests that touch it serialize on a process-wide lock
    //! and reboot it into a known state.

    use std::sync::{Mutex, MutexGuard, PoisonError};

    static LOCK: Mutex<()> = Mutex::new(());

    /// Serialize access to process-global scheduler state.
    pub(crate) fn serialize() -> MutexGuard<'static, ()> {
        LOCK.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Serialize, then boot a fresh scheduler under the given policy.
    /// Returns with interrupts enabled, as in thread context.
    pub(crate) fn boot(mlfqs: bool) -> MutexGuard<'static, ()> {
        let guard = serialize();
        crate::intr::reset_for_tests();
        crate::time::reset_for_tests();
        crate::intr::disable();
        crate::sched::init(mlfqs);
        crate::intr::enable();
        guard
    }

    /// Deliver one timer tick the way a platform ISR would.
    pub(crate) fn tick() {
        crate::intr::disable();
        crate::intr::external_enter();
        crate::sched::on_tick();
        crate::intr::external_exit();
        crate::intr::enable();
    }
}
