//! Architecture abstraction layer for context switching and interrupt control.
//!
//! The scheduler is written against this trait; a port supplies the real
//! register save/restore and interrupt-flag manipulation for its CPU. The
//! crate ships [`StubArch`], which emulates the interrupt flag with an atomic
//! and treats the stack switch as a bookkeeping no-op, so the scheduler's
//! state machine runs (and is tested) on a hosted build.

use crate::thread::Thread;
use portable_atomic::{AtomicBool, Ordering};

/// Architecture abstraction trait.
///
/// # Safety
///
/// Implementations involve direct hardware manipulation and inline assembly.
/// The unsafe methods have specific preconditions that must be upheld by the
/// caller.
pub trait Arch {
    /// Enable interrupt delivery on the current CPU.
    fn enable_interrupts();

    /// Disable interrupt delivery on the current CPU.
    fn disable_interrupts();

    /// Whether interrupts are currently deliverable.
    fn interrupts_enabled() -> bool;

    /// Suspend `cur` and resume `next`, returning (on `next`'s stack) the
    /// thread that was running before the switch completed.
    ///
    /// A port saves the callee-saved registers and stack pointer of `cur`
    /// into its TCB, loads `next`'s, and arranges for the previous thread to
    /// come back in a register so the switch tail can observe it.
    ///
    /// # Safety
    ///
    /// - Both pointers must be valid TCBs whose pages outlive the switch.
    /// - Must be called with interrupts disabled.
    /// - `cur`'s status must already be something other than running.
    unsafe fn switch_threads(cur: *mut Thread, next: *mut Thread) -> *mut Thread;

    /// Address of the first-dispatch entry stub.
    ///
    /// This is the return address planted in a new thread's pre-built switch
    /// frame. The stub must call [`crate::sched::schedule_tail`] with the
    /// previous thread handed over by [`Arch::switch_threads`], then return
    /// into the entry trampoline frame above it.
    fn switch_entry() -> usize;

    /// Re-enable interrupts and wait for the next one, atomically where the
    /// hardware allows it. Used by the idle thread's loop body.
    fn idle_wait();
}

/// Interrupt-flag emulation plus no-op switching, for hosted builds.
///
/// The flag starts enabled, matching a CPU that has finished early boot.
/// `switch_threads` performs none of the stack surgery; the caller's
/// bookkeeping (ready queue, status fields, current pointer) still runs,
/// which is what the host test suite exercises.
pub struct StubArch;

static STUB_INTR_ENABLED: AtomicBool = AtomicBool::new(true);

impl Arch for StubArch {
    fn enable_interrupts() {
        STUB_INTR_ENABLED.store(true, Ordering::Release);
    }

    fn disable_interrupts() {
        STUB_INTR_ENABLED.store(false, Ordering::Release);
    }

    fn interrupts_enabled() -> bool {
        STUB_INTR_ENABLED.load(Ordering::Acquire)
    }

    unsafe fn switch_threads(cur: *mut Thread, next: *mut Thread) -> *mut Thread {
        let _ = next;
        cur
    }

    fn switch_entry() -> usize {
        0
    }

    fn idle_wait() {
        Self::enable_interrupts();
        core::hint::spin_loop();
    }
}

/// The architecture the scheduler is compiled against.
///
/// Bare-metal ports point this alias at their own [`Arch`] implementation;
/// everywhere else the stub keeps the crate buildable and testable.
pub type DefaultArch = StubArch;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;

    #[test]
    fn stub_flag_round_trip() {
        let _guard = testutil::serialize();
        StubArch::enable_interrupts();
        assert!(StubArch::interrupts_enabled());
        StubArch::disable_interrupts();
        assert!(!StubArch::interrupts_enabled());
        StubArch::enable_interrupts();
        assert!(StubArch::interrupts_enabled());
    }
}
