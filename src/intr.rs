//! Interrupt-level guard.
//!
//! On a single CPU, disabling interrupt delivery is the scheduler's only
//! mutual exclusion: every mutation of shared scheduler state happens inside
//! a save/disable/mutate/restore bracket. The bracket always restores the
//! *saved* level rather than enabling unconditionally, so critical sections
//! nest without a counter.
//!
//! The module also tracks whether execution is currently inside an external
//! interrupt handler, and carries the handler's deferred-yield request: an
//! ISR may not block, so preemption decisions made at tick time are acted on
//! when the handler unwinds through [`external_exit`].

use crate::arch::{Arch, DefaultArch as A};
use portable_atomic::{AtomicBool, Ordering};

/// Whether interrupts are deliverable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    /// Interrupts disabled.
    Off,
    /// Interrupts enabled.
    On,
}

static IN_EXTERNAL: AtomicBool = AtomicBool::new(false);
static YIELD_ON_RETURN: AtomicBool = AtomicBool::new(false);

/// Current interrupt level.
pub fn get_level() -> Level {
    if A::interrupts_enabled() {
        Level::On
    } else {
        Level::Off
    }
}

/// Enable interrupts and return the previous level.
///
/// Handlers must not enable interrupts; they run to completion instead.
pub fn enable() -> Level {
    assert!(
        !in_external(),
        "interrupts may not be enabled inside an external handler"
    );
    let old = get_level();
    A::enable_interrupts();
    old
}

/// Disable interrupts and return the previous level.
pub fn disable() -> Level {
    let old = get_level();
    A::disable_interrupts();
    old
}

/// Restore a previously saved level.
pub fn set_level(level: Level) -> Level {
    match level {
        Level::On => enable(),
        Level::Off => disable(),
    }
}

/// Whether execution is inside an external interrupt handler.
pub fn in_external() -> bool {
    IN_EXTERNAL.load(Ordering::Acquire)
}

/// Request a yield when the current external handler returns.
///
/// Handlers cannot yield directly; the switch happens in [`external_exit`]
/// once handler context has been left.
pub fn yield_on_return() {
    assert!(in_external());
    YIELD_ON_RETURN.store(true, Ordering::Release);
}

/// Mark entry into an external interrupt handler.
///
/// The embedder's ISR wraps its body in [`external_enter`] / [`external_exit`].
/// Interrupts must already be off (the CPU masked them on entry).
pub fn external_enter() {
    assert_eq!(get_level(), Level::Off);
    assert!(!in_external(), "external handlers do not nest");
    IN_EXTERNAL.store(true, Ordering::Release);
}

/// Mark exit from an external interrupt handler and perform a deferred
/// yield if one was requested during the handler.
pub fn external_exit() {
    assert!(in_external());
    IN_EXTERNAL.store(false, Ordering::Release);
    if YIELD_ON_RETURN.swap(false, Ordering::AcqRel) {
        crate::sched::yield_now();
    }
}

#[cfg(test)]
pub(crate) fn reset_for_tests() {
    IN_EXTERNAL.store(false, Ordering::Release);
    YIELD_ON_RETURN.store(false, Ordering::Release);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;

    #[test]
    fn disable_restore_nests() {
        let _guard = testutil::serialize();
        reset_for_tests();
        A::enable_interrupts();

        let outer = disable();
        assert_eq!(outer, Level::On);
        assert_eq!(get_level(), Level::Off);

        let inner = disable();
        assert_eq!(inner, Level::Off);
        set_level(inner);
        // Restoring the inner save must not re-enable.
        assert_eq!(get_level(), Level::Off);

        set_level(outer);
        assert_eq!(get_level(), Level::On);
    }

    #[test]
    fn external_bracket_tracks_context() {
        let _guard = testutil::serialize();
        reset_for_tests();
        A::enable_interrupts();

        assert!(!in_external());
        disable();
        external_enter();
        assert!(in_external());
        external_exit();
        assert!(!in_external());
        enable();
    }
}
