//! Priority donation for the strict-priority policy.
//!
//! A high-priority thread blocked on a lock would otherwise wait behind the
//! holder's low priority: every thread between them would run first. The fix
//! is to donate: the holder's effective priority is raised to its highest
//! waiter's, transitively along the chain of `wanted_lock` links when the
//! holder is itself blocked acquiring something. Donations are shed when the
//! lock is released and the holder recomputes from its base priority.

use crate::intr;
use crate::list;
use crate::sched::{self, thread_less};
use crate::sync::Lock;
use crate::thread::Thread;
use core::ptr;

/// Recompute `t`'s effective priority and propagate it down its donation
/// chain.
///
/// The new effective priority is the maximum of `t`'s base priority, the
/// caller-supplied `hint` (an acquirer's priority not yet queued on any
/// waiter list, or a fresh base from `set_priority`), and the front waiter
/// of every lock `t` holds. If `t` sits in a sorted queue its position is
/// repaired in place. The chain walk then raises each dominated holder in
/// turn, stopping at the first holder that already dominates its donor; the
/// chain is acyclic, so the walk terminates.
///
/// No-op under the feedback-queue policy, which has no donation.
///
/// # Safety
///
/// `t` must be null or a live TCB; every lock and thread reachable through
/// waiter lists and `wanted_lock` links must be live.
pub(crate) unsafe fn refresh(t: *mut Thread, hint: i32) {
    if sched::mlfqs_enabled() || t.is_null() {
        return;
    }
    unsafe {
        let old = intr::disable();

        (*t).priority = (*t).base_priority;
        if hint > (*t).priority {
            (*t).priority = hint;
        }
        let mut e = (*t).held_locks.begin();
        while e != (*t).held_locks.end() {
            let l = Lock::from_elem(e);
            let waiters = &(*l).semaphore.waiters;
            if !waiters.is_empty() {
                let w = Thread::from_elem(waiters.front());
                if (*w).priority > (*t).priority {
                    (*t).priority = (*w).priority;
                }
            }
            e = (*e).next;
        }

        // The running thread sits in no queue; anything else is linked in
        // the ready queue or a waiter list, both sorted.
        if t != sched::current_ptr() {
            list::reorder(&mut (*t).elem, thread_less);
        }

        let mut l = (*t).wanted_lock;
        let mut donor = t;
        while !l.is_null() {
            let holder = (*l).holder;
            if holder.is_null() {
                // The lock was just released; its front waiter owns it as
                // soon as it runs.
                break;
            }
            if (*holder).priority < (*donor).priority {
                (*holder).priority = (*donor).priority;
                list::reorder(&mut (*holder).elem, thread_less);
                donor = holder;
                l = (*holder).wanted_lock;
            } else {
                l = ptr::null_mut();
            }
        }

        intr::set_level(old);
    }
}
