//! Synchronization primitives built on the scheduler: semaphores, locks,
//! and condition variables.
//!
//! All three keep their waiter bookkeeping in intrusive lists ordered by
//! thread priority, so waking always picks the most urgent waiter. Locks
//! additionally participate in priority donation: acquiring a held lock
//! pushes the acquirer's priority onto the holder (transitively), and
//! releasing sheds it. See [`crate::sched::donation`].
//!
//! Because the embedded lists are self-referential, each primitive is
//! constructed in two steps: a `const fn new` for placement (including in
//! statics) and an `init` call at its final address before first use.

use crate::container_of;
use crate::intr;
use crate::list::{self, List, ListElem};
use crate::sched::{self, thread_less};
use crate::thread::Thread;
use core::ptr;

/// Counting semaphore.
///
/// `down` waits for the value to become positive and decrements it; `up`
/// increments it and wakes the highest-priority waiter. `up` is the one
/// primitive operation an interrupt handler may call.
pub struct Semaphore {
    pub(crate) value: u32,
    pub(crate) waiters: List,
}

impl Semaphore {
    pub const fn new(value: u32) -> Semaphore {
        Semaphore {
            value,
            waiters: List::new(),
        }
    }

    /// Link the waiter list. Must run at the semaphore's final address
    /// before first use.
    pub fn init(&mut self) {
        self.waiters.init();
    }

    /// Wait until the value is positive, then decrement it atomically.
    pub fn down(&mut self) {
        assert!(!intr::in_external());
        let old = intr::disable();
        unsafe {
            while self.value == 0 {
                let cur = sched::current_ptr();
                self.waiters
                    .insert_ordered(&mut (*cur).elem, thread_less);
                sched::block();
            }
        }
        self.value -= 1;
        intr::set_level(old);
    }

    /// Decrement the value if it is positive, without waiting.
    pub fn try_down(&mut self) -> bool {
        let old = intr::disable();
        let ok = self.value > 0;
        if ok {
            self.value -= 1;
        }
        intr::set_level(old);
        ok
    }

    /// Increment the value and wake the highest-priority waiter, yielding
    /// to it if it outranks the running thread.
    pub fn up(&mut self) {
        let old = intr::disable();
        unsafe {
            if !self.waiters.is_empty() {
                let e = self.waiters.pop_front();
                sched::unblock(Thread::from_elem(e));
            }
        }
        self.value += 1;
        intr::set_level(old);
        sched::swap_to_highest();
    }
}

/// Mutual exclusion lock: a binary semaphore with an owner.
///
/// Only the holder may release. Under the donation policy a held lock
/// carries its waiters' priority to the holder; the lock's `elem` links it
/// into the holder's held-locks list for the recomputation on release.
pub struct Lock {
    pub(crate) holder: *mut Thread,
    pub(crate) semaphore: Semaphore,
    pub(crate) elem: ListElem,
}

impl Lock {
    pub const fn new() -> Lock {
        Lock {
            holder: ptr::null_mut(),
            semaphore: Semaphore::new(1),
            elem: ListElem::new(),
        }
    }

    /// Must run at the lock's final address before first use.
    pub fn init(&mut self) {
        self.holder = ptr::null_mut();
        self.semaphore = Semaphore::new(1);
        self.semaphore.init();
    }

    /// Whether the running thread holds this lock.
    pub fn held_by_current_thread(&self) -> bool {
        ptr::eq(self.holder, sched::current_ptr())
    }

    /// Acquire the lock, sleeping until it is available. If the lock is
    /// held, the acquirer's priority is donated down the holder chain
    /// before sleeping.
    pub fn acquire(&mut self) {
        assert!(!intr::in_external());
        assert!(!self.held_by_current_thread());

        let cur = sched::current_ptr();
        let old = intr::disable();
        unsafe {
            if !sched::mlfqs_enabled() && !self.holder.is_null() {
                (*cur).wanted_lock = self;
                sched::donation::refresh(self.holder, (*cur).priority);
            }
            self.semaphore.down();
            (*cur).wanted_lock = ptr::null_mut();
            self.holder = cur;
            if !sched::mlfqs_enabled() {
                (*cur).held_locks.push_back(&mut self.elem);
            }
        }
        intr::set_level(old);
    }

    /// Acquire the lock only if it is free.
    pub fn try_acquire(&mut self) -> bool {
        assert!(!intr::in_external());
        assert!(!self.held_by_current_thread());

        let ok = self.semaphore.try_down();
        if ok {
            let cur = sched::current_ptr();
            self.holder = cur;
            if !sched::mlfqs_enabled() {
                unsafe {
                    (*cur).held_locks.push_back(&mut self.elem);
                }
            }
        }
        ok
    }

    /// Release the lock: wake the highest-priority waiter, shed any
    /// donations received through this lock, and yield if a waiter now
    /// outranks the releasing thread.
    pub fn release(&mut self) {
        assert!(self.held_by_current_thread());

        let cur = sched::current_ptr();
        let old = intr::disable();
        unsafe {
            self.holder = ptr::null_mut();
            if !sched::mlfqs_enabled() {
                list::remove(&mut self.elem);
            }
            self.semaphore.up();
            if !sched::mlfqs_enabled() {
                sched::donation::refresh(cur, (*cur).base_priority);
            }
        }
        intr::set_level(old);
        sched::swap_to_highest();
    }

    /// Map a held-locks list node back to its lock.
    ///
    /// # Safety
    ///
    /// `e` must be the `elem` field of a live `Lock`.
    pub(crate) unsafe fn from_elem(e: *mut ListElem) -> *mut Lock {
        unsafe { container_of!(e, Lock, elem) }
    }
}

/// One queued waiter of a condition variable. Lives on the waiting
/// thread's stack for the duration of the wait; its private semaphore is
/// the wakeup channel.
#[repr(C)]
pub(crate) struct CondWaiter {
    pub(crate) elem: ListElem,
    pub(crate) sema: Semaphore,
    pub(crate) thread: *mut Thread,
}

impl CondWaiter {
    /// # Safety
    ///
    /// `e` must be the `elem` field of a live `CondWaiter`.
    pub(crate) unsafe fn from_elem(e: *mut ListElem) -> *mut CondWaiter {
        unsafe { container_of!(e, CondWaiter, elem) }
    }
}

/// Waiters compare by their thread's priority at the moment of the scan,
/// highest first, so `signal` picks up donations received mid-wait. Both
/// arguments must be the `elem` nodes of live waiters.
fn waiter_less(a: *const ListElem, b: *const ListElem) -> bool {
    unsafe {
        let ta = (*CondWaiter::from_elem(a as *mut ListElem)).thread;
        let tb = (*CondWaiter::from_elem(b as *mut ListElem)).thread;
        (*ta).priority > (*tb).priority
    }
}

/// Condition variable. Always used with a lock held across `wait` and
/// `signal`; the monitor condition itself lives in the caller's state.
pub struct Condvar {
    pub(crate) waiters: List,
}

impl Condvar {
    pub const fn new() -> Condvar {
        Condvar {
            waiters: List::new(),
        }
    }

    /// Must run at the condvar's final address before first use.
    pub fn init(&mut self) {
        self.waiters.init();
    }

    /// Atomically release `lock` and sleep until signaled, then reacquire
    /// `lock` before returning.
    pub fn wait(&mut self, lock: &mut Lock) {
        assert!(!intr::in_external());
        assert!(lock.held_by_current_thread());

        let mut waiter = CondWaiter {
            elem: ListElem::new(),
            sema: Semaphore::new(0),
            thread: sched::current_ptr(),
        };
        waiter.sema.init();
        unsafe {
            self.waiters.push_back(&mut waiter.elem);
        }
        lock.release();
        waiter.sema.down();
        lock.acquire();
    }

    /// Wake the waiter whose thread currently has the highest priority, if
    /// any.
    pub fn signal(&mut self, lock: &mut Lock) {
        assert!(!intr::in_external());
        assert!(lock.held_by_current_thread());

        if !self.waiters.is_empty() {
            let e = self.waiters.min(waiter_less);
            unsafe {
                list::remove(e);
                (*CondWaiter::from_elem(e)).sema.up();
            }
        }
    }

    /// Wake every waiter.
    pub fn broadcast(&mut self, lock: &mut Lock) {
        while !self.waiters.is_empty() {
            self.signal(lock);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::{create, current, lookup};
    use crate::testutil;
    use crate::thread::{ThreadStatus, Tid};
    use alloc::boxed::Box;
    use core::ffi::c_void;

    fn noop(_aux: *mut c_void) {}

    fn thread_ptr(tid: Tid) -> *mut Thread {
        lookup(tid).unwrap() as *const Thread as *mut Thread
    }

    /// Park a ready thread on `sema`'s waiter list as `down` would.
    unsafe fn force_wait(sema: &mut Semaphore, t: *mut Thread) {
        unsafe {
            let old = intr::disable();
            list::remove(&mut (*t).elem);
            (*t).status = ThreadStatus::Blocked;
            sema.waiters
                .insert_ordered(&mut (*t).elem, thread_less);
            intr::set_level(old);
        }
    }

    #[test]
    fn semaphore_counts_without_contention() {
        let _g = testutil::boot(false);
        let mut sema = Semaphore::new(2);
        sema.init();
        assert!(sema.try_down());
        assert!(sema.try_down());
        assert!(!sema.try_down());
        sema.up();
        assert!(sema.try_down());
    }

    #[test]
    fn down_with_positive_value_does_not_block() {
        let _g = testutil::boot(false);
        let before = crate::sched::current_tid();
        let mut sema = Semaphore::new(1);
        sema.init();
        sema.down();
        assert_eq!(sema.value, 0);
        assert_eq!(crate::sched::current_tid(), before);
        assert!(sema.waiters.is_empty());
    }

    #[test]
    fn up_wakes_the_highest_priority_waiter() {
        let _g = testutil::boot(false);
        let mut sema = Semaphore::new(0);
        sema.init();
        let w1 = create("w1", 10, noop, core::ptr::null_mut()).unwrap();
        let w2 = create("w2", 20, noop, core::ptr::null_mut()).unwrap();
        unsafe {
            let w1 = thread_ptr(w1);
            let w2 = thread_ptr(w2);
            force_wait(&mut sema, w1);
            force_wait(&mut sema, w2);
            assert_eq!(Thread::from_elem(sema.waiters.front()), w2);

            sema.up();
            assert_eq!((*w2).status, ThreadStatus::Ready);
            assert_eq!((*w1).status, ThreadStatus::Blocked);
            assert_eq!(sema.waiters.len(), 1);
        }
    }

    #[test]
    fn lock_tracks_its_holder() {
        let _g = testutil::boot(false);
        let mut lock = Box::new(Lock::new());
        lock.init();
        assert!(!lock.held_by_current_thread());

        lock.acquire();
        assert!(lock.held_by_current_thread());
        unsafe {
            let cur = crate::sched::current_ptr();
            assert_eq!((*cur).held_locks.len(), 1);
            assert_eq!(Lock::from_elem((*cur).held_locks.front()), &mut *lock as *mut Lock);
        }

        lock.release();
        assert!(!lock.held_by_current_thread());
        assert!(lock.holder.is_null());
        unsafe {
            assert_eq!((*crate::sched::current_ptr()).held_locks.len(), 0);
        }
    }

    #[test]
    fn try_acquire_respects_ownership() {
        let _g = testutil::boot(false);
        let mut lock = Box::new(Lock::new());
        lock.init();
        assert!(lock.try_acquire());
        assert!(lock.held_by_current_thread());
        lock.release();
        assert!(lock.try_acquire());
        lock.release();
    }

    #[test]
    fn signal_wakes_the_most_urgent_waiter() {
        let _g = testutil::boot(false);
        let mut lock = Box::new(Lock::new());
        lock.init();
        let mut cond = Condvar::new();
        cond.init();

        let w1 = create("w1", 10, noop, core::ptr::null_mut()).unwrap();
        let w2 = create("w2", 20, noop, core::ptr::null_mut()).unwrap();
        let mut waiter1 = CondWaiter {
            elem: ListElem::new(),
            sema: Semaphore::new(0),
            thread: thread_ptr(w1),
        };
        let mut waiter2 = CondWaiter {
            elem: ListElem::new(),
            sema: Semaphore::new(0),
            thread: thread_ptr(w2),
        };
        waiter1.sema.init();
        waiter2.sema.init();

        lock.acquire();
        unsafe {
            cond.waiters.push_back(&mut waiter1.elem);
            cond.waiters.push_back(&mut waiter2.elem);
        }
        cond.signal(&mut lock);
        assert_eq!(waiter2.sema.value, 1);
        assert_eq!(waiter1.sema.value, 0);
        assert_eq!(cond.waiters.len(), 1);

        cond.broadcast(&mut lock);
        assert_eq!(waiter1.sema.value, 1);
        assert!(cond.waiters.is_empty());
        lock.release();
        assert_eq!(current().name(), "main");
    }
}
