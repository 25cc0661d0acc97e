//! Scheduler core: the ready queue, thread lifecycle, tick bookkeeping, and
//! the context-switch sequencer.
//!
//! One thread runs at a time. Every other live thread is Ready (queued),
//! Blocked (waiting for an [`unblock`]), or Dying (waiting for its successor
//! to reclaim its page). Two policies are selectable at boot:
//!
//! - **Priority round-robin** (default): the ready queue is kept sorted by
//!   descending effective priority; equal priorities run in FIFO order.
//!   Locks donate priority through [`donation`].
//! - **Multilevel feedback queue** (`init(true)`): priorities are recomputed
//!   from per-thread recent CPU usage and the system load average; the ready
//!   queue is unordered with a cached highest-priority member. See
//!   [`mlfqs`].
//!
//! All mutation of scheduler state happens inside interrupts-off critical
//! sections; see [`crate::intr`].

pub(crate) mod donation;
pub(crate) mod mlfqs;

use crate::arch::{Arch, DefaultArch as A};
use crate::errors::{CreateError, CreateResult};
use crate::fixed::Fixed;
use crate::intr::{self, Level};
use crate::list::{self, List, ListElem};
use crate::mem;
use crate::thread::{
    alloc_frame, kernel_thread, EntryFrame, FirstDispatchFrame, SwitchFrame, Thread, ThreadFunc,
    ThreadStatus, Tid, PRI_DEFAULT, PRI_MAX, PRI_MIN,
};
use crate::time;
use core::cell::UnsafeCell;
use core::ffi::c_void;
use core::ptr::{self, NonNull};
use portable_atomic::{AtomicBool, AtomicI32, Ordering};

/// Timer ticks a thread may run before a round-robin preemption is
/// requested (feedback-queue policy).
pub const TIME_SLICE: u32 = 4;

/// Mutable scheduler state. A single instance lives in [`SCHED`]; every
/// access happens with interrupts disabled, which is the only mutual
/// exclusion a single CPU needs.
pub(crate) struct Sched {
    /// Threads eligible to run. Sorted descending by priority under the
    /// donation policy; unordered under the feedback-queue policy.
    pub(crate) ready: List,
    /// Every live thread, linked through `Thread::all_elem`.
    pub(crate) all: List,
    /// The one Running thread.
    pub(crate) running: *mut Thread,
    /// The idle thread, scheduled only when `ready` is empty.
    pub(crate) idle: *mut Thread,
    /// Feedback-queue cache: highest-priority member of `ready`, or null
    /// when `ready` is empty.
    pub(crate) min_ready: *mut Thread,
    /// System load average (feedback-queue policy).
    pub(crate) load_avg: Fixed,
    /// Ticks since the last dispatch; reset by the switch tail.
    pub(crate) slice_ticks: u32,
    idle_ticks: i64,
    busy_ticks: i64,
    /// The boot thread's TCB. Statically placed, so the switch tail must
    /// never hand it to the page allocator.
    boot_thread: Thread,
    /// Called from the switch tail when an embedder has address spaces to
    /// activate.
    activate_hook: Option<fn()>,
}

struct SchedCell(UnsafeCell<Sched>);

// Single CPU; interrupts-off sections serialize every access.
unsafe impl Sync for SchedCell {}

static SCHED: SchedCell = SchedCell(UnsafeCell::new(Sched {
    ready: List::new(),
    all: List::new(),
    running: ptr::null_mut(),
    idle: ptr::null_mut(),
    min_ready: ptr::null_mut(),
    load_avg: Fixed::ZERO,
    slice_ticks: 0,
    idle_ticks: 0,
    busy_ticks: 0,
    boot_thread: Thread::empty(),
    activate_hook: None,
}));

static MLFQS: AtomicBool = AtomicBool::new(false);
static NEXT_TID: AtomicI32 = AtomicI32::new(1);

/// Whether the multilevel-feedback-queue policy was selected at boot.
pub fn mlfqs_enabled() -> bool {
    MLFQS.load(Ordering::Acquire)
}

pub(crate) unsafe fn sched() -> &'static mut Sched {
    unsafe { &mut *SCHED.0.get() }
}

fn allocate_tid() -> Tid {
    Tid(NEXT_TID.fetch_add(1, Ordering::AcqRel))
}

/// Sort threads descending by effective priority. Both arguments must be
/// the `elem` nodes of live threads.
pub(crate) fn thread_less(a: *const ListElem, b: *const ListElem) -> bool {
    unsafe {
        (*Thread::from_elem(a as *mut ListElem)).priority
            > (*Thread::from_elem(b as *mut ListElem)).priority
    }
}

/// Initialize the scheduler, transforming the running code into the first
/// thread. Must be called with interrupts off, before any other scheduler
/// operation; `mlfqs` selects the policy for the lifetime of the system.
pub fn init(mlfqs: bool) {
    assert_eq!(intr::get_level(), Level::Off);
    MLFQS.store(mlfqs, Ordering::Release);
    unsafe {
        let s = sched();
        s.ready.init();
        s.all.init();
        s.running = ptr::null_mut();
        s.idle = ptr::null_mut();
        s.min_ready = ptr::null_mut();
        s.load_avg = Fixed::ZERO;
        s.slice_ticks = 0;
        s.idle_ticks = 0;
        s.busy_ticks = 0;
        s.activate_hook = None;

        let boot = &mut s.boot_thread as *mut Thread;
        Thread::init(boot, "main", PRI_DEFAULT, mlfqs);
        (*boot).tid = allocate_tid();
        (*boot).status = ThreadStatus::Running;
        s.all.push_back(&mut (*boot).all_elem);
        s.running = boot;
    }
    log::debug!(
        "scheduler initialized, policy: {}",
        if mlfqs { "mlfqs" } else { "priority" }
    );
}

/// Start preemptive scheduling: create and register the idle thread, then
/// enable interrupts. The idle thread is registered before interrupts come
/// on, so selection can fall back to it as soon as anything blocks.
pub fn start() {
    let tid = create("idle", PRI_MIN, idle, ptr::null_mut())
        .expect("no page for the idle thread");
    let idle_ptr = lookup(tid).expect("idle thread vanished") as *const Thread as *mut Thread;
    let old = intr::disable();
    unsafe {
        sched().idle = idle_ptr;
    }
    intr::set_level(old);

    intr::enable();
    log::debug!("preemptive scheduling started");
}

/// The idle thread. Sits in the ready queue only until its first dispatch;
/// after that [`next_thread_to_run`] returns it directly when the queue is
/// empty, bypassing [`unblock`], so it blocks itself right back every time
/// it runs.
fn idle(_aux: *mut c_void) {
    loop {
        intr::disable();
        block();
        A::idle_wait();
    }
}

/// The running thread's TCB pointer, with validity checks.
pub(crate) fn current_ptr() -> *mut Thread {
    let t = unsafe { sched().running };
    unsafe {
        // A magic mismatch here means the thread's stack grew into its TCB.
        assert!(Thread::is_valid(t), "running thread TCB corrupt");
        assert_eq!((*t).status, ThreadStatus::Running);
    }
    t
}

/// The boot thread; its storage predates the page allocator.
pub(crate) fn initial_ptr() -> *mut Thread {
    unsafe { &mut sched().boot_thread }
}

/// The running thread.
pub fn current() -> &'static Thread {
    unsafe { &*current_ptr() }
}

/// The running thread's tid.
pub fn current_tid() -> Tid {
    current().tid()
}

/// The running thread's name.
pub fn name() -> &'static str {
    current().name()
}

/// Create a kernel thread executing `function(aux)` and add it to the ready
/// queue. The new thread may be scheduled, and may even have exited, before
/// `create` returns; use a semaphore to impose ordering.
///
/// Under the feedback-queue policy the requested `priority` is ignored and
/// the thread inherits its creator's nice and decayed recent-CPU instead
/// (unless the creator is the boot thread).
pub fn create(
    name: &str,
    priority: i32,
    function: ThreadFunc,
    aux: *mut c_void,
) -> CreateResult<Tid> {
    assert!((PRI_MIN..=PRI_MAX).contains(&priority));

    let page = mem::alloc_zeroed_page().ok_or(CreateError::OutOfMemory)?;
    let t = page.as_ptr() as *mut Thread;
    unsafe {
        Thread::init(t, name, priority, mlfqs_enabled());
        let tid = allocate_tid();
        (*t).tid = tid;

        let old = intr::disable();
        sched().all.push_back(&mut (*t).all_elem);

        // Pre-built frames, innermost first: the first switch into this
        // thread unwinds switch frame -> first-dispatch stub -> trampoline.
        let ef: *mut EntryFrame = alloc_frame(t);
        (*ef).ret = 0;
        (*ef).function = function;
        (*ef).aux = aux;

        let df: *mut FirstDispatchFrame = alloc_frame(t);
        (*df).ret = kernel_thread as usize;

        let sf: *mut SwitchFrame = alloc_frame(t);
        (*sf).ret = A::switch_entry();
        (*sf).fp = 0;
        intr::set_level(old);

        if mlfqs_enabled() {
            let cur = current_ptr();
            if !ptr::eq(cur, initial_ptr()) {
                let s = sched();
                (*t).nice = (*cur).nice;
                (*t).recent_cpu = mlfqs::recent_cpu_next(s, cur);
                (*t).priority = mlfqs::priority_for(t);
            }
        }

        log::trace!("created thread {tid} '{}'", (*t).name());
        unblock(t);
        swap_to_highest();
        Ok(tid)
    }
}

/// Put the running thread to sleep until some other thread calls
/// [`unblock`] on it. Must be called with interrupts off; the
/// synchronization primitives in [`crate::sync`] are usually the better
/// interface.
pub fn block() {
    assert!(!intr::in_external());
    assert_eq!(intr::get_level(), Level::Off);
    unsafe {
        (*current_ptr()).status = ThreadStatus::Blocked;
        schedule();
    }
}

/// Transition a Blocked thread to Ready.
///
/// Does not preempt the running thread: a caller that unblocked a
/// higher-priority thread invokes [`swap_to_highest`] itself, which lets it
/// first finish updating its own state atomically.
///
/// # Safety
///
/// `t` must point at a live, Blocked TCB.
pub unsafe fn unblock(t: *mut Thread) {
    unsafe {
        assert!(Thread::is_valid(t));
        let old = intr::disable();
        assert_eq!((*t).status, ThreadStatus::Blocked);
        ready_insert(t);
        (*t).status = ThreadStatus::Ready;
        intr::set_level(old);
    }
}

/// Queue `t` according to the active policy. The feedback-queue policy
/// appends and refreshes the min-cache against the newcomer; the donation
/// policy inserts in sorted position.
unsafe fn ready_insert(t: *mut Thread) {
    unsafe {
        let s = sched();
        if mlfqs_enabled() {
            s.ready.push_back(&mut (*t).elem);
            if s.min_ready.is_null() || (*t).priority > (*s.min_ready).priority {
                s.min_ready = t;
            }
        } else {
            s.ready.insert_ordered(&mut (*t).elem, thread_less);
        }
    }
}

/// Yield the CPU. The running thread stays runnable and may be rescheduled
/// immediately.
pub fn yield_now() {
    assert!(!intr::in_external());
    let cur = current_ptr();
    let old = intr::disable();
    unsafe {
        if cur != sched().idle {
            ready_insert(cur);
        }
        (*cur).status = ThreadStatus::Ready;
        schedule();
    }
    intr::set_level(old);
}

/// Deschedule and destroy the running thread. Its page is reclaimed by the
/// next thread to run, in [`schedule_tail`]; the outgoing stack cannot free
/// itself.
pub fn exit() -> ! {
    assert!(!intr::in_external());
    let cur = current_ptr();
    unsafe {
        log::trace!("thread {} '{}' exiting", (*cur).tid, (*cur).name());
        intr::disable();
        list::remove(&mut (*cur).all_elem);
        (*cur).status = ThreadStatus::Dying;
        schedule();
    }
    unreachable!("dying thread was rescheduled");
}

/// Yield to a strictly higher-priority ready thread, if one exists. From an
/// external handler the yield is deferred to handler return.
pub fn swap_to_highest() {
    let old = intr::disable();
    let mut preempt = false;
    unsafe {
        let s = sched();
        if !s.ready.is_empty() {
            let top = if mlfqs_enabled() {
                s.min_ready
            } else {
                Thread::from_elem(s.ready.front())
            };
            if !top.is_null() && (*current_ptr()).priority < (*top).priority {
                preempt = true;
            }
        }
    }
    intr::set_level(old);
    if preempt {
        if intr::in_external() {
            intr::yield_on_return();
        } else {
            yield_now();
        }
    }
}

/// Per-tick bookkeeping, called by the platform timer's interrupt handler
/// (inside [`intr::external_enter`] / [`intr::external_exit`]) once per
/// tick.
pub fn on_tick() {
    assert!(intr::in_external());
    let now = time::TICKS.increment();
    let cur = current_ptr();
    unsafe {
        let s = sched();
        if cur == s.idle {
            s.idle_ticks += 1;
        } else {
            s.busy_ticks += 1;
        }
        s.slice_ticks += 1;

        if mlfqs_enabled() {
            mlfqs::on_tick(s, cur, now);
        }

        // Strictly higher priority preempts by the end of the tick.
        if !s.ready.is_empty() {
            let top = if mlfqs_enabled() {
                s.min_ready
            } else {
                Thread::from_elem(s.ready.front())
            };
            if !top.is_null() && (*cur).priority < (*top).priority {
                intr::yield_on_return();
            }
        }
    }
}

/// Log tick statistics.
pub fn print_stats() {
    let old = intr::disable();
    let (idle_ticks, busy_ticks) = unsafe {
        let s = sched();
        (s.idle_ticks, s.busy_ticks)
    };
    intr::set_level(old);
    log::info!("threads: {idle_ticks} idle ticks, {busy_ticks} kernel ticks");
}

/// Register a hook run from the switch tail, for embedders that activate an
/// address space per thread.
pub fn set_activate_hook(hook: fn()) {
    let old = intr::disable();
    unsafe {
        sched().activate_hook = Some(hook);
    }
    intr::set_level(old);
}

/// Apply `f` to every live thread. Interrupts must be off.
pub fn foreach<F: FnMut(&mut Thread)>(mut f: F) {
    assert_eq!(intr::get_level(), Level::Off);
    unsafe {
        let s = sched();
        let mut e = s.all.begin();
        while e != s.all.end() {
            let t = Thread::from_all_elem(e);
            e = (*e).next;
            f(&mut *t);
        }
    }
}

/// Find a live thread by tid.
pub fn lookup(tid: Tid) -> Option<&'static Thread> {
    let old = intr::disable();
    let mut found: *mut Thread = ptr::null_mut();
    unsafe {
        let s = sched();
        let mut e = s.all.begin();
        while e != s.all.end() {
            let t = Thread::from_all_elem(e);
            if (*t).tid == tid {
                found = t;
                break;
            }
            e = (*e).next;
        }
    }
    intr::set_level(old);
    if found.is_null() {
        None
    } else {
        Some(unsafe { &*found })
    }
}

/// Set the running thread's base priority and recompute its effective
/// priority; donations from waiters on held locks are preserved. Yields if
/// the thread no longer has the highest priority. No-op under the
/// feedback-queue policy.
pub fn set_priority(new_priority: i32) {
    if mlfqs_enabled() {
        return;
    }
    assert!(!intr::in_external());
    assert!((PRI_MIN..=PRI_MAX).contains(&new_priority));
    let old = intr::disable();
    unsafe {
        let cur = current_ptr();
        (*cur).base_priority = new_priority;
        donation::refresh(cur, new_priority);
    }
    intr::set_level(old);
    swap_to_highest();
}

/// The running thread's effective priority.
pub fn get_priority() -> i32 {
    current().priority()
}

/// Set the running thread's nice value and recompute its recent-CPU and
/// priority, yielding if it no longer has the highest priority. Only
/// meaningful under the feedback-queue policy.
pub fn set_nice(nice: i32) {
    if !mlfqs_enabled() {
        return;
    }
    assert!(!intr::in_external());
    assert!((-20..=20).contains(&nice));
    let old = intr::disable();
    unsafe {
        let cur = current_ptr();
        let s = sched();
        (*cur).nice = nice;
        (*cur).recent_cpu = mlfqs::recent_cpu_next(s, cur);
        (*cur).priority = mlfqs::priority_for(cur);
    }
    intr::set_level(old);
    swap_to_highest();
}

/// The running thread's nice value.
pub fn get_nice() -> i32 {
    current().nice()
}

/// 100 times the system load average, rounded to the nearest integer.
pub fn get_load_avg() -> i32 {
    let old = intr::disable();
    let v = unsafe { (sched().load_avg * 100).round() };
    intr::set_level(old);
    v
}

/// 100 times the running thread's recent-CPU estimate, rounded to the
/// nearest integer.
pub fn get_recent_cpu() -> i32 {
    let old = intr::disable();
    let v = unsafe { ((*current_ptr()).recent_cpu * 100).round() };
    intr::set_level(old);
    v
}

/// Pick the next thread to run: the queued thread with the highest
/// priority, or the idle thread when the queue is empty.
unsafe fn next_thread_to_run(s: &mut Sched) -> *mut Thread {
    unsafe {
        if s.ready.is_empty() {
            assert!(!s.idle.is_null(), "ready queue empty before start()");
            return s.idle;
        }
        if mlfqs_enabled() {
            let top = s.min_ready;
            debug_assert!(!top.is_null());
            list::remove(&mut (*top).elem);
            s.min_ready = if s.ready.is_empty() {
                ptr::null_mut()
            } else {
                Thread::from_elem(s.ready.min(thread_less))
            };
            top
        } else {
            Thread::from_elem(s.ready.pop_front())
        }
    }
}

/// Switch to the next thread. At entry interrupts are off and the running
/// thread's status has already been changed away from Running; this is the
/// only place the running TCB reference changes.
pub(crate) unsafe fn schedule() {
    unsafe {
        let s = sched();
        let cur = s.running;
        let next = next_thread_to_run(s);

        assert_eq!(intr::get_level(), Level::Off);
        assert_ne!((*cur).status, ThreadStatus::Running);
        assert!(Thread::is_valid(next));

        let mut prev: *mut Thread = ptr::null_mut();
        if cur != next {
            s.running = next;
            prev = A::switch_threads(cur, next);
        }
        schedule_tail(prev);
    }
}

/// Complete a switch on the incoming thread's stack: mark it Running, start
/// a fresh quantum, activate its address space, and reclaim the outgoing
/// thread's page if it was Dying.
///
/// Invoked by [`schedule`] as its final action, and by the port's
/// first-dispatch stub the first time a thread runs. The boot thread is
/// never freed here; its storage was not obtained from the page allocator.
///
/// # Safety
///
/// Must run with interrupts off, on the stack of the thread the scheduler
/// just switched to. `prev` is either null or the thread switched away
/// from.
pub unsafe fn schedule_tail(prev: *mut Thread) {
    unsafe {
        let s = sched();
        let cur = s.running;

        assert_eq!(intr::get_level(), Level::Off);

        (*cur).status = ThreadStatus::Running;
        s.slice_ticks = 0;

        if let Some(hook) = s.activate_hook {
            hook();
        }

        if !prev.is_null()
            && (*prev).status == ThreadStatus::Dying
            && !ptr::eq(prev, &s.boot_thread)
        {
            assert!(prev != cur);
            mem::free_page(NonNull::new_unchecked(prev.cast()));
        }
    }
}
