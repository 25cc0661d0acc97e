//! 4.4BSD multilevel-feedback-queue policy.
//!
//! Nobody sets priorities by hand; they fall out of two estimators that the
//! timer tick drives:
//!
//! - `recent_cpu`, an exponentially weighted amount of CPU time each thread
//!   has received recently: +1 per tick while running, decayed once a
//!   second by `(2*load_avg) / (2*load_avg + 1)` and re-biased by `nice`.
//! - `load_avg`, an exponentially weighted count of runnable threads:
//!   `load_avg = (59/60)*load_avg + (1/60)*ready_threads` once a second,
//!   giving a time constant of about a minute.
//!
//! Every four ticks each thread's priority is recomputed as
//! `PRI_MAX - recent_cpu/4 - 2*nice`, clamped to the priority range, and
//! the ready queue's min-cache is rescanned since any ready thread's
//! priority may have moved.

use crate::fixed::Fixed;
use crate::intr;
use crate::sched::{thread_less, Sched, TIME_SLICE};
use crate::thread::{Thread, PRI_MAX, PRI_MIN};
use crate::time::TIMER_FREQ;
use spin::Lazy;

/// Ticks between bulk priority refreshes.
const PRIORITY_REFRESH_TICKS: i64 = 4;

static LOAD_C1: Lazy<Fixed> = Lazy::new(|| Fixed::from_int(59) / Fixed::from_int(60));
static LOAD_C2: Lazy<Fixed> = Lazy::new(|| Fixed::from_int(1) / Fixed::from_int(60));

/// `PRI_MAX - recent_cpu/4 - 2*nice`, clamped. The fixed-point quarter is
/// truncated toward zero, negative recent-CPU included.
pub(crate) unsafe fn priority_for(t: *const Thread) -> i32 {
    unsafe {
        let p = PRI_MAX - ((*t).recent_cpu / 4).trunc() - (*t).nice * 2;
        p.clamp(PRI_MIN, PRI_MAX)
    }
}

/// One decay step of the recent-CPU estimator.
pub(crate) fn decay(load_avg: Fixed, recent_cpu: Fixed, nice: i32) -> Fixed {
    let load2 = load_avg * 2;
    (load2 / (load2 + 1)) * recent_cpu + nice
}

/// `t`'s recent-CPU after a decay step under the current load average.
/// Also the value a new thread inherits from its creator.
pub(crate) unsafe fn recent_cpu_next(s: &Sched, t: *const Thread) -> Fixed {
    unsafe { decay(s.load_avg, (*t).recent_cpu, (*t).nice) }
}

/// Next load average: counts ready threads plus the running thread when it
/// is not the idle thread.
fn load_avg_next(s: &Sched) -> Fixed {
    let mut ready = s.ready.len() as i32;
    if s.running != s.idle {
        ready += 1;
    }
    *LOAD_C1 * s.load_avg + *LOAD_C2 * ready
}

/// Rescan the ready queue for its highest-priority member. Leaves a stale
/// cache untouched when the queue is empty; selection nulls it on the
/// removal that empties the queue.
pub(crate) unsafe fn refresh_min_cache(s: &mut Sched) {
    unsafe {
        if !s.ready.is_empty() {
            s.min_ready = Thread::from_elem(s.ready.min(thread_less));
        }
    }
}

unsafe fn refresh_all_recent_cpu(s: &mut Sched) {
    unsafe {
        let mut e = s.all.begin();
        while e != s.all.end() {
            let t = Thread::from_all_elem(e);
            if t != s.idle {
                (*t).recent_cpu = decay(s.load_avg, (*t).recent_cpu, (*t).nice);
            }
            e = (*e).next;
        }
    }
}

unsafe fn refresh_all_priorities(s: &mut Sched) {
    unsafe {
        let mut e = s.all.begin();
        while e != s.all.end() {
            let t = Thread::from_all_elem(e);
            if t != s.idle {
                (*t).priority = priority_for(t);
            }
            e = (*e).next;
        }
    }
}

/// Per-tick estimator updates, run from the timer interrupt.
pub(crate) unsafe fn on_tick(s: &mut Sched, cur: *mut Thread, now: i64) {
    unsafe {
        if cur != s.idle {
            (*cur).recent_cpu += Fixed::ONE;
        }
        if now % TIMER_FREQ == 0 {
            s.load_avg = load_avg_next(s);
            refresh_all_recent_cpu(s);
        }
        if now % PRIORITY_REFRESH_TICKS == 0 {
            refresh_all_priorities(s);
            refresh_min_cache(s);
        }
        if s.slice_ticks % TIME_SLICE == 0 {
            intr::yield_on_return();
        }
    }
}
