//! Best-effort hardware transactional memory driver.
//!
//! On x86-64 with the `rtm` target feature this wraps the RTM instructions;
//! everywhere else `start` reports an explicit abort and `supported` returns
//! false, so the reclamation engine degrades permanently to its slow path.
//! Abort causes are counted per thread and folded into process-wide totals
//! when the thread tears down.

use std::cell::Cell;
use std::sync::atomic::{AtomicI64, Ordering};

use crate::atomics::atomic_add;

/// Abort status bits, mirroring the RTM status word layout.
pub const XABORT_EXPLICIT: u32 = 1 << 0;
pub const XABORT_RETRY: u32 = 1 << 1;
pub const XABORT_CONFLICT: u32 = 1 << 2;
pub const XABORT_CAPACITY: u32 = 1 << 3;
pub const XABORT_DEBUG: u32 = 1 << 4;
pub const XABORT_NESTED: u32 = 1 << 5;

/// Per-thread abort-cause counters.
///
/// Owned and mutated by a single thread; aggregated into the global totals
/// by [`thread_finish`].
#[derive(Default)]
pub struct ThreadData {
    pub n_xabort_explicit: Cell<i64>,
    pub n_xabort_retry: Cell<i64>,
    pub n_xabort_conflict: Cell<i64>,
    pub n_xabort_capacity: Cell<i64>,
    pub n_xabort_debug: Cell<i64>,
    pub n_xabort_nested: Cell<i64>,
    pub last_abort: Cell<u32>,
}

static G_EXPLICIT: AtomicI64 = AtomicI64::new(0);
static G_RETRY: AtomicI64 = AtomicI64::new(0);
static G_CONFLICT: AtomicI64 = AtomicI64::new(0);
static G_CAPACITY: AtomicI64 = AtomicI64::new(0);
static G_DEBUG: AtomicI64 = AtomicI64::new(0);
static G_NESTED: AtomicI64 = AtomicI64::new(0);

fn status_collect(data: &ThreadData, status: u32) {
    if status & XABORT_EXPLICIT != 0 {
        data.n_xabort_explicit.set(data.n_xabort_explicit.get() + 1);
    }
    if status & XABORT_RETRY != 0 {
        data.n_xabort_retry.set(data.n_xabort_retry.get() + 1);
    }
    if status & XABORT_CONFLICT != 0 {
        data.n_xabort_conflict.set(data.n_xabort_conflict.get() + 1);
    }
    if status & XABORT_CAPACITY != 0 {
        data.n_xabort_capacity.set(data.n_xabort_capacity.get() + 1);
    }
    if status & XABORT_DEBUG != 0 {
        data.n_xabort_debug.set(data.n_xabort_debug.get() + 1);
    }
    if status & XABORT_NESTED != 0 {
        data.n_xabort_nested.set(data.n_xabort_nested.get() + 1);
    }
}

/// Whether this build can start hardware transactions at all.
#[inline]
pub const fn supported() -> bool {
    cfg!(all(target_arch = "x86_64", target_feature = "rtm"))
}

/// Try to start a transaction. Returns `true` when the thread is now
/// executing transactionally; on abort the cause counters are updated and
/// `false` is returned.
#[inline]
pub fn start(data: &ThreadData) -> bool {
    #[cfg(all(target_arch = "x86_64", target_feature = "rtm"))]
    {
        const XBEGIN_STARTED: u32 = !0;
        let status = unsafe { core::arch::x86_64::_xbegin() };
        if status == XBEGIN_STARTED {
            return true;
        }
        data.last_abort.set(status);
        status_collect(data, status);
        false
    }
    #[cfg(not(all(target_arch = "x86_64", target_feature = "rtm")))]
    {
        data.last_abort.set(XABORT_EXPLICIT);
        status_collect(data, XABORT_EXPLICIT);
        false
    }
}

/// Commit the active transaction. Must only be called between a successful
/// [`start`] and the next abort.
#[inline]
pub fn commit() {
    #[cfg(all(target_arch = "x86_64", target_feature = "rtm"))]
    unsafe {
        core::arch::x86_64::_xend();
    }
}

/// Explicitly abort the active transaction because a node lock was observed
/// held. Control resumes at the matching [`start`], which reports
/// `XABORT_EXPLICIT`.
#[inline]
pub fn abort_lock_busy() {
    #[cfg(all(target_arch = "x86_64", target_feature = "rtm"))]
    unsafe {
        core::arch::x86_64::_xabort(123);
    }
    // Without RTM no transaction can be active, so there is nothing to abort.
}

/// Fold a thread's counters into the process-wide totals.
pub fn thread_finish(data: &ThreadData) {
    atomic_add(&G_EXPLICIT, data.n_xabort_explicit.get());
    atomic_add(&G_RETRY, data.n_xabort_retry.get());
    atomic_add(&G_CONFLICT, data.n_xabort_conflict.get());
    atomic_add(&G_CAPACITY, data.n_xabort_capacity.get());
    atomic_add(&G_DEBUG, data.n_xabort_debug.get());
    atomic_add(&G_NESTED, data.n_xabort_nested.get());
}

/// Snapshot of the process-wide abort totals.
#[derive(Debug, Clone, Copy, Default)]
pub struct Totals {
    pub explicit: i64,
    pub retry: i64,
    pub conflict: i64,
    pub capacity: i64,
    pub debug: i64,
    pub nested: i64,
}

pub fn totals() -> Totals {
    Totals {
        explicit: G_EXPLICIT.load(Ordering::SeqCst),
        retry: G_RETRY.load(Ordering::SeqCst),
        conflict: G_CONFLICT.load(Ordering::SeqCst),
        capacity: G_CAPACITY.load(Ordering::SeqCst),
        debug: G_DEBUG.load(Ordering::SeqCst),
        nested: G_NESTED.load(Ordering::SeqCst),
    }
}

/// Print the abort totals in the benchmark's report format.
pub fn print_stats() {
    let t = totals();
    println!("-------------------------------------------------");
    println!("  HTM aborts status:");
    println!("    t_htm_conflict = {}", t.conflict);
    println!("    t_htm_capacity = {}", t.capacity);
    println!("    t_htm_explicit = {}", t.explicit);
    println!("-------------------------------------------------");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_counts_every_set_bit() {
        let d = ThreadData::default();
        status_collect(&d, XABORT_CONFLICT | XABORT_RETRY);
        status_collect(&d, XABORT_CAPACITY);
        status_collect(&d, XABORT_CAPACITY | XABORT_NESTED);

        assert_eq!(d.n_xabort_conflict.get(), 1);
        assert_eq!(d.n_xabort_retry.get(), 1);
        assert_eq!(d.n_xabort_capacity.get(), 2);
        assert_eq!(d.n_xabort_nested.get(), 1);
        assert_eq!(d.n_xabort_explicit.get(), 0);
    }

    #[test]
    #[cfg(not(all(target_arch = "x86_64", target_feature = "rtm")))]
    fn stub_start_always_aborts_explicit() {
        let d = ThreadData::default();
        assert!(!supported());
        assert!(!start(&d));
        assert!(!start(&d));
        assert_eq!(d.n_xabort_explicit.get(), 2);
        assert_eq!(d.last_abort.get(), XABORT_EXPLICIT);
    }

    #[test]
    fn thread_finish_folds_into_totals() {
        let d = ThreadData::default();
        d.n_xabort_conflict.set(7);
        d.n_xabort_capacity.set(3);

        let before = totals();
        thread_finish(&d);
        let after = totals();

        // Other tests may fold their own counters concurrently.
        assert!(after.conflict - before.conflict >= 7);
        assert!(after.capacity - before.capacity >= 3);
    }
}
