//! Shared atomic primitives used by the reclamation engine and the skip list.
//!
//! The add primitive is deliberately a CAS loop rather than `fetch_add`:
//! callers depend on observing the exact pre-image that their update was
//! applied to.

use std::sync::atomic::{fence, AtomicI64, Ordering};

/// Strong 64-bit compare-and-swap. Returns the value observed at `addr`
/// before the operation; the swap happened iff that value equals `expected`.
#[inline]
pub fn cas64(addr: &AtomicI64, expected: i64, new: i64) -> i64 {
    match addr.compare_exchange(expected, new, Ordering::SeqCst, Ordering::SeqCst) {
        Ok(prev) => prev,
        Err(prev) => prev,
    }
}

/// Atomic add built from a CAS loop. Returns the pre-image of `addr`.
#[inline]
pub fn atomic_add(addr: &AtomicI64, delta: i64) -> i64 {
    let mut v = addr.load(Ordering::Relaxed);
    loop {
        match addr.compare_exchange(v, v.wrapping_add(delta), Ordering::SeqCst, Ordering::Relaxed)
        {
            Ok(prev) => return prev,
            Err(cur) => v = cur,
        }
    }
}

/// Spin-loop hint for contended retry loops.
#[inline]
pub fn cpu_relax() {
    std::hint::spin_loop();
}

/// Full two-way fence. Orders the store of a published record before the
/// loads that re-validate it.
#[inline]
pub fn full_fence() {
    fence(Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn cas64_returns_pre_image() {
        let a = AtomicI64::new(5);
        assert_eq!(cas64(&a, 5, 9), 5);
        assert_eq!(a.load(Ordering::SeqCst), 9);

        // Failed swap still reports what was there.
        assert_eq!(cas64(&a, 5, 11), 9);
        assert_eq!(a.load(Ordering::SeqCst), 9);
    }

    #[test]
    fn atomic_add_returns_pre_image() {
        let a = AtomicI64::new(10);
        assert_eq!(atomic_add(&a, 3), 10);
        assert_eq!(atomic_add(&a, -13), 13);
        assert_eq!(a.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn atomic_add_is_atomic_across_threads() {
        let a = Arc::new(AtomicI64::new(0));
        let mut handles = Vec::new();

        for _ in 0..4 {
            let a = Arc::clone(&a);
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    atomic_add(&a, 1);
                }
            }));
        }
        for h in handles {
            h.join().expect("adder thread panicked");
        }

        assert_eq!(a.load(Ordering::SeqCst), 4000);
    }
}
