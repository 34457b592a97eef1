//! Seam for the external conservative-scan collector.
//!
//! The forkscan flavour of the set delegates reclamation to an out-of-process
//! collector reached through two entry points: allocate a tracked object and
//! retire it for reclamation. This crate does not link the collector, so the
//! shim allocates from the global allocator and parks retired objects on a
//! process-lifetime list, which is observably the pure flavour's leak and
//! safe for the retiree's concurrent readers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

static RETIRED: Mutex<Vec<usize>> = Mutex::new(Vec::new());
static N_RETIRED: AtomicUsize = AtomicUsize::new(0);

/// Allocate a collector-tracked object.
pub fn alloc<T>(value: T) -> *mut T {
    Box::into_raw(Box::new(value))
}

/// Hand an unlinked object to the collector.
///
/// Readers that still hold the pointer stay safe: nothing is freed until the
/// collector (when present) proves the object unreachable.
pub fn retire<T>(ptr: *mut T) {
    RETIRED
        .lock()
        .expect("retire list mutex poisoned")
        .push(ptr as usize);
    N_RETIRED.fetch_add(1, Ordering::Relaxed);
}

/// Objects handed to the collector so far.
pub fn retired_count() -> usize {
    N_RETIRED.load(Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retire_parks_objects() {
        let before = retired_count();

        let a = alloc(1i64);
        let b = alloc(2i64);
        retire(a);
        retire(b);

        assert_eq!(retired_count() - before, 2);
    }
}
