//! Stack-track reclamation engine.
//!
//! Every participating thread registers one [`StThread`] holding its hazard
//! records, its tracked pointer windows, its adaptive segment tables and a
//! bounded deferred-free list. Readers traverse inside short hardware
//! transactions when the host supports them; when transactions keep aborting
//! the operation falls back to publishing hazard records. A thread whose
//! free list fills up scans every registered thread's published state and
//! physically releases the nodes nobody can still reach.
//!
//! The original scheme scanned raw stack bytes of other threads. Here each
//! thread owns a fixed pool of pointer-sized atomic slots instead: an
//! operation registers a window of that pool, keeps its live node pointers
//! in the window, and scanners read the slots as machine words. Windows nest
//! LIFO and cost one extra store per published pointer.

use std::cell::{Cell, UnsafeCell};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicPtr, AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

use crate::atomics::{atomic_add, cpu_relax, full_fence};
use crate::htm;

pub const ST_MAX_THREADS: usize = 100;
pub const ST_MAX_FREE_LIST: usize = 1000;
pub const ST_MAX_STACKS: usize = 20;
pub const ST_MAX_HP_RECORDS: usize = 100;
pub const ST_MAX_OPS: usize = 20;
pub const ST_MAX_SEGMENTS: usize = 1000;

/// Words in the per-thread tracked-pointer pool. Large enough for the
/// deepest window nesting an operation produces (two ten-slot arrays plus a
/// handful of scalars, twice over).
pub const ST_STACK_POOL_WORDS: usize = 128;

// Segment adjustment parameters.
const SEGMENT_MAX_HTM_ABORTS: i64 = 50;
const SEGMENT_MIN_LENGTH: i32 = 5;
const SEGMENT_LEN_DELTA: i32 = 5;
const SEGMENT_MAX_CAPACITY_ABORTS_FOR_DEC: i64 = 4;
const SEGMENT_MIN_SUCCESS_FOR_INC: i64 = 4;

#[derive(Clone, Copy)]
struct Segment {
    n_limit: i32,
    saved_n_htm_success: i64,
    n_htm_success: i64,
}

struct FreeEntry {
    is_found: bool,
    ptr: *mut (),
    free_fn: unsafe fn(*mut ()),
}

struct WindowEntry {
    offset: AtomicUsize,
    len: AtomicUsize,
}

/// Per-thread operation statistics, folded into the global totals at
/// thread teardown.
#[derive(Default)]
struct Stats {
    n_ops: Cell<i64>,
    n_splits: Cell<i64>,
    n_split_length: Cell<i64>,
    n_stack_scans: Cell<i64>,
    n_slow_path_segments: Cell<i64>,
}

/// Per-thread reclamation state.
///
/// The owning thread drives every method; other threads only ever read the
/// atomic fields (`is_slow_path`, the two counters, the hazard records and
/// the tracked windows) during [`StThread::scan_and_free`].
pub struct StThread {
    uniq_id: usize,
    max_segment_len: i32,
    free_list_max_size: usize,

    // Operation cursor, owner-only.
    op_index: Cell<usize>,
    split_index: Cell<usize>,
    saved_split_index: Cell<usize>,
    is_htm_active: Cell<bool>,
    cur_segment_len: Cell<i32>,
    cur_segment_limit: Cell<i32>,

    // Mode flag and version counters, published to scanners.
    is_slow_path: AtomicBool,
    split_counter: AtomicI64,
    stack_counter: AtomicI64,

    // Tracked pointer windows.
    n_stacks: AtomicUsize,
    stacks: [WindowEntry; ST_MAX_STACKS],
    stack_pool: [AtomicUsize; ST_STACK_POOL_WORDS],
    pool_top: Cell<usize>,
    pending_words: Cell<usize>,

    // Hazard records, meaningful only on the slow path.
    n_hp_records: AtomicUsize,
    hp_records: [AtomicUsize; ST_MAX_HP_RECORDS],

    // Adaptive segment limits, one row per operation id. Owner-only.
    segments: UnsafeCell<Vec<Segment>>,

    // Deferred frees. Owner-only.
    free_list: UnsafeCell<Vec<FreeEntry>>,

    htm_data: htm::ThreadData,
    stats: Stats,
}

// Safety: the Cell/UnsafeCell fields are touched only by the registering
// thread; every field another thread may read during a scan is atomic.
unsafe impl Send for StThread {}
unsafe impl Sync for StThread {}

static G_UNIQ_ID: AtomicI64 = AtomicI64::new(0);
static G_N_THREADS: AtomicI64 = AtomicI64::new(0);
static G_THREADS: [CachePadded<AtomicPtr<StThread>>; ST_MAX_THREADS] =
    [const { CachePadded::new(AtomicPtr::new(ptr::null_mut())) }; ST_MAX_THREADS];

static G_N_OPS: AtomicI64 = AtomicI64::new(0);
static G_N_SPLITS: AtomicI64 = AtomicI64::new(0);
static G_N_SPLIT_LENGTH: AtomicI64 = AtomicI64::new(0);
static G_N_STACK_SCANS: AtomicI64 = AtomicI64::new(0);
static G_N_SLOW_PATH_SEGMENTS: AtomicI64 = AtomicI64::new(0);

/// A registered window of the owning thread's tracked-pointer pool.
///
/// Slots are plain machine words to the scanner; the typed accessors are a
/// convenience for the data structure storing node pointers in them.
#[derive(Clone, Copy)]
pub struct StackWindow<'a> {
    st: &'a StThread,
    base: usize,
    len: usize,
}

impl StackWindow<'_> {
    #[inline]
    pub fn set<T>(&self, i: usize, p: *mut T) {
        debug_assert!(i < self.len);
        self.st.stack_pool[self.base + i].store(p as usize, Ordering::Release);
    }

    #[inline]
    pub fn get<T>(&self, i: usize) -> *mut T {
        debug_assert!(i < self.len);
        self.st.stack_pool[self.base + i].load(Ordering::Relaxed) as *mut T
    }
}

impl StThread {
    /// Register the calling thread, assigning it the next dense id.
    ///
    /// The record is leaked so concurrent scanners can keep reading it for
    /// the remainder of the process; the registry is append-only.
    pub fn register(max_segment_len: i32, free_list_max_size: usize) -> &'static StThread {
        assert!(free_list_max_size <= ST_MAX_FREE_LIST);

        let uniq_id = atomic_add(&G_UNIQ_ID, 1) as usize;
        assert!(uniq_id < ST_MAX_THREADS, "thread registry full");

        let segments = vec![
            Segment {
                n_limit: max_segment_len,
                saved_n_htm_success: 0,
                n_htm_success: 0,
            };
            ST_MAX_OPS * ST_MAX_SEGMENTS
        ];

        let st = Box::leak(Box::new(StThread {
            uniq_id,
            max_segment_len,
            free_list_max_size,
            op_index: Cell::new(0),
            split_index: Cell::new(0),
            saved_split_index: Cell::new(0),
            is_htm_active: Cell::new(false),
            cur_segment_len: Cell::new(0),
            cur_segment_limit: Cell::new(max_segment_len),
            is_slow_path: AtomicBool::new(false),
            split_counter: AtomicI64::new(0),
            stack_counter: AtomicI64::new(0),
            n_stacks: AtomicUsize::new(0),
            stacks: std::array::from_fn(|_| WindowEntry {
                offset: AtomicUsize::new(0),
                len: AtomicUsize::new(0),
            }),
            stack_pool: std::array::from_fn(|_| AtomicUsize::new(0)),
            pool_top: Cell::new(0),
            pending_words: Cell::new(0),
            n_hp_records: AtomicUsize::new(0),
            hp_records: std::array::from_fn(|_| AtomicUsize::new(0)),
            segments: UnsafeCell::new(segments),
            free_list: UnsafeCell::new(Vec::with_capacity(ST_MAX_FREE_LIST)),
            htm_data: htm::ThreadData::default(),
            stats: Stats::default(),
        }));

        G_THREADS[uniq_id].store(st as *const StThread as *mut StThread, Ordering::Release);
        atomic_add(&G_N_THREADS, 1);

        st
    }

    #[inline]
    pub fn uniq_id(&self) -> usize {
        self.uniq_id
    }

    #[inline]
    pub fn is_htm_active(&self) -> bool {
        self.is_htm_active.get()
    }

    /// Fold this thread's HTM and reclamation counters into the global
    /// totals. Call once, when the worker is done.
    pub fn thread_finish(&self) {
        htm::thread_finish(&self.htm_data);

        atomic_add(&G_N_OPS, self.stats.n_ops.get());
        atomic_add(&G_N_SPLITS, self.stats.n_splits.get());
        atomic_add(&G_N_SPLIT_LENGTH, self.stats.n_split_length.get());
        atomic_add(&G_N_STACK_SCANS, self.stats.n_stack_scans.get());
        atomic_add(&G_N_SLOW_PATH_SEGMENTS, self.stats.n_slow_path_segments.get());
    }

    // ---------------------------------------------------------------------
    // Operation management
    // ---------------------------------------------------------------------

    /// Enter an operation. Starts pessimistically on the slow path so that
    /// hazard records written before the first segment are honoured.
    pub fn op_init(&self) {
        self.is_slow_path.store(true, Ordering::Relaxed);
        self.n_stacks.store(0, Ordering::Relaxed);
        self.pool_top.set(0);
        self.pending_words.set(0);
        self.hp_reset();
        full_fence();
    }

    /// Leave an operation: drop every published window and hazard record and
    /// advance the stack version so in-flight scans stop consulting them.
    pub fn op_finish(&self) {
        self.n_stacks.store(0, Ordering::Relaxed);
        self.pool_top.set(0);
        self.pending_words.set(0);
        self.n_hp_records.store(0, Ordering::Relaxed);

        self.stack_counter.fetch_add(1, Ordering::Release);

        if self.is_slow_path.load(Ordering::Relaxed) {
            self.is_slow_path.store(false, Ordering::Relaxed);
        }

        full_fence();
    }

    // ---------------------------------------------------------------------
    // Tracked windows
    // ---------------------------------------------------------------------

    /// Begin aggregating one window.
    pub fn stack_init(&self) {
        self.pending_words.set(0);
    }

    /// Reserve `n_words` consecutive slots in the window under construction.
    pub fn stack_add_range(&self, n_words: usize) -> StackWindow<'_> {
        let base = self.pool_top.get() + self.pending_words.get();
        assert!(
            base + n_words <= ST_STACK_POOL_WORDS,
            "tracked-window pool overflow"
        );

        for w in 0..n_words {
            self.stack_pool[base + w].store(0, Ordering::Relaxed);
        }
        self.pending_words.set(self.pending_words.get() + n_words);

        StackWindow {
            st: self,
            base,
            len: n_words,
        }
    }

    /// Publish the aggregate window to scanners.
    pub fn stack_publish(&self) {
        let n = self.n_stacks.load(Ordering::Relaxed);
        assert!(n < ST_MAX_STACKS, "tracked-window registry overflow");

        self.stacks[n].offset.store(self.pool_top.get(), Ordering::Relaxed);
        self.stacks[n].len.store(self.pending_words.get(), Ordering::Relaxed);
        self.pool_top.set(self.pool_top.get() + self.pending_words.get());
        self.pending_words.set(0);

        full_fence();
        self.n_stacks.store(n + 1, Ordering::Release);
    }

    /// Pop the most recently published window.
    pub fn stack_del(&self) {
        let n = self.n_stacks.load(Ordering::Relaxed);
        debug_assert!(n > 0);
        self.n_stacks.store(n - 1, Ordering::Release);
        self.pool_top.set(self.stacks[n - 1].offset.load(Ordering::Relaxed));
    }

    // ---------------------------------------------------------------------
    // Split management
    // ---------------------------------------------------------------------

    /// Start the segmented portion of an operation.
    pub fn split_start(&self, op_index: usize) {
        debug_assert!(op_index < ST_MAX_OPS);
        self.op_index.set(op_index);
        self.split_index.set(0);

        if self.is_slow_path.load(Ordering::Relaxed) {
            self.is_slow_path.store(false, Ordering::Relaxed);
        }

        self.segment_start();
    }

    /// Finish the segmented portion of an operation.
    pub fn split_finish(&self) {
        self.segment_finish();
        self.stats.n_ops.set(self.stats.n_ops.get() + 1);
    }

    /// Remember the current segment index so a restarted traversal reuses
    /// the same adaptive slots.
    pub fn split_save(&self) {
        self.saved_split_index.set(self.split_index.get());
    }

    pub fn split_restore(&self) {
        self.split_index.set(self.saved_split_index.get());
    }

    /// One unit step (a pointer chase or a lock acquisition). Rolls the
    /// current segment over when it reaches its adaptive limit.
    #[inline]
    pub fn split(&self) {
        self.cur_segment_len.set(self.cur_segment_len.get() + 1);
        if self.cur_segment_len.get() > self.cur_segment_limit.get() {
            self.segment_finish();
            self.segment_start();
        }
    }

    fn segment_index(&self) -> usize {
        let split = self.split_index.get();
        assert!(split < ST_MAX_SEGMENTS, "segment index overflow");
        self.op_index.get() * ST_MAX_SEGMENTS + split
    }

    fn segment_start(&self) {
        let seg_idx = self.segment_index();
        // Safety: the segment table is owner-only.
        let segments = unsafe { &mut *self.segments.get() };

        self.cur_segment_limit.set(segments[seg_idx].n_limit);
        self.cur_segment_len.set(0);

        if !htm::supported() {
            // No transactions on this host: the engine runs every segment on
            // the slow path.
            self.is_slow_path.store(true, Ordering::Release);
            self.stats
                .n_slow_path_segments
                .set(self.stats.n_slow_path_segments.get() + 1);
            return;
        }

        let mut saved_capacity_aborts = self.htm_data.n_xabort_capacity.get();
        let mut n_htm_aborts = 0i64;

        self.is_htm_active.set(true);
        while !htm::start(&self.htm_data) {
            self.is_htm_active.set(false);
            n_htm_aborts += 1;

            let new_capacity_aborts =
                self.htm_data.n_xabort_capacity.get() - saved_capacity_aborts;

            if new_capacity_aborts > 0 {
                segments[seg_idx].saved_n_htm_success = segments[seg_idx].n_htm_success;
            }

            // Repeated capacity aborts mean the segment does not fit in the
            // transactional working set: shrink its limit.
            if new_capacity_aborts > SEGMENT_MAX_CAPACITY_ABORTS_FOR_DEC {
                if segments[seg_idx].n_limit > SEGMENT_MIN_LENGTH {
                    segments[seg_idx].n_limit -= SEGMENT_LEN_DELTA;
                }
                saved_capacity_aborts = self.htm_data.n_xabort_capacity.get();
                self.cur_segment_limit.set(segments[seg_idx].n_limit);
            }

            self.cur_segment_len.set(0);

            if n_htm_aborts > SEGMENT_MAX_HTM_ABORTS {
                self.is_slow_path.store(true, Ordering::Release);
                self.stats
                    .n_slow_path_segments
                    .set(self.stats.n_slow_path_segments.get() + 1);
                return;
            }
        }
    }

    fn segment_finish(&self) {
        self.split_counter.fetch_add(1, Ordering::Release);

        if self.is_slow_path.load(Ordering::Relaxed) {
            self.stats.n_splits.set(self.stats.n_splits.get() + 1);
            self.stats
                .n_split_length
                .set(self.stats.n_split_length.get() + i64::from(self.cur_segment_len.get()));
            self.split_index.set(self.split_index.get() + 1);
            self.is_slow_path.store(false, Ordering::Relaxed);
            full_fence();
            return;
        }

        htm::commit();
        self.is_htm_active.set(false);

        let seg_idx = self.op_index.get() * ST_MAX_SEGMENTS + self.split_index.get();
        // Safety: owner-only.
        let segments = unsafe { &mut *self.segments.get() };

        segments[seg_idx].n_htm_success += 1;
        self.stats.n_splits.set(self.stats.n_splits.get() + 1);
        self.stats
            .n_split_length
            .set(self.stats.n_split_length.get() + i64::from(self.cur_segment_len.get()));

        let new_success =
            segments[seg_idx].n_htm_success - segments[seg_idx].saved_n_htm_success;
        if new_success > SEGMENT_MIN_SUCCESS_FOR_INC
            && segments[seg_idx].n_limit < self.max_segment_len
        {
            segments[seg_idx].n_limit += SEGMENT_LEN_DELTA;
            segments[seg_idx].saved_n_htm_success = segments[seg_idx].n_htm_success;
        }

        self.split_index.set(self.split_index.get() + 1);
    }

    // ---------------------------------------------------------------------
    // Hazard records (slow path)
    // ---------------------------------------------------------------------

    pub fn hp_reset(&self) {
        self.n_hp_records.store(0, Ordering::Relaxed);
    }

    /// Claim the next hazard slot. Slot indices stay valid until the next
    /// [`StThread::hp_reset`] or [`StThread::op_finish`]. The slot is
    /// cleared so a value left over from an earlier operation cannot retain
    /// a node.
    pub fn hp_alloc(&self) -> usize {
        let n = self.n_hp_records.load(Ordering::Relaxed);
        assert!(n < ST_MAX_HP_RECORDS, "hazard record overflow");
        self.hp_records[n].store(0, Ordering::Relaxed);
        self.n_hp_records.store(n + 1, Ordering::Release);
        n
    }

    /// Publish the pointer stored at `src` into hazard slot `hp` and return
    /// it. On the fast path the transaction already protects the read and
    /// this is a plain load.
    #[inline]
    pub fn hp_protect_load<T>(&self, hp: usize, src: &AtomicPtr<T>) -> *mut T {
        if !self.is_slow_path.load(Ordering::Relaxed) {
            return src.load(Ordering::Acquire);
        }
        self.hp_init(hp, src)
    }

    /// Slow-path hazard publication: store-then-revalidate until the source
    /// still holds the published value, so any reclaimer that frees it must
    /// have seen the record first.
    pub fn hp_init<T>(&self, hp: usize, src: &AtomicPtr<T>) -> *mut T {
        loop {
            let p = src.load(Ordering::Acquire);
            self.hp_records[hp].store(p as usize, Ordering::SeqCst);
            full_fence();

            if src.load(Ordering::Acquire) == p {
                return p;
            }
            cpu_relax();
        }
    }

    // ---------------------------------------------------------------------
    // Deferred free and scan
    // ---------------------------------------------------------------------

    /// Hand an unlinked node to the engine. Once the pending list reaches
    /// the configured batch size, scan-and-free runs until it drains below
    /// the threshold.
    ///
    /// # Safety
    ///
    /// `ptr` must come from `Box::into_raw`, be unlinked from every shared
    /// structure, and not be handed to the engine twice.
    pub unsafe fn defer_free<T>(&self, ptr: *mut T) {
        unsafe fn free_boxed<T>(p: *mut ()) {
            unsafe {
                drop(Box::from_raw(p as *mut T));
            }
        }

        // Safety: the free list is owner-only.
        let free_list = unsafe { &mut *self.free_list.get() };
        free_list.push(FreeEntry {
            is_found: false,
            ptr: ptr as *mut (),
            free_fn: free_boxed::<T>,
        });

        if free_list.len() >= self.free_list_max_size {
            while {
                self.scan_and_free();
                self.stats.n_stack_scans.set(self.stats.n_stack_scans.get() + 1);
                unsafe { &*self.free_list.get() }.len() >= self.free_list_max_size
            } {}
        }
    }

    /// Number of frees still pending on this thread.
    pub fn pending_frees(&self) -> usize {
        // Safety: owner-only.
        unsafe { &*self.free_list.get() }.len()
    }

    /// Scan every registered thread's published state and release the
    /// pending nodes nobody retains.
    pub fn scan_and_free(&self) {
        // Safety: the free list is owner-only; scanning only reads other
        // threads' atomic fields.
        let free_list = unsafe { &mut *self.free_list.get() };

        let snapshot_threads = G_N_THREADS.load(Ordering::Acquire) as usize;
        let mut local_stack_counters = [0i64; ST_MAX_THREADS];
        for (t, counter) in local_stack_counters
            .iter_mut()
            .enumerate()
            .take(snapshot_threads)
        {
            let th = G_THREADS[t].load(Ordering::Acquire);
            if !th.is_null() {
                *counter = unsafe { &*th }.stack_counter.load(Ordering::Acquire);
            }
        }

        for entry in free_list.iter_mut() {
            entry.is_found = false;
        }

        let n_threads = G_N_THREADS.load(Ordering::Acquire) as usize;
        for (t, local_counter) in local_stack_counters.iter().enumerate().take(n_threads) {
            let th = G_THREADS[t].load(Ordering::Acquire);
            if th.is_null() {
                continue;
            }
            let th = unsafe { &*th };

            let mut i = 0;
            while i < free_list.len() {
                if free_list[i].is_found {
                    i += 1;
                    continue;
                }

                // The thread finished an operation since the snapshot: its
                // current records cannot retain anything we unlinked before.
                if *local_counter != th.stack_counter.load(Ordering::Acquire) {
                    break;
                }

                let local_split_counter = th.split_counter.load(Ordering::Acquire);

                if Self::scan_thread(th, free_list[i].ptr as usize) {
                    free_list[i].is_found = true;
                }

                // Crossing a segment boundary may have loaded fresh
                // references; rescan this pointer against this thread.
                if local_split_counter != th.split_counter.load(Ordering::Acquire) {
                    continue;
                }

                i += 1;
            }
        }

        let mut i = 0;
        while i < free_list.len() {
            if free_list[i].is_found {
                i += 1;
            } else {
                let entry = free_list.swap_remove(i);
                // Safety: the scan proved no thread retains the pointer, and
                // the defer_free contract rules out double handling.
                unsafe { (entry.free_fn)(entry.ptr) };
            }
        }
    }

    fn scan_thread(th: &StThread, target: usize) -> bool {
        let mut found = false;

        if th.is_slow_path.load(Ordering::Acquire) {
            found = Self::scan_thread_hp_records(th, target);
        }
        if !found {
            found = Self::scan_thread_windows(th, target);
        }

        found
    }

    fn scan_thread_hp_records(th: &StThread, target: usize) -> bool {
        let n = th.n_hp_records.load(Ordering::Acquire).min(ST_MAX_HP_RECORDS);
        for i in (0..n).rev() {
            if th.hp_records[i].load(Ordering::Acquire) == target {
                return true;
            }
        }
        false
    }

    fn scan_thread_windows(th: &StThread, target: usize) -> bool {
        let n = th.n_stacks.load(Ordering::Acquire).min(ST_MAX_STACKS);
        for s in (0..n).rev() {
            let offset = th.stacks[s].offset.load(Ordering::Acquire);
            let len = th.stacks[s].len.load(Ordering::Acquire);
            let end = (offset + len).min(ST_STACK_POOL_WORDS);

            for w in offset..end {
                if th.stack_pool[w].load(Ordering::Acquire) == target {
                    return true;
                }
            }
        }
        false
    }
}

// -------------------------------------------------------------------------
// Global stats and registry control
// -------------------------------------------------------------------------

/// Snapshot of the process-wide reclamation totals.
#[derive(Debug, Clone, Copy, Default)]
pub struct GlobalStats {
    pub n_ops: i64,
    pub n_splits: i64,
    pub n_split_length: i64,
    pub n_stack_scans: i64,
    pub n_slow_path_segments: i64,
}

pub fn global_stats() -> GlobalStats {
    GlobalStats {
        n_ops: G_N_OPS.load(Ordering::SeqCst),
        n_splits: G_N_SPLITS.load(Ordering::SeqCst),
        n_split_length: G_N_SPLIT_LENGTH.load(Ordering::SeqCst),
        n_stack_scans: G_N_STACK_SCANS.load(Ordering::SeqCst),
        n_slow_path_segments: G_N_SLOW_PATH_SEGMENTS.load(Ordering::SeqCst),
    }
}

/// Print the reclamation totals in the benchmark's report format.
pub fn print_stats() {
    let s = global_stats();
    let ops = s.n_ops.max(1) as f64;
    let splits = s.n_splits.max(1) as f64;

    println!("-------------------------------------------------");
    println!("  StackTrack status:");
    println!("    n_splits_per_operation = {:.2}", s.n_splits as f64 / ops);
    println!("    n_split_length = {:.2}", s.n_split_length as f64 / splits);
    println!("    n_stack_scans = {}", s.n_stack_scans);
    println!("    n_slow_path_segments = {}", s.n_slow_path_segments);
    println!("-------------------------------------------------");
}

/// Abandon every registered thread and zero the global totals.
///
/// Only safe at quiescence: no registered thread may still run operations
/// or scans. Registered records are leaked by design (scanners may hold
/// references until the process exits).
pub fn registry_reset() {
    for slot in G_THREADS.iter() {
        slot.store(ptr::null_mut(), Ordering::SeqCst);
    }
    G_N_THREADS.store(0, Ordering::SeqCst);
    G_UNIQ_ID.store(0, Ordering::SeqCst);

    G_N_OPS.store(0, Ordering::SeqCst);
    G_N_SPLITS.store(0, Ordering::SeqCst);
    G_N_SPLIT_LENGTH.store(0, Ordering::SeqCst);
    G_N_STACK_SCANS.store(0, Ordering::SeqCst);
    G_N_SLOW_PATH_SEGMENTS.store(0, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_thread() -> &'static StThread {
        StThread::register(50, 4)
    }

    #[test]
    fn defer_free_releases_unretained_pointers() {
        let st = new_thread();

        for v in 0..4i64 {
            let p = Box::into_raw(Box::new(v));
            unsafe { st.defer_free(p) };
        }

        // Nothing retains the boxes, so reaching the batch size drained
        // the list.
        assert!(st.pending_frees() < 4);
    }

    #[test]
    fn hazard_record_retains_pointer() {
        let holder = new_thread();
        let reclaimer = new_thread();

        let p = Box::into_raw(Box::new(7i64));

        holder.op_init(); // slow path, hazard records honoured
        let hp = holder.hp_alloc();
        holder.hp_records[hp].store(p as usize, Ordering::SeqCst);
        full_fence();

        unsafe { reclaimer.defer_free(p) };
        reclaimer.scan_and_free();
        assert_eq!(reclaimer.pending_frees(), 1, "hazard record was ignored");

        holder.op_finish();
        reclaimer.scan_and_free();
        assert_eq!(reclaimer.pending_frees(), 0);
    }

    #[test]
    fn tracked_window_retains_pointer() {
        let holder = new_thread();
        let reclaimer = new_thread();

        let p = Box::into_raw(Box::new(11i64));

        holder.op_init();
        holder.stack_init();
        let window = holder.stack_add_range(2);
        holder.stack_publish();
        window.set(1, p);

        unsafe { reclaimer.defer_free(p) };
        reclaimer.scan_and_free();
        assert_eq!(reclaimer.pending_frees(), 1, "tracked window was ignored");

        window.set(1, ptr::null_mut::<i64>());
        holder.stack_del();
        holder.op_finish();
        reclaimer.scan_and_free();
        assert_eq!(reclaimer.pending_frees(), 0);
    }

    #[test]
    fn windows_nest_lifo() {
        let st = new_thread();
        st.op_init();

        st.stack_init();
        let outer = st.stack_add_range(10);
        st.stack_publish();

        st.stack_init();
        let inner = st.stack_add_range(2);
        st.stack_publish();
        assert_eq!(st.n_stacks.load(Ordering::SeqCst), 2);
        assert!(inner.base >= outer.base + outer.len);

        st.stack_del();
        assert_eq!(st.n_stacks.load(Ordering::SeqCst), 1);

        // The pool position is rewound, so the next window reuses the space.
        st.stack_init();
        let again = st.stack_add_range(2);
        st.stack_publish();
        assert_eq!(again.base, inner.base);

        st.op_finish();
    }

    #[test]
    #[cfg(not(all(target_arch = "x86_64", target_feature = "rtm")))]
    fn segments_degrade_to_slow_path_without_htm() {
        let st = new_thread();

        st.op_init();
        st.split_start(0);
        assert!(st.is_slow_path.load(Ordering::SeqCst));

        for _ in 0..200 {
            st.split();
        }
        st.split_finish();
        st.op_finish();

        assert!(st.stats.n_slow_path_segments.get() > 0);
        assert!(st.stats.n_splits.get() > 0);
        assert_eq!(st.stats.n_ops.get(), 1);
    }

    #[test]
    fn split_counter_advances_per_segment() {
        let st = new_thread();

        st.op_init();
        let before = st.split_counter.load(Ordering::SeqCst);
        st.split_start(1);
        for _ in 0..(50 * 3 + 1) {
            st.split();
        }
        st.split_finish();
        st.op_finish();

        assert!(st.split_counter.load(Ordering::SeqCst) >= before + 3);
    }
}
