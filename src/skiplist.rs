//! Concurrent ordered integer set: the lazy skip list of Herlihy, Lev,
//! Luchangco and Shavit, with per-node locks on update, a wait-free-ish
//! `contains`, and two-phase delete (mark, then unlink).
//!
//! Every operation comes in four reclamation flavours:
//!
//! * `*_pure` - no reclamation; removed nodes leak.
//! * `*_hp` - hazard pointers published for every traversal step.
//! * `*_stacktrack` - traversals run as short hardware transactions with
//!   hazard pointers as the fallback; live pointers are kept in tracked
//!   windows for the cross-thread scan.
//! * `*_forkscan` - traversal like `pure`; retired nodes go to the external
//!   collector.
//!
//! A node is in the set iff it is reachable from the head, fully linked and
//! not marked. Marks are permanent: a marked node is on its way out and is
//! never resurrected.

use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicPtr, Ordering};

use rand::Rng;

use crate::atomics::{cas64, cpu_relax, full_fence};
use crate::forkscan;
use crate::htm;
use crate::stacktrack::{StThread, StackWindow};

pub const MAX_LEVEL: usize = 10;

pub const MIN_KEY: i32 = 0;
pub const MAX_KEY: i32 = 1 << 28;

const OP_ID_CONTAINS: usize = 0;
const OP_ID_INSERT: usize = 1;
const OP_ID_REMOVE: usize = 2;

/// One skip-list node. `key` and `top_level` are immutable after
/// construction; everything else follows the locking protocol.
pub struct Node {
    lock: AtomicI64,
    key: i32,
    top_level: usize,
    marked: AtomicBool,
    fully_linked: AtomicBool,
    next: [AtomicPtr<Node>; MAX_LEVEL],
}

impl Node {
    fn new(key: i32, top_level: usize) -> Node {
        Node {
            lock: AtomicI64::new(0),
            key,
            top_level,
            marked: AtomicBool::new(false),
            fully_linked: AtomicBool::new(false),
            next: std::array::from_fn(|_| AtomicPtr::new(ptr::null_mut())),
        }
    }

    fn alloc(key: i32, top_level: usize) -> *mut Node {
        Box::into_raw(Box::new(Node::new(key, top_level)))
    }
}

#[inline]
unsafe fn nref<'a>(p: *mut Node) -> &'a Node {
    unsafe { &*p }
}

/// Draw a geometric level with parameter one half, capped at the top level.
pub fn random_level(rng: &mut impl Rng) -> usize {
    let mut level = 1;
    while rng.random::<u32>() % 2 == 0 && level < MAX_LEVEL {
        level += 1;
    }
    level - 1
}

/// Acquire a node lock. Outside a transaction this spins on a CAS of the
/// lock word; inside one, an observed held lock aborts the transaction so
/// the segment retries, and the transactional store is mutually exclusive
/// through the transaction's write set.
fn node_lock(st: &StThread, node: &Node) {
    if !st.is_htm_active() {
        loop {
            if node.lock.load(Ordering::Acquire) == 0 && cas64(&node.lock, 0, 1) == 0 {
                return;
            }
            cpu_relax();
        }
    }

    if node.lock.load(Ordering::Relaxed) != 0 {
        htm::abort_lock_busy();
    }
    node.lock.store(1, Ordering::Relaxed);
}

fn node_unlock(node: &Node) {
    node.lock.store(0, Ordering::Release);
}

/// The set. `head` and `tail` are permanent sentinels at full height;
/// `tail.next` stays null at every level so walks terminate there.
pub struct SkipList {
    head: AtomicPtr<Node>,
    tail: AtomicPtr<Node>,
}

// Safety: all shared node state is atomic and mutated under the node-lock /
// mark / validate protocol.
unsafe impl Send for SkipList {}
unsafe impl Sync for SkipList {}

impl Default for SkipList {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SkipList {
    fn drop(&mut self) {
        // Only sound at quiescence. Unlinked nodes are not on this chain;
        // their reclamation flavour owns them.
        let mut p = self.head.load(Ordering::Relaxed);
        while !p.is_null() {
            let next = unsafe { nref(p) }.next[0].load(Ordering::Relaxed);
            unsafe { drop(Box::from_raw(p)) };
            p = next;
        }
    }
}

impl SkipList {
    pub fn new() -> SkipList {
        let head = Node::alloc(MIN_KEY, MAX_LEVEL - 1);
        let tail = Node::alloc(MAX_KEY, MAX_LEVEL - 1);

        let h = unsafe { nref(head) };
        for level in 0..MAX_LEVEL {
            h.next[level].store(tail, Ordering::Relaxed);
        }
        full_fence();

        SkipList {
            head: AtomicPtr::new(head),
            tail: AtomicPtr::new(tail),
        }
    }

    // ---------------------------------------------------------------------
    // find
    // ---------------------------------------------------------------------

    // The reclaim-capable traversals defend against unlinked nodes: a null
    // link or a marked node the walk would pass *through* forces a restart.
    // A marked node arrived at as the successor is returned as-is; callers
    // filter it (`contains`) or re-validate under locks (`insert`/`remove`),
    // and the remover that owns the mark needs exactly that to make
    // progress. The pure walk shares the rule so it never chases a nulled
    // link either.

    fn find_pure(
        &self,
        key: i32,
        preds: &mut [*mut Node; MAX_LEVEL],
        succs: &mut [*mut Node; MAX_LEVEL],
    ) -> i32 {
        let mut n_restarts: u32 = 0;

        'restart: loop {
            n_restarts += 1;
            if n_restarts > 1000 {
                n_restarts = 0;
            }

            let mut l_found = -1;
            let mut pred = self.head.load(Ordering::Acquire);

            for level in (0..MAX_LEVEL).rev() {
                let mut curr = unsafe { nref(pred) }.next[level].load(Ordering::Acquire);

                loop {
                    if curr.is_null() {
                        continue 'restart;
                    }
                    let c = unsafe { nref(curr) };
                    if key <= c.key {
                        break;
                    }
                    if c.marked.load(Ordering::Acquire) {
                        continue 'restart;
                    }
                    pred = curr;
                    curr = c.next[level].load(Ordering::Acquire);
                }

                if l_found == -1 && key == unsafe { nref(curr) }.key {
                    l_found = level as i32;
                }
                preds[level] = pred;
                succs[level] = curr;
            }

            return l_found;
        }
    }

    fn find_hp(
        &self,
        st: &StThread,
        key: i32,
        preds: &mut [*mut Node; MAX_LEVEL],
        succs: &mut [*mut Node; MAX_LEVEL],
        hp_preds: &mut [usize; MAX_LEVEL],
        hp_succs: &mut [usize; MAX_LEVEL],
    ) -> i32 {
        let mut n_restarts: u32 = 0;

        'restart: loop {
            n_restarts += 1;
            if n_restarts > 1000 {
                n_restarts = 0;
            }

            let mut l_found = -1;
            let mut hp_pred = st.hp_alloc();
            let mut hp_curr = st.hp_alloc();

            // The head sentinel is never null and never marked.
            let mut pred = st.hp_protect_load(hp_pred, &self.head);

            for level in (0..MAX_LEVEL).rev() {
                let mut curr = st.hp_protect_load(hp_curr, &unsafe { nref(pred) }.next[level]);

                loop {
                    if curr.is_null() {
                        st.hp_reset();
                        continue 'restart;
                    }
                    let c = unsafe { nref(curr) };
                    if key <= c.key {
                        break;
                    }
                    if c.marked.load(Ordering::Acquire) {
                        st.hp_reset();
                        continue 'restart;
                    }

                    // The slot that protected curr now protects it as pred.
                    mem::swap(&mut hp_pred, &mut hp_curr);
                    pred = curr;
                    curr = st.hp_protect_load(hp_curr, &unsafe { nref(pred) }.next[level]);
                }

                if l_found == -1 && key == unsafe { nref(curr) }.key {
                    l_found = level as i32;
                }
                hp_preds[level] = hp_pred;
                preds[level] = pred;
                hp_succs[level] = hp_curr;
                succs[level] = curr;

                if level > 0 {
                    hp_pred = st.hp_alloc();
                    hp_curr = st.hp_alloc();
                }
            }

            return l_found;
        }
    }

    fn find_stacktrack(
        &self,
        st: &StThread,
        key: i32,
        preds: &StackWindow<'_>,
        succs: &StackWindow<'_>,
        hp_preds: &mut [usize; MAX_LEVEL],
        hp_succs: &mut [usize; MAX_LEVEL],
    ) -> i32 {
        st.stack_init();
        let frame = st.stack_add_range(2); // pred, curr
        st.stack_publish();

        st.split_save();

        let mut n_restarts: u32 = 0;
        let l_found = 'restart: loop {
            n_restarts += 1;
            if n_restarts > 1000 {
                n_restarts = 0;
            }

            let mut l_found = -1;
            let mut hp_pred = st.hp_alloc();
            let mut hp_curr = st.hp_alloc();

            let mut pred = st.hp_protect_load(hp_pred, &self.head);
            frame.set(0, pred);

            for level in (0..MAX_LEVEL).rev() {
                st.split();

                let mut curr = st.hp_protect_load(hp_curr, &unsafe { nref(pred) }.next[level]);
                frame.set(1, curr);

                loop {
                    if curr.is_null() {
                        st.split_restore();
                        st.hp_reset();
                        continue 'restart;
                    }
                    let c = unsafe { nref(curr) };
                    if key <= c.key {
                        break;
                    }
                    if c.marked.load(Ordering::Acquire) {
                        st.split_restore();
                        st.hp_reset();
                        continue 'restart;
                    }

                    st.split();
                    mem::swap(&mut hp_pred, &mut hp_curr);
                    pred = curr;
                    frame.set(0, pred);
                    curr = st.hp_protect_load(hp_curr, &unsafe { nref(pred) }.next[level]);
                    frame.set(1, curr);
                }

                if l_found == -1 && key == unsafe { nref(curr) }.key {
                    st.split();
                    l_found = level as i32;
                }
                hp_preds[level] = hp_pred;
                preds.set(level, pred);
                hp_succs[level] = hp_curr;
                succs.set(level, curr);

                if level > 0 {
                    st.split();
                    hp_pred = st.hp_alloc();
                    hp_curr = st.hp_alloc();
                }
            }

            break 'restart l_found;
        };

        st.stack_del();
        l_found
    }

    // ---------------------------------------------------------------------
    // contains
    // ---------------------------------------------------------------------

    fn present(l_found: i32, succs: &[*mut Node; MAX_LEVEL]) -> bool {
        if l_found < 0 {
            return false;
        }
        let s = unsafe { nref(succs[l_found as usize]) };
        s.fully_linked.load(Ordering::Acquire) && !s.marked.load(Ordering::Acquire)
    }

    pub fn contains_pure(&self, key: i32) -> bool {
        let mut preds = [ptr::null_mut(); MAX_LEVEL];
        let mut succs = [ptr::null_mut(); MAX_LEVEL];

        let l_found = self.find_pure(key, &mut preds, &mut succs);
        Self::present(l_found, &succs)
    }

    pub fn contains_hp(&self, st: &StThread, key: i32) -> bool {
        let mut preds = [ptr::null_mut(); MAX_LEVEL];
        let mut succs = [ptr::null_mut(); MAX_LEVEL];
        let mut hp_preds = [0; MAX_LEVEL];
        let mut hp_succs = [0; MAX_LEVEL];

        st.op_init();
        let l_found = self.find_hp(st, key, &mut preds, &mut succs, &mut hp_preds, &mut hp_succs);
        let res = Self::present(l_found, &succs);
        st.op_finish();

        res
    }

    pub fn contains_stacktrack(&self, st: &StThread, key: i32) -> bool {
        let mut hp_preds = [0; MAX_LEVEL];
        let mut hp_succs = [0; MAX_LEVEL];

        st.op_init();

        st.stack_init();
        let preds = st.stack_add_range(MAX_LEVEL);
        let succs = st.stack_add_range(MAX_LEVEL);
        st.stack_publish();

        st.split_start(OP_ID_CONTAINS);

        let l_found =
            self.find_stacktrack(st, key, &preds, &succs, &mut hp_preds, &mut hp_succs);
        let res = if l_found < 0 {
            false
        } else {
            let s = unsafe { nref(succs.get::<Node>(l_found as usize)) };
            s.fully_linked.load(Ordering::Acquire) && !s.marked.load(Ordering::Acquire)
        };

        st.split_finish();
        st.stack_del();
        st.op_finish();

        res
    }

    pub fn contains_forkscan(&self, key: i32) -> bool {
        self.contains_pure(key)
    }

    // ---------------------------------------------------------------------
    // insert
    // ---------------------------------------------------------------------

    pub fn insert_pure(&self, st: &StThread, rng: &mut impl Rng, key: i32) -> bool {
        let mut preds = [ptr::null_mut(); MAX_LEVEL];
        let mut succs = [ptr::null_mut(); MAX_LEVEL];

        let top_level = random_level(rng);

        loop {
            let l_found = self.find_pure(key, &mut preds, &mut succs);

            if l_found != -1 {
                let found = unsafe { nref(succs[l_found as usize]) };
                if !found.marked.load(Ordering::Acquire) {
                    // A concurrent insert of the same key is still linking;
                    // wait until it is visible, then report the duplicate.
                    while !found.fully_linked.load(Ordering::Acquire) {
                        cpu_relax();
                    }
                    return false;
                }
                continue; // pending remove, try again
            }

            let mut highest_locked = -1;
            let mut valid = true;
            let mut level = 0;
            while valid && level <= top_level {
                let pred = preds[level];
                let succ = succs[level];
                if level == 0 || preds[level] != preds[level - 1] {
                    // don't lock the same node twice
                    node_lock(st, unsafe { nref(pred) });
                }
                highest_locked = level as i32;

                valid = !unsafe { nref(pred) }.marked.load(Ordering::Acquire)
                    && !unsafe { nref(succ) }.marked.load(Ordering::Acquire)
                    && unsafe { nref(pred) }.next[level].load(Ordering::Acquire) == succ;
                level += 1;
            }

            let mut inserted = false;
            if valid {
                let node = Node::alloc(key, top_level);
                let n = unsafe { nref(node) };
                for l in 0..=top_level {
                    n.next[l].store(succs[l], Ordering::Relaxed);
                    unsafe { nref(preds[l]) }.next[l].store(node, Ordering::Release);
                }
                n.fully_linked.store(true, Ordering::Release);
                inserted = true;
            }

            for l in 0..(highest_locked + 1) as usize {
                if l == 0 || preds[l] != preds[l - 1] {
                    node_unlock(unsafe { nref(preds[l]) });
                }
            }

            if inserted {
                return true;
            }
        }
    }

    pub fn insert_hp(&self, st: &StThread, rng: &mut impl Rng, key: i32) -> bool {
        let mut preds = [ptr::null_mut(); MAX_LEVEL];
        let mut succs = [ptr::null_mut(); MAX_LEVEL];
        let mut hp_preds = [0; MAX_LEVEL];
        let mut hp_succs = [0; MAX_LEVEL];

        let top_level = random_level(rng);

        st.op_init();

        loop {
            st.hp_reset();

            let l_found =
                self.find_hp(st, key, &mut preds, &mut succs, &mut hp_preds, &mut hp_succs);

            if l_found != -1 {
                let found = unsafe { nref(succs[l_found as usize]) };
                if !found.marked.load(Ordering::Acquire) {
                    while !found.fully_linked.load(Ordering::Acquire) {
                        cpu_relax();
                    }
                    st.op_finish();
                    return false;
                }
                continue;
            }

            let mut highest_locked = -1;
            let mut valid = true;
            let mut level = 0;
            while valid && level <= top_level {
                let pred = preds[level];
                let succ = succs[level];
                if level == 0 || preds[level] != preds[level - 1] {
                    node_lock(st, unsafe { nref(pred) });
                }
                highest_locked = level as i32;

                valid = !unsafe { nref(pred) }.marked.load(Ordering::Acquire)
                    && !unsafe { nref(succ) }.marked.load(Ordering::Acquire)
                    && unsafe { nref(pred) }.next[level].load(Ordering::Acquire) == succ;
                level += 1;
            }

            let mut inserted = false;
            if valid {
                let node = Node::alloc(key, top_level);
                let n = unsafe { nref(node) };
                for l in 0..=top_level {
                    n.next[l].store(succs[l], Ordering::Relaxed);
                    unsafe { nref(preds[l]) }.next[l].store(node, Ordering::Release);
                }
                n.fully_linked.store(true, Ordering::Release);
                inserted = true;
            }

            for l in 0..(highest_locked + 1) as usize {
                if l == 0 || preds[l] != preds[l - 1] {
                    node_unlock(unsafe { nref(preds[l]) });
                }
            }

            if inserted {
                st.op_finish();
                return true;
            }
        }
    }

    pub fn insert_stacktrack(&self, st: &StThread, rng: &mut impl Rng, key: i32) -> bool {
        let mut hp_preds = [0; MAX_LEVEL];
        let mut hp_succs = [0; MAX_LEVEL];

        st.op_init();

        st.stack_init();
        let preds = st.stack_add_range(MAX_LEVEL);
        let succs = st.stack_add_range(MAX_LEVEL);
        let locals = st.stack_add_range(2); // found node, new node
        st.stack_publish();

        let top_level = random_level(rng);

        st.split_start(OP_ID_INSERT);

        loop {
            st.split();
            st.hp_reset();

            let l_found =
                self.find_stacktrack(st, key, &preds, &succs, &mut hp_preds, &mut hp_succs);

            if l_found != -1 {
                st.split();
                let found_ptr: *mut Node = succs.get(l_found as usize);
                locals.set(0, found_ptr);
                let found = unsafe { nref(found_ptr) };
                if !found.marked.load(Ordering::Acquire) {
                    st.split();
                    while !found.fully_linked.load(Ordering::Acquire) {
                        cpu_relax();
                    }
                    st.split_finish();
                    st.op_finish();
                    return false;
                }
                continue;
            }

            let mut highest_locked = -1;
            let mut valid = true;
            let mut level = 0;
            while valid && level <= top_level {
                st.split();
                let pred: *mut Node = preds.get(level);
                let succ: *mut Node = succs.get(level);
                if level == 0 || pred != preds.get::<Node>(level - 1) {
                    st.split();
                    node_lock(st, unsafe { nref(pred) });
                }
                highest_locked = level as i32;

                valid = !unsafe { nref(pred) }.marked.load(Ordering::Acquire)
                    && !unsafe { nref(succ) }.marked.load(Ordering::Acquire)
                    && unsafe { nref(pred) }.next[level].load(Ordering::Acquire) == succ;
                level += 1;
            }

            let mut inserted = false;
            if valid {
                st.split();
                let node = Node::alloc(key, top_level);
                locals.set(1, node);
                let n = unsafe { nref(node) };
                for l in 0..=top_level {
                    st.split();
                    n.next[l].store(succs.get(l), Ordering::Relaxed);
                    unsafe { nref(preds.get::<Node>(l)) }.next[l].store(node, Ordering::Release);
                }
                n.fully_linked.store(true, Ordering::Release);
                inserted = true;
            }

            for l in 0..(highest_locked + 1) as usize {
                st.split();
                if l == 0 || preds.get::<Node>(l) != preds.get::<Node>(l - 1) {
                    st.split();
                    node_unlock(unsafe { nref(preds.get::<Node>(l)) });
                }
            }

            if inserted {
                st.split_finish();
                st.stack_del();
                st.op_finish();
                return true;
            }
        }
    }

    pub fn insert_forkscan(&self, st: &StThread, rng: &mut impl Rng, key: i32) -> bool {
        let mut preds = [ptr::null_mut(); MAX_LEVEL];
        let mut succs = [ptr::null_mut(); MAX_LEVEL];

        let top_level = random_level(rng);

        loop {
            let l_found = self.find_pure(key, &mut preds, &mut succs);

            if l_found != -1 {
                let found = unsafe { nref(succs[l_found as usize]) };
                if !found.marked.load(Ordering::Acquire) {
                    while !found.fully_linked.load(Ordering::Acquire) {
                        cpu_relax();
                    }
                    return false;
                }
                continue;
            }

            let mut highest_locked = -1;
            let mut valid = true;
            let mut level = 0;
            while valid && level <= top_level {
                let pred = preds[level];
                let succ = succs[level];
                if level == 0 || preds[level] != preds[level - 1] {
                    node_lock(st, unsafe { nref(pred) });
                }
                highest_locked = level as i32;

                valid = !unsafe { nref(pred) }.marked.load(Ordering::Acquire)
                    && !unsafe { nref(succ) }.marked.load(Ordering::Acquire)
                    && unsafe { nref(pred) }.next[level].load(Ordering::Acquire) == succ;
                level += 1;
            }

            let mut inserted = false;
            if valid {
                // Allocation is tracked by the external collector.
                let node = forkscan::alloc(Node::new(key, top_level));
                let n = unsafe { nref(node) };
                for l in 0..=top_level {
                    n.next[l].store(succs[l], Ordering::Relaxed);
                    unsafe { nref(preds[l]) }.next[l].store(node, Ordering::Release);
                }
                n.fully_linked.store(true, Ordering::Release);
                inserted = true;
            }

            for l in 0..(highest_locked + 1) as usize {
                if l == 0 || preds[l] != preds[l - 1] {
                    node_unlock(unsafe { nref(preds[l]) });
                }
            }

            if inserted {
                return true;
            }
        }
    }

    // ---------------------------------------------------------------------
    // remove
    // ---------------------------------------------------------------------

    // Two-phase delete. Once the victim is locked and marked it stays both:
    // a failed predecessor validation only drops the predecessor locks and
    // retries with fresh predecessors. The traversal tolerates the marked
    // victim as a successor, so the owning remover always completes the
    // unlink.

    pub fn remove_pure(&self, st: &StThread, key: i32) -> bool {
        let mut preds = [ptr::null_mut(); MAX_LEVEL];
        let mut succs = [ptr::null_mut(); MAX_LEVEL];

        let mut victim: *mut Node = ptr::null_mut();
        let mut is_marked = false;
        let mut top_level = 0;

        loop {
            let l_found = self.find_pure(key, &mut preds, &mut succs);

            if !is_marked {
                if l_found == -1 {
                    return false;
                }
                victim = succs[l_found as usize];
                let v = unsafe { nref(victim) };
                if !(v.fully_linked.load(Ordering::Acquire)
                    && v.top_level == l_found as usize
                    && !v.marked.load(Ordering::Acquire))
                {
                    return false;
                }
                top_level = v.top_level;
                node_lock(st, v);
                if v.marked.load(Ordering::Acquire) {
                    node_unlock(v);
                    return false;
                }
                v.marked.store(true, Ordering::Release);
                is_marked = true;
            }

            let mut highest_locked = -1;
            let mut valid = true;
            let mut level = 0;
            while valid && level <= top_level {
                let pred = preds[level];
                if level == 0 || preds[level] != preds[level - 1] {
                    node_lock(st, unsafe { nref(pred) });
                }
                highest_locked = level as i32;

                valid = !unsafe { nref(pred) }.marked.load(Ordering::Acquire)
                    && unsafe { nref(pred) }.next[level].load(Ordering::Acquire) == victim;
                level += 1;
            }

            let mut removed = false;
            if valid {
                let v = unsafe { nref(victim) };
                for l in (0..=top_level).rev() {
                    let after = v.next[l].load(Ordering::Acquire);
                    unsafe { nref(preds[l]) }.next[l].store(after, Ordering::Release);
                    v.next[l].store(ptr::null_mut(), Ordering::Release);
                }
                node_unlock(v);
                removed = true;
            }

            for l in 0..(highest_locked + 1) as usize {
                if l == 0 || preds[l] != preds[l - 1] {
                    node_unlock(unsafe { nref(preds[l]) });
                }
            }

            if removed {
                return true;
            }
        }
    }

    pub fn remove_hp(&self, st: &StThread, key: i32) -> bool {
        let mut preds = [ptr::null_mut(); MAX_LEVEL];
        let mut succs = [ptr::null_mut(); MAX_LEVEL];
        let mut hp_preds = [0; MAX_LEVEL];
        let mut hp_succs = [0; MAX_LEVEL];

        let mut victim: *mut Node = ptr::null_mut();
        let mut is_marked = false;
        let mut top_level = 0;
        let mut removed = false;

        st.op_init();

        loop {
            st.hp_reset();

            let l_found =
                self.find_hp(st, key, &mut preds, &mut succs, &mut hp_preds, &mut hp_succs);

            if !is_marked {
                if l_found == -1 {
                    break;
                }
                victim = succs[l_found as usize];
                let v = unsafe { nref(victim) };
                if !(v.fully_linked.load(Ordering::Acquire)
                    && v.top_level == l_found as usize
                    && !v.marked.load(Ordering::Acquire))
                {
                    break;
                }
                top_level = v.top_level;
                node_lock(st, v);
                if v.marked.load(Ordering::Acquire) {
                    node_unlock(v);
                    break;
                }
                v.marked.store(true, Ordering::Release);
                is_marked = true;
                full_fence();
            }

            let mut highest_locked = -1;
            let mut valid = true;
            let mut level = 0;
            while valid && level <= top_level {
                let pred = preds[level];
                if level == 0 || preds[level] != preds[level - 1] {
                    node_lock(st, unsafe { nref(pred) });
                }
                highest_locked = level as i32;

                valid = !unsafe { nref(pred) }.marked.load(Ordering::Acquire)
                    && unsafe { nref(pred) }.next[level].load(Ordering::Acquire) == victim;
                level += 1;
            }

            if valid {
                let v = unsafe { nref(victim) };
                for l in (0..=top_level).rev() {
                    let after = v.next[l].load(Ordering::Acquire);
                    unsafe { nref(preds[l]) }.next[l].store(after, Ordering::Release);
                    v.next[l].store(ptr::null_mut(), Ordering::Release);
                }
                node_unlock(v);
                removed = true;
            }

            for l in 0..(highest_locked + 1) as usize {
                if l == 0 || preds[l] != preds[l - 1] {
                    node_unlock(unsafe { nref(preds[l]) });
                }
            }

            if removed {
                break;
            }
        }

        st.op_finish();

        if removed {
            // Safety: the victim is unlinked from every level and this
            // remover is its only owner now.
            unsafe { st.defer_free(victim) };
        }

        removed
    }

    pub fn remove_stacktrack(&self, st: &StThread, key: i32) -> bool {
        let mut hp_preds = [0; MAX_LEVEL];
        let mut hp_succs = [0; MAX_LEVEL];

        let mut victim: *mut Node = ptr::null_mut();
        let mut is_marked = false;
        let mut top_level = 0;
        let mut removed = false;

        st.op_init();

        st.stack_init();
        let preds = st.stack_add_range(MAX_LEVEL);
        let succs = st.stack_add_range(MAX_LEVEL);
        let locals = st.stack_add_range(1); // victim
        st.stack_publish();

        st.split_start(OP_ID_REMOVE);

        loop {
            st.split();
            st.hp_reset();

            let l_found =
                self.find_stacktrack(st, key, &preds, &succs, &mut hp_preds, &mut hp_succs);

            if !is_marked {
                if l_found == -1 {
                    st.split();
                    break;
                }
                victim = succs.get(l_found as usize);
                locals.set(0, victim);
                let v = unsafe { nref(victim) };
                if !(v.fully_linked.load(Ordering::Acquire)
                    && v.top_level == l_found as usize
                    && !v.marked.load(Ordering::Acquire))
                {
                    st.split();
                    break;
                }
                st.split();
                top_level = v.top_level;
                node_lock(st, v);
                if v.marked.load(Ordering::Acquire) {
                    st.split();
                    node_unlock(v);
                    break;
                }
                v.marked.store(true, Ordering::Release);
                is_marked = true;
            }

            let mut highest_locked = -1;
            let mut valid = true;
            let mut level = 0;
            while valid && level <= top_level {
                st.split();
                let pred: *mut Node = preds.get(level);
                if level == 0 || pred != preds.get::<Node>(level - 1) {
                    st.split();
                    node_lock(st, unsafe { nref(pred) });
                }
                highest_locked = level as i32;

                valid = !unsafe { nref(pred) }.marked.load(Ordering::Acquire)
                    && unsafe { nref(pred) }.next[level].load(Ordering::Acquire) == victim;
                level += 1;
            }

            if valid {
                st.split();
                let v = unsafe { nref(victim) };
                for l in (0..=top_level).rev() {
                    st.split();
                    let after = v.next[l].load(Ordering::Acquire);
                    unsafe { nref(preds.get::<Node>(l)) }.next[l].store(after, Ordering::Release);
                    v.next[l].store(ptr::null_mut(), Ordering::Release);
                }
                node_unlock(v);
                removed = true;
            }

            for l in 0..(highest_locked + 1) as usize {
                st.split();
                if l == 0 || preds.get::<Node>(l) != preds.get::<Node>(l - 1) {
                    st.split();
                    node_unlock(unsafe { nref(preds.get::<Node>(l)) });
                }
            }

            if removed {
                st.split();
                break;
            }
        }

        st.split_finish();
        st.stack_del();
        st.op_finish();

        if removed {
            // Safety: unlinked from every level; sole owner.
            unsafe { st.defer_free(victim) };
        }

        removed
    }

    pub fn remove_forkscan(&self, st: &StThread, key: i32) -> bool {
        let mut preds = [ptr::null_mut(); MAX_LEVEL];
        let mut succs = [ptr::null_mut(); MAX_LEVEL];

        let mut victim: *mut Node = ptr::null_mut();
        let mut is_marked = false;
        let mut top_level = 0;

        loop {
            let l_found = self.find_pure(key, &mut preds, &mut succs);

            if !is_marked {
                if l_found == -1 {
                    return false;
                }
                victim = succs[l_found as usize];
                let v = unsafe { nref(victim) };
                if !(v.fully_linked.load(Ordering::Acquire)
                    && v.top_level == l_found as usize
                    && !v.marked.load(Ordering::Acquire))
                {
                    return false;
                }
                top_level = v.top_level;
                node_lock(st, v);
                if v.marked.load(Ordering::Acquire) {
                    node_unlock(v);
                    return false;
                }
                v.marked.store(true, Ordering::Release);
                is_marked = true;
            }

            let mut highest_locked = -1;
            let mut valid = true;
            let mut level = 0;
            while valid && level <= top_level {
                let pred = preds[level];
                if level == 0 || preds[level] != preds[level - 1] {
                    node_lock(st, unsafe { nref(pred) });
                }
                highest_locked = level as i32;

                valid = !unsafe { nref(pred) }.marked.load(Ordering::Acquire)
                    && unsafe { nref(pred) }.next[level].load(Ordering::Acquire) == victim;
                level += 1;
            }

            let mut removed = false;
            if valid {
                let v = unsafe { nref(victim) };
                for l in (0..=top_level).rev() {
                    let after = v.next[l].load(Ordering::Acquire);
                    unsafe { nref(preds[l]) }.next[l].store(after, Ordering::Release);
                    v.next[l].store(ptr::null_mut(), Ordering::Release);
                }
                node_unlock(v);
                forkscan::retire(victim);
                removed = true;
            }

            for l in 0..(highest_locked + 1) as usize {
                if l == 0 || preds[l] != preds[l - 1] {
                    node_unlock(unsafe { nref(preds[l]) });
                }
            }

            if removed {
                return true;
            }
        }
    }

    // ---------------------------------------------------------------------
    // diagnostics
    // ---------------------------------------------------------------------

    /// Whether the set holds no elements. Like [`SkipList::size`], only
    /// meaningful at quiescence.
    pub fn is_empty(&self) -> bool {
        let head = self.head.load(Ordering::Acquire);
        unsafe { nref(head) }.next[0].load(Ordering::Acquire) == self.tail.load(Ordering::Acquire)
    }

    /// Number of elements, excluding both sentinels. Not linearizable; only
    /// meaningful at quiescence.
    pub fn size(&self) -> usize {
        let mut n = 0;
        let mut p = self.head.load(Ordering::Acquire);
        while !unsafe { nref(p) }.next[0].load(Ordering::Acquire).is_null() {
            n += 1;
            p = unsafe { nref(p) }.next[0].load(Ordering::Acquire);
        }
        n - 1 // the walk counted the head
    }

    /// Nodes linked at each level, excluding both sentinels.
    pub fn level_counts(&self) -> [usize; MAX_LEVEL] {
        let mut counts = [0; MAX_LEVEL];
        for (level, count) in counts.iter_mut().enumerate() {
            let mut n = 0;
            let mut p = self.head.load(Ordering::Acquire);
            while !unsafe { nref(p) }.next[level].load(Ordering::Acquire).is_null() {
                n += 1;
                p = unsafe { nref(p) }.next[level].load(Ordering::Acquire);
            }
            *count = n - 1;
        }
        counts
    }

    /// Print the per-level population plus the HTM and reclamation totals.
    pub fn print_stats(&self) {
        let counts = self.level_counts();

        println!("-------------------------------------------------");
        println!("  Skip-List status:");
        for level in (0..MAX_LEVEL).rev() {
            println!("    nodes on level[{}] = {}", level, counts[level]);
        }
        println!("-------------------------------------------------");

        htm::print_stats();
        crate::stacktrack::print_stats();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forkscan;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;
    use std::sync::Arc;
    use std::thread;

    fn test_thread() -> &'static StThread {
        StThread::register(50, 100)
    }

    fn rng() -> SmallRng {
        SmallRng::seed_from_u64(42)
    }

    /// Keys along the bottom level, sentinels excluded.
    fn bottom_keys(list: &SkipList) -> Vec<i32> {
        let mut keys = Vec::new();
        let mut p = list.head.load(Ordering::SeqCst);
        loop {
            let next = unsafe { nref(p) }.next[0].load(Ordering::SeqCst);
            if next.is_null() {
                break;
            }
            p = next;
            let n = unsafe { nref(p) };
            if !n.next[0].load(Ordering::SeqCst).is_null() {
                keys.push(n.key);
            }
        }
        keys
    }

    #[test]
    fn insert_dedup_and_size_pure() {
        let list = SkipList::new();
        let st = test_thread();
        let mut rng = rng();

        let mut accepted = 0;
        for key in [3, 1, 4, 1, 5, 9, 2, 6] {
            if list.insert_pure(st, &mut rng, key) {
                accepted += 1;
            }
        }

        assert_eq!(accepted, 7); // the second 1 is rejected
        assert_eq!(list.size(), 7);
        for key in [1, 2, 3, 4, 5, 6, 9] {
            assert!(list.contains_pure(key), "missing key {key}");
        }
        assert!(!list.contains_pure(7));
        assert_eq!(bottom_keys(&list), vec![1, 2, 3, 4, 5, 6, 9]);
    }

    #[test]
    fn insert_dedup_and_size_hp() {
        let list = SkipList::new();
        let st = test_thread();
        let mut rng = rng();

        let mut accepted = 0;
        for key in [3, 1, 4, 1, 5, 9, 2, 6] {
            if list.insert_hp(st, &mut rng, key) {
                accepted += 1;
            }
        }

        assert_eq!(accepted, 7);
        assert_eq!(list.size(), 7);
        for key in [1, 2, 3, 4, 5, 6, 9] {
            assert!(list.contains_hp(st, key), "missing key {key}");
        }
        assert!(!list.contains_hp(st, 8));
    }

    #[test]
    fn insert_dedup_and_size_stacktrack() {
        let list = SkipList::new();
        let st = test_thread();
        let mut rng = rng();

        let mut accepted = 0;
        for key in [3, 1, 4, 1, 5, 9, 2, 6] {
            if list.insert_stacktrack(st, &mut rng, key) {
                accepted += 1;
            }
        }

        assert_eq!(accepted, 7);
        assert_eq!(list.size(), 7);
        for key in [1, 2, 3, 4, 5, 6, 9] {
            assert!(list.contains_stacktrack(st, key), "missing key {key}");
        }
        assert!(!list.contains_stacktrack(st, 8));
    }

    #[test]
    fn remove_twice_reports_once() {
        let list = SkipList::new();
        let st = test_thread();
        let mut rng = rng();

        for key in 1..=8 {
            assert!(list.insert_pure(st, &mut rng, key));
        }

        assert!(list.remove_pure(st, 4));
        assert!(!list.remove_pure(st, 4));
        assert_eq!(list.size(), 7);
        assert!(!list.contains_pure(4));
        assert!(list.contains_pure(3));
        assert!(list.contains_pure(5));
    }

    #[test]
    fn remove_twice_reports_once_stacktrack() {
        let list = SkipList::new();
        let st = test_thread();
        let mut rng = rng();

        for key in 1..=8 {
            assert!(list.insert_stacktrack(st, &mut rng, key));
        }

        assert!(list.remove_stacktrack(st, 4));
        assert!(!list.remove_stacktrack(st, 4));
        assert_eq!(list.size(), 7);
        assert!(!list.contains_stacktrack(st, 4));
        assert!(list.contains_stacktrack(st, 3));
        assert!(list.contains_stacktrack(st, 5));
    }

    #[test]
    fn remove_absent_key_is_noop() {
        let list = SkipList::new();
        let st = test_thread();
        let mut rng = rng();

        assert!(list.is_empty());
        assert!(!list.remove_hp(st, 5));
        assert!(list.insert_hp(st, &mut rng, 5));
        assert!(!list.remove_hp(st, 6));
        assert_eq!(list.size(), 1);
        assert!(!list.is_empty());
    }

    #[test]
    fn bottom_level_is_strictly_increasing() {
        let list = SkipList::new();
        let st = test_thread();
        let mut rng = rng();

        for key in [20, 3, 15, 9, 27, 1, 12] {
            list.insert_pure(st, &mut rng, key);
        }
        list.remove_pure(st, 15);

        let keys = bottom_keys(&list);
        assert!(keys.windows(2).all(|w| w[0] < w[1]), "keys not sorted: {keys:?}");
    }

    #[test]
    fn level_counts_match_size() {
        let list = SkipList::new();
        let st = test_thread();
        let mut rng = rng();

        for key in 1..=64 {
            list.insert_pure(st, &mut rng, key);
        }

        let counts = list.level_counts();
        assert_eq!(counts[0], list.size());
        // Levels can only thin out going up.
        assert!(counts.windows(2).all(|w| w[1] <= w[0]));
    }

    #[test]
    fn forkscan_remove_retires_to_collector() {
        let list = SkipList::new();
        let st = test_thread();
        let mut rng = rng();

        for key in 1..=8 {
            assert!(list.insert_forkscan(st, &mut rng, key));
        }

        let before = forkscan::retired_count();
        assert!(list.remove_forkscan(st, 3));
        assert!(list.remove_forkscan(st, 7));
        assert!(!list.remove_forkscan(st, 3));

        assert_eq!(forkscan::retired_count() - before, 2);
        assert_eq!(list.size(), 6);
        assert!(list.contains_forkscan(1));
        assert!(!list.contains_forkscan(3));
    }

    #[test]
    fn concurrent_alternate_workload_hp_preserves_size() {
        let list = Arc::new(SkipList::new());
        let initial = 32;

        {
            let st = test_thread();
            let mut rng = rng();
            let mut added = 0;
            let mut key = 1;
            while added < initial {
                if list.insert_hp(st, &mut rng, key) {
                    added += 1;
                }
                key += 1;
            }
        }

        let mut handles = Vec::new();
        for t in 0..4u64 {
            let list = Arc::clone(&list);
            handles.push(thread::spawn(move || {
                let st = StThread::register(50, 16);
                let mut rng = SmallRng::seed_from_u64(100 + t);
                for _ in 0..500 {
                    let key = rng.random_range(1..64);
                    if list.insert_hp(st, &mut rng, key) {
                        assert!(list.remove_hp(st, key), "inserted key {key} vanished");
                    }
                }
                st.thread_finish();
            }));
        }
        for h in handles {
            h.join().expect("worker panicked");
        }

        assert_eq!(list.size() as i64, initial);
    }

    #[test]
    fn concurrent_mixed_workload_stacktrack() {
        let list = Arc::new(SkipList::new());

        let mut handles = Vec::new();
        for t in 0..4u64 {
            let list = Arc::clone(&list);
            handles.push(thread::spawn(move || {
                let st = StThread::register(50, 16);
                let mut rng = SmallRng::seed_from_u64(7 + t);
                let mut diff = 0i64;
                for _ in 0..400 {
                    let key = rng.random_range(1..128);
                    if rng.random::<u32>() % 2 == 0 {
                        if list.insert_stacktrack(st, &mut rng, key) {
                            diff += 1;
                        }
                    } else if list.remove_stacktrack(st, key) {
                        diff -= 1;
                    }
                }
                st.thread_finish();
                diff
            }));
        }

        let mut expected = 0i64;
        for h in handles {
            expected += h.join().expect("worker panicked");
        }

        assert_eq!(list.size() as i64, expected);
        let keys = bottom_keys(&list);
        assert!(keys.windows(2).all(|w| w[0] < w[1]));

        #[cfg(not(all(target_arch = "x86_64", target_feature = "rtm")))]
        {
            // Without HTM every segment runs on the slow path.
            assert!(crate::stacktrack::global_stats().n_slow_path_segments > 0);
        }
    }
}
