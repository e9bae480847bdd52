//! The segmented stack.
//!
//! The evaluator's stack is a linked chain of fixed-size segments. Exactly
//! one segment is active; pushes and pops touch only the active segment,
//! spilling into a fresh segment on overflow and dropping back to the
//! predecessor on underflow.
//!
//! Capturing a continuation clones the active segment and shares the rest
//! of the chain by bumping reference counts. A shared segment is immutable:
//! popping into one clones it first (copy-on-write), so mutations after a
//! capture can never be observed through the captured handle.
//!
//! Segments live in an index-keyed store rather than behind owning
//! pointers, so releasing a chain can hand the cell references held by its
//! elements back to the object pool.

use crate::vm::pool::Pool;
use crate::vm::value::Value;

pub const DEFAULT_SEGMENT_SIZE: u32 = 256;
pub const MIN_SEGMENT_SIZE: u32 = 64;
pub const MAX_SEGMENT_SIZE: u32 = 1024 * 1024;

/// Opaque handle to a saved stack head, as stored in continuation cells.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct StackHandle(u32);

const NONE: u32 = u32::MAX;

struct Segment {
    /// Previous segment in the chain, `NONE` at the bottom.
    prev: u32,
    /// Owners: the active pointer or a saved handle, plus one per successor
    /// segment linking here.
    refcnt: u32,
    elems: Vec<Value>,
}

pub struct SegmentStore {
    segs: Vec<Segment>,
    free: Vec<u32>,
    seg_len: usize,
    active: u32,
}

impl SegmentStore {
    pub fn new(seg_len: u32) -> SegmentStore {
        let seg_len = seg_len as usize;
        SegmentStore {
            segs: vec![Segment {
                prev: NONE,
                refcnt: 1,
                elems: Vec::with_capacity(seg_len),
            }],
            free: Vec::new(),
            seg_len,
            active: 0,
        }
    }

    fn alloc_seg(&mut self, prev: u32, elems: Vec<Value>) -> u32 {
        if let Some(idx) = self.free.pop() {
            let seg = &mut self.segs[idx as usize];
            seg.prev = prev;
            seg.refcnt = 1;
            seg.elems = elems;
            idx
        } else {
            self.segs.push(Segment {
                prev,
                refcnt: 1,
                elems,
            });
            (self.segs.len() - 1) as u32
        }
    }

    fn free_seg(&mut self, idx: u32) {
        debug_assert!(self.segs[idx as usize].elems.is_empty());
        self.free.push(idx);
    }

    /// Clones one segment: elements are copied (bumping the pool references
    /// they carry) and the `prev` chain is shared.
    fn clone_seg(&mut self, src: u32, pool: &mut Pool) -> u32 {
        let (prev, elems) = {
            let seg = &self.segs[src as usize];
            (seg.prev, seg.elems.clone())
        };
        for &v in &elems {
            pool.addref_value(v);
        }
        if prev != NONE {
            self.segs[prev as usize].refcnt += 1;
        }
        self.alloc_seg(prev, elems)
    }

    /// Freezes the active segment as the predecessor of a fresh one.
    fn overflow(&mut self) {
        let prev = self.active;
        self.active = self.alloc_seg(prev, Vec::with_capacity(self.seg_len));
    }

    /// Drops the emptied active segment and adopts its predecessor, cloning
    /// first when the predecessor is shared. False at the stack bottom.
    fn drop_active(&mut self, pool: &mut Pool) -> bool {
        let prev = self.segs[self.active as usize].prev;
        if prev == NONE {
            return false;
        }
        self.free_seg(self.active);
        if self.segs[prev as usize].refcnt > 1 {
            let clone = self.clone_seg(prev, pool);
            self.segs[prev as usize].refcnt -= 1;
            self.active = clone;
        } else {
            self.active = prev;
        }
        true
    }

    #[inline]
    fn room(&self, n: usize) -> bool {
        self.segs[self.active as usize].elems.len() + n <= self.seg_len
    }

    /// Pushes one value. The stack takes over the reference the value
    /// carries.
    #[inline]
    pub fn push(&mut self, v: Value) {
        if !self.room(1) {
            self.overflow();
        }
        self.segs[self.active as usize].elems.push(v);
    }

    /// Pushes two values; `b` ends up on top.
    pub fn push2(&mut self, a: Value, b: Value) {
        if !self.room(2) {
            self.overflow();
        }
        let elems = &mut self.segs[self.active as usize].elems;
        elems.push(a);
        elems.push(b);
    }

    /// Pushes three values; `c` ends up on top. The bulk variants keep the
    /// `s2` reduction on the fast path and keep its pushes within a single
    /// segment.
    pub fn push3(&mut self, a: Value, b: Value, c: Value) {
        if !self.room(3) {
            self.overflow();
        }
        let elems = &mut self.segs[self.active as usize].elems;
        elems.push(a);
        elems.push(b);
        elems.push(c);
    }

    /// Pushes four values; `d` ends up on top.
    pub fn push4(&mut self, a: Value, b: Value, c: Value, d: Value) {
        if !self.room(4) {
            self.overflow();
        }
        let elems = &mut self.segs[self.active as usize].elems;
        elems.push(a);
        elems.push(b);
        elems.push(c);
        elems.push(d);
    }

    /// Reads the top of the logical stack without removing it.
    pub fn top(&self) -> Option<Value> {
        let mut cur = self.active;
        while cur != NONE {
            let seg = &self.segs[cur as usize];
            if let Some(&v) = seg.elems.last() {
                return Some(v);
            }
            cur = seg.prev;
        }
        None
    }

    /// Pops the top value, handing its reference to the caller. `None` on
    /// underflow.
    pub fn pop(&mut self, pool: &mut Pool) -> Option<Value> {
        loop {
            if let Some(v) = self.segs[self.active as usize].elems.pop() {
                return Some(v);
            }
            if !self.drop_active(pool) {
                return None;
            }
        }
    }

    /// Swaps `v` with the element one below the top of the active segment,
    /// returning the displaced element. `None` when fewer than two elements
    /// are available there.
    pub fn xch(&mut self, v: Value, pool: &mut Pool) -> Option<Value> {
        while self.segs[self.active as usize].elems.is_empty() {
            if !self.drop_active(pool) {
                return None;
            }
        }
        let elems = &mut self.segs[self.active as usize].elems;
        let n = elems.len();
        if n < 2 {
            return None;
        }
        let old = elems[n - 2];
        elems[n - 2] = v;
        Some(old)
    }

    /// Captures the current stack: clones the active segment, shares the
    /// rest of the chain. The returned handle owns the clone.
    pub fn save(&mut self, pool: &mut Pool) -> StackHandle {
        StackHandle(self.clone_seg(self.active, pool))
    }

    /// Deep-clones the head segment of a saved handle. Used when a shared
    /// continuation is reinstated, so each invocation gets a private head.
    pub fn dup(&mut self, handle: StackHandle, pool: &mut Pool) -> StackHandle {
        StackHandle(self.clone_seg(handle.0, pool))
    }

    /// Makes `handle` the active stack, releasing the old chain.
    pub fn resume(&mut self, handle: StackHandle, pool: &mut Pool) {
        let old = self.active;
        self.active = handle.0;
        self.discard_chain(StackHandle(old), pool);
        pool.drain(self);
    }

    /// Releases a saved chain whose continuation is dropped without being
    /// reinstated.
    pub fn discard(&mut self, handle: StackHandle, pool: &mut Pool) {
        self.discard_chain(handle, pool);
        pool.drain(self);
    }

    /// Walks a chain releasing one ownership per segment; elements of freed
    /// segments are deferred into the pool's worklist, not released inline.
    pub(crate) fn discard_chain(&mut self, handle: StackHandle, pool: &mut Pool) {
        let mut cur = handle.0;
        while cur != NONE {
            let seg = &mut self.segs[cur as usize];
            debug_assert!(seg.refcnt > 0, "release of a free segment");
            seg.refcnt -= 1;
            if seg.refcnt > 0 {
                break;
            }
            let prev = seg.prev;
            for v in seg.elems.drain(..) {
                pool.defer(v);
            }
            self.free.push(cur);
            cur = prev;
        }
    }

    /// Number of live segments.
    pub fn live(&self) -> usize {
        self.segs.len() - self.free.len()
    }

    /// All values held by live segments, each segment counted once.
    #[cfg(test)]
    pub(crate) fn elements(&self) -> impl Iterator<Item = Value> + '_ {
        self.segs
            .iter()
            .enumerate()
            .filter(move |(i, _)| !self.free.contains(&(*i as u32)))
            .flat_map(|(_, seg)| seg.elems.iter().copied())
    }

    #[cfg(test)]
    fn chain_of(&self, head: u32) -> Vec<Value> {
        let mut out = Vec::new();
        let mut cur = head;
        while cur != NONE {
            let seg = &self.segs[cur as usize];
            for &v in seg.elems.iter().rev() {
                out.push(v);
            }
            cur = seg.prev;
        }
        out.reverse();
        out
    }

    /// Logical contents of the active stack, oldest first.
    #[cfg(test)]
    pub(crate) fn snapshot(&self) -> Vec<Value> {
        self.chain_of(self.active)
    }

    /// Logical contents visible through a saved handle, oldest first.
    #[cfg(test)]
    pub(crate) fn snapshot_of(&self, handle: StackHandle) -> Vec<Value> {
        self.chain_of(handle.0)
    }
}
