//! The object pool.
//!
//! An arena of two-slot cells addressed by 32-bit index, with explicit
//! reference counts. Partial applications (`k1`, `s1`, `s2`, the `d`
//! promises) store one or two function values; captured continuations store
//! a stack handle plus a text address. The object graph is acyclic (a cell
//! can only reference cells that existed before it), so plain reference
//! counting reclaims everything.
//!
//! Releasing a cell may cascade into its slots and, for continuation cells,
//! into whole stack segment chains. The cascade runs over an explicit
//! worklist rather than the call stack.

use crate::vm::stack::{SegmentStore, StackHandle};
use crate::vm::value::Value;

pub const DEFAULT_POOL_SIZE: u32 = 1024 * 1024;
pub const MIN_POOL_SIZE: u32 = 16;
pub const MAX_POOL_SIZE: u32 = 16 * 1024 * 1024;

/// Cell payload. The continuation case owns the saved stack chain.
#[derive(Clone, Copy, Debug)]
pub(crate) enum Cell {
    One(Value),
    Two(Value, Value),
    Cont { stack: StackHandle, ip: u32 },
}

#[derive(Debug)]
struct Entry {
    refcnt: u32,
    cell: Cell,
}

pub struct Pool {
    entries: Vec<Entry>,
    /// Free cells available for reuse.
    holes: Vec<u32>,
    limit: u32,
    /// Deferred releases, drained iteratively.
    pending: Vec<u32>,
}

impl Pool {
    /// Creates a pool of at most `limit` cells. `ins_len` sizes the release
    /// worklist, which amortizes deep decref chains.
    pub fn new(limit: u32, ins_len: usize) -> Pool {
        Pool {
            entries: Vec::new(),
            holes: Vec::new(),
            limit,
            pending: Vec::with_capacity(ins_len),
        }
    }

    fn alloc(&mut self, cell: Cell) -> Option<u32> {
        if let Some(idx) = self.holes.pop() {
            self.entries[idx as usize] = Entry { refcnt: 1, cell };
            return Some(idx);
        }
        if self.entries.len() >= self.limit as usize {
            return None;
        }
        self.entries.push(Entry { refcnt: 1, cell });
        Some((self.entries.len() - 1) as u32)
    }

    /// Allocates a cell with one slot filled. Returns `None` when both the
    /// bump frontier and the free list are exhausted.
    #[inline]
    pub fn alloc1(&mut self, v1: Value) -> Option<u32> {
        self.alloc(Cell::One(v1))
    }

    /// Allocates a cell with both slots filled.
    #[inline]
    pub fn alloc2(&mut self, v1: Value, v2: Value) -> Option<u32> {
        self.alloc(Cell::Two(v1, v2))
    }

    /// Allocates a continuation cell. The cell takes ownership of `stack`.
    #[inline]
    pub fn alloc_cont(&mut self, stack: StackHandle, ip: u32) -> Option<u32> {
        self.alloc(Cell::Cont { stack, ip })
    }

    /// Reads the first slot. Does not adjust the reference count.
    #[inline]
    pub fn get1(&self, idx: u32) -> Value {
        match self.entries[idx as usize].cell {
            Cell::One(v) | Cell::Two(v, _) => v,
            Cell::Cont { .. } => unreachable!("function cell expected"),
        }
    }

    /// Reads both slots. Does not adjust the reference count.
    #[inline]
    pub fn get2(&self, idx: u32) -> (Value, Value) {
        match self.entries[idx as usize].cell {
            Cell::Two(v1, v2) => (v1, v2),
            _ => unreachable!("two-slot cell expected"),
        }
    }

    /// Reads a continuation cell. Ownership of the handle stays with the
    /// cell; see [`Pool::take_cont`] for the single-reference fast path.
    #[inline]
    pub fn cont(&self, idx: u32) -> (StackHandle, u32) {
        match self.entries[idx as usize].cell {
            Cell::Cont { stack, ip } => (stack, ip),
            _ => unreachable!("continuation cell expected"),
        }
    }

    /// Moves the saved stack out of a continuation cell with a single
    /// reference. The cell stays allocated (its final release is a plain
    /// decref) but no longer owns the chain.
    pub fn take_cont(&mut self, idx: u32) -> (StackHandle, u32) {
        let entry = &mut self.entries[idx as usize];
        debug_assert_eq!(entry.refcnt, 1);
        match entry.cell {
            Cell::Cont { stack, ip } => {
                entry.cell = Cell::One(Value::new(crate::vm::value::FnKind::V));
                (stack, ip)
            }
            _ => unreachable!("continuation cell expected"),
        }
    }

    #[inline]
    pub fn refcount(&self, idx: u32) -> u32 {
        self.entries[idx as usize].refcnt
    }

    #[inline]
    pub fn addref(&mut self, idx: u32) {
        self.entries[idx as usize].refcnt += 1;
    }

    /// Bumps the cell reference a value carries, if any.
    #[inline]
    pub fn addref_value(&mut self, v: Value) {
        if v.kind.holds_ref() {
            self.addref(v.idx);
        }
    }

    /// Releases one reference to a cell, cascading through slots and
    /// captured stacks.
    pub fn free(&mut self, idx: u32, segs: &mut SegmentStore) {
        self.pending.push(idx);
        self.drain(segs);
    }

    /// Releases the cell reference a value carries, if any.
    #[inline]
    pub fn release(&mut self, v: Value, segs: &mut SegmentStore) {
        if v.kind.holds_ref() {
            self.free(v.idx, segs);
        }
    }

    /// Queues one release without draining. Used by the stack layer while a
    /// drain is already in progress.
    #[inline]
    pub(crate) fn defer(&mut self, v: Value) {
        if v.kind.holds_ref() {
            self.pending.push(v.idx);
        }
    }

    pub(crate) fn drain(&mut self, segs: &mut SegmentStore) {
        while let Some(idx) = self.pending.pop() {
            let entry = &mut self.entries[idx as usize];
            debug_assert!(entry.refcnt > 0, "release of a free cell");
            entry.refcnt -= 1;
            if entry.refcnt > 0 {
                continue;
            }
            let cell = entry.cell;
            self.holes.push(idx);
            match cell {
                Cell::One(a) => self.defer(a),
                Cell::Two(a, b) => {
                    self.defer(a);
                    self.defer(b);
                }
                // Continuation destroyed before reinstatement.
                Cell::Cont { stack, .. } => segs.discard_chain(stack, self),
            }
        }
    }

    /// Number of live (referenced) cells.
    pub fn live(&self) -> usize {
        self.entries.len() - self.holes.len()
    }

    #[cfg(test)]
    pub(crate) fn live_cells(&self) -> impl Iterator<Item = (u32, u32, Cell)> + '_ {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.refcnt > 0)
            .map(|(i, e)| (i as u32, e.refcnt, e.cell))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::vm::value::FnKind;

    fn fixture() -> (Pool, SegmentStore) {
        (Pool::new(64, 16), SegmentStore::new(8))
    }

    #[test]
    fn alloc_and_release() {
        let (mut pool, mut segs) = fixture();
        let idx = pool.alloc1(Value::new(FnKind::I)).unwrap();
        assert_eq!(pool.refcount(idx), 1);
        assert_eq!(pool.live(), 1);
        pool.free(idx, &mut segs);
        assert_eq!(pool.live(), 0);
    }

    #[test]
    fn holes_are_reused() {
        let (mut pool, mut segs) = fixture();
        let a = pool.alloc1(Value::new(FnKind::K)).unwrap();
        let b = pool.alloc1(Value::new(FnKind::S)).unwrap();
        pool.free(a, &mut segs);
        let c = pool.alloc1(Value::new(FnKind::V)).unwrap();
        assert_eq!(c, a);
        assert_ne!(b, c);
    }

    #[test]
    fn addref_keeps_cells_alive() {
        let (mut pool, mut segs) = fixture();
        let idx = pool.alloc1(Value::new(FnKind::I)).unwrap();
        pool.addref(idx);
        pool.free(idx, &mut segs);
        assert_eq!(pool.live(), 1);
        pool.free(idx, &mut segs);
        assert_eq!(pool.live(), 0);
    }

    #[test]
    fn release_cascades_through_slots() {
        let (mut pool, mut segs) = fixture();
        let inner = pool.alloc1(Value::new(FnKind::I)).unwrap();
        let outer = pool
            .alloc2(
                Value::with_index(FnKind::K1, inner),
                Value::new(FnKind::V),
            )
            .unwrap();
        assert_eq!(pool.live(), 2);
        pool.free(outer, &mut segs);
        assert_eq!(pool.live(), 0);
    }

    #[test]
    fn deep_chain_release_is_iterative() {
        let (mut pool, mut segs) = (Pool::new(1024, 16), SegmentStore::new(8));
        let mut idx = pool.alloc1(Value::new(FnKind::I)).unwrap();
        for _ in 0..1000 {
            idx = pool.alloc1(Value::with_index(FnKind::K1, idx)).unwrap();
        }
        assert_eq!(pool.live(), 1001);
        pool.free(idx, &mut segs);
        assert_eq!(pool.live(), 0);
    }

    #[test]
    fn exhaustion_reports_none() {
        let (mut pool, mut segs) = (Pool::new(MIN_POOL_SIZE, 16), SegmentStore::new(8));
        let mut cells = Vec::new();
        for _ in 0..MIN_POOL_SIZE {
            cells.push(pool.alloc1(Value::new(FnKind::I)).unwrap());
        }
        assert!(pool.alloc1(Value::new(FnKind::I)).is_none());
        pool.free(cells.pop().unwrap(), &mut segs);
        assert!(pool.alloc1(Value::new(FnKind::I)).is_some());
    }

    #[test]
    fn dropped_continuation_releases_its_stack() {
        let (mut pool, mut segs) = fixture();
        let inner = pool.alloc1(Value::new(FnKind::I)).unwrap();
        segs.push(Value::with_index(FnKind::K1, inner));
        let handle = segs.save(&mut pool);
        // The save cloned the element, so the cell now has two owners.
        assert_eq!(pool.refcount(inner), 2);
        let cont = pool.alloc_cont(handle, 0).unwrap();
        pool.free(cont, &mut segs);
        assert_eq!(pool.refcount(inner), 1);
        assert_eq!(pool.live(), 1);
    }
}
