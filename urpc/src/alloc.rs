//! Payload allocator for a communicator's data area.
//!
//! The data area is treated as a circular buffer. Space is handed out by
//! bumping the `begin` of the active block of a pair of free blocks.
//! Nothing is freed per message: once the active block runs dry, a GC pass
//! rebuilds both blocks from the allocation records that are still
//! referenced by unfreed mailbox slots.
//!
//! The rebuild walks records from the newest back. Offsets decrease along
//! the way until the walk crosses the point where allocation wrapped to
//! offset 0; from there on the roles of the two blocks swap. Without a wrap
//! the free space is the tail behind the newest record plus the head in
//! front of the oldest. If the tail alone is too small it is folded into
//! the newest record and allocation restarts at the head.

use std::collections::VecDeque;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::layout::align8;
use crate::queue::ReqId;
use crate::wait::{Backoff, Deadline};

/// A free byte range `[begin, end)` of the data area.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FreeBlock {
    pub begin: usize,
    pub end: usize,
}

impl FreeBlock {
    #[inline]
    pub fn size(&self) -> usize {
        self.end.saturating_sub(self.begin)
    }
}

/// A reserved payload range. `len` is the requested, unaligned size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    pub offset: usize,
    pub len: usize,
}

/// Bytes of the data area reserved for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Record {
    req: ReqId,
    offset: usize,
    /// Aligned length, possibly grown by a tail fold.
    len: usize,
}

impl Record {
    fn end(&self) -> usize {
        self.offset + self.len
    }
}

/// Two-block bump allocator with batched reclamation.
pub struct PayloadAllocator {
    capacity: usize,
    blocks: [FreeBlock; 2],
    active: usize,
    records: VecDeque<Record>,
    timeout: Duration,
}

impl PayloadAllocator {
    /// Allocator over a data area of `capacity` bytes. `timeout` bounds how
    /// long [`allocate`](Self::allocate) keeps collecting.
    pub fn new(capacity: usize, timeout: Duration) -> Self {
        Self {
            capacity,
            blocks: [
                FreeBlock {
                    begin: 0,
                    end: capacity,
                },
                FreeBlock::default(),
            ],
            active: 0,
            records: VecDeque::new(),
            timeout,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The block currently bump-allocated from.
    pub fn active_block(&self) -> FreeBlock {
        self.blocks[self.active]
    }

    /// Both blocks and the index of the active one.
    pub fn blocks(&self) -> ([FreeBlock; 2], usize) {
        (self.blocks, self.active)
    }

    /// Reserves `size` bytes for request `req`.
    ///
    /// `is_referenced(id)` must report whether the payload of `id` may still
    /// be read, i.e. the id is unpublished or its slot is not yet free.
    /// Collects until space appears, failing with [`Error::AllocTimeout`]
    /// once the deadline passes.
    pub fn allocate(
        &mut self,
        req: ReqId,
        size: usize,
        is_referenced: impl Fn(ReqId) -> bool,
    ) -> Result<Allocation> {
        let deadline = Deadline::after(self.timeout);
        let mut backoff = Backoff::new();
        loop {
            if let Some(a) = self.try_allocate(req, size, &is_referenced)? {
                return Ok(a);
            }
            if deadline.expired() {
                tracing::warn!(size, req, "payload allocation timed out");
                return Err(Error::AllocTimeout { size });
            }
            backoff.spin();
        }
    }

    /// Single attempt of [`allocate`](Self::allocate): collects once and
    /// returns `None` if the space is still taken.
    pub fn try_allocate(
        &mut self,
        req: ReqId,
        size: usize,
        is_referenced: impl Fn(ReqId) -> bool,
    ) -> Result<Option<Allocation>> {
        if size > self.capacity {
            return Err(Error::PayloadTooLarge {
                size,
                max: self.capacity,
            });
        }
        if size == 0 {
            return Ok(Some(Allocation { offset: 0, len: 0 }));
        }
        let asize = align8(size);
        self.prune_front(&is_referenced);
        if self.active_block().size() < asize && self.collect(asize, &is_referenced) < asize {
            return Ok(None);
        }

        let block = &mut self.blocks[self.active];
        let offset = block.begin;
        block.begin += asize;

        // A retried request id replaces whatever it reserved before.
        while self.records.back().is_some_and(|r| r.req >= req) {
            self.records.pop_back();
        }
        self.records.push_back(Record {
            req,
            offset,
            len: asize,
        });
        tracing::trace!(req, offset, size, "allocated payload");
        Ok(Some(Allocation { offset, len: size }))
    }

    /// Rebuilds the free blocks from the referenced records and returns the
    /// size of the active block.
    ///
    /// Running it twice without any slot being freed in between leaves the
    /// same state.
    pub fn gc(&mut self, is_referenced: impl Fn(ReqId) -> bool) -> usize {
        self.rebuild(&is_referenced);
        self.active_block().size()
    }

    fn collect(&mut self, want: usize, is_referenced: &impl Fn(ReqId) -> bool) -> usize {
        let wrapped = self.rebuild(is_referenced);
        if self.active_block().size() < want && !wrapped {
            self.fold_tail_and_switch();
        }
        let free = self.active_block().size();
        tracing::debug!(
            want,
            free,
            wrapped,
            live = self.records.len(),
            "payload gc"
        );
        free
    }

    /// Returns true if the referenced records wrap around offset 0.
    fn rebuild(&mut self, is_referenced: &impl Fn(ReqId) -> bool) -> bool {
        self.records.retain(|r| is_referenced(r.req));

        let full = FreeBlock {
            begin: 0,
            end: self.capacity,
        };
        self.blocks = [full, full];
        let mut sw = 0;
        let mut newer_begin = usize::MAX;
        for r in self.records.iter().rev() {
            if r.offset > newer_begin {
                sw = 1;
            }
            let bump = &mut self.blocks[sw];
            bump.begin = bump.begin.max(r.end());
            let bound = &mut self.blocks[(1 + sw) % 2];
            bound.end = bound.end.min(r.offset);
            newer_begin = r.offset;
        }
        self.active = 0;
        sw == 1
    }

    /// Hands the unusable tail to the newest record so it is reclaimed
    /// with it, then allocates from the head block instead.
    fn fold_tail_and_switch(&mut self) {
        let tail = self.blocks[self.active];
        if let Some(newest) = self.records.back_mut() {
            debug_assert_eq!(newest.end(), tail.begin);
            newest.len = tail.end - newest.offset;
        }
        self.blocks[self.active] = FreeBlock::default();
        self.active = (self.active + 1) % 2;
    }

    fn prune_front(&mut self, is_referenced: &impl Fn(ReqId) -> bool) {
        while self.records.front().is_some_and(|r| !is_referenced(r.req)) {
            self.records.pop_front();
        }
    }

    /// Ranges still reserved, oldest first.
    pub fn reserved(&self) -> impl Iterator<Item = (ReqId, std::ops::Range<usize>)> + '_ {
        self.records.iter().map(|r| (r.req, r.offset..r.end()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashSet;

    struct Live(RefCell<HashSet<ReqId>>);

    impl Live {
        fn new() -> Self {
            Live(RefCell::new(HashSet::new()))
        }
        fn add(&self, req: ReqId) {
            self.0.borrow_mut().insert(req);
        }
        fn free(&self, req: ReqId) {
            self.0.borrow_mut().remove(&req);
        }
        fn check(&self) -> impl Fn(ReqId) -> bool + '_ {
            |req| self.0.borrow().contains(&req)
        }
    }

    fn alloc(a: &mut PayloadAllocator, live: &Live, req: ReqId, size: usize) -> Result<Allocation> {
        live.add(req);
        let r = a.allocate(req, size, live.check());
        if r.is_err() {
            live.free(req);
        }
        r
    }

    #[test]
    fn test_bump_and_align() {
        let live = Live::new();
        let mut a = PayloadAllocator::new(1024, Duration::ZERO);
        assert_eq!(alloc(&mut a, &live, 0, 13).unwrap(), Allocation { offset: 0, len: 13 });
        assert_eq!(alloc(&mut a, &live, 1, 8).unwrap(), Allocation { offset: 16, len: 8 });
        assert_eq!(a.active_block(), FreeBlock { begin: 24, end: 1024 });
    }

    #[test]
    fn test_reclaim_after_gc() {
        let live = Live::new();
        let mut a = PayloadAllocator::new(16384, Duration::from_millis(5));
        assert_eq!(alloc(&mut a, &live, 0, 4096).unwrap().offset, 0);
        assert_eq!(alloc(&mut a, &live, 1, 8192).unwrap().offset, 4096);
        assert_eq!(alloc(&mut a, &live, 2, 4096).unwrap().offset, 12288);

        assert!(matches!(
            alloc(&mut a, &live, 3, 12000),
            Err(Error::AllocTimeout { size: 12000 })
        ));
        assert_eq!(a.try_allocate(3, 12000, live.check()).unwrap(), None);

        live.free(0);
        live.free(1);
        a.gc(live.check());
        let got = alloc(&mut a, &live, 3, 12000).unwrap();
        assert_eq!(got, Allocation { offset: 0, len: 12000 });
        assert_eq!(a.active_block(), FreeBlock { begin: 12000, end: 12288 });
    }

    #[test]
    fn test_wrap_swaps_roles() {
        let live = Live::new();
        let mut a = PayloadAllocator::new(1000, Duration::ZERO);
        for req in 0..4 {
            alloc(&mut a, &live, req, 200).unwrap();
        }
        live.free(0);
        live.free(1);
        // Tail [800, 1000) is too small for 300; the head [0, 400) is not.
        let w = alloc(&mut a, &live, 4, 300).unwrap();
        assert_eq!(w.offset, 0);

        // Now wrapped: free space lies between the newest and the oldest.
        live.free(2);
        let free = a.gc(live.check());
        assert_eq!(a.active_block(), FreeBlock { begin: 304, end: 600 });
        assert_eq!(free, 296);

        // The oldest record took the folded tail with it.
        live.free(3);
        a.gc(live.check());
        assert_eq!(a.active_block(), FreeBlock { begin: 304, end: 1000 });
    }

    #[test]
    fn test_empty_gc_resets_to_full() {
        let live = Live::new();
        let mut a = PayloadAllocator::new(512, Duration::ZERO);
        alloc(&mut a, &live, 0, 64).unwrap();
        live.free(0);
        assert_eq!(a.gc(live.check()), 512);
        assert_eq!(a.reserved().count(), 0);
    }

    #[test]
    fn test_too_large() {
        let live = Live::new();
        let mut a = PayloadAllocator::new(512, Duration::ZERO);
        assert!(matches!(
            alloc(&mut a, &live, 0, 513),
            Err(Error::PayloadTooLarge { size: 513, max: 512 })
        ));
        assert_eq!(alloc(&mut a, &live, 0, 0).unwrap().len, 0);
        assert_eq!(a.reserved().count(), 0);
    }

    #[test]
    fn test_retry_replaces_record() {
        let live = Live::new();
        let mut a = PayloadAllocator::new(512, Duration::ZERO);
        alloc(&mut a, &live, 0, 64).unwrap();
        alloc(&mut a, &live, 0, 32).unwrap();
        let reserved: Vec<_> = a.reserved().collect();
        assert_eq!(reserved, vec![(0, 64..96)]);
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        const CAP: usize = 4096;

        #[derive(Debug, Clone)]
        enum Op {
            Alloc(usize),
            FreeOldest,
            FreeAny(usize),
            Gc,
        }

        fn op() -> impl Strategy<Value = Op> {
            prop_oneof![
                4 => (1usize..900).prop_map(Op::Alloc),
                2 => Just(Op::FreeOldest),
                1 => (0usize..64).prop_map(Op::FreeAny),
                1 => Just(Op::Gc),
            ]
        }

        fn overlaps(a: &std::ops::Range<usize>, b: &std::ops::Range<usize>) -> bool {
            a.start < b.end && b.start < a.end
        }

        proptest! {
            #[test]
            fn live_ranges_never_overlap(ops in proptest::collection::vec(op(), 1..300)) {
                let live = Live::new();
                let mut a = PayloadAllocator::new(CAP, Duration::ZERO);
                let mut order: Vec<ReqId> = Vec::new();
                let mut given: Vec<(ReqId, std::ops::Range<usize>)> = Vec::new();
                let mut next = 0;

                for op in ops {
                    match op {
                        Op::Alloc(size) => {
                            if let Ok(got) = alloc(&mut a, &live, next, size) {
                                prop_assert!(got.offset + size <= CAP);
                                given.push((next, got.offset..got.offset + size));
                                order.push(next);
                                next += 1;
                            }
                        }
                        Op::FreeOldest => {
                            if !order.is_empty() {
                                live.free(order.remove(0));
                            }
                        }
                        Op::FreeAny(i) => {
                            if !order.is_empty() {
                                let i = i % order.len();
                                live.free(order.remove(i));
                            }
                        }
                        Op::Gc => {
                            let before = a.gc(live.check());
                            let state = a.blocks();
                            prop_assert_eq!(a.gc(live.check()), before);
                            prop_assert_eq!(a.blocks(), state);
                        }
                    }

                    let alive: Vec<_> = given
                        .iter()
                        .filter(|(req, _)| live.0.borrow().contains(req))
                        .cloned()
                        .collect();
                    let active = a.active_block();
                    let free = active.begin..active.end.max(active.begin);
                    for (i, (_, r)) in alive.iter().enumerate() {
                        prop_assert!(!overlaps(r, &free), "{:?} overlaps free {:?}", r, free);
                        for (_, other) in &alive[i + 1..] {
                            prop_assert!(!overlaps(r, other), "{:?} overlaps {:?}", r, other);
                        }
                    }
                }
            }
        }
    }
}
