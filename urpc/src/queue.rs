//! Transfer queue: the mailbox ring of one communicator.
//!
//! One process produces into a communicator, the other consumes from it.
//! The producer owns `last_put` and writes slot words; the consumer owns
//! `last_get` and clears command tags when it is done with a slot. A
//! producer may reuse a slot only after observing its tag as
//! [`Command::NONE`], which bounds production to the ring depth.
//!
//! Every cross-process access is fenced on both sides. The counterpart
//! may run on a weakly ordered core, so nothing here relies on implicit
//! store-store or load-load ordering.

use std::collections::BTreeSet;
use std::sync::atomic::{Ordering, fence};
use std::time::Duration;

use bitflags::bitflags;

use crate::error::{Error, Result};
use crate::layout::{
    Geometry, LAST_GET_OFFSET, LAST_PUT_OFFSET, MAILBOX_OFFSET, RECEIVER_FLAGS_OFFSET,
    SENDER_FLAGS_OFFSET,
};
use crate::mailbox::{Command, Mailbox};
use crate::region::Region;
use crate::wait::{Backoff, Deadline};

/// Request id. Ids are assigned by [`TransferQueue::publish`] starting at 0.
pub type ReqId = u64;

bitflags! {
    /// Side-channel liveness flags of a communicator.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Flags: u32 {
        /// The owner of the flag word is idle.
        const SLEEPING = 1 << 0;
        /// The owner hit an exception.
        const EXCEPTION = 1 << 1;
        /// The owner has exited.
        const EXITED = 1 << 2;
        /// The owner finished initialization and is attached.
        const ATTACHED = 1 << 3;
    }
}

#[inline]
fn full_fence() {
    fence(Ordering::SeqCst);
}

/// View of one communicator's ring plus consumer-local bookkeeping.
pub struct TransferQueue {
    block: Region,
    geo: Geometry,
    /// Ids consumed by [`take`](Self::take) before `last_get` reached them.
    ahead: BTreeSet<i64>,
}

impl TransferQueue {
    /// Wraps the communicator block at `block`.
    pub fn new(block: Region, geo: Geometry) -> Self {
        assert_eq!(block.len(), geo.comm_size());
        Self {
            block,
            geo,
            ahead: BTreeSet::new(),
        }
    }

    /// Resets counters, flags and every slot. Only the segment creator
    /// calls this, before the other side attaches.
    pub fn init(&self) {
        self.block.store_u32(SENDER_FLAGS_OFFSET, 0);
        self.block.store_u32(RECEIVER_FLAGS_OFFSET, 0);
        self.block.store_i64(LAST_PUT_OFFSET, -1);
        self.block.store_i64(LAST_GET_OFFSET, -1);
        for slot in 0..self.geo.slots() as usize {
            self.block.store_u64(MAILBOX_OFFSET + slot * 8, 0);
        }
        full_fence();
    }

    #[inline]
    pub fn geometry(&self) -> &Geometry {
        &self.geo
    }

    /// The payload data area behind the mailbox.
    pub fn data(&self) -> Region {
        self.block.sub(self.geo.data_offset(), self.geo.data_len())
    }

    /// Highest id ever published, -1 before the first.
    #[inline]
    pub fn last_put(&self) -> i64 {
        self.block.load_i64(LAST_PUT_OFFSET)
    }

    /// Highest id consumed in order, -1 before the first.
    #[inline]
    pub fn last_get(&self) -> i64 {
        self.block.load_i64(LAST_GET_OFFSET)
    }

    /// Number of published ids not yet consumed in order.
    pub fn pending(&self) -> u64 {
        (self.last_put() - self.last_get()) as u64
    }

    /// Id the next publish will receive.
    #[inline]
    pub fn next_id(&self) -> ReqId {
        (self.last_put() + 1) as ReqId
    }

    /// Reads the slot word that carries `req`.
    #[inline]
    pub fn slot(&self, req: i64) -> Mailbox {
        let off = self.geo.mailbox_offset(self.geo.slot_of(req));
        Mailbox::from_word(self.block.load_u64(off))
    }

    #[inline]
    fn store_slot(&self, req: i64, mb: Mailbox) {
        let off = self.geo.mailbox_offset(self.geo.slot_of(req));
        self.block.store_u64(off, mb.word());
    }

    /// True if `req` is published and its slot has not been freed.
    ///
    /// Ids older than one ring depth have had their slot reused and are
    /// reported as not live.
    pub fn is_live(&self, req: ReqId) -> bool {
        let req = req as i64;
        let put = self.last_put();
        if req > put {
            return false;
        }
        if req <= put - self.geo.slots() as i64 {
            return false;
        }
        !self.slot(req).is_free()
    }

    /// True while the payload of `req` may still be read: the id is not
    /// published yet, or its slot has not been freed.
    pub fn is_referenced(&self, req: ReqId) -> bool {
        req as i64 > self.last_put() || self.is_live(req)
    }

    // ========================================================================
    // Producer side
    // ========================================================================

    /// Publishes `mb` into the next slot and returns its id.
    ///
    /// Spins until the target slot is freed by the consumer, giving up with
    /// [`Error::Timeout`] after `timeout`.
    pub fn publish(&self, mb: Mailbox, timeout: Duration) -> Result<ReqId> {
        debug_assert!(!mb.is_free(), "publishing a free slot word");
        let req = self.last_put() + 1;
        let deadline = Deadline::after(timeout);
        let mut backoff = Backoff::new();
        while !self.slot(req).is_free() {
            if deadline.expired() {
                return Err(Error::Timeout {
                    what: "free mailbox slot",
                    req: Some(req as ReqId),
                });
            }
            backoff.spin();
        }
        self.commit(req, mb);
        Ok(req as ReqId)
    }

    /// Publishes `mb` if the next slot is free right now.
    pub fn try_publish(&self, mb: Mailbox) -> Option<ReqId> {
        debug_assert!(!mb.is_free(), "publishing a free slot word");
        let req = self.last_put() + 1;
        if !self.slot(req).is_free() {
            return None;
        }
        self.commit(req, mb);
        Some(req as ReqId)
    }

    /// True if the slot of the next id is free.
    pub fn can_publish(&self) -> bool {
        self.slot(self.last_put() + 1).is_free()
    }

    fn commit(&self, req: i64, mb: Mailbox) {
        // Payload bytes written before this point become visible first.
        full_fence();
        self.store_slot(req, mb);
        full_fence();
        self.block.store_i64(LAST_PUT_OFFSET, req);
        full_fence();
        tracing::trace!(req, cmd = mb.cmd().id(), len = mb.len(), "published");
    }

    // ========================================================================
    // Consumer side
    // ========================================================================

    /// Pulls the next published id in order.
    pub fn next_pending(&mut self) -> Option<(ReqId, Mailbox)> {
        loop {
            let put = self.last_put();
            let get = self.last_get();
            if put == get {
                return None;
            }
            full_fence();
            let req = get + 1;
            let mb = self.slot(req);
            self.block.store_i64(LAST_GET_OFFSET, req);
            full_fence();
            if self.ahead.remove(&req) {
                continue;
            }
            return Some((req as ReqId, mb));
        }
    }

    /// Reads the slot of a specific published, unconsumed id.
    pub fn peek(&self, req: ReqId) -> Option<Mailbox> {
        let req = req as i64;
        if req <= self.last_get() || req > self.last_put() || self.ahead.contains(&req) {
            return None;
        }
        full_fence();
        Some(self.slot(req))
    }

    /// Consumes a specific id, possibly ahead of arrival order.
    ///
    /// When `req` closes the gap behind `last_get`, the counter advances
    /// over it and over any ids taken earlier. Otherwise the id is
    /// remembered so [`next_pending`](Self::next_pending) skips it.
    pub fn take(&mut self, req: ReqId) -> Option<Mailbox> {
        let mb = self.peek(req)?;
        let req = req as i64;
        let mut get = self.last_get();
        if req == get + 1 {
            get = req;
            while self.ahead.remove(&(get + 1)) {
                get += 1;
            }
            self.block.store_i64(LAST_GET_OFFSET, get);
            full_fence();
        } else {
            self.ahead.insert(req);
        }
        Some(mb)
    }

    /// Frees the slot of `req` for the producer.
    ///
    /// The caller must have finished reading the payload.
    pub fn mark_done(&self, req: ReqId) {
        let req = req as i64;
        full_fence();
        let mb = self.slot(req);
        self.store_slot(req, mb.with_cmd(Command::NONE));
        full_fence();
    }

    // ========================================================================
    // Flags
    // ========================================================================

    pub fn sender_flags(&self) -> Flags {
        Flags::from_bits_retain(self.block.load_u32(SENDER_FLAGS_OFFSET))
    }

    pub fn receiver_flags(&self) -> Flags {
        Flags::from_bits_retain(self.block.load_u32(RECEIVER_FLAGS_OFFSET))
    }

    pub fn set_sender_flags(&self, flags: Flags) {
        self.block.or_u32(SENDER_FLAGS_OFFSET, flags.bits());
        full_fence();
    }

    pub fn clear_sender_flags(&self, flags: Flags) {
        self.block.clear_u32(SENDER_FLAGS_OFFSET, flags.bits());
        full_fence();
    }

    pub fn set_receiver_flags(&self, flags: Flags) {
        self.block.or_u32(RECEIVER_FLAGS_OFFSET, flags.bits());
        full_fence();
    }

    pub fn clear_receiver_flags(&self, flags: Flags) {
        self.block.clear_u32(RECEIVER_FLAGS_OFFSET, flags.bits());
        full_fence();
    }
}
