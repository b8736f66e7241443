//! The two halves of a link: the sending and the receiving communicator.
//!
//! A [`Sender`] owns the producer side of one communicator together with
//! the allocator of its data area. A [`Receiver`] owns the consumer side of
//! the other communicator and its receive pipeline. In staged mode both
//! keep a private mirror of their data area and move payloads through the
//! DMA engine.

use std::time::Duration;

use crate::alloc::PayloadAllocator;
use crate::config::Config;
use crate::dma::DmaEngine;
use crate::error::{Error, Result};
use crate::layout::align8;
use crate::mailbox::{Command, Mailbox};
use crate::pack::{self, Field};
use crate::pipeline::{Direction, Lanes, Pipeline};
use crate::queue::{ReqId, TransferQueue};
use crate::region::{HeapRegion, Region};
use crate::wait::{Backoff, Deadline};

struct Staged {
    pipeline: Pipeline,
    mirror: HeapRegion,
}

/// Producer half of a link.
pub struct Sender {
    queue: TransferQueue,
    alloc: PayloadAllocator,
    staged: Option<Staged>,
    publish_timeout: Duration,
    alloc_timeout: Duration,
}

impl Sender {
    /// Sender over `queue`. With `staged` set, payloads are packed into a
    /// private mirror and stored to the shared data area by DMA.
    pub fn new(queue: TransferQueue, config: &Config, staged: bool) -> Self {
        let geo = *queue.geometry();
        let staged = staged.then(|| {
            let mirror = HeapRegion::new_zeroed(geo.data_len());
            let lanes = Lanes {
                shared: queue.data(),
                mirror: mirror.region(),
                dir: Direction::Store,
            };
            Staged {
                pipeline: Pipeline::new(geo.slots(), queue.next_id(), Some(lanes), config.pipeline()),
                mirror,
            }
        });
        Self {
            alloc: PayloadAllocator::new(geo.data_len(), config.alloc_timeout),
            queue,
            staged,
            publish_timeout: config.publish_timeout,
            alloc_timeout: config.alloc_timeout,
        }
    }

    pub fn queue(&self) -> &TransferQueue {
        &self.queue
    }

    pub fn allocator(&self) -> &PayloadAllocator {
        &self.alloc
    }

    pub fn is_staged(&self) -> bool {
        self.staged.is_some()
    }

    /// Id the next [`send`](Self::send) will carry.
    pub fn next_id(&self) -> ReqId {
        match &self.staged {
            Some(s) => s.pipeline.next_req(),
            None => self.queue.next_id(),
        }
    }

    /// Entries accepted but not yet published.
    pub fn in_flight(&self) -> u64 {
        self.staged.as_ref().map_or(0, |s| s.pipeline.in_flight())
    }

    pub fn is_idle(&self) -> bool {
        self.in_flight() == 0
    }

    /// Packs `fields` into a fresh payload and sends it as `cmd`.
    ///
    /// Direct senders publish before returning. Staged senders queue the
    /// entry; it is published by later [`pump`](Self::pump) calls once its
    /// transfer is done.
    pub fn send(&mut self, cmd: Command, fields: &[Field<'_>], dma: &mut dyn DmaEngine) -> Result<ReqId> {
        if cmd.is_none() {
            return Err(Error::InvalidCommand(cmd.id()));
        }
        let size = pack::packed_size(fields);
        let max = self.queue.geometry().max_payload();
        if size > max {
            return Err(Error::PayloadTooLarge { size, max });
        }
        let req = self.next_id();
        let offset = self.reserve(req, size, dma)?;

        let area = match &self.staged {
            Some(s) => s.mirror.region(),
            None => self.queue.data(),
        };
        if size > 0 {
            // SAFETY: the range was reserved for `req` and nobody else reads
            // or writes it until `req` is published.
            let buf = unsafe { area.slice_mut(offset, size) };
            pack::pack_into(buf, fields)?;
        }
        let mb = if size == 0 {
            Mailbox::command_only(cmd)
        } else {
            Mailbox::new(cmd, offset, size)
        };

        if self.staged.is_none() {
            let got = self.queue.publish(mb, self.publish_timeout)?;
            if got != req {
                return Err(Error::Desync { expected: req, got });
            }
            return Ok(req);
        }

        let deadline = Deadline::after(self.publish_timeout);
        let mut backoff = Backoff::new();
        while self.staged.as_ref().is_some_and(|s| s.pipeline.is_full()) {
            if self.pump(dma)? == 0 {
                if deadline.expired() {
                    return Err(Error::Timeout {
                        what: "send pipeline",
                        req: Some(req),
                    });
                }
                backoff.spin();
            }
        }
        if let Some(s) = &mut self.staged {
            // Reserved space has no content yet, only the prefix is stored.
            s.pipeline.insert_prefix(req, mb, pack::written_size(fields))?;
        }
        self.pump(dma)?;
        Ok(req)
    }

    /// Reserves payload space, pumping the staged pipeline while the data
    /// area is full so queued entries get published and freed.
    fn reserve(&mut self, req: ReqId, size: usize, dma: &mut dyn DmaEngine) -> Result<usize> {
        if self.staged.is_none() {
            let queue = &self.queue;
            return Ok(self.alloc.allocate(req, size, |id| queue.is_referenced(id))?.offset);
        }
        let deadline = Deadline::after(self.alloc_timeout);
        let mut backoff = Backoff::new();
        loop {
            let queue = &self.queue;
            if let Some(a) = self.alloc.try_allocate(req, size, |id| queue.is_referenced(id))? {
                return Ok(a.offset);
            }
            if self.pump(dma)? == 0 {
                if deadline.expired() {
                    tracing::warn!(size, req, "payload allocation timed out");
                    return Err(Error::AllocTimeout { size });
                }
                backoff.spin();
            }
        }
    }

    /// Moves the staged pipeline forward and publishes every entry whose
    /// store has completed, as long as slots are free. Returns the number
    /// of entries that advanced.
    pub fn pump(&mut self, dma: &mut dyn DmaEngine) -> Result<usize> {
        let Some(s) = &mut self.staged else {
            return Ok(0);
        };
        let mut moved = s.pipeline.submit(dma)? + s.pipeline.complete(dma)?;
        while let Some((req, mb)) = s.pipeline.ready() {
            let Some(got) = self.queue.try_publish(mb) else {
                break;
            };
            if got != req {
                return Err(Error::Desync { expected: req, got });
            }
            s.pipeline.retire();
            moved += 1;
        }
        Ok(moved)
    }

    /// Pumps until every accepted entry is published.
    pub fn flush(&mut self, dma: &mut dyn DmaEngine, timeout: Duration) -> Result<()> {
        let deadline = Deadline::after(timeout);
        let mut backoff = Backoff::new();
        while !self.is_idle() {
            if self.pump(dma)? > 0 {
                backoff.reset();
                continue;
            }
            if deadline.expired() {
                return Err(Error::Timeout {
                    what: "send flush",
                    req: None,
                });
            }
            backoff.spin();
        }
        Ok(())
    }
}

/// Consumer half of a link.
pub struct Receiver {
    queue: TransferQueue,
    mirror: Option<HeapRegion>,
    pipeline: Pipeline,
    inline_threshold: usize,
}

impl Receiver {
    /// Receiver over `queue`. With `staged` set, payloads are fetched into
    /// a private mirror before anyone reads them.
    pub fn new(queue: TransferQueue, config: &Config, staged: bool) -> Self {
        let geo = *queue.geometry();
        let mirror = staged.then(|| HeapRegion::new_zeroed(geo.data_len()));
        let lanes = mirror.as_ref().map(|m| Lanes {
            shared: queue.data(),
            mirror: m.region(),
            dir: Direction::Fetch,
        });
        // Entries consumed by the matcher come back as skip entries, which
        // can double the span the pipeline has to cover.
        let pipeline = Pipeline::new(geo.slots() * 2, queue.next_id(), lanes, config.pipeline());
        Self {
            queue,
            mirror,
            pipeline,
            inline_threshold: config.inline_threshold,
        }
    }

    pub fn queue(&self) -> &TransferQueue {
        &self.queue
    }

    pub(crate) fn queue_mut(&mut self) -> &mut TransferQueue {
        &mut self.queue
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub(crate) fn pipeline_mut(&mut self) -> &mut Pipeline {
        &mut self.pipeline
    }

    pub fn is_staged(&self) -> bool {
        self.mirror.is_some()
    }

    /// Where resolved payloads are read from: the mirror in staged mode,
    /// the shared data area otherwise.
    pub fn payload_area(&self) -> Region {
        match &self.mirror {
            Some(m) => m.region(),
            None => self.queue.data(),
        }
    }

    /// Fails if the payload of `mb` does not lie inside the data area.
    pub fn check_bounds(&self, mb: Mailbox) -> Result<()> {
        let end = mb.offset() + mb.len();
        let max = self.queue.data().len();
        if end > max {
            return Err(Error::PayloadTooLarge { size: end, max });
        }
        Ok(())
    }

    /// Pulls up to `budget` published ids into the receive pipeline.
    ///
    /// A slot word pointing outside the data area is dropped and its slot
    /// freed.
    pub(crate) fn intake(&mut self, budget: usize) -> Result<usize> {
        let mut taken = 0;
        while taken < budget && !self.pipeline.is_full() {
            let Some((req, mb)) = self.queue.next_pending() else {
                break;
            };
            taken += 1;
            if let Err(err) = self.check_bounds(mb) {
                tracing::warn!(req, %err, ?mb, "dropping malformed slot");
                self.queue.mark_done(req);
                continue;
            }
            self.pipeline.insert(req, mb)?;
        }
        Ok(taken)
    }

    /// Resolves the payload of `mb` synchronously, outside the pipeline.
    ///
    /// Fails without touching either area if the payload lies outside the
    /// data area.
    pub fn fetch(&self, mb: Mailbox, dma: &mut dyn DmaEngine) -> Result<()> {
        self.check_bounds(mb)?;
        let Some(mirror) = &self.mirror else {
            return Ok(());
        };
        if mb.is_empty() {
            return Ok(());
        }
        let shared = self.queue.data();
        let mirror = mirror.region();
        let offset = mb.offset();
        if mb.len() <= self.inline_threshold {
            shared.copy_words_to(&mirror, offset, mb.len());
            return Ok(());
        }
        let len = align8(mb.len()).min(shared.len() - offset);
        dma.transfer(mirror.addr(offset), shared.addr(offset), len)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dma::{NoEngine, SoftDma};
    use crate::layout::Geometry;
    use crate::pack::Packer;

    const SLOTS: u32 = 8;
    const COMM: usize = 8192;

    struct Rig {
        _mem: HeapRegion,
        geo: Geometry,
        block: Region,
    }

    fn rig() -> Rig {
        let mem = HeapRegion::new_zeroed(COMM);
        let geo = Geometry::new(SLOTS, COMM).unwrap();
        let block = mem.region();
        TransferQueue::new(block, geo).init();
        Rig {
            _mem: mem,
            geo,
            block,
        }
    }

    fn config() -> Config {
        Config::new()
            .with_slots(SLOTS)
            .with_comm_size(COMM)
            .with_publish_timeout(Duration::from_millis(5))
            .with_alloc_timeout(Duration::from_millis(5))
    }

    #[test]
    fn test_direct_send_publishes() {
        let r = rig();
        let mut tx = Sender::new(TransferQueue::new(r.block, r.geo), &config(), false);
        let fields = Packer::new().u64(7).bytes(b"abc");
        let req = tx.send(Command::new(4), fields.fields(), &mut NoEngine).unwrap();
        assert_eq!(req, 0);

        let mut rx = Receiver::new(TransferQueue::new(r.block, r.geo), &config(), false);
        let (got, mb) = rx.queue_mut().next_pending().unwrap();
        assert_eq!(got, 0);
        let payload = unsafe { rx.payload_area().slice(mb.offset(), mb.len()) };
        let vals = pack::unpack(payload, "LP").unwrap();
        assert_eq!(vals[0].as_u64(), Some(7));
        assert_eq!(vals[1].as_bytes(), Some(&b"abc"[..]));
    }

    #[test]
    fn test_empty_payload_is_command_only() {
        let r = rig();
        let mut tx = Sender::new(TransferQueue::new(r.block, r.geo), &config(), false);
        tx.send(Command::new(1), &[], &mut NoEngine).unwrap();
        let q = TransferQueue::new(r.block, r.geo);
        let mb = q.slot(0);
        assert_eq!(mb.cmd(), Command::new(1));
        assert!(mb.is_empty());
    }

    #[test]
    fn test_ring_full_times_out() {
        let r = rig();
        let mut tx = Sender::new(TransferQueue::new(r.block, r.geo), &config(), false);
        for i in 0..SLOTS as u64 {
            assert_eq!(tx.send(Command::new(1), &[], &mut NoEngine).unwrap(), i);
        }
        let err = tx.send(Command::new(1), &[], &mut NoEngine).unwrap_err();
        assert!(matches!(err, Error::Timeout { req: Some(8), .. }));

        let q = TransferQueue::new(r.block, r.geo);
        q.mark_done(0);
        assert_eq!(tx.send(Command::new(1), &[], &mut NoEngine).unwrap(), 8);
    }

    #[test]
    fn test_staged_send_roundtrip() {
        let r = rig();
        let mut dma = unsafe { SoftDma::new(4) }.with_latency(1);
        let mut tx = Sender::new(TransferQueue::new(r.block, r.geo), &config(), true);
        let data = vec![0x5au8; 256];
        let req = tx
            .send(Command::new(14), Packer::new().u64(0).bytes(&data).fields(), &mut dma)
            .unwrap();
        assert_eq!(req, 0);
        tx.flush(&mut dma, Duration::from_secs(1)).unwrap();
        assert!(tx.is_idle());

        let mut rx = Receiver::new(TransferQueue::new(r.block, r.geo), &config(), true);
        let (_, mb) = rx.queue_mut().next_pending().unwrap();
        rx.fetch(mb, &mut dma).unwrap();
        let payload = unsafe { rx.payload_area().slice(mb.offset(), mb.len()) };
        let vals = pack::unpack(payload, "LP").unwrap();
        assert_eq!(vals[1].as_bytes(), Some(data.as_slice()));
        assert!(dma.stats().posts >= 2);
    }

    #[test]
    fn test_out_of_bounds_slot_is_dropped() {
        for staged in [false, true] {
            let r = rig();
            let prod = TransferQueue::new(r.block, r.geo);
            prod.try_publish(Mailbox::new(Command::new(9), 1 << 20, 64)).unwrap();
            prod.try_publish(Mailbox::command_only(Command::new(1))).unwrap();

            let mut rx = Receiver::new(TransferQueue::new(r.block, r.geo), &config(), staged);
            assert!(matches!(
                rx.check_bounds(prod.slot(0)),
                Err(Error::PayloadTooLarge { .. })
            ));
            assert_eq!(rx.intake(8).unwrap(), 2);
            // Freed, and never handed to the pipeline.
            assert!(prod.slot(0).is_free());
            assert_eq!(rx.pipeline().in_flight(), 1);
            assert_eq!(rx.pipeline().next_req(), 2);
        }
    }

    #[test]
    fn test_staged_store_skips_reserved_space() {
        let r = rig();
        let mut dma = unsafe { SoftDma::new(4) };
        let mut tx = Sender::new(TransferQueue::new(r.block, r.geo), &config(), true);
        let head = [3u8; 40];
        let req = tx
            .send(Command::new(14), Packer::new().bytes(&head).reserve(4000).fields(), &mut dma)
            .unwrap();
        tx.flush(&mut dma, Duration::from_secs(1)).unwrap();
        assert_eq!(dma.stats().bytes, 56);

        let q = TransferQueue::new(r.block, r.geo);
        let mb = q.slot(req as i64);
        assert_eq!(mb.len(), 8 + 40 + 8 + 4000);
        let payload = unsafe { q.data().slice(mb.offset(), mb.len()) };
        let vals = pack::unpack(payload, "PQ").unwrap();
        assert_eq!(vals[0].as_bytes(), Some(&head[..]));
        assert_eq!(vals[1].as_bytes().map(<[u8]>::len), Some(4000));
    }

    #[test]
    fn test_fetch_fault() {
        let r = rig();
        let mut tx = Sender::new(TransferQueue::new(r.block, r.geo), &config(), false);
        let data = [1u8; 64];
        tx.send(Command::new(14), Packer::new().bytes(&data).fields(), &mut NoEngine)
            .unwrap();

        let mut dma = unsafe { SoftDma::new(1) };
        dma.fail_next(0x1000);
        let mut rx = Receiver::new(TransferQueue::new(r.block, r.geo), &config(), true);
        let (_, mb) = rx.queue_mut().next_pending().unwrap();
        let err = rx.fetch(mb, &mut dma).unwrap_err();
        assert!(err.is_fatal());
    }
}
