//! Staged DMA pipeline of one communicator.
//!
//! Entries move through four stages, each tracked by the request id of the
//! last entry that passed it:
//!
//! ```text
//!   insert ──> submit ──> complete ──> dispatch
//!     in   >=  submit  >=   done    >=   out
//! ```
//!
//! `submit` hands payload transfers to the DMA engine. Runs of entries whose
//! source and destination ranges are both contiguous are merged into a
//! single transfer, up to a byte and an entry cap. The group leader carries
//! the engine handle; the other members are flagged as coalesced and
//! complete together with it. Dispatching is up to the owner, which takes
//! entries from [`ready`](Pipeline::ready) and [`retire`](Pipeline::retire)s
//! them.
//!
//! Without lanes (direct mode) there is nothing to transfer and entries go
//! straight through submit and complete.

use crate::dma::{DmaEngine, DmaHandle, DmaPoll, PostError};
use crate::error::{Error, Result};
use crate::layout::align8;
use crate::mailbox::Mailbox;
use crate::queue::ReqId;
use crate::region::Region;

/// Which way payloads travel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Shared data area to private mirror (receiving side).
    Fetch,
    /// Private mirror to shared data area (sending side).
    Store,
}

/// The two data areas payloads move between.
#[derive(Clone, Copy)]
pub struct Lanes {
    pub shared: Region,
    pub mirror: Region,
    pub dir: Direction,
}

impl Lanes {
    /// Bytes to move for `len` payload bytes at `offset`, 8-byte aligned
    /// and clamped to the area.
    #[inline]
    fn xfer_len(&self, offset: usize, len: usize) -> usize {
        align8(len).min(self.shared.len() - offset)
    }

    #[inline]
    fn endpoints(&self, offset: usize) -> (u64, u64) {
        let (s, m) = (self.shared.addr(offset), self.mirror.addr(offset));
        match self.dir {
            Direction::Fetch => (m, s),
            Direction::Store => (s, m),
        }
    }

    fn copy_inline(&self, offset: usize, len: usize) {
        match self.dir {
            Direction::Fetch => self.shared.copy_words_to(&self.mirror, offset, len),
            Direction::Store => self.mirror.copy_words_to(&self.shared, offset, len),
        }
    }
}

/// Limits of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Payloads up to this size are copied word by word instead of by DMA.
    pub inline_threshold: usize,
    /// Byte cap of one coalesced transfer.
    pub max_coalesced_size: usize,
    /// Entry cap of one coalesced transfer.
    pub max_coalesced_reqs: usize,
}

#[derive(Clone, Copy, Default)]
struct Entry {
    mb: Mailbox,
    /// Leading payload bytes that have to move.
    xfer: usize,
    handle: Option<DmaHandle>,
    coalesced: bool,
}

/// An open coalescing group.
struct Group {
    leader: i64,
    last: i64,
    dst: u64,
    src: u64,
    size: usize,
    count: usize,
}

pub struct Pipeline {
    entries: Box<[Entry]>,
    mask: u64,
    in_req: i64,
    submit: i64,
    done: i64,
    out: i64,
    lanes: Option<Lanes>,
    config: PipelineConfig,
}

impl Pipeline {
    /// Pipeline with `depth` entries (a power of two) whose first entry
    /// will carry request id `first`.
    pub fn new(depth: u32, first: ReqId, lanes: Option<Lanes>, config: PipelineConfig) -> Self {
        assert!(depth.is_power_of_two());
        if let Some(l) = &lanes {
            assert_eq!(l.shared.len(), l.mirror.len());
        }
        let base = first as i64 - 1;
        Self {
            entries: vec![Entry::default(); depth as usize].into_boxed_slice(),
            mask: depth as u64 - 1,
            in_req: base,
            submit: base,
            done: base,
            out: base,
            lanes,
            config: PipelineConfig {
                max_coalesced_reqs: config.max_coalesced_reqs.max(1),
                ..config
            },
        }
    }

    #[inline]
    fn entry(&self, req: i64) -> &Entry {
        &self.entries[(req as u64 & self.mask) as usize]
    }

    #[inline]
    fn entry_mut(&mut self, req: i64) -> &mut Entry {
        &mut self.entries[(req as u64 & self.mask) as usize]
    }

    /// Entries inserted but not yet dispatched.
    #[inline]
    pub fn in_flight(&self) -> u64 {
        (self.in_req - self.out) as u64
    }

    #[inline]
    pub fn is_idle(&self) -> bool {
        self.in_req == self.out
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.in_flight() > self.mask
    }

    /// Id the next inserted entry must carry.
    #[inline]
    pub fn next_req(&self) -> ReqId {
        (self.in_req + 1) as ReqId
    }

    pub fn lanes(&self) -> Option<&Lanes> {
        self.lanes.as_ref()
    }

    /// Stage positions as `(in, submit, done, out)`.
    pub fn positions(&self) -> (i64, i64, i64, i64) {
        (self.in_req, self.submit, self.done, self.out)
    }

    /// Mailbox words inserted but not yet dispatched, oldest first.
    pub fn pending(&self) -> impl Iterator<Item = (ReqId, Mailbox)> + '_ {
        (self.out + 1..=self.in_req).map(|req| (req as ReqId, self.entry(req).mb))
    }

    // ========================================================================
    // Stages
    // ========================================================================

    /// Inserts the entry for `req`.
    ///
    /// Ids consumed elsewhere since the last insert are filled in as free
    /// entries that pass through every stage untouched, or skipped outright
    /// when nothing is in flight. An id older than expected means the two
    /// sides lost track of each other.
    pub fn insert(&mut self, req: ReqId, mb: Mailbox) -> Result<()> {
        self.insert_prefix(req, mb, mb.len())
    }

    /// Like [`insert`](Self::insert), but only the first `xfer` bytes of
    /// the payload are transferred.
    pub fn insert_prefix(&mut self, req: ReqId, mb: Mailbox, xfer: usize) -> Result<()> {
        let expected = self.next_req();
        if req < expected {
            return Err(Error::Desync { expected, got: req });
        }
        if let Some(lanes) = &self.lanes
            && mb.offset() + mb.len() > lanes.shared.len()
        {
            return Err(Error::PayloadTooLarge {
                size: mb.offset() + mb.len(),
                max: lanes.shared.len(),
            });
        }
        if self.is_idle() {
            let base = req as i64 - 1;
            (self.in_req, self.submit, self.done, self.out) = (base, base, base, base);
        } else {
            for skipped in expected..req {
                self.push(Mailbox::FREE, 0);
                tracing::trace!(req = skipped, "pipeline skip");
            }
        }
        self.push(mb, xfer.min(mb.len()));
        tracing::trace!(req, cmd = mb.cmd().id(), len = mb.len(), "pipeline insert");
        Ok(())
    }

    fn push(&mut self, mb: Mailbox, xfer: usize) {
        assert!(!self.is_full(), "pipeline overrun at req {}", self.in_req + 1);
        self.in_req += 1;
        *self.entry_mut(self.in_req) = Entry {
            mb,
            xfer,
            handle: None,
            coalesced: false,
        };
    }

    /// Issues transfers for entries between `submit + 1` and `in`.
    ///
    /// Stops at the first transfer the engine refuses. Returns the number
    /// of entries that advanced.
    pub fn submit(&mut self, dma: &mut dyn DmaEngine) -> Result<usize> {
        let start = self.submit;
        let Some(lanes) = self.lanes else {
            self.submit = self.in_req;
            return Ok((self.submit - start) as usize);
        };

        let mut group: Option<Group> = None;
        let mut req = self.submit + 1;
        while req <= self.in_req {
            let Entry { mb, xfer, .. } = *self.entry(req);
            if mb.is_empty() || xfer == 0 {
                match &mut group {
                    Some(g) => g.last = req,
                    None => self.submit = req,
                }
                req += 1;
                continue;
            }

            let len = lanes.xfer_len(mb.offset(), xfer);
            if xfer <= self.config.inline_threshold {
                if let Some(g) = group.take()
                    && !self.post_group(dma, g)?
                {
                    break;
                }
                lanes.copy_inline(mb.offset(), xfer);
                self.submit = req;
                req += 1;
                continue;
            }

            let (dst, src) = lanes.endpoints(mb.offset());
            if let Some(g) = &mut group
                && src == g.src + g.size as u64
                && dst == g.dst + g.size as u64
                && g.size + len <= self.config.max_coalesced_size
                && g.count < self.config.max_coalesced_reqs
            {
                g.size += len;
                g.count += 1;
                g.last = req;
                req += 1;
                continue;
            }

            if let Some(g) = group.take()
                && !self.post_group(dma, g)?
            {
                break;
            }
            group = Some(Group {
                leader: req,
                last: req,
                dst,
                src,
                size: len,
                count: 1,
            });
            req += 1;
        }
        if let Some(g) = group {
            self.post_group(dma, g)?;
        }
        Ok((self.submit - start) as usize)
    }

    /// Posts a group. Returns false if the engine queue is full.
    fn post_group(&mut self, dma: &mut dyn DmaEngine, g: Group) -> Result<bool> {
        match dma.post(g.dst, g.src, g.size) {
            Ok(handle) => {
                self.entry_mut(g.leader).handle = Some(handle);
                for req in g.leader + 1..=g.last {
                    self.entry_mut(req).coalesced = true;
                }
                self.submit = g.last;
                tracing::trace!(
                    leader = g.leader,
                    count = g.count,
                    size = g.size,
                    "dma posted"
                );
                Ok(true)
            }
            Err(PostError::Again) => Ok(false),
            Err(PostError::Fault(fault)) => Err(Error::DmaFault(fault)),
        }
    }

    /// Polls transfers between `done + 1` and `submit`.
    ///
    /// Entries without a handle of their own (no payload, inline, or
    /// coalesced behind a leader) complete as soon as everything before
    /// them has. A fault is returned as [`Error::DmaFault`].
    pub fn complete(&mut self, dma: &mut dyn DmaEngine) -> Result<usize> {
        let start = self.done;
        while self.done < self.submit {
            let req = self.done + 1;
            let entry = *self.entry(req);
            if let Some(handle) = entry.handle {
                match dma.poll(handle) {
                    DmaPoll::Pending => break,
                    DmaPoll::Done => self.entry_mut(req).handle = None,
                    DmaPoll::Fault(fault) => {
                        tracing::error!(req, mb = ?entry.mb, %fault, "dma transfer failed");
                        return Err(Error::DmaFault(fault));
                    }
                }
            } else {
                debug_assert!(
                    entry.coalesced || entry.mb.is_empty() || self.lanes.is_none()
                        || entry.xfer <= self.config.inline_threshold
                );
            }
            self.done = req;
        }
        Ok((self.done - start) as usize)
    }

    /// Oldest entry that finished its transfer and awaits dispatch.
    pub fn ready(&self) -> Option<(ReqId, Mailbox)> {
        (self.out < self.done).then(|| {
            let req = self.out + 1;
            (req as ReqId, self.entry(req).mb)
        })
    }

    /// Marks the entry returned by [`ready`](Self::ready) as dispatched.
    pub fn retire(&mut self) {
        debug_assert!(self.out < self.done);
        self.out += 1;
    }
}
