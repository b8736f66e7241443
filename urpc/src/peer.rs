//! One end of a link: a pair of communicators plus the handler table and
//! the DMA engine that serve them.
//!
//! The host creates the segment, initializes both communicators and sends
//! on the first one. The accelerator opens the segment, sends on the
//! second one and, when given a DMA engine, stages every payload through
//! private mirrors.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use urpc::{Config, Peer, protocol};
//!
//! let mut host = Peer::host(Config::new().with_shm_name("/urpc_demo"))?;
//! host.wait_attached()?;
//! let req = protocol::send_ping(&mut host)?;
//! protocol::wait_ack(&mut host, req, Duration::from_secs(2))?;
//! # Ok::<(), urpc::Error>(())
//! ```

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::comm::{Receiver, Sender};
use crate::config::Config;
use crate::dispatch::{HandlerTable, Request};
use crate::dma::{DmaEngine, NoEngine};
use crate::error::{self, Error, Result};
use crate::layout::Geometry;
use crate::mailbox::Command;
use crate::matcher::{self, Incoming};
use crate::pack::Field;
use crate::queue::{Flags, ReqId, TransferQueue};
use crate::shm::SharedMemory;
use crate::wait::{self, Backoff, Deadline};

/// Which end of the link a peer is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Creates the segment and sends on communicator 0.
    Host,
    /// Attaches to the segment and sends on communicator 1.
    Accelerator,
}

impl Side {
    /// Block indices of the send and the receive communicator.
    fn blocks(self) -> (usize, usize) {
        match self {
            Side::Host => (0, 1),
            Side::Accelerator => (1, 0),
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct PeerState {
    exit_requested: bool,
}

/// The operations request/response helpers need from either a [`Peer`] or
/// a handler's [`Context`].
pub trait Link {
    /// Packs `fields` and sends them as `cmd`, returning the request id.
    fn send(&mut self, cmd: Command, fields: &[Field<'_>]) -> Result<ReqId>;

    /// Id the next send will carry.
    fn next_id(&self) -> ReqId;

    /// Waits for the next incoming message.
    fn wait_next(&mut self, timeout: Duration) -> Result<Incoming<'_>>;

    /// Waits for the incoming message carrying `req`.
    fn wait_for(&mut self, req: ReqId, timeout: Duration) -> Result<Incoming<'_>>;

    fn config(&self) -> &Config;

    fn geometry(&self) -> Geometry;

    /// Answers request `req`. The answer must carry the same id, otherwise
    /// the two sides no longer agree on the sequence and nothing is sent.
    fn reply(&mut self, req: ReqId, cmd: Command, fields: &[Field<'_>]) -> Result<ReqId> {
        let next = self.next_id();
        if next != req {
            tracing::error!(req, next, cmd = cmd.id(), "reply out of sequence");
            return Err(Error::Desync {
                expected: req,
                got: next,
            });
        }
        self.send(cmd, fields)
    }
}

/// One end of a link.
pub struct Peer {
    side: Side,
    config: Config,
    geo: Geometry,
    send: Sender,
    recv: Receiver,
    handlers: HandlerTable,
    dma: Box<dyn DmaEngine>,
    state: PeerState,
    segment: Arc<SharedMemory>,
}

impl Peer {
    /// Creates the segment named by `config.shm_name` and initializes it.
    pub fn host(config: Config) -> Result<Self> {
        let geo = config.validate()?;
        let name = segment_name(&config)?;
        let segment = SharedMemory::create(name, geo.region_size())?;
        Self::host_with(Arc::new(segment), config)
    }

    /// Host end over an existing, zeroed segment.
    pub fn host_with(segment: Arc<SharedMemory>, config: Config) -> Result<Self> {
        let geo = config.validate()?;
        let (send_q, recv_q) = queues(&segment, geo, Side::Host)?;
        send_q.init();
        recv_q.init();
        let peer = Self::assemble(Side::Host, segment, config, geo, send_q, recv_q, None);
        peer.send.queue().set_sender_flags(Flags::ATTACHED);
        tracing::debug!(slots = geo.slots(), comm_size = geo.comm_size(), "host initialized segment");
        Ok(peer)
    }

    /// Opens the segment named by `config.shm_name` and attaches to it.
    pub fn accelerator(config: Config, dma: Option<Box<dyn DmaEngine>>) -> Result<Self> {
        let geo = config.validate()?;
        let name = segment_name(&config)?;
        let segment = SharedMemory::open(name, geo.region_size())?;
        Self::accelerator_with(Arc::new(segment), config, dma)
    }

    /// Accelerator end over `segment`. Payloads are staged through `dma`
    /// when one is given and addressed in place otherwise.
    ///
    /// Pins the calling thread to `config.core` first, then waits for the
    /// host to finish initializing.
    pub fn accelerator_with(
        segment: Arc<SharedMemory>,
        config: Config,
        dma: Option<Box<dyn DmaEngine>>,
    ) -> Result<Self> {
        let geo = config.validate()?;
        if let Some(core) = config.core
            && !core_affinity::set_for_current(core_affinity::CoreId { id: core })
        {
            tracing::warn!(core, "failed to pin accelerator thread");
        }
        let (send_q, recv_q) = queues(&segment, geo, Side::Accelerator)?;
        wait::spin_until(config.attach_timeout, || {
            recv_q.sender_flags().contains(Flags::ATTACHED).then_some(())
        })
        .ok_or(Error::Timeout {
            what: "host attach",
            req: None,
        })?;
        let peer = Self::assemble(Side::Accelerator, segment, config, geo, send_q, recv_q, dma);
        peer.send.queue().set_sender_flags(Flags::ATTACHED);
        tracing::debug!(staged = peer.send.is_staged(), "accelerator attached");
        Ok(peer)
    }

    fn assemble(
        side: Side,
        segment: Arc<SharedMemory>,
        config: Config,
        geo: Geometry,
        send_q: TransferQueue,
        recv_q: TransferQueue,
        dma: Option<Box<dyn DmaEngine>>,
    ) -> Self {
        let staged = dma.is_some();
        Self {
            side,
            send: Sender::new(send_q, &config, staged),
            recv: Receiver::new(recv_q, &config, staged),
            handlers: HandlerTable::new(),
            dma: dma.unwrap_or_else(|| Box::new(NoEngine)),
            state: PeerState::default(),
            segment,
            config,
            geo,
        }
    }

    /// Waits until the other side has set its `ATTACHED` flag.
    pub fn wait_attached(&self) -> Result<()> {
        wait::spin_until(self.config.attach_timeout, || {
            self.peer_flags().contains(Flags::ATTACHED).then_some(())
        })
        .ok_or(Error::Timeout {
            what: "peer attach",
            req: None,
        })?;
        tracing::debug!(side = ?self.side, "peer attached");
        Ok(())
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn segment(&self) -> &Arc<SharedMemory> {
        &self.segment
    }

    pub fn sender(&self) -> &Sender {
        &self.send
    }

    pub fn receiver(&self) -> &Receiver {
        &self.recv
    }

    // ========================================================================
    // Handlers
    // ========================================================================

    /// Installs `handler` for `cmd`.
    pub fn register_handler<F>(&mut self, cmd: Command, handler: F) -> Result<()>
    where
        F: FnMut(&mut Context<'_>, &Request<'_>) -> Result<()> + Send + 'static,
    {
        self.handlers.register(cmd, handler)
    }

    pub fn unregister_handler(&mut self, cmd: Command) -> bool {
        self.handlers.unregister(cmd)
    }

    // ========================================================================
    // Progress
    // ========================================================================

    /// Runs passes over both communicators until nothing moves. Returns the
    /// number of entries that advanced.
    pub fn progress(&mut self) -> Result<usize> {
        let mut total = 0;
        loop {
            let moved = self.progress_pass()?;
            if moved == 0 {
                return Ok(total);
            }
            total += moved;
        }
    }

    fn progress_pass(&mut self) -> Result<usize> {
        let busy = self.recv.pipeline().in_flight().max(self.send.in_flight()) as usize;
        let budget = self.config.max_inflight.saturating_sub(busy);
        let mut moved = self.recv.intake(budget)?;

        let dma = self.dma.as_mut();
        let pipeline = self.recv.pipeline_mut();
        moved += pipeline.submit(dma)?;
        moved += pipeline.complete(dma)?;
        moved += self.dispatch_ready()?;
        moved += self.send.pump(self.dma.as_mut())?;
        Ok(moved)
    }

    fn dispatch_ready(&mut self) -> Result<usize> {
        let mut dispatched = 0;
        while let Some((req, mb)) = self.recv.pipeline().ready() {
            if !mb.is_free() {
                let area = self.recv.payload_area();
                // SAFETY: the slot stays owned by us until `mark_done`.
                let payload = unsafe { area.slice(mb.offset(), mb.len()) };
                let request = Request {
                    req,
                    mailbox: mb,
                    payload,
                };
                let mut ctx = Context {
                    send: &mut self.send,
                    recv: &mut self.recv,
                    dma: self.dma.as_mut(),
                    state: &mut self.state,
                    config: &self.config,
                };
                let result = self.handlers.dispatch(&mut ctx, &request);
                self.recv.queue().mark_done(req);
                result?;
            }
            self.recv.pipeline_mut().retire();
            dispatched += 1;
        }
        Ok(dispatched)
    }

    /// Repeats [`progress`](Self::progress) until something advanced or
    /// `timeout` passed.
    pub fn progress_for(&mut self, timeout: Duration) -> Result<usize> {
        let deadline = Deadline::after(timeout);
        let mut backoff = Backoff::new();
        loop {
            let moved = self.progress()?;
            if moved > 0 || deadline.expired() {
                return Ok(moved);
            }
            backoff.spin();
        }
    }

    /// [`progress`](Self::progress) that terminates the process on a fatal
    /// error. Other errors are logged and count as no progress.
    pub fn progress_or_terminate(&mut self) -> usize {
        match self.progress() {
            Ok(moved) => moved,
            Err(err) if err.is_fatal() => {
                self.send.queue().set_sender_flags(Flags::EXCEPTION);
                error::terminate(&err)
            }
            Err(err) => {
                tracing::warn!(%err, "progress failed");
                0
            }
        }
    }

    /// Serves incoming requests until a handler asks to exit or the other
    /// side goes away.
    pub fn serve(&mut self) -> Result<()> {
        let mut backoff = Backoff::new();
        loop {
            if self.progress()? > 0 {
                backoff.reset();
            } else {
                backoff.spin();
            }
            if self.state.exit_requested {
                self.flush(self.config.publish_timeout)?;
                tracing::debug!(side = ?self.side, "exit requested");
                return Ok(());
            }
            if self.peer_exited() && self.recv.queue().pending() == 0 && self.recv.pipeline().is_idle() {
                return Err(Error::Detached);
            }
        }
    }

    /// Drives the send side until every accepted message is published.
    pub fn flush(&mut self, timeout: Duration) -> Result<()> {
        self.send.flush(self.dma.as_mut(), timeout)
    }

    // ========================================================================
    // Flags
    // ========================================================================

    /// Sets flags on our send communicator.
    pub fn set_flags(&self, flags: Flags) {
        self.send.queue().set_sender_flags(flags);
    }

    pub fn clear_flags(&self, flags: Flags) {
        self.send.queue().clear_sender_flags(flags);
    }

    /// Flags the other side set on its send communicator.
    pub fn peer_flags(&self) -> Flags {
        self.recv.queue().sender_flags()
    }

    pub fn peer_exited(&self) -> bool {
        self.peer_flags().contains(Flags::EXITED)
    }

    /// True once a handler called [`Context::request_exit`].
    pub fn exit_requested(&self) -> bool {
        self.state.exit_requested
    }
}

impl Link for Peer {
    fn send(&mut self, cmd: Command, fields: &[Field<'_>]) -> Result<ReqId> {
        self.send.send(cmd, fields, self.dma.as_mut())
    }

    fn next_id(&self) -> ReqId {
        self.send.next_id()
    }

    fn wait_next(&mut self, timeout: Duration) -> Result<Incoming<'_>> {
        matcher::wait_next(&mut self.recv, &mut self.send, self.dma.as_mut(), timeout)
    }

    fn wait_for(&mut self, req: ReqId, timeout: Duration) -> Result<Incoming<'_>> {
        matcher::wait_for(&mut self.recv, &mut self.send, self.dma.as_mut(), req, timeout)
    }

    fn config(&self) -> &Config {
        &self.config
    }

    fn geometry(&self) -> Geometry {
        self.geo
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        self.send.queue().set_sender_flags(Flags::EXITED);
        tracing::debug!(side = ?self.side, "peer detached");
    }
}

fn segment_name(config: &Config) -> Result<&str> {
    config
        .shm_name
        .as_deref()
        .ok_or_else(|| Error::Config("shm_name is not set".into()))
}

fn queues(segment: &SharedMemory, geo: Geometry, side: Side) -> Result<(TransferQueue, TransferQueue)> {
    if segment.size() < geo.region_size() {
        return Err(Error::Config(format!(
            "segment of {} bytes is smaller than {} bytes",
            segment.size(),
            geo.region_size()
        )));
    }
    let region = segment.region();
    let (tx, rx) = side.blocks();
    let block = |i| region.sub(geo.block_offset(i), geo.comm_size());
    Ok((TransferQueue::new(block(tx), geo), TransferQueue::new(block(rx), geo)))
}

/// What a handler may do while it runs.
pub struct Context<'a> {
    send: &'a mut Sender,
    recv: &'a mut Receiver,
    dma: &'a mut dyn DmaEngine,
    state: &'a mut PeerState,
    config: &'a Config,
}

impl Context<'_> {
    /// Makes [`Peer::serve`] return once the current pass is done.
    pub fn request_exit(&mut self) {
        self.state.exit_requested = true;
    }
}

impl Link for Context<'_> {
    fn send(&mut self, cmd: Command, fields: &[Field<'_>]) -> Result<ReqId> {
        self.send.send(cmd, fields, &mut *self.dma)
    }

    fn next_id(&self) -> ReqId {
        self.send.next_id()
    }

    fn wait_next(&mut self, timeout: Duration) -> Result<Incoming<'_>> {
        matcher::wait_next(self.recv, self.send, &mut *self.dma, timeout)
    }

    fn wait_for(&mut self, req: ReqId, timeout: Duration) -> Result<Incoming<'_>> {
        matcher::wait_for(self.recv, self.send, &mut *self.dma, req, timeout)
    }

    fn config(&self) -> &Config {
        self.config
    }

    fn geometry(&self) -> Geometry {
        *self.send.queue().geometry()
    }
}

/// A [`Peer`] shared by callers whose request sequences must not
/// interleave, such as multi-fragment transfers.
pub struct SharedPeer(Mutex<Peer>);

impl SharedPeer {
    pub fn new(peer: Peer) -> Self {
        Self(Mutex::new(peer))
    }

    /// Locks the peer. A caller that panicked while holding the lock does
    /// not make the peer unusable.
    pub fn lock(&self) -> MutexGuard<'_, Peer> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn into_inner(self) -> Peer {
        self.0.into_inner().unwrap_or_else(PoisonError::into_inner)
    }
}
