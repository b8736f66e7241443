//! Request matcher: bounded waits for the next message or for one id.

use std::time::Duration;

use crate::comm::{Receiver, Sender};
use crate::dma::DmaEngine;
use crate::error::{Error, Result};
use crate::mailbox::{Command, Mailbox};
use crate::pack::{self, PackError, Value};
use crate::queue::{Flags, ReqId, TransferQueue};
use crate::region::Region;
use crate::wait::{Backoff, Deadline};

/// A message taken off the ring by a wait.
///
/// The payload stays valid while the guard lives; dropping it frees the
/// slot for the producer.
pub struct Incoming<'a> {
    queue: &'a TransferQueue,
    area: Region,
    req: ReqId,
    mb: Mailbox,
}

impl<'a> Incoming<'a> {
    pub fn req(&self) -> ReqId {
        self.req
    }

    pub fn cmd(&self) -> Command {
        self.mb.cmd()
    }

    pub fn mailbox(&self) -> Mailbox {
        self.mb
    }

    pub fn payload(&self) -> &[u8] {
        // SAFETY: the slot is not freed before the guard drops, so the
        // producer leaves the range alone until then.
        unsafe { self.area.slice(self.mb.offset(), self.mb.len()) }
    }

    /// Decodes the payload with `format`.
    pub fn unpack(&self, format: &str) -> std::result::Result<Vec<Value<'_>>, PackError> {
        pack::unpack(self.payload(), format)
    }
}

impl Drop for Incoming<'_> {
    fn drop(&mut self) {
        self.queue.mark_done(self.req);
    }
}

impl std::fmt::Debug for Incoming<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Incoming")
            .field("req", &self.req)
            .field("mb", &self.mb)
            .finish()
    }
}

/// Waits for the next message in arrival order.
pub fn wait_next<'a>(
    recv: &'a mut Receiver,
    send: &mut Sender,
    dma: &mut dyn DmaEngine,
    timeout: Duration,
) -> Result<Incoming<'a>> {
    let got = poll_until(recv, send, dma, timeout, None, |q| q.next_pending())?;
    resolve(recv, dma, got)
}

/// Waits for the message carrying `req`, which may arrive ahead of
/// messages nobody consumed yet.
pub fn wait_for<'a>(
    recv: &'a mut Receiver,
    send: &mut Sender,
    dma: &mut dyn DmaEngine,
    req: ReqId,
    timeout: Duration,
) -> Result<Incoming<'a>> {
    let got = poll_until(recv, send, dma, timeout, Some(req), |q| {
        q.take(req).map(|mb| (req, mb))
    })?;
    resolve(recv, dma, got)
}

fn poll_until(
    recv: &mut Receiver,
    send: &mut Sender,
    dma: &mut dyn DmaEngine,
    timeout: Duration,
    req: Option<ReqId>,
    mut poll: impl FnMut(&mut TransferQueue) -> Option<(ReqId, Mailbox)>,
) -> Result<(ReqId, Mailbox)> {
    let deadline = Deadline::after(timeout);
    let mut backoff = Backoff::new();
    loop {
        // Read the flag first so a message sent right before exiting is
        // still picked up.
        let exited = recv.queue().sender_flags().contains(Flags::EXITED);
        if let Some(got) = poll(recv.queue_mut()) {
            return Ok(got);
        }
        if exited {
            return Err(Error::Detached);
        }
        if deadline.expired() {
            return Err(Error::Timeout { what: "reply", req });
        }
        // Keep our own queued sends moving, the reply may depend on them.
        if send.pump(dma)? > 0 {
            backoff.reset();
        } else {
            backoff.spin();
        }
    }
}

fn resolve<'a>(
    recv: &'a mut Receiver,
    dma: &mut dyn DmaEngine,
    (req, mb): (ReqId, Mailbox),
) -> Result<Incoming<'a>> {
    let recv: &'a Receiver = recv;
    let incoming = Incoming {
        queue: recv.queue(),
        area: recv.payload_area(),
        req,
        mb,
    };
    // On failure the guard still frees the slot.
    recv.fetch(mb, dma)?;
    tracing::trace!(req, cmd = mb.cmd().id(), len = mb.len(), "matched");
    Ok(incoming)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::dma::NoEngine;
    use crate::layout::Geometry;
    use crate::pack::Packer;
    use crate::region::HeapRegion;

    const SLOTS: u32 = 8;
    const COMM: usize = 8192;

    struct Link {
        _mem: HeapRegion,
        tx: Sender,
        rx: Receiver,
        // Reply path of the receiving side.
        back: Sender,
    }

    fn link() -> Link {
        let mem = HeapRegion::new_zeroed(COMM * 2);
        let geo = Geometry::new(SLOTS, COMM).unwrap();
        let config = Config::new()
            .with_slots(SLOTS)
            .with_comm_size(COMM)
            .with_publish_timeout(Duration::from_millis(5));
        let a = mem.region().sub(0, COMM);
        let b = mem.region().sub(COMM, COMM);
        TransferQueue::new(a, geo).init();
        TransferQueue::new(b, geo).init();
        Link {
            tx: Sender::new(TransferQueue::new(a, geo), &config, false),
            rx: Receiver::new(TransferQueue::new(a, geo), &config, false),
            back: Sender::new(TransferQueue::new(b, geo), &config, false),
            _mem: mem,
        }
    }

    #[test]
    fn test_wait_next_in_order() {
        let mut l = link();
        for v in 0..3u64 {
            l.tx.send(Command::new(4), Packer::new().u64(v).fields(), &mut NoEngine)
                .unwrap();
        }
        for v in 0..3u64 {
            let m = wait_next(&mut l.rx, &mut l.back, &mut NoEngine, Duration::from_millis(10)).unwrap();
            assert_eq!(m.req(), v);
            assert_eq!(m.unpack("L").unwrap()[0].as_u64(), Some(v));
        }
        assert!(l.rx.queue().slot(0).is_free());
    }

    #[test]
    fn test_wait_for_out_of_order() {
        let mut l = link();
        for _ in 0..3 {
            l.tx.send(Command::new(3), &[], &mut NoEngine).unwrap();
        }
        let m = wait_for(&mut l.rx, &mut l.back, &mut NoEngine, 2, Duration::from_millis(10)).unwrap();
        assert_eq!(m.req(), 2);
        drop(m);
        assert_eq!(l.rx.queue().last_get(), -1);

        let m = wait_next(&mut l.rx, &mut l.back, &mut NoEngine, Duration::from_millis(10)).unwrap();
        assert_eq!(m.req(), 0);
        drop(m);
        let m = wait_next(&mut l.rx, &mut l.back, &mut NoEngine, Duration::from_millis(10)).unwrap();
        assert_eq!(m.req(), 1);
        drop(m);
        let err = wait_next(&mut l.rx, &mut l.back, &mut NoEngine, Duration::from_millis(1)).unwrap_err();
        assert!(matches!(err, Error::Timeout { req: None, .. }));
        assert_eq!(l.rx.queue().last_get(), 2);
    }

    #[test]
    fn test_wait_for_times_out() {
        let mut l = link();
        let err = wait_for(&mut l.rx, &mut l.back, &mut NoEngine, 5, Duration::from_millis(2)).unwrap_err();
        assert!(matches!(err, Error::Timeout { req: Some(5), .. }));
    }

    #[test]
    fn test_out_of_bounds_payload_is_rejected() {
        let mut l = link();
        l.tx.queue().try_publish(Mailbox::new(Command::new(9), 1 << 20, 64)).unwrap();
        let err = wait_next(&mut l.rx, &mut l.back, &mut NoEngine, Duration::from_millis(10)).unwrap_err();
        assert!(matches!(err, Error::PayloadTooLarge { .. }));
        assert!(l.rx.queue().slot(0).is_free());

        l.tx.queue().try_publish(Mailbox::new(Command::new(9), 8, 1 << 20)).unwrap();
        let err = wait_for(&mut l.rx, &mut l.back, &mut NoEngine, 1, Duration::from_millis(10)).unwrap_err();
        assert!(matches!(err, Error::PayloadTooLarge { .. }));
        assert!(l.rx.queue().slot(1).is_free());
    }

    #[test]
    fn test_exited_peer_detaches() {
        let mut l = link();
        l.tx.send(Command::new(3), &[], &mut NoEngine).unwrap();
        l.tx.queue().set_sender_flags(Flags::EXITED);
        let m = wait_next(&mut l.rx, &mut l.back, &mut NoEngine, Duration::from_millis(10)).unwrap();
        drop(m);
        let err = wait_next(&mut l.rx, &mut l.back, &mut NoEngine, Duration::from_secs(5)).unwrap_err();
        assert!(matches!(err, Error::Detached));
    }
}
