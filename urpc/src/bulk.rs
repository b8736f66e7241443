//! Multi-fragment transfers of buffers larger than one payload.
//!
//! A transfer answers a request: the holder of the data replies to
//! request `r` with fragments `r, r + 1, ...`, each a `SENDFRAG` message
//! (`"LP"`: byte offset, bytes). The receiving side acknowledges every
//! fragment but the last, and each `ACK` stands for the request of the
//! next fragment, so both ends stay in lockstep.

use std::time::Duration;

use crate::error::{Error, Result};
use crate::pack::Field;
use crate::peer::Link;
use crate::protocol::{self, cmd};
use crate::queue::ReqId;

/// Fragment size for a transfer of `total` bytes over a data area of
/// `capacity` bytes.
pub fn fragment_size(total: usize, capacity: usize) -> usize {
    let cap = (capacity * 8 / 10) & !7;
    let mut frag = (capacity / 8) & !7;
    if total < frag * 4 {
        frag = total.div_ceil(4).next_multiple_of(8);
    }
    frag.min(cap).max(8)
}

/// Number of fragments a transfer of `total` bytes is split into.
pub fn fragment_count(total: usize, frag: usize) -> usize {
    total.div_ceil(frag).max(1)
}

/// Answers request `first_req` with `data`, split into fragments.
///
/// Fragment `i` must go out as request `first_req + i`. Acknowledgements
/// are picked up every half ring so neither ring fills. Returns the number
/// of fragments sent.
pub fn send_fragments<L: Link + ?Sized>(link: &mut L, first_req: ReqId, data: &[u8]) -> Result<usize> {
    let geo = link.geometry();
    let frag = fragment_size(data.len(), geo.data_len());
    let n = fragment_count(data.len(), frag);
    let window = (geo.slots() as usize / 2).max(1);
    let timeout = link.config().reply_timeout;
    tracing::debug!(total = data.len(), frag, n, first_req, "sending fragments");

    let mut acked = 0;
    for i in 0..n {
        let expected = first_req + i as ReqId;
        let next = link.next_id();
        if next != expected {
            tracing::error!(expected, next, "fragment out of sequence");
            return Err(Error::Desync {
                expected,
                got: next,
            });
        }
        let start = (i * frag).min(data.len());
        let end = (start + frag).min(data.len());
        link.send(
            cmd::SENDFRAG,
            &[Field::U64(start as u64), Field::Bytes(&data[start..end])],
        )?;
        if (i + 1) % window == 0 {
            let target = (i + 1).min(n - 1);
            protocol::pickup_acks(link, target - acked, timeout)?;
            acked = target;
        }
    }
    protocol::pickup_acks(link, n - 1 - acked, timeout)?;
    Ok(n)
}

/// Receives the fragments answering request `first_req` into `out`.
///
/// Stops once `out` is filled and returns the number of fragments.
pub fn recv_fragments<L: Link + ?Sized>(
    link: &mut L,
    first_req: ReqId,
    out: &mut [u8],
    timeout: Duration,
) -> Result<usize> {
    let mut received = 0;
    let mut req = first_req;
    loop {
        {
            let m = link.wait_for(req, timeout)?;
            if m.cmd() != cmd::SENDFRAG {
                tracing::warn!(req, cmd = m.cmd().id(), "expected SENDFRAG");
                return Err(Error::InvalidCommand(m.cmd().id()));
            }
            let vals = m.unpack("LP")?;
            let offset = vals[0].as_u64().unwrap_or_default() as usize;
            let bytes = vals[1].as_bytes().unwrap_or_default();
            let max = out.len();
            let Some(dst) = fragment_target(out, offset, bytes.len()) else {
                tracing::warn!(req, offset, len = bytes.len(), "fragment outside buffer");
                return Err(Error::PayloadTooLarge {
                    size: offset.saturating_add(bytes.len()),
                    max,
                });
            };
            dst.copy_from_slice(bytes);
            received += bytes.len();
        }

        let count = (req - first_req + 1) as usize;
        if received >= out.len() {
            tracing::debug!(total = received, count, "fragments received");
            return Ok(count);
        }
        req += 1;
        link.reply(req, cmd::ACK, &[])?;
    }
}

/// The part of `out` a fragment of `len` bytes at `offset` lands in.
fn fragment_target(out: &mut [u8], offset: usize, len: usize) -> Option<&mut [u8]> {
    let end = offset.checked_add(len).filter(|end| *end <= out.len())?;
    Some(&mut out[offset..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fragment_size() {
        let cap = 1 << 20;
        // Large transfers use an eighth of the area.
        assert_eq!(fragment_size(100 << 20, cap), cap / 8);
        // Short ones are split in about four.
        assert_eq!(fragment_size(1000, cap), 256);
        assert_eq!(fragment_count(1000, 256), 4);
        // Tiny ones never go below one word.
        assert_eq!(fragment_size(3, cap), 8);
        assert_eq!(fragment_count(0, 8), 1);
    }

    #[test]
    fn test_fragment_target_bounds() {
        let mut out = [0u8; 16];
        assert_eq!(fragment_target(&mut out, 8, 8).map(|d| d.len()), Some(8));
        assert_eq!(fragment_target(&mut out, 16, 0).map(|d| d.len()), Some(0));
        assert!(fragment_target(&mut out, 9, 8).is_none());
        assert!(fragment_target(&mut out, usize::MAX, 8).is_none());
    }
}
