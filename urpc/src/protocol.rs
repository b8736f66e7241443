//! Built-in commands and the helpers around them.
//!
//! Every message is answered by exactly one message from the other side,
//! so both ends advance their request ids in lockstep and an answer
//! carries the id of the request it answers.

use std::time::Duration;

use crate::dispatch::Request;
use crate::error::{Error, Result};
use crate::pack::Field;
use crate::peer::{Context, Link, Peer};
use crate::queue::ReqId;

/// Command ids shared by both ends.
pub mod cmd {
    use crate::mailbox::Command;

    pub const PING: Command = Command::new(1);
    pub const EXIT: Command = Command::new(2);
    pub const ACK: Command = Command::new(3);
    pub const RESULT: Command = Command::new(4);
    pub const EXCEPTION: Command = Command::new(6);
    pub const SENDFRAG: Command = Command::new(14);
}

/// Installs the handlers for `PING`, `EXIT` and stray `ACK`s.
pub fn install_defaults(peer: &mut Peer) -> Result<()> {
    peer.register_handler(cmd::PING, ping_handler)?;
    peer.register_handler(cmd::EXIT, exit_handler)?;
    peer.register_handler(cmd::ACK, |_: &mut Context<'_>, _: &Request<'_>| Ok(()))?;
    Ok(())
}

fn ping_handler(ctx: &mut Context<'_>, req: &Request<'_>) -> Result<()> {
    reply_ack(ctx, req.req)?;
    Ok(())
}

fn exit_handler(ctx: &mut Context<'_>, req: &Request<'_>) -> Result<()> {
    reply_ack(ctx, req.req)?;
    ctx.request_exit();
    Ok(())
}

pub fn send_ping<L: Link + ?Sized>(link: &mut L) -> Result<ReqId> {
    link.send(cmd::PING, &[])
}

/// Asks the other side to stop serving. It acknowledges first.
pub fn send_exit<L: Link + ?Sized>(link: &mut L) -> Result<ReqId> {
    link.send(cmd::EXIT, &[])
}

pub fn reply_ack<L: Link + ?Sized>(link: &mut L, req: ReqId) -> Result<ReqId> {
    link.reply(req, cmd::ACK, &[])
}

/// Answers `req` with a 64-bit result (`"L"`).
pub fn reply_result<L: Link + ?Sized>(link: &mut L, req: ReqId, result: i64) -> Result<ReqId> {
    link.reply(req, cmd::RESULT, &[Field::U64(result as u64)])
}

/// Answers `req` with an exception code (`"L"`).
pub fn reply_exception<L: Link + ?Sized>(link: &mut L, req: ReqId, code: u64) -> Result<ReqId> {
    link.reply(req, cmd::EXCEPTION, &[Field::U64(code)])
}

/// Waits for the `ACK` answering `req`.
pub fn wait_ack<L: Link + ?Sized>(link: &mut L, req: ReqId, timeout: Duration) -> Result<()> {
    let m = link.wait_for(req, timeout)?;
    if m.cmd() != cmd::ACK {
        tracing::warn!(req, cmd = m.cmd().id(), "expected ACK");
        return Err(Error::InvalidCommand(m.cmd().id()));
    }
    Ok(())
}

/// Waits for the `RESULT` answering `req`. An `EXCEPTION` answer turns
/// into [`Error::RemoteException`].
pub fn wait_result<L: Link + ?Sized>(link: &mut L, req: ReqId, timeout: Duration) -> Result<i64> {
    let m = link.wait_for(req, timeout)?;
    let value = |m: &crate::matcher::Incoming<'_>| -> Result<u64> {
        let vals = m.unpack("L")?;
        Ok(vals[0].as_u64().unwrap_or_default())
    };
    match m.cmd() {
        cmd::RESULT => Ok(value(&m)? as i64),
        cmd::EXCEPTION => Err(Error::RemoteException { code: value(&m)? }),
        other => {
            tracing::warn!(req, cmd = other.id(), "expected RESULT");
            Err(Error::InvalidCommand(other.id()))
        }
    }
}

/// Consumes `n` incoming `ACK`s in arrival order.
///
/// Anything else arriving meanwhile is logged and dropped.
pub fn pickup_acks<L: Link + ?Sized>(link: &mut L, n: usize, timeout: Duration) -> Result<()> {
    let mut got = 0;
    while got < n {
        let m = link.wait_next(timeout)?;
        if m.cmd() == cmd::ACK {
            got += 1;
        } else {
            tracing::warn!(req = m.req(), cmd = m.cmd().id(), "dropped while picking up ACKs");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_ids() {
        let ids: Vec<u8> = [
            cmd::PING,
            cmd::EXIT,
            cmd::ACK,
            cmd::RESULT,
            cmd::EXCEPTION,
            cmd::SENDFRAG,
        ]
        .iter()
        .map(|c| c.id())
        .collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 6, 14]);
    }
}
