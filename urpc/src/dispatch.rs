//! Command handler table.

use crate::error::{Error, Result};
use crate::mailbox::{Command, Mailbox};
use crate::pack::{self, PackError, Value};
use crate::peer::Context;
use crate::queue::ReqId;

/// A received message handed to a handler.
#[derive(Debug, Clone, Copy)]
pub struct Request<'a> {
    pub req: ReqId,
    pub mailbox: Mailbox,
    pub payload: &'a [u8],
}

impl<'a> Request<'a> {
    pub fn cmd(&self) -> Command {
        self.mailbox.cmd()
    }

    /// Decodes the payload with `format`.
    pub fn unpack(&self, format: &str) -> std::result::Result<Vec<Value<'a>>, PackError> {
        pack::unpack(self.payload, format)
    }
}

/// Handler for one command id.
///
/// A returned error is logged and the message dropped, unless the error is
/// fatal, in which case it stops the progress loop.
pub type Handler = Box<dyn FnMut(&mut Context<'_>, &Request<'_>) -> Result<()> + Send>;

const TABLE_SIZE: usize = 256;

/// Maps the 255 usable command ids to handlers.
pub struct HandlerTable {
    handlers: Vec<Option<Handler>>,
}

impl Default for HandlerTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HandlerTable {
    pub fn new() -> Self {
        Self {
            handlers: (0..TABLE_SIZE).map(|_| None).collect(),
        }
    }

    /// Installs `handler` for `cmd`.
    ///
    /// Fails for [`Command::NONE`] and for ids that already have one.
    pub fn register<F>(&mut self, cmd: Command, handler: F) -> Result<()>
    where
        F: FnMut(&mut Context<'_>, &Request<'_>) -> Result<()> + Send + 'static,
    {
        if cmd.is_none() {
            return Err(Error::InvalidCommand(cmd.id()));
        }
        let entry = &mut self.handlers[cmd.id() as usize];
        if entry.is_some() {
            return Err(Error::HandlerExists(cmd.id()));
        }
        *entry = Some(Box::new(handler));
        Ok(())
    }

    /// Removes the handler for `cmd`, returning whether one was installed.
    pub fn unregister(&mut self, cmd: Command) -> bool {
        self.handlers[cmd.id() as usize].take().is_some()
    }

    pub fn is_registered(&self, cmd: Command) -> bool {
        self.handlers[cmd.id() as usize].is_some()
    }

    /// Runs the handler for `request`.
    pub fn dispatch(&mut self, ctx: &mut Context<'_>, request: &Request<'_>) -> Result<()> {
        let cmd = request.cmd();
        let Some(handler) = self.handlers[cmd.id() as usize].as_mut() else {
            tracing::warn!(req = request.req, cmd = cmd.id(), "no handler for command, dropped");
            return Ok(());
        };
        match handler(ctx, request) {
            Ok(()) => Ok(()),
            Err(err) if err.is_fatal() => Err(err),
            Err(err) => {
                tracing::warn!(req = request.req, cmd = cmd.id(), %err, "handler failed");
                Ok(())
            }
        }
    }
}
