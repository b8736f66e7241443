//! Request/response transport over a shared memory segment.
//!
//! The segment holds two communicators, one per direction. Each is a ring
//! of 64-bit mailbox slots followed by a payload data area. A slot word
//! carries an 8-bit command, a payload offset and a payload length; a
//! payload is a packed `I`/`L`/`x`/`P`/`Q` field list.
//!
//! Messages move through a four stage pipeline (insert, submit, complete,
//! dispatch). A peer that cannot address the segment directly stages
//! payloads through private mirrors with a DMA engine, merging adjacent
//! transfers.
//!
//! ## Peer API
//!
//! - `Peer::host(config)` / `Peer::accelerator(config, dma)`: create or
//!   attach to a link
//! - `register_handler(cmd, f)`: serve a command; `f` gets a `Context`
//! - `progress()` / `serve()`: run the pipeline and dispatch handlers
//! - `send(cmd, fields)`: pack and publish a message (via [`Link`])
//! - `wait_next(timeout)` / `wait_for(req, timeout)`: match incoming
//!   messages, returning an [`Incoming`] guard
//!
//! ## Helpers
//!
//! - [`protocol`]: `PING`, `EXIT`, `ACK`, `RESULT`, `EXCEPTION`
//! - [`bulk`]: fragment buffers larger than one payload

pub mod alloc;
pub mod bulk;
pub mod comm;
pub mod config;
pub mod dispatch;
pub mod dma;
pub mod error;
pub mod layout;
pub mod mailbox;
pub mod matcher;
pub mod pack;
pub mod peer;
pub mod pipeline;
pub mod protocol;
pub mod queue;
pub mod region;
pub mod shm;
pub mod wait;

pub use config::Config;
pub use dispatch::Request;
pub use dma::{DmaEngine, DmaFault, NoEngine, SoftDma};
pub use error::{Error, Result};
pub use mailbox::{Command, Mailbox};
pub use matcher::Incoming;
pub use pack::{Field, Packer, Value};
pub use peer::{Context, Link, Peer, SharedPeer, Side};
pub use queue::{Flags, ReqId};
pub use shm::SharedMemory;
