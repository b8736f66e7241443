//! Error types and the top-level fatal handler.

use std::io;

use nix::sys::signal::{Signal, raise};
use thiserror::Error;

use crate::dma::DmaFault;
use crate::pack::PackError;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Transport error.
#[derive(Debug, Error)]
pub enum Error {
    /// Mapping or segment syscall failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A bounded wait ran out.
    #[error("timed out waiting for {what}{}", .req.map(|r| format!(" (req {r})")).unwrap_or_default())]
    Timeout {
        what: &'static str,
        req: Option<u64>,
    },

    /// No payload space became free before the allocation deadline.
    #[error("payload allocation of {size} bytes timed out")]
    AllocTimeout { size: usize },

    /// The payload can never fit the data area or the slot word.
    #[error("payload of {size} bytes exceeds the limit of {max}")]
    PayloadTooLarge { size: usize, max: usize },

    /// Command id 0 is reserved.
    #[error("invalid command id {0}")]
    InvalidCommand(u8),

    /// A handler is already registered for the command.
    #[error("handler for command {0} already registered")]
    HandlerExists(u8),

    /// Request ids of the two sides no longer line up.
    #[error("request id desync: expected {expected}, got {got}")]
    Desync { expected: u64, got: u64 },

    /// The DMA engine reported a hardware exception.
    #[error("DMA fault: {0}")]
    DmaFault(DmaFault),

    /// Payload encoding failed.
    #[error(transparent)]
    Pack(#[from] PackError),

    /// The peer answered with an exception notification.
    #[error("remote exception {code:#x}")]
    RemoteException { code: u64 },

    /// Malformed configuration value.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Segment names are limited to 255 bytes.
    #[error("segment name too long")]
    NameTooLong,

    /// The peer has marked itself exited.
    #[error("peer detached")]
    Detached,
}

impl Error {
    /// Returns true if the error leaves the link in a state nobody can
    /// recover from.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Desync { .. } | Error::DmaFault(_))
    }

    /// Signal raised when this error terminates the process.
    pub fn signal(&self) -> Signal {
        match self {
            Error::DmaFault(fault) => fault.signal(),
            _ => Signal::SIGABRT,
        }
    }
}

impl From<DmaFault> for Error {
    fn from(fault: DmaFault) -> Self {
        Error::DmaFault(fault)
    }
}

/// Terminates the process for a fatal transport error.
///
/// Raises the signal matching the error so the exit status tells a bus
/// fault from a segmentation fault, then aborts in case the signal is
/// caught and returns.
pub fn terminate(err: &Error) -> ! {
    let signal = err.signal();
    tracing::error!(%err, ?signal, "fatal transport error");
    let _ = raise(signal);
    std::process::abort()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(Error::Desync { expected: 3, got: 4 }.is_fatal());
        assert!(Error::DmaFault(DmaFault::from_code(0x1000)).is_fatal());
        assert!(!Error::Timeout { what: "reply", req: Some(1) }.is_fatal());
        assert!(!Error::AllocTimeout { size: 8 }.is_fatal());
    }

    #[test]
    fn test_signals() {
        assert_eq!(Error::DmaFault(DmaFault::from_code(0x8000)).signal(), Signal::SIGBUS);
        assert_eq!(Error::DmaFault(DmaFault::from_code(0x1000)).signal(), Signal::SIGSEGV);
        assert_eq!(Error::Desync { expected: 0, got: 1 }.signal(), Signal::SIGABRT);
    }

    #[test]
    fn test_timeout_display() {
        let err = Error::Timeout { what: "reply", req: Some(7) };
        assert_eq!(err.to_string(), "timed out waiting for reply (req 7)");
        let err = Error::Timeout { what: "attach", req: None };
        assert_eq!(err.to_string(), "timed out waiting for attach");
    }
}
