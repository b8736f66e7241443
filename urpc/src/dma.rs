//! DMA engine interface.
//!
//! The staged pipeline talks to the copy engine through [`DmaEngine`]:
//! `post` queues a transfer and returns a handle, `poll` reports whether
//! the transfer behind a handle finished. A full hardware queue is
//! reported as [`PostError::Again`], a hardware exception as a fault code.
//!
//! [`SoftDma`] implements the interface with `memcpy` for hosts without a
//! copy engine and for tests.

use std::fmt;

use bitflags::bitflags;
use nix::sys::signal::Signal;
use slab::Slab;

use crate::wait::Backoff;

/// Opaque handle for a posted transfer.
pub type DmaHandle = usize;

// =============================================================================
// Fault decoding
// =============================================================================

bitflags! {
    /// Exception bits reported by a failed transfer.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FaultBits: u64 {
        /// Memory protection violation.
        const MEMORY_PROTECTION = 0x8000;
        /// Missing page.
        const MISSING_PAGE = 0x4000;
        /// Missing space.
        const MISSING_SPACE = 0x2000;
        /// Memory access error.
        const MEMORY_ACCESS = 0x1000;
        /// I/O access error.
        const IO_ACCESS = 0x0800;
    }
}

/// Decoded DMA exception.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaFault {
    code: u64,
}

impl DmaFault {
    pub fn from_code(code: u64) -> Self {
        Self { code }
    }

    /// Raw exception word.
    pub fn code(&self) -> u64 {
        self.code
    }

    /// Most significant reason, checked from the highest bit down.
    pub fn reason(&self) -> &'static str {
        let bits = FaultBits::from_bits_truncate(self.code);
        if bits.contains(FaultBits::MEMORY_PROTECTION) {
            "memory protection exception"
        } else if bits.contains(FaultBits::MISSING_PAGE) {
            "missing page exception"
        } else if bits.contains(FaultBits::MISSING_SPACE) {
            "missing space exception"
        } else if bits.contains(FaultBits::MEMORY_ACCESS) {
            "memory access exception"
        } else if bits.contains(FaultBits::IO_ACCESS) {
            "I/O access exception"
        } else {
            "unknown exception"
        }
    }

    /// Closest platform signal for terminating on this fault.
    pub fn signal(&self) -> Signal {
        let bits = FaultBits::from_bits_truncate(self.code);
        if bits.intersects(
            FaultBits::MEMORY_PROTECTION | FaultBits::MISSING_PAGE | FaultBits::MISSING_SPACE,
        ) {
            Signal::SIGBUS
        } else if bits.contains(FaultBits::MEMORY_ACCESS) {
            Signal::SIGSEGV
        } else if bits.contains(FaultBits::IO_ACCESS) {
            Signal::SIGABRT
        } else {
            Signal::SIGILL
        }
    }
}

impl fmt::Display for DmaFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {:#x})", self.reason(), self.code)
    }
}

// =============================================================================
// Engine interface
// =============================================================================

/// Why a transfer could not be posted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostError {
    /// The engine queue is full; retry after polling.
    Again,
    /// The engine rejected the transfer.
    Fault(DmaFault),
}

/// State of a posted transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaPoll {
    Pending,
    Done,
    Fault(DmaFault),
}

/// A copy engine moving bytes between absolute addresses.
pub trait DmaEngine: Send {
    /// Queues a copy of `len` bytes from `src` to `dst`.
    fn post(&mut self, dst: u64, src: u64, len: usize) -> Result<DmaHandle, PostError>;

    /// Checks on a posted transfer. A handle is released once it reports
    /// `Done` or `Fault`.
    fn poll(&mut self, handle: DmaHandle) -> DmaPoll;

    /// Copies synchronously, spinning until the engine accepts and finishes.
    fn transfer(&mut self, dst: u64, src: u64, len: usize) -> Result<(), DmaFault> {
        let mut backoff = Backoff::new();
        let handle = loop {
            match self.post(dst, src, len) {
                Ok(h) => break h,
                Err(PostError::Again) => backoff.spin(),
                Err(PostError::Fault(fault)) => return Err(fault),
            }
        };
        backoff.reset();
        loop {
            match self.poll(handle) {
                DmaPoll::Pending => backoff.spin(),
                DmaPoll::Done => return Ok(()),
                DmaPoll::Fault(fault) => return Err(fault),
            }
        }
    }
}

/// Engine of a peer that addresses the shared segment directly and never
/// transfers anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoEngine;

impl DmaEngine for NoEngine {
    fn post(&mut self, _dst: u64, _src: u64, _len: usize) -> Result<DmaHandle, PostError> {
        Err(PostError::Fault(DmaFault::from_code(0)))
    }

    fn poll(&mut self, _handle: DmaHandle) -> DmaPoll {
        DmaPoll::Fault(DmaFault::from_code(0))
    }
}

// =============================================================================
// Software engine
// =============================================================================

struct Job {
    dst: u64,
    src: u64,
    len: usize,
    polls_left: u32,
    fault: Option<DmaFault>,
}

/// Counters of a [`SoftDma`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DmaStats {
    pub posts: u64,
    pub bytes: u64,
    pub rejected: u64,
}

/// `memcpy` engine with a bounded queue. The copy happens when a poll
/// finds the transfer complete.
pub struct SoftDma {
    jobs: Slab<Job>,
    depth: usize,
    latency: u32,
    fail_next: Option<DmaFault>,
    stats: DmaStats,
}

impl SoftDma {
    /// Engine accepting at most `depth` outstanding transfers.
    ///
    /// # Safety
    /// Every `(dst, src, len)` posted must describe memory valid for
    /// writing and reading until the transfer is polled to completion.
    pub unsafe fn new(depth: usize) -> Self {
        Self {
            jobs: Slab::with_capacity(depth),
            depth: depth.max(1),
            latency: 0,
            fail_next: None,
            stats: DmaStats::default(),
        }
    }

    /// Number of `Pending` answers a transfer gives before it completes.
    pub fn with_latency(mut self, polls: u32) -> Self {
        self.latency = polls;
        self
    }

    /// Makes the next posted transfer fail with `code`.
    pub fn fail_next(&mut self, code: u64) {
        self.fail_next = Some(DmaFault::from_code(code));
    }

    pub fn stats(&self) -> DmaStats {
        self.stats
    }

    pub fn outstanding(&self) -> usize {
        self.jobs.len()
    }
}

impl DmaEngine for SoftDma {
    fn post(&mut self, dst: u64, src: u64, len: usize) -> Result<DmaHandle, PostError> {
        if self.jobs.len() >= self.depth {
            self.stats.rejected += 1;
            return Err(PostError::Again);
        }
        self.stats.posts += 1;
        self.stats.bytes += len as u64;
        Ok(self.jobs.insert(Job {
            dst,
            src,
            len,
            polls_left: self.latency,
            fault: self.fail_next.take(),
        }))
    }

    fn poll(&mut self, handle: DmaHandle) -> DmaPoll {
        let Some(job) = self.jobs.get_mut(handle) else {
            return DmaPoll::Fault(DmaFault::from_code(0));
        };
        if job.polls_left > 0 {
            job.polls_left -= 1;
            return DmaPoll::Pending;
        }
        let job = self.jobs.remove(handle);
        if let Some(fault) = job.fault {
            return DmaPoll::Fault(fault);
        }
        // SAFETY: guaranteed by the contract of `SoftDma::new`.
        unsafe {
            std::ptr::copy(job.src as *const u8, job.dst as *mut u8, job.len);
        }
        DmaPoll::Done
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_decode() {
        let cases = [
            (0x8000, "memory protection exception", Signal::SIGBUS),
            (0x4000, "missing page exception", Signal::SIGBUS),
            (0x2000, "missing space exception", Signal::SIGBUS),
            (0x1000, "memory access exception", Signal::SIGSEGV),
            (0x0800, "I/O access exception", Signal::SIGABRT),
            (0x0001, "unknown exception", Signal::SIGILL),
        ];
        for (code, reason, signal) in cases {
            let fault = DmaFault::from_code(code);
            assert_eq!(fault.reason(), reason);
            assert_eq!(fault.signal(), signal);
        }
        // The highest bit wins.
        let fault = DmaFault::from_code(0x1800);
        assert_eq!(fault.reason(), "memory access exception");
    }

    #[test]
    fn test_soft_copy_on_poll() {
        let src = [7u8; 32];
        let mut dst = [0u8; 32];
        let mut dma = unsafe { SoftDma::new(2) }.with_latency(1);
        let h = dma
            .post(dst.as_mut_ptr() as u64, src.as_ptr() as u64, 32)
            .unwrap();
        assert_eq!(dma.poll(h), DmaPoll::Pending);
        assert_eq!(dma.poll(h), DmaPoll::Done);
        assert_eq!(dst, [7u8; 32]);
        assert_eq!(dma.outstanding(), 0);
        assert_eq!(dma.stats().posts, 1);
        assert_eq!(dma.stats().bytes, 32);
    }

    #[test]
    fn test_soft_queue_full() {
        let buf = [0u8; 8];
        let addr = buf.as_ptr() as u64;
        let mut dma = unsafe { SoftDma::new(1) };
        let h = dma.post(addr, addr, 8).unwrap();
        assert_eq!(dma.post(addr, addr, 8), Err(PostError::Again));
        assert_eq!(dma.poll(h), DmaPoll::Done);
        assert!(dma.post(addr, addr, 8).is_ok());
        assert_eq!(dma.stats().rejected, 1);
    }

    #[test]
    fn test_injected_fault() {
        let src = [1u8; 8];
        let mut dst = [0u8; 8];
        let mut dma = unsafe { SoftDma::new(4) };
        dma.fail_next(0x4000);
        let err = dma
            .transfer(dst.as_mut_ptr() as u64, src.as_ptr() as u64, 8)
            .unwrap_err();
        assert_eq!(err.signal(), Signal::SIGBUS);
        assert_eq!(dst, [0u8; 8], "faulted transfers copy nothing");
        dma.transfer(dst.as_mut_ptr() as u64, src.as_ptr() as u64, 8)
            .unwrap();
        assert_eq!(dst, [1u8; 8]);
    }
}
