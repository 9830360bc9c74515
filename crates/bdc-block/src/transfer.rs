//! Transfer interface between the cache and a block-device driver.
//!
//! The cache hands a driver a [`TransferRequest`]: one operation on one
//! contiguous run of blocks, each block carried in its own owned buffer.
//! The driver performs the I/O whenever and on whatever thread it likes and
//! finishes the request with [`TransferRequest::complete`], which hands the
//! buffers back together with the status.
//!
//! The submitter never assumes synchronous completion. It keeps the
//! [`TransferCompletion`] returned by [`TransferRequest::new`] and blocks on
//! it. A request dropped by a driver without being completed is completed
//! with an error so that no submitter can hang on a lost request.

use crate::BlockBuf;
use bdc_error::IoDirection;
use bdc_types::{BlockNumber, DeviceId};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

/// Operation requested from the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferOp {
    Read,
    Write,
}

impl TransferOp {
    #[must_use]
    pub fn direction(self) -> IoDirection {
        match self {
            Self::Read => IoDirection::Read,
            Self::Write => IoDirection::Write,
        }
    }
}

impl fmt::Display for TransferOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.direction().fmt(f)
    }
}

/// Failure reported by a driver for a whole run.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct TransferFault(pub String);

impl From<std::io::Error> for TransferFault {
    fn from(err: std::io::Error) -> Self {
        Self(err.to_string())
    }
}

/// One scatter/gather element: a block number and the buffer for it.
#[derive(Debug)]
pub struct TransferBuffer {
    pub block: BlockNumber,
    pub data: BlockBuf,
}

/// What the submitter gets back once the driver is done.
#[derive(Debug)]
pub struct TransferOutcome {
    pub buffers: Vec<TransferBuffer>,
    pub status: Result<(), TransferFault>,
}

/// Per-request completion signal.
#[derive(Debug, Default)]
pub struct TransferCompletion {
    slot: Mutex<Option<TransferOutcome>>,
    done: Condvar,
}

impl TransferCompletion {
    fn finish(&self, outcome: TransferOutcome) {
        let mut slot = self.slot.lock();
        *slot = Some(outcome);
        drop(slot);
        self.done.notify_all();
    }

    /// Block until the driver completes the request.
    pub fn wait(&self) -> TransferOutcome {
        let mut slot = self.slot.lock();
        loop {
            if let Some(outcome) = slot.take() {
                return outcome;
            }
            self.done.wait(&mut slot);
        }
    }

    /// Block until the request completes or `deadline` passes.
    ///
    /// Returns `None` on timeout; the outcome stays in the slot for a later
    /// `wait`.
    pub fn wait_until(&self, deadline: Instant) -> Option<TransferOutcome> {
        let mut slot = self.slot.lock();
        loop {
            if let Some(outcome) = slot.take() {
                return Some(outcome);
            }
            if self.done.wait_until(&mut slot, deadline).timed_out() {
                return slot.take();
            }
        }
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.slot.lock().is_some()
    }
}

/// A contiguous run of blocks to move between memory and the medium.
///
/// Invariant: `buffers` is non-empty and its block numbers ascend by one.
#[derive(Debug)]
pub struct TransferRequest {
    op: TransferOp,
    device: DeviceId,
    buffers: Vec<TransferBuffer>,
    completion: Option<Arc<TransferCompletion>>,
}

impl TransferRequest {
    /// Build a request and the completion signal its submitter waits on.
    ///
    /// # Panics
    ///
    /// Panics if `buffers` is empty or not a contiguous ascending run; both
    /// are programming errors in the submitter.
    #[must_use]
    pub fn new(
        op: TransferOp,
        device: DeviceId,
        buffers: Vec<TransferBuffer>,
    ) -> (Self, Arc<TransferCompletion>) {
        assert!(!buffers.is_empty(), "transfer request without buffers");
        assert!(
            buffers
                .windows(2)
                .all(|pair| pair[0].block.is_followed_by(pair[1].block)),
            "transfer request blocks are not contiguous"
        );
        let completion = Arc::new(TransferCompletion::default());
        let request = Self {
            op,
            device,
            buffers,
            completion: Some(Arc::clone(&completion)),
        };
        (request, completion)
    }

    #[must_use]
    pub fn op(&self) -> TransferOp {
        self.op
    }

    #[must_use]
    pub fn device(&self) -> DeviceId {
        self.device
    }

    /// First block of the run.
    #[must_use]
    pub fn start(&self) -> BlockNumber {
        self.buffers[0].block
    }

    /// Number of blocks in the run.
    #[must_use]
    pub fn block_count(&self) -> usize {
        self.buffers.len()
    }

    #[must_use]
    pub fn buffers(&self) -> &[TransferBuffer] {
        &self.buffers
    }

    pub fn buffers_mut(&mut self) -> &mut [TransferBuffer] {
        &mut self.buffers
    }

    /// Finish the request and hand the buffers back to the submitter.
    pub fn complete(mut self, status: Result<(), TransferFault>) {
        self.finish(status);
    }

    fn finish(&mut self, status: Result<(), TransferFault>) {
        if let Some(completion) = self.completion.take() {
            completion.finish(TransferOutcome {
                buffers: std::mem::take(&mut self.buffers),
                status,
            });
        }
    }
}

impl Drop for TransferRequest {
    fn drop(&mut self) {
        if self.completion.is_some() {
            tracing::warn!(
                target: "bdc::transfer",
                event = "request_dropped",
                device = %self.device,
                op = %self.op,
                "driver dropped a transfer request without completing it"
            );
            self.finish(Err(TransferFault("request dropped by driver".to_owned())));
        }
    }
}

/// A physical block-device driver.
pub trait BlockTransfer: Send + Sync {
    /// Start the transfer. Completion is reported through the request.
    fn submit(&self, request: TransferRequest);

    /// Largest run the driver accepts in one request.
    fn max_blocks_per_request(&self) -> usize {
        usize::MAX
    }
}
