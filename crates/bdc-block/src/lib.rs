#![forbid(unsafe_code)]
//! Block-device side of the buffer cache.
//!
//! Provides the owned [`BlockBuf`] memory unit, the asynchronous transfer
//! contract drivers implement ([`BlockTransfer`]), the [`DiskDevice`] record
//! the cache consults and updates (geometry, read-ahead trigger, transfer
//! statistics), and reference drivers backed by memory or a file.

pub mod drivers;
pub mod transfer;

pub use drivers::{BlockStore, FileDisk, MemoryDisk, ThreadedDisk};
pub use transfer::{
    BlockTransfer, TransferBuffer, TransferCompletion, TransferFault, TransferOp,
    TransferOutcome, TransferRequest,
};

use bdc_error::{BdcError, Result};
use bdc_types::{BlockNumber, DeviceId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Owned block buffer.
///
/// Invariant: length == buffer size of the size class it was carved for,
/// which is at least the block size of any device it serves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockBuf {
    bytes: Vec<u8>,
}

impl BlockBuf {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    #[must_use]
    pub fn zeroed(len: usize) -> Self {
        Self {
            bytes: vec![0_u8; len],
        }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.bytes
    }
}

/// Transfer statistics of one device, maintained by the cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStats {
    pub read_hits: u64,
    pub read_misses: u64,
    pub read_ahead_transfers: u64,
    pub read_blocks: u64,
    pub read_errors: u64,
    pub write_transfers: u64,
    pub write_blocks: u64,
    pub write_errors: u64,
}

/// Sequential-access detector state of one device.
///
/// `trigger` is the block whose read schedules a read-ahead; `next` is the
/// first block the read-ahead will fetch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadAheadState {
    pub trigger: Option<BlockNumber>,
    pub next: BlockNumber,
    pub queued: bool,
}

/// Device record: geometry, driver, and the counters the cache updates.
pub struct DiskDevice {
    id: DeviceId,
    block_size: u32,
    block_count: u64,
    driver: Arc<dyn BlockTransfer>,
    stats: Mutex<DeviceStats>,
    read_ahead: Mutex<ReadAheadState>,
}

impl fmt::Debug for DiskDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiskDevice")
            .field("id", &self.id)
            .field("block_size", &self.block_size)
            .field("block_count", &self.block_count)
            .field("stats", &*self.stats.lock())
            .finish_non_exhaustive()
    }
}

impl DiskDevice {
    pub fn new(
        id: DeviceId,
        block_size: u32,
        block_count: u64,
        driver: Arc<dyn BlockTransfer>,
    ) -> Result<Self> {
        if block_size == 0 || !block_size.is_power_of_two() {
            return Err(BdcError::UnsupportedBlockSize(block_size));
        }
        Ok(Self {
            id,
            block_size,
            block_count,
            driver,
            stats: Mutex::new(DeviceStats::default()),
            read_ahead: Mutex::new(ReadAheadState::default()),
        })
    }

    #[must_use]
    pub fn id(&self) -> DeviceId {
        self.id
    }

    #[must_use]
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    #[must_use]
    pub fn block_count(&self) -> u64 {
        self.block_count
    }

    #[must_use]
    pub fn driver(&self) -> &Arc<dyn BlockTransfer> {
        &self.driver
    }

    /// Reject blocks beyond the end of the device.
    pub fn check_block(&self, block: BlockNumber) -> Result<()> {
        if block.0 >= self.block_count {
            return Err(BdcError::InvalidBlock {
                block: block.0,
                block_count: self.block_count,
            });
        }
        Ok(())
    }

    /// Snapshot of the transfer statistics.
    #[must_use]
    pub fn stats(&self) -> DeviceStats {
        *self.stats.lock()
    }

    pub fn reset_stats(&self) {
        *self.stats.lock() = DeviceStats::default();
    }

    /// Apply an update to the statistics.
    pub fn update_stats(&self, update: impl FnOnce(&mut DeviceStats)) {
        update(&mut self.stats.lock());
    }

    /// Apply an update to the read-ahead state, returning the closure result.
    pub fn with_read_ahead<R>(&self, update: impl FnOnce(&mut ReadAheadState) -> R) -> R {
        update(&mut self.read_ahead.lock())
    }
}
