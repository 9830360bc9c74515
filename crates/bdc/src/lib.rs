#![forbid(unsafe_code)]
//! Block device buffer cache public API facade.
//!
//! Re-exports the cache from `bdc-cache` together with the device, transfer,
//! identity, and error types a consumer needs to drive it.

pub use bdc_block::{
    BlockBuf, BlockStore, BlockTransfer, DeviceStats, DiskDevice, FileDisk, MemoryDisk,
    ReadAheadState, ThreadedDisk, TransferBuffer, TransferCompletion, TransferFault, TransferOp,
    TransferOutcome, TransferRequest,
};
pub use bdc_cache::*;
pub use bdc_error::{BdcError, IoDirection, Result};
pub use bdc_types::{BlockNumber, BufferKey, DeviceId, Priority};
