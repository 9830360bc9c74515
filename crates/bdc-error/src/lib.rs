#![forbid(unsafe_code)]
//! Error types for the block device cache.
//!
//! # Error Taxonomy
//!
//! | Variant | Raised by | errno |
//! |---------|-----------|-------|
//! | `NoMemory` | `get`/`read` when the size class has no buffers, or a bounded wait for a free buffer expired | `ENOMEM` |
//! | `Io` | any transfer reported as failed by the driver | `EIO` |
//! | `InvalidBuffer` | `release`/`release_modified`/`sync` with a handle that is not held | `EINVAL` |
//! | `InvalidBlock` | block number beyond the device end | `EINVAL` |
//! | `UnsupportedBlockSize` | device block size larger than every size class | `EINVAL` |
//! | `InvalidConfig` | `Cache::init` with an unusable configuration | `EINVAL` |
//! | `Timeout` | a caller-supplied deadline expired while suspended | `ETIMEDOUT` |
//! | `ShutDown` | the cache workers have been stopped | `ESHUTDOWN` |
//! | `WorkerSpawn` | `Cache::init` could not start a worker thread | `EAGAIN` |
//!
//! ## Propagation Policy
//!
//! Transfer errors are never retried inside the cache. They are handed to
//! every task that was waiting on the failed transfer and recorded in the
//! device statistics; retry policy belongs to the caller or the driver.
//!
//! `bdc-error` MUST NOT depend on `bdc-types` or `bdc-block`; block numbers
//! are carried as plain `u64` here.

use std::fmt;
use thiserror::Error;

/// Direction of a failed transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IoDirection {
    Read,
    Write,
}

impl fmt::Display for IoDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => f.write_str("read"),
            Self::Write => f.write_str("write"),
        }
    }
}

/// Unified error type for all cache operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BdcError {
    /// No buffer could be obtained for the requested block.
    #[error("no buffer memory available")]
    NoMemory,

    /// The physical transfer failed.
    ///
    /// `block` is the first block of the failed run.
    #[error("{direction} transfer failed at block {block}: {detail}")]
    Io {
        direction: IoDirection,
        block: u64,
        detail: String,
    },

    /// The handle does not name a buffer currently held from this cache.
    #[error("invalid buffer: {0}")]
    InvalidBuffer(String),

    /// Block number outside the device.
    #[error("block {block} out of range (device has {block_count} blocks)")]
    InvalidBlock { block: u64, block_count: u64 },

    /// No size class can hold blocks of this size.
    #[error("unsupported block size: {0}")]
    UnsupportedBlockSize(u32),

    /// Cache configuration rejected at initialization.
    #[error("invalid cache configuration: {0}")]
    InvalidConfig(String),

    /// A caller-supplied deadline expired while waiting.
    #[error("operation timed out")]
    Timeout,

    /// The cache workers are stopped.
    #[error("cache is shut down")]
    ShutDown,

    /// A background worker thread could not be started.
    #[error("cannot start cache worker: {0}")]
    WorkerSpawn(String),
}

impl BdcError {
    /// Convenience constructor for a read failure.
    #[must_use]
    pub fn read_failed(block: u64, detail: impl Into<String>) -> Self {
        Self::Io {
            direction: IoDirection::Read,
            block,
            detail: detail.into(),
        }
    }

    /// Convenience constructor for a write failure.
    #[must_use]
    pub fn write_failed(block: u64, detail: impl Into<String>) -> Self {
        Self::Io {
            direction: IoDirection::Write,
            block,
            detail: detail.into(),
        }
    }

    /// True for transfer failures in either direction.
    #[must_use]
    pub fn is_io(&self) -> bool {
        matches!(self, Self::Io { .. })
    }

    /// Convert this error into a POSIX errno.
    ///
    /// The mapping is exhaustive so that adding a variant is a compile error
    /// until its errno is assigned.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::NoMemory => libc::ENOMEM,
            Self::Io { .. } => libc::EIO,
            Self::InvalidBuffer(_)
            | Self::InvalidBlock { .. }
            | Self::UnsupportedBlockSize(_)
            | Self::InvalidConfig(_) => libc::EINVAL,
            Self::Timeout => libc::ETIMEDOUT,
            Self::ShutDown => libc::ESHUTDOWN,
            Self::WorkerSpawn(_) => libc::EAGAIN,
        }
    }
}

/// Result alias using `BdcError`.
pub type Result<T> = std::result::Result<T, BdcError>;
