//! The owned handle a task holds while it has a buffer.

use crate::Shared;
use crate::pool::BufferState;
use bdc_block::BlockBuf;
use bdc_types::{BlockNumber, BufferKey, DeviceId};
use std::fmt;
use std::sync::Arc;
use tracing::warn;

/// Exclusive access to one cached block.
///
/// The slot memory moves into the handle on acquisition and back into the
/// cache on release, so no other task can observe the contents while the
/// handle is alive. Give it back with [`Cache::release`](crate::Cache::release),
/// [`Cache::release_modified`](crate::Cache::release_modified) or
/// [`Cache::sync`](crate::Cache::sync). A handle that is simply dropped is
/// released clean.
pub struct BufferHandle {
    pub(crate) shared: Arc<Shared>,
    pub(crate) index: usize,
    pub(crate) generation: u64,
    pub(crate) key: BufferKey,
    pub(crate) block_size: usize,
    pub(crate) state: BufferState,
    pub(crate) data: Option<BlockBuf>,
    pub(crate) written: bool,
}

/// What a release hands back to the cache.
pub(crate) struct Returned {
    pub shared: Arc<Shared>,
    pub index: usize,
    pub generation: u64,
    pub key: BufferKey,
    pub data: BlockBuf,
    pub written: bool,
}

impl BufferHandle {
    #[must_use]
    pub fn key(&self) -> BufferKey {
        self.key
    }

    #[must_use]
    pub fn device(&self) -> DeviceId {
        self.key.device
    }

    #[must_use]
    pub fn block(&self) -> BlockNumber {
        self.key.block
    }

    /// State the buffer was in when it was handed to this task.
    #[must_use]
    pub fn state(&self) -> BufferState {
        self.state
    }

    /// Block contents, exactly one device block long.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        match &self.data {
            Some(buf) => &buf.as_slice()[..self.block_size],
            None => &[],
        }
    }

    /// Mutable block contents.
    pub fn data_mut(&mut self) -> &mut [u8] {
        self.written = true;
        let block_size = self.block_size;
        match self.data.as_mut() {
            Some(buf) => &mut buf.as_mut_slice()[..block_size],
            None => &mut [],
        }
    }

    /// Detach the slot memory; the handle is inert afterwards.
    pub(crate) fn take(&mut self) -> Option<Returned> {
        let data = self.data.take()?;
        Some(Returned {
            shared: Arc::clone(&self.shared),
            index: self.index,
            generation: self.generation,
            key: self.key,
            data,
            written: self.written,
        })
    }
}

impl fmt::Debug for BufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferHandle")
            .field("key", &self.key)
            .field("index", &self.index)
            .field("state", &self.state)
            .field("written", &self.written)
            .finish_non_exhaustive()
    }
}

impl Drop for BufferHandle {
    fn drop(&mut self) {
        if let Some(returned) = self.take() {
            warn!(
                target: "bdc::access",
                event = "handle_dropped",
                key = %returned.key,
                "buffer handle dropped without release; releasing clean"
            );
            let shared = Arc::clone(&returned.shared);
            if let Err(err) = shared.release(returned, crate::access::ReleaseMode::Clean, None) {
                warn!(
                    target: "bdc::access",
                    event = "handle_drop_release_failed",
                    error = %err
                );
            }
        }
    }
}
