#![forbid(unsafe_code)]
//! Block device buffer cache.
//!
//! A bounded pool of fixed-size buffers keyed by (device, block). Callers
//! acquire a buffer with [`Cache::get`] or [`Cache::read`], own it
//! exclusively through a [`BufferHandle`], and hand it back clean, modified,
//! or synchronously written. Modified buffers are written back by a
//! background swapout worker that coalesces adjacent blocks into one
//! transfer; an optional read-ahead worker prefetches sequential reads.
//!
//! # Locking
//!
//! One cache-wide mutex guards the descriptors, the association index, and
//! every list. It is never held across a driver call: transfers run with
//! the lock released and their results are applied after reacquiring it.
//! Tasks block on per-descriptor condition variables (access), the buffer
//! condition variable (pool exhausted), or the transfer condition variable
//! (sync), all of which release the lock while waiting.

mod access;
pub mod config;
mod handle;
mod list;
mod pool;
pub mod priority;
mod purge;
mod read_ahead;
pub mod report;
mod swapout;

pub use config::{CacheConfig, SizeClass};
pub use handle::BufferHandle;
pub use pool::BufferState;
pub use priority::{HostPriority, PriorityBoost, PriorityControl, SchedulerPriority, boost_target};
pub use report::{BufferReport, CacheReport, ClassReport, StateCounts};

use access::{AccessMode, ReleaseMode};
use bdc_block::{DiskDevice, TransferBuffer, TransferOp, TransferOutcome, TransferRequest};
use bdc_error::{BdcError, Result};
use bdc_types::{BlockNumber, DeviceId, Priority};
use parking_lot::{Condvar, Mutex, MutexGuard};
use pool::CacheState;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// State shared between the API, the handles, and the workers.
pub(crate) struct Shared {
    pub(crate) config: CacheConfig,
    pub(crate) classes: Vec<SizeClass>,
    pub(crate) state: Mutex<CacheState>,
    /// One per descriptor: signalled whenever that descriptor changes state.
    pub(crate) desc_cv: Vec<Condvar>,
    /// Signalled when a buffer becomes reusable.
    pub(crate) buffer_cv: Condvar,
    /// Signalled when a transfer ticket is resolved.
    pub(crate) transfer_cv: Condvar,
    pub(crate) swapout_cv: Condvar,
    pub(crate) read_ahead_cv: Condvar,
    pub(crate) priority: Arc<dyn PriorityControl>,
}

/// Wait on `cv`, bounded by `deadline`. Returns `true` when the deadline
/// passed.
pub(crate) fn wait_on(
    cv: &Condvar,
    st: &mut MutexGuard<'_, CacheState>,
    deadline: Option<Instant>,
) -> bool {
    match deadline {
        Some(deadline) => cv.wait_until(st, deadline).timed_out(),
        None => {
            cv.wait(st);
            false
        }
    }
}

/// Submit one run to the device driver and block until it completes.
///
/// Must be called without the cache lock held.
pub(crate) fn execute(
    disk: &DiskDevice,
    op: TransferOp,
    buffers: Vec<TransferBuffer>,
) -> TransferOutcome {
    let (request, completion) = TransferRequest::new(op, disk.id(), buffers);
    disk.driver().submit(request);
    completion.wait()
}

fn deadline_after(timeout: Duration) -> Option<Instant> {
    Instant::now().checked_add(timeout)
}

/// A running buffer cache.
pub struct Cache {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("classes", &self.shared.classes)
            .field("workers", &self.workers.len())
            .finish_non_exhaustive()
    }
}

impl Cache {
    /// Build the pool and start the background workers.
    pub fn init(config: CacheConfig, priority: Arc<dyn PriorityControl>) -> Result<Self> {
        let classes = config.validate()?;
        let state = CacheState::new(&classes, config.swapout_priority);
        let descriptors = state.descs.len();
        let shared = Arc::new(Shared {
            desc_cv: (0..descriptors).map(|_| Condvar::new()).collect(),
            classes,
            state: Mutex::new(state),
            buffer_cv: Condvar::new(),
            transfer_cv: Condvar::new(),
            swapout_cv: Condvar::new(),
            read_ahead_cv: Condvar::new(),
            priority,
            config,
        });

        let mut cache = Self {
            shared,
            workers: Vec::new(),
        };
        let swapout = Arc::clone(&cache.shared);
        cache.spawn_worker("bdc-swapout", move || swapout::run(&swapout))?;
        if cache.shared.config.max_read_ahead_blocks > 0 {
            let read_ahead = Arc::clone(&cache.shared);
            cache.spawn_worker("bdc-read-ahead", move || read_ahead::run(&read_ahead))?;
        }

        info!(
            target: "bdc::pool",
            event = "cache_init",
            buffers = descriptors,
            classes = cache.shared.classes.len(),
            read_ahead = cache.shared.config.max_read_ahead_blocks,
            swapout_priority = cache.shared.config.swapout_priority.0
        );
        Ok(cache)
    }

    /// [`Cache::init`] with worker boosts applied to the host scheduler.
    pub fn with_config(config: CacheConfig) -> Result<Self> {
        Self::init(config, Arc::new(SchedulerPriority))
    }

    fn spawn_worker(&mut self, name: &str, body: impl FnOnce() + Send + 'static) -> Result<()> {
        let handle = std::thread::Builder::new()
            .name(name.to_owned())
            .spawn(body)
            .map_err(|err| BdcError::WorkerSpawn(format!("{name}: {err}")))?;
        self.workers.push(handle);
        Ok(())
    }

    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.shared.config
    }

    #[must_use]
    pub fn size_classes(&self) -> &[SizeClass] {
        &self.shared.classes
    }

    /// Acquire a block without reading it from the medium.
    ///
    /// On a miss the handle carries whatever the slot last held; the caller
    /// is expected to overwrite it.
    pub fn get(&self, disk: &Arc<DiskDevice>, block: BlockNumber) -> Result<BufferHandle> {
        self.shared.acquire(disk, block, AccessMode::Get, None)
    }

    /// [`Cache::get`] bounded by `timeout`.
    pub fn get_timeout(
        &self,
        disk: &Arc<DiskDevice>,
        block: BlockNumber,
        timeout: Duration,
    ) -> Result<BufferHandle> {
        self.shared
            .acquire(disk, block, AccessMode::Get, deadline_after(timeout))
    }

    /// Acquire a block and mark it modified, so that even a clean release
    /// queues it for write-back.
    pub fn get_modified(&self, disk: &Arc<DiskDevice>, block: BlockNumber) -> Result<BufferHandle> {
        let mut handle = self.get(disk, block)?;
        self.shared.mark_modified(&mut handle)?;
        Ok(handle)
    }

    /// Acquire a block with its current on-media contents.
    pub fn read(&self, disk: &Arc<DiskDevice>, block: BlockNumber) -> Result<BufferHandle> {
        self.shared.acquire(disk, block, AccessMode::Read, None)
    }

    /// [`Cache::read`] bounded by `timeout`.
    pub fn read_timeout(
        &self,
        disk: &Arc<DiskDevice>,
        block: BlockNumber,
        timeout: Duration,
    ) -> Result<BufferHandle> {
        self.shared
            .acquire(disk, block, AccessMode::Read, deadline_after(timeout))
    }

    /// Hand a buffer back; it stays dirty only if it was acquired dirty.
    pub fn release(&self, handle: BufferHandle) -> Result<()> {
        self.give_back(handle, ReleaseMode::Clean, None)
    }

    /// Hand a buffer back and queue it for write-back.
    pub fn release_modified(&self, handle: BufferHandle) -> Result<()> {
        self.give_back(handle, ReleaseMode::Modified, None)
    }

    /// Hand a buffer back and wait until it has been written.
    pub fn sync(&self, handle: BufferHandle) -> Result<()> {
        self.give_back(handle, ReleaseMode::Sync, None)
    }

    /// [`Cache::sync`] bounded by `timeout`. On timeout the write still
    /// happens; only the wait is abandoned.
    pub fn sync_timeout(&self, handle: BufferHandle, timeout: Duration) -> Result<()> {
        self.give_back(handle, ReleaseMode::Sync, deadline_after(timeout))
    }

    fn give_back(
        &self,
        mut handle: BufferHandle,
        mode: ReleaseMode,
        deadline: Option<Instant>,
    ) -> Result<()> {
        if !Arc::ptr_eq(&handle.shared, &self.shared) {
            return Err(BdcError::InvalidBuffer(format!(
                "{} belongs to another cache",
                handle.key
            )));
        }
        let returned = handle
            .take()
            .ok_or_else(|| BdcError::InvalidBuffer(format!("{} already released", handle.key)))?;
        self.shared.release(returned, mode, deadline)
    }

    /// Drop every buffer of `disk`, waiting for holders and in-flight
    /// transfers. Modified data is lost.
    pub fn purge(&self, disk: &DiskDevice) {
        self.shared.purge(disk);
    }

    /// Write every modified buffer of `disk` and wait for the writes.
    pub fn sync_device(&self, disk: &DiskDevice) -> Result<()> {
        self.shared.sync_device(disk.id(), None)
    }

    /// [`Cache::sync_device`] bounded by `timeout`.
    pub fn sync_device_timeout(&self, disk: &DiskDevice, timeout: Duration) -> Result<()> {
        self.shared.sync_device(disk.id(), deadline_after(timeout))
    }

    /// Change the base priority of the swapout worker. The worker applies
    /// it to itself before its next pass.
    pub fn set_swapout_priority(&self, priority: Priority) {
        self.shared.state.lock().swapout_priority = priority;
        self.shared.swapout_cv.notify_all();
    }

    /// Snapshot of the pool, optionally listing only the buffers of one
    /// device.
    #[must_use]
    pub fn report(&self, device: Option<DeviceId>) -> CacheReport {
        report::build(&self.shared, device)
    }

    /// Write back all dirty data, stop the workers, and release the pool.
    ///
    /// Returns the first write error observed during the final flush.
    pub fn teardown(mut self) -> Result<()> {
        let flushed = self.shared.sync_all();
        self.stop_workers();
        info!(
            target: "bdc::pool",
            event = "cache_teardown",
            flushed = flushed.is_ok()
        );
        flushed
    }

    fn stop_workers(&mut self) {
        {
            let mut st = self.shared.state.lock();
            st.shutdown = true;
        }
        self.shared.swapout_cv.notify_all();
        self.shared.read_ahead_cv.notify_all();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                warn!(target: "bdc::pool", event = "worker_panicked");
            }
        }
    }
}

impl Drop for Cache {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            self.stop_workers();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bdc_block::MemoryDisk;

    pub(crate) fn memory_disk(id: u32, blocks: u64) -> (Arc<MemoryDisk>, Arc<DiskDevice>) {
        let store = Arc::new(MemoryDisk::new(512, blocks));
        let disk = Arc::new(
            DiskDevice::new(DeviceId(id), 512, blocks, Arc::clone(&store) as _).expect("device"),
        );
        (store, disk)
    }

    pub(crate) fn small_cache(buffers: usize) -> Cache {
        Cache::with_config(CacheConfig {
            swap_block_hold_ms: 0,
            swapout_period_ms: 20,
            ..CacheConfig::single_class(512, buffers)
        })
        .expect("cache")
    }

    #[test]
    fn read_miss_then_hit() {
        let cache = small_cache(4);
        let (store, disk) = memory_disk(1, 8);
        store.fill_block(BlockNumber(3), 0x33);

        let handle = cache.read(&disk, BlockNumber(3)).expect("read");
        assert_eq!(handle.state(), BufferState::AccessedCached);
        assert!(handle.data().iter().all(|&b| b == 0x33));
        assert_eq!(handle.data().len(), 512);
        cache.release(handle).expect("release");

        let again = cache.read(&disk, BlockNumber(3)).expect("read");
        cache.release(again).expect("release");
        let stats = disk.stats();
        assert_eq!(stats.read_misses, 1);
        assert_eq!(stats.read_hits, 1);
        assert_eq!(stats.read_blocks, 1);
    }

    #[test]
    fn get_on_miss_is_accessed_empty() {
        let cache = small_cache(2);
        let (_, disk) = memory_disk(1, 8);
        let handle = cache.get(&disk, BlockNumber(0)).expect("get");
        assert_eq!(handle.state(), BufferState::AccessedEmpty);
        assert_eq!(handle.block(), BlockNumber(0));
        assert_eq!(handle.device(), DeviceId(1));
        cache.release(handle).expect("release");
        assert_eq!(disk.stats().read_misses, 0);
    }

    #[test]
    fn get_modified_marks_handle() {
        let cache = small_cache(2);
        let (_, disk) = memory_disk(1, 8);
        let handle = cache.get_modified(&disk, BlockNumber(1)).expect("get");
        assert_eq!(handle.state(), BufferState::AccessedModified);
        cache.release(handle).expect("release");
        cache.sync_device(&disk).expect("flush");
        assert_eq!(disk.stats().write_blocks, 1);
    }

    #[test]
    fn written_data_reaches_the_disk() {
        let cache = small_cache(2);
        let (store, disk) = memory_disk(1, 8);
        let mut handle = cache.get(&disk, BlockNumber(5)).expect("get");
        handle.data_mut().fill(0xA5);
        cache.sync(handle).expect("sync");
        assert!(store.block_contents(BlockNumber(5)).expect("block").iter().all(|&b| b == 0xA5));
        assert_eq!(disk.stats().write_transfers, 1);
    }

    #[test]
    fn out_of_range_block_is_rejected() {
        let cache = small_cache(1);
        let (_, disk) = memory_disk(1, 4);
        let err = cache.read(&disk, BlockNumber(4)).expect_err("range");
        assert_eq!(
            err,
            BdcError::InvalidBlock {
                block: 4,
                block_count: 4
            }
        );
    }

    #[test]
    fn unsupported_block_size() {
        let cache = small_cache(1);
        let store = Arc::new(MemoryDisk::new(1024, 4));
        let disk = Arc::new(DiskDevice::new(DeviceId(2), 1024, 4, store).expect("device"));
        assert_eq!(
            cache.get(&disk, BlockNumber(0)).expect_err("size"),
            BdcError::UnsupportedBlockSize(1024)
        );
    }

    #[test]
    fn handle_from_other_cache_is_invalid() {
        let first = small_cache(1);
        let second = small_cache(1);
        let (_, disk) = memory_disk(1, 4);
        let handle = first.get(&disk, BlockNumber(0)).expect("get");
        let err = second.release(handle).expect_err("foreign");
        assert!(matches!(err, BdcError::InvalidBuffer(_)));
        // The rejected handle was dropped, which released it into `first`.
        let again = first
            .get_timeout(&disk, BlockNumber(0), Duration::from_secs(1))
            .expect("released on drop");
        first.release(again).expect("release");
    }

    #[test]
    fn dropped_handle_is_released() {
        let cache = small_cache(1);
        let (_, disk) = memory_disk(1, 4);
        drop(cache.read(&disk, BlockNumber(2)).expect("read"));
        let handle = cache
            .read_timeout(&disk, BlockNumber(2), Duration::from_secs(1))
            .expect("available again");
        assert_eq!(handle.state(), BufferState::AccessedCached);
        cache.release(handle).expect("release");
    }

    #[test]
    fn teardown_flushes_modified_buffers() {
        let cache = Cache::with_config(CacheConfig::single_class(512, 4)).expect("cache");
        let (store, disk) = memory_disk(1, 8);
        for block in 0..3 {
            let mut handle = cache.get(&disk, BlockNumber(block)).expect("get");
            handle.data_mut().fill(0x10 + u8::try_from(block).expect("small"));
            cache.release_modified(handle).expect("release");
        }
        cache.teardown().expect("teardown");
        assert!(store.block_contents(BlockNumber(2)).expect("block").iter().all(|&b| b == 0x12));
        assert_eq!(disk.stats().write_blocks, 3);
    }
}
