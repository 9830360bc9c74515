//! Sequential read detection and the read-ahead worker.
//!
//! A read miss of block `b` arms the device trigger at `b + 1`. Reading the
//! trigger block queues the device; the worker then fetches the next run of
//! uncached blocks in one transfer and moves the trigger to the middle of
//! that run, so a steady sequential reader keeps one run ahead.

use crate::config::find_class;
use crate::pool::{BufferState, CacheState, TransferTicket};
use crate::{Shared, execute};
use bdc_block::{BlockBuf, DiskDevice, TransferBuffer, TransferOp};
use bdc_error::BdcError;
use bdc_types::{BlockNumber, BufferKey};
use parking_lot::MutexGuard;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub(crate) fn run(shared: &Arc<Shared>) {
    shared.priority.set(shared.config.read_ahead_priority);
    info!(
        target: "bdc::read_ahead",
        event = "worker_start",
        priority = shared.config.read_ahead_priority.0,
        max_blocks = shared.config.max_read_ahead_blocks
    );
    let mut st = shared.state.lock();
    loop {
        if st.shutdown {
            break;
        }
        match st.read_ahead_queue.pop_front() {
            Some(disk) => shared.read_ahead(&mut st, &disk),
            None => shared.read_ahead_cv.wait(&mut st),
        }
    }
    info!(target: "bdc::read_ahead", event = "worker_stop");
}

impl Shared {
    /// Arm the trigger after a read miss of `block`.
    pub(crate) fn arm_read_ahead(&self, disk: &DiskDevice, block: BlockNumber) {
        if self.config.max_read_ahead_blocks == 0 {
            return;
        }
        disk.with_read_ahead(|ra| {
            if ra.trigger != Some(block) {
                ra.trigger = block.checked_add(1);
                ra.next = block.checked_add(2).unwrap_or(block);
            }
        });
    }

    /// Queue the device when `block` is its trigger block.
    pub(crate) fn check_read_ahead(
        &self,
        st: &mut CacheState,
        disk: &Arc<DiskDevice>,
        block: BlockNumber,
    ) {
        if self.config.max_read_ahead_blocks == 0 {
            return;
        }
        let fire = disk.with_read_ahead(|ra| {
            if ra.trigger == Some(block) && !ra.queued {
                ra.queued = true;
                true
            } else {
                false
            }
        });
        if fire {
            st.read_ahead_queue.push_back(Arc::clone(disk));
            self.read_ahead_cv.notify_all();
        }
    }

    /// Fetch the next run of `disk`. Never waits for buffers: the run stops
    /// at the first block already cached or when no buffer is reusable.
    fn read_ahead(&self, st: &mut MutexGuard<'_, CacheState>, disk: &Arc<DiskDevice>) {
        let Ok(class) = find_class(&self.classes, disk.block_size()) else {
            return;
        };
        let max = self
            .config
            .max_read_ahead_blocks
            .min(disk.driver().max_blocks_per_request())
            .max(1);
        let max_blocks = u64::try_from(max).unwrap_or(u64::MAX);
        let block_count = disk.block_count();
        let plan = disk.with_read_ahead(|ra| {
            ra.queued = false;
            let start = ra.next;
            if start.0 >= block_count {
                ra.trigger = None;
                return None;
            }
            let remaining = block_count - start.0;
            if remaining >= max_blocks {
                ra.trigger = start.checked_add(max_blocks / 2);
                ra.next = start.checked_add(max_blocks).unwrap_or(start);
                Some((start, max_blocks))
            } else {
                ra.trigger = None;
                Some((start, remaining))
            }
        });
        let Some((start, count)) = plan else {
            return;
        };

        let ticket = TransferTicket::new(TransferOp::Read);
        let mut run = Vec::new();
        let mut buffers = Vec::new();
        for offset in 0..count {
            let block = BlockNumber(start.0 + offset);
            let key = BufferKey::new(disk.id(), block);
            if st.lookup(&key).is_some() {
                break;
            }
            let Some(index) = st.take_reusable(class) else {
                break;
            };
            st.associate(index, key, disk, BufferState::Transfer);
            let desc = &mut st.descs[index];
            desc.ticket = Some(Arc::clone(&ticket));
            let data = desc
                .data
                .take()
                .unwrap_or_else(|| BlockBuf::zeroed(self.classes[class].buffer_size));
            buffers.push(TransferBuffer { block, data });
            run.push(index);
        }
        if run.is_empty() {
            return;
        }
        let fetched = run.len();
        disk.update_stats(|stats| stats.read_ahead_transfers += 1);
        debug!(
            target: "bdc::read_ahead",
            event = "read_ahead",
            device = %disk.id(),
            start = start.0,
            count = fetched
        );

        let outcome = MutexGuard::unlocked(st, || execute(disk, TransferOp::Read, buffers));

        let lost = outcome.buffers.len() < run.len();
        let status = match outcome.status {
            Ok(()) if lost => Err(BdcError::read_failed(start.0, "driver lost buffers")),
            Ok(()) => Ok(()),
            Err(fault) => Err(BdcError::read_failed(start.0, fault.0)),
        };
        match &status {
            Ok(()) => disk.update_stats(|stats| {
                stats.read_blocks += u64::try_from(fetched).unwrap_or(u64::MAX);
            }),
            Err(err) => {
                disk.update_stats(|stats| stats.read_errors += 1);
                warn!(
                    target: "bdc::read_ahead",
                    event = "read_ahead_failed",
                    device = %disk.id(),
                    start = start.0,
                    error = %err
                );
            }
        }
        ticket.resolve(status.clone());

        let mut returned = outcome.buffers.into_iter();
        for &index in &run {
            let data = returned
                .next()
                .map_or_else(|| BlockBuf::zeroed(self.classes[class].buffer_size), |b| b.data);
            let desc = &mut st.descs[index];
            desc.data = Some(data);
            desc.ticket = None;
            if status.is_ok() && !desc.purge_pending {
                st.make_cached(index);
            } else {
                st.discard(index);
            }
            self.desc_cv[index].notify_all();
        }
        self.buffer_cv.notify_all();
        self.transfer_cv.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use crate::tests::memory_disk;
    use crate::{BufferState, Cache, CacheConfig};
    use bdc_types::BlockNumber;
    use std::time::{Duration, Instant};

    fn read_ahead_cache(blocks: usize) -> Cache {
        Cache::with_config(CacheConfig {
            max_read_ahead_blocks: blocks,
            ..CacheConfig::single_class(512, 16)
        })
        .expect("cache")
    }

    fn wait_for(mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done() {
            assert!(Instant::now() < deadline, "condition never reached");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn sequential_reads_trigger_prefetch() {
        let cache = read_ahead_cache(4);
        let (store, disk) = memory_disk(1, 32);
        for block in 0..8 {
            store.fill_block(BlockNumber(block), u8::try_from(block).expect("small"));
        }

        // Miss on 0 arms the trigger at 1; reading 1 fires it.
        for block in 0..2 {
            let handle = cache.read(&disk, BlockNumber(block)).expect("read");
            cache.release(handle).expect("release");
        }
        wait_for(|| disk.stats().read_ahead_transfers == 1);
        wait_for(|| cache.report(None).total.in_state(BufferState::Transfer) == 0);

        let report = cache.report(None);
        assert_eq!(report.total.in_state(BufferState::Cached), 6);

        let misses = disk.stats().read_misses;
        let handle = cache.read(&disk, BlockNumber(4)).expect("read");
        assert_eq!(handle.data()[0], 4);
        cache.release(handle).expect("release");
        assert_eq!(disk.stats().read_misses, misses, "prefetched block missed");
    }

    #[test]
    fn read_ahead_disabled_by_default() {
        let cache = Cache::with_config(CacheConfig::single_class(512, 8)).expect("cache");
        let (_, disk) = memory_disk(1, 16);
        for block in 0..4 {
            let handle = cache.read(&disk, BlockNumber(block)).expect("read");
            cache.release(handle).expect("release");
        }
        assert_eq!(disk.stats().read_ahead_transfers, 0);
        assert_eq!(disk.stats().read_misses, 4);
    }

    #[test]
    fn prefetch_stops_at_device_end() {
        let cache = read_ahead_cache(8);
        let (_, disk) = memory_disk(1, 5);
        for block in 0..2 {
            let handle = cache.read(&disk, BlockNumber(block)).expect("read");
            cache.release(handle).expect("release");
        }
        wait_for(|| disk.stats().read_ahead_transfers == 1);
        wait_for(|| cache.report(None).total.in_state(BufferState::Cached) == 5);
        assert_eq!(disk.with_read_ahead(|ra| ra.trigger), None);
    }
}
