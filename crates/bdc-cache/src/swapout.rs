//! Swapout worker: write-back of modified buffers.
//!
//! Each pass serves one device. Buffers handed over by `sync` go first;
//! otherwise the oldest modified buffer that is due picks the device. A
//! buffer is due once its hold time expired, when a task is waiting for a
//! free buffer, or when a task is waiting to access it. The pass sorts its
//! buffers by block number and writes contiguous runs of at most
//! `max_write_blocks` blocks, one driver request per run.

use crate::list::ListId;
use crate::pool::{BufferDesc, BufferState, CacheState, TransferTicket};
use crate::priority::{PriorityBoost, boost_target};
use crate::{Shared, execute};
use bdc_block::{BlockBuf, DiskDevice, TransferBuffer, TransferOp};
use bdc_error::BdcError;
use bdc_types::{BlockNumber, Priority};
use parking_lot::MutexGuard;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, trace};

/// Buffers of one device selected for one pass, ascending by block.
struct Batch {
    disk: Arc<DiskDevice>,
    /// (descriptor, generation at selection)
    buffers: Vec<(usize, u64)>,
}

fn is_due(desc: &BufferDesc, now: Instant, force: bool) -> bool {
    force
        || !desc.access_waiters.is_empty()
        || desc.hold_until.is_none_or(|deadline| deadline <= now)
}

pub(crate) fn run(shared: &Arc<Shared>) {
    let mut st = shared.state.lock();
    let mut base = st.swapout_priority;
    shared.priority.set(base);
    info!(
        target: "bdc::swapout",
        event = "worker_start",
        priority = base.0
    );

    loop {
        if st.swapout_priority != base {
            base = st.swapout_priority;
            shared.priority.set(base);
            debug!(
                target: "bdc::swapout",
                event = "priority_changed",
                priority = base.0
            );
        }
        if st.shutdown {
            break;
        }
        let now = Instant::now();
        if let Some(batch) = select_batch(&mut st, now) {
            shared.write_batch(&mut st, &batch, base);
            continue;
        }
        let wake = next_wake(&st, now, shared);
        shared.swapout_cv.wait_until(&mut st, wake);
    }

    abandon_sync_requests(shared, &mut st);
    info!(target: "bdc::swapout", event = "worker_stop");
}

/// Earliest hold deadline, capped by the swapout period.
fn next_wake(st: &CacheState, now: Instant, shared: &Shared) -> Instant {
    let period = now + shared.config.swapout_period();
    st.lists
        .iter(ListId::Modified)
        .filter_map(|index| st.descs[index].hold_until)
        .fold(period, Instant::min)
}

/// Pick the device to serve and claim its due buffers.
fn select_batch(st: &mut CacheState, now: Instant) -> Option<Batch> {
    let force = st.has_buffer_waiters();
    let leader = st.lists.front(ListId::Sync).or_else(|| {
        st.lists
            .iter(ListId::Modified)
            .find(|&index| is_due(&st.descs[index], now, force))
    })?;
    let disk = st.descs[leader].disk.clone()?;
    let device = disk.id();
    let on_device = |desc: &BufferDesc| desc.key.is_some_and(|key| key.device == device);

    let mut picked: Vec<usize> = st
        .lists
        .iter(ListId::Sync)
        .filter(|&index| on_device(&st.descs[index]))
        .collect();
    picked.extend(
        st.lists
            .iter(ListId::Modified)
            .filter(|&index| on_device(&st.descs[index]) && is_due(&st.descs[index], now, force)),
    );

    for &index in &picked {
        st.lists.remove(index);
        let desc = &mut st.descs[index];
        if desc.state == BufferState::Modified {
            desc.state = BufferState::Sync;
            desc.hold_until = None;
            desc.ticket = Some(TransferTicket::new(TransferOp::Write));
        }
    }
    picked.sort_by_key(|&index| st.descs[index].key);

    debug!(
        target: "bdc::swapout",
        event = "pass_selected",
        device = %device,
        buffers = picked.len(),
        forced = force
    );
    Some(Batch {
        disk,
        buffers: picked
            .into_iter()
            .map(|index| (index, st.descs[index].generation))
            .collect(),
    })
}

/// On shutdown, put buffers that were handed over by `sync` back on the
/// modified list and fail their waiters.
fn abandon_sync_requests(shared: &Shared, st: &mut CacheState) {
    let now = Instant::now();
    while let Some(index) = st.lists.pop_front(ListId::Sync) {
        if let Some(ticket) = st.descs[index].ticket.take() {
            ticket.resolve(Err(BdcError::ShutDown));
        }
        st.make_modified(index, now);
        shared.desc_cv[index].notify_all();
    }
    shared.transfer_cv.notify_all();
}

impl Shared {
    fn write_batch(&self, st: &mut MutexGuard<'_, CacheState>, batch: &Batch, base: Priority) {
        let max_run = self
            .config
            .max_write_blocks
            .min(batch.disk.driver().max_blocks_per_request())
            .max(1);

        // Every run of the pass runs at least as urgently as the most urgent
        // task waiting on any buffer of the pass.
        let descs = &st.descs;
        let target = boost_target(
            base,
            batch
                .buffers
                .iter()
                .filter(|&&(index, generation)| descs[index].generation == generation)
                .flat_map(|&(index, _)| descs[index].waiter_priorities()),
        );
        let _boost = PriorityBoost::raise(&self.priority, target);

        let mut cursor = 0;
        while cursor < batch.buffers.len() {
            // Purge may discard buffers while an earlier run is in flight,
            // so each run is rebuilt from what is still ours.
            let mut run: Vec<usize> = Vec::new();
            let mut last = None;
            while cursor < batch.buffers.len() && run.len() < max_run {
                let (index, generation) = batch.buffers[cursor];
                let desc = &st.descs[index];
                if desc.generation != generation || desc.state != BufferState::Sync {
                    cursor += 1;
                    if run.is_empty() {
                        continue;
                    }
                    break;
                }
                let Some(key) = desc.key else {
                    cursor += 1;
                    continue;
                };
                if last.is_some_and(|prev: BlockNumber| !prev.is_followed_by(key.block)) {
                    break;
                }
                last = Some(key.block);
                run.push(index);
                cursor += 1;
            }
            if !run.is_empty() {
                self.write_run(st, &batch.disk, &run, target);
            }
        }
    }

    fn write_run(
        &self,
        st: &mut MutexGuard<'_, CacheState>,
        disk: &Arc<DiskDevice>,
        run: &[usize],
        base: Priority,
    ) {
        let mut buffers = Vec::with_capacity(run.len());
        let mut waiters = Vec::new();
        for &index in run {
            let desc = &mut st.descs[index];
            desc.state = BufferState::Transfer;
            waiters.extend(desc.waiter_priorities());
            let class_size = self.classes[desc.class].buffer_size;
            let data = desc
                .data
                .take()
                .unwrap_or_else(|| BlockBuf::zeroed(class_size));
            let block = desc.key.map_or(BlockNumber(0), |key| key.block);
            buffers.push(TransferBuffer { block, data });
        }
        let start = buffers[0].block;
        let count = buffers.len();
        let target = boost_target(base, waiters);
        debug!(
            target: "bdc::swapout",
            event = "write_run",
            device = %disk.id(),
            start = start.0,
            count,
            priority = target.0
        );

        let outcome = MutexGuard::unlocked(st, || {
            let _boost = PriorityBoost::raise(&self.priority, target);
            execute(disk, TransferOp::Write, buffers)
        });

        let lost = outcome.buffers.len() < run.len();
        let status = match outcome.status {
            Ok(()) if lost => Err(BdcError::write_failed(start.0, "driver lost buffers")),
            Ok(()) => Ok(()),
            Err(fault) => Err(BdcError::write_failed(start.0, fault.0)),
        };
        let blocks = u64::try_from(count).unwrap_or(u64::MAX);
        disk.update_stats(|stats| {
            stats.write_transfers += 1;
            stats.write_blocks += blocks;
            if status.is_err() {
                stats.write_errors += 1;
            }
        });
        if let Err(err) = &status {
            error!(
                target: "bdc::swapout",
                event = "write_failed",
                device = %disk.id(),
                start = start.0,
                count,
                error = %err
            );
        }

        let mut returned = outcome.buffers.into_iter();
        for &index in run {
            let class_size = self.classes[st.descs[index].class].buffer_size;
            let data = returned
                .next()
                .map_or_else(|| BlockBuf::zeroed(class_size), |buffer| buffer.data);
            let desc = &mut st.descs[index];
            desc.data = Some(data);
            if let Some(ticket) = desc.ticket.take() {
                ticket.resolve(status.clone());
            }
            if status.is_ok() && !desc.purge_pending {
                st.make_cached(index);
            } else {
                st.discard(index);
            }
            trace!(
                target: "bdc::swapout",
                event = "write_done",
                buffer = index,
                state = ?st.descs[index].state
            );
            self.desc_cv[index].notify_all();
        }
        self.transfer_cv.notify_all();
        self.buffer_cv.notify_all();
    }

    /// Write back every dirty buffer of every device and wait for it.
    pub(crate) fn sync_all(&self) -> bdc_error::Result<()> {
        let devices = {
            let st = self.state.lock();
            let mut devices: Vec<_> = st
                .descs
                .iter()
                .filter(|desc| {
                    matches!(
                        desc.state,
                        BufferState::Modified | BufferState::Sync | BufferState::Transfer
                    )
                })
                .filter_map(|desc| desc.key.map(|key| key.device))
                .collect();
            devices.sort_unstable();
            devices.dedup();
            devices
        };
        let mut first_error = None;
        for device in devices {
            if let Err(err) = self.sync_device(device, None) {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::Batch;
    use crate::list::ListId;
    use crate::tests::memory_disk;
    use crate::{BufferState, Cache, CacheConfig, HostPriority, PriorityControl};
    use bdc_types::{BlockNumber, BufferKey, DeviceId, Priority};
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    /// Records every priority change made on any thread.
    #[derive(Default)]
    struct Recorder {
        changes: Mutex<Vec<Priority>>,
    }

    impl PriorityControl for Recorder {
        fn current(&self) -> Priority {
            HostPriority::get_current()
        }

        fn set(&self, priority: Priority) -> Priority {
            self.changes.lock().push(priority);
            HostPriority::set_current(priority)
        }
    }

    #[test]
    fn hold_timer_delays_write_back() {
        let cache = Cache::with_config(CacheConfig {
            swap_block_hold_ms: 150,
            swapout_period_ms: 20,
            ..CacheConfig::single_class(512, 4)
        })
        .expect("cache");
        let (_, disk) = memory_disk(1, 8);
        let handle = cache.get(&disk, BlockNumber(0)).expect("get");
        let released = Instant::now();
        cache.release_modified(handle).expect("release");

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(disk.stats().write_blocks, 0, "written before hold expired");

        let deadline = Instant::now() + Duration::from_secs(5);
        while disk.stats().write_blocks == 0 {
            assert!(Instant::now() < deadline, "hold never expired");
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(released.elapsed() >= Duration::from_millis(150));
    }

    #[test]
    fn adjacent_blocks_share_one_transfer() {
        let cache = Cache::with_config(CacheConfig {
            swap_block_hold_ms: 60_000,
            ..CacheConfig::single_class(512, 8)
        })
        .expect("cache");
        let (_, disk) = memory_disk(1, 16);
        for block in [5_u64, 3, 4, 9] {
            let handle = cache.get(&disk, BlockNumber(block)).expect("get");
            cache.release_modified(handle).expect("release");
        }
        cache.sync_device(&disk).expect("sync");
        let stats = disk.stats();
        assert_eq!(stats.write_blocks, 4);
        // 3..=5 coalesce; 9 stands alone.
        assert_eq!(stats.write_transfers, 2);
    }

    #[test]
    fn runs_are_capped_by_max_write_blocks() {
        let cache = Cache::with_config(CacheConfig {
            swap_block_hold_ms: 60_000,
            max_write_blocks: 2,
            ..CacheConfig::single_class(512, 8)
        })
        .expect("cache");
        let (_, disk) = memory_disk(1, 16);
        for block in 0..5 {
            let handle = cache.get(&disk, BlockNumber(block)).expect("get");
            cache.release_modified(handle).expect("release");
        }
        cache.sync_device(&disk).expect("sync");
        assert_eq!(disk.stats().write_transfers, 3);
    }

    #[test]
    fn worker_boosts_to_waiting_sync_caller() {
        let recorder = Arc::new(Recorder::default());
        let cache = Cache::init(
            CacheConfig {
                swapout_priority: Priority(40),
                ..CacheConfig::single_class(512, 2)
            },
            Arc::clone(&recorder) as Arc<dyn PriorityControl>,
        )
        .expect("cache");
        let (_, disk) = memory_disk(1, 4);

        HostPriority::set_current(Priority(3));
        let handle = cache.get(&disk, BlockNumber(1)).expect("get");
        cache.sync(handle).expect("sync");

        let changes = recorder.changes.lock().clone();
        // Worker start, boost to the sync caller, restore.
        assert_eq!(changes, vec![Priority(40), Priority(3), Priority(40)]);
    }

    #[test]
    fn whole_pass_runs_at_most_urgent_waiter_of_any_run() {
        let recorder = Arc::new(Recorder::default());
        let cache = Cache::init(
            CacheConfig {
                swapout_priority: Priority(50),
                swap_block_hold_ms: 60_000,
                ..CacheConfig::single_class(512, 4)
            },
            Arc::clone(&recorder) as Arc<dyn PriorityControl>,
        )
        .expect("cache");
        let (store, disk) = memory_disk(1, 16);
        for block in [0_u64, 5, 9] {
            let mut handle = cache.get(&disk, BlockNumber(block)).expect("get");
            handle.data_mut().fill(0x40 + u8::try_from(block).expect("small"));
            cache.release_modified(handle).expect("release");
        }
        let deadline = Instant::now() + Duration::from_secs(5);
        while !recorder.changes.lock().contains(&Priority(50)) {
            assert!(Instant::now() < deadline, "worker never started");
            std::thread::sleep(Duration::from_millis(5));
        }

        // Three single-block runs; the first has a waiter at 40, the second
        // one at 3, the third none.
        HostPriority::set_current(Priority(50));
        let mut st = cache.shared.state.lock();
        let mut buffers = Vec::new();
        for (block, waiter) in [(0_u64, Some(40)), (5, Some(3)), (9, None)] {
            let key = BufferKey::new(DeviceId(1), BlockNumber(block));
            let index = st.lookup(&key).expect("cached");
            assert_eq!(st.descs[index].state, BufferState::Modified);
            let _ticket = st.make_sync(index);
            st.lists.remove(index);
            assert_eq!(st.lists.owner(index), None::<ListId>);
            if let Some(priority) = waiter {
                let me = st.new_waiter(Priority(priority));
                st.descs[index].transfer_waiters.push(me);
            }
            buffers.push((index, st.descs[index].generation));
        }
        let batch = Batch {
            disk: Arc::clone(&disk),
            buffers,
        };
        cache.shared.write_batch(&mut st, &batch, Priority(50));
        for &(index, _) in &batch.buffers {
            assert_eq!(st.descs[index].state, BufferState::Cached);
        }
        drop(st);

        let changes = recorder.changes.lock().clone();
        assert_eq!(changes, vec![Priority(50), Priority(3), Priority(50)]);
        assert_eq!(disk.stats().write_transfers, 3);
        assert_eq!(store.block_contents(BlockNumber(9)).expect("block")[0], 0x49);
        assert_eq!(cache.report(None).total.in_state(BufferState::Modified), 0);
    }

    #[test]
    fn priority_change_is_applied_by_worker() {
        let recorder = Arc::new(Recorder::default());
        let cache = Cache::init(
            CacheConfig::single_class(512, 2),
            Arc::clone(&recorder) as Arc<dyn PriorityControl>,
        )
        .expect("cache");
        cache.set_swapout_priority(Priority(9));
        let deadline = Instant::now() + Duration::from_secs(5);
        while !recorder.changes.lock().contains(&Priority(9)) {
            assert!(Instant::now() < deadline, "priority never applied");
            std::thread::sleep(Duration::from_millis(5));
        }
    }
}
