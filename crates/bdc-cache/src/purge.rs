//! Device-wide purge and sync.

use crate::pool::BufferState;
use crate::{Shared, wait_on};
use bdc_block::{DiskDevice, TransferOp};
use bdc_error::{BdcError, Result};
use bdc_types::DeviceId;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

impl Shared {
    /// Disassociate every buffer of `disk`.
    ///
    /// Idle buffers go at once, dirty ones without being written. Held
    /// buffers and buffers under transfer are flagged; their holder's
    /// release or the transfer completion discards them, and purge waits
    /// for that. Tasks that get a buffer of the device while purge is
    /// running are waited for the same way.
    pub(crate) fn purge(&self, disk: &DiskDevice) {
        let device = disk.id();
        let mut st = self.state.lock();
        let mut discarded = 0_usize;
        let mut waits = 0_usize;

        st.read_ahead_queue
            .retain(|queued| queued.id() != device);
        disk.with_read_ahead(|ra| {
            ra.trigger = None;
            ra.queued = false;
        });

        loop {
            let mut busy = None;
            for index in st.device_buffers(device) {
                match st.descs[index].state {
                    BufferState::Cached | BufferState::Modified => {
                        st.discard(index);
                        self.desc_cv[index].notify_all();
                        discarded += 1;
                    }
                    BufferState::Sync => {
                        if let Some(ticket) = st.descs[index].ticket.take() {
                            let block = st.descs[index].key.map_or(0, |key| key.block.0);
                            ticket.resolve(Err(BdcError::write_failed(
                                block,
                                "buffer purged before write-back",
                            )));
                        }
                        st.discard(index);
                        self.desc_cv[index].notify_all();
                        discarded += 1;
                    }
                    BufferState::Transfer
                    | BufferState::AccessedCached
                    | BufferState::AccessedModified
                    | BufferState::AccessedEmpty => {
                        st.descs[index].purge_pending = true;
                        busy = Some(index);
                    }
                    BufferState::Empty => {}
                }
            }
            if discarded > 0 {
                self.buffer_cv.notify_all();
                self.transfer_cv.notify_all();
            }
            let Some(index) = busy else {
                break;
            };
            waits += 1;
            debug!(
                target: "bdc::purge",
                event = "purge_wait",
                device = %device,
                buffer = index,
                state = ?st.descs[index].state
            );
            wait_on(&self.desc_cv[index], &mut st, None);
        }

        info!(
            target: "bdc::purge",
            event = "purge_done",
            device = %device,
            discarded,
            waits
        );
    }

    /// Force every dirty buffer of `device` through write-back and wait for
    /// all of the writes. Buffers already being written are waited for
    /// without a second write. Buffers held at the time of the call are not
    /// included.
    pub(crate) fn sync_device(&self, device: DeviceId, deadline: Option<Instant>) -> Result<()> {
        let mut st = self.state.lock();
        if st.shutdown {
            return Err(BdcError::ShutDown);
        }
        let me = {
            let priority = self.priority.current();
            st.new_waiter(priority)
        };

        let mut tickets = Vec::new();
        for index in st.device_buffers(device) {
            match st.descs[index].state {
                BufferState::Modified => tickets.push((index, st.make_sync(index))),
                BufferState::Sync | BufferState::Transfer => {
                    if let Some(ticket) = st.descs[index]
                        .ticket
                        .as_ref()
                        .filter(|ticket| ticket.op == TransferOp::Write)
                    {
                        tickets.push((index, Arc::clone(ticket)));
                    }
                }
                _ => {}
            }
        }
        for &(index, _) in &tickets {
            st.descs[index].transfer_waiters.push(me);
        }
        info!(
            target: "bdc::purge",
            event = "sync_device",
            device = %device,
            buffers = tickets.len()
        );
        if tickets.is_empty() {
            return Ok(());
        }
        self.swapout_cv.notify_all();

        let result = loop {
            if tickets.iter().all(|(_, ticket)| ticket.outcome().is_some()) {
                break tickets
                    .iter()
                    .filter_map(|(_, ticket)| ticket.outcome().and_then(|o| o.clone().err()))
                    .next()
                    .map_or(Ok(()), Err);
            }
            if wait_on(&self.transfer_cv, &mut st, deadline)
                && tickets.iter().any(|(_, ticket)| ticket.outcome().is_none())
            {
                break Err(BdcError::Timeout);
            }
        };
        for &(index, _) in &tickets {
            st.descs[index].forget_waiter(me.id);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use crate::tests::{memory_disk, small_cache};
    use crate::{BufferState, Cache, CacheConfig};
    use bdc_types::{BlockNumber, DeviceId};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn purge_discards_modified_data() {
        let cache = Cache::with_config(CacheConfig {
            swap_block_hold_ms: 60_000,
            ..CacheConfig::single_class(512, 4)
        })
        .expect("cache");
        let (store, disk) = memory_disk(1, 4);
        let mut handle = cache.get(&disk, BlockNumber(0)).expect("get");
        handle.data_mut().fill(0xEE);
        cache.release_modified(handle).expect("release");

        cache.purge(&disk);
        cache.sync_device(&disk).expect("nothing to sync");
        assert_eq!(disk.stats().write_blocks, 0);
        assert_eq!(store.block_contents(BlockNumber(0)).expect("block")[0], 0);
        assert_eq!(cache.report(Some(DeviceId(1))).buffers.len(), 0);
    }

    #[test]
    fn purge_waits_for_holder() {
        let cache = Arc::new(small_cache(2));
        let (_, disk) = memory_disk(1, 4);
        let held = cache.read(&disk, BlockNumber(1)).expect("read");

        let purger = {
            let cache = Arc::clone(&cache);
            let disk = Arc::clone(&disk);
            std::thread::spawn(move || cache.purge(&disk))
        };
        std::thread::sleep(Duration::from_millis(50));
        assert!(!purger.is_finished(), "purge returned while buffer held");
        cache.release(held).expect("release");
        purger.join().expect("purge");

        let report = cache.report(None);
        assert_eq!(report.total.in_state(BufferState::Cached), 0);
        assert_eq!(report.total.in_state(BufferState::Empty), 2);
    }

    #[test]
    fn purge_leaves_other_devices_alone() {
        let cache = small_cache(4);
        let (_, first) = memory_disk(1, 4);
        let (_, second) = memory_disk(2, 4);
        for disk in [&first, &second] {
            let handle = cache.read(disk, BlockNumber(0)).expect("read");
            cache.release(handle).expect("release");
        }
        cache.purge(&first);
        assert!(cache.report(Some(DeviceId(1))).buffers.is_empty());
        assert_eq!(cache.report(Some(DeviceId(2))).buffers.len(), 1);
    }

    #[test]
    fn sync_device_writes_everything_dirty() {
        let cache = Cache::with_config(CacheConfig {
            swap_block_hold_ms: 60_000,
            ..CacheConfig::single_class(512, 4)
        })
        .expect("cache");
        let (store, disk) = memory_disk(1, 8);
        for block in [6_u64, 2] {
            let mut handle = cache.get(&disk, BlockNumber(block)).expect("get");
            handle.data_mut().fill(0x60 + u8::try_from(block).expect("small"));
            cache.release_modified(handle).expect("release");
        }
        cache.sync_device(&disk).expect("sync");
        assert_eq!(store.block_contents(BlockNumber(6)).expect("block")[0], 0x66);
        assert_eq!(store.block_contents(BlockNumber(2)).expect("block")[0], 0x62);
        let report = cache.report(None);
        assert_eq!(report.total.in_state(BufferState::Modified), 0);
        assert_eq!(report.total.in_state(BufferState::Cached), 2);
    }

    #[test]
    fn sync_device_without_dirty_buffers_returns_at_once() {
        let cache = small_cache(2);
        let (_, disk) = memory_disk(1, 4);
        cache
            .sync_device_timeout(&disk, Duration::from_millis(1))
            .expect("nothing to wait for");
    }
}
