//! Access coordinator: acquisition, release, and per-buffer waiting.
//!
//! A task looking for a block looks up the association index again every time
//! it wakes, so a descriptor that was discarded or reused while it slept is
//! never handed out under the wrong identity. Waiters on one descriptor
//! queue in arrival order and only the head of the queue may take the
//! buffer once it becomes available.

use crate::config::find_class;
use crate::handle::{BufferHandle, Returned};
use crate::pool::{BufferState, CacheState, TransferTicket, Waiter};
use crate::{Shared, execute, wait_on};
use bdc_block::{BlockBuf, DiskDevice, TransferBuffer, TransferOp};
use bdc_error::{BdcError, Result};
use bdc_types::{BlockNumber, BufferKey};
use parking_lot::MutexGuard;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AccessMode {
    /// Hand out the slot without reading the medium on a miss.
    Get,
    /// Guarantee on-media contents.
    Read,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReleaseMode {
    Clean,
    Modified,
    Sync,
}

/// Bookkeeping of one blocked acquisition, undone on every exit path.
struct Pending {
    me: Waiter,
    queued_on: Option<usize>,
    buffer_wait: bool,
    /// Read transfer this task is waiting behind; its failure is ours.
    watched: Option<Arc<TransferTicket>>,
}

impl Pending {
    fn leave(&mut self, shared: &Shared, st: &mut CacheState) {
        if let Some(index) = self.queued_on.take() {
            let desc = &mut st.descs[index];
            let was_head = desc.access_waiters.front().map(|w| w.id) == Some(self.me.id);
            desc.forget_waiter(self.me.id);
            if was_head {
                shared.desc_cv[index].notify_all();
            }
        }
        if self.buffer_wait {
            st.forget_buffer_waiter(self.me.id);
            self.buffer_wait = false;
        }
    }
}

impl Shared {
    pub(crate) fn acquire(
        self: &Arc<Self>,
        disk: &Arc<DiskDevice>,
        block: BlockNumber,
        mode: AccessMode,
        deadline: Option<Instant>,
    ) -> Result<BufferHandle> {
        disk.check_block(block)?;
        let class = find_class(&self.classes, disk.block_size())?;
        if self.classes[class].buffers == 0 {
            return Err(BdcError::NoMemory);
        }
        let key = BufferKey::new(disk.id(), block);
        let priority = self.priority.current();

        let mut st = self.state.lock();
        let mut pending = Pending {
            me: st.new_waiter(priority),
            queued_on: None,
            buffer_wait: false,
            watched: None,
        };

        loop {
            if let Some(ticket) = pending.watched.take() {
                match ticket.outcome() {
                    Some(Err(err)) => {
                        let err = err.clone();
                        pending.leave(self, &mut st);
                        return Err(err);
                    }
                    Some(Ok(())) => {}
                    None => pending.watched = Some(ticket),
                }
            }

            let Some(index) = st.lookup(&key) else {
                if let Some(old) = pending.queued_on {
                    if st.descs[old].access_waiters.front().map(|w| w.id) == Some(pending.me.id) {
                        self.desc_cv[old].notify_all();
                    }
                    st.descs[old].forget_waiter(pending.me.id);
                    pending.queued_on = None;
                }
                if let Some(index) = st.take_reusable(class) {
                    pending.leave(self, &mut st);
                    return self.fill_miss(st, index, key, disk, mode);
                }
                if !pending.buffer_wait {
                    st.buffer_waiters.push((class, pending.me));
                    pending.buffer_wait = true;
                    debug!(
                        target: "bdc::access",
                        event = "buffer_wait",
                        key = %key,
                        class
                    );
                    self.swapout_cv.notify_all();
                }
                if wait_on(&self.buffer_cv, &mut st, deadline) {
                    pending.leave(self, &mut st);
                    return Err(BdcError::NoMemory);
                }
                continue;
            };

            if pending.buffer_wait {
                st.forget_buffer_waiter(pending.me.id);
                pending.buffer_wait = false;
            }
            if let Some(old) = pending.queued_on.filter(|&old| old != index) {
                st.descs[old].forget_waiter(pending.me.id);
                self.desc_cv[old].notify_all();
                pending.queued_on = None;
            }

            let me = pending.me.id;
            let desc = &mut st.descs[index];
            let in_queue = desc.access_waiters.iter().any(|w| w.id == me);
            let my_turn = desc.access_waiters.front().is_none_or(|w| w.id == me);
            if desc.state.is_available() && my_turn {
                if in_queue {
                    desc.access_waiters.pop_front();
                }
                pending.queued_on = None;
                pending.leave(self, &mut st);
                return self.take_hit(&mut st, index, key, disk, mode);
            }

            if !in_queue {
                desc.access_waiters.push_back(pending.me);
            }
            pending.queued_on = Some(index);
            if desc.state == BufferState::Transfer && pending.watched.is_none() {
                pending.watched = desc
                    .ticket
                    .as_ref()
                    .filter(|ticket| ticket.op == TransferOp::Read)
                    .cloned();
            }
            trace!(
                target: "bdc::access",
                event = "access_wait",
                key = %key,
                state = ?desc.state,
                queue = desc.access_waiters.len()
            );
            if desc.state == BufferState::Modified {
                self.swapout_cv.notify_all();
            }
            if wait_on(&self.desc_cv[index], &mut st, deadline) {
                pending.leave(self, &mut st);
                return Err(BdcError::Timeout);
            }
        }
    }

    /// Hand an available (`Cached` or `Modified`) buffer to the caller.
    fn take_hit(
        self: &Arc<Self>,
        st: &mut CacheState,
        index: usize,
        key: BufferKey,
        disk: &Arc<DiskDevice>,
        mode: AccessMode,
    ) -> Result<BufferHandle> {
        st.lists.remove(index);
        let desc = &mut st.descs[index];
        let data = desc
            .data
            .take()
            .ok_or_else(|| BdcError::InvalidBuffer(format!("buffer {index} has no memory")))?;
        desc.state = match desc.state {
            BufferState::Modified => BufferState::AccessedModified,
            _ => BufferState::AccessedCached,
        };
        desc.hold_until = None;
        let handle = self.handle(st, index, key, disk, data);
        if mode == AccessMode::Read {
            disk.update_stats(|stats| stats.read_hits += 1);
            self.check_read_ahead(st, disk, handle.block());
        }
        trace!(
            target: "bdc::access",
            event = "hit",
            key = %handle.key(),
            state = ?handle.state()
        );
        Ok(handle)
    }

    /// Bind a reusable descriptor to `key` and, for reads, fill it from the
    /// medium. Other tasks asking for the same block meanwhile queue behind
    /// the `Transfer` state instead of issuing a second read.
    fn fill_miss(
        self: &Arc<Self>,
        mut st: MutexGuard<'_, CacheState>,
        index: usize,
        key: BufferKey,
        disk: &Arc<DiskDevice>,
        mode: AccessMode,
    ) -> Result<BufferHandle> {
        if mode == AccessMode::Get {
            st.associate(index, key, disk, BufferState::AccessedEmpty);
            let data = st.descs[index]
                .data
                .take()
                .ok_or_else(|| BdcError::InvalidBuffer(format!("buffer {index} has no memory")))?;
            return Ok(self.handle(&st, index, key, disk, data));
        }

        st.associate(index, key, disk, BufferState::Transfer);
        let ticket = TransferTicket::new(TransferOp::Read);
        let desc = &mut st.descs[index];
        desc.ticket = Some(Arc::clone(&ticket));
        let Some(data) = desc.data.take() else {
            st.discard(index);
            return Err(BdcError::InvalidBuffer(format!("buffer {index} has no memory")));
        };
        disk.update_stats(|stats| stats.read_misses += 1);
        self.arm_read_ahead(disk, key.block);
        debug!(
            target: "bdc::access",
            event = "read_miss",
            key = %key,
            buffer = index
        );

        let outcome = MutexGuard::unlocked(&mut st, || {
            execute(
                disk,
                TransferOp::Read,
                vec![TransferBuffer {
                    block: key.block,
                    data,
                }],
            )
        });

        let returned = outcome.buffers.into_iter().next();
        let status = match (&returned, outcome.status) {
            (None, _) => Err(BdcError::read_failed(key.block.0, "driver lost the buffer")),
            (Some(_), status) => {
                status.map_err(|fault| BdcError::read_failed(key.block.0, fault.0))
            }
        };
        let class = st.descs[index].class;
        st.descs[index].data = Some(returned.map_or_else(
            || BlockBuf::zeroed(self.classes[class].buffer_size),
            |buffer| buffer.data,
        ));
        st.descs[index].ticket = None;
        ticket.resolve(status.clone());

        match status {
            Ok(()) => {
                disk.update_stats(|stats| stats.read_blocks += 1);
                let desc = &mut st.descs[index];
                desc.state = BufferState::AccessedCached;
                let data = desc
                    .data
                    .take()
                    .ok_or_else(|| BdcError::InvalidBuffer(format!("buffer {index} has no memory")))?;
                self.desc_cv[index].notify_all();
                let handle = self.handle(&st, index, key, disk, data);
                self.check_read_ahead(&mut st, disk, key.block);
                Ok(handle)
            }
            Err(err) => {
                disk.update_stats(|stats| stats.read_errors += 1);
                error!(
                    target: "bdc::access",
                    event = "read_failed",
                    key = %key,
                    error = %err
                );
                st.discard(index);
                self.desc_cv[index].notify_all();
                self.buffer_cv.notify_all();
                Err(err)
            }
        }
    }

    fn handle(
        self: &Arc<Self>,
        st: &CacheState,
        index: usize,
        key: BufferKey,
        disk: &DiskDevice,
        data: BlockBuf,
    ) -> BufferHandle {
        let desc = &st.descs[index];
        BufferHandle {
            shared: Arc::clone(self),
            index,
            generation: desc.generation,
            key,
            block_size: usize::try_from(disk.block_size()).unwrap_or(usize::MAX),
            state: desc.state,
            data: Some(data),
            written: false,
        }
    }

    /// Flag a held buffer as modified.
    pub(crate) fn mark_modified(&self, handle: &mut BufferHandle) -> Result<()> {
        let mut st = self.state.lock();
        let desc = st
            .descs
            .get_mut(handle.index)
            .filter(|desc| desc.generation == handle.generation && desc.state.is_accessed())
            .ok_or_else(|| BdcError::InvalidBuffer(format!("{} is not held", handle.key)))?;
        desc.state = BufferState::AccessedModified;
        handle.state = BufferState::AccessedModified;
        Ok(())
    }

    /// Return a held buffer to the cache.
    pub(crate) fn release(
        &self,
        returned: Returned,
        mode: ReleaseMode,
        deadline: Option<Instant>,
    ) -> Result<()> {
        let index = returned.index;
        let mut st = self.state.lock();
        let Some(desc) = st.descs.get_mut(index) else {
            return Err(BdcError::InvalidBuffer(format!(
                "{} names no buffer",
                returned.key
            )));
        };
        if desc.generation != returned.generation
            || !desc.state.is_accessed()
            || desc.data.is_some()
            || desc.key != Some(returned.key)
        {
            return Err(BdcError::InvalidBuffer(format!(
                "{} is not held (state {:?})",
                returned.key, desc.state
            )));
        }
        desc.data = Some(returned.data);
        let held = desc.state;

        if desc.purge_pending {
            st.discard(index);
            self.desc_cv[index].notify_all();
            self.buffer_cv.notify_all();
            trace!(
                target: "bdc::access",
                event = "release_purged",
                key = %returned.key
            );
            return Ok(());
        }

        let dirty = mode != ReleaseMode::Clean || held == BufferState::AccessedModified;
        match mode {
            ReleaseMode::Sync if !st.shutdown => {
                return self.release_sync(st, index, returned.key, deadline);
            }
            ReleaseMode::Sync => {
                st.make_modified(index, Instant::now());
                self.desc_cv[index].notify_all();
                return Err(BdcError::ShutDown);
            }
            _ if dirty && st.shutdown => {
                st.make_modified(index, Instant::now());
                self.desc_cv[index].notify_all();
                warn!(
                    target: "bdc::access",
                    event = "release_after_shutdown",
                    key = %returned.key,
                    "modified buffer released after teardown; it will not be written"
                );
                return Err(BdcError::ShutDown);
            }
            _ if dirty => {
                let hold = Instant::now() + self.config.swap_block_hold();
                st.make_modified(index, hold);
                self.swapout_cv.notify_all();
            }
            _ if held == BufferState::AccessedEmpty && !returned.written => {
                st.discard(index);
                self.buffer_cv.notify_all();
            }
            _ => {
                st.make_cached(index);
                self.buffer_cv.notify_all();
            }
        }
        trace!(
            target: "bdc::access",
            event = "release",
            key = %returned.key,
            from = ?held,
            to = ?st.descs[index].state
        );
        self.desc_cv[index].notify_all();
        Ok(())
    }

    /// Queue a released buffer for immediate write-back and wait for the
    /// write to finish.
    fn release_sync(
        &self,
        mut st: MutexGuard<'_, CacheState>,
        index: usize,
        key: BufferKey,
        deadline: Option<Instant>,
    ) -> Result<()> {
        let ticket = st.make_sync(index);
        let me = {
            let priority = self.priority.current();
            st.new_waiter(priority)
        };
        st.descs[index].transfer_waiters.push(me);
        debug!(
            target: "bdc::access",
            event = "sync_request",
            key = %key,
            buffer = index
        );
        self.swapout_cv.notify_all();
        self.desc_cv[index].notify_all();

        let result = loop {
            if let Some(outcome) = ticket.outcome() {
                break outcome.clone();
            }
            if wait_on(&self.transfer_cv, &mut st, deadline) && ticket.outcome().is_none() {
                break Err(BdcError::Timeout);
            }
        };
        st.descs[index].forget_waiter(me.id);
        result
    }
}

#[cfg(test)]
mod tests {
    use crate::tests::{memory_disk, small_cache};
    use crate::{BufferState, Cache, CacheConfig};
    use bdc_error::BdcError;
    use bdc_types::BlockNumber;
    use std::sync::{Arc, Barrier};
    use std::time::Duration;

    #[test]
    fn modified_release_after_shutdown_is_refused() {
        let cache = small_cache(2);
        let (store, disk) = memory_disk(1, 4);
        let mut dirty = cache.get(&disk, BlockNumber(1)).expect("get");
        dirty.data_mut().fill(0x7E);
        let clean = cache.read(&disk, BlockNumber(2)).expect("read");
        cache.shared.state.lock().shutdown = true;

        assert!(matches!(cache.release_modified(dirty), Err(BdcError::ShutDown)));
        cache.release(clean).expect("clean release still succeeds");

        let report = cache.report(None);
        assert_eq!(report.total.in_state(BufferState::Modified), 1);
        assert_eq!(report.total.in_state(BufferState::Cached), 1);
        assert!(store.block_contents(BlockNumber(1)).expect("block").iter().all(|&b| b != 0x7E));
    }

    #[test]
    fn second_getter_waits_for_release() {
        let cache = Arc::new(small_cache(2));
        let (_, disk) = memory_disk(1, 4);
        let mut held = cache.get(&disk, BlockNumber(0)).expect("get");
        held.data_mut().fill(7);

        let waiter = {
            let cache = Arc::clone(&cache);
            let disk = Arc::clone(&disk);
            std::thread::spawn(move || {
                let handle = cache.get(&disk, BlockNumber(0)).expect("get");
                let seen = handle.data()[0];
                cache.release(handle).expect("release");
                seen
            })
        };
        std::thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_finished(), "second holder admitted concurrently");
        cache.release_modified(held).expect("release");

        assert_eq!(waiter.join().expect("waiter"), 7);
    }

    #[test]
    fn get_timeout_expires_while_held() {
        let cache = small_cache(2);
        let (_, disk) = memory_disk(1, 4);
        let held = cache.get(&disk, BlockNumber(1)).expect("get");
        let err = cache
            .get_timeout(&disk, BlockNumber(1), Duration::from_millis(20))
            .expect_err("held elsewhere");
        assert_eq!(err, BdcError::Timeout);
        cache.release(held).expect("release");
    }

    #[test]
    fn exhausted_pool_reports_no_memory_on_deadline() {
        let cache = small_cache(1);
        let (_, disk) = memory_disk(1, 4);
        let held = cache.get(&disk, BlockNumber(0)).expect("get");
        let err = cache
            .get_timeout(&disk, BlockNumber(1), Duration::from_millis(20))
            .expect_err("pool exhausted");
        assert_eq!(err, BdcError::NoMemory);
        cache.release(held).expect("release");
    }

    #[test]
    fn exhausted_pool_waits_for_a_release() {
        let cache = Arc::new(small_cache(1));
        let (_, disk) = memory_disk(1, 4);
        let held = cache.read(&disk, BlockNumber(0)).expect("read");
        let other = {
            let cache = Arc::clone(&cache);
            let disk = Arc::clone(&disk);
            std::thread::spawn(move || {
                let handle = cache.read(&disk, BlockNumber(1)).expect("read");
                cache.release(handle).expect("release");
            })
        };
        std::thread::sleep(Duration::from_millis(20));
        cache.release(held).expect("release");
        other.join().expect("other");
        assert_eq!(disk.stats().read_misses, 2);
    }

    #[test]
    fn exhausted_pool_of_modified_buffers_forces_write_back() {
        let cache = Cache::with_config(CacheConfig {
            swap_block_hold_ms: 60_000,
            swapout_period_ms: 10_000,
            ..CacheConfig::single_class(512, 1)
        })
        .expect("cache");
        let (_, disk) = memory_disk(1, 4);
        let held = cache.get(&disk, BlockNumber(0)).expect("get");
        cache.release_modified(held).expect("release");

        let other = cache
            .get_timeout(&disk, BlockNumber(1), Duration::from_secs(5))
            .expect("pressure flushes the modified buffer");
        cache.release(other).expect("release");
        assert_eq!(disk.stats().write_blocks, 1);
    }

    #[test]
    fn waiters_are_served_in_arrival_order() {
        let cache = Arc::new(small_cache(2));
        let (_, disk) = memory_disk(1, 4);
        let held = cache.read(&disk, BlockNumber(2)).expect("read");
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let mut threads = Vec::new();
        for id in 0..3_u8 {
            let cache = Arc::clone(&cache);
            let disk = Arc::clone(&disk);
            let order = Arc::clone(&order);
            threads.push(std::thread::spawn(move || {
                let handle = cache.get(&disk, BlockNumber(2)).expect("get");
                order.lock().push(id);
                std::thread::sleep(Duration::from_millis(5));
                cache.release(handle).expect("release");
            }));
            // Stagger arrivals so the queue order is known.
            std::thread::sleep(Duration::from_millis(30));
        }
        cache.release(held).expect("release");
        for thread in threads {
            thread.join().expect("waiter");
        }
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn concurrent_misses_issue_one_read() {
        let cache = Arc::new(small_cache(4));
        let (store, disk) = memory_disk(1, 4);
        store.fill_block(BlockNumber(1), 0x5C);
        let barrier = Arc::new(Barrier::new(4));

        let threads: Vec<_> = (0..4)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let disk = Arc::clone(&disk);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    let handle = cache.read(&disk, BlockNumber(1)).expect("read");
                    let first = handle.data()[0];
                    cache.release(handle).expect("release");
                    first
                })
            })
            .collect();
        for thread in threads {
            assert_eq!(thread.join().expect("reader"), 0x5C);
        }
        let stats = disk.stats();
        assert_eq!(stats.read_misses, 1);
        assert_eq!(stats.read_blocks, 1);
        assert_eq!(stats.read_hits, 3);
    }

    #[test]
    fn unwritten_accessed_empty_is_not_cached() {
        let cache = small_cache(2);
        let (store, disk) = memory_disk(1, 4);
        store.fill_block(BlockNumber(3), 0x77);
        let handle = cache.get(&disk, BlockNumber(3)).expect("get");
        cache.release(handle).expect("release");
        // The slot never held block 3, so a read must go to the medium.
        let handle = cache.read(&disk, BlockNumber(3)).expect("read");
        assert_eq!(handle.data()[0], 0x77);
        cache.release(handle).expect("release");
        assert_eq!(disk.stats().read_misses, 1);
    }

    #[test]
    fn clean_release_keeps_modified_buffer_dirty() {
        let cache = small_cache(2);
        let (store, disk) = memory_disk(1, 4);
        let mut handle = cache.get_modified(&disk, BlockNumber(0)).expect("get");
        handle.data_mut().fill(0x42);
        cache.release(handle).expect("release");
        cache.sync_device(&disk).expect("sync");
        assert_eq!(store.block_contents(BlockNumber(0)).expect("block")[0], 0x42);
    }
}
