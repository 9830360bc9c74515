//! Pool diagnostics.
//!
//! A [`CacheReport`] is a consistent snapshot taken under the cache lock:
//! per-class buffer counts by state, list lengths, waiter counts, and one
//! line per associated buffer. It serializes with serde so tools can dump
//! it as JSON.

use crate::Shared;
use crate::list::ListId;
use crate::pool::BufferState;
use bdc_types::{BufferKey, DeviceId};
use serde::{Deserialize, Serialize};

/// Number of buffers in each state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateCounts {
    pub empty: usize,
    pub cached: usize,
    pub accessed_cached: usize,
    pub accessed_modified: usize,
    pub accessed_empty: usize,
    pub modified: usize,
    pub sync: usize,
    pub transfer: usize,
}

impl StateCounts {
    fn slot(&mut self, state: BufferState) -> &mut usize {
        match state {
            BufferState::Empty => &mut self.empty,
            BufferState::Cached => &mut self.cached,
            BufferState::AccessedCached => &mut self.accessed_cached,
            BufferState::AccessedModified => &mut self.accessed_modified,
            BufferState::AccessedEmpty => &mut self.accessed_empty,
            BufferState::Modified => &mut self.modified,
            BufferState::Sync => &mut self.sync,
            BufferState::Transfer => &mut self.transfer,
        }
    }

    fn add(&mut self, state: BufferState) {
        *self.slot(state) += 1;
    }

    #[must_use]
    pub fn in_state(&self, state: BufferState) -> usize {
        let mut copy = *self;
        *copy.slot(state)
    }

    #[must_use]
    pub fn total(&self) -> usize {
        self.empty
            + self.cached
            + self.accessed_cached
            + self.accessed_modified
            + self.accessed_empty
            + self.modified
            + self.sync
            + self.transfer
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassReport {
    pub buffer_size: usize,
    pub buffers: usize,
    pub free_list: usize,
    pub lru_list: usize,
    pub states: StateCounts,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferReport {
    pub index: usize,
    pub buffer_size: usize,
    pub key: BufferKey,
    pub state: BufferState,
    pub access_waiters: usize,
    pub transfer_waiters: usize,
    pub purge_pending: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheReport {
    pub classes: Vec<ClassReport>,
    pub total: StateCounts,
    pub modified_list: usize,
    pub sync_list: usize,
    pub buffer_waiters: usize,
    pub read_ahead_queue: usize,
    /// Associated buffers, ordered by key.
    pub buffers: Vec<BufferReport>,
}

pub(crate) fn build(shared: &Shared, device: Option<DeviceId>) -> CacheReport {
    let st = shared.state.lock();
    let mut classes: Vec<ClassReport> = shared
        .classes
        .iter()
        .enumerate()
        .map(|(class, layout)| ClassReport {
            buffer_size: layout.buffer_size,
            buffers: layout.buffers,
            free_list: st.lists.len(ListId::Free(class)),
            lru_list: st.lists.len(ListId::Lru(class)),
            states: StateCounts::default(),
        })
        .collect();

    let mut total = StateCounts::default();
    let mut buffers = Vec::new();
    for (index, desc) in st.descs.iter().enumerate() {
        total.add(desc.state);
        classes[desc.class].states.add(desc.state);
        let Some(key) = desc.key else {
            continue;
        };
        if device.is_some_and(|device| device != key.device) {
            continue;
        }
        buffers.push(BufferReport {
            index,
            buffer_size: shared.classes[desc.class].buffer_size,
            key,
            state: desc.state,
            access_waiters: desc.access_waiters.len(),
            transfer_waiters: desc.transfer_waiters.len(),
            purge_pending: desc.purge_pending,
        });
    }
    buffers.sort_by_key(|buffer| buffer.key);

    CacheReport {
        classes,
        total,
        modified_list: st.lists.len(ListId::Modified),
        sync_list: st.lists.len(ListId::Sync),
        buffer_waiters: st.buffer_waiters.len(),
        read_ahead_queue: st.read_ahead_queue.len(),
        buffers,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::memory_disk;
    use crate::{Cache, CacheConfig};
    use bdc_types::BlockNumber;

    #[test]
    fn report_counts_states_per_class() {
        let cache = Cache::with_config(CacheConfig {
            size: 4096,
            buffer_max: 1024,
            swap_block_hold_ms: 60_000,
            ..CacheConfig::default()
        })
        .expect("cache");
        let (_, disk) = memory_disk(1, 8);
        let held = cache.read(&disk, BlockNumber(0)).expect("read");
        let dirty = cache.get(&disk, BlockNumber(1)).expect("get");
        cache.release_modified(dirty).expect("release");

        let report = cache.report(None);
        assert_eq!(report.classes.len(), 2);
        assert_eq!(report.classes[0].buffers, 4);
        assert_eq!(report.classes[1].buffers, 2);
        assert_eq!(report.classes[0].states.accessed_cached, 1);
        assert_eq!(report.classes[0].states.modified, 1);
        assert_eq!(report.classes[0].free_list, 2);
        assert_eq!(report.modified_list, 1);
        assert_eq!(report.total.total(), 6);
        assert_eq!(report.buffers.len(), 2);
        assert_eq!(report.buffers[0].state, BufferState::AccessedCached);
        assert_eq!(report.buffers[1].key.block, BlockNumber(1));

        cache.release(held).expect("release");
    }

    #[test]
    fn report_serializes_to_json() {
        let cache = Cache::with_config(CacheConfig::single_class(512, 2)).expect("cache");
        let report = cache.report(Some(DeviceId(7)));
        let json = serde_json::to_string(&report).expect("serialize");
        let back: CacheReport = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, report);
        assert_eq!(back.total.empty, 2);
    }
}
