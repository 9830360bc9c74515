//! Buffer descriptors, the association index, and list bookkeeping.
//!
//! Everything in [`CacheState`] is guarded by the cache-wide lock. The lock
//! is never held across a driver call or a wait; blocking happens on the
//! condition variables in [`Shared`](crate::Shared), which release it.

use crate::config::SizeClass;
use crate::list::{ListId, Lists};
use bdc_block::{BlockBuf, DiskDevice, TransferOp};
use bdc_error::BdcError;
use bdc_types::{BufferKey, DeviceId, Priority};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, OnceLock};
use std::time::Instant;
use tracing::trace;

/// Lifecycle state of one buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BufferState {
    /// Not associated with any block; on its class free list.
    Empty,
    /// Valid clean data, not held; on its class LRU list.
    Cached,
    /// Held by one task; content was clean when acquired.
    AccessedCached,
    /// Held by one task; content was dirty when acquired (or marked so).
    AccessedModified,
    /// Held by one task; content was never read from the medium.
    AccessedEmpty,
    /// Dirty, not held; waiting for write-back.
    Modified,
    /// Dirty and handed to the swapout worker; write not started.
    Sync,
    /// A read or write is in flight.
    Transfer,
}

impl BufferState {
    #[must_use]
    pub fn is_accessed(self) -> bool {
        matches!(
            self,
            Self::AccessedCached | Self::AccessedModified | Self::AccessedEmpty
        )
    }

    /// True when a task may take the buffer without waiting for anyone.
    #[must_use]
    pub fn is_available(self) -> bool {
        matches!(self, Self::Cached | Self::Modified)
    }
}

/// A task blocked on a descriptor, with the priority it had when it blocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Waiter {
    pub id: u64,
    pub priority: Priority,
}

/// Shared result slot of one in-flight (or pending) transfer.
///
/// Every task that attaches to a transfer holds a clone and observes the
/// same outcome once it is set.
#[derive(Debug)]
pub(crate) struct TransferTicket {
    pub op: TransferOp,
    outcome: OnceLock<Result<(), BdcError>>,
}

impl TransferTicket {
    pub(crate) fn new(op: TransferOp) -> Arc<Self> {
        Arc::new(Self {
            op,
            outcome: OnceLock::new(),
        })
    }

    pub(crate) fn resolve(&self, outcome: Result<(), BdcError>) {
        let _ = self.outcome.set(outcome);
    }

    pub(crate) fn outcome(&self) -> Option<&Result<(), BdcError>> {
        self.outcome.get()
    }
}

/// Metadata of one buffer slot.
#[derive(Debug)]
pub(crate) struct BufferDesc {
    pub class: usize,
    pub state: BufferState,
    /// Associated block. `None` exactly when the state is `Empty`.
    pub key: Option<BufferKey>,
    pub disk: Option<Arc<DiskDevice>>,
    /// Bumped on every association so stale references can be detected.
    pub generation: u64,
    /// Slot memory; `None` while checked out to a holder or a driver.
    pub data: Option<BlockBuf>,
    /// Tasks waiting to acquire, served in arrival order.
    pub access_waiters: VecDeque<Waiter>,
    /// Tasks waiting on the outcome of the pending transfer.
    pub transfer_waiters: Vec<Waiter>,
    pub ticket: Option<Arc<TransferTicket>>,
    /// Write-back deadline of a `Modified` buffer.
    pub hold_until: Option<Instant>,
    /// Set by purge; the buffer is discarded as soon as its holder or its
    /// transfer lets go.
    pub purge_pending: bool,
}

impl BufferDesc {
    fn new(class: usize, buffer_size: usize) -> Self {
        Self {
            class,
            state: BufferState::Empty,
            key: None,
            disk: None,
            generation: 0,
            data: Some(BlockBuf::zeroed(buffer_size)),
            access_waiters: VecDeque::new(),
            transfer_waiters: Vec::new(),
            ticket: None,
            hold_until: None,
            purge_pending: false,
        }
    }

    pub(crate) fn waiter_priorities(&self) -> impl Iterator<Item = Priority> + '_ {
        self.access_waiters
            .iter()
            .chain(self.transfer_waiters.iter())
            .map(|waiter| waiter.priority)
    }

    pub(crate) fn forget_waiter(&mut self, id: u64) {
        self.access_waiters.retain(|waiter| waiter.id != id);
        self.transfer_waiters.retain(|waiter| waiter.id != id);
    }
}

/// Everything guarded by the cache-wide lock.
#[derive(Debug)]
pub(crate) struct CacheState {
    pub descs: Vec<BufferDesc>,
    pub lists: Lists,
    pub index: HashMap<BufferKey, usize>,
    /// Tasks waiting for any buffer of a class to become reusable.
    pub buffer_waiters: Vec<(usize, Waiter)>,
    /// Devices whose read-ahead trigger fired.
    pub read_ahead_queue: VecDeque<Arc<DiskDevice>>,
    /// Requested base priority of the swapout worker.
    pub swapout_priority: Priority,
    pub shutdown: bool,
    next_waiter: u64,
}

impl CacheState {
    pub(crate) fn new(classes: &[SizeClass], swapout_priority: Priority) -> Self {
        let total: usize = classes.iter().map(|class| class.buffers).sum();
        let mut descs = Vec::with_capacity(total);
        let mut lists = Lists::new(total, classes.len());
        for (class_index, class) in classes.iter().enumerate() {
            for _ in 0..class.buffers {
                lists.push_back(ListId::Free(class_index), descs.len());
                descs.push(BufferDesc::new(class_index, class.buffer_size));
            }
        }
        Self {
            descs,
            lists,
            index: HashMap::new(),
            buffer_waiters: Vec::new(),
            read_ahead_queue: VecDeque::new(),
            swapout_priority,
            shutdown: false,
            next_waiter: 1,
        }
    }

    pub(crate) fn new_waiter(&mut self, priority: Priority) -> Waiter {
        let id = self.next_waiter;
        self.next_waiter += 1;
        Waiter { id, priority }
    }

    pub(crate) fn lookup(&self, key: &BufferKey) -> Option<usize> {
        self.index.get(key).copied()
    }

    /// Take a reusable descriptor of `class`: a free one first, otherwise
    /// the least recently used cached one nobody is waiting for.
    pub(crate) fn take_reusable(&mut self, class: usize) -> Option<usize> {
        if let Some(index) = self.lists.pop_front(ListId::Free(class)) {
            return Some(index);
        }
        let victim = self
            .lists
            .iter(ListId::Lru(class))
            .find(|&index| self.descs[index].access_waiters.is_empty())?;
        self.lists.remove(victim);
        if let Some(key) = self.descs[victim].key.take() {
            self.index.remove(&key);
            trace!(
                target: "bdc::pool",
                event = "evict",
                buffer = victim,
                key = %key
            );
        }
        let desc = &mut self.descs[victim];
        desc.state = BufferState::Empty;
        desc.disk = None;
        Some(victim)
    }

    /// Bind an unlinked, unassociated descriptor to `key`.
    pub(crate) fn associate(
        &mut self,
        index: usize,
        key: BufferKey,
        disk: &Arc<DiskDevice>,
        state: BufferState,
    ) {
        let desc = &mut self.descs[index];
        desc.key = Some(key);
        desc.disk = Some(Arc::clone(disk));
        desc.state = state;
        desc.generation = desc.generation.wrapping_add(1);
        desc.purge_pending = false;
        desc.hold_until = None;
        desc.ticket = None;
        self.index.insert(key, index);
        trace!(
            target: "bdc::pool",
            event = "associate",
            buffer = index,
            key = %key,
            state = ?state
        );
    }

    /// Return a descriptor to `Empty` and onto its free list.
    ///
    /// Any queued access waiters are dropped from the queue; they look up
    /// the index after waking and miss. The slot memory must already be
    /// back in the descriptor.
    pub(crate) fn discard(&mut self, index: usize) {
        self.lists.remove(index);
        let desc = &mut self.descs[index];
        if let Some(key) = desc.key.take() {
            if self.index.get(&key) == Some(&index) {
                self.index.remove(&key);
            }
            trace!(
                target: "bdc::pool",
                event = "discard",
                buffer = index,
                key = %key,
                state = ?desc.state
            );
        }
        desc.state = BufferState::Empty;
        desc.disk = None;
        desc.access_waiters.clear();
        desc.ticket = None;
        desc.hold_until = None;
        desc.purge_pending = false;
        let class = desc.class;
        self.lists.push_back(ListId::Free(class), index);
    }

    /// Park a released clean buffer at the LRU tail.
    pub(crate) fn make_cached(&mut self, index: usize) {
        let desc = &mut self.descs[index];
        desc.state = BufferState::Cached;
        desc.ticket = None;
        desc.hold_until = None;
        let class = desc.class;
        self.lists.push_back(ListId::Lru(class), index);
    }

    /// Queue a dirty buffer for write-back with a fresh hold deadline.
    pub(crate) fn make_modified(&mut self, index: usize, hold_until: Instant) {
        let desc = &mut self.descs[index];
        desc.state = BufferState::Modified;
        desc.ticket = None;
        desc.hold_until = Some(hold_until);
        self.lists.push_back(ListId::Modified, index);
    }

    /// Hand a dirty buffer to the swapout worker ahead of the hold timer.
    ///
    /// Returns the ticket every sync caller of this buffer waits on.
    pub(crate) fn make_sync(&mut self, index: usize) -> Arc<TransferTicket> {
        let desc = &mut self.descs[index];
        desc.state = BufferState::Sync;
        desc.hold_until = None;
        let pending = desc
            .ticket
            .as_ref()
            .filter(|ticket| ticket.op == TransferOp::Write && ticket.outcome().is_none())
            .cloned();
        let ticket = pending.unwrap_or_else(|| {
            let ticket = TransferTicket::new(TransferOp::Write);
            desc.ticket = Some(Arc::clone(&ticket));
            ticket
        });
        self.lists.push_back(ListId::Sync, index);
        ticket
    }

    pub(crate) fn has_buffer_waiters(&self) -> bool {
        !self.buffer_waiters.is_empty()
    }

    pub(crate) fn forget_buffer_waiter(&mut self, id: u64) {
        self.buffer_waiters.retain(|(_, waiter)| waiter.id != id);
    }

    /// Descriptors currently associated with blocks of `device`.
    pub(crate) fn device_buffers(&self, device: DeviceId) -> Vec<usize> {
        let mut buffers: Vec<usize> = self
            .index
            .iter()
            .filter(|(key, _)| key.device == device)
            .map(|(_, &index)| index)
            .collect();
        buffers.sort_by_key(|&index| self.descs[index].key);
        buffers
    }
}
