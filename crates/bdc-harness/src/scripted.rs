//! A block driver whose behaviour is scripted per transfer.
//!
//! Tests queue [`DiskAction`]s for reads or writes; each submitted request
//! consumes the first queued action for its operation and otherwise
//! completes normally. Every request is recorded so tests can check how
//! many transfers were issued and in which order.

use bdc_block::drivers::execute;
use bdc_block::{BlockStore, BlockTransfer, MemoryDisk, TransferFault, TransferOp, TransferRequest};
use bdc_types::{BlockNumber, DeviceId};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Barrier a transfer stops at until the test opens it.
#[derive(Debug, Default)]
pub struct Gate {
    state: Mutex<GateState>,
    changed: Condvar,
}

#[derive(Debug, Default)]
struct GateState {
    arrived: usize,
    open: bool,
}

impl Gate {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Let every current and future transfer through.
    pub fn open(&self) {
        self.state.lock().open = true;
        self.changed.notify_all();
    }

    /// Block until `count` transfers reached the gate or `timeout` passes.
    pub fn wait_arrived(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.arrived < count {
            if self.changed.wait_until(&mut state, deadline).timed_out() {
                return state.arrived >= count;
            }
        }
        true
    }

    fn pass(&self) {
        let mut state = self.state.lock();
        state.arrived += 1;
        self.changed.notify_all();
        while !state.open {
            self.changed.wait(&mut state);
        }
    }
}

/// What the driver does with the next matching request.
#[derive(Debug, Clone)]
pub enum DiskAction {
    /// Complete normally.
    Complete,
    /// Stop at the gate, then complete normally.
    Wait(Arc<Gate>),
    /// Sleep, then complete normally.
    Sleep(Duration),
    /// Complete with a fault without touching the medium.
    Fail(String),
    /// Stop at the gate, then fail.
    WaitThenFail(Arc<Gate>, String),
}

/// One request as the driver saw it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TransferRecord {
    pub op: TransferOpName,
    pub device: DeviceId,
    pub start: u64,
    pub count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TransferOpName {
    Read,
    Write,
}

impl From<TransferOp> for TransferOpName {
    fn from(op: TransferOp) -> Self {
        match op {
            TransferOp::Read => Self::Read,
            TransferOp::Write => Self::Write,
        }
    }
}

/// In-memory disk with scripted completions.
///
/// Every block starts out filled with the low byte of its block number.
#[derive(Debug)]
pub struct ScriptedDisk {
    store: MemoryDisk,
    script: Mutex<VecDeque<(TransferOp, DiskAction)>>,
    log: Mutex<Vec<TransferRecord>>,
    max_blocks: usize,
}

impl ScriptedDisk {
    #[must_use]
    pub fn new(block_size: u32, block_count: u64) -> Self {
        let store = MemoryDisk::new(block_size, block_count);
        for block in 0..block_count {
            store.fill_block(BlockNumber(block), block.to_le_bytes()[0]);
        }
        Self {
            store,
            script: Mutex::new(VecDeque::new()),
            log: Mutex::new(Vec::new()),
            max_blocks: usize::MAX,
        }
    }

    /// Cap the run length the driver accepts.
    #[must_use]
    pub fn with_max_blocks(mut self, max_blocks: usize) -> Self {
        self.max_blocks = max_blocks.max(1);
        self
    }

    /// Queue an action for the next request of `op`.
    pub fn script(&self, op: TransferOp, action: DiskAction) {
        self.script.lock().push_back((op, action));
    }

    #[must_use]
    pub fn store(&self) -> &MemoryDisk {
        &self.store
    }

    #[must_use]
    pub fn transfers(&self) -> Vec<TransferRecord> {
        self.log.lock().clone()
    }

    #[must_use]
    pub fn count(&self, op: TransferOp) -> usize {
        let name = TransferOpName::from(op);
        self.log.lock().iter().filter(|r| r.op == name).count()
    }

    fn next_action(&self, op: TransferOp) -> DiskAction {
        let mut script = self.script.lock();
        match script.iter().position(|(wanted, _)| *wanted == op) {
            Some(at) => script
                .remove(at)
                .map_or(DiskAction::Complete, |(_, action)| action),
            None => DiskAction::Complete,
        }
    }
}

impl BlockTransfer for ScriptedDisk {
    fn submit(&self, request: TransferRequest) {
        let record = TransferRecord {
            op: request.op().into(),
            device: request.device(),
            start: request.start().0,
            count: request.block_count(),
        };
        self.log.lock().push(record);
        let action = self.next_action(request.op());
        debug!(
            target: "bdc::harness",
            event = "scripted_transfer",
            op = %request.op(),
            start = record.start,
            count = record.count,
            action = ?action
        );
        match action {
            DiskAction::Complete => execute(&self.store, request),
            DiskAction::Wait(gate) => {
                gate.pass();
                execute(&self.store, request);
            }
            DiskAction::Sleep(pause) => {
                std::thread::sleep(pause);
                execute(&self.store, request);
            }
            DiskAction::Fail(reason) => request.complete(Err(TransferFault(reason))),
            DiskAction::WaitThenFail(gate, reason) => {
                gate.pass();
                request.complete(Err(TransferFault(reason)));
            }
        }
    }

    fn max_blocks_per_request(&self) -> usize {
        self.max_blocks
    }
}

impl BlockStore for ScriptedDisk {
    fn block_size(&self) -> u32 {
        self.store.block_size()
    }

    fn block_count(&self) -> u64 {
        self.store.block_count()
    }

    fn read_block(&self, block: BlockNumber, buf: &mut [u8]) -> Result<(), TransferFault> {
        self.store.read_block(block, buf)
    }

    fn write_block(&self, block: BlockNumber, buf: &[u8]) -> Result<(), TransferFault> {
        self.store.write_block(block, buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bdc_block::{BlockBuf, TransferBuffer};

    fn one_block(block: u64) -> Vec<TransferBuffer> {
        vec![TransferBuffer {
            block: BlockNumber(block),
            data: BlockBuf::zeroed(512),
        }]
    }

    #[test]
    fn blocks_start_with_their_number() {
        let disk = ScriptedDisk::new(512, 4);
        let (request, completion) = TransferRequest::new(TransferOp::Read, DeviceId(1), one_block(3));
        disk.submit(request);
        let outcome = completion.wait();
        assert!(outcome.status.is_ok());
        assert!(outcome.buffers[0].data.as_slice().iter().all(|&b| b == 3));
    }

    #[test]
    fn actions_apply_to_matching_operation_only() {
        let disk = ScriptedDisk::new(512, 4);
        disk.script(TransferOp::Write, DiskAction::Fail("bad sector".into()));

        let (read, read_done) = TransferRequest::new(TransferOp::Read, DeviceId(1), one_block(0));
        disk.submit(read);
        assert!(read_done.wait().status.is_ok());

        let (write, write_done) = TransferRequest::new(TransferOp::Write, DeviceId(1), one_block(0));
        disk.submit(write);
        assert_eq!(
            write_done.wait().status,
            Err(TransferFault("bad sector".into()))
        );
        assert_eq!(disk.count(TransferOp::Read), 1);
        assert_eq!(disk.count(TransferOp::Write), 1);
    }

    #[test]
    fn gate_holds_transfer_until_opened() {
        let disk = Arc::new(ScriptedDisk::new(512, 4));
        let gate = Gate::new();
        disk.script(TransferOp::Read, DiskAction::Wait(Arc::clone(&gate)));

        let (request, completion) = TransferRequest::new(TransferOp::Read, DeviceId(1), one_block(1));
        let driver = {
            let disk = Arc::clone(&disk);
            std::thread::spawn(move || disk.submit(request))
        };
        assert!(gate.wait_arrived(1, Duration::from_secs(5)));
        assert!(!completion.is_done());
        gate.open();
        driver.join().expect("driver");
        assert!(completion.wait().status.is_ok());
    }
}
