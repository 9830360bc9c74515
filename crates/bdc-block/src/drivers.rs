//! Reference drivers.
//!
//! - [`MemoryDisk`]: blocks held in memory, completes inline.
//! - [`FileDisk`]: blocks in a file using `pread`/`pwrite` style I/O,
//!   completes inline.
//! - [`ThreadedDisk`]: wraps either store and completes every request on a
//!   dedicated driver thread, the way an interrupt-driven controller would.
//!
//! A buffer may be longer than the device block; only the first
//! `block_size` bytes of each buffer take part in the transfer.

use crate::transfer::{BlockTransfer, TransferFault, TransferOp, TransferRequest};
use bdc_types::BlockNumber;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use std::sync::mpsc::{self, Sender};
use std::thread::JoinHandle;

/// Synchronous block storage behind a driver.
pub trait BlockStore: Send + Sync {
    fn block_size(&self) -> u32;

    fn block_count(&self) -> u64;

    fn read_block(&self, block: BlockNumber, buf: &mut [u8]) -> Result<(), TransferFault>;

    fn write_block(&self, block: BlockNumber, buf: &[u8]) -> Result<(), TransferFault>;
}

fn block_len(store: &dyn BlockStore) -> Result<usize, TransferFault> {
    usize::try_from(store.block_size())
        .map_err(|_| TransferFault("block_size does not fit usize".to_owned()))
}

fn check_range(store: &dyn BlockStore, block: BlockNumber) -> Result<(), TransferFault> {
    if block.0 >= store.block_count() {
        return Err(TransferFault(format!(
            "block out of range: block={} block_count={}",
            block.0,
            store.block_count()
        )));
    }
    Ok(())
}

/// Run a request against a store and complete it.
pub fn execute(store: &dyn BlockStore, mut request: TransferRequest) {
    let status = execute_in_place(store, &mut request);
    request.complete(status);
}

fn execute_in_place(
    store: &dyn BlockStore,
    request: &mut TransferRequest,
) -> Result<(), TransferFault> {
    let len = block_len(store)?;
    let op = request.op();
    for buffer in request.buffers_mut() {
        check_range(store, buffer.block)?;
        if buffer.data.len() < len {
            return Err(TransferFault(format!(
                "buffer too small: got={} block_size={len}",
                buffer.data.len()
            )));
        }
        match op {
            TransferOp::Read => {
                store.read_block(buffer.block, &mut buffer.data.as_mut_slice()[..len])?;
            }
            TransferOp::Write => store.write_block(buffer.block, &buffer.data.as_slice()[..len])?,
        }
    }
    Ok(())
}

/// In-memory disk.
#[derive(Debug)]
pub struct MemoryDisk {
    block_size: u32,
    block_count: u64,
    bytes: Mutex<Vec<u8>>,
}

impl MemoryDisk {
    #[must_use]
    pub fn new(block_size: u32, block_count: u64) -> Self {
        let len = usize::try_from(u64::from(block_size) * block_count).unwrap_or(0);
        Self {
            block_size,
            block_count,
            bytes: Mutex::new(vec![0_u8; len]),
        }
    }

    fn range(&self, block: BlockNumber) -> Result<std::ops::Range<usize>, TransferFault> {
        let len = block_len(self)?;
        let start = usize::try_from(block.0)
            .ok()
            .and_then(|b| b.checked_mul(len))
            .ok_or_else(|| TransferFault("block offset overflow".to_owned()))?;
        Ok(start..start + len)
    }

    /// Copy of one block as currently stored on the medium.
    #[must_use]
    pub fn block_contents(&self, block: BlockNumber) -> Option<Vec<u8>> {
        let range = self.range(block).ok()?;
        self.bytes.lock().get(range).map(<[u8]>::to_vec)
    }

    /// Overwrite one block on the medium, bypassing any cache.
    pub fn fill_block(&self, block: BlockNumber, byte: u8) {
        if let Ok(range) = self.range(block) {
            if let Some(slice) = self.bytes.lock().get_mut(range) {
                slice.fill(byte);
            }
        }
    }
}

impl BlockStore for MemoryDisk {
    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn read_block(&self, block: BlockNumber, buf: &mut [u8]) -> Result<(), TransferFault> {
        let range = self.range(block)?;
        let bytes = self.bytes.lock();
        let src = bytes
            .get(range)
            .ok_or_else(|| TransferFault("read oob".to_owned()))?;
        buf.copy_from_slice(src);
        drop(bytes);
        Ok(())
    }

    fn write_block(&self, block: BlockNumber, buf: &[u8]) -> Result<(), TransferFault> {
        let range = self.range(block)?;
        let mut bytes = self.bytes.lock();
        let dst = bytes
            .get_mut(range)
            .ok_or_else(|| TransferFault("write oob".to_owned()))?;
        dst.copy_from_slice(buf);
        drop(bytes);
        Ok(())
    }
}

impl BlockTransfer for MemoryDisk {
    fn submit(&self, request: TransferRequest) {
        execute(self, request);
    }
}

/// File-backed disk using positional I/O.
///
/// `FileExt` is thread-safe and does not share a seek position.
#[derive(Debug, Clone)]
pub struct FileDisk {
    file: Arc<File>,
    block_size: u32,
    block_count: u64,
    writable: bool,
}

impl FileDisk {
    pub fn open(path: impl AsRef<Path>, block_size: u32) -> std::io::Result<Self> {
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map(|file| (file, true))
            .or_else(|_| {
                OpenOptions::new()
                    .read(true)
                    .open(path.as_ref())
                    .map(|file| (file, false))
            })?;
        if block_size == 0 {
            return Err(std::io::Error::other("block_size must be > 0"));
        }
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            block_size,
            block_count: len / u64::from(block_size),
            writable,
        })
    }

    fn offset(&self, block: BlockNumber) -> Result<u64, TransferFault> {
        block
            .0
            .checked_mul(u64::from(self.block_size))
            .ok_or_else(|| TransferFault("block offset overflow".to_owned()))
    }
}

impl BlockStore for FileDisk {
    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn read_block(&self, block: BlockNumber, buf: &mut [u8]) -> Result<(), TransferFault> {
        self.file.read_exact_at(buf, self.offset(block)?)?;
        Ok(())
    }

    fn write_block(&self, block: BlockNumber, buf: &[u8]) -> Result<(), TransferFault> {
        if !self.writable {
            return Err(TransferFault("device opened read-only".to_owned()));
        }
        self.file.write_all_at(buf, self.offset(block)?)?;
        Ok(())
    }
}

impl BlockTransfer for FileDisk {
    fn submit(&self, request: TransferRequest) {
        execute(self, request);
        // Write-back durability is the driver's concern, not the cache's.
        if let Err(err) = self.file.sync_data() {
            tracing::warn!(target: "bdc::driver", event = "file_sync_failed", error = %err);
        }
    }
}

/// Completes requests asynchronously on a driver thread.
pub struct ThreadedDisk {
    queue: Mutex<Option<Sender<TransferRequest>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    max_blocks: usize,
}

impl std::fmt::Debug for ThreadedDisk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadedDisk")
            .field("max_blocks", &self.max_blocks)
            .finish_non_exhaustive()
    }
}

impl ThreadedDisk {
    pub fn spawn(store: Arc<dyn BlockStore>, max_blocks: usize) -> std::io::Result<Self> {
        let (tx, rx) = mpsc::channel::<TransferRequest>();
        let worker = std::thread::Builder::new()
            .name("bdc-disk".to_owned())
            .spawn(move || {
                while let Ok(request) = rx.recv() {
                    execute(store.as_ref(), request);
                }
            })?;
        Ok(Self {
            queue: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            max_blocks: max_blocks.max(1),
        })
    }
}

impl BlockTransfer for ThreadedDisk {
    fn submit(&self, request: TransferRequest) {
        let queue = self.queue.lock();
        match queue.as_ref() {
            // A failed send drops the request, which completes it with a fault.
            Some(tx) => drop(tx.send(request)),
            None => request.complete(Err(TransferFault("driver stopped".to_owned()))),
        }
    }

    fn max_blocks_per_request(&self) -> usize {
        self.max_blocks
    }
}

impl Drop for ThreadedDisk {
    fn drop(&mut self) {
        drop(self.queue.lock().take());
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }
}
