//! Concurrency scenarios for purge against held buffers.
//!
//! Each scenario runs on a one-block, one-buffer cache with three threads:
//! a main task that acquires and later releases the block, an optional
//! low-priority waiter that asks for the same block while it is held, and a
//! high-priority task that purges the device. Every thread reports back over
//! a channel; a thread that does not report within the deadline is treated
//! as deadlocked and fails the scenario.

use crate::scripted::{DiskAction, Gate, ScriptedDisk};
use anyhow::{Context, Result, anyhow, bail};
use bdc_block::{BlockStore, BlockTransfer, DiskDevice, TransferOp};
use bdc_cache::{BufferHandle, Cache, CacheConfig, HostPriority};
use bdc_types::{BlockNumber, DeviceId, Priority};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

const BLOCK_SIZE: u32 = 512;
const BUFFER_SIZE: usize = 512;
const MARKER: u8 = 0xA5;
const MAIN_PRIORITY: Priority = Priority(10);
const WAITER_PRIORITY: Priority = Priority(30);
const PURGER_PRIORITY: Priority = Priority(2);
const DEADLOCK_AFTER: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Acquire {
    Get,
    GetModified,
    Read,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Release {
    Release,
    ReleaseModified,
    Sync,
}

/// When the purging task starts relative to the main task's hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PurgeTiming {
    WhileHeld,
    AfterRelease,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scenario {
    pub acquire: Acquire,
    pub release: Release,
    pub with_waiter: bool,
    pub purge: PurgeTiming,
}

impl Scenario {
    #[must_use]
    pub fn name(&self) -> String {
        let acquire = match self.acquire {
            Acquire::Get => "get",
            Acquire::GetModified => "get_modified",
            Acquire::Read => "read",
        };
        let release = match self.release {
            Release::Release => "release",
            Release::ReleaseModified => "release_modified",
            Release::Sync => "sync",
        };
        let waiter = if self.with_waiter { "waiter" } else { "alone" };
        let purge = match self.purge {
            PurgeTiming::WhileHeld => "purge_held",
            PurgeTiming::AfterRelease => "purge_after",
        };
        format!("{acquire}/{release}/{waiter}/{purge}")
    }
}

/// The full acquire × release × waiter matrix, purging while held.
#[must_use]
pub fn all_scenarios() -> Vec<Scenario> {
    let mut scenarios = Vec::with_capacity(18);
    for acquire in [Acquire::Get, Acquire::GetModified, Acquire::Read] {
        for release in [Release::Release, Release::ReleaseModified, Release::Sync] {
            for with_waiter in [false, true] {
                scenarios.push(Scenario {
                    acquire,
                    release,
                    with_waiter,
                    purge: PurgeTiming::WhileHeld,
                });
            }
        }
    }
    scenarios
}

/// What happened in one scenario run.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub name: String,
    pub scenario: Scenario,
    /// The purge was still running when the main task released.
    pub purge_waited_for_release: bool,
    pub release_result: String,
    pub waiter_result: Option<String>,
    pub read_transfers: usize,
    pub write_transfers: usize,
    /// Buffers still associated with the device after every task finished.
    pub buffers_left: usize,
    pub elapsed_ms: u128,
}

/// Outcome of running the swapout worker at a given priority.
#[derive(Debug, Clone, Serialize)]
pub struct PriorityReport {
    pub swapout_priority: u32,
    pub sync_result: String,
    pub data_on_disk: bool,
    /// The purge of the same device was still running while the write
    /// was held in the driver.
    pub purge_waited_for_write: bool,
    pub buffers_left: usize,
    pub write_transfers: usize,
    pub elapsed_ms: u128,
}

struct Fixture {
    cache: Arc<Cache>,
    store: Arc<ScriptedDisk>,
    disk: Arc<DiskDevice>,
}

impl Fixture {
    fn new() -> Result<Self> {
        let cache = Cache::with_config(CacheConfig {
            swap_block_hold_ms: 60_000,
            swapout_period_ms: 20,
            ..CacheConfig::single_class(BUFFER_SIZE, 1)
        })
        .context("cache init")?;
        let store = Arc::new(ScriptedDisk::new(BLOCK_SIZE, 4));
        let disk = device(DeviceId(1), &store)?;
        Ok(Self {
            cache: Arc::new(cache),
            store,
            disk,
        })
    }
}

/// Wrap a scripted disk in a device record.
pub fn device(id: DeviceId, store: &Arc<ScriptedDisk>) -> Result<Arc<DiskDevice>> {
    let driver: Arc<dyn BlockTransfer> = Arc::clone(store) as Arc<dyn BlockTransfer>;
    let disk = DiskDevice::new(id, store.block_size(), store.block_count(), driver)
        .with_context(|| format!("device {id}"))?;
    Ok(Arc::new(disk))
}

/// Poll `done` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if done() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
}

fn acquire(cache: &Cache, disk: &Arc<DiskDevice>, how: Acquire) -> Result<BufferHandle> {
    let block = BlockNumber(0);
    let mut handle = match how {
        Acquire::Get => cache.get(disk, block)?,
        Acquire::GetModified => cache.get_modified(disk, block)?,
        Acquire::Read => cache.read(disk, block)?,
    };
    if how != Acquire::Read {
        handle.data_mut().fill(MARKER);
    }
    Ok(handle)
}

fn release(cache: &Cache, handle: BufferHandle, how: Release) -> bdc_error::Result<()> {
    match how {
        Release::Release => cache.release(handle),
        Release::ReleaseModified => cache.release_modified(handle),
        Release::Sync => cache.sync(handle),
    }
}

fn describe<T>(result: &bdc_error::Result<T>) -> String {
    match result {
        Ok(_) => "ok".to_owned(),
        Err(err) => format!("error: {err}"),
    }
}

fn spawn_named<T: Send + 'static>(
    name: &str,
    body: impl FnOnce() -> T + Send + 'static,
) -> Result<mpsc::Receiver<T>> {
    let (tx, rx) = mpsc::channel();
    std::thread::Builder::new()
        .name(name.to_owned())
        .spawn(move || {
            let _ = tx.send(body());
        })
        .with_context(|| format!("spawn {name}"))?;
    Ok(rx)
}

fn collect<T>(rx: &mpsc::Receiver<T>, who: &str, scenario: &str) -> Result<T> {
    rx.recv_timeout(DEADLOCK_AFTER)
        .map_err(|_| anyhow!("{scenario}: {who} did not finish (deadlock)"))
}

fn start_purger(fixture: &Fixture, done: &Arc<AtomicBool>) -> Result<mpsc::Receiver<()>> {
    let cache = Arc::clone(&fixture.cache);
    let disk = Arc::clone(&fixture.disk);
    let done = Arc::clone(done);
    spawn_named("bdc-purger", move || {
        HostPriority::set_current(PURGER_PRIORITY);
        cache.purge(&disk);
        done.store(true, Ordering::SeqCst);
    })
}

/// Run one scenario to completion.
pub fn run_scenario(scenario: Scenario) -> Result<ScenarioReport> {
    let name = scenario.name();
    let started = Instant::now();
    let fixture = Fixture::new()?;
    let cache = &fixture.cache;
    HostPriority::set_current(MAIN_PRIORITY);
    debug!(target: "bdc::harness", event = "scenario_start", scenario = %name);

    let handle = acquire(cache, &fixture.disk, scenario.acquire)
        .with_context(|| format!("{name}: acquire"))?;

    let waiter = if scenario.with_waiter {
        let waiter_cache = Arc::clone(cache);
        let disk = Arc::clone(&fixture.disk);
        let rx = spawn_named("bdc-waiter", move || {
            HostPriority::set_current(WAITER_PRIORITY);
            let result = waiter_cache
                .read(&disk, BlockNumber(0))
                .and_then(|h| waiter_cache.release(h));
            describe(&result)
        })?;
        let queued = wait_until(DEADLOCK_AFTER, || {
            cache
                .report(Some(DeviceId(1)))
                .buffers
                .iter()
                .any(|b| b.access_waiters > 0)
        });
        if !queued {
            bail!("{name}: waiter never queued on the held buffer");
        }
        Some(rx)
    } else {
        None
    };

    let purge_done = Arc::new(AtomicBool::new(false));
    let early_purger = if scenario.purge == PurgeTiming::WhileHeld {
        let rx = start_purger(&fixture, &purge_done)?;
        let flagged = wait_until(DEADLOCK_AFTER, || {
            cache
                .report(Some(DeviceId(1)))
                .buffers
                .iter()
                .any(|b| b.purge_pending)
        });
        if !flagged {
            bail!("{name}: purge never flagged the held buffer");
        }
        Some(rx)
    } else {
        None
    };
    let purge_waited_for_release = early_purger.is_some() && !purge_done.load(Ordering::SeqCst);

    let release_rx = {
        let main_cache = Arc::clone(cache);
        let how = scenario.release;
        spawn_named("bdc-main-release", move || {
            HostPriority::set_current(MAIN_PRIORITY);
            describe(&release(&main_cache, handle, how))
        })?
    };
    let release_result = collect(&release_rx, "main", &name)?;

    let purger = match early_purger {
        Some(rx) => rx,
        None => start_purger(&fixture, &purge_done)?,
    };
    collect(&purger, "purger", &name)?;
    let waiter_result = match waiter {
        Some(rx) => Some(collect(&rx, "waiter", &name)?),
        None => None,
    };

    // A waiter that re-read the block after the purge may have left it
    // cached; a second purge with every task finished must empty the device.
    let buffers_left = cache.report(Some(DeviceId(1))).buffers.len();
    fixture.cache.purge(&fixture.disk);
    let after_final_purge = cache.report(Some(DeviceId(1))).buffers.len();
    if after_final_purge != 0 {
        bail!("{name}: {after_final_purge} buffers survived an idle purge");
    }

    let report = ScenarioReport {
        name,
        scenario,
        purge_waited_for_release,
        release_result,
        waiter_result,
        read_transfers: fixture.store.count(TransferOp::Read),
        write_transfers: fixture.store.count(TransferOp::Write),
        buffers_left,
        elapsed_ms: started.elapsed().as_millis(),
    };
    info!(
        target: "bdc::harness",
        event = "scenario_done",
        scenario = %report.name,
        release = %report.release_result,
        waiter = ?report.waiter_result,
        elapsed_ms = report.elapsed_ms
    );
    Ok(report)
}

/// Read a block, set the swapout worker's priority, and sync the block.
/// While the write is in flight a high-priority task purges the same
/// device and has to wait for the write to finish.
pub fn run_priority_scenario(priority: Priority) -> Result<PriorityReport> {
    let started = Instant::now();
    let fixture = Fixture::new()?;
    let label = format!("swapout priority {}", priority.0);
    let gate = Gate::new();
    fixture
        .store
        .script(TransferOp::Write, DiskAction::Wait(Arc::clone(&gate)));
    HostPriority::set_current(MAIN_PRIORITY);

    let mut handle = fixture
        .cache
        .read(&fixture.disk, BlockNumber(0))
        .context("read")?;
    handle.data_mut().fill(MARKER);
    fixture.cache.set_swapout_priority(priority);

    let sync_rx = {
        let sync_cache = Arc::clone(&fixture.cache);
        spawn_named("bdc-main-sync", move || {
            HostPriority::set_current(MAIN_PRIORITY);
            describe(&sync_cache.sync(handle))
        })?
    };
    if !gate.wait_arrived(1, DEADLOCK_AFTER) {
        gate.open();
        bail!("{label}: the sync never reached the driver");
    }

    let purge_done = Arc::new(AtomicBool::new(false));
    let purger = start_purger(&fixture, &purge_done)?;
    let flagged = wait_until(DEADLOCK_AFTER, || {
        fixture
            .cache
            .report(Some(DeviceId(1)))
            .buffers
            .iter()
            .any(|b| b.purge_pending)
    });
    let purge_waited_for_write = flagged && !purge_done.load(Ordering::SeqCst);
    gate.open();
    if !flagged {
        bail!("{label}: purge never flagged the buffer under write");
    }

    let sync_result = collect(&sync_rx, "main", &label)?;
    collect(&purger, "purger", &label)?;

    let data_on_disk = fixture
        .store
        .store()
        .block_contents(BlockNumber(0))
        .is_some_and(|bytes| bytes.iter().all(|&b| b == MARKER));
    let report = PriorityReport {
        swapout_priority: priority.0,
        sync_result,
        data_on_disk,
        purge_waited_for_write,
        buffers_left: fixture.cache.report(Some(DeviceId(1))).buffers.len(),
        write_transfers: fixture.store.count(TransferOp::Write),
        elapsed_ms: started.elapsed().as_millis(),
    };
    info!(
        target: "bdc::harness",
        event = "priority_scenario_done",
        priority = priority.0,
        sync = %report.sync_result,
        on_disk = report.data_on_disk,
        purge_waited = report.purge_waited_for_write
    );
    Ok(report)
}
