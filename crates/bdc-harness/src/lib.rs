#![forbid(unsafe_code)]
//! Test harness for the block device cache.
//!
//! Provides a scripted in-memory driver for fault and ordering tests, the
//! purge/waiter scenario matrix, and a small workload used by the
//! `bdc-harness` binary to print pool reports.

pub mod scenario;
pub mod scripted;

pub use scenario::{
    Acquire, PriorityReport, PurgeTiming, Release, Scenario, ScenarioReport, all_scenarios,
    device, run_priority_scenario, run_scenario, wait_until,
};
pub use scripted::{DiskAction, Gate, ScriptedDisk, TransferOpName, TransferRecord};

use anyhow::{Context, Result};
use bdc_cache::{Cache, CacheConfig, CacheReport};
use bdc_types::{BlockNumber, DeviceId, Priority};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// Results of the whole scenario suite.
#[derive(Debug, Clone, Serialize)]
pub struct MatrixReport {
    pub scenarios: Vec<ScenarioReport>,
    pub priorities: Vec<PriorityReport>,
}

impl MatrixReport {
    /// Every scenario finished and every sync landed on the medium.
    #[must_use]
    pub fn all_passed(&self) -> bool {
        self.scenarios.iter().all(|s| {
            s.release_result == "ok" && s.waiter_result.as_deref().is_none_or(|w| w == "ok")
        }) && self
            .priorities
            .iter()
            .all(|p| p.sync_result == "ok" && p.data_on_disk && p.purge_waited_for_write)
    }
}

/// Swapout priorities tried by the suite, relative to the purging task.
pub const PRIORITY_VARIANTS: [Priority; 3] = [Priority(1), Priority(15), Priority(40)];

/// Run the 18-case matrix, the purge-after-release cases, and the swapout
/// priority variants.
pub fn run_matrix() -> Result<MatrixReport> {
    let mut cases = all_scenarios();
    for acquire in [Acquire::Get, Acquire::GetModified, Acquire::Read] {
        for release in [Release::Release, Release::ReleaseModified, Release::Sync] {
            cases.push(Scenario {
                acquire,
                release,
                with_waiter: false,
                purge: PurgeTiming::AfterRelease,
            });
        }
    }
    let scenarios = cases
        .into_iter()
        .map(run_scenario)
        .collect::<Result<Vec<_>>>()?;
    let priorities = PRIORITY_VARIANTS
        .into_iter()
        .map(run_priority_scenario)
        .collect::<Result<Vec<_>>>()?;
    Ok(MatrixReport {
        scenarios,
        priorities,
    })
}

/// Drive a short mixed workload and return the pool report.
///
/// Reads every other block, dirties the rest, and leaves one buffer held
/// while the snapshot is taken.
pub fn sample_report(config: CacheConfig, blocks: u64) -> Result<CacheReport> {
    let cache = Cache::with_config(config).context("cache init")?;
    let store = Arc::new(ScriptedDisk::new(512, blocks.max(2)));
    let disk = device(DeviceId(1), &store)?;

    for block in 0..blocks {
        if block % 2 == 0 {
            let handle = cache.read(&disk, BlockNumber(block))?;
            cache.release(handle)?;
        } else {
            let mut handle = cache.get(&disk, BlockNumber(block))?;
            handle.data_mut().fill(0xD0);
            cache.release_modified(handle)?;
        }
    }
    let held = cache.read_timeout(&disk, BlockNumber(0), Duration::from_secs(5))?;
    let report = cache.report(None);
    cache.release(held)?;
    cache.teardown()?;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bdc_cache::BufferState;

    #[test]
    fn sample_report_shows_held_and_dirty_buffers() {
        let config = CacheConfig {
            swap_block_hold_ms: 60_000,
            ..CacheConfig::single_class(512, 8)
        };
        let report = sample_report(config, 6).expect("report");
        assert_eq!(report.total.total(), 8);
        assert_eq!(report.total.in_state(BufferState::AccessedCached), 1);
        assert_eq!(report.total.in_state(BufferState::Modified), 3);
        assert_eq!(report.buffers.len(), 6);
    }

    #[test]
    fn matrix_report_flags_failures() {
        let report = MatrixReport {
            scenarios: Vec::new(),
            priorities: vec![PriorityReport {
                swapout_priority: 1,
                sync_result: "ok".into(),
                data_on_disk: false,
                purge_waited_for_write: true,
                buffers_left: 0,
                write_transfers: 0,
                elapsed_ms: 0,
            }],
        };
        assert!(!report.all_passed());
    }
}
