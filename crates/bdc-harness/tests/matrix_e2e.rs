#![forbid(unsafe_code)]

use bdc_harness::{
    Acquire, PRIORITY_VARIANTS, PurgeTiming, Release, Scenario, all_scenarios,
    run_priority_scenario, run_scenario,
};

#[test]
fn purge_while_held_matrix_completes() {
    for scenario in all_scenarios() {
        let report = run_scenario(scenario).unwrap_or_else(|err| panic!("{err:#}"));
        assert_eq!(report.release_result, "ok", "{}", report.name);
        assert!(
            report.purge_waited_for_release,
            "{}: purge returned while the buffer was held",
            report.name
        );
        if scenario.with_waiter {
            assert_eq!(report.waiter_result.as_deref(), Some("ok"), "{}", report.name);
        } else {
            assert!(report.waiter_result.is_none(), "{}", report.name);
        }

        // Purge discards dirty data instead of writing it.
        assert_eq!(report.write_transfers, 0, "{}", report.name);
        let expected_reads =
            usize::from(scenario.acquire == Acquire::Read) + usize::from(scenario.with_waiter);
        assert_eq!(report.read_transfers, expected_reads, "{}", report.name);
    }
}

#[test]
fn purge_after_release_discards_what_was_left() {
    for acquire in [Acquire::Get, Acquire::GetModified, Acquire::Read] {
        for release in [Release::Release, Release::ReleaseModified, Release::Sync] {
            let scenario = Scenario {
                acquire,
                release,
                with_waiter: false,
                purge: PurgeTiming::AfterRelease,
            };
            let report = run_scenario(scenario).unwrap_or_else(|err| panic!("{err:#}"));
            assert_eq!(report.release_result, "ok", "{}", report.name);
            assert!(!report.purge_waited_for_release, "{}", report.name);
            assert_eq!(report.buffers_left, 0, "{}", report.name);
            let expected_writes = usize::from(release == Release::Sync);
            assert_eq!(report.write_transfers, expected_writes, "{}", report.name);
        }
    }
}

#[test]
fn sync_succeeds_at_every_swapout_priority() {
    for priority in PRIORITY_VARIANTS {
        let report = run_priority_scenario(priority).unwrap_or_else(|err| panic!("{err:#}"));
        assert_eq!(report.sync_result, "ok", "priority {}", priority.0);
        assert!(report.data_on_disk, "priority {}", priority.0);
        assert_eq!(report.write_transfers, 1, "priority {}", priority.0);
        assert!(
            report.purge_waited_for_write,
            "priority {}: purge of the same device did not wait for the write",
            priority.0
        );
        assert_eq!(report.buffers_left, 0, "priority {}", priority.0);
    }
}
