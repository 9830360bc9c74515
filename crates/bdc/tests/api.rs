#![forbid(unsafe_code)]

use bdc::{BlockNumber, BufferState, Cache, CacheConfig, DeviceId, DiskDevice, MemoryDisk};
use std::sync::Arc;

#[test]
fn facade_drives_a_memory_disk() {
    let store = Arc::new(MemoryDisk::new(1024, 16));
    let disk = Arc::new(
        DiskDevice::new(DeviceId(3), 1024, 16, Arc::clone(&store) as _).expect("device"),
    );
    let cache = Cache::with_config(CacheConfig::default()).expect("cache");

    let mut handle = cache.get(&disk, BlockNumber(7)).expect("get");
    assert_eq!(handle.state(), BufferState::AccessedEmpty);
    assert_eq!(handle.data().len(), 1024);
    handle.data_mut().fill(0x42);
    cache.release_modified(handle).expect("release");
    cache.sync_device(&disk).expect("sync");

    assert_eq!(store.block_contents(BlockNumber(7)).expect("block")[1023], 0x42);
    cache.teardown().expect("teardown");
}
