#![forbid(unsafe_code)]
//! Identity types shared by every layer of the block device cache.
//!
//! These are unit-carrying wrappers so that device identifiers, block
//! numbers, and scheduling priorities cannot be mixed up at call sites.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a registered block device (major/minor folded into one value).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceId(pub u32);

impl DeviceId {
    /// Build an identifier from a major/minor pair.
    #[must_use]
    pub fn from_parts(major: u16, minor: u16) -> Self {
        Self((u32::from(major) << 16) | u32::from(minor))
    }

    #[must_use]
    pub fn major(self) -> u16 {
        u16::try_from(self.0 >> 16).unwrap_or(u16::MAX)
    }

    #[must_use]
    pub fn minor(self) -> u16 {
        u16::try_from(self.0 & 0xFFFF).unwrap_or(u16::MAX)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.major(), self.minor())
    }
}

/// Linear block number on a device, in units of the device block size.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct BlockNumber(pub u64);

impl BlockNumber {
    /// Add a block count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, blocks: u64) -> Option<Self> {
        self.0.checked_add(blocks).map(Self)
    }

    /// The block immediately after this one (saturating).
    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// True when `other` directly follows `self`.
    #[must_use]
    pub fn is_followed_by(self, other: Self) -> bool {
        self.0.checked_add(1) == Some(other.0)
    }
}

impl fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Key of the association index: one cached block of one device.
///
/// Ordered by device first, then block, so sorting a set of keys groups
/// each device's blocks in ascending order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BufferKey {
    pub device: DeviceId,
    pub block: BlockNumber,
}

impl BufferKey {
    #[must_use]
    pub fn new(device: DeviceId, block: BlockNumber) -> Self {
        Self { device, block }
    }
}

impl fmt::Display for BufferKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.device, self.block)
    }
}

/// Task scheduling priority.
///
/// Follows the real-time convention of the host scheduler: a numerically
/// LOWER value is MORE urgent. `Priority(1)` preempts `Priority(15)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Priority(pub u32);

impl Priority {
    /// Most urgent priority a task can hold.
    pub const HIGHEST: Self = Self(1);
    /// Least urgent priority a task can hold.
    pub const LOWEST: Self = Self(255);

    #[must_use]
    pub fn is_more_urgent_than(self, other: Self) -> bool {
        self.0 < other.0
    }

    /// The more urgent of two priorities.
    #[must_use]
    pub fn most_urgent(self, other: Self) -> Self {
        if other.is_more_urgent_than(self) {
            other
        } else {
            self
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self(100)
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "prio {}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_id_splits_major_minor() {
        let dev = DeviceId::from_parts(8, 17);
        assert_eq!(dev.major(), 8);
        assert_eq!(dev.minor(), 17);
        assert_eq!(dev.to_string(), "8:17");
    }

    #[test]
    fn buffer_keys_sort_by_device_then_block() {
        let mut keys = vec![
            BufferKey::new(DeviceId(2), BlockNumber(1)),
            BufferKey::new(DeviceId(1), BlockNumber(9)),
            BufferKey::new(DeviceId(1), BlockNumber(3)),
        ];
        keys.sort();
        assert_eq!(keys[0], BufferKey::new(DeviceId(1), BlockNumber(3)));
        assert_eq!(keys[1], BufferKey::new(DeviceId(1), BlockNumber(9)));
        assert_eq!(keys[2].device, DeviceId(2));
    }

    #[test]
    fn contiguity_check() {
        assert!(BlockNumber(4).is_followed_by(BlockNumber(5)));
        assert!(!BlockNumber(4).is_followed_by(BlockNumber(6)));
        assert!(!BlockNumber(u64::MAX).is_followed_by(BlockNumber(0)));
    }

    #[test]
    fn lower_priority_value_wins() {
        let worker = Priority(15);
        let waiter = Priority(5);
        assert!(waiter.is_more_urgent_than(worker));
        assert_eq!(worker.most_urgent(waiter), waiter);
        assert_eq!(waiter.most_urgent(worker), waiter);
        assert_eq!(Priority::HIGHEST.most_urgent(Priority::LOWEST), Priority::HIGHEST);
    }

    #[test]
    fn key_serializes_transparently() {
        let key = BufferKey::new(DeviceId(3), BlockNumber(42));
        let json = serde_json::to_string(&key).expect("serialize");
        let back: BufferKey = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, key);
    }
}
