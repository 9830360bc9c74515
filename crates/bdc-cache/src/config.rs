//! Cache configuration and size-class layout.

use bdc_error::{BdcError, Result};
use bdc_types::Priority;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Construction-time parameters of a [`Cache`](crate::Cache).
///
/// Defaults follow the classic bdbuf configuration table: a 32 KiB cache
/// split across 512..=4096 byte buffers, read-ahead off, write runs of at
/// most 16 blocks, a 250 ms swapout period and a one second block hold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Smallest buffer size in bytes. Power of two.
    pub buffer_min: usize,
    /// Largest buffer size in bytes. Power of two, multiple of `buffer_min`.
    pub buffer_max: usize,
    /// Total buffer memory in bytes, split evenly among the size classes.
    pub size: usize,
    /// Number of size classes to use, counted from `buffer_min` upwards.
    /// `None` uses every power of two between `buffer_min` and `buffer_max`.
    pub size_classes: Option<usize>,
    /// Blocks fetched by one read-ahead transfer. Zero disables read-ahead.
    pub max_read_ahead_blocks: usize,
    pub read_ahead_priority: Priority,
    /// Upper bound of one coalesced write run.
    pub max_write_blocks: usize,
    pub swapout_priority: Priority,
    pub swapout_period_ms: u64,
    /// How long a modified buffer may stay unwritten when nothing forces it.
    pub swap_block_hold_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            buffer_min: 512,
            buffer_max: 4096,
            size: 32 * 1024,
            size_classes: None,
            max_read_ahead_blocks: 0,
            read_ahead_priority: Priority(15),
            max_write_blocks: 16,
            swapout_priority: Priority(15),
            swapout_period_ms: 250,
            swap_block_hold_ms: 1000,
        }
    }
}

/// One group of equally sized buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeClass {
    pub buffer_size: usize,
    pub buffers: usize,
}

impl CacheConfig {
    /// A configuration with a single size class of `buffers` buffers of
    /// `buffer_size` bytes each.
    #[must_use]
    pub fn single_class(buffer_size: usize, buffers: usize) -> Self {
        Self {
            buffer_min: buffer_size,
            buffer_max: buffer_size,
            size: buffer_size.saturating_mul(buffers),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn swapout_period(&self) -> Duration {
        Duration::from_millis(self.swapout_period_ms)
    }

    #[must_use]
    pub fn swap_block_hold(&self) -> Duration {
        Duration::from_millis(self.swap_block_hold_ms)
    }

    /// Check the configuration and lay out the size classes.
    pub fn validate(&self) -> Result<Vec<SizeClass>> {
        if self.buffer_min == 0 || !self.buffer_min.is_power_of_two() {
            return Err(BdcError::InvalidConfig(format!(
                "buffer_min {} is not a power of two",
                self.buffer_min
            )));
        }
        if self.buffer_max < self.buffer_min || !self.buffer_max.is_power_of_two() {
            return Err(BdcError::InvalidConfig(format!(
                "buffer_max {} must be a power of two >= buffer_min {}",
                self.buffer_max, self.buffer_min
            )));
        }
        if self.max_write_blocks == 0 {
            return Err(BdcError::InvalidConfig(
                "max_write_blocks must be at least 1".to_owned(),
            ));
        }
        if self.swapout_period_ms == 0 {
            return Err(BdcError::InvalidConfig(
                "swapout_period_ms must be non-zero".to_owned(),
            ));
        }

        let mut sizes = Vec::new();
        let mut next = Some(self.buffer_min);
        while let Some(size) = next.filter(|&size| size <= self.buffer_max) {
            sizes.push(size);
            next = size.checked_mul(2);
        }
        if let Some(wanted) = self.size_classes {
            if wanted == 0 || wanted > sizes.len() {
                return Err(BdcError::InvalidConfig(format!(
                    "size_classes {wanted} outside 1..={}",
                    sizes.len()
                )));
            }
            sizes.truncate(wanted);
        }

        let per_class = self.size / sizes.len();
        let classes: Vec<SizeClass> = sizes
            .into_iter()
            .map(|buffer_size| SizeClass {
                buffer_size,
                buffers: per_class / buffer_size,
            })
            .collect();
        if classes.iter().all(|class| class.buffers == 0) {
            return Err(BdcError::InvalidConfig(format!(
                "size {} holds no buffer of any class",
                self.size
            )));
        }
        Ok(classes)
    }
}

/// Index of the smallest class whose buffers hold `block_size` bytes.
pub(crate) fn find_class(classes: &[SizeClass], block_size: u32) -> Result<usize> {
    let wanted = usize::try_from(block_size).map_err(|_| BdcError::UnsupportedBlockSize(block_size))?;
    classes
        .iter()
        .position(|class| class.buffer_size >= wanted)
        .ok_or(BdcError::UnsupportedBlockSize(block_size))
}
