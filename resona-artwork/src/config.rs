use std::time::Duration;

use crate::units::ByteSize;

/// Budgets for one memory-store partition.
#[derive(Debug, Clone, Copy)]
pub struct MemoryBudget {
    pub max_entries: usize,
    pub max_bytes: ByteSize,
}

/// Limits for the on-disk artwork store.
#[derive(Debug, Clone, Copy)]
pub struct DiskLimits {
    pub max_bytes: ByteSize,
    /// Records older than this are removed by maintenance regardless of
    /// size pressure.
    pub max_age: Duration,
    /// Roughly one read in `touch_one_in` persists an updated last-accessed
    /// timestamp, bounding write amplification on read-heavy workloads.
    pub touch_one_in: u32,
    pub jpeg_quality: u8,
}

/// Limits for the preload orchestrator.
#[derive(Debug, Clone, Copy)]
pub struct PreloadLimits {
    /// Immediate policy loads only this many leading items.
    pub burst_size: usize,
    /// User-initiated policy bounds concurrent outbound fetches with a
    /// semaphore of this capacity.
    pub max_concurrent: usize,
    /// Background policy sleeps this long between sequential loads.
    pub inter_item_delay: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct ArtworkCacheConfig {
    pub album_memory: MemoryBudget,
    pub artist_memory: MemoryBudget,
    pub disk: DiskLimits,
    pub preload: PreloadLimits,
    /// Step for optional request staggering: a caller-supplied index is
    /// multiplied by this delay before the load starts.
    pub stagger_step: Duration,
}

impl ArtworkCacheConfig {
    pub const fn defaults() -> Self {
        Self {
            album_memory: MemoryBudget {
                max_entries: 300,
                max_bytes: ByteSize::from_mib(120),
            },
            artist_memory: MemoryBudget {
                max_entries: 200,
                max_bytes: ByteSize::from_mib(60),
            },
            disk: DiskLimits {
                max_bytes: ByteSize::from_mib(512),
                max_age: Duration::from_secs(30 * 24 * 60 * 60),
                touch_one_in: 20,
                jpeg_quality: 92,
            },
            preload: PreloadLimits {
                burst_size: 5,
                max_concurrent: 12,
                inter_item_delay: Duration::from_millis(300),
            },
            stagger_step: Duration::from_millis(40),
        }
    }
}

impl Default for ArtworkCacheConfig {
    fn default() -> Self {
        Self::defaults()
    }
}
