//! In-memory artwork tier: two bounded partitions of decoded bitmaps.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use image::RgbaImage;
use parking_lot::Mutex;
use resona_model::{ArtworkKey, ArtworkKind, Resolution};

use crate::config::MemoryBudget;
use crate::generation::CacheGeneration;
use crate::units::ByteSize;

#[derive(Debug)]
struct MemoryEntry {
    image: Arc<RgbaImage>,
    cost_bytes: u64,
    last_used: u64,
}

#[derive(Debug, Default)]
struct PartitionInner {
    entries: HashMap<ArtworkKey, MemoryEntry>,
    usage_bytes: u64,
    tick: u64,
}

impl PartitionInner {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }
}

/// One bounded partition (album or artist artwork).
///
/// Entries are keyed by the full `ArtworkKey`, so the same identifier may be
/// resident at several resolutions at once. Eviction is least-recently-used
/// and runs synchronously on insert until both the count and byte budgets
/// hold again.
#[derive(Debug)]
struct Partition {
    budget: MemoryBudget,
    inner: Mutex<PartitionInner>,
}

impl Partition {
    fn new(budget: MemoryBudget) -> Self {
        Self {
            budget,
            inner: Mutex::new(PartitionInner::default()),
        }
    }

    fn get(&self, key: &ArtworkKey) -> Option<Arc<RgbaImage>> {
        let mut inner = self.inner.lock();
        let tick = inner.next_tick();
        let entry = inner.entries.get_mut(key)?;
        entry.last_used = tick;
        Some(Arc::clone(&entry.image))
    }

    fn put(&self, key: ArtworkKey, image: Arc<RgbaImage>) -> u64 {
        let cost_bytes = pixel_cost(&image).as_bytes();
        let mut inner = self.inner.lock();
        let tick = inner.next_tick();
        if let Some(old) = inner.entries.insert(
            key,
            MemoryEntry {
                image,
                cost_bytes,
                last_used: tick,
            },
        ) {
            inner.usage_bytes =
                inner.usage_bytes.saturating_sub(old.cost_bytes);
        }
        inner.usage_bytes = inner.usage_bytes.saturating_add(cost_bytes);

        let mut evicted = 0u64;
        while inner.entries.len() > self.budget.max_entries
            || inner.usage_bytes > self.budget.max_bytes.as_bytes()
        {
            let victim = inner
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(key, _)| key.clone());
            let Some(victim) = victim else { break };
            if let Some(entry) = inner.entries.remove(&victim) {
                inner.usage_bytes =
                    inner.usage_bytes.saturating_sub(entry.cost_bytes);
                evicted += 1;
            }
        }
        evicted
    }

    /// Smallest resident variant of the same artwork strictly above
    /// `resolution`, walking the common ladder upward.
    fn smallest_above(
        &self,
        key: &ArtworkKey,
        ladder: &[Resolution],
    ) -> Option<(Resolution, Arc<RgbaImage>)> {
        let mut inner = self.inner.lock();
        let tick = inner.next_tick();
        for rung in ladder {
            if *rung <= key.resolution {
                continue;
            }
            let candidate = key.at_resolution(*rung);
            if let Some(entry) = inner.entries.get_mut(&candidate) {
                entry.last_used = tick;
                return Some((*rung, Arc::clone(&entry.image)));
            }
        }
        None
    }

    fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.usage_bytes = 0;
    }

    fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    fn usage_bytes(&self) -> u64 {
        self.inner.lock().usage_bytes
    }
}

fn pixel_cost(image: &RgbaImage) -> ByteSize {
    ByteSize::from_usize(image.as_raw().len())
}

#[derive(Debug, Clone, Copy)]
pub struct MemoryStoreStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub insertions: u64,
    pub evictions: u64,
}

#[derive(Debug, Default)]
struct MemoryStoreStats {
    hits: AtomicU64,
    misses: AtomicU64,
    insertions: AtomicU64,
    evictions: AtomicU64,
}

/// Memory tier of the artwork cache.
///
/// Album and artist artwork live in independent partitions so a large album
/// grid cannot evict every artist portrait. All operations are O(1) apart
/// from eviction scans, which are bounded by the partition entry budget.
#[derive(Debug)]
pub struct MemoryStore {
    albums: Partition,
    artists: Partition,
    generation: Arc<CacheGeneration>,
    stats: MemoryStoreStats,
}

impl MemoryStore {
    pub fn new(
        album_budget: MemoryBudget,
        artist_budget: MemoryBudget,
        generation: Arc<CacheGeneration>,
    ) -> Self {
        Self {
            albums: Partition::new(album_budget),
            artists: Partition::new(artist_budget),
            generation,
            stats: MemoryStoreStats::default(),
        }
    }

    fn partition(&self, kind: ArtworkKind) -> &Partition {
        match kind {
            ArtworkKind::Album => &self.albums,
            ArtworkKind::Artist => &self.artists,
        }
    }

    pub fn get(&self, key: &ArtworkKey) -> Option<Arc<RgbaImage>> {
        let found = self.partition(key.kind).get(key);
        match found {
            Some(_) => self.stats.hits.fetch_add(1, Ordering::Relaxed),
            None => self.stats.misses.fetch_add(1, Ordering::Relaxed),
        };
        found
    }

    /// Insert a decoded bitmap and enforce the partition budgets.
    ///
    /// Bumps the cache generation; some other key in the same partition may
    /// disappear to bring the budgets back under their limits.
    pub fn put(&self, key: ArtworkKey, image: Arc<RgbaImage>) {
        let evicted = self.partition(key.kind).put(key, image);
        self.stats.insertions.fetch_add(1, Ordering::Relaxed);
        if evicted > 0 {
            self.stats.evictions.fetch_add(evicted, Ordering::Relaxed);
        }
        self.generation.bump();
    }

    /// Downscale-reuse probe: the smallest resident variant of the same
    /// artwork above the requested resolution, if any.
    pub fn smallest_above(
        &self,
        key: &ArtworkKey,
    ) -> Option<(Resolution, Arc<RgbaImage>)> {
        self.partition(key.kind)
            .smallest_above(key, &resona_model::COMMON_RESOLUTIONS)
    }

    pub fn contains(&self, key: &ArtworkKey) -> bool {
        self.partition(key.kind).get(key).is_some()
    }

    /// Drop every entry in both partitions and bump the generation.
    ///
    /// Used on cache-wide reset and on memory-pressure signals.
    pub fn clear(&self) {
        self.albums.clear();
        self.artists.clear();
        self.generation.bump();
    }

    pub fn entry_count(&self, kind: ArtworkKind) -> usize {
        self.partition(kind).len()
    }

    pub fn usage(&self, kind: ArtworkKind) -> ByteSize {
        ByteSize::from_bytes(self.partition(kind).usage_bytes())
    }

    pub fn stats_snapshot(&self) -> MemoryStoreStatsSnapshot {
        MemoryStoreStatsSnapshot {
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            insertions: self.stats.insertions.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use resona_model::COMMON_RESOLUTIONS;

    fn store_with(budget: MemoryBudget) -> MemoryStore {
        MemoryStore::new(
            budget,
            budget,
            Arc::new(CacheGeneration::default()),
        )
    }

    fn rgba(px: u32) -> Arc<RgbaImage> {
        Arc::new(RgbaImage::new(px, px))
    }

    fn key(id: &str, px: u32) -> ArtworkKey {
        ArtworkKey::new(ArtworkKind::Album, id, Resolution::new(px))
    }

    #[test]
    fn byte_budget_is_enforced_after_insert() {
        // Each 100px RGBA image costs 40_000 bytes.
        let store = store_with(MemoryBudget {
            max_entries: 100,
            max_bytes: ByteSize::from_bytes(100_000),
        });

        store.put(key("a", 100), rgba(100));
        store.put(key("b", 100), rgba(100));
        store.put(key("c", 100), rgba(100));

        assert!(
            store.usage(ArtworkKind::Album).as_bytes() <= 100_000,
            "usage {} exceeds budget",
            store.usage(ArtworkKind::Album)
        );
        assert_eq!(store.entry_count(ArtworkKind::Album), 2);
    }

    #[test]
    fn count_budget_evicts_least_recently_used() {
        let store = store_with(MemoryBudget {
            max_entries: 2,
            max_bytes: ByteSize::from_mib(10),
        });

        store.put(key("a", 100), rgba(100));
        store.put(key("b", 100), rgba(100));
        // Touch "a" so "b" becomes the LRU victim.
        assert!(store.get(&key("a", 100)).is_some());
        store.put(key("c", 100), rgba(100));

        assert!(store.contains(&key("a", 100)));
        assert!(!store.contains(&key("b", 100)));
        assert!(store.contains(&key("c", 100)));
    }

    #[test]
    fn partitions_are_independent() {
        let store = store_with(MemoryBudget {
            max_entries: 1,
            max_bytes: ByteSize::from_mib(10),
        });

        store.put(key("a", 100), rgba(100));
        store.put(
            ArtworkKey::new(ArtworkKind::Artist, "x", Resolution::new(100)),
            rgba(100),
        );

        assert_eq!(store.entry_count(ArtworkKind::Album), 1);
        assert_eq!(store.entry_count(ArtworkKind::Artist), 1);
    }

    #[test]
    fn smallest_above_picks_nearest_larger_rung() {
        let store = store_with(MemoryBudget {
            max_entries: 10,
            max_bytes: ByteSize::from_mib(10),
        });

        store.put(key("a", 400), rgba(400));
        store.put(key("a", 800), rgba(800));

        let (rung, _) = store
            .smallest_above(&key("a", 200))
            .expect("larger variant resident");
        assert_eq!(rung, Resolution::new(400));

        // Nothing above the top of the ladder.
        let top = COMMON_RESOLUTIONS[COMMON_RESOLUTIONS.len() - 1];
        assert!(store.smallest_above(&key("a", top.px())).is_none());
    }

    #[test]
    fn put_bumps_generation() {
        let generation = Arc::new(CacheGeneration::default());
        let store = MemoryStore::new(
            MemoryBudget {
                max_entries: 10,
                max_bytes: ByteSize::from_mib(10),
            },
            MemoryBudget {
                max_entries: 10,
                max_bytes: ByteSize::from_mib(10),
            },
            Arc::clone(&generation),
        );

        let before = generation.current();
        store.put(key("a", 100), rgba(100));
        assert_eq!(generation.current(), before + 1);
    }
}
