//! Disk tier: budget-bounded persistence of encoded artwork.
//!
//! Content lives as JPEG files named by a SHA-256 hash of the cache key;
//! a JSON manifest maps key hashes to those files and their metadata. Every
//! failure at this boundary is logged and swallowed: a broken disk cache
//! degrades to "always fetch from network", never to an error the caller
//! sees.

mod eviction;
pub(crate) mod manifest;

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{TimeDelta, Utc};
use image::{DynamicImage, ExtendedColorType, ImageEncoder, RgbaImage};
use image::codecs::jpeg::JpegEncoder;
use rand::Rng;
use resona_model::ArtworkKey;
use sha2::Digest;
use tokio::sync::Mutex;

use crate::config::DiskLimits;
use crate::units::ByteSize;
use eviction::plan_evictions;
use manifest::{DiskRecord, MANIFEST_FILE_NAME, Manifest, write_snapshot_sync};

#[derive(Debug, Clone, Copy)]
pub struct DiskStoreStatsSnapshot {
    pub read_hits: u64,
    pub read_misses: u64,
    pub writes: u64,
    pub write_errors: u64,
    pub self_heals: u64,
    pub touches: u64,
    pub maintenance_runs: u64,
    pub removed_age: u64,
    pub removed_size: u64,
    pub removed_orphans: u64,
}

#[derive(Debug, Default)]
struct DiskStoreStats {
    read_hits: AtomicU64,
    read_misses: AtomicU64,
    writes: AtomicU64,
    write_errors: AtomicU64,
    self_heals: AtomicU64,
    touches: AtomicU64,
    maintenance_runs: AtomicU64,
    removed_age: AtomicU64,
    removed_size: AtomicU64,
    removed_orphans: AtomicU64,
}

impl DiskStoreStats {
    fn snapshot(&self) -> DiskStoreStatsSnapshot {
        DiskStoreStatsSnapshot {
            read_hits: self.read_hits.load(Ordering::Relaxed),
            read_misses: self.read_misses.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            write_errors: self.write_errors.load(Ordering::Relaxed),
            self_heals: self.self_heals.load(Ordering::Relaxed),
            touches: self.touches.load(Ordering::Relaxed),
            maintenance_runs: self.maintenance_runs.load(Ordering::Relaxed),
            removed_age: self.removed_age.load(Ordering::Relaxed),
            removed_size: self.removed_size.load(Ordering::Relaxed),
            removed_orphans: self.removed_orphans.load(Ordering::Relaxed),
        }
    }
}

/// Budget-bounded persistent artwork store.
///
/// All manifest mutations funnel through one async mutex; maintenance runs
/// collapse behind a dedicated cleanup lock so concurrent triggers are
/// idempotent.
#[derive(Debug)]
pub struct DiskStore {
    root: PathBuf,
    limits: DiskLimits,
    manifest: Mutex<Manifest>,
    usage_bytes: AtomicU64,
    cleanup_lock: Mutex<()>,
    stats: DiskStoreStats,
}

impl DiskStore {
    /// Open (or create) the store rooted at `root` and run a synchronous
    /// maintenance pass so a restart comes up under budget.
    pub fn try_new(root: PathBuf, limits: DiskLimits) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&root)?;

        let mut manifest =
            Manifest::load_or_default(root.join(MANIFEST_FILE_NAME));
        maintenance_sync(&root, &limits, &mut manifest);
        let usage = manifest.total_bytes();

        Ok(Self {
            root,
            limits,
            manifest: Mutex::new(manifest),
            usage_bytes: AtomicU64::new(usage),
            cleanup_lock: Mutex::new(()),
            stats: DiskStoreStats::default(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn usage(&self) -> ByteSize {
        ByteSize::from_bytes(self.usage_bytes.load(Ordering::Relaxed))
    }

    pub fn stats_snapshot(&self) -> DiskStoreStatsSnapshot {
        self.stats.snapshot()
    }

    /// Encoded bytes for `key`, if present.
    ///
    /// A manifest record whose backing file is missing is deleted on the
    /// spot (self-heal) and reported as a miss. Roughly one read in
    /// `touch_one_in` persists an updated last-accessed timestamp.
    pub async fn get(&self, key: &ArtworkKey) -> Option<Vec<u8>> {
        let key_hash = key_hash_for(key);

        let filename = {
            let guard = self.manifest.lock().await;
            guard.get(&key_hash).map(|r| r.filename.clone())
        };
        let Some(filename) = filename else {
            self.stats.read_misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        match tokio::fs::read(self.root.join(&filename)).await {
            Ok(bytes) => {
                self.stats.read_hits.fetch_add(1, Ordering::Relaxed);
                self.maybe_touch(&key_hash).await;
                Some(bytes)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::warn!(
                    "artwork disk record has no backing file, healing; key={key}, file={filename}"
                );
                let removed = {
                    let mut guard = self.manifest.lock().await;
                    guard.remove(&key_hash)
                };
                if let Some(record) = removed {
                    self.sub_usage(record.size_bytes);
                    self.stats.self_heals.fetch_add(1, Ordering::Relaxed);
                }
                self.flush_manifest().await;
                None
            }
            Err(e) => {
                log::warn!("artwork disk read failed; key={key}, err={e}");
                None
            }
        }
    }

    /// Encode `image` at the configured JPEG quality and persist it.
    ///
    /// Never blocks the caller on eviction: if the write pushes usage over
    /// budget, a maintenance pass is spawned in the background.
    pub async fn put(self: &Arc<Self>, key: &ArtworkKey, image: Arc<RgbaImage>) {
        let key_hash = key_hash_for(key);
        let filename = format!("{key_hash}.jpg");
        let quality = self.limits.jpeg_quality;

        let encoded = match tokio::task::spawn_blocking(move || {
            encode_jpeg(&image, quality)
        })
        .await
        {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(e)) => {
                self.stats.write_errors.fetch_add(1, Ordering::Relaxed);
                log::warn!("artwork encode failed; key={key}, err={e}");
                return;
            }
            Err(e) => {
                self.stats.write_errors.fetch_add(1, Ordering::Relaxed);
                log::warn!("artwork encode join failed; key={key}, err={e}");
                return;
            }
        };

        if let Err(e) =
            write_file_atomic(&self.root, &filename, &encoded).await
        {
            self.stats.write_errors.fetch_add(1, Ordering::Relaxed);
            log::warn!("artwork disk write failed; key={key}, err={e}");
            return;
        }

        let now = Utc::now();
        let size_bytes = encoded.len() as u64;
        {
            let mut guard = self.manifest.lock().await;
            if let Some(old) = guard.remove(&key_hash) {
                self.sub_usage(old.size_bytes);
            }
            guard.insert(DiskRecord {
                key_hash,
                filename,
                created_at: now,
                size_bytes,
                last_accessed: now,
            });
        }
        self.add_usage(size_bytes);
        self.stats.writes.fetch_add(1, Ordering::Relaxed);
        self.flush_manifest().await;

        let max_bytes = self.limits.max_bytes.as_bytes();
        if max_bytes > 0
            && self.usage_bytes.load(Ordering::Relaxed) > max_bytes
        {
            let store = Arc::clone(self);
            tokio::spawn(async move {
                store.perform_maintenance().await;
            });
        }
    }

    /// Delete `key`'s file and record. Idempotent.
    pub async fn remove(&self, key: &ArtworkKey) {
        let key_hash = key_hash_for(key);
        let removed = {
            let mut guard = self.manifest.lock().await;
            guard.remove(&key_hash)
        };
        let Some(record) = removed else { return };

        self.sub_usage(record.size_bytes);
        if let Err(e) =
            tokio::fs::remove_file(self.root.join(&record.filename)).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            log::warn!("artwork disk remove failed; key={key}, err={e}");
        }
        self.flush_manifest().await;
    }

    /// Delete every cached file and reset the manifest. Idempotent.
    pub async fn clear(&self) {
        {
            let mut guard = self.manifest.lock().await;
            guard.clear();
        }
        self.usage_bytes.store(0, Ordering::Relaxed);
        self.flush_manifest().await;

        let root = self.root.clone();
        let removed = tokio::task::spawn_blocking(move || {
            remove_cache_files_sync(&root, None)
        })
        .await;
        match removed {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => log::warn!("artwork disk clear failed: {e}"),
            Err(e) => log::warn!("artwork disk clear join failed: {e}"),
        }
    }

    /// Age sweep, then LRU sweep down to the low-water mark, then orphan
    /// cleanup. Idempotent and safe to trigger concurrently; callers racing
    /// the cleanup lock simply queue behind the running pass.
    pub async fn perform_maintenance(&self) {
        let _guard = self.cleanup_lock.lock().await;

        let now = Utc::now();
        let max_age = max_age_delta(&self.limits);
        let max_bytes = self.limits.max_bytes.as_bytes();

        let records: Vec<DiskRecord> = {
            let guard = self.manifest.lock().await;
            guard.records().cloned().collect()
        };

        let plan = plan_evictions(records, now, max_age, max_bytes);
        let mut removed_hashes = Vec::with_capacity(plan.planned.len());
        for planned in &plan.planned {
            if let Err(e) =
                tokio::fs::remove_file(self.root.join(&planned.filename))
                    .await
                && e.kind() != std::io::ErrorKind::NotFound
            {
                log::warn!(
                    "artwork eviction delete failed; file={}, err={e}",
                    planned.filename
                );
                continue;
            }
            removed_hashes.push(planned.key_hash.clone());
        }

        let (total_bytes, known) = {
            let mut guard = self.manifest.lock().await;
            for hash in &removed_hashes {
                guard.remove(hash);
            }
            (guard.total_bytes(), guard.known_filenames())
        };
        self.usage_bytes.store(total_bytes, Ordering::Relaxed);
        self.flush_manifest().await;

        // Orphan sweep: files on disk the manifest does not know about.
        let root = self.root.clone();
        let orphans = tokio::task::spawn_blocking(move || {
            remove_cache_files_sync(&root, Some(&known))
        })
        .await;
        let removed_orphans = match orphans {
            Ok(Ok(count)) => count,
            Ok(Err(e)) => {
                log::warn!("artwork orphan sweep failed: {e}");
                0
            }
            Err(e) => {
                log::warn!("artwork orphan sweep join failed: {e}");
                0
            }
        };

        self.stats.maintenance_runs.fetch_add(1, Ordering::Relaxed);
        self.stats
            .removed_age
            .fetch_add(plan.removed_age as u64, Ordering::Relaxed);
        self.stats
            .removed_size
            .fetch_add(plan.removed_size as u64, Ordering::Relaxed);
        self.stats
            .removed_orphans
            .fetch_add(removed_orphans, Ordering::Relaxed);

        if plan.removed_age + plan.removed_size > 0 || removed_orphans > 0 {
            log::info!(
                "artwork disk maintenance removed {} records (age={}, size={}) and {} orphans, usage now {}",
                plan.removed_age + plan.removed_size,
                plan.removed_age,
                plan.removed_size,
                removed_orphans,
                ByteSize::from_bytes(total_bytes),
            );
        }
    }

    /// Manifest record for `key`, if any.
    pub async fn record(&self, key: &ArtworkKey) -> Option<DiskRecord> {
        let guard = self.manifest.lock().await;
        guard.get(&key_hash_for(key)).cloned()
    }

    async fn maybe_touch(&self, key_hash: &str) {
        let one_in = self.limits.touch_one_in.max(1);
        if rand::rng().random_range(0..one_in) != 0 {
            return;
        }
        let touched = {
            let mut guard = self.manifest.lock().await;
            guard.touch(key_hash, Utc::now())
        };
        if touched {
            self.stats.touches.fetch_add(1, Ordering::Relaxed);
            self.flush_manifest().await;
        }
    }

    async fn flush_manifest(&self) {
        let snapshot = {
            let mut guard = self.manifest.lock().await;
            guard.prepare_flush()
        };
        let Some((path, bytes)) = snapshot else { return };

        let result = tokio::task::spawn_blocking(move || {
            write_snapshot_sync(&path, &bytes)
        })
        .await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                log::warn!("artwork manifest flush failed: {e}");
                self.manifest.lock().await.mark_dirty();
            }
            Err(e) => {
                log::warn!("artwork manifest flush join failed: {e}");
                self.manifest.lock().await.mark_dirty();
            }
        }
    }

    fn add_usage(&self, bytes: u64) {
        self.usage_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    fn sub_usage(&self, bytes: u64) {
        let mut current = self.usage_bytes.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_sub(bytes);
            match self.usage_bytes.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    #[cfg(test)]
    async fn backdate_created_for_tests(
        &self,
        key: &ArtworkKey,
        created_at: chrono::DateTime<Utc>,
    ) {
        {
            let mut guard = self.manifest.lock().await;
            guard.backdate_created(&key_hash_for(key), created_at);
        }
        self.flush_manifest().await;
    }

    #[cfg(test)]
    async fn backdate_access_for_tests(
        &self,
        key: &ArtworkKey,
        last_accessed: chrono::DateTime<Utc>,
    ) {
        {
            let mut guard = self.manifest.lock().await;
            guard.touch(&key_hash_for(key), last_accessed);
        }
        self.flush_manifest().await;
    }
}

/// Filesystem-safe, collision-resistant name for a cache key.
pub(crate) fn key_hash_for(key: &ArtworkKey) -> String {
    let digest = sha2::Sha256::digest(key.cache_string().as_bytes());
    hex_encode(&digest)
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        use std::fmt::Write as _;
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}

fn max_age_delta(limits: &DiskLimits) -> TimeDelta {
    TimeDelta::from_std(limits.max_age).unwrap_or(TimeDelta::MAX)
}

fn encode_jpeg(image: &RgbaImage, quality: u8) -> anyhow::Result<Vec<u8>> {
    // JPEG has no alpha channel; artwork is opaque anyway.
    let rgb = DynamicImage::ImageRgba8(image.clone()).to_rgb8();
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(Cursor::new(&mut out), quality)
        .write_image(
            rgb.as_raw(),
            rgb.width(),
            rgb.height(),
            ExtendedColorType::Rgb8,
        )?;
    Ok(out)
}

async fn write_file_atomic(
    root: &Path,
    filename: &str,
    bytes: &[u8],
) -> std::io::Result<()> {
    let tmp = root.join(format!("{filename}.tmp"));
    let target = root.join(filename);
    tokio::fs::write(&tmp, bytes).await?;
    match tokio::fs::rename(&tmp, &target).await {
        Ok(()) => Ok(()),
        Err(e) => {
            let _ = tokio::fs::remove_file(&tmp).await;
            Err(e)
        }
    }
}

/// Delete cache files under `root`, skipping the manifest and in-progress
/// tmp files. With `keep` set, only files outside that set are removed
/// (orphan sweep); with `None`, everything goes (clear).
fn remove_cache_files_sync(
    root: &Path,
    keep: Option<&std::collections::HashSet<String>>,
) -> anyhow::Result<u64> {
    let mut removed = 0u64;
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if name == MANIFEST_FILE_NAME || name.ends_with(".tmp") {
            continue;
        }
        if let Some(keep) = keep
            && keep.contains(name)
        {
            continue;
        }
        match std::fs::remove_file(entry.path()) {
            Ok(()) => removed += 1,
            Err(e) => {
                log::warn!(
                    "artwork cache file delete failed; file={name}, err={e}"
                );
            }
        }
    }
    Ok(removed)
}

/// Construction-time maintenance: enforce the age and size budgets before
/// the store starts serving, using the same planner as the async pass.
fn maintenance_sync(
    root: &Path,
    limits: &DiskLimits,
    manifest: &mut Manifest,
) {
    let now = Utc::now();
    let plan = plan_evictions(
        manifest.records().cloned().collect(),
        now,
        max_age_delta(limits),
        limits.max_bytes.as_bytes(),
    );

    for planned in &plan.planned {
        if let Err(e) = std::fs::remove_file(root.join(&planned.filename))
            && e.kind() != std::io::ErrorKind::NotFound
        {
            log::warn!(
                "artwork init eviction failed; file={}, err={e}",
                planned.filename
            );
            continue;
        }
        manifest.remove(&planned.key_hash);
    }

    let known = manifest.known_filenames();
    match remove_cache_files_sync(root, Some(&known)) {
        Ok(removed) if removed > 0 => {
            log::info!("artwork init removed {removed} orphan files");
        }
        Ok(_) => {}
        Err(e) => log::warn!("artwork init orphan sweep failed: {e}"),
    }

    if let Some((path, bytes)) = manifest.prepare_flush()
        && let Err(e) = write_snapshot_sync(&path, &bytes)
    {
        log::warn!("artwork init manifest persist failed: {e}");
        manifest.mark_dirty();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use resona_model::{ArtworkKind, Resolution};
    use std::time::Duration;
    use tempfile::tempdir;

    fn limits() -> DiskLimits {
        DiskLimits {
            max_bytes: ByteSize::from_mib(64),
            max_age: Duration::from_secs(30 * 24 * 60 * 60),
            touch_one_in: 20,
            jpeg_quality: 92,
        }
    }

    fn key(id: &str, px: u32) -> ArtworkKey {
        ArtworkKey::new(ArtworkKind::Album, id, Resolution::new(px))
    }

    fn solid_image(px: u32, value: u8) -> Arc<RgbaImage> {
        Arc::new(RgbaImage::from_pixel(
            px,
            px,
            image::Rgba([value, value / 2, 255 - value, 255]),
        ))
    }

    fn open_store(dir: &Path, limits: DiskLimits) -> Arc<DiskStore> {
        Arc::new(DiskStore::try_new(dir.join("artwork"), limits).unwrap())
    }

    #[tokio::test]
    async fn put_then_get_round_trips_and_records_encoded_size() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path(), limits());
        let key = key("abc", 64);

        store.put(&key, solid_image(64, 120)).await;

        let bytes = store.get(&key).await.expect("disk hit");
        assert!(!bytes.is_empty());
        let decoded = image::load_from_memory(&bytes).expect("valid jpeg");
        assert_eq!(decoded.width(), 64);

        let record = store.record(&key).await.expect("record exists");
        assert_eq!(record.size_bytes, bytes.len() as u64);
        assert_eq!(store.usage().as_bytes(), record.size_bytes);
    }

    #[tokio::test]
    async fn records_survive_restart() {
        let dir = tempdir().unwrap();
        let key = key("abc", 64);
        {
            let store = open_store(dir.path(), limits());
            store.put(&key, solid_image(64, 10)).await;
        }
        let store = open_store(dir.path(), limits());
        assert!(store.get(&key).await.is_some());
    }

    #[tokio::test]
    async fn missing_file_heals_stale_record() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path(), limits());
        let key = key("abc", 64);

        store.put(&key, solid_image(64, 10)).await;
        let record = store.record(&key).await.unwrap();
        std::fs::remove_file(store.root().join(&record.filename)).unwrap();

        assert!(store.get(&key).await.is_none());
        assert!(store.record(&key).await.is_none());
        assert_eq!(store.usage().as_bytes(), 0);
        assert_eq!(store.stats_snapshot().self_heals, 1);
    }

    #[tokio::test]
    async fn maintenance_sweeps_orphan_files() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path(), limits());
        store.put(&key("keep", 64), solid_image(64, 10)).await;

        let orphan = store.root().join("deadbeef.jpg");
        std::fs::write(&orphan, b"stray").unwrap();

        store.perform_maintenance().await;

        assert!(!orphan.exists());
        assert!(store.get(&key("keep", 64)).await.is_some());
        assert_eq!(store.stats_snapshot().removed_orphans, 1);
    }

    #[tokio::test]
    async fn maintenance_removes_expired_records_even_under_budget() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path(), limits());
        let old = key("old", 64);
        let fresh = key("fresh", 64);

        store.put(&old, solid_image(64, 10)).await;
        store.put(&fresh, solid_image(64, 200)).await;
        store
            .backdate_created_for_tests(&old, Utc::now() - TimeDelta::days(31))
            .await;

        store.perform_maintenance().await;

        assert!(store.record(&old).await.is_none());
        assert!(store.get(&fresh).await.is_some());
        assert_eq!(store.stats_snapshot().removed_age, 1);
    }

    #[tokio::test]
    async fn maintenance_evicts_least_recently_accessed_to_low_water() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path(), limits());

        let keys: Vec<ArtworkKey> =
            (0..6).map(|i| key(&format!("a{i}"), 64)).collect();
        for (i, k) in keys.iter().enumerate() {
            store.put(k, solid_image(64, (i * 40) as u8)).await;
        }
        // a0 and a1 are the coldest; the rest were accessed just now.
        let now = Utc::now();
        store.backdate_access_for_tests(&keys[0], now - TimeDelta::days(9)).await;
        store.backdate_access_for_tests(&keys[1], now - TimeDelta::days(8)).await;

        // Shrink the budget below current usage and re-open so the limits
        // apply, then run maintenance.
        let usage = store.usage().as_bytes();
        drop(store);
        let mut small = limits();
        small.max_bytes = ByteSize::from_bytes(usage - 1);
        let store = open_store(dir.path(), small);

        store.perform_maintenance().await;

        let low_water = eviction::low_water_bytes(usage - 1);
        assert!(store.usage().as_bytes() <= low_water);
        assert!(store.record(&keys[0]).await.is_none());
        assert!(store.record(&keys[5]).await.is_some());
    }

    #[tokio::test]
    async fn clear_twice_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path(), limits());
        store.put(&key("abc", 64), solid_image(64, 10)).await;

        store.clear().await;
        store.clear().await;

        assert!(store.get(&key("abc", 64)).await.is_none());
        assert_eq!(store.usage().as_bytes(), 0);
        // Only the manifest is left in the cache directory.
        let leftover: Vec<_> = std::fs::read_dir(store.root())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| {
                e.file_name().to_str() != Some(MANIFEST_FILE_NAME)
            })
            .collect();
        assert!(leftover.is_empty(), "unexpected files: {leftover:?}");
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path(), limits());
        let key = key("abc", 64);
        store.put(&key, solid_image(64, 10)).await;

        store.remove(&key).await;
        store.remove(&key).await;
        assert!(store.get(&key).await.is_none());
    }

    #[tokio::test]
    async fn restart_enforces_budget_at_init() {
        let dir = tempdir().unwrap();
        {
            let store = open_store(dir.path(), limits());
            for i in 0..5u32 {
                store
                    .put(
                        &key(&format!("a{i}"), 64),
                        solid_image(64, (i * 50) as u8),
                    )
                    .await;
            }
        }

        let mut small = limits();
        small.max_bytes = ByteSize::from_bytes(1);
        let store = open_store(dir.path(), small);
        assert_eq!(store.usage().as_bytes(), 0);
    }
}
