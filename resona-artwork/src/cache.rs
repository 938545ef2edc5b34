//! The one object the client application holds: wires the tiers, the load
//! coordinator, and the preload orchestrator together and exposes the
//! lifecycle signals the UI shell forwards.

use std::path::PathBuf;
use std::sync::Arc;

use image::RgbaImage;
use resona_model::{ArtworkId, ArtworkKey, ArtworkKind, Resolution};

use crate::config::ArtworkCacheConfig;
use crate::disk::{DiskStore, DiskStoreStatsSnapshot};
use crate::generation::CacheGeneration;
use crate::loader::{ArtworkLoader, LoaderStatsSnapshot};
use crate::memory::{MemoryStore, MemoryStoreStatsSnapshot};
use crate::preload::{PreloadPolicy, Preloader};
use crate::transport::ArtworkTransport;

/// Point-in-time counters across all tiers, for diagnostics overlays.
#[derive(Debug, Clone, Copy)]
pub struct ArtworkCacheStats {
    pub memory: MemoryStoreStatsSnapshot,
    pub disk: DiskStoreStatsSnapshot,
    pub loader: LoaderStatsSnapshot,
}

/// Tiered artwork cache: memory, disk, then the remote server.
///
/// Cheap to clone by wrapping in `Arc`; every method takes `&self` and is
/// safe to call from any task.
#[derive(Debug)]
pub struct ArtworkCache {
    generation: Arc<CacheGeneration>,
    memory: Arc<MemoryStore>,
    disk: Arc<DiskStore>,
    loader: Arc<ArtworkLoader>,
    preloader: Preloader,
}

impl ArtworkCache {
    /// Open the cache rooted at `root`.
    ///
    /// Creates the directory if needed and runs disk maintenance before
    /// returning, so the store starts under budget.
    pub fn try_new(
        root: PathBuf,
        transport: Arc<dyn ArtworkTransport>,
        config: ArtworkCacheConfig,
    ) -> anyhow::Result<Self> {
        let generation = Arc::new(CacheGeneration::default());
        let memory = Arc::new(MemoryStore::new(
            config.album_memory,
            config.artist_memory,
            Arc::clone(&generation),
        ));
        let disk = Arc::new(DiskStore::try_new(root, config.disk)?);
        let loader = Arc::new(ArtworkLoader::new(
            Arc::clone(&memory),
            Arc::clone(&disk),
            transport,
            config.stagger_step,
        ));
        let preloader = Preloader::new(Arc::clone(&loader), config.preload);

        Ok(Self {
            generation,
            memory,
            disk,
            loader,
            preloader,
        })
    }

    /// Load one piece of artwork, consulting memory, disk, downscale-reuse,
    /// and finally the network.
    pub async fn load(
        self: &Arc<Self>,
        kind: ArtworkKind,
        id: impl Into<ArtworkId>,
        resolution: Resolution,
    ) -> Option<Arc<RgbaImage>> {
        let key = ArtworkKey::new(kind, id, resolution);
        self.loader.load(&key).await
    }

    /// Like [`load`](Self::load), delayed by `index` stagger steps so a
    /// freshly rendered list does not fire its whole burst at once.
    pub async fn load_staggered(
        self: &Arc<Self>,
        kind: ArtworkKind,
        id: impl Into<ArtworkId>,
        resolution: Resolution,
        index: usize,
    ) -> Option<Arc<RgbaImage>> {
        let key = ArtworkKey::new(kind, id, resolution);
        self.loader.load_staggered(&key, index).await
    }

    /// Warm the cache for a batch of identifiers under the given policy.
    pub async fn preload(
        &self,
        kind: ArtworkKind,
        ids: &[ArtworkId],
        resolution: Resolution,
        policy: PreloadPolicy,
    ) {
        self.preloader.preload(kind, ids, resolution, policy).await;
    }

    /// Whether a load for this exact key is currently in flight.
    pub fn is_loading(&self, key: &ArtworkKey) -> bool {
        self.loader.is_loading(key)
    }

    /// The terminal error of the last failed load for this key, if any.
    pub fn error(&self, key: &ArtworkKey) -> Option<String> {
        self.loader.error(key)
    }

    /// Current cache generation; observers diff this between frames.
    pub fn generation(&self) -> u64 {
        self.generation.current()
    }

    /// The OS reported memory pressure: drop every decoded bitmap.
    ///
    /// Disk records are untouched, so the next loads promote from disk
    /// rather than the network.
    pub fn on_memory_pressure(&self) {
        log::info!("artwork cache dropping memory tier under pressure");
        self.memory.clear();
    }

    /// The application returned to the foreground: the generation bumps so
    /// views re-query state, without discarding anything.
    pub fn on_foreground_resume(&self) {
        self.generation.bump();
    }

    /// Run a disk maintenance pass now (age sweep, LRU sweep, orphans).
    pub async fn perform_maintenance(&self) {
        self.disk.perform_maintenance().await;
    }

    /// Wipe both cache tiers and all transient load state, e.g. when the
    /// user switches server profiles.
    pub async fn reset(&self) {
        self.memory.clear();
        self.disk.clear().await;
        self.loader.clear_states();
        self.preloader.reset();
        self.generation.bump();
        log::info!("artwork cache reset");
    }

    pub fn stats(&self) -> ArtworkCacheStats {
        ArtworkCacheStats {
            memory: self.memory.stats_snapshot(),
            disk: self.disk.stats_snapshot(),
            loader: self.loader.stats_snapshot(),
        }
    }

    pub fn memory(&self) -> &MemoryStore {
        &self.memory
    }

    pub fn disk(&self) -> &DiskStore {
        &self.disk
    }
}
