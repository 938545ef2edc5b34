//! Load coordination: tier-ordered lookup with request coalescing.
//!
//! The coordinator is the single entry point the UI loads artwork through.
//! Lookup order is memory, disk, downscale-reuse, network; at most one
//! network fetch is ever in flight per cache key, and every caller that
//! arrives while that fetch runs observes its one outcome.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use image::imageops::FilterType;
use image::{DynamicImage, RgbaImage};
use resona_model::{ArtworkKey, Resolution};
use tokio::sync::{Mutex, broadcast};

use crate::disk::DiskStore;
use crate::error::ArtworkError;
use crate::memory::MemoryStore;
use crate::transport::ArtworkTransport;

type LoadOutcome = Result<Arc<RgbaImage>, ArtworkError>;

/// Transient per-key load state exposed to the UI.
///
/// Absence from the state map means idle: either never requested, or the
/// last load succeeded. A failed key stays `Failed` until a fresh load
/// attempt replaces it with `Loading`; errors are never auto-retried.
#[derive(Debug, Clone)]
pub enum LoadState {
    Loading,
    Failed(String),
}

#[derive(Debug, Clone, Copy)]
pub struct LoaderStatsSnapshot {
    pub memory_hits: u64,
    pub disk_hits: u64,
    pub downscale_hits: u64,
    pub fetches: u64,
    pub fetch_failures: u64,
    pub coalesced_waits: u64,
}

#[derive(Debug, Default)]
struct LoaderStats {
    memory_hits: AtomicU64,
    disk_hits: AtomicU64,
    downscale_hits: AtomicU64,
    fetches: AtomicU64,
    fetch_failures: AtomicU64,
    coalesced_waits: AtomicU64,
}

/// Tier-ordered artwork loader with per-key request coalescing.
#[derive(Debug)]
pub struct ArtworkLoader {
    memory: Arc<MemoryStore>,
    disk: Arc<DiskStore>,
    transport: Arc<dyn ArtworkTransport>,
    states: DashMap<ArtworkKey, LoadState>,
    in_flight: Mutex<HashMap<ArtworkKey, broadcast::Sender<LoadOutcome>>>,
    stagger_step: Duration,
    stats: LoaderStats,
}

impl ArtworkLoader {
    pub fn new(
        memory: Arc<MemoryStore>,
        disk: Arc<DiskStore>,
        transport: Arc<dyn ArtworkTransport>,
        stagger_step: Duration,
    ) -> Self {
        Self {
            memory,
            disk,
            transport,
            states: DashMap::new(),
            in_flight: Mutex::new(HashMap::new()),
            stagger_step,
            stats: LoaderStats::default(),
        }
    }

    /// Load artwork, consulting each tier in order.
    ///
    /// Returns `None` for invalid requests, for transport/decode failures
    /// (the error is readable via [`error`](Self::error)), and for waiters
    /// whose shared fetch failed. A failure is terminal for that attempt;
    /// calling again starts a fresh one.
    pub async fn load(
        self: &Arc<Self>,
        key: &ArtworkKey,
    ) -> Option<Arc<RgbaImage>> {
        if key.resolution.is_zero() || key.id.is_blank() {
            log::debug!("rejecting invalid artwork request: {key}");
            return None;
        }

        if let Some(image) = self.lookup_cached(key).await {
            return Some(image);
        }

        self.load_coalesced(key).await
    }

    /// Like [`load`](Self::load), delayed by `index` stagger steps.
    ///
    /// Smooths the burst a freshly rendered list fires at the server; a
    /// courtesy, not a correctness requirement.
    pub async fn load_staggered(
        self: &Arc<Self>,
        key: &ArtworkKey,
        index: usize,
    ) -> Option<Arc<RgbaImage>> {
        let delay = self
            .stagger_step
            .saturating_mul(u32::try_from(index).unwrap_or(u32::MAX));
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.load(key).await
    }

    pub fn is_loading(&self, key: &ArtworkKey) -> bool {
        matches!(
            self.states.get(key).map(|s| s.clone()),
            Some(LoadState::Loading)
        )
    }

    pub fn error(&self, key: &ArtworkKey) -> Option<String> {
        match self.states.get(key).map(|s| s.clone()) {
            Some(LoadState::Failed(message)) => Some(message),
            _ => None,
        }
    }

    /// Forget all transient loading/error state (cache-wide reset).
    pub fn clear_states(&self) {
        self.states.clear();
    }

    pub fn stats_snapshot(&self) -> LoaderStatsSnapshot {
        LoaderStatsSnapshot {
            memory_hits: self.stats.memory_hits.load(Ordering::Relaxed),
            disk_hits: self.stats.disk_hits.load(Ordering::Relaxed),
            downscale_hits: self.stats.downscale_hits.load(Ordering::Relaxed),
            fetches: self.stats.fetches.load(Ordering::Relaxed),
            fetch_failures: self.stats.fetch_failures.load(Ordering::Relaxed),
            coalesced_waits: self.stats.coalesced_waits.load(Ordering::Relaxed),
        }
    }

    /// Memory, disk, and downscale-reuse tiers, in that order.
    async fn lookup_cached(
        &self,
        key: &ArtworkKey,
    ) -> Option<Arc<RgbaImage>> {
        if let Some(image) = self.memory.get(key) {
            self.stats.memory_hits.fetch_add(1, Ordering::Relaxed);
            return Some(image);
        }

        if let Some(bytes) = self.disk.get(key).await {
            match decode_rgba(bytes).await {
                Ok(image) => {
                    let image = Arc::new(image);
                    self.memory.put(key.clone(), Arc::clone(&image));
                    self.stats.disk_hits.fetch_add(1, Ordering::Relaxed);
                    return Some(image);
                }
                Err(e) => {
                    // Corrupt file: drop it and fall through to network.
                    log::warn!(
                        "cached artwork failed to decode; key={key}, err={e}"
                    );
                    self.disk.remove(key).await;
                }
            }
        }

        if let Some((source_resolution, source)) =
            self.memory.smallest_above(key)
        {
            if let Some(scaled) =
                downscale(source, key.resolution).await
            {
                log::trace!(
                    "downscaled {key} from resident {source_resolution}"
                );
                let scaled = Arc::new(scaled);
                self.memory.put(key.clone(), Arc::clone(&scaled));
                self.stats.downscale_hits.fetch_add(1, Ordering::Relaxed);
                return Some(scaled);
            }
        }

        None
    }

    /// Join the in-flight fetch for `key`, starting one if none exists.
    async fn load_coalesced(
        self: &Arc<Self>,
        key: &ArtworkKey,
    ) -> Option<Arc<RgbaImage>> {
        let mut rx = {
            let mut guard = self.in_flight.lock().await;
            match guard.get(key) {
                Some(tx) => {
                    self.stats.coalesced_waits.fetch_add(1, Ordering::Relaxed);
                    tx.subscribe()
                }
                None => {
                    let (tx, rx) = broadcast::channel(1);
                    guard.insert(key.clone(), tx.clone());
                    self.states.insert(key.clone(), LoadState::Loading);

                    // The fetch is detached from this caller: once started
                    // it runs to completion even if every waiter goes away.
                    let loader = Arc::clone(self);
                    let key = key.clone();
                    tokio::spawn(async move {
                        loader.run_fetch(key, tx).await;
                    });
                    rx
                }
            }
        };

        match rx.recv().await {
            Ok(Ok(image)) => Some(image),
            Ok(Err(_)) => None,
            // Sender dropped without a result; the next explicit load
            // starts a fresh attempt.
            Err(_) => None,
        }
    }

    async fn run_fetch(
        self: Arc<Self>,
        key: ArtworkKey,
        tx: broadcast::Sender<LoadOutcome>,
    ) {
        let outcome = self.fetch_and_store(&key).await;

        // Drop the token before broadcasting so a late arrival that missed
        // the broadcast finds no token and re-runs the tier lookup, which
        // the store below has already populated on success.
        {
            let mut guard = self.in_flight.lock().await;
            guard.remove(&key);
        }

        match &outcome {
            Ok(_) => {
                self.states.remove(&key);
            }
            Err(e) => {
                self.stats.fetch_failures.fetch_add(1, Ordering::Relaxed);
                self.states
                    .insert(key.clone(), LoadState::Failed(e.to_string()));
            }
        }

        let _ = tx.send(outcome);
    }

    async fn fetch_and_store(&self, key: &ArtworkKey) -> LoadOutcome {
        // A racing caller may have finished populating the cache between
        // our tier lookup and acquiring the token.
        if let Some(image) = self.memory.get(key) {
            return Ok(image);
        }

        self.stats.fetches.fetch_add(1, Ordering::Relaxed);
        let bytes = self
            .transport
            .fetch_artwork(key.kind, &key.id, key.resolution)
            .await?;

        let image = Arc::new(decode_rgba(bytes).await?);
        self.memory.put(key.clone(), Arc::clone(&image));
        self.disk.put(key, Arc::clone(&image)).await;
        Ok(image)
    }
}

async fn decode_rgba(bytes: Vec<u8>) -> Result<RgbaImage, ArtworkError> {
    tokio::task::spawn_blocking(move || {
        image::load_from_memory(&bytes)
            .map(|img| img.to_rgba8())
            .map_err(|e| ArtworkError::Decode(e.to_string()))
    })
    .await
    .map_err(|e| ArtworkError::Decode(format!("decode task failed: {e}")))?
}

async fn downscale(
    source: Arc<RgbaImage>,
    target: Resolution,
) -> Option<RgbaImage> {
    let result = tokio::task::spawn_blocking(move || {
        let px = target.px();
        DynamicImage::ImageRgba8((*source).clone())
            .resize(px, px, FilterType::Triangle)
            .to_rgba8()
    })
    .await;
    match result {
        Ok(scaled) => Some(scaled),
        Err(e) => {
            log::warn!("artwork downscale task failed: {e}");
            None
        }
    }
}
