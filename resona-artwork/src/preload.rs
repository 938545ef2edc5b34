//! Proactive cache warming for batches of identifiers.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::future::join_all;
use parking_lot::Mutex;
use resona_model::{ArtworkId, ArtworkKey, ArtworkKind, Resolution};
use sha2::Digest;
use tokio::sync::Semaphore;

use crate::config::PreloadLimits;
use crate::loader::ArtworkLoader;

/// How eagerly a preload batch hits the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreloadPolicy {
    /// Above-the-fold content: only the first few items, fully parallel.
    Immediate,
    /// Whole batch, bounded by a counting semaphore so a large batch
    /// cannot saturate the link.
    UserInitiated,
    /// Large low-priority batches: strictly sequential with a fixed
    /// inter-item delay.
    Background,
}

type BatchFingerprint = [u8; 32];

/// Warms the cache for a visible or soon-to-be-visible identifier set.
///
/// Re-issuing the same batch (same identifier set, kind, and resolution)
/// is a no-op; issuing a different batch cooperatively cancels the previous
/// one — in-flight loads finish, but no further items from the stale batch
/// are scheduled.
#[derive(Debug)]
pub struct Preloader {
    loader: Arc<ArtworkLoader>,
    limits: PreloadLimits,
    semaphore: Arc<Semaphore>,
    last_fingerprint: Mutex<Option<BatchFingerprint>>,
    epoch: AtomicU64,
}

impl Preloader {
    pub fn new(loader: Arc<ArtworkLoader>, limits: PreloadLimits) -> Self {
        Self {
            loader,
            limits,
            semaphore: Arc::new(Semaphore::new(limits.max_concurrent.max(1))),
            last_fingerprint: Mutex::new(None),
            epoch: AtomicU64::new(0),
        }
    }

    pub async fn preload(
        &self,
        kind: ArtworkKind,
        ids: &[ArtworkId],
        resolution: Resolution,
        policy: PreloadPolicy,
    ) {
        let ids = dedupe(ids);
        if ids.is_empty() || resolution.is_zero() {
            return;
        }

        let fingerprint = fingerprint_for(kind, &ids, resolution);
        {
            let mut last = self.last_fingerprint.lock();
            if *last == Some(fingerprint) {
                log::trace!(
                    "skipping duplicate preload of {} {kind} items",
                    ids.len()
                );
                return;
            }
            *last = Some(fingerprint);
        }
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;

        log::debug!(
            "preloading {} {kind} items at {resolution} ({policy:?})",
            ids.len()
        );
        match policy {
            PreloadPolicy::Immediate => {
                self.run_immediate(kind, &ids, resolution).await;
            }
            PreloadPolicy::UserInitiated => {
                self.run_bounded(kind, &ids, resolution, epoch).await;
            }
            PreloadPolicy::Background => {
                self.run_sequential(kind, &ids, resolution, epoch).await;
            }
        }
    }

    /// Forget the last batch fingerprint so the next preload always runs
    /// (cache-wide reset).
    pub fn reset(&self) {
        *self.last_fingerprint.lock() = None;
        self.epoch.fetch_add(1, Ordering::SeqCst);
    }

    fn is_stale(&self, epoch: u64) -> bool {
        self.epoch.load(Ordering::SeqCst) != epoch
    }

    async fn run_immediate(
        &self,
        kind: ArtworkKind,
        ids: &[ArtworkId],
        resolution: Resolution,
    ) {
        let slice = &ids[..ids.len().min(self.limits.burst_size)];
        let loads = slice.iter().map(|id| {
            let key = ArtworkKey::new(kind, id.clone(), resolution);
            let loader = Arc::clone(&self.loader);
            async move {
                loader.load(&key).await;
            }
        });
        join_all(loads).await;
    }

    async fn run_bounded(
        &self,
        kind: ArtworkKind,
        ids: &[ArtworkId],
        resolution: Resolution,
        epoch: u64,
    ) {
        let loads = ids.iter().map(|id| {
            let key = ArtworkKey::new(kind, id.clone(), resolution);
            let loader = Arc::clone(&self.loader);
            let semaphore = Arc::clone(&self.semaphore);
            async move {
                let Ok(_permit) = semaphore.acquire().await else {
                    return;
                };
                if self.is_stale(epoch) {
                    return;
                }
                loader.load(&key).await;
            }
        });
        join_all(loads).await;
    }

    async fn run_sequential(
        &self,
        kind: ArtworkKind,
        ids: &[ArtworkId],
        resolution: Resolution,
        epoch: u64,
    ) {
        for (index, id) in ids.iter().enumerate() {
            if self.is_stale(epoch) {
                log::debug!(
                    "background preload superseded after {index} items"
                );
                return;
            }
            let key = ArtworkKey::new(kind, id.clone(), resolution);
            self.loader.load(&key).await;
            tokio::time::sleep(self.limits.inter_item_delay).await;
        }
    }
}

/// Fingerprint of the requested batch: order-insensitive over the
/// identifier set, sensitive to kind and resolution.
fn fingerprint_for(
    kind: ArtworkKind,
    ids: &[ArtworkId],
    resolution: Resolution,
) -> BatchFingerprint {
    let mut sorted: Vec<&ArtworkId> = ids.iter().collect();
    sorted.sort();

    let mut hasher = sha2::Sha256::new();
    hasher.update(kind.as_str().as_bytes());
    hasher.update(resolution.px().to_le_bytes());
    for id in sorted {
        hasher.update(id.as_str().as_bytes());
        hasher.update([0u8]);
    }
    hasher.finalize().into()
}

fn dedupe(ids: &[ArtworkId]) -> Vec<ArtworkId> {
    let mut seen = std::collections::HashSet::new();
    ids.iter()
        .filter(|id| !id.is_blank())
        .filter(|id| seen.insert((*id).clone()))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(names: &[&str]) -> Vec<ArtworkId> {
        names.iter().map(|n| ArtworkId::new(*n)).collect()
    }

    #[test]
    fn fingerprint_ignores_order_and_duplicates() {
        let a = fingerprint_for(
            ArtworkKind::Album,
            &dedupe(&ids(&["x", "y", "z"])),
            Resolution::new(200),
        );
        let b = fingerprint_for(
            ArtworkKind::Album,
            &dedupe(&ids(&["z", "x", "y", "x"])),
            Resolution::new(200),
        );
        assert_eq!(a, b);
    }

    #[test]
    fn fingerprint_distinguishes_kind_and_resolution() {
        let base = fingerprint_for(
            ArtworkKind::Album,
            &ids(&["x"]),
            Resolution::new(200),
        );
        assert_ne!(
            base,
            fingerprint_for(
                ArtworkKind::Artist,
                &ids(&["x"]),
                Resolution::new(200)
            )
        );
        assert_ne!(
            base,
            fingerprint_for(
                ArtworkKind::Album,
                &ids(&["x"]),
                Resolution::new(400)
            )
        );
    }

    #[test]
    fn dedupe_drops_blanks() {
        let deduped = dedupe(&ids(&["a", "", "  ", "a", "b"]));
        assert_eq!(deduped, ids(&["a", "b"]));
    }
}
