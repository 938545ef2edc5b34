//! Tiered artwork cache for the Resona client.
//!
//! Decoded bitmaps live in a bounded in-memory tier, encoded JPEGs in a
//! budget-maintained on-disk tier, and misses are fetched from the server
//! with per-key request coalescing. The [`ArtworkCache`] facade is the
//! single object the application holds.
//!
//! ```no_run
//! use std::sync::Arc;
//! use resona_artwork::{
//!     ArtworkCache, ArtworkCacheConfig, HttpArtworkTransport,
//! };
//! use resona_model::{ArtworkKind, Resolution};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let transport =
//!     Arc::new(HttpArtworkTransport::try_new("https://music.local:8443")?);
//! let cache = Arc::new(ArtworkCache::try_new(
//!     dirs_path(),
//!     transport,
//!     ArtworkCacheConfig::defaults(),
//! )?);
//!
//! let image = cache
//!     .load(ArtworkKind::Album, "abc-123", Resolution::new(200))
//!     .await;
//! # drop(image);
//! # Ok(())
//! # }
//! # fn dirs_path() -> std::path::PathBuf { std::path::PathBuf::new() }
//! ```

mod cache;
pub mod config;
mod disk;
mod error;
mod generation;
mod loader;
mod memory;
mod preload;
mod transport;
mod units;

pub use cache::{ArtworkCache, ArtworkCacheStats};
pub use config::{
    ArtworkCacheConfig, DiskLimits, MemoryBudget, PreloadLimits,
};
pub use disk::{DiskStore, DiskStoreStatsSnapshot};
pub use error::ArtworkError;
pub use generation::CacheGeneration;
pub use loader::{ArtworkLoader, LoadState, LoaderStatsSnapshot};
pub use memory::{MemoryStore, MemoryStoreStatsSnapshot};
pub use preload::{PreloadPolicy, Preloader};
pub use transport::{ArtworkTransport, HttpArtworkTransport};
pub use units::ByteSize;
