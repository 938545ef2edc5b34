//! Shared domain types for the Resona music streaming client.
//!
//! This crate is deliberately free of I/O: it holds the value types the
//! client crates agree on, most importantly the artwork addressing types
//! used by the tiered artwork cache.

pub mod artwork;

pub use artwork::{
    ArtworkId, ArtworkKey, ArtworkKind, COMMON_RESOLUTIONS, Resolution,
};
