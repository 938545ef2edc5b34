use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};

/// Which artwork family an image belongs to.
///
/// Album covers and artist portraits live in separate memory partitions and
/// are fetched from different server endpoints, so the kind is part of every
/// cache key.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ArtworkKind {
    Album,
    Artist,
}

impl ArtworkKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            ArtworkKind::Album => "album",
            ArtworkKind::Artist => "artist",
        }
    }
}

impl Display for ArtworkKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque server-side identifier for an album or artist.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ArtworkId(String);

impl ArtworkId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Blank identifiers are rejected before any tier lookup.
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl Display for ArtworkId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ArtworkId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for ArtworkId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Target edge length in pixels for a rendered artwork variant.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
)]
#[serde(transparent)]
pub struct Resolution(u32);

impl Resolution {
    pub const fn new(px: u32) -> Self {
        Self(px)
    }

    pub const fn px(self) -> u32 {
        self.0
    }

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl Display for Resolution {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}px", self.0)
    }
}

/// The resolutions UI surfaces actually request, ascending.
///
/// Downscale-reuse walks this ladder looking for a cached variant of the
/// same artwork at a higher rung.
pub const COMMON_RESOLUTIONS: [Resolution; 9] = [
    Resolution::new(80),
    Resolution::new(100),
    Resolution::new(150),
    Resolution::new(200),
    Resolution::new(240),
    Resolution::new(300),
    Resolution::new(400),
    Resolution::new(800),
    Resolution::new(1000),
];

/// Composite key naming one cacheable artwork variant.
///
/// Used directly as the map key in the memory tier and hashed into a
/// filesystem-safe name for the disk tier.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
pub struct ArtworkKey {
    pub kind: ArtworkKind,
    pub id: ArtworkId,
    pub resolution: Resolution,
}

impl ArtworkKey {
    pub fn new(
        kind: ArtworkKind,
        id: impl Into<ArtworkId>,
        resolution: Resolution,
    ) -> Self {
        Self {
            kind,
            id: id.into(),
            resolution,
        }
    }

    /// Stable textual form fed to the content hash for disk filenames.
    pub fn cache_string(&self) -> String {
        format!("{}/{}@{}", self.kind, self.id, self.resolution.px())
    }

    /// Same artwork at a different resolution.
    pub fn at_resolution(&self, resolution: Resolution) -> Self {
        Self {
            kind: self.kind,
            id: self.id.clone(),
            resolution,
        }
    }
}

impl Display for ArtworkKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.cache_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_string_is_stable() {
        let key = ArtworkKey::new(
            ArtworkKind::Album,
            "abc-123",
            Resolution::new(200),
        );
        assert_eq!(key.cache_string(), "album/abc-123@200");
    }

    #[test]
    fn blank_ids_are_detected() {
        assert!(ArtworkId::new("   ").is_blank());
        assert!(!ArtworkId::new("x").is_blank());
    }

    #[test]
    fn resolution_ladder_is_ascending() {
        for pair in COMMON_RESOLUTIONS.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }
}
