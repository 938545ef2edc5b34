use thiserror::Error;

/// Errors a load can surface to the UI.
///
/// Disk-tier failures never appear here: persistence is a best-effort
/// optimization, so storage errors are logged and recovered silently.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ArtworkError {
    #[error("network error: {0}")]
    Transport(String),

    #[error("decode error: {0}")]
    Decode(String),
}
