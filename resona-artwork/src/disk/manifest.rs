//! The manifest is the single source of truth for what exists on disk.
//!
//! It is persisted as one JSON document next to the image files. Writes are
//! atomic (tmp file + rename), and a crash may lose the most recent few
//! updates without corrupting the store: any file the manifest does not
//! know about is an orphan and gets swept by maintenance.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const MANIFEST_FILE_NAME: &str = "manifest.json";
const MANIFEST_VERSION: u32 = 1;

/// One persisted artwork variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskRecord {
    pub key_hash: String,
    pub filename: String,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
    pub last_accessed: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ManifestFile {
    version: u32,
    records: Vec<DiskRecord>,
}

#[derive(Debug)]
pub struct Manifest {
    path: PathBuf,
    records: HashMap<String, DiskRecord>,
    dirty: bool,
}

impl Manifest {
    /// Load the manifest, falling back to an empty one on any read or parse
    /// failure. A damaged manifest only means previously cached files turn
    /// into orphans; maintenance reclaims them.
    pub fn load_or_default(path: PathBuf) -> Self {
        let records = match load_file(&path) {
            Ok(records) => records,
            Err(e) => {
                log::warn!(
                    "artwork manifest load failed, starting empty; path={}, err={e}",
                    path.display()
                );
                HashMap::new()
            }
        };
        Self {
            path,
            records,
            dirty: false,
        }
    }

    pub fn get(&self, key_hash: &str) -> Option<&DiskRecord> {
        self.records.get(key_hash)
    }

    pub fn insert(&mut self, record: DiskRecord) {
        self.records.insert(record.key_hash.clone(), record);
        self.dirty = true;
    }

    pub fn touch(&mut self, key_hash: &str, now: DateTime<Utc>) -> bool {
        match self.records.get_mut(key_hash) {
            Some(record) => {
                record.last_accessed = now;
                self.dirty = true;
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, key_hash: &str) -> Option<DiskRecord> {
        let removed = self.records.remove(key_hash);
        if removed.is_some() {
            self.dirty = true;
        }
        removed
    }

    pub fn clear(&mut self) {
        if !self.records.is_empty() {
            self.dirty = true;
        }
        self.records.clear();
    }

    pub fn records(&self) -> impl Iterator<Item = &DiskRecord> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.records
            .values()
            .fold(0u64, |acc, r| acc.saturating_add(r.size_bytes))
    }

    /// Filenames the manifest knows about; anything else in the cache
    /// directory (manifest aside) is an orphan.
    pub fn known_filenames(
        &self,
    ) -> std::collections::HashSet<String> {
        self.records
            .values()
            .map(|r| r.filename.clone())
            .collect()
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    #[cfg(test)]
    pub fn backdate_created(
        &mut self,
        key_hash: &str,
        created_at: DateTime<Utc>,
    ) {
        if let Some(record) = self.records.get_mut(key_hash) {
            record.created_at = created_at;
            self.dirty = true;
        }
    }

    /// Serialize for an atomic snapshot write if there is anything to flush.
    pub fn prepare_flush(&mut self) -> Option<(PathBuf, Vec<u8>)> {
        if !self.dirty {
            return None;
        }
        let mut records: Vec<DiskRecord> =
            self.records.values().cloned().collect();
        records.sort_by(|a, b| a.key_hash.cmp(&b.key_hash));
        let file = ManifestFile {
            version: MANIFEST_VERSION,
            records,
        };
        let bytes = match serde_json::to_vec_pretty(&file) {
            Ok(bytes) => bytes,
            Err(e) => {
                log::warn!("artwork manifest serialize failed: {e}");
                return None;
            }
        };
        self.dirty = false;
        Some((self.path.clone(), bytes))
    }
}

fn load_file(path: &Path) -> anyhow::Result<HashMap<String, DiskRecord>> {
    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(HashMap::new());
        }
        Err(e) => return Err(e.into()),
    };

    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;

    let parsed: ManifestFile = serde_json::from_slice(&buf)?;
    if parsed.version != MANIFEST_VERSION {
        return Ok(HashMap::new());
    }

    Ok(parsed
        .records
        .into_iter()
        .map(|r| (r.key_hash.clone(), r))
        .collect())
}

pub fn write_snapshot_sync(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("manifest path has no parent"))?;
    std::fs::create_dir_all(parent)?;

    let tmp_path = path.with_extension("json.tmp");
    {
        let mut f = File::create(&tmp_path)?;
        f.write_all(bytes)?;
        f.sync_all()?;
    }
    std::fs::rename(tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn record(key_hash: &str, size_bytes: u64) -> DiskRecord {
        let now = Utc::now();
        DiskRecord {
            key_hash: key_hash.to_owned(),
            filename: format!("{key_hash}.jpg"),
            created_at: now,
            size_bytes,
            last_accessed: now,
        }
    }

    #[test]
    fn snapshot_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(MANIFEST_FILE_NAME);

        let mut manifest = Manifest::load_or_default(path.clone());
        manifest.insert(record("aa", 100));
        manifest.insert(record("bb", 200));
        let (path, bytes) = manifest.prepare_flush().unwrap();
        write_snapshot_sync(&path, &bytes).unwrap();

        let reloaded = Manifest::load_or_default(path);
        assert_eq!(reloaded.len(), 2);
        assert_eq!(reloaded.total_bytes(), 300);
        assert_eq!(reloaded.get("aa").unwrap().size_bytes, 100);
    }

    #[test]
    fn garbage_manifest_starts_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(MANIFEST_FILE_NAME);
        std::fs::write(&path, b"not json").unwrap();

        let manifest = Manifest::load_or_default(path);
        assert!(manifest.is_empty());
    }

    #[test]
    fn flush_is_skipped_when_clean() {
        let dir = tempdir().unwrap();
        let mut manifest =
            Manifest::load_or_default(dir.path().join(MANIFEST_FILE_NAME));
        assert!(manifest.prepare_flush().is_none());

        manifest.insert(record("aa", 1));
        assert!(manifest.prepare_flush().is_some());
        assert!(manifest.prepare_flush().is_none());
    }
}
