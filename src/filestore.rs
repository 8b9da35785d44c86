//! File-backed response cache.
//!
//! One file per stored value, named `<Identifier>-<timestampMillis>.json`,
//! contents = the raw serialized payload. Lookups scan filenames: by
//! identifier prefix, by exact timestamp, or by before/after a timestamp.
//! Used for results that must survive a restart (exported pages, long
//! aggregates) where the in-memory response cache would start cold.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use lazy_static::lazy_static;
use regex::Regex;

use crate::cache::Clock;
use crate::error::{Result, TallyError};

lazy_static! {
    static ref CACHE_FILE: Regex = Regex::new(r"^(?P<id>.+)-(?P<ts>\d+)\.json$").unwrap();
}

/// A stored value, parsed back from its filename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    pub identifier: String,
    pub timestamp_ms: i64,
    pub path: PathBuf,
}

pub struct FileStore {
    directory: PathBuf,
    clock: Arc<dyn Clock>,
}

impl FileStore {
    /// Open (and create if needed) the cache directory.
    pub fn open(directory: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Result<Self> {
        let directory = directory.into();
        fs::create_dir_all(&directory)
            .map_err(|e| TallyError::Operation(format!("cache directory: {e}")))?;
        Ok(Self { directory, clock })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Write one payload under `<identifier>-<now>.json`; returns the
    /// stored timestamp.
    pub fn store(&self, identifier: &str, payload: &str) -> Result<i64> {
        let timestamp_ms = self.clock.now_millis();
        let path = self
            .directory
            .join(format!("{identifier}-{timestamp_ms}.json"));
        fs::write(&path, payload)
            .map_err(|e| TallyError::Operation(format!("cache write {}: {e}", path.display())))?;
        Ok(timestamp_ms)
    }

    pub fn read(&self, file: &StoredFile) -> Result<String> {
        fs::read_to_string(&file.path).map_err(|e| {
            TallyError::Operation(format!("cache read {}: {e}", file.path.display()))
        })
    }

    /// Every stored file whose identifier starts with `prefix`, newest
    /// first.
    pub fn find_by_prefix(&self, prefix: &str) -> Result<Vec<StoredFile>> {
        let mut found: Vec<StoredFile> = self
            .scan()?
            .into_iter()
            .filter(|file| file.identifier.starts_with(prefix))
            .collect();
        found.sort_by(|a, b| b.timestamp_ms.cmp(&a.timestamp_ms));
        Ok(found)
    }

    /// The file stored for `identifier` at exactly `timestamp_ms`, if any.
    pub fn find_at(&self, identifier: &str, timestamp_ms: i64) -> Result<Option<StoredFile>> {
        Ok(self
            .scan()?
            .into_iter()
            .find(|file| file.identifier == identifier && file.timestamp_ms == timestamp_ms))
    }

    /// The newest file for `identifier` stored strictly before
    /// `timestamp_ms`.
    pub fn find_before(&self, identifier: &str, timestamp_ms: i64) -> Result<Option<StoredFile>> {
        Ok(self
            .scan()?
            .into_iter()
            .filter(|file| file.identifier == identifier && file.timestamp_ms < timestamp_ms)
            .max_by_key(|file| file.timestamp_ms))
    }

    /// The oldest file for `identifier` stored strictly after
    /// `timestamp_ms`.
    pub fn find_after(&self, identifier: &str, timestamp_ms: i64) -> Result<Option<StoredFile>> {
        Ok(self
            .scan()?
            .into_iter()
            .filter(|file| file.identifier == identifier && file.timestamp_ms > timestamp_ms)
            .min_by_key(|file| file.timestamp_ms))
    }

    /// Delete files stored before the cutoff; returns how many were
    /// removed. Unparseable filenames are left alone.
    pub fn clean_older_than(&self, cutoff_ms: i64) -> Result<usize> {
        let mut removed = 0;
        for file in self.scan()? {
            if file.timestamp_ms < cutoff_ms {
                fs::remove_file(&file.path).map_err(|e| {
                    TallyError::Operation(format!("cache clean {}: {e}", file.path.display()))
                })?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn scan(&self) -> Result<Vec<StoredFile>> {
        let entries = fs::read_dir(&self.directory)
            .map_err(|e| TallyError::Operation(format!("cache scan: {e}")))?;
        let mut found = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| TallyError::Operation(format!("cache scan: {e}")))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(captures) = CACHE_FILE.captures(name) else {
                continue;
            };
            let Ok(timestamp_ms) = captures["ts"].parse::<i64>() else {
                continue;
            };
            found.push(StoredFile {
                identifier: captures["id"].to_owned(),
                timestamp_ms,
                path: entry.path(),
            });
        }
        Ok(found)
    }
}
