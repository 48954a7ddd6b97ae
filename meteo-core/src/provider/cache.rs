//! On-disk response cache with a fixed time-to-live.
//!
//! One JSON file per request, named after the SHA-256 of the full request URL, so the
//! key covers endpoint, coordinates and the ordered variable list.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::{
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

#[derive(Debug, Serialize, Deserialize)]
struct CacheEntry {
    /// Unix seconds.
    fetched_at: i64,
    body: String,
}

#[derive(Debug, Clone)]
pub struct ResponseCache {
    dir: PathBuf,
    ttl: Duration,
}

impl ResponseCache {
    pub fn new(dir: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            dir: dir.into(),
            ttl,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn key_for(url: &str) -> String {
        hex::encode(Sha256::digest(url.as_bytes()))
    }

    fn path_for(&self, url: &str) -> PathBuf {
        self.dir.join(format!("{}.json", Self::key_for(url)))
    }

    /// Fresh body for `url`, if any. Stale, missing and unreadable entries are all misses.
    pub fn get(&self, url: &str) -> io::Result<Option<String>> {
        let path = self.path_for(url);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };

        let entry: CacheEntry = match serde_json::from_str(&raw) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(path = %path.display(), "ignoring corrupt cache entry: {e}");
                return Ok(None);
            }
        };

        let age = Utc::now().timestamp().saturating_sub(entry.fetched_at);
        if age < 0 || age as u64 >= self.ttl.as_secs() {
            return Ok(None);
        }

        Ok(Some(entry.body))
    }

    pub fn put(&self, url: &str, body: &str) -> io::Result<()> {
        self.put_at(url, body, Utc::now().timestamp())
    }

    fn put_at(&self, url: &str, body: &str, fetched_at: i64) -> io::Result<()> {
        fs::create_dir_all(&self.dir)?;

        let entry = CacheEntry {
            fetched_at,
            body: body.to_string(),
        };
        let json = serde_json::to_string(&entry).map_err(io::Error::other)?;

        let path = self.path_for(url);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &path)
    }
}
