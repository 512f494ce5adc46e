// Candle Store - Durable per-key JSON snapshots
// Atomic overwrite via temp file + rename; read failures fall back to empty

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

use crate::core::types::{Candle, Interval};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Persistence key for a candle series.
pub fn series_key(symbol: &str, interval: Interval) -> String {
    format!("{}_{}", symbol.to_uppercase(), interval.code())
}

/// File-backed store, one JSON document per entity key. Callers serialize
/// writers per key; the store itself guards nothing. All failures are logged
/// and swallowed so the engine keeps running on in-memory state.
pub struct CandleStore {
    dir: PathBuf,
}

impl CandleStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        if let Err(e) = fs::create_dir_all(&dir) {
            warn!(dir = %dir.display(), error = %e, "Could not create data directory");
        }
        Self { dir }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }

    /// Load a candle series; absent or malformed files yield an empty series.
    pub fn load_candles(&self, key: &str) -> Vec<Candle> {
        self.load_json(key).unwrap_or_default()
    }

    /// Persist a candle series with atomic-overwrite semantics.
    pub fn save_candles(&self, key: &str, candles: &[Candle]) {
        self.save_json(key, &candles);
    }

    /// Load any JSON entity; `None` when absent or malformed.
    pub fn load_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let path = self.path_for(key);
        match self.try_load(&path) {
            Ok(value) => value,
            Err(e) => {
                warn!(key = key, error = %e, "Failed to load entity, treating as absent");
                None
            }
        }
    }

    /// Persist any JSON entity with atomic-overwrite semantics. Failures are
    /// logged and swallowed.
    pub fn save_json<T: Serialize>(&self, key: &str, value: &T) {
        if let Err(e) = self.try_save(key, value) {
            warn!(key = key, error = %e, "Failed to persist entity");
        }
    }

    fn try_load<T: DeserializeOwned>(&self, path: &Path) -> Result<Option<T>, StoreError> {
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&raw)?))
    }

    fn try_save<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let path = self.path_for(key);
        let tmp = self.dir.join(format!("{}.json.tmp", key));
        let raw = serde_json::to_string(value)?;
        fs::write(&tmp, raw)?;
        fs::rename(&tmp, &path)?;
        debug!(key = key, "Entity persisted");
        Ok(())
    }
}
