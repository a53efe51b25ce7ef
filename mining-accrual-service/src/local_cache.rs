use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::warn;

/// Pair persisted when the accumulator goes inactive; consumed exactly once
/// on resume.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct SuspendMarker {
    pub last_active_millis: i64,
    pub rate_per_sec: Decimal,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
struct CacheFile {
    suspend_marker: Option<SuspendMarker>,
    cached_accrued: Option<Decimal>,
    cached_at: Option<i64>,
}

/// Best-effort JSON file cache. Survives a process restart on the same
/// host; every failure degrades to a warn and an empty cache.
pub struct LocalCache {
    path: PathBuf,
    file: Mutex<CacheFile>,
}

impl LocalCache {
    pub fn load(path: PathBuf) -> Self {
        let file = match std::fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<CacheFile>(&contents) {
                Ok(file) => file,
                Err(error) => {
                    warn!("Discarding corrupt local cache {:?}: {}", path, error);
                    CacheFile::default()
                }
            },
            Err(_) => CacheFile::default(),
        };
        Self {
            path,
            file: Mutex::new(file),
        }
    }

    fn persist(&self, file: &CacheFile) {
        let contents = match serde_json::to_string(file) {
            Ok(contents) => contents,
            Err(error) => {
                warn!("Could not serialize local cache: {}", error);
                return;
            }
        };
        if let Err(error) = std::fs::write(&self.path, contents) {
            warn!("Could not write local cache {:?}: {}", self.path, error);
        }
    }

    pub fn write_suspend_marker(&self, marker: SuspendMarker) {
        let mut file = self.file.lock().unwrap();
        file.suspend_marker = Some(marker);
        self.persist(&file);
    }

    /// Removes the marker so a second resume without an intervening suspend
    /// finds nothing.
    pub fn take_suspend_marker(&self) -> Option<SuspendMarker> {
        let mut file = self.file.lock().unwrap();
        let marker = file.suspend_marker.take();
        if marker.is_some() {
            self.persist(&file);
        }
        marker
    }

    pub fn cache_accrued(&self, value: Decimal, now_secs: i64) {
        let mut file = self.file.lock().unwrap();
        file.cached_accrued = Some(value);
        file.cached_at = Some(now_secs);
        self.persist(&file);
    }

    pub fn cached_accrued(&self) -> Option<Decimal> {
        self.file.lock().unwrap().cached_accrued
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn temp_path() -> PathBuf {
        std::env::temp_dir().join(format!("mining-cache-{}.json", uuid::Uuid::new_v4()))
    }

    #[test]
    fn test_cache_roundtrip() {
        let path = temp_path();
        let cache = LocalCache::load(path.clone());
        cache.cache_accrued(dec!(1.25), 1_700_000_000);
        cache.write_suspend_marker(SuspendMarker {
            last_active_millis: 1_700_000_000_000,
            rate_per_sec: dec!(0.0001),
        });

        let reloaded = LocalCache::load(path.clone());
        assert_eq!(reloaded.cached_accrued(), Some(dec!(1.25)));
        assert_eq!(
            reloaded.take_suspend_marker(),
            Some(SuspendMarker {
                last_active_millis: 1_700_000_000_000,
                rate_per_sec: dec!(0.0001),
            })
        );
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn test_take_suspend_marker_consumes() {
        let path = temp_path();
        let cache = LocalCache::load(path.clone());
        cache.write_suspend_marker(SuspendMarker {
            last_active_millis: 42,
            rate_per_sec: dec!(0.5),
        });
        assert!(cache.take_suspend_marker().is_some());
        assert!(cache.take_suspend_marker().is_none());
        // Consumption is durable across a reload as well.
        let reloaded = LocalCache::load(path.clone());
        assert!(reloaded.take_suspend_marker().is_none());
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn test_corrupt_cache_discarded() {
        let path = temp_path();
        std::fs::write(&path, "not json at all").unwrap();
        let cache = LocalCache::load(path.clone());
        assert_eq!(cache.cached_accrued(), None);
        assert!(cache.take_suspend_marker().is_none());
        let _ = std::fs::remove_file(path);
    }
}
