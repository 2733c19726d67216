//! Caching and bounded parallelism for large projects.
//!
//! [`PerformanceOptimizer`] owns two [`HybridCache`]s (file hashes keyed by
//! path, size and modification time; instance records keyed by id) and the
//! [`WorkerPool`] used for batch conflict detection.

pub mod cache;
pub mod pool;

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::Serialize;
use tracing::info;

use crate::config::PerformanceConfig;
use crate::fsutil;
use crate::models::Instance;

pub use cache::{CacheStats, HybridCache};
pub use pool::{BatchItem, BatchReport, WorkerPool};

/// Capacity multiplier applied past the large-project threshold.
const LARGE_PROJECT_SCALE: usize = 4;

/// Files modified this recently are hashed but not cached: a second write
/// inside the filesystem's timestamp granularity would keep the same key.
const RACY_WINDOW: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct FileKey {
    path: PathBuf,
    len: u64,
    modified: Option<SystemTime>,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct PerformanceStats {
    pub file_hashes: CacheStatsView,
    pub instances: CacheStatsView,
    pub workers: usize,
    pub scaled: bool,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct CacheStatsView {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: usize,
    pub capacity: usize,
    pub hit_rate: f64,
}

impl CacheStatsView {
    fn new(stats: CacheStats, capacity: usize) -> Self {
        Self {
            hits: stats.hits,
            misses: stats.misses,
            evictions: stats.evictions,
            entries: stats.entries,
            capacity,
            hit_rate: stats.hit_rate(),
        }
    }
}

pub struct PerformanceOptimizer {
    file_hashes: HybridCache<FileKey, String>,
    instances: HybridCache<String, Instance>,
    pool: WorkerPool,
    scaled: bool,
}

impl PerformanceOptimizer {
    pub fn new(config: &PerformanceConfig) -> Self {
        Self::build(config, false)
    }

    /// Size the caches for a project of `file_count` files.
    pub fn for_project(config: &PerformanceConfig, file_count: usize) -> Self {
        let scaled = file_count > config.large_project_threshold;
        if scaled {
            info!(
                file_count,
                threshold = config.large_project_threshold,
                "large project, scaling caches"
            );
        }
        Self::build(config, scaled)
    }

    fn build(config: &PerformanceConfig, scaled: bool) -> Self {
        let capacity = if scaled {
            config.cache_capacity.saturating_mul(LARGE_PROJECT_SCALE)
        } else {
            config.cache_capacity
        };
        let ttl = Duration::from_secs(config.cache_ttl_secs);
        Self {
            file_hashes: HybridCache::new(capacity, ttl),
            instances: HybridCache::new(capacity, ttl),
            pool: WorkerPool::new(config.worker_count),
            scaled,
        }
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn is_scaled(&self) -> bool {
        self.scaled
    }

    /// Hex SHA-256 of `path`, served from cache while its size and
    /// modification time are unchanged.
    pub fn hash_file(&self, path: &Path) -> std::io::Result<String> {
        let meta = std::fs::metadata(path)?;
        let modified = meta.modified().ok();
        let racy = modified.map_or(true, |m| {
            SystemTime::now()
                .duration_since(m)
                .map_or(true, |age| age < RACY_WINDOW)
        });
        if racy {
            return fsutil::hash_file(path);
        }
        let key = FileKey {
            path: path.to_path_buf(),
            len: meta.len(),
            modified,
        };
        self.file_hashes
            .get_or_insert_with(key, || fsutil::hash_file(path))
    }

    pub fn cached_instance(&self, id: &str) -> Option<Instance> {
        self.instances.get(&id.to_string())
    }

    pub fn cache_instance(&self, instance: &Instance) {
        self.instances.insert(instance.id.clone(), instance.clone());
    }

    pub fn invalidate_instance(&self, id: &str) {
        self.instances.invalidate(&id.to_string());
    }

    pub fn stats(&self) -> PerformanceStats {
        PerformanceStats {
            file_hashes: CacheStatsView::new(self.file_hashes.stats(), self.file_hashes.capacity()),
            instances: CacheStatsView::new(self.instances.stats(), self.instances.capacity()),
            workers: self.pool.width(),
            scaled: self.scaled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_large_project_scales_caches() {
        let config = PerformanceConfig {
            large_project_threshold: 10,
            cache_capacity: 5,
            ..Default::default()
        };
        let small = PerformanceOptimizer::for_project(&config, 3);
        assert!(!small.is_scaled());
        assert_eq!(small.stats().file_hashes.capacity, 5);

        let large = PerformanceOptimizer::for_project(&config, 11);
        assert!(large.is_scaled());
        assert_eq!(large.stats().instances.capacity, 20);
        assert_eq!(large.stats().workers, config.worker_count);
    }

    #[test]
    fn test_hash_cache_follows_file_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("theme.json");
        std::fs::write(&path, "one").unwrap();

        let opt = PerformanceOptimizer::new(&PerformanceConfig::default());
        opt.hash_file(&path).unwrap();
        assert_eq!(opt.stats().file_hashes.entries, 0, "fresh files are not cached");

        let old = SystemTime::now() - Duration::from_secs(60);
        std::fs::File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(old)
            .unwrap();
        let first = opt.hash_file(&path).unwrap();
        assert_eq!(opt.hash_file(&path).unwrap(), first);
        assert_eq!(opt.stats().file_hashes.hits, 1);

        std::fs::write(&path, "owe").unwrap();
        let second = opt.hash_file(&path).unwrap();
        assert_ne!(first, second);
        assert_eq!(second, fsutil::hash_bytes(b"owe"));
    }
}
