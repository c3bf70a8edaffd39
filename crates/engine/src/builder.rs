use std::marker::PhantomData;
use std::path::PathBuf;
use std::sync::Arc;

use imgload_cache::{BufferPool, CacheConfig, CacheLocation, DiskCache, Key, MemoryCache};
use imgload_scheduler::{ExecutorConfig, PriorityExecutor};
use log::{debug, warn};

use crate::engine::{Engine, EngineParts};
use crate::error::BuildError;
use crate::registry::LoaderRegistry;
use crate::resource::{recycle, Bitmap, Resource};

/// Wires a [`CacheConfig`] into an [`Engine`].
///
/// A disk cache that fails to open is logged and skipped; the engine then
/// runs with memory caching only.
pub struct EngineBuilder<R: Resource = Bitmap> {
    config: CacheConfig,
    disk_cache: bool,
    disk_executor: ExecutorConfig,
    source_executor: ExecutorConfig,
    registry: Option<LoaderRegistry>,
    _resource: PhantomData<fn() -> R>,
}

impl<R: Resource> Default for EngineBuilder<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Resource> EngineBuilder<R> {
    pub fn new() -> Self {
        Self {
            config: CacheConfig::default(),
            disk_cache: true,
            disk_executor: ExecutorConfig::for_disk_cache(),
            source_executor: ExecutorConfig::for_source(),
            registry: None,
            _resource: PhantomData,
        }
    }

    /// Start from [`CacheConfig::from_env`].
    pub fn from_env() -> Result<Self, BuildError> {
        Ok(Self::new().config(CacheConfig::from_env()?))
    }

    pub fn config(mut self, config: CacheConfig) -> Self {
        self.config = config;
        self
    }

    /// Memory cache budget in bytes
    pub fn memory_cache_size(mut self, bytes: usize) -> Self {
        self.config.memory_cache_size = bytes;
        self
    }

    /// Buffer pool budget in bytes
    pub fn buffer_pool_size(mut self, bytes: usize) -> Self {
        self.config.buffer_pool_size = bytes;
        self
    }

    pub fn disk_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.disk_cache_dir = dir.into();
        self
    }

    /// Disk cache limit in bytes
    pub fn disk_cache_size(mut self, bytes: usize) -> Self {
        self.config.disk_cache_size = bytes;
        self
    }

    pub fn without_disk_cache(mut self) -> Self {
        self.disk_cache = false;
        self
    }

    pub fn disk_executor(mut self, config: ExecutorConfig) -> Self {
        self.disk_executor = config;
        self
    }

    pub fn source_executor(mut self, config: ExecutorConfig) -> Self {
        self.source_executor = config;
        self
    }

    /// Strategies used by [`Engine::load_model`]. Defaults to
    /// [`LoaderRegistry::with_defaults`].
    pub fn registry(mut self, registry: LoaderRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn build(self) -> Result<Engine<R>, BuildError> {
        let config = self.config;
        let pool = Arc::new(BufferPool::new(config.buffer_pool_size));

        let recycler = pool.clone();
        let memory = Arc::new(
            MemoryCache::<Key, R>::new(config.memory_cache_size).with_eviction_listener(Box::new(
                move |key, value| {
                    debug!("evicted {}", key);
                    recycle(&recycler, value);
                },
            )),
        );

        let disk = if self.disk_cache {
            let location = CacheLocation::resolve(&config);
            match DiskCache::open(location.path(), config.disk_cache_size as u64) {
                Ok(disk) => {
                    debug!(
                        "disk cache at {} ({} of {} bytes used)",
                        location.path().display(),
                        disk.size(),
                        disk.max_size()
                    );
                    Some(disk)
                }
                Err(e) => {
                    warn!("disk cache unavailable at {}: {}", location.path().display(), e);
                    None
                }
            }
        } else {
            None
        };

        let disk_executor = PriorityExecutor::new(self.disk_executor).map_err(BuildError::Executor)?;
        let source_executor = PriorityExecutor::new(self.source_executor).map_err(BuildError::Executor)?;

        Ok(Engine::from_parts(EngineParts {
            memory,
            pool,
            disk,
            disk_executor,
            source_executor,
            registry: self.registry.unwrap_or_else(LoaderRegistry::with_defaults),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use imgload_cache::{MemoryCategory, MemoryPressure, PixelFormat, PooledBuffer};

    fn engine(dir: &std::path::Path) -> Engine {
        EngineBuilder::new()
            .memory_cache_size(1024)
            .buffer_pool_size(4096)
            .disk_cache_dir(dir)
            .disk_cache_size(1024 * 1024)
            .disk_executor(ExecutorConfig::new("test-disk", 1))
            .source_executor(ExecutorConfig::new("test-source", 2))
            .build()
            .unwrap()
    }

    #[test]
    fn test_build_opens_disk_cache() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        assert!(engine.disk_cache().is_some());
        assert_eq!(engine.disk_cache_size(), 0);
        assert_eq!(engine.in_flight(), 0);

        let stats = engine.stats();
        assert_eq!(stats.memory.memory_limit, 1024);
        assert_eq!(stats.pool.max_size, 4096);
        assert_eq!(stats.disk.map(|d| d.disk_limit), Some(1024 * 1024));
    }

    #[test]
    fn test_unusable_disk_dir_falls_back_to_memory_only() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"not a directory").unwrap();

        let engine = engine(&blocker.join("cache"));
        assert!(engine.disk_cache().is_none());
        assert!(engine.stats().disk.is_none());
        assert!(!engine.remove_from_disk_cache(&Key::builder("a").build()).unwrap());
    }

    #[test]
    fn test_without_disk_cache() {
        let engine: Engine = EngineBuilder::new()
            .without_disk_cache()
            .disk_executor(ExecutorConfig::new("test-disk", 1))
            .source_executor(ExecutorConfig::new("test-source", 1))
            .build()
            .unwrap();
        assert!(engine.disk_cache().is_none());
        assert!(engine.clear_disk_cache().is_ok());
    }

    #[test]
    fn test_evicted_resources_recycle_into_pool() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let bitmap = Bitmap::new(PooledBuffer::new(8, 8, PixelFormat::Rgba8888));
        engine
            .memory_cache()
            .put(Key::builder("a").build(), Arc::new(bitmap), 256);

        engine.memory_cache().trim(MemoryPressure::Critical);
        assert!(engine.memory_cache().is_empty());
        assert_eq!(engine.buffer_pool().stats().buffer_count, 1);

        engine.trim_memory(MemoryPressure::Critical);
        assert_eq!(engine.buffer_pool().stats().buffer_count, 0);
    }

    #[test]
    fn test_memory_category_scales_budgets() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        engine.set_memory_category(MemoryCategory::High);
        assert_eq!(engine.memory_cache().memory_limit(), 1536);
        assert_eq!(engine.buffer_pool().max_size(), 4096);

        engine.set_memory_category(MemoryCategory::Low);
        assert_eq!(engine.memory_cache().memory_limit(), 512);
        assert_eq!(engine.buffer_pool().max_size(), 2048);
    }
}
