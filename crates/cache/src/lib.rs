//! imgload cache library
//!
//! Keys, the pixel buffer pool, the in-memory resource cache with active
//! reference tracking, and the journaled disk cache.

pub mod config;
pub mod disk;
pub mod key;
pub mod memory;
pub mod pool;
pub mod sizing;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use config::{CacheConfig, CacheLocation, ConfigError};
pub use disk::{DiskCache, DiskCacheError, DiskCacheStats};
pub use key::{Digest, Key, KeyBuilder, KeyDigest, SourceKey};
pub use memory::{EvictionListener, MemoryCache, MemoryCacheStats};
pub use pool::{BufferPool, PixelFormat, PoolStats, PooledBuffer};
pub use sizing::{MemoryCategory, MemoryPressure, MemorySizeCalculator};

/// Lock a mutex, recovering the guard if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
