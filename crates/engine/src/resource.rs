//! Decoded resources and the handles callers hold on them

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use imgload_cache::{BufferPool, Key, MemoryCache, PixelFormat, PooledBuffer};

/// A decoded, displayable value the engine caches in memory.
pub trait Resource: Send + Sync + 'static {
    /// Approximate memory footprint in bytes, charged against the cache budget.
    fn byte_size(&self) -> usize;

    /// Give up the backing pixel buffer so it can be reused.
    fn into_buffer(self) -> Option<PooledBuffer>
    where
        Self: Sized;
}

/// Return a resource's buffer to the pool if nobody else holds it.
pub(crate) fn recycle<R: Resource>(pool: &BufferPool, value: Arc<R>) {
    if let Ok(resource) = Arc::try_unwrap(value) {
        if let Some(buffer) = resource.into_buffer() {
            pool.put(buffer);
        }
    }
}

/// Decoded pixels backed by a pooled buffer
#[derive(Debug)]
pub struct Bitmap {
    buffer: PooledBuffer,
}

impl Bitmap {
    pub fn new(buffer: PooledBuffer) -> Self {
        Self { buffer }
    }

    /// Wrap tightly packed RGBA8888 pixels. Returns `None` on a length mismatch.
    pub fn from_rgba(width: u32, height: u32, pixels: Vec<u8>) -> Option<Self> {
        PooledBuffer::from_vec(width, height, PixelFormat::Rgba8888, pixels).map(Self::new)
    }

    pub fn width(&self) -> u32 {
        self.buffer.width()
    }

    pub fn height(&self) -> u32 {
        self.buffer.height()
    }

    pub fn format(&self) -> PixelFormat {
        self.buffer.format()
    }

    pub fn pixels(&self) -> &[u8] {
        self.buffer.data()
    }

    pub fn pixels_mut(&mut self) -> &mut [u8] {
        self.buffer.data_mut()
    }
}

impl Resource for Bitmap {
    fn byte_size(&self) -> usize {
        self.buffer.byte_size()
    }

    fn into_buffer(self) -> Option<PooledBuffer> {
        Some(self.buffer)
    }
}

/// Where a delivered resource came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataSource {
    /// Already decoded in memory
    MemoryCache,
    /// Decoded from the transformed bytes in the disk cache
    ResultCache,
    /// Decoded and transformed from raw bytes in the disk cache
    SourceCache,
    /// Fetched from a local file
    Local,
    /// Fetched over the network
    Remote,
}

/// A successful load
pub struct Loaded<R: Resource> {
    pub resource: ResourceHandle<R>,
    pub data_source: DataSource,
    /// True for the first resource delivered for a request; always true
    /// unless a caller layers thumbnails or placeholders on top.
    pub is_first_resource: bool,
}

impl<R: Resource> Loaded<R> {
    pub fn is_from_memory_cache(&self) -> bool {
        self.data_source == DataSource::MemoryCache
    }
}

impl<R: Resource + fmt::Debug> fmt::Debug for Loaded<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Loaded")
            .field("resource", &self.resource)
            .field("data_source", &self.data_source)
            .field("is_first_resource", &self.is_first_resource)
            .finish()
    }
}

/// An active reference to a cached resource.
///
/// While any handle is alive the resource is exempt from memory cache
/// eviction. Cloning takes another reference; dropping (or [`release`])
/// gives it back, at which point the entry rejoins the LRU and its buffer
/// returns to the pool once evicted.
///
/// [`release`]: ResourceHandle::release
pub struct ResourceHandle<R: Resource> {
    key: Key,
    value: Option<Arc<R>>,
    memory: Arc<MemoryCache<Key, R>>,
    pool: Arc<BufferPool>,
}

impl<R: Resource> ResourceHandle<R> {
    /// Wrap a reference already counted as active in `memory`.
    pub(crate) fn new(
        key: Key,
        value: Arc<R>,
        memory: Arc<MemoryCache<Key, R>>,
        pool: Arc<BufferPool>,
    ) -> Self {
        Self {
            key,
            value: Some(value),
            memory,
            pool,
        }
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    /// True if both handles refer to the same decoded instance.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(self.arc(), other.arc())
    }

    /// Give back this reference now rather than at drop.
    pub fn release(self) {
        drop(self);
    }

    fn arc(&self) -> &Arc<R> {
        match &self.value {
            Some(value) => value,
            None => unreachable!("resource handle used after release"),
        }
    }
}

impl<R: Resource> Deref for ResourceHandle<R> {
    type Target = R;

    fn deref(&self) -> &R {
        self.arc()
    }
}

impl<R: Resource> Clone for ResourceHandle<R> {
    fn clone(&self) -> Self {
        let value = self.arc().clone();
        // An entry that left the cache stays untracked; the last holder recycles it.
        self.memory.retain(&self.key, &value);
        Self {
            key: self.key.clone(),
            value: Some(value),
            memory: self.memory.clone(),
            pool: self.pool.clone(),
        }
    }
}

impl<R: Resource> Drop for ResourceHandle<R> {
    fn drop(&mut self) {
        if let Some(value) = self.value.take() {
            if let Err(value) = self.memory.release(&self.key, value) {
                recycle(&self.pool, value);
            }
        }
    }
}

impl<R: Resource + fmt::Debug> fmt::Debug for ResourceHandle<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceHandle")
            .field("key", &self.key)
            .field("value", &self.value)
            .finish()
    }
}
