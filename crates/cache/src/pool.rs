//! Reuse pool for decoded pixel buffers
//!
//! Decoding allocates a fresh block of pixel memory per image, which churns
//! the allocator badly when a scrolling list decodes the same thumbnail sizes
//! over and over. The pool keeps idle buffers grouped by exact
//! (width, height, format) and hands them back out on demand, evicting the
//! least recently used group's buffers when the byte budget is exceeded.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use log::debug;

use crate::lock;
use crate::sizing::MemoryPressure;

/// Pixel layout of a decoded buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// 8 bits per channel, RGBA order
    Rgba8888,
    /// 16-bit packed RGB
    Rgb565,
    /// 16-bit packed ARGB
    Argb4444,
    /// Single 8-bit alpha channel
    Alpha8,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Rgba8888 => 4,
            PixelFormat::Rgb565 | PixelFormat::Argb4444 => 2,
            PixelFormat::Alpha8 => 1,
        }
    }

    /// Bytes needed for a `width` x `height` buffer in this format.
    pub fn byte_size(self, width: u32, height: u32) -> usize {
        width as usize * height as usize * self.bytes_per_pixel()
    }
}

/// A block of decoded pixel memory.
///
/// Exactly one owner holds a buffer at a time: the pool while idle, a decoder
/// while filling it, a resource while it is displayed.
#[derive(Debug)]
pub struct PooledBuffer {
    width: u32,
    height: u32,
    format: PixelFormat,
    data: Vec<u8>,
    mutable: bool,
}

impl PooledBuffer {
    /// Allocate a new zeroed, mutable buffer.
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            width,
            height,
            format,
            data: vec![0; format.byte_size(width, height)],
            mutable: true,
        }
    }

    /// Wrap existing pixel data. Returns `None` if the length does not
    /// match the dimensions.
    pub fn from_vec(width: u32, height: u32, format: PixelFormat, data: Vec<u8>) -> Option<Self> {
        if data.len() != format.byte_size(width, height) {
            return None;
        }
        Some(Self {
            width,
            height,
            format,
            data,
            mutable: true,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    /// Byte capacity of the buffer
    pub fn byte_size(&self) -> usize {
        self.data.len()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }

    pub fn is_mutable(&self) -> bool {
        self.mutable
    }

    /// Freeze the buffer. Immutable buffers are never accepted back into a pool.
    pub fn set_immutable(&mut self) {
        self.mutable = false;
    }

    fn erase(&mut self) {
        self.data.fill(0);
    }

    fn group(&self) -> BufferGroup {
        BufferGroup {
            width: self.width,
            height: self.height,
            format: self.format,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct BufferGroup {
    width: u32,
    height: u32,
    format: PixelFormat,
}

/// Statistics about pool usage
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolStats {
    /// Idle buffers currently held
    pub buffer_count: usize,
    /// Bytes held by idle buffers
    pub current_size: usize,
    /// Effective budget (initial budget x multiplier)
    pub max_size: usize,
    pub hits: u64,
    pub misses: u64,
    pub puts: u64,
    pub rejections: u64,
    pub evictions: u64,
}

struct PoolState {
    groups: HashMap<BufferGroup, Vec<PooledBuffer>>,
    /// Recency of each non-empty group, oldest first
    recency: BTreeMap<u64, BufferGroup>,
    group_ticks: HashMap<BufferGroup, u64>,
    tick: u64,
    initial_max_size: usize,
    max_size: usize,
    max_entry_size: usize,
    current_size: usize,
    stats: PoolStats,
}

impl PoolState {
    fn touch(&mut self, group: BufferGroup) {
        if let Some(old) = self.group_ticks.remove(&group) {
            self.recency.remove(&old);
        }
        self.tick += 1;
        self.recency.insert(self.tick, group);
        self.group_ticks.insert(group, self.tick);
    }

    fn forget_group(&mut self, group: BufferGroup) {
        self.groups.remove(&group);
        if let Some(tick) = self.group_ticks.remove(&group) {
            self.recency.remove(&tick);
        }
    }

    fn take(&mut self, group: BufferGroup) -> Option<PooledBuffer> {
        let buffers = self.groups.get_mut(&group)?;
        let buffer = buffers.pop()?;
        if buffers.is_empty() {
            self.forget_group(group);
        } else {
            self.touch(group);
        }
        self.current_size -= buffer.byte_size();
        Some(buffer)
    }

    /// Drop idle buffers, stalest group first, until usage fits `target`.
    fn trim_to_size(&mut self, target: usize) {
        while self.current_size > target {
            let Some((_, group)) = self.recency.iter().next().map(|(t, g)| (*t, *g)) else {
                break;
            };
            if let Some(buffers) = self.groups.get_mut(&group) {
                if let Some(buffer) = buffers.pop() {
                    self.current_size -= buffer.byte_size();
                    self.stats.evictions += 1;
                }
                if !buffers.is_empty() {
                    continue;
                }
            }
            self.forget_group(group);
        }
        self.refresh_stats();
    }

    fn refresh_stats(&mut self) {
        self.stats.current_size = self.current_size;
        self.stats.max_size = self.max_size;
        self.stats.buffer_count = self.groups.values().map(Vec::len).sum();
    }
}

/// Size-bounded pool of idle pixel buffers.
///
/// `get` never substitutes a buffer of different dimensions and never
/// allocates; a miss returns `None` and the caller allocates.
///
/// # Example
///
/// ```
/// use imgload_cache::{BufferPool, PixelFormat, PooledBuffer};
///
/// let pool = BufferPool::new(16 * 1024 * 1024);
/// assert!(pool.get(64, 64, PixelFormat::Rgba8888).is_none());
///
/// let buffer = PooledBuffer::new(64, 64, PixelFormat::Rgba8888);
/// assert!(pool.put(buffer));
/// assert!(pool.get(64, 64, PixelFormat::Rgba8888).is_some());
/// ```
pub struct BufferPool {
    state: Mutex<PoolState>,
}

impl BufferPool {
    /// Create a pool whose idle buffers may total `max_size` bytes. The
    /// largest single acceptable buffer defaults to the same value.
    pub fn new(max_size: usize) -> Self {
        Self::with_max_entry_size(max_size, max_size)
    }

    pub fn with_max_entry_size(max_size: usize, max_entry_size: usize) -> Self {
        Self {
            state: Mutex::new(PoolState {
                groups: HashMap::new(),
                recency: BTreeMap::new(),
                group_ticks: HashMap::new(),
                tick: 0,
                initial_max_size: max_size,
                max_size,
                max_entry_size,
                current_size: 0,
                stats: PoolStats {
                    max_size,
                    ..Default::default()
                },
            }),
        }
    }

    /// Take an idle buffer of exactly this shape, cleared to zero.
    pub fn get(&self, width: u32, height: u32, format: PixelFormat) -> Option<PooledBuffer> {
        let mut buffer = self.get_dirty(width, height, format)?;
        buffer.erase();
        Some(buffer)
    }

    /// Take an idle buffer of exactly this shape without clearing it.
    ///
    /// The contents are whatever the previous owner left behind; the caller
    /// must overwrite every byte before anything reads it.
    pub fn get_dirty(&self, width: u32, height: u32, format: PixelFormat) -> Option<PooledBuffer> {
        let group = BufferGroup {
            width,
            height,
            format,
        };
        let mut state = lock(&self.state);
        let buffer = state.take(group);
        if buffer.is_some() {
            state.stats.hits += 1;
        } else {
            state.stats.misses += 1;
        }
        state.refresh_stats();
        buffer
    }

    /// Offer a buffer back to the pool.
    ///
    /// Returns `false` when the buffer is immutable or larger than the
    /// maximum single-entry size; the buffer is then simply dropped. An
    /// accepted buffer may be evicted straight away if the pool is over
    /// budget, which still counts as accepted.
    pub fn put(&self, buffer: PooledBuffer) -> bool {
        let mut state = lock(&self.state);
        let size = buffer.byte_size();
        if !buffer.is_mutable() || size > state.max_entry_size {
            state.stats.rejections += 1;
            debug!(
                "pool rejected {}x{} {:?} ({} bytes, mutable={})",
                buffer.width,
                buffer.height,
                buffer.format,
                size,
                buffer.is_mutable()
            );
            return false;
        }

        let group = buffer.group();
        state.groups.entry(group).or_default().push(buffer);
        state.touch(group);
        state.current_size += size;
        state.stats.puts += 1;

        let max = state.max_size;
        state.trim_to_size(max);
        true
    }

    /// Rescale the budget to `factor` (clamped to `0.0..=1.0`) of the
    /// initial size, evicting if current usage no longer fits.
    pub fn set_size_multiplier(&self, factor: f32) {
        let factor = factor.clamp(0.0, 1.0);
        let mut state = lock(&self.state);
        state.max_size = (state.initial_max_size as f64 * factor as f64).round() as usize;
        let max = state.max_size;
        state.trim_to_size(max);
    }

    /// Respond to a memory pressure signal.
    pub fn trim(&self, level: MemoryPressure) {
        let mut state = lock(&self.state);
        let target = level.trim_target(state.max_size);
        debug!("trimming pool to {} bytes ({:?})", target, level);
        state.trim_to_size(target);
    }

    /// Drop every idle buffer.
    pub fn clear(&self) {
        let mut state = lock(&self.state);
        state.trim_to_size(0);
    }

    pub fn max_size(&self) -> usize {
        lock(&self.state).max_size
    }

    pub fn current_size(&self) -> usize {
        lock(&self.state).current_size
    }

    pub fn stats(&self) -> PoolStats {
        lock(&self.state).stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RGBA: PixelFormat = PixelFormat::Rgba8888;

    fn buffer(width: u32, height: u32) -> PooledBuffer {
        PooledBuffer::new(width, height, RGBA)
    }

    #[test]
    fn test_put_then_get_same_shape() {
        let pool = BufferPool::new(1024 * 1024);
        assert!(pool.put(buffer(16, 16)));

        let got = pool.get(16, 16, RGBA).expect("matching buffer should be pooled");
        assert_eq!(got.byte_size(), 16 * 16 * 4);
        assert_eq!(pool.current_size(), 0);
        assert!(pool.get(16, 16, RGBA).is_none());
    }

    #[test]
    fn test_no_close_enough_substitution() {
        let pool = BufferPool::new(1024 * 1024);
        pool.put(buffer(16, 16));

        assert!(pool.get(16, 17, RGBA).is_none());
        assert!(pool.get(16, 16, PixelFormat::Rgb565).is_none());
        assert!(pool.get(16, 16, RGBA).is_some());
    }

    #[test]
    fn test_get_clears_and_get_dirty_does_not() {
        let pool = BufferPool::new(1024 * 1024);

        let mut dirty = buffer(4, 4);
        dirty.data_mut().fill(0xAB);
        pool.put(dirty);
        let fast = pool.get_dirty(4, 4, RGBA).unwrap();
        assert!(fast.data().iter().all(|&b| b == 0xAB));

        pool.put(fast);
        let clean = pool.get(4, 4, RGBA).unwrap();
        assert!(clean.data().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_oversized_buffer_rejected() {
        // 8x8 RGBA = 256 bytes, one more than the pool allows.
        let pool = BufferPool::new(255);
        assert!(!pool.put(buffer(8, 8)));
        assert!(pool.get(8, 8, RGBA).is_none());
        assert_eq!(pool.stats().rejections, 1);
    }

    #[test]
    fn test_immutable_buffer_rejected() {
        let pool = BufferPool::new(1024 * 1024);
        let mut frozen = buffer(4, 4);
        frozen.set_immutable();
        assert!(!pool.put(frozen));
        assert!(pool.get(4, 4, RGBA).is_none());
    }

    #[test]
    fn test_accepted_then_evicted_still_reports_true() {
        let pool = BufferPool::with_max_entry_size(256, 1024);
        assert!(pool.put(buffer(8, 8)));
        // 16x8 RGBA = 512 bytes: accepted, then everything evicted to fit.
        assert!(pool.put(buffer(16, 8)));
        assert!(pool.current_size() <= 256);
        assert!(pool.stats().evictions >= 1);
    }

    #[test]
    fn test_eviction_drops_stalest_group_first() {
        // Room for exactly two 4x4 RGBA buffers.
        let pool = BufferPool::new(128);
        pool.put(buffer(4, 4));
        pool.put(PooledBuffer::new(8, 2, RGBA));
        pool.put(PooledBuffer::new(2, 8, RGBA));

        assert!(pool.get(4, 4, RGBA).is_none());
        assert!(pool.get(8, 2, RGBA).is_some());
        assert!(pool.get(2, 8, RGBA).is_some());
    }

    #[test]
    fn test_size_multiplier_shrinks_budget() {
        let pool = BufferPool::new(1024);
        for _ in 0..4 {
            pool.put(buffer(8, 8));
        }
        assert_eq!(pool.current_size(), 1024);

        pool.set_size_multiplier(0.5);
        assert_eq!(pool.max_size(), 512);
        assert!(pool.current_size() <= 512);

        pool.set_size_multiplier(4.0);
        assert_eq!(pool.max_size(), 1024);
    }

    #[test]
    fn test_trim_levels() {
        let pool = BufferPool::new(1024);
        for _ in 0..4 {
            pool.put(buffer(8, 8));
        }

        pool.trim(MemoryPressure::Low);
        assert_eq!(pool.current_size(), 1024);

        pool.trim(MemoryPressure::High);
        assert!(pool.current_size() <= 512);

        pool.trim(MemoryPressure::Critical);
        assert_eq!(pool.current_size(), 0);
        assert_eq!(pool.stats().buffer_count, 0);
    }

    #[test]
    fn test_clear() {
        let pool = BufferPool::new(4096);
        pool.put(buffer(8, 8));
        pool.put(buffer(4, 4));
        pool.clear();
        assert_eq!(pool.current_size(), 0);
        assert!(pool.get(8, 8, RGBA).is_none());
    }

    #[test]
    fn test_from_vec_checks_length() {
        assert!(PooledBuffer::from_vec(2, 2, RGBA, vec![0; 16]).is_some());
        assert!(PooledBuffer::from_vec(2, 2, RGBA, vec![0; 15]).is_none());
    }
}
