//! Memory budgets and memory pressure
//!
//! Budgets for the resource cache and the buffer pool are computed once at
//! startup from the process memory limit and the display size, then handed
//! to each component as plain byte counts. At runtime both components react
//! to coarse [`MemoryPressure`] signals and to a size multiplier.

/// Memory pressure level reported by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MemoryPressure {
    /// Plenty of headroom, no action needed
    Low,
    /// Shed a quarter of idle memory
    Moderate,
    /// Shed half of idle memory
    High,
    /// Drop everything idle
    Critical,
}

impl MemoryPressure {
    /// Classify a utilization ratio (0.0 to 1.0)
    pub fn from_utilization(utilization: f64) -> Self {
        if utilization < 0.5 {
            MemoryPressure::Low
        } else if utilization < 0.75 {
            MemoryPressure::Moderate
        } else if utilization < 0.90 {
            MemoryPressure::High
        } else {
            MemoryPressure::Critical
        }
    }

    /// Returns true if this level requires shedding memory
    pub fn needs_eviction(&self) -> bool {
        !matches!(self, MemoryPressure::Low)
    }

    /// Byte size a component with budget `max_size` should trim down to.
    pub fn trim_target(&self, max_size: usize) -> usize {
        match self {
            MemoryPressure::Low => max_size,
            MemoryPressure::Moderate => max_size / 4 * 3,
            MemoryPressure::High => max_size / 2,
            MemoryPressure::Critical => 0,
        }
    }
}

/// Coarse runtime scaling of the in-memory budgets
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MemoryCategory {
    Low,
    Normal,
    High,
}

impl MemoryCategory {
    pub fn multiplier(&self) -> f32 {
        match self {
            MemoryCategory::Low => 0.5,
            MemoryCategory::Normal => 1.0,
            MemoryCategory::High => 1.5,
        }
    }
}

const BYTES_PER_SCREEN_PIXEL: usize = 4;
const MEMORY_CACHE_TARGET_SCREENS: usize = 2;
const BUFFER_POOL_TARGET_SCREENS: usize = 4;
const MAX_SIZE_MULTIPLIER: f64 = 0.4;
const LOW_MEMORY_MAX_SIZE_MULTIPLIER: f64 = 0.33;

/// Splits a process memory allowance between the resource cache and the
/// buffer pool.
///
/// Each wants a few screens' worth of pixels; if the combined target does not
/// fit in the allowance, both are scaled down proportionally.
///
/// # Example
///
/// ```
/// use imgload_cache::MemorySizeCalculator;
///
/// let sizes = MemorySizeCalculator::new(512 * 1024 * 1024, 1920, 1080, false);
/// assert_eq!(sizes.memory_cache_size(), 1920 * 1080 * 4 * 2);
/// assert_eq!(sizes.buffer_pool_size(), 1920 * 1080 * 4 * 4);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemorySizeCalculator {
    memory_cache_size: usize,
    buffer_pool_size: usize,
}

impl MemorySizeCalculator {
    pub fn new(
        process_memory_limit: usize,
        screen_width: u32,
        screen_height: u32,
        low_memory: bool,
    ) -> Self {
        let multiplier = if low_memory {
            LOW_MEMORY_MAX_SIZE_MULTIPLIER
        } else {
            MAX_SIZE_MULTIPLIER
        };
        let max_size = (process_memory_limit as f64 * multiplier) as usize;

        let screen_size = screen_width as usize * screen_height as usize * BYTES_PER_SCREEN_PIXEL;
        let target_pool = screen_size * BUFFER_POOL_TARGET_SCREENS;
        let target_cache = screen_size * MEMORY_CACHE_TARGET_SCREENS;

        let (memory_cache_size, buffer_pool_size) = if target_pool + target_cache <= max_size {
            (target_cache, target_pool)
        } else {
            let part = max_size / (BUFFER_POOL_TARGET_SCREENS + MEMORY_CACHE_TARGET_SCREENS);
            (
                part * MEMORY_CACHE_TARGET_SCREENS,
                part * BUFFER_POOL_TARGET_SCREENS,
            )
        };

        log::debug!(
            "memory budgets: cache={} bytes, pool={} bytes (allowance {} bytes, low_memory={})",
            memory_cache_size,
            buffer_pool_size,
            max_size,
            low_memory
        );

        Self {
            memory_cache_size,
            buffer_pool_size,
        }
    }

    pub fn memory_cache_size(&self) -> usize {
        self.memory_cache_size
    }

    pub fn buffer_pool_size(&self) -> usize {
        self.buffer_pool_size
    }
}
