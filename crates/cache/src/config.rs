//! Cache configuration for memory budgets and disk cache placement.
//!
//! Configuration can be loaded from a TOML file, environment variables,
//! or created programmatically.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

const MB: usize = 1024 * 1024;

/// Configuration for the cache system.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    /// In-memory resource cache budget in bytes
    pub memory_cache_size: usize,
    /// Buffer pool budget in bytes
    pub buffer_pool_size: usize,
    /// Disk cache size limit in bytes
    pub disk_cache_size: usize,
    /// App-private disk cache directory
    pub disk_cache_dir: PathBuf,
    /// Preferred shared/removable directory, used when it is present and writable
    pub external_cache_dir: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory_cache_size: 64 * MB,
            buffer_pool_size: 128 * MB,
            disk_cache_size: 250 * MB,
            disk_cache_dir: Self::default_cache_dir(),
            external_cache_dir: None,
        }
    }
}

/// On-disk form; sizes are expressed in megabytes.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct ConfigFile {
    #[serde(skip_serializing_if = "Option::is_none")]
    memory_cache_mb: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    buffer_pool_mb: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    disk_cache_mb: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    disk_cache_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    external_cache_dir: Option<PathBuf>,
}

impl CacheConfig {
    /// Creates a configuration with sizes in megabytes.
    pub fn new(memory_mb: usize, pool_mb: usize, disk_mb: usize, disk_dir: PathBuf) -> Self {
        Self {
            memory_cache_size: memory_mb * MB,
            buffer_pool_size: pool_mb * MB,
            disk_cache_size: disk_mb * MB,
            disk_cache_dir: disk_dir,
            external_cache_dir: None,
        }
    }

    pub fn with_memory_cache_mb(mut self, mb: usize) -> Self {
        self.memory_cache_size = mb * MB;
        self
    }

    pub fn with_buffer_pool_mb(mut self, mb: usize) -> Self {
        self.buffer_pool_size = mb * MB;
        self
    }

    pub fn with_disk_mb(mut self, mb: usize) -> Self {
        self.disk_cache_size = mb * MB;
        self
    }

    pub fn with_disk_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.disk_cache_dir = path.as_ref().to_path_buf();
        self
    }

    pub fn with_external_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.external_cache_dir = Some(path.as_ref().to_path_buf());
        self
    }

    /// Set both in-memory budgets from a [`MemorySizeCalculator`](crate::MemorySizeCalculator).
    pub fn with_calculated_sizes(mut self, sizes: &crate::MemorySizeCalculator) -> Self {
        self.memory_cache_size = sizes.memory_cache_size();
        self.buffer_pool_size = sizes.buffer_pool_size();
        self
    }

    /// Returns the default cache directory for the current platform.
    ///
    /// - macOS: ~/Library/Caches/imgload
    /// - Linux: ~/.cache/imgload
    /// - Windows: %LOCALAPPDATA%\imgload
    pub fn default_cache_dir() -> PathBuf {
        match dirs::cache_dir() {
            Some(cache_dir) => cache_dir.join("imgload"),
            None => PathBuf::from("cache/imgload"),
        }
    }

    /// Loads configuration from environment variables.
    ///
    /// - `IMGLOAD_MEMORY_CACHE_MB`
    /// - `IMGLOAD_BUFFER_POOL_MB`
    /// - `IMGLOAD_DISK_CACHE_MB`
    /// - `IMGLOAD_CACHE_DIR`
    /// - `IMGLOAD_EXTERNAL_CACHE_DIR`
    ///
    /// # Errors
    /// Returns an error if a size variable is not an integer.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(mb) = env_mb("IMGLOAD_MEMORY_CACHE_MB")? {
            config.memory_cache_size = mb * MB;
        }
        if let Some(mb) = env_mb("IMGLOAD_BUFFER_POOL_MB")? {
            config.buffer_pool_size = mb * MB;
        }
        if let Some(mb) = env_mb("IMGLOAD_DISK_CACHE_MB")? {
            config.disk_cache_size = mb * MB;
        }
        if let Ok(val) = std::env::var("IMGLOAD_CACHE_DIR") {
            config.disk_cache_dir = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("IMGLOAD_EXTERNAL_CACHE_DIR") {
            config.external_cache_dir = Some(PathBuf::from(val));
        }

        Ok(config)
    }

    /// Loads configuration from a TOML file.
    ///
    /// ```toml
    /// memory_cache_mb = 64
    /// buffer_pool_mb = 128
    /// disk_cache_mb = 250
    /// disk_cache_dir = "/path/to/cache"
    /// external_cache_dir = "/media/sd/imgload"
    /// ```
    ///
    /// Missing keys keep their defaults.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path.as_ref())?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(toml_str)?;
        let mut config = Self::default();
        if let Some(mb) = file.memory_cache_mb {
            config.memory_cache_size = mb * MB;
        }
        if let Some(mb) = file.buffer_pool_mb {
            config.buffer_pool_size = mb * MB;
        }
        if let Some(mb) = file.disk_cache_mb {
            config.disk_cache_size = mb * MB;
        }
        if let Some(dir) = file.disk_cache_dir {
            config.disk_cache_dir = dir;
        }
        config.external_cache_dir = file.external_cache_dir;
        Ok(config)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        fs::write(path.as_ref(), self.to_toml()?)?;
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        let file = ConfigFile {
            memory_cache_mb: Some(self.memory_cache_mb()),
            buffer_pool_mb: Some(self.buffer_pool_mb()),
            disk_cache_mb: Some(self.disk_cache_mb()),
            disk_cache_dir: Some(self.disk_cache_dir.clone()),
            external_cache_dir: self.external_cache_dir.clone(),
        };
        Ok(toml::to_string(&file)?)
    }

    pub fn memory_cache_mb(&self) -> usize {
        self.memory_cache_size / MB
    }

    pub fn buffer_pool_mb(&self) -> usize {
        self.buffer_pool_size / MB
    }

    pub fn disk_cache_mb(&self) -> usize {
        self.disk_cache_size / MB
    }
}

fn env_mb(name: &str) -> Result<Option<usize>, ConfigError> {
    match std::env::var(name) {
        Ok(val) => val
            .trim()
            .parse::<usize>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue(name.to_string())),
        Err(_) => Ok(None),
    }
}

/// Where the disk cache lives.
///
/// Chosen once when the engine is built and never changed afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheLocation {
    /// App-private storage
    Internal(PathBuf),
    /// Shared or removable storage
    External(PathBuf),
}

impl CacheLocation {
    /// Prefer the external directory when configured, present and writable.
    pub fn resolve(config: &CacheConfig) -> Self {
        if let Some(external) = &config.external_cache_dir {
            if is_writable_dir(external) {
                return CacheLocation::External(external.clone());
            }
            log::debug!(
                "external cache dir {} unavailable, using internal storage",
                external.display()
            );
        }
        CacheLocation::Internal(config.disk_cache_dir.clone())
    }

    pub fn path(&self) -> &Path {
        match self {
            CacheLocation::Internal(path) | CacheLocation::External(path) => path,
        }
    }

    pub fn is_external(&self) -> bool {
        matches!(self, CacheLocation::External(_))
    }
}

fn is_writable_dir(path: &Path) -> bool {
    match fs::metadata(path) {
        Ok(meta) => meta.is_dir() && !meta.permissions().readonly(),
        Err(_) => false,
    }
}

/// Errors that can occur during configuration operations.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for configuration key: {0}")]
    InvalidValue(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),
}
