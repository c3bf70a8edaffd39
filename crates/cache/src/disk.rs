//! Persistent disk cache with a journaled LRU index
//!
//! Entries are byte blobs named by the hex digest of their key, kept in their
//! own subdirectory of the configured location. Writes go to
//! a temporary file that is renamed into place only when the writer reports
//! success, so readers never observe a partial entry. An append-only journal
//! records every mutation and access; replaying it on open restores the index
//! and LRU order without scanning the directory.
//!
//! Journal format, one record per line after a two-line header:
//!
//! ```text
//! imgload.disk
//! 1
//! DIRTY <digest>
//! CLEAN <digest> <size>
//! READ <digest>
//! REMOVE <digest>
//! ```

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use log::{debug, warn};

use crate::lock;

const ENTRY_DIR: &str = "imgload-disk-cache";
const JOURNAL_FILE: &str = "journal";
const JOURNAL_FILE_TMP: &str = "journal.tmp";
const MAGIC: &str = "imgload.disk";
const VERSION: &str = "1";
const ENTRY_EXT: &str = "bin";
const TEMP_EXT: &str = "tmp";
const REDUNDANT_OP_COMPACT_THRESHOLD: usize = 2000;
const MAX_DIGEST_LEN: usize = 120;

/// Errors surfaced by the disk cache
#[derive(Debug, thiserror::Error)]
pub enum DiskCacheError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid cache key {0:?}: expected 1-120 characters of [a-z0-9_-]")]
    InvalidKey(String),
    #[error("corrupt journal: {0}")]
    CorruptJournal(String),
}

/// Statistics for monitoring disk cache performance
#[derive(Debug, Clone, Copy, Default)]
pub struct DiskCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    /// Readable entries on disk
    pub entry_count: usize,
    /// Bytes used by readable entries
    pub disk_used: u64,
    pub disk_limit: u64,
}

impl DiskCacheStats {
    /// Calculate cache hit rate (0.0 to 1.0)
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct DiskEntry {
    size: u64,
    tick: u64,
    readable: bool,
    editing: bool,
}

struct DiskState {
    entries: HashMap<String, DiskEntry>,
    /// Readable entries by recency tick, least recently used first
    lru: BTreeMap<u64, String>,
    tick: u64,
    size: u64,
    journal: Option<BufWriter<File>>,
    redundant_ops: usize,
    stats: DiskCacheStats,
}

impl DiskState {
    fn empty(max_size: u64) -> Self {
        Self {
            entries: HashMap::new(),
            lru: BTreeMap::new(),
            tick: 0,
            size: 0,
            journal: None,
            redundant_ops: 0,
            stats: DiskCacheStats {
                disk_limit: max_size,
                ..Default::default()
            },
        }
    }

    fn touch(&mut self, digest: &str) {
        self.tick += 1;
        let tick = self.tick;
        if let Some(entry) = self.entries.get_mut(digest) {
            if entry.readable {
                self.lru.remove(&entry.tick);
                self.lru.insert(tick, digest.to_string());
            }
            entry.tick = tick;
        }
    }

    fn record(&mut self, line: std::fmt::Arguments<'_>) {
        if let Some(journal) = self.journal.as_mut() {
            if let Err(e) = journal.write_fmt(line).and_then(|_| journal.write_all(b"\n")) {
                warn!("disk cache journal write failed: {}", e);
                return;
            }
            if let Err(e) = journal.flush() {
                warn!("disk cache journal flush failed: {}", e);
            }
        }
    }

    fn refresh_stats(&mut self) {
        self.stats.entry_count = self.lru.len();
        self.stats.disk_used = self.size;
    }
}

/// Size-bounded persistent key → bytes store.
///
/// Thread-safe; the index is guarded by a single lock while writers stream
/// their payload outside of it.
///
/// # Example
///
/// ```
/// use std::io::{Read, Write};
/// use imgload_cache::DiskCache;
///
/// let dir = tempfile::tempdir().unwrap();
/// let cache = DiskCache::open(dir.path(), 1024 * 1024).unwrap();
///
/// let stored = cache.put("abc123", |out| out.write_all(b"hello").is_ok()).unwrap();
/// assert!(stored);
///
/// let mut text = String::new();
/// cache.get("abc123").unwrap().read_to_string(&mut text).unwrap();
/// assert_eq!(text, "hello");
/// ```
pub struct DiskCache {
    dir: PathBuf,
    max_size: u64,
    state: Mutex<DiskState>,
}

impl DiskCache {
    /// Open (or create) a cache under `dir` holding at most `max_size` bytes.
    ///
    /// Files live in a subdirectory of `dir` that the cache owns outright.
    /// An unreadable or corrupt journal resets the cache rather than failing.
    pub fn open<P: AsRef<Path>>(dir: P, max_size: u64) -> Result<Self, DiskCacheError> {
        let dir = dir.as_ref().join(ENTRY_DIR);
        fs::create_dir_all(&dir)?;

        let cache = Self {
            dir,
            max_size,
            state: Mutex::new(DiskState::empty(max_size)),
        };

        {
            let mut state = lock(&cache.state);
            let journal_path = cache.dir.join(JOURNAL_FILE);
            if journal_path.exists() {
                match cache.replay_journal(&mut state, &journal_path) {
                    Ok(()) => debug!(
                        "disk cache at {} restored {} entries ({} bytes)",
                        cache.dir.display(),
                        state.lru.len(),
                        state.size
                    ),
                    Err(e) => {
                        warn!("disk cache at {} reset: {}", cache.dir.display(), e);
                        *state = DiskState::empty(max_size);
                        cache.remove_entry_files()?;
                    }
                }
            } else {
                cache.remove_entry_files()?;
            }
            cache.rebuild_journal(&mut state)?;
            let mut evicted = Vec::new();
            cache.trim_to_size(&mut state, &mut evicted);
            state.refresh_stats();
        }

        Ok(cache)
    }

    /// Open a cache with the size limit given in megabytes.
    pub fn with_mb_limit<P: AsRef<Path>>(dir: P, megabytes: u64) -> Result<Self, DiskCacheError> {
        Self::open(dir, megabytes * 1024 * 1024)
    }

    fn entry_path(&self, digest: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", digest, ENTRY_EXT))
    }

    fn temp_path(&self, digest: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", digest, TEMP_EXT))
    }

    fn validate(digest: &str) -> Result<(), DiskCacheError> {
        let valid = !digest.is_empty()
            && digest.len() <= MAX_DIGEST_LEN
            && digest
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-');
        if valid {
            Ok(())
        } else {
            Err(DiskCacheError::InvalidKey(digest.to_string()))
        }
    }

    fn replay_journal(&self, state: &mut DiskState, path: &Path) -> Result<(), DiskCacheError> {
        let reader = BufReader::new(File::open(path)?);
        let mut lines = reader.lines();

        let magic = lines.next().transpose()?.unwrap_or_default();
        let version = lines.next().transpose()?.unwrap_or_default();
        if magic != MAGIC || version != VERSION {
            return Err(DiskCacheError::CorruptJournal(format!(
                "unexpected header {:?} {:?}",
                magic, version
            )));
        }

        let mut line_count = 0usize;
        for line in lines {
            let line = line?;
            line_count += 1;
            let mut parts = line.split(' ');
            let op = parts.next().unwrap_or_default();
            let digest = parts
                .next()
                .ok_or_else(|| DiskCacheError::CorruptJournal(line.clone()))?;
            Self::validate(digest).map_err(|_| DiskCacheError::CorruptJournal(line.clone()))?;

            match op {
                "DIRTY" => {
                    state.entries.entry(digest.to_string()).or_default().editing = true;
                }
                "CLEAN" => {
                    let size = parts
                        .next()
                        .and_then(|s| s.parse::<u64>().ok())
                        .ok_or_else(|| DiskCacheError::CorruptJournal(line.clone()))?;
                    let entry = state.entries.entry(digest.to_string()).or_default();
                    if entry.readable {
                        state.size -= entry.size;
                    }
                    entry.size = size;
                    entry.readable = true;
                    entry.editing = false;
                    state.size += size;
                    state.touch(digest);
                }
                "READ" => state.touch(digest),
                "REMOVE" => {
                    if let Some(entry) = state.entries.remove(digest) {
                        if entry.readable {
                            state.lru.remove(&entry.tick);
                            state.size -= entry.size;
                        }
                    }
                }
                _ => return Err(DiskCacheError::CorruptJournal(line)),
            }
        }

        // Edits that never committed, and entries whose file went missing.
        let digests: Vec<String> = state.entries.keys().cloned().collect();
        for digest in digests {
            let Some(entry) = state.entries.get(&digest).copied() else {
                continue;
            };
            if entry.editing {
                let _ = fs::remove_file(self.temp_path(&digest));
            }
            if !entry.readable || !self.entry_path(&digest).exists() {
                state.entries.remove(&digest);
                if entry.readable {
                    state.lru.remove(&entry.tick);
                    state.size -= entry.size;
                }
                let _ = fs::remove_file(self.entry_path(&digest));
            } else if let Some(e) = state.entries.get_mut(&digest) {
                e.editing = false;
            }
        }

        state.redundant_ops = line_count.saturating_sub(state.entries.len());
        Ok(())
    }

    /// Remove every entry and temp file in the cache directory.
    fn remove_entry_files(&self) -> io::Result<()> {
        for dir_entry in fs::read_dir(&self.dir)? {
            let path = dir_entry?.path();
            let ext = path.extension().and_then(|s| s.to_str());
            if ext == Some(ENTRY_EXT) || ext == Some(TEMP_EXT) {
                let _ = fs::remove_file(&path);
            }
        }
        Ok(())
    }

    /// Write a compact journal describing the current index and swap it in.
    fn rebuild_journal(&self, state: &mut DiskState) -> io::Result<()> {
        state.journal = None;
        let tmp = self.dir.join(JOURNAL_FILE_TMP);
        {
            let mut out = BufWriter::new(File::create(&tmp)?);
            writeln!(out, "{}", MAGIC)?;
            writeln!(out, "{}", VERSION)?;
            for (digest, entry) in &state.entries {
                if entry.editing {
                    writeln!(out, "DIRTY {}", digest)?;
                }
            }
            for digest in state.lru.values() {
                if let Some(entry) = state.entries.get(digest) {
                    writeln!(out, "CLEAN {} {}", digest, entry.size)?;
                }
            }
            out.flush()?;
        }
        fs::rename(&tmp, self.dir.join(JOURNAL_FILE))?;

        let file = OpenOptions::new()
            .append(true)
            .open(self.dir.join(JOURNAL_FILE))?;
        state.journal = Some(BufWriter::new(file));
        state.redundant_ops = 0;
        Ok(())
    }

    fn compact_if_needed(&self, state: &mut DiskState) {
        if state.redundant_ops >= REDUNDANT_OP_COMPACT_THRESHOLD
            && state.redundant_ops >= state.entries.len()
        {
            if let Err(e) = self.rebuild_journal(state) {
                warn!("disk cache journal compaction failed: {}", e);
            }
        }
    }

    fn trim_to_size(&self, state: &mut DiskState, evicted: &mut Vec<String>) {
        while state.size > self.max_size {
            let Some((tick, digest)) = state.lru.iter().next().map(|(t, d)| (*t, d.clone())) else {
                break;
            };
            state.lru.remove(&tick);
            let editing = match state.entries.get_mut(&digest) {
                Some(entry) => {
                    state.size -= entry.size;
                    entry.readable = false;
                    entry.size = 0;
                    entry.editing
                }
                None => false,
            };
            if !editing {
                state.entries.remove(&digest);
            }
            if let Err(e) = fs::remove_file(self.entry_path(&digest)) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!("failed to evict disk cache entry {}: {}", digest, e);
                }
            }
            state.record(format_args!("REMOVE {}", digest));
            state.redundant_ops += 1;
            state.stats.evictions += 1;
            evicted.push(digest);
        }
    }

    /// Open the stored bytes for `digest`, or `None` on a miss.
    ///
    /// A missing or unreadable file is treated as a miss and dropped from the
    /// index.
    pub fn get(&self, digest: &str) -> Option<File> {
        if Self::validate(digest).is_err() {
            return None;
        }
        let mut state = lock(&self.state);
        let readable = state.entries.get(digest).is_some_and(|e| e.readable);
        if !readable {
            state.stats.misses += 1;
            return None;
        }

        match File::open(self.entry_path(digest)) {
            Ok(file) => {
                state.touch(digest);
                state.record(format_args!("READ {}", digest));
                state.redundant_ops += 1;
                state.stats.hits += 1;
                self.compact_if_needed(&mut state);
                Some(file)
            }
            Err(e) => {
                warn!("disk cache entry {} unreadable, dropping: {}", digest, e);
                if let Some(entry) = state.entries.get_mut(digest) {
                    let (tick, size, editing) = (entry.tick, entry.size, entry.editing);
                    entry.readable = false;
                    entry.size = 0;
                    state.lru.remove(&tick);
                    state.size -= size;
                    if !editing {
                        state.entries.remove(digest);
                    }
                }
                state.record(format_args!("REMOVE {}", digest));
                state.stats.misses += 1;
                state.refresh_stats();
                None
            }
        }
    }

    /// Store an entry by streaming it through `writer`.
    ///
    /// The entry becomes visible only if `writer` returns `true` and the
    /// bytes reach disk. Returns `Ok(false)` when the writer declined or
    /// another write for the same digest is already in progress. A writer
    /// that panics leaves the digest writable again.
    pub fn put<F>(&self, digest: &str, writer: F) -> Result<bool, DiskCacheError>
    where
        F: FnOnce(&mut dyn Write) -> bool,
    {
        Self::validate(digest)?;
        {
            let mut state = lock(&self.state);
            let entry = state.entries.entry(digest.to_string()).or_default();
            if entry.editing {
                debug!("disk cache entry {} already being written", digest);
                return Ok(false);
            }
            entry.editing = true;
            state.record(format_args!("DIRTY {}", digest));
        }

        let edit = Edit {
            cache: self,
            digest,
            tmp: self.temp_path(digest),
            finished: false,
        };
        let written = File::create(&edit.tmp).and_then(|file| {
            let mut out = BufWriter::new(file);
            let ok = writer(&mut out);
            out.flush()?;
            out.get_ref().sync_all()?;
            Ok(ok)
        });

        match written {
            Ok(true) => edit.commit(),
            Ok(false) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn commit(&self, digest: &str, tmp: &Path) -> Result<bool, DiskCacheError> {
        let mut state = lock(&self.state);
        let still_editing = state.entries.get(digest).is_some_and(|e| e.editing);
        if !still_editing {
            // Cleared while the writer ran.
            let _ = fs::remove_file(tmp);
            return Ok(false);
        }

        let size = match fs::rename(tmp, self.entry_path(digest))
            .and_then(|_| fs::metadata(self.entry_path(digest)))
        {
            Ok(meta) => meta.len(),
            Err(e) => {
                drop(state);
                self.abort(digest, tmp);
                return Err(e.into());
            }
        };

        let state = &mut *state;
        if let Some(entry) = state.entries.get_mut(digest) {
            if entry.readable {
                state.size -= entry.size;
            }
            entry.size = size;
            entry.readable = true;
            entry.editing = false;
        }
        state.size += size;
        state.touch(digest);
        state.record(format_args!("CLEAN {} {}", digest, size));
        state.redundant_ops += 1;

        let mut evicted = Vec::new();
        self.trim_to_size(state, &mut evicted);
        if !evicted.is_empty() {
            debug!("disk cache evicted {} entries", evicted.len());
        }
        self.compact_if_needed(state);
        state.refresh_stats();
        Ok(true)
    }

    fn abort(&self, digest: &str, tmp: &Path) {
        let _ = fs::remove_file(tmp);
        let mut state = lock(&self.state);
        let Some(entry) = state.entries.get_mut(digest) else {
            return;
        };
        entry.editing = false;
        let (readable, size) = (entry.readable, entry.size);
        if readable {
            // Old contents remain valid.
            state.record(format_args!("CLEAN {} {}", digest, size));
        } else {
            state.entries.remove(digest);
            state.record(format_args!("REMOVE {}", digest));
        }
        state.redundant_ops += 1;
    }

    /// Copy an existing file into the cache under `digest`.
    pub fn put_file<P: AsRef<Path>>(&self, digest: &str, source: P) -> Result<bool, DiskCacheError> {
        let mut file = File::open(source.as_ref())?;
        self.put(digest, |out| io::copy(&mut file, out).is_ok())
    }

    /// Remove an entry. Returns `false` if it was absent or is being written.
    pub fn delete(&self, digest: &str) -> Result<bool, DiskCacheError> {
        Self::validate(digest)?;
        let mut state = lock(&self.state);
        let Some(entry) = state.entries.get(digest).copied() else {
            return Ok(false);
        };
        if entry.editing {
            return Ok(false);
        }
        state.entries.remove(digest);
        if entry.readable {
            state.lru.remove(&entry.tick);
            state.size -= entry.size;
        }
        match fs::remove_file(self.entry_path(digest)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        state.record(format_args!("REMOVE {}", digest));
        state.redundant_ops += 1;
        state.refresh_stats();
        Ok(entry.readable)
    }

    /// Remove every entry. In-flight writes are discarded when they finish.
    pub fn clear(&self) -> Result<(), DiskCacheError> {
        let mut state = lock(&self.state);
        for digest in state.lru.values() {
            let _ = fs::remove_file(self.entry_path(digest));
        }
        let stats = state.stats;
        *state = DiskState::empty(self.max_size);
        state.stats.hits = stats.hits;
        state.stats.misses = stats.misses;
        state.stats.evictions = stats.evictions;
        self.rebuild_journal(&mut state)?;
        state.refresh_stats();
        Ok(())
    }

    /// Check if a readable entry exists without touching recency
    pub fn contains(&self, digest: &str) -> bool {
        lock(&self.state)
            .entries
            .get(digest)
            .is_some_and(|e| e.readable)
    }

    /// Bytes used by readable entries
    pub fn size(&self) -> u64 {
        lock(&self.state).size
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    /// Number of readable entries
    pub fn len(&self) -> usize {
        lock(&self.state).lru.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn directory(&self) -> &Path {
        &self.dir
    }

    pub fn stats(&self) -> DiskCacheStats {
        lock(&self.state).stats
    }
}

/// An open edit of one entry. Dropped without committing, it rolls back.
struct Edit<'a> {
    cache: &'a DiskCache,
    digest: &'a str,
    tmp: PathBuf,
    finished: bool,
}

impl Edit<'_> {
    fn commit(mut self) -> Result<bool, DiskCacheError> {
        self.finished = true;
        self.cache.commit(self.digest, &self.tmp)
    }
}

impl Drop for Edit<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.cache.abort(self.digest, &self.tmp);
        }
    }
}
