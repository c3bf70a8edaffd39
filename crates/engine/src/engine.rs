//! Load orchestration
//!
//! A load checks the memory cache on the calling thread, attaches to an
//! in-flight job for the same key if there is one, and otherwise starts a
//! job: a disk cache lookup on the disk executor, then (on a miss) a fetch
//! and decode on the source executor. Every caller attached to a job is
//! notified exactly once, in attachment order, with the same instance.
//!
//! A job whose last caller cancels stays in the table until its worker
//! finishes, so a later load for the same key joins it instead of starting a
//! second fetch. No operation holds the jobs lock while touching the memory
//! cache or the buffer pool, and callbacks never run with a lock held.

use std::collections::HashMap;
use std::io::{BufReader, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crossbeam_channel::bounded;
use imgload_cache::{
    BufferPool, DiskCache, DiskCacheError, DiskCacheStats, Key, KeyDigest, MemoryCache,
    MemoryCacheStats, MemoryCategory, MemoryPressure, PoolStats,
};
use imgload_scheduler::{
    CancelOutcome, CancellationToken, ExecutorStats, Priority, PriorityExecutor, TaskId,
};
use log::{debug, warn};

use crate::builder::EngineBuilder;
use crate::error::{LoadError, StrategyError};
use crate::lock;
use crate::registry::LoaderRegistry;
use crate::resource::{recycle, Bitmap, DataSource, Loaded, Resource, ResourceHandle};
use crate::strategy::Pipeline;

/// Outcome delivered to a load callback
pub type LoadResult<R> = Result<Loaded<R>, Arc<LoadError>>;

type Callback<R> = Box<dyn FnOnce(LoadResult<R>) + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Disk,
    Source,
}

struct Caller<R: Resource> {
    id: u64,
    callback: Callback<R>,
}

/// One in-flight load and everyone waiting on it.
///
/// A cancelled token with callers present means callers attached after the
/// previous ones all left; the work is restarted for them if it failed.
struct Job<R: Resource> {
    id: u64,
    callers: Vec<Caller<R>>,
    token: CancellationToken,
    task: Option<(Stage, TaskId)>,
}

/// State carried from stage to stage of a job
struct Work<R: Resource> {
    key: Key,
    job_id: u64,
    pipeline: Arc<Pipeline<R>>,
    priority: Priority,
    token: CancellationToken,
}

/// Snapshot of every cache and executor
#[derive(Debug, Clone, Copy)]
pub struct EngineStats {
    pub memory: MemoryCacheStats,
    pub pool: PoolStats,
    pub disk: Option<DiskCacheStats>,
    pub disk_executor: ExecutorStats,
    pub source_executor: ExecutorStats,
    pub in_flight: usize,
}

trait Detach: Send + Sync {
    fn detach(&self, key: &Key, job_id: u64, caller_id: u64) -> bool;
}

struct Attachment {
    engine: Weak<dyn Detach>,
    key: Key,
    job_id: u64,
    caller_id: u64,
}

/// Returned by [`Engine::load`]. Dropping it does not cancel the load.
pub struct LoadHandle {
    attachment: Option<Attachment>,
}

impl LoadHandle {
    fn finished() -> Self {
        Self { attachment: None }
    }

    /// Detach this caller from its load. The underlying work is cancelled
    /// once no callers remain.
    ///
    /// Returns `false` if the callback already ran or will run anyway.
    pub fn cancel(&self) -> bool {
        let Some(attachment) = &self.attachment else {
            return false;
        };
        match attachment.engine.upgrade() {
            Some(engine) => engine.detach(&attachment.key, attachment.job_id, attachment.caller_id),
            None => false,
        }
    }

    /// True if the callback was invoked before `load` returned.
    pub fn is_immediate(&self) -> bool {
        self.attachment.is_none()
    }
}

pub(crate) struct EngineParts<R: Resource> {
    pub memory: Arc<MemoryCache<Key, R>>,
    pub pool: Arc<BufferPool>,
    pub disk: Option<DiskCache>,
    pub disk_executor: PriorityExecutor,
    pub source_executor: PriorityExecutor,
    pub registry: LoaderRegistry,
}

struct EngineInner<R: Resource> {
    memory: Arc<MemoryCache<Key, R>>,
    pool: Arc<BufferPool>,
    disk: Option<DiskCache>,
    disk_executor: PriorityExecutor,
    source_executor: PriorityExecutor,
    registry: LoaderRegistry,
    jobs: Mutex<HashMap<Key, Job<R>>>,
    next_id: AtomicU64,
    shut_down: AtomicBool,
}

/// Loads resources through the memory cache, the disk cache and the source
/// pipeline, running at most one fetch per key at a time.
///
/// Dropping the engine shuts it down: queued work is discarded and pending
/// callers receive [`LoadError::Cancelled`].
pub struct Engine<R: Resource = Bitmap> {
    inner: Arc<EngineInner<R>>,
}

impl<R: Resource> Engine<R> {
    pub fn builder() -> EngineBuilder<R> {
        EngineBuilder::new()
    }

    pub(crate) fn from_parts(parts: EngineParts<R>) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                memory: parts.memory,
                pool: parts.pool,
                disk: parts.disk,
                disk_executor: parts.disk_executor,
                source_executor: parts.source_executor,
                registry: parts.registry,
                jobs: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    /// Start loading `key` with `pipeline`.
    ///
    /// On a memory cache hit `callback` runs before this returns. Otherwise
    /// it runs later on a worker thread.
    pub fn load<F>(&self, key: Key, pipeline: Pipeline<R>, priority: Priority, callback: F) -> LoadHandle
    where
        F: FnOnce(LoadResult<R>) + Send + 'static,
    {
        self.inner.load(key, pipeline, priority, Box::new(callback))
    }

    /// Load and wait for the result.
    ///
    /// Must not be called from a load callback; it would wait on the worker
    /// it is running on.
    pub fn get(&self, key: Key, pipeline: Pipeline<R>, priority: Priority) -> LoadResult<R> {
        let (tx, rx) = bounded(1);
        self.load(key, pipeline, priority, move |result| {
            let _ = tx.send(result);
        });
        rx.recv().unwrap_or_else(|_| Err(Arc::new(LoadError::Cancelled)))
    }

    /// Build a pipeline for `model` from the registered strategies.
    pub fn pipeline<M: 'static>(&self, model: &M, width: u32, height: u32) -> Result<Pipeline<R>, LoadError> {
        self.inner.registry.pipeline(model, width, height)
    }

    /// Load `model` with the registered strategies and default options.
    pub fn load_model<M, F>(
        &self,
        model: &M,
        width: u32,
        height: u32,
        priority: Priority,
        callback: F,
    ) -> Result<LoadHandle, LoadError>
    where
        M: 'static,
        F: FnOnce(LoadResult<R>) + Send + 'static,
    {
        let pipeline = self.pipeline(model, width, height)?;
        Ok(self.load(pipeline.key(), pipeline, priority, callback))
    }

    pub fn get_model<M: 'static>(&self, model: &M, width: u32, height: u32) -> LoadResult<R> {
        let pipeline = self.pipeline(model, width, height).map_err(Arc::new)?;
        self.get(pipeline.key(), pipeline, Priority::Normal)
    }

    /// Respond to memory pressure. Active resources are never evicted.
    pub fn trim_memory(&self, level: MemoryPressure) {
        self.inner.memory.trim(level);
        self.inner.pool.trim(level);
    }

    /// Drop every inactive cached resource and every idle pooled buffer.
    pub fn clear_memory(&self) {
        self.inner.memory.clear_memory();
        self.inner.pool.clear();
    }

    pub fn set_memory_category(&self, category: MemoryCategory) {
        let multiplier = category.multiplier();
        self.inner.memory.set_size_multiplier(multiplier);
        self.inner.pool.set_size_multiplier(multiplier.min(1.0));
    }

    pub fn clear_disk_cache(&self) -> Result<(), DiskCacheError> {
        match &self.inner.disk {
            Some(disk) => disk.clear(),
            None => Ok(()),
        }
    }

    /// Delete both the result and the source entry for `key`.
    pub fn remove_from_disk_cache(&self, key: &Key) -> Result<bool, DiskCacheError> {
        let Some(disk) = &self.inner.disk else {
            return Ok(false);
        };
        let result = disk.delete(&key.digest())?;
        let source = disk.delete(&key.source_key().digest())?;
        Ok(result || source)
    }

    pub fn disk_cache_size(&self) -> u64 {
        self.inner.disk.as_ref().map_or(0, DiskCache::size)
    }

    /// Seed the source cache for `key` with a local file.
    ///
    /// Only requests using a strategy that reads source entries will see it.
    /// The file is stored as-is, in the form the source encoder decodes.
    pub fn import_to_disk_cache(&self, key: &Key, path: impl AsRef<Path>) -> Result<bool, DiskCacheError> {
        match &self.inner.disk {
            Some(disk) => disk.put_file(&key.source_key().digest(), path),
            None => Ok(false),
        }
    }

    /// Number of keys currently being loaded
    pub fn in_flight(&self) -> usize {
        lock(&self.inner.jobs).len()
    }

    pub fn memory_cache(&self) -> &MemoryCache<Key, R> {
        &self.inner.memory
    }

    pub fn buffer_pool(&self) -> &BufferPool {
        &self.inner.pool
    }

    pub fn disk_cache(&self) -> Option<&DiskCache> {
        self.inner.disk.as_ref()
    }

    pub fn registry(&self) -> &LoaderRegistry {
        &self.inner.registry
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            memory: self.inner.memory.stats(),
            pool: self.inner.pool.stats(),
            disk: self.inner.disk.as_ref().map(DiskCache::stats),
            disk_executor: self.inner.disk_executor.stats(),
            source_executor: self.inner.source_executor.stats(),
            in_flight: self.in_flight(),
        }
    }

    /// Stop both executors and fail every pending load with
    /// [`LoadError::Cancelled`]. Later loads fail the same way.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }
}

impl<R: Resource> Drop for Engine<R> {
    fn drop(&mut self) {
        self.inner.shutdown();
    }
}

impl<R: Resource> EngineInner<R> {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn handle(&self, key: Key, value: Arc<R>) -> ResourceHandle<R> {
        ResourceHandle::new(key, value, self.memory.clone(), self.pool.clone())
    }

    fn load(self: &Arc<Self>, key: Key, pipeline: Pipeline<R>, priority: Priority, callback: Callback<R>) -> LoadHandle {
        if self.shut_down.load(Ordering::Acquire) {
            callback(Err(Arc::new(LoadError::Cancelled)));
            return LoadHandle::finished();
        }
        if let Some(value) = self.memory.acquire(&key) {
            debug!("memory cache hit for {}", key);
            self.deliver_hit(key, value, callback);
            return LoadHandle::finished();
        }

        let mut jobs = lock(&self.jobs);
        // Checked again under the lock so shutdown's drain sees any job added below.
        if self.shut_down.load(Ordering::Acquire) {
            drop(jobs);
            callback(Err(Arc::new(LoadError::Cancelled)));
            return LoadHandle::finished();
        }
        let caller_id = self.next_id();
        if let Some(job) = jobs.get_mut(&key) {
            if job.callers.is_empty() {
                debug!("joining cancelled load of {} until its worker finishes", key);
            } else {
                debug!("joining in-flight load of {}", key);
            }
            job.callers.push(Caller { id: caller_id, callback });
            let job_id = job.id;
            return self.attachment(key, job_id, caller_id);
        }
        // A job may have completed between the first lookup and taking the lock.
        if let Some(value) = self.memory.acquire(&key) {
            drop(jobs);
            self.deliver_hit(key, value, callback);
            return LoadHandle::finished();
        }

        let job_id = self.next_id();
        let token = CancellationToken::new();
        let stage = self.first_stage(&pipeline);
        let work = Arc::new(Work {
            key: key.clone(),
            job_id,
            pipeline: Arc::new(pipeline),
            priority,
            token: token.clone(),
        });
        debug!("starting load of {} ({:?} stage)", key, stage);
        let task = self.submit(stage, work);
        jobs.insert(
            key.clone(),
            Job {
                id: job_id,
                callers: vec![Caller { id: caller_id, callback }],
                token,
                task: Some(task),
            },
        );
        drop(jobs);
        self.attachment(key, job_id, caller_id)
    }

    fn deliver_hit(&self, key: Key, value: Arc<R>, callback: Callback<R>) {
        callback(Ok(Loaded {
            resource: self.handle(key, value),
            data_source: DataSource::MemoryCache,
            is_first_resource: false,
        }));
    }

    fn first_stage(&self, pipeline: &Pipeline<R>) -> Stage {
        if self.disk.is_some() && pipeline.strategy().uses_disk() {
            Stage::Disk
        } else {
            Stage::Source
        }
    }

    /// Run a job's work again under a fresh token, keeping its callers.
    fn resubmit(self: &Arc<Self>, job: &mut Job<R>, work: &Work<R>, stage: Stage) {
        let token = CancellationToken::new();
        let work = Arc::new(Work {
            key: work.key.clone(),
            job_id: work.job_id,
            pipeline: work.pipeline.clone(),
            priority: work.priority,
            token: token.clone(),
        });
        job.token = token;
        job.task = Some(self.submit(stage, work));
    }

    fn attachment(self: &Arc<Self>, key: Key, job_id: u64, caller_id: u64) -> LoadHandle {
        let engine: Weak<Self> = Arc::downgrade(self);
        let engine: Weak<dyn Detach> = engine;
        LoadHandle {
            attachment: Some(Attachment {
                engine,
                key,
                job_id,
                caller_id,
            }),
        }
    }

    fn submit(self: &Arc<Self>, stage: Stage, work: Arc<Work<R>>) -> (Stage, TaskId) {
        let engine = self.clone();
        let priority = work.priority;
        let handle = match stage {
            Stage::Disk => self
                .disk_executor
                .submit(priority, Box::new(move |_| engine.run_disk(work))),
            Stage::Source => self
                .source_executor
                .submit(priority, Box::new(move |_| engine.run_source(work))),
        };
        (stage, handle.id())
    }

    fn run_disk(self: &Arc<Self>, work: Arc<Work<R>>) {
        if work.token.is_cancelled() {
            self.fail(&work, LoadError::Cancelled);
            return;
        }
        let Some(disk) = &self.disk else {
            self.hand_off(work);
            return;
        };
        let strategy = work.pipeline.strategy();

        if strategy.caches_result() {
            let digest = work.key.digest();
            let cached = read_entry(disk, &digest, |reader| {
                work.pipeline.decode_result(reader, &self.pool)
            });
            if let Some(resource) = cached {
                debug!("result cache hit for {}", work.key);
                self.deliver(&work, resource, DataSource::ResultCache);
                return;
            }
        }

        if strategy.caches_source() {
            let digest = work.key.source_key().digest();
            let cached = read_entry(disk, &digest, |reader| {
                work.pipeline.decode_stored_source(reader, &self.pool)
            });
            if let Some(resource) = cached {
                debug!("source cache hit for {}", work.key);
                let delivered = self.deliver(&work, resource, DataSource::SourceCache);
                if let (Some(resource), true) = (delivered, strategy.caches_result()) {
                    self.write_result(disk, &work, &resource);
                }
                return;
            }
        }

        debug!("disk cache miss for {}", work.key);
        self.hand_off(work);
    }

    /// Move a job from the disk stage to the source stage, unless every
    /// caller left meanwhile.
    fn hand_off(self: &Arc<Self>, work: Arc<Work<R>>) {
        let mut jobs = lock(&self.jobs);
        if self.shut_down.load(Ordering::Acquire) {
            return;
        }
        let Some(job) = jobs.get_mut(&work.key).filter(|job| job.id == work.job_id) else {
            return;
        };
        if job.callers.is_empty() {
            jobs.remove(&work.key);
            debug!("load of {} cancelled before fetching", work.key);
        } else if job.token.is_cancelled() {
            self.resubmit(job, &work, Stage::Source);
        } else {
            job.task = Some(self.submit(Stage::Source, work));
        }
    }

    fn run_source(self: &Arc<Self>, work: Arc<Work<R>>) {
        if work.token.is_cancelled() {
            self.fail(&work, LoadError::Cancelled);
            return;
        }
        let pipeline = &work.pipeline;
        let fetcher = pipeline.fetcher();
        let keep_source = self.disk.is_some() && pipeline.strategy().caches_source();
        let fetch_error = |source: StrategyError| LoadError::Fetch {
            model: fetcher.id(),
            source,
        };

        let mut source_bytes = None;
        let outcome = fetcher
            .load_data(work.priority, &work.token)
            .map_err(fetch_error)
            .and_then(|mut stream| {
                if keep_source {
                    let mut bytes = Vec::new();
                    stream
                        .read_to_end(&mut bytes)
                        .map_err(|e| fetch_error(Box::new(e)))?;
                    let resource = pipeline.decode_source(&mut bytes.as_slice(), &self.pool)?;
                    source_bytes = Some(bytes);
                    Ok(resource)
                } else {
                    pipeline.decode_source(&mut stream, &self.pool)
                }
            });
        fetcher.cleanup();

        let delivered = match outcome {
            Ok(resource) => self.deliver(&work, resource, fetcher.data_source()),
            Err(error) => {
                self.fail(&work, error);
                None
            }
        };
        let Some(resource) = delivered else {
            return;
        };

        let write_result = pipeline.strategy().caches_result() && pipeline.result_encoder().is_some();
        if self.disk.is_none() || (source_bytes.is_none() && !write_result) {
            return;
        }
        let engine = self.clone();
        self.disk_executor.submit(
            Priority::Low,
            Box::new(move |_| engine.write_through(&work, source_bytes, resource, write_result)),
        );
    }

    fn write_through(&self, work: &Work<R>, source: Option<Vec<u8>>, resource: Arc<R>, write_result: bool) {
        let Some(disk) = &self.disk else {
            return;
        };
        if let Some(bytes) = source {
            let encoder = work.pipeline.raw_source_encoder();
            write_entry(disk, &work.key.source_key().digest(), |out| encoder.encode(&bytes, out));
        }
        if write_result {
            self.write_result(disk, work, &resource);
        }
    }

    fn write_result(&self, disk: &DiskCache, work: &Work<R>, resource: &R) {
        if let Some(encoder) = work.pipeline.result_encoder() {
            write_entry(disk, &work.key.digest(), |out| encoder.encode(resource, out));
        }
    }

    /// Finish a job with a decoded resource: cache it, then hand every
    /// caller its own reference in attachment order.
    ///
    /// Returns the cached instance, or `None` if no caller was left to take it.
    fn deliver(&self, work: &Work<R>, resource: R, data_source: DataSource) -> Option<Arc<R>> {
        if !self.has_callers(work) {
            debug!("discarding result of cancelled load of {}", work.key);
            recycle(&self.pool, Arc::new(resource));
            return None;
        }

        let size = resource.byte_size();
        let value = Arc::new(resource);
        // The engine's own reference keeps the entry active until every caller has one.
        self.memory
            .put_acquired(work.key.clone(), value.clone(), size, 1);
        let callers = self.take_callers(work);
        let deliveries: Vec<_> = callers
            .into_iter()
            .enumerate()
            .map(|(index, caller)| {
                self.memory.retain(&work.key, &value);
                (caller.callback, self.handle(work.key.clone(), value.clone()), index == 0)
            })
            .collect();
        let _ = self.memory.release(&work.key, value.clone());

        if deliveries.is_empty() {
            debug!("every caller of {} left before delivery", work.key);
            return None;
        }
        debug!(
            "loaded {} from {:?} for {} caller(s)",
            work.key,
            data_source,
            deliveries.len()
        );
        for (callback, resource, is_first_resource) in deliveries {
            callback(Ok(Loaded {
                resource,
                data_source,
                is_first_resource,
            }));
        }
        Some(value)
    }

    /// True if the job for `work` still has callers. A job every caller left
    /// is removed here.
    fn has_callers(&self, work: &Work<R>) -> bool {
        let mut jobs = lock(&self.jobs);
        if self.shut_down.load(Ordering::Acquire) {
            return false;
        }
        let waiting = match jobs.get(&work.key) {
            Some(job) if job.id == work.job_id => !job.callers.is_empty(),
            _ => return false,
        };
        if !waiting {
            jobs.remove(&work.key);
        }
        waiting
    }

    /// Remove the job for `work` and return its callers. After shutdown the
    /// drain owns them instead.
    fn take_callers(&self, work: &Work<R>) -> Vec<Caller<R>> {
        let mut jobs = lock(&self.jobs);
        if self.shut_down.load(Ordering::Acquire) {
            return Vec::new();
        }
        match jobs.get(&work.key) {
            Some(job) if job.id == work.job_id => {}
            _ => return Vec::new(),
        }
        jobs.remove(&work.key).map(|job| job.callers).unwrap_or_default()
    }

    /// Finish a job with an error, or restart it if callers attached after
    /// it was cancelled.
    fn fail(self: &Arc<Self>, work: &Work<R>, error: LoadError) {
        let mut jobs = lock(&self.jobs);
        if self.shut_down.load(Ordering::Acquire) {
            return;
        }
        let Some(job) = jobs.get_mut(&work.key).filter(|job| job.id == work.job_id) else {
            return;
        };
        if job.token.is_cancelled() && !job.callers.is_empty() {
            debug!("restarting load of {} for callers that joined after cancel", work.key);
            let stage = self.first_stage(&work.pipeline);
            self.resubmit(job, work, stage);
            return;
        }
        let callers = jobs.remove(&work.key).map(|job| job.callers).unwrap_or_default();
        drop(jobs);

        if callers.is_empty() {
            debug!("cancelled load of {} stopped", work.key);
            return;
        }
        warn!("load of {} failed: {}", work.key, error);
        let error = Arc::new(error);
        for caller in callers {
            (caller.callback)(Err(error.clone()));
        }
    }

    fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        // Running fetches see this and stop early instead of holding up the joins below.
        for job in lock(&self.jobs).values() {
            job.token.cancel();
        }
        self.disk_executor.shutdown();
        self.source_executor.shutdown();

        let pending: Vec<Job<R>> = lock(&self.jobs).drain().map(|(_, job)| job).collect();
        if !pending.is_empty() {
            debug!("engine shut down with {} pending load(s)", pending.len());
        }
        let error = Arc::new(LoadError::Cancelled);
        for job in pending {
            for caller in job.callers {
                (caller.callback)(Err(error.clone()));
            }
        }
    }
}

impl<R: Resource> Detach for EngineInner<R> {
    fn detach(&self, key: &Key, job_id: u64, caller_id: u64) -> bool {
        let mut jobs = lock(&self.jobs);
        let Some(job) = jobs.get_mut(key).filter(|job| job.id == job_id) else {
            return false;
        };
        let Some(index) = job.callers.iter().position(|caller| caller.id == caller_id) else {
            return false;
        };
        let caller = job.callers.remove(index);
        if job.callers.is_empty() {
            job.token.cancel();
            let outcome = match job.task {
                Some((Stage::Disk, task)) => self.disk_executor.cancel(task),
                Some((Stage::Source, task)) => self.source_executor.cancel(task),
                None => CancelOutcome::NotFound,
            };
            if outcome == CancelOutcome::Signalled {
                // Stays until the worker finishes so the key never runs twice at once.
                debug!("cancelling running load of {}", key);
            } else {
                debug!("cancelled load of {} before it started", key);
                jobs.remove(key);
            }
        }
        drop(jobs);
        drop(caller);
        true
    }
}

/// Decode a disk cache entry. Unreadable entries are deleted and treated as
/// a miss.
fn read_entry<R>(
    disk: &DiskCache,
    digest: &str,
    decode: impl FnOnce(&mut dyn Read) -> Result<R, LoadError>,
) -> Option<R> {
    let mut reader = BufReader::new(disk.get(digest)?);
    match decode(&mut reader) {
        Ok(resource) => Some(resource),
        Err(e) => {
            drop(reader);
            warn!("discarding unreadable disk cache entry {}: {}", digest, e);
            if let Err(e) = disk.delete(digest) {
                warn!("failed to delete disk cache entry {}: {}", digest, e);
            }
            None
        }
    }
}

/// Write a disk cache entry. Failures only cost persistence.
fn write_entry(
    disk: &DiskCache,
    digest: &str,
    encode: impl FnOnce(&mut dyn Write) -> Result<(), StrategyError>,
) {
    let mut failure = None;
    let written = disk.put(digest, |out| match encode(out) {
        Ok(()) => true,
        Err(e) => {
            failure = Some(e);
            false
        }
    });
    match (written, failure) {
        (Ok(true), _) => debug!("wrote disk cache entry {}", digest),
        (Ok(false), Some(source)) => {
            let error = LoadError::Encode {
                key: digest.to_string(),
                source,
            };
            warn!("{}", error);
        }
        (Ok(false), None) => debug!("disk cache entry {} is already being written", digest),
        (Err(e), _) => warn!("failed to write disk cache entry {}: {}", digest, e),
    }
}
