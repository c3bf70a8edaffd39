//! imgload engine
//!
//! Turns a model (a path, a URL, anything with a registered loader) into a
//! decoded resource. Loads go through the in-memory cache, then the disk
//! cache, then the source pipeline; concurrent requests for the same key
//! share one fetch.
//!
//! # Example
//!
//! ```no_run
//! use imgload_engine::{Engine, UrlModel};
//! use imgload_scheduler::Priority;
//!
//! let engine: Engine = Engine::builder().build()?;
//! let model = UrlModel::new("https://example.com/cat.png");
//!
//! engine.load_model(&model, 256, 256, Priority::High, |result| match result {
//!     Ok(loaded) => println!("{}x{} from {:?}", loaded.resource.width(), loaded.resource.height(), loaded.data_source),
//!     Err(e) => eprintln!("{}", e),
//! })?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod builder;
mod codec;
mod engine;
mod error;
mod loader;
mod registry;
mod resource;
mod strategy;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use builder::EngineBuilder;
pub use codec::{PngDecoder, PngEncoder};
pub use engine::{Engine, EngineStats, LoadHandle, LoadResult};
pub use error::{BuildError, LoadError, StrategyError};
pub use loader::{FileFetcher, FileLoader, HttpFetcher, HttpLoader, UrlModel};
pub use registry::LoaderRegistry;
pub use resource::{Bitmap, DataSource, Loaded, Resource, ResourceHandle};
pub use strategy::{
    DataFetcher, Decoder, DiskCacheStrategy, Encoder, ModelLoader, Pipeline, SourceEncoder,
    StreamSourceEncoder, Transformation,
};

/// Lock a mutex, recovering the guard if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
