//! Strategy registry keyed by (input type, output type)
//!
//! Loaders, decoders and encoders are registered once while configuring the
//! engine and looked up by type when a request is built.

use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::codec::{PngDecoder, PngEncoder};
use crate::error::LoadError;
use crate::loader::{FileLoader, HttpLoader, UrlModel};
use crate::resource::{Bitmap, Resource};
use crate::strategy::{DataFetcher, Decoder, Encoder, ModelLoader, Pipeline};

/// Marker for encoded bytes on either side of a codec
struct EncodedBytes;

type Slot = Box<dyn Any + Send + Sync>;

#[derive(Default)]
pub struct LoaderRegistry {
    entries: HashMap<(TypeId, TypeId), Vec<Slot>>,
}

impl LoaderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// File and HTTP loaders plus the PNG codec for [`Bitmap`].
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry
            .register_loader::<PathBuf>(Arc::new(FileLoader))
            .register_loader::<UrlModel>(Arc::new(HttpLoader::default()))
            .register_decoder::<Bitmap>(Arc::new(PngDecoder))
            .register_encoder::<Bitmap>(Arc::new(PngEncoder));
        registry
    }

    fn push(&mut self, key: (TypeId, TypeId), slot: Slot) -> &mut Self {
        self.entries.entry(key).or_default().push(slot);
        self
    }

    fn slots(&self, key: (TypeId, TypeId)) -> &[Slot] {
        self.entries.get(&key).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Register a loader for models of type `M`. Earlier registrations win.
    pub fn register_loader<M: 'static>(&mut self, loader: Arc<dyn ModelLoader<M>>) -> &mut Self {
        self.push(
            (TypeId::of::<M>(), TypeId::of::<dyn DataFetcher>()),
            Box::new(loader),
        )
    }

    pub fn register_decoder<R: Resource>(&mut self, decoder: Arc<dyn Decoder<R>>) -> &mut Self {
        self.push((TypeId::of::<EncodedBytes>(), TypeId::of::<R>()), Box::new(decoder))
    }

    pub fn register_encoder<R: Resource>(&mut self, encoder: Arc<dyn Encoder<R>>) -> &mut Self {
        self.push((TypeId::of::<R>(), TypeId::of::<EncodedBytes>()), Box::new(encoder))
    }

    /// Build a fetcher with the first registered loader that handles `model`.
    pub fn fetcher<M: 'static>(
        &self,
        model: &M,
        width: u32,
        height: u32,
    ) -> Result<Arc<dyn DataFetcher>, LoadError> {
        self.slots((TypeId::of::<M>(), TypeId::of::<dyn DataFetcher>()))
            .iter()
            .filter_map(|slot| slot.downcast_ref::<Arc<dyn ModelLoader<M>>>())
            .filter(|loader| loader.handles(model))
            .find_map(|loader| loader.build_fetcher(model, width, height))
            .ok_or(LoadError::Unregistered {
                kind: "model loader",
                type_name: type_name::<M>(),
            })
    }

    pub fn decoder<R: Resource>(&self) -> Option<Arc<dyn Decoder<R>>> {
        self.slots((TypeId::of::<EncodedBytes>(), TypeId::of::<R>()))
            .iter()
            .find_map(|slot| slot.downcast_ref::<Arc<dyn Decoder<R>>>())
            .cloned()
    }

    pub fn encoder<R: Resource>(&self) -> Option<Arc<dyn Encoder<R>>> {
        self.slots((TypeId::of::<R>(), TypeId::of::<EncodedBytes>()))
            .iter()
            .find_map(|slot| slot.downcast_ref::<Arc<dyn Encoder<R>>>())
            .cloned()
    }

    /// Assemble a pipeline for `model` from registered strategies.
    ///
    /// The encoder is optional; without one results are not persisted.
    pub fn pipeline<M: 'static, R: Resource>(
        &self,
        model: &M,
        width: u32,
        height: u32,
    ) -> Result<Pipeline<R>, LoadError> {
        let fetcher = self.fetcher(model, width, height)?;
        let decoder = self.decoder::<R>().ok_or(LoadError::Unregistered {
            kind: "decoder",
            type_name: type_name::<R>(),
        })?;
        let mut pipeline = Pipeline::new(fetcher, decoder, width, height);
        if let Some(encoder) = self.encoder::<R>() {
            pipeline = pipeline.encoder(encoder);
        }
        Ok(pipeline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StrategyError;
    use imgload_scheduler::{CancellationToken, Priority};
    use std::io::Read;

    struct NamedFetcher(String);

    impl DataFetcher for NamedFetcher {
        fn load_data(
            &self,
            _priority: Priority,
            _token: &CancellationToken,
        ) -> Result<Box<dyn Read + Send>, StrategyError> {
            Ok(Box::new(std::io::empty()))
        }

        fn id(&self) -> String {
            self.0.clone()
        }
    }

    /// Handles only even numbers.
    struct EvenLoader;

    impl ModelLoader<u32> for EvenLoader {
        fn handles(&self, model: &u32) -> bool {
            model % 2 == 0
        }

        fn build_fetcher(&self, model: &u32, _w: u32, _h: u32) -> Option<Arc<dyn DataFetcher>> {
            Some(Arc::new(NamedFetcher(format!("even:{}", model))))
        }
    }

    struct AnyLoader;

    impl ModelLoader<u32> for AnyLoader {
        fn build_fetcher(&self, model: &u32, _w: u32, _h: u32) -> Option<Arc<dyn DataFetcher>> {
            Some(Arc::new(NamedFetcher(format!("any:{}", model))))
        }
    }

    #[test]
    fn test_first_handling_loader_wins() {
        let mut registry = LoaderRegistry::new();
        registry
            .register_loader::<u32>(Arc::new(EvenLoader))
            .register_loader::<u32>(Arc::new(AnyLoader));

        assert_eq!(registry.fetcher(&4u32, 0, 0).unwrap().id(), "even:4");
        assert_eq!(registry.fetcher(&5u32, 0, 0).unwrap().id(), "any:5");
    }

    #[test]
    fn test_unregistered_model_type() {
        let registry = LoaderRegistry::with_defaults();
        match registry.fetcher(&7u64, 0, 0) {
            Err(LoadError::Unregistered { kind, type_name }) => {
                assert_eq!(kind, "model loader");
                assert_eq!(type_name, "u64");
            }
            other => panic!("unexpected {:?}", other.map(|f| f.id())),
        }
    }

    #[test]
    fn test_defaults_build_bitmap_pipelines() {
        let registry = LoaderRegistry::with_defaults();
        assert!(registry.decoder::<Bitmap>().is_some());
        assert!(registry.encoder::<Bitmap>().is_some());

        let pipeline = registry
            .pipeline::<PathBuf, Bitmap>(&PathBuf::from("/tmp/a.png"), 10, 10)
            .unwrap();
        let key = pipeline.key();
        assert_eq!(key.model_id(), "file:///tmp/a.png");
        assert_eq!((key.width(), key.height()), (10, 10));

        let url = UrlModel::new("https://example.com/cat.png?token=abc");
        let pipeline = registry.pipeline::<UrlModel, Bitmap>(&url, 1, 1).unwrap();
        assert_eq!(pipeline.key().model_id(), "https://example.com/cat.png");
    }
}
