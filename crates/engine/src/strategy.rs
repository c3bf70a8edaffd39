//! Pluggable strategies and the per-request pipeline
//!
//! Every strategy reports a stable identity string. Identities of every
//! strategy that shapes the output bytes are folded into the request [`Key`],
//! so changing a codec or transformation never serves stale cached bytes.

use std::io::{Read, Write};
use std::sync::Arc;

use imgload_cache::{BufferPool, Key};
use imgload_scheduler::{CancellationToken, Priority};

use crate::error::{LoadError, StrategyError};
use crate::resource::{DataSource, Resource};

/// Produces the raw bytes for one model.
pub trait DataFetcher: Send + Sync {
    /// Open a stream over the model's bytes.
    ///
    /// Implementations should check `token` before any slow step; the engine
    /// discards whatever a cancelled fetch returns.
    fn load_data(
        &self,
        priority: Priority,
        token: &CancellationToken,
    ) -> Result<Box<dyn Read + Send>, StrategyError>;

    /// Release resources held for the fetch. Called once after decoding,
    /// whether or not it succeeded.
    fn cleanup(&self) {}

    /// Stable cache identity of the model being fetched.
    fn id(&self) -> String;

    fn data_source(&self) -> DataSource {
        DataSource::Remote
    }
}

/// Turns a model of type `M` into a [`DataFetcher`].
pub trait ModelLoader<M>: Send + Sync {
    fn handles(&self, _model: &M) -> bool {
        true
    }

    fn build_fetcher(&self, model: &M, width: u32, height: u32) -> Option<Arc<dyn DataFetcher>>;
}

/// Decodes bytes into a resource.
pub trait Decoder<R>: Send + Sync {
    fn id(&self) -> &str;

    fn decode(
        &self,
        source: &mut dyn Read,
        width: u32,
        height: u32,
        pool: &BufferPool,
    ) -> Result<R, StrategyError>;
}

/// Derives a new resource from a decoded one, e.g. a crop or resize.
pub trait Transformation<R>: Send + Sync {
    fn id(&self) -> String;

    /// Consumes the input; implementations that allocate a new resource
    /// should hand the input's buffer back to `pool`.
    fn transform(
        &self,
        resource: R,
        width: u32,
        height: u32,
        pool: &BufferPool,
    ) -> Result<R, StrategyError>;
}

/// Serializes a decoded resource for the disk cache.
pub trait Encoder<R>: Send + Sync {
    fn id(&self) -> &str;

    fn encode(&self, resource: &R, out: &mut dyn Write) -> Result<(), StrategyError>;
}

/// Serializes fetched source bytes for the disk cache and reads them back.
pub trait SourceEncoder: Send + Sync {
    fn id(&self) -> &str;

    fn encode(&self, data: &[u8], out: &mut dyn Write) -> Result<(), StrategyError>;

    /// Undo [`encode`](SourceEncoder::encode), yielding the original bytes.
    fn decode<'a>(&self, stored: &'a mut dyn Read) -> Result<Box<dyn Read + 'a>, StrategyError>;
}

/// Stores source bytes unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamSourceEncoder;

impl SourceEncoder for StreamSourceEncoder {
    fn id(&self) -> &str {
        "imgload.stream"
    }

    fn encode(&self, data: &[u8], out: &mut dyn Write) -> Result<(), StrategyError> {
        out.write_all(data)?;
        Ok(())
    }

    fn decode<'a>(&self, stored: &'a mut dyn Read) -> Result<Box<dyn Read + 'a>, StrategyError> {
        Ok(Box::new(stored))
    }
}

/// What a request persists to the disk cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DiskCacheStrategy {
    /// Bypass the disk cache
    None,
    /// Raw fetched bytes, shared by every size and transformation of a model
    Source,
    /// Transformed, encoded resource for this exact key
    #[default]
    Result,
    /// Both
    All,
}

impl DiskCacheStrategy {
    pub fn caches_source(self) -> bool {
        matches!(self, DiskCacheStrategy::Source | DiskCacheStrategy::All)
    }

    pub fn caches_result(self) -> bool {
        matches!(self, DiskCacheStrategy::Result | DiskCacheStrategy::All)
    }

    pub fn uses_disk(self) -> bool {
        self != DiskCacheStrategy::None
    }
}

/// Strategies for a single request: fetch, decode, transform, encode.
pub struct Pipeline<R> {
    fetcher: Arc<dyn DataFetcher>,
    decoder: Arc<dyn Decoder<R>>,
    cache_decoder: Arc<dyn Decoder<R>>,
    transformations: Vec<Arc<dyn Transformation<R>>>,
    encoder: Option<Arc<dyn Encoder<R>>>,
    source_encoder: Arc<dyn SourceEncoder>,
    disk_cache_strategy: DiskCacheStrategy,
    width: u32,
    height: u32,
    signature: Vec<u8>,
}

impl<R: Resource> Pipeline<R> {
    /// Pipeline with no transformations, no result encoder and the default
    /// disk cache strategy. Cached results are decoded with `decoder` too.
    pub fn new(
        fetcher: Arc<dyn DataFetcher>,
        decoder: Arc<dyn Decoder<R>>,
        width: u32,
        height: u32,
    ) -> Self {
        Self {
            fetcher,
            cache_decoder: decoder.clone(),
            decoder,
            transformations: Vec::new(),
            encoder: None,
            source_encoder: Arc::new(StreamSourceEncoder),
            disk_cache_strategy: DiskCacheStrategy::default(),
            width,
            height,
            signature: Vec::new(),
        }
    }

    /// Decoder for bytes written by `encoder` into the result cache.
    pub fn cache_decoder(mut self, decoder: Arc<dyn Decoder<R>>) -> Self {
        self.cache_decoder = decoder;
        self
    }

    /// Append a transformation. Applied in insertion order.
    pub fn transform(mut self, transformation: Arc<dyn Transformation<R>>) -> Self {
        self.transformations.push(transformation);
        self
    }

    pub fn encoder(mut self, encoder: Arc<dyn Encoder<R>>) -> Self {
        self.encoder = Some(encoder);
        self
    }

    pub fn source_encoder(mut self, encoder: Arc<dyn SourceEncoder>) -> Self {
        self.source_encoder = encoder;
        self
    }

    pub fn disk_cache_strategy(mut self, strategy: DiskCacheStrategy) -> Self {
        self.disk_cache_strategy = strategy;
        self
    }

    /// Cache-busting signature, e.g. a file's modification time.
    pub fn signature(mut self, signature: impl Into<Vec<u8>>) -> Self {
        self.signature = signature.into();
        self
    }

    pub fn strategy(&self) -> DiskCacheStrategy {
        self.disk_cache_strategy
    }

    pub fn fetcher(&self) -> &Arc<dyn DataFetcher> {
        &self.fetcher
    }

    pub(crate) fn result_encoder(&self) -> Option<&Arc<dyn Encoder<R>>> {
        self.encoder.as_ref()
    }

    pub(crate) fn raw_source_encoder(&self) -> &Arc<dyn SourceEncoder> {
        &self.source_encoder
    }

    /// The key identifying this pipeline's output.
    pub fn key(&self) -> Key {
        let mut builder = Key::builder(self.fetcher.id())
            .size(self.width, self.height)
            .decoder(self.decoder.id())
            .cache_decoder(self.cache_decoder.id())
            .source_encoder(self.source_encoder.id())
            .signature(self.signature.clone());
        for transformation in &self.transformations {
            builder = builder.transformation(transformation.id());
        }
        if let Some(encoder) = &self.encoder {
            builder = builder.encoder(encoder.id());
        }
        builder.build()
    }

    /// Decode previously encoded result bytes. No transformations apply.
    pub(crate) fn decode_result(
        &self,
        source: &mut dyn Read,
        pool: &BufferPool,
    ) -> Result<R, LoadError> {
        self.cache_decoder
            .decode(source, self.width, self.height, pool)
            .map_err(|source| LoadError::Decode {
                model: self.fetcher.id(),
                source,
            })
    }

    /// Decode a source cache entry written through the source encoder.
    pub(crate) fn decode_stored_source(
        &self,
        stored: &mut dyn Read,
        pool: &BufferPool,
    ) -> Result<R, LoadError> {
        let mut source = self
            .source_encoder
            .decode(stored)
            .map_err(|source| LoadError::Decode {
                model: self.fetcher.id(),
                source,
            })?;
        self.decode_source(&mut source, pool)
    }

    /// Decode source bytes and apply every transformation.
    pub(crate) fn decode_source(
        &self,
        source: &mut dyn Read,
        pool: &BufferPool,
    ) -> Result<R, LoadError> {
        let decode_error = |source| LoadError::Decode {
            model: self.fetcher.id(),
            source,
        };
        let mut resource = self
            .decoder
            .decode(source, self.width, self.height, pool)
            .map_err(decode_error)?;
        for transformation in &self.transformations {
            resource = transformation
                .transform(resource, self.width, self.height, pool)
                .map_err(decode_error)?;
        }
        Ok(resource)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::Bitmap;
    use imgload_cache::KeyDigest;
    use std::io::Cursor;

    struct StaticFetcher(&'static str);

    impl DataFetcher for StaticFetcher {
        fn load_data(
            &self,
            _priority: Priority,
            _token: &CancellationToken,
        ) -> Result<Box<dyn Read + Send>, StrategyError> {
            Ok(Box::new(Cursor::new(vec![1u8; 4])))
        }

        fn id(&self) -> String {
            self.0.to_string()
        }
    }

    /// Reads one RGBA pixel.
    struct PixelDecoder;

    impl Decoder<Bitmap> for PixelDecoder {
        fn id(&self) -> &str {
            "pixel"
        }

        fn decode(
            &self,
            source: &mut dyn Read,
            _width: u32,
            _height: u32,
            _pool: &BufferPool,
        ) -> Result<Bitmap, StrategyError> {
            let mut pixel = vec![0u8; 4];
            source.read_exact(&mut pixel)?;
            Ok(Bitmap::from_rgba(1, 1, pixel).ok_or("bad pixel")?)
        }
    }

    struct Invert;

    impl Transformation<Bitmap> for Invert {
        fn id(&self) -> String {
            "invert".to_string()
        }

        fn transform(
            &self,
            mut resource: Bitmap,
            _width: u32,
            _height: u32,
            _pool: &BufferPool,
        ) -> Result<Bitmap, StrategyError> {
            for byte in resource.pixels_mut() {
                *byte = 255 - *byte;
            }
            Ok(resource)
        }
    }

    fn pipeline(model: &'static str) -> Pipeline<Bitmap> {
        Pipeline::new(Arc::new(StaticFetcher(model)), Arc::new(PixelDecoder), 1, 1)
    }

    #[test]
    fn test_disk_cache_strategy_flags() {
        assert_eq!(DiskCacheStrategy::default(), DiskCacheStrategy::Result);
        assert!(DiskCacheStrategy::All.caches_source() && DiskCacheStrategy::All.caches_result());
        assert!(DiskCacheStrategy::Source.caches_source());
        assert!(!DiskCacheStrategy::Source.caches_result());
        assert!(!DiskCacheStrategy::None.uses_disk());
    }

    #[test]
    fn test_key_reflects_strategies() {
        let plain = pipeline("m").key();
        let transformed = pipeline("m").transform(Arc::new(Invert)).key();
        let signed = pipeline("m").signature(b"v2".to_vec()).key();

        assert_eq!(plain.model_id(), "m");
        assert_eq!(transformed.transformations(), ["invert".to_string()]);
        assert_ne!(plain.digest(), transformed.digest());
        assert_ne!(plain.digest(), signed.digest());
        assert_eq!(plain, pipeline("m").key());
        // Source bytes do not depend on transformations.
        assert_eq!(plain.source_key(), transformed.source_key());
    }

    #[test]
    fn test_decode_source_applies_transformations_in_order() {
        let pool = BufferPool::new(1024);
        let p = pipeline("m").transform(Arc::new(Invert)).transform(Arc::new(Invert));
        let bitmap = p.decode_source(&mut Cursor::new(vec![10, 20, 30, 40]), &pool).unwrap();
        assert_eq!(bitmap.pixels(), &[10, 20, 30, 40]);

        let once = pipeline("m").transform(Arc::new(Invert));
        let bitmap = once.decode_source(&mut Cursor::new(vec![0, 0, 0, 255]), &pool).unwrap();
        assert_eq!(bitmap.pixels(), &[255, 255, 255, 0]);
    }

    #[test]
    fn test_decode_failure_is_a_decode_error() {
        let pool = BufferPool::new(1024);
        let err = pipeline("broken")
            .decode_source(&mut Cursor::new(vec![1u8]), &pool)
            .unwrap_err();
        assert!(matches!(err, LoadError::Decode { ref model, .. } if model == "broken"));
    }

    #[test]
    fn test_stream_source_encoder_copies_bytes() {
        let mut out = Vec::new();
        StreamSourceEncoder.encode(b"raw", &mut out).unwrap();
        assert_eq!(out, b"raw");

        let mut stored = Cursor::new(out);
        let mut back = Vec::new();
        StreamSourceEncoder.decode(&mut stored).unwrap().read_to_end(&mut back).unwrap();
        assert_eq!(back, b"raw");
    }

    /// Stores the bytes reversed.
    struct Reversed;

    impl SourceEncoder for Reversed {
        fn id(&self) -> &str {
            "reversed"
        }

        fn encode(&self, data: &[u8], out: &mut dyn Write) -> Result<(), StrategyError> {
            let reversed: Vec<u8> = data.iter().rev().copied().collect();
            out.write_all(&reversed)?;
            Ok(())
        }

        fn decode<'a>(&self, stored: &'a mut dyn Read) -> Result<Box<dyn Read + 'a>, StrategyError> {
            let mut data = Vec::new();
            stored.read_to_end(&mut data)?;
            data.reverse();
            Ok(Box::new(Cursor::new(data)))
        }
    }

    #[test]
    fn test_stored_source_goes_back_through_source_encoder() {
        let pool = BufferPool::new(1024);
        let p = pipeline("m").source_encoder(Arc::new(Reversed));
        assert_ne!(p.key().source_key(), pipeline("m").key().source_key());

        let mut stored = Vec::new();
        Reversed.encode(&[1, 2, 3, 4], &mut stored).unwrap();
        let bitmap = p.decode_stored_source(&mut Cursor::new(stored), &pool).unwrap();
        assert_eq!(bitmap.pixels(), &[1, 2, 3, 4]);
    }
}
