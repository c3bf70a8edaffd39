//! Cache keys for decoded resources
//!
//! A [`Key`] identifies one unit of cacheable work: the model, the requested
//! size, every transformation applied, and the strategies that produce and
//! persist the bytes. Keys hash into the in-memory cache directly and into the
//! disk cache through a BLAKE3 digest of an unambiguous, length-prefixed
//! encoding of every component.

use std::fmt;

/// Hex digest naming a disk cache entry
pub type Digest = String;

/// Anything that can feed itself into a running digest.
pub trait KeyDigest {
    /// Write every identifying component into `hasher`.
    fn update_digest(&self, hasher: &mut blake3::Hasher);

    /// Finish a fresh hasher over this value and return its hex digest.
    fn digest(&self) -> Digest {
        let mut hasher = blake3::Hasher::new();
        self.update_digest(&mut hasher);
        hasher.finalize().to_hex().to_string()
    }
}

fn write_bytes(hasher: &mut blake3::Hasher, bytes: &[u8]) {
    hasher.update(&(bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

fn write_str(hasher: &mut blake3::Hasher, value: &str) {
    write_bytes(hasher, value.as_bytes());
}

/// Identity of a fully resolved resource request.
///
/// Two keys are equal iff every component is equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Key {
    model_id: String,
    width: u32,
    height: u32,
    transformations: Vec<String>,
    decoder_id: String,
    cache_decoder_id: String,
    encoder_id: String,
    source_encoder_id: String,
    signature: Vec<u8>,
}

impl Key {
    /// Start building a key for the given model identity.
    pub fn builder(model_id: impl Into<String>) -> KeyBuilder {
        KeyBuilder {
            key: Key {
                model_id: model_id.into(),
                width: 0,
                height: 0,
                transformations: Vec::new(),
                decoder_id: String::new(),
                cache_decoder_id: String::new(),
                encoder_id: String::new(),
                source_encoder_id: String::new(),
                signature: Vec::new(),
            },
        }
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn transformations(&self) -> &[String] {
        &self.transformations
    }

    pub fn signature(&self) -> &[u8] {
        &self.signature
    }

    /// The key under which raw fetched bytes for this model are cached.
    ///
    /// Size, transformations and result codecs do not affect the source
    /// bytes, so every key for the same model, signature and source encoder
    /// shares one source entry.
    pub fn source_key(&self) -> SourceKey {
        SourceKey {
            model_id: self.model_id.clone(),
            source_encoder_id: self.source_encoder_id.clone(),
            signature: self.signature.clone(),
        }
    }
}

impl KeyDigest for Key {
    fn update_digest(&self, hasher: &mut blake3::Hasher) {
        write_str(hasher, &self.model_id);
        write_bytes(hasher, &self.signature);
        hasher.update(&self.width.to_le_bytes());
        hasher.update(&self.height.to_le_bytes());
        hasher.update(&(self.transformations.len() as u64).to_le_bytes());
        for id in &self.transformations {
            write_str(hasher, id);
        }
        write_str(hasher, &self.decoder_id);
        write_str(hasher, &self.cache_decoder_id);
        write_str(hasher, &self.encoder_id);
        write_str(hasher, &self.source_encoder_id);
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}x{}", self.model_id, self.width, self.height)?;
        if !self.transformations.is_empty() {
            write!(f, "[{}]", self.transformations.join(","))?;
        }
        Ok(())
    }
}

/// Builder for [`Key`].
#[derive(Debug, Clone)]
pub struct KeyBuilder {
    key: Key,
}

impl KeyBuilder {
    pub fn size(mut self, width: u32, height: u32) -> Self {
        self.key.width = width;
        self.key.height = height;
        self
    }

    /// Append a transformation identity. Order matters.
    pub fn transformation(mut self, id: impl Into<String>) -> Self {
        self.key.transformations.push(id.into());
        self
    }

    pub fn decoder(mut self, id: impl Into<String>) -> Self {
        self.key.decoder_id = id.into();
        self
    }

    pub fn cache_decoder(mut self, id: impl Into<String>) -> Self {
        self.key.cache_decoder_id = id.into();
        self
    }

    pub fn encoder(mut self, id: impl Into<String>) -> Self {
        self.key.encoder_id = id.into();
        self
    }

    pub fn source_encoder(mut self, id: impl Into<String>) -> Self {
        self.key.source_encoder_id = id.into();
        self
    }

    /// Opaque cache-busting signature (e.g. a version or mtime).
    pub fn signature(mut self, signature: impl Into<Vec<u8>>) -> Self {
        self.key.signature = signature.into();
        self
    }

    pub fn build(self) -> Key {
        self.key
    }
}

/// Key for the raw source bytes of a model, independent of decoding.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceKey {
    model_id: String,
    source_encoder_id: String,
    signature: Vec<u8>,
}

impl SourceKey {
    pub fn model_id(&self) -> &str {
        &self.model_id
    }
}

impl KeyDigest for SourceKey {
    fn update_digest(&self, hasher: &mut blake3::Hasher) {
        hasher.update(b"source");
        write_str(hasher, &self.model_id);
        write_str(hasher, &self.source_encoder_id);
        write_bytes(hasher, &self.signature);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    fn std_hash<T: Hash>(value: &T) -> u64 {
        let mut hasher = DefaultHasher::new();
        value.hash(&mut hasher);
        hasher.finish()
    }

    fn sample() -> Key {
        Key::builder("https://example.com/cat.gif")
            .size(200, 100)
            .transformation("center-crop")
            .decoder("png")
            .encoder("png")
            .build()
    }

    #[test]
    fn test_equal_keys_hash_and_digest_alike() {
        let a = sample();
        let b = sample();
        assert_eq!(a, b);
        assert_eq!(std_hash(&a), std_hash(&b));
        assert_eq!(a.digest(), b.digest());
    }

    #[test]
    fn test_digest_is_filename_safe_hex() {
        let digest = sample().digest();
        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_every_component_changes_digest() {
        let base = sample().digest();
        let variants = [
            Key::builder("https://example.com/dog.gif")
                .size(200, 100)
                .transformation("center-crop")
                .decoder("png")
                .encoder("png")
                .build(),
            Key::builder("https://example.com/cat.gif")
                .size(201, 100)
                .transformation("center-crop")
                .decoder("png")
                .encoder("png")
                .build(),
            Key::builder("https://example.com/cat.gif")
                .size(200, 100)
                .decoder("png")
                .encoder("png")
                .build(),
            Key::builder("https://example.com/cat.gif")
                .size(200, 100)
                .transformation("center-crop")
                .decoder("png")
                .encoder("jpeg")
                .build(),
            Key::builder("https://example.com/cat.gif")
                .size(200, 100)
                .transformation("center-crop")
                .decoder("png")
                .encoder("png")
                .signature(b"v2".to_vec())
                .build(),
        ];
        for variant in &variants {
            assert_ne!(variant.digest(), base, "{variant} collided with base");
        }
    }

    #[test]
    fn test_identity_boundaries_are_unambiguous() {
        // "ab" + "c" and "a" + "bc" concatenate identically.
        let a = Key::builder("m").transformation("ab").transformation("c").build();
        let b = Key::builder("m").transformation("a").transformation("bc").build();
        assert_ne!(a.digest(), b.digest());

        let c = Key::builder("m").decoder("xy").encoder("").build();
        let d = Key::builder("m").decoder("x").encoder("y").build();
        assert_ne!(c.digest(), d.digest());
    }

    #[test]
    fn test_source_key_ignores_size_and_codecs() {
        let small = Key::builder("file:///a.png").size(10, 10).build();
        let large = Key::builder("file:///a.png")
            .size(1000, 1000)
            .transformation("blur")
            .build();
        assert_eq!(small.source_key(), large.source_key());
        assert_eq!(small.source_key().digest(), large.source_key().digest());
        assert_ne!(small.source_key().digest(), small.digest());
    }

    #[test]
    fn test_source_key_tracks_source_encoder() {
        let stream = Key::builder("file:///a.png").source_encoder("stream").build();
        let packed = Key::builder("file:///a.png").source_encoder("packed").build();
        assert_ne!(stream.source_key(), packed.source_key());
        assert_ne!(stream.source_key().digest(), packed.source_key().digest());
    }

    #[test]
    fn test_display() {
        assert_eq!(
            sample().to_string(),
            "https://example.com/cat.gif@200x100[center-crop]"
        );
    }
}
