//! PNG codec for [`Bitmap`] resources

use std::io::{Cursor, Read, Write};

use image::codecs::png::{PngDecoder as ImagePngDecoder, PngEncoder as ImagePngEncoder};
use image::{ColorType, DynamicImage, ExtendedColorType, ImageDecoder, ImageEncoder};
use imgload_cache::{BufferPool, PixelFormat, PooledBuffer};

use crate::error::StrategyError;
use crate::resource::Bitmap;
use crate::strategy::{Decoder, Encoder};

/// Decodes PNG data into an RGBA8888 bitmap, reusing a pooled buffer of the
/// decoded dimensions when one is idle.
///
/// RGBA8 images decode straight into the buffer; other color types are
/// converted first.
#[derive(Debug, Clone, Copy, Default)]
pub struct PngDecoder;

impl Decoder<Bitmap> for PngDecoder {
    fn id(&self) -> &str {
        "imgload.png.decoder"
    }

    fn decode(
        &self,
        source: &mut dyn Read,
        _width: u32,
        _height: u32,
        pool: &BufferPool,
    ) -> Result<Bitmap, StrategyError> {
        let mut bytes = Vec::new();
        source.read_to_end(&mut bytes)?;
        let decoder = ImagePngDecoder::new(Cursor::new(bytes))?;
        let (width, height) = decoder.dimensions();

        if decoder.color_type() != ColorType::Rgba8 {
            let image = DynamicImage::from_decoder(decoder)?.into_rgba8();
            let mut buffer = dirty_buffer(pool, width, height);
            buffer.data_mut().copy_from_slice(image.as_raw());
            return Ok(Bitmap::new(buffer));
        }

        let mut buffer = dirty_buffer(pool, width, height);
        if decoder.total_bytes() != buffer.byte_size() as u64 {
            pool.put(buffer);
            return Err(format!("unexpected PNG size for {}x{}", width, height).into());
        }
        if let Err(e) = decoder.read_image(buffer.data_mut()) {
            pool.put(buffer);
            return Err(e.into());
        }
        Ok(Bitmap::new(buffer))
    }
}

/// Every byte is overwritten by the caller, so a dirty buffer is fine.
fn dirty_buffer(pool: &BufferPool, width: u32, height: u32) -> PooledBuffer {
    pool.get_dirty(width, height, PixelFormat::Rgba8888)
        .unwrap_or_else(|| PooledBuffer::new(width, height, PixelFormat::Rgba8888))
}

/// Encodes RGBA8888 bitmaps as PNG.
#[derive(Debug, Clone, Copy, Default)]
pub struct PngEncoder;

impl Encoder<Bitmap> for PngEncoder {
    fn id(&self) -> &str {
        "imgload.png.encoder"
    }

    fn encode(&self, bitmap: &Bitmap, out: &mut dyn Write) -> Result<(), StrategyError> {
        if bitmap.format() != PixelFormat::Rgba8888 {
            return Err(format!("cannot encode {:?} pixels as PNG", bitmap.format()).into());
        }
        ImagePngEncoder::new(out).write_image(
            bitmap.pixels(),
            bitmap.width(),
            bitmap.height(),
            ExtendedColorType::Rgba8,
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(width: u32, height: u32) -> Bitmap {
        let pixels = (0..width * height)
            .flat_map(|i| [(i % 256) as u8, (i / 7 % 256) as u8, 128, 255])
            .collect();
        Bitmap::from_rgba(width, height, pixels).unwrap()
    }

    #[test]
    fn test_encoded_bitmap_decodes_to_same_pixels() {
        let pool = BufferPool::new(1024 * 1024);
        let original = gradient(17, 9);

        let mut png = Vec::new();
        PngEncoder.encode(&original, &mut png).unwrap();
        assert_eq!(&png[1..4], b"PNG");

        let decoded = PngDecoder.decode(&mut Cursor::new(png), 0, 0, &pool).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (17, 9));
        assert_eq!(decoded.format(), PixelFormat::Rgba8888);
        assert_eq!(decoded.pixels(), original.pixels());
    }

    #[test]
    fn test_decoder_reuses_pooled_buffer() {
        let pool = BufferPool::new(1024 * 1024);
        let mut png = Vec::new();
        PngEncoder.encode(&gradient(8, 8), &mut png).unwrap();

        pool.put(PooledBuffer::new(8, 8, PixelFormat::Rgba8888));
        assert_eq!(pool.stats().buffer_count, 1);
        PngDecoder.decode(&mut Cursor::new(png), 0, 0, &pool).unwrap();
        assert_eq!(pool.stats().buffer_count, 0);
        assert_eq!(pool.stats().hits, 1);
    }

    #[test]
    fn test_rgb_png_is_expanded_to_rgba() {
        let pool = BufferPool::new(1024 * 1024);
        let mut png = Vec::new();
        ImagePngEncoder::new(&mut png)
            .write_image(&[10, 20, 30, 40, 50, 60], 2, 1, ExtendedColorType::Rgb8)
            .unwrap();

        let decoded = PngDecoder.decode(&mut Cursor::new(png), 0, 0, &pool).unwrap();
        assert_eq!(decoded.pixels(), &[10, 20, 30, 255, 40, 50, 60, 255]);
    }

    #[test]
    fn test_garbage_is_a_decode_error() {
        let pool = BufferPool::new(1024);
        let result = PngDecoder.decode(&mut Cursor::new(b"not a png".to_vec()), 0, 0, &pool);
        assert!(result.is_err());
    }

    #[test]
    fn test_encoder_rejects_other_formats() {
        let bitmap = Bitmap::new(PooledBuffer::new(2, 2, PixelFormat::Alpha8));
        assert!(PngEncoder.encode(&bitmap, &mut Vec::new()).is_err());
    }
}
