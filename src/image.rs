use anyhow::Context;
use std::fmt;
use tracing::debug;
use zune_core::{colorspace::ColorSpace, options::DecoderOptions};
use zune_jpeg::JpegDecoder;

/// Fixed inference shape the engine expects. No aspect-ratio preservation;
/// denormalization downstream compensates using the recorded original size.
pub const INFERENCE_WIDTH: usize = 640;
pub const INFERENCE_HEIGHT: usize = 640;

/// Reusable RGB8 pixel buffer.
#[derive(Default)]
pub struct Image {
    pub width: usize,
    pub height: usize,
    pub pixels: Vec<u8>,
}

impl Image {
    pub fn resize(&mut self, size: usize) {
        self.pixels.resize(size, 0);
    }
}

impl fmt::Display for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Resolution: {}x{}", self.width, self.height)
    }
}

/// Decode compressed image bytes into `image` as tightly packed RGB8.
///
/// JPEG payloads take the zune-jpeg fast path; everything else goes through
/// the `image` crate's format sniffing. Fails only if no supported decoder
/// accepts the bytes.
pub fn decode_image(data: &[u8], image: &mut Image) -> anyhow::Result<()> {
    if decode_jpeg(data, image).is_ok() {
        return Ok(());
    }
    decode_any(data, image)
}

fn decode_jpeg(jpeg: &[u8], image: &mut Image) -> anyhow::Result<()> {
    let options = DecoderOptions::default()
        .set_strict_mode(true)
        .set_use_unsafe(true)
        .jpeg_set_out_colorspace(ColorSpace::RGB);
    let mut decoder = JpegDecoder::new_with_options(jpeg, options);
    // Headers first to learn the output buffer size
    decoder.decode_headers()?;
    let output_buffer_size = decoder
        .output_buffer_size()
        .ok_or_else(|| anyhow::anyhow!("Failed to get decoder output buffer size"))?;
    image.resize(output_buffer_size);
    decoder.decode_into(&mut image.pixels)?;
    let (width, height) = decoder
        .dimensions()
        .ok_or_else(|| anyhow::anyhow!("Failed to get image dimensions"))?;
    image.width = width;
    image.height = height;
    Ok(())
}

fn decode_any(data: &[u8], image: &mut Image) -> anyhow::Result<()> {
    let decoded = image::load_from_memory(data).context("unsupported or corrupt image data")?;
    let rgb = decoded.to_rgb8();
    image.width = rgb.width() as usize;
    image.height = rgb.height() as usize;
    image.pixels.clear();
    image.pixels.extend_from_slice(rgb.as_raw());
    Ok(())
}

pub struct Resizer {
    resizer: fast_image_resize::Resizer,
    target_width: usize,
    target_height: usize,
}

impl Default for Resizer {
    fn default() -> Self {
        Self {
            resizer: fast_image_resize::Resizer::new(),
            target_width: INFERENCE_WIDTH,
            target_height: INFERENCE_HEIGHT,
        }
    }
}

impl Resizer {
    pub fn resize_image(
        &mut self,
        original_image: &mut Image,
        resized_image: &mut Image,
    ) -> anyhow::Result<()> {
        debug!(
            "Resizing image from {}x{} to {}x{}",
            original_image.width, original_image.height, self.target_width, self.target_height
        );
        let src_image = fast_image_resize::images::Image::from_slice_u8(
            original_image.width as u32,
            original_image.height as u32,
            &mut original_image.pixels,
            fast_image_resize::PixelType::U8x3,
        )?;

        if resized_image.height != self.target_height {
            resized_image.height = self.target_height
        }

        if resized_image.width != self.target_width {
            resized_image.width = self.target_width
        }

        resized_image.resize(self.target_width * self.target_height * 3);

        let mut dst_image = fast_image_resize::images::Image::from_slice_u8(
            resized_image.width as u32,
            resized_image.height as u32,
            &mut resized_image.pixels,
            fast_image_resize::PixelType::U8x3,
        )?;

        self.resizer.resize(&src_image, &mut dst_image, None)?;

        Ok(())
    }
}
