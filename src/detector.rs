use crate::{
    engine::{InferenceEngine, OrtEngine},
    error::Error,
    image::{INFERENCE_HEIGHT, INFERENCE_WIDTH, Image, Resizer, decode_image},
    postprocess::{Detections, PostprocessConfig, postprocess},
};
use bytes::Bytes;
use ndarray::{Array, Array2, Array4, arr2};
use std::{path::PathBuf, time::Instant};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct DetectorConfig {
    pub model: PathBuf,
    pub confidence_threshold: f32,
    pub top_k: usize,
    pub intra_threads: usize,
    pub inter_threads: usize,
}

/// The full per-image pipeline: decode, resize, tensor layout, inference,
/// postprocessing. Buffers are reused across calls.
pub struct Detector {
    engine: Box<dyn InferenceEngine>,
    resizer: Resizer,
    decoded_image: Image,
    resized_image: Image,
    input: Array4<f32>,
    postprocess_config: PostprocessConfig,
}

impl Detector {
    pub fn new(config: &DetectorConfig) -> anyhow::Result<Self> {
        let engine = OrtEngine::new(&config.model, config.intra_threads, config.inter_threads)?;
        Ok(Self::with_engine(
            Box::new(engine),
            PostprocessConfig {
                confidence_threshold: config.confidence_threshold,
                top_k: config.top_k,
            },
        ))
    }

    /// Build a detector around an arbitrary engine. The production path uses
    /// `OrtEngine`; tests substitute fakes.
    pub fn with_engine(
        engine: Box<dyn InferenceEngine>,
        postprocess_config: PostprocessConfig,
    ) -> Self {
        Self {
            engine,
            resizer: Resizer::default(),
            decoded_image: Image::default(),
            resized_image: Image::default(),
            input: Array::zeros((1, 3, INFERENCE_HEIGHT, INFERENCE_WIDTH)),
            postprocess_config,
        }
    }

    pub fn detect(&mut self, image_bytes: Bytes) -> Result<Detections, Error> {
        let processing_start = Instant::now();
        decode_image(image_bytes.as_ref(), &mut self.decoded_image).map_err(Error::Decode)?;
        let decode_image_time = processing_start.elapsed();
        let orig_width = self.decoded_image.width as u32;
        let orig_height = self.decoded_image.height as u32;
        debug!(
            ?decode_image_time,
            orig_width, orig_height, "Image decoded"
        );

        let resize_start = Instant::now();
        self.resizer
            .resize_image(&mut self.decoded_image, &mut self.resized_image)
            .map_err(Error::Decode)?;
        debug!(resize_image_time = ?resize_start.elapsed(), "Image resized");

        for (index, chunk) in self.resized_image.pixels.chunks_exact(3).enumerate() {
            let y = index / INFERENCE_WIDTH;
            let x = index % INFERENCE_WIDTH;
            self.input[[0, 0, y, x]] = chunk[0] as f32 / 255.0;
            self.input[[0, 1, y, x]] = chunk[1] as f32 / 255.0;
            self.input[[0, 2, y, x]] = chunk[2] as f32 / 255.0;
        }

        // The engine sees the original size as (height, width).
        let orig_size: Array2<i64> = arr2(&[[orig_height as i64, orig_width as i64]]);

        let inference_start = Instant::now();
        let raw = self.engine.infer(&self.input, &orig_size)?;
        debug!(inference_time = ?inference_start.elapsed(), "Inference done");

        let post_processing_start = Instant::now();
        let detections = postprocess(&raw, orig_width, orig_height, &self.postprocess_config)?;
        debug!(
            post_processing_time = ?post_processing_start.elapsed(),
            processing_time = ?processing_start.elapsed(),
            count = detections.len(),
            "Post-processing done"
        );
        Ok(detections)
    }
}
