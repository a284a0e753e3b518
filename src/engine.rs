use crate::error::Error;
use ndarray::{Array2, Array4, ArrayD, Axis};
use ort::{
    inputs,
    session::{Session, SessionInputs, SessionOutputs},
};
use std::path::Path;
use tracing::info;

const INPUT_IMAGES: &str = "images";
const INPUT_ORIG_SIZES: &str = "orig_target_sizes";
const OUTPUT_LABELS: &str = "labels";
const OUTPUT_BOXES: &str = "boxes";
const OUTPUT_SCORES: &str = "scores";

/// Raw arrays as returned by the engine, already stripped of any leading
/// batch dimension of size one. Shapes are otherwise not fixed by contract;
/// the postprocessor normalizes them before use.
///
/// Integer label tensors are widened to f32 on extraction: rank, not dtype,
/// carries the semantics, and class ids are small.
pub struct RawModelOutput {
    pub labels: ArrayD<f32>,
    pub boxes: ArrayD<f32>,
    pub scores: ArrayD<f32>,
}

/// Forward pass over a fixed-shape tensor. The production implementation
/// drives an ONNX Runtime session; tests substitute fakes.
pub trait InferenceEngine: Send {
    fn infer(
        &mut self,
        input: &Array4<f32>,
        orig_size: &Array2<i64>,
    ) -> Result<RawModelOutput, Error>;
}

pub struct OrtEngine {
    session: Session,
}

impl OrtEngine {
    pub fn new(model: &Path, intra_threads: usize, inter_threads: usize) -> anyhow::Result<Self> {
        let model_bytes = std::fs::read(model)?;
        let max_threads = num_cpus::get_physical().saturating_sub(1).max(1);
        let num_intra_threads = intra_threads.min(max_threads);
        let num_inter_threads = inter_threads.min(max_threads);
        info!(
            "Initializing inference session with model: {:?}, {} intra and {} inter threads",
            model, num_intra_threads, num_inter_threads
        );

        let session = Session::builder()?
            .with_intra_threads(num_intra_threads)?
            .with_inter_threads(num_inter_threads)?
            .commit_from_memory(model_bytes.as_slice())?;

        Ok(Self { session })
    }
}

impl InferenceEngine for OrtEngine {
    fn infer(
        &mut self,
        input: &Array4<f32>,
        orig_size: &Array2<i64>,
    ) -> Result<RawModelOutput, Error> {
        let feeds: SessionInputs<'_, '_> = SessionInputs::ValueMap(
            inputs![INPUT_IMAGES => input.view(), INPUT_ORIG_SIZES => orig_size.view()]
                .map_err(|e| Error::Inference(e.into()))?,
        );
        let outputs: SessionOutputs = self
            .session
            .run(feeds)
            .map_err(|e| Error::Inference(e.into()))?;

        let labels = extract_labels(&outputs).map_err(Error::Inference)?;
        let boxes = outputs[OUTPUT_BOXES]
            .try_extract_tensor::<f32>()
            .map_err(|e| Error::Inference(e.into()))?
            .to_owned();
        let scores = outputs[OUTPUT_SCORES]
            .try_extract_tensor::<f32>()
            .map_err(|e| Error::Inference(e.into()))?
            .to_owned();

        Ok(squeeze_batch(RawModelOutput {
            labels,
            boxes,
            scores,
        }))
    }
}

fn extract_labels(outputs: &SessionOutputs<'_, '_>) -> anyhow::Result<ArrayD<f32>> {
    // Some models emit int64 class ids, others float score rows.
    if let Ok(ids) = outputs[OUTPUT_LABELS].try_extract_tensor::<i64>() {
        return Ok(ids.mapv(|v| v as f32));
    }
    Ok(outputs[OUTPUT_LABELS].try_extract_tensor::<f32>()?.to_owned())
}

/// Strip a leading batch axis of size one so downstream logic always sees
/// unbatched arrays: boxes `[1, n, 4]` become `[n, 4]`, scores `[1, n]`
/// become `[n]`, and any leading unit axis on labels is dropped.
pub fn squeeze_batch(raw: RawModelOutput) -> RawModelOutput {
    RawModelOutput {
        labels: strip_unit_batch(raw.labels, 2),
        boxes: strip_unit_batch(raw.boxes, 3),
        scores: strip_unit_batch(raw.scores, 2),
    }
}

fn strip_unit_batch(arr: ArrayD<f32>, batched_rank: usize) -> ArrayD<f32> {
    if arr.ndim() >= batched_rank && arr.shape()[0] == 1 {
        arr.index_axis_move(Axis(0), 0)
    } else {
        arr
    }
}
