use crate::{engine::RawModelOutput, error::Error};
use ndarray::{Array1, Array2, ArrayD, ArrayView1, Ix1, Ix2};
use smallvec::SmallVec;
use std::cmp::Ordering;

/// Normalized center-form bounding box. `(x, y)` is the box center and
/// `(w, h)` the box size, all as fractions of the original image dimensions,
/// clamped into `[0, 1]` before emission.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub class_id: i64,
    pub score: f32,
}

pub type Detections = SmallVec<[Detection; 10]>;

#[derive(Debug, Clone)]
pub struct PostprocessConfig {
    /// Minimum confidence for a detection to be retained.
    pub confidence_threshold: f32,
    /// Keep at most this many detections, highest confidence first.
    pub top_k: usize,
}

impl Default for PostprocessConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.25,
            top_k: 100,
        }
    }
}

/// Per-detection confidence: either given directly, or as per-class score
/// rows whose maximum is the confidence.
enum Scores {
    PerDetection(Array1<f32>),
    PerClass(Array2<f32>),
}

/// Class assignment: either explicit ids, or per-class rows resolved by
/// argmax.
enum Labels {
    Direct(Array1<f32>),
    PerClass(Array2<f32>),
}

impl Scores {
    fn from_raw(scores: &ArrayD<f32>) -> Result<Self, Error> {
        match scores.ndim() {
            1 => Ok(Self::PerDetection(as_rank1(scores)?)),
            2 => Ok(Self::PerClass(as_rank2(scores)?)),
            rank => Err(Error::Postprocess(format!(
                "scores must be rank 1 or 2, got rank {rank}"
            ))),
        }
    }

    fn len(&self) -> usize {
        match self {
            Self::PerDetection(v) => v.len(),
            Self::PerClass(m) => m.nrows(),
        }
    }

    fn confidences(&self) -> Array1<f32> {
        match self {
            Self::PerDetection(v) => v.clone(),
            Self::PerClass(m) => m
                .rows()
                .into_iter()
                .map(|row| row.iter().copied().fold(f32::NEG_INFINITY, f32::max))
                .collect(),
        }
    }
}

impl Labels {
    fn from_raw(labels: &ArrayD<f32>) -> Result<Self, Error> {
        match labels.ndim() {
            1 => Ok(Self::Direct(as_rank1(labels)?)),
            2 => Ok(Self::PerClass(as_rank2(labels)?)),
            rank => Err(Error::Postprocess(format!(
                "labels must be rank 1 or 2, got rank {rank}"
            ))),
        }
    }

    fn len(&self) -> usize {
        match self {
            Self::Direct(v) => v.len(),
            Self::PerClass(m) => m.nrows(),
        }
    }

    fn class_id(&self, index: usize) -> i64 {
        match self {
            Self::Direct(v) => v[index] as i64,
            Self::PerClass(m) => argmax(m.row(index)),
        }
    }
}

fn as_rank1(arr: &ArrayD<f32>) -> Result<Array1<f32>, Error> {
    arr.clone()
        .into_dimensionality::<Ix1>()
        .map_err(|e| Error::Postprocess(e.to_string()))
}

fn as_rank2(arr: &ArrayD<f32>) -> Result<Array2<f32>, Error> {
    arr.clone()
        .into_dimensionality::<Ix2>()
        .map_err(|e| Error::Postprocess(e.to_string()))
}

// First index wins on ties.
fn argmax(row: ArrayView1<'_, f32>) -> i64 {
    let mut best = 0usize;
    let mut best_value = f32::NEG_INFINITY;
    for (index, &value) in row.iter().enumerate() {
        if value > best_value {
            best = index;
            best_value = value;
        }
    }
    best as i64
}

/// Turn raw engine output into a canonical list of normalized center-form
/// detections. Deterministic: the same arrays and original size always yield
/// the same result.
///
/// The coordinate convention and scale of the raw boxes are not declared by
/// the engine; both are decided batch-wide over the retained boxes, never
/// per box.
pub fn postprocess(
    raw: &RawModelOutput,
    orig_width: u32,
    orig_height: u32,
    config: &PostprocessConfig,
) -> Result<Detections, Error> {
    let boxes = validate_boxes(&raw.boxes)?;
    let scores = Scores::from_raw(&raw.scores)?;
    let labels = Labels::from_raw(&raw.labels)?;

    let n = boxes.nrows();
    if scores.len() != n || labels.len() != n {
        return Err(Error::Postprocess(format!(
            "mismatched row counts: {} boxes, {} scores, {} labels",
            n,
            scores.len(),
            labels.len()
        )));
    }

    let conf = scores.confidences();

    // An empty survivor set is a valid result, not an error.
    let mut kept: Vec<usize> = (0..n)
        .filter(|&i| conf[i] >= config.confidence_threshold)
        .collect();
    if kept.is_empty() {
        return Ok(Detections::new());
    }

    // Top-K by confidence; the sort is stable so ties keep array order.
    kept.sort_by(|&a, &b| conf[b].partial_cmp(&conf[a]).unwrap_or(Ordering::Equal));
    kept.truncate(config.top_k);

    let corner_form = looks_corner_form(&boxes, &kept);
    let scale = if max_coordinate(&boxes, &kept) <= 1.5 {
        // Coordinates already normalized; bring them to absolute pixels.
        [
            orig_width as f32,
            orig_height as f32,
            orig_width as f32,
            orig_height as f32,
        ]
    } else {
        [1.0; 4]
    };

    let div_w = orig_width.max(1) as f32;
    let div_h = orig_height.max(1) as f32;

    let mut detections = Detections::new();
    for &i in &kept {
        let row = boxes.row(i);
        let b = [
            row[0] * scale[0],
            row[1] * scale[1],
            row[2] * scale[2],
            row[3] * scale[3],
        ];
        let (cx, cy, w, h) = if corner_form {
            to_center_form(b)
        } else {
            (b[0], b[1], b[2], b[3])
        };
        detections.push(Detection {
            bbox: BoundingBox {
                x: (cx / div_w).clamp(0.0, 1.0),
                y: (cy / div_h).clamp(0.0, 1.0),
                w: (w / div_w).clamp(0.0, 1.0),
                h: (h / div_h).clamp(0.0, 1.0),
            },
            class_id: labels.class_id(i),
            score: conf[i],
        });
    }
    Ok(detections)
}

fn validate_boxes(boxes: &ArrayD<f32>) -> Result<Array2<f32>, Error> {
    if boxes.ndim() != 2 || boxes.shape()[1] != 4 {
        return Err(Error::Postprocess(format!(
            "boxes must be [n, 4], got shape {:?}",
            boxes.shape()
        )));
    }
    as_rank2(boxes)
}

/// Batch-wide coordinate-convention guess: corner form when strictly more
/// than 80% of the retained boxes grow toward the bottom-right.
fn looks_corner_form(boxes: &Array2<f32>, kept: &[usize]) -> bool {
    let hits = kept
        .iter()
        .filter(|&&i| {
            let row = boxes.row(i);
            row[2] > row[0] && row[3] > row[1]
        })
        .count();
    hits as f32 > 0.8 * kept.len() as f32
}

fn max_coordinate(boxes: &Array2<f32>, kept: &[usize]) -> f32 {
    kept.iter()
        .flat_map(|&i| boxes.row(i).to_vec())
        .fold(f32::NEG_INFINITY, f32::max)
}

fn to_center_form([x1, y1, x2, y2]: [f32; 4]) -> (f32, f32, f32, f32) {
    let w = (x2 - x1).max(0.0);
    let h = (y2 - y1).max(0.0);
    (x1 + w * 0.5, y1 + h * 0.5, w, h)
}
