//! Face detection backends.
//!
//! [`FaceDetector`] is the single contract every backend implements. This module
//! also holds the SCRFD (Sample and Computation Redistribution for Efficient Face
//! Detection) backend: 3-stride anchor-free decoding with NMS post-processing.
//! The classical cascade backend lives in [`crate::cascade`].

use crate::types::{Image, Rectangle};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const SCRFD_INPUT_SIZE: usize = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_CONFIDENCE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Pluggable face detection backend.
///
/// An empty result is a normal outcome. Errors are reserved for faults inside
/// the backend itself.
pub trait FaceDetector: Send {
    /// Locate candidate faces, best-scored first.
    fn find_faces(&mut self, image: &Image) -> Result<Vec<Rectangle>, DetectorError>;
}

impl<D: FaceDetector + ?Sized> FaceDetector for Box<D> {
    fn find_faces(&mut self, image: &Image) -> Result<Vec<Rectangle>, DetectorError> {
        (**self).find_faces(image)
    }
}

/// Metadata for coordinate de-mapping after letterbox resize.
struct LetterboxInfo {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

/// A decoded detection in original-image coordinates, before clipping.
#[derive(Debug, Clone)]
struct Candidate {
    x1: f32,
    y1: f32,
    x2: f32,
    y2: f32,
    score: f32,
    landmarks: Option<[(f32, f32); 5]>,
}

impl Candidate {
    fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.0) * (self.y2 - self.y1).max(0.0)
    }

    fn overlap(&self, other: &Candidate) -> f32 {
        let w = self.x2.min(other.x2) - self.x1.max(other.x1);
        let h = self.y2.min(other.y2) - self.y1.max(other.y1);
        if w <= 0.0 || h <= 0.0 {
            return 0.0;
        }
        let shared = w * h;
        let union = self.area() + other.area() - shared;
        if union > 0.0 { shared / union } else { 0.0 }
    }
}

/// Output tensor indices for one stride: (score_idx, bbox_idx, kps_idx).
type StrideOutputIndices = (usize, usize, usize);

/// SCRFD-based face detector.
pub struct ScrfdDetector {
    session: Session,
    /// Per-stride output indices [(score, bbox, kps)] for strides [8, 16, 32].
    /// Discovered by name at load time; falls back to positional ordering.
    stride_indices: [StrideOutputIndices; 3],
}

impl ScrfdDetector {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        let num_outputs = output_names.len();

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?output_names,
            "loaded SCRFD model"
        );

        if num_outputs < 9 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model requires 9 outputs (3 strides × score/bbox/kps), got {num_outputs}"
            )));
        }

        let stride_indices = discover_output_indices(&output_names);
        tracing::debug!(?stride_indices, "SCRFD output tensor mapping");

        Ok(Self { session, stride_indices })
    }
}

impl FaceDetector for ScrfdDetector {
    fn find_faces(&mut self, image: &Image) -> Result<Vec<Rectangle>, DetectorError> {
        let (input, letterbox) = preprocess(image);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut all_detections = Vec::new();

        for (stride_pos, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx, kps_idx) = self.stride_indices[stride_pos];

            let (_, scores) = outputs[score_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("scores stride {stride}: {e}")))?;
            let (_, bboxes) = outputs[bbox_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("bboxes stride {stride}: {e}")))?;
            let (_, kps) = outputs[kps_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("kps stride {stride}: {e}")))?;

            all_detections.extend(decode_stride(
                scores,
                bboxes,
                kps,
                stride,
                &letterbox,
                SCRFD_CONFIDENCE_THRESHOLD,
            ));
        }

        let faces: Vec<Rectangle> = suppress_overlaps(all_detections, SCRFD_NMS_THRESHOLD)
            .into_iter()
            .filter_map(|c| {
                let mut rect = Rectangle::clipped(c.x1, c.y1, c.x2, c.y2, image.width(), image.height())?;
                rect.landmarks = c.landmarks;
                Some(rect)
            })
            .collect();

        tracing::debug!(count = faces.len(), "SCRFD detection finished");
        Ok(faces)
    }
}

/// Preprocess an image into a NCHW float tensor with letterbox padding.
///
/// Resizes each channel with bilinear interpolation, then normalizes to the
/// SCRFD input distribution. Grayscale input is replicated to three channels.
fn preprocess(image: &Image) -> (Array4<f32>, LetterboxInfo) {
    let (width, height, channels) = (image.width(), image.height(), image.channels());
    let size = SCRFD_INPUT_SIZE;

    let scale = (size as f32 / width as f32).min(size as f32 / height as f32);
    let new_w = ((width as f32 * scale).round() as usize).clamp(1, size);
    let new_h = ((height as f32 * scale).round() as usize).clamp(1, size);
    let pad_x = (size - new_w) as f32 / 2.0;
    let pad_y = (size - new_h) as f32 / 2.0;

    let letterbox = LetterboxInfo { scale, pad_x, pad_y };

    let pad_x_start = pad_x.floor() as usize;
    let pad_y_start = pad_y.floor() as usize;

    // Pad with SCRFD_MEAN, which normalizes to 0.0.
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    let inv_scale = 1.0 / scale;

    for y in 0..new_h {
        let src_y = (y as f32 + 0.5) * inv_scale - 0.5;
        for x in 0..new_w {
            let src_x = (x as f32 + 0.5) * inv_scale - 0.5;
            for c in 0..3 {
                let src_c = if channels == 1 { 0 } else { c };
                let pixel = bilinear_sample(image, src_x, src_y, src_c);
                tensor[[0, c, y + pad_y_start, x + pad_x_start]] = (pixel - SCRFD_MEAN) / SCRFD_STD;
            }
        }
    }

    (tensor, letterbox)
}

/// Bilinear sample with edge clamping.
pub(crate) fn bilinear_sample(image: &Image, src_x: f32, src_y: f32, c: usize) -> f32 {
    let (width, height) = (image.width(), image.height());
    let x0 = (src_x.floor() as i64).clamp(0, width as i64 - 1) as usize;
    let y0 = (src_y.floor() as i64).clamp(0, height as i64 - 1) as usize;
    let x1 = (x0 + 1).min(width - 1);
    let y1 = (y0 + 1).min(height - 1);
    let fx = (src_x - src_x.floor()).clamp(0.0, 1.0);
    let fy = (src_y - src_y.floor()).clamp(0.0, 1.0);

    let tl = image.at(x0, y0, c) as f32;
    let tr = image.at(x1, y0, c) as f32;
    let bl = image.at(x0, y1, c) as f32;
    let br = image.at(x1, y1, c) as f32;

    tl * (1.0 - fx) * (1.0 - fy) + tr * fx * (1.0 - fy) + bl * (1.0 - fx) * fy + br * fx * fy
}

/// Map each stride to its (score, bbox, kps) output positions.
///
/// Exports that name their outputs `score_8`, `bbox_16`, `kps_32`, ... are
/// mapped by name. Anything else is assumed to follow the reference export
/// order: three score tensors, then three bbox tensors, then three kps tensors.
fn discover_output_indices(names: &[String]) -> [StrideOutputIndices; 3] {
    let position = |kind: &str, stride: usize| names.iter().position(|n| *n == format!("{kind}_{stride}"));
    let mut mapping = [(0, 3, 6), (1, 4, 7), (2, 5, 8)];

    for (slot, &stride) in SCRFD_STRIDES.iter().enumerate() {
        match (position("score", stride), position("bbox", stride), position("kps", stride)) {
            (Some(score), Some(bbox), Some(kps)) => mapping[slot] = (score, bbox, kps),
            _ => {
                tracing::info!(?names, "SCRFD output names not recognized; using export order");
                return [(0, 3, 6), (1, 4, 7), (2, 5, 8)];
            }
        }
    }
    mapping
}

/// Decode detections for a single stride level.
fn decode_stride(
    scores: &[f32],
    bboxes: &[f32],
    kps: &[f32],
    stride: usize,
    letterbox: &LetterboxInfo,
    threshold: f32,
) -> Vec<Candidate> {
    let grid_w = SCRFD_INPUT_SIZE / stride;
    let grid_h = SCRFD_INPUT_SIZE / stride;
    let num_anchors = grid_h * grid_w * SCRFD_ANCHORS_PER_CELL;
    let s = stride as f32;

    let unmap_x = |v: f32| (v - letterbox.pad_x) / letterbox.scale;
    let unmap_y = |v: f32| (v - letterbox.pad_y) / letterbox.scale;

    let mut detections = Vec::new();

    for idx in 0..num_anchors {
        let score = scores.get(idx).copied().unwrap_or(0.0);
        if score <= threshold {
            continue;
        }

        let anchor_idx = idx / SCRFD_ANCHORS_PER_CELL;
        let anchor_cx = (anchor_idx % grid_w) as f32 * s;
        let anchor_cy = (anchor_idx / grid_w) as f32 * s;

        // bbox: [x1_offset, y1_offset, x2_offset, y2_offset] * stride
        let bbox_off = idx * 4;
        if bbox_off + 3 >= bboxes.len() {
            continue;
        }

        let kps_off = idx * 10;
        let landmarks = (kps_off + 9 < kps.len()).then(|| {
            std::array::from_fn(|i| {
                (
                    unmap_x(anchor_cx + kps[kps_off + i * 2] * s),
                    unmap_y(anchor_cy + kps[kps_off + i * 2 + 1] * s),
                )
            })
        });

        detections.push(Candidate {
            x1: unmap_x(anchor_cx - bboxes[bbox_off] * s),
            y1: unmap_y(anchor_cy - bboxes[bbox_off + 1] * s),
            x2: unmap_x(anchor_cx + bboxes[bbox_off + 2] * s),
            y2: unmap_y(anchor_cy + bboxes[bbox_off + 3] * s),
            score,
            landmarks,
        });
    }

    detections
}

/// Greedy non-maximum suppression. Survivors come out best score first.
fn suppress_overlaps(mut candidates: Vec<Candidate>, max_iou: f32) -> Vec<Candidate> {
    candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
    let mut kept: Vec<Candidate> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        if !kept.iter().any(|k| k.overlap(&candidate) > max_iou) {
            kept.push(candidate);
        }
    }
    kept
}
