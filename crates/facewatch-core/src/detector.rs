//! Face detection stage.
//!
//! [`FaceDetector`] is the seam the orchestrator depends on; [`ScrfdDetector`]
//! implements it with the SCRFD (Sample and Computation Redistribution for
//! Efficient Face Detection) model: 3-stride anchor-free decoding and NMS
//! post-processing, run on the blocking pool.

use crate::types::{resize_luma, FaceObservation, Frame, Rect};
use async_trait::async_trait;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;

// --- Named constants (no magic numbers) ---
const SCRFD_INPUT_SIZE: usize = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.5;
pub const DEFAULT_NMS_THRESHOLD: f32 = 0.4;

#[derive(Error, Debug)]
pub enum DetectionError {
    #[error("model file not found: {0}; download it from insightface and place in the model directory")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("malformed detector output: {0}")]
    MalformedOutput(String),
    #[error("detector timed out after {0} ms")]
    Timeout(u64),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Turns one frame into zero or more face observations.
///
/// Implementations must be deterministic for a fixed frame. Ordering is the
/// implementation's own (SCRFD sorts by confidence) and callers that only
/// look at the first face inherit it.
#[async_trait]
pub trait FaceDetector: Send + Sync {
    async fn detect(&self, frame: &Frame) -> Result<Vec<FaceObservation>, DetectionError>;
}

/// Metadata for coordinate de-mapping after letterbox resize.
struct LetterboxInfo {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

/// Output tensor indices for one stride: (score_idx, bbox_idx, kps_idx).
type StrideOutputIndices = (usize, usize, usize);

/// A raw decoded detection before NMS.
#[derive(Debug, Clone)]
struct Candidate {
    rect: Rect,
    confidence: f32,
    landmarks: Option<[(f32, f32); 5]>,
}

struct ScrfdSession {
    session: Session,
    /// Per-stride output indices [(score, bbox, kps)] for strides [8, 16, 32].
    /// Discovered by name at load time; falls back to positional ordering.
    stride_indices: [StrideOutputIndices; 3],
}

/// SCRFD-based face detector.
pub struct ScrfdDetector {
    inner: Arc<Mutex<ScrfdSession>>,
    confidence_threshold: f32,
    nms_threshold: f32,
}

impl ScrfdDetector {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, DetectionError> {
        if !Path::new(model_path).exists() {
            return Err(DetectionError::ModelNotFound(model_path.to_string()));
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
            return Err(DetectionError::MalformedOutput(format!(
                "SCRFD model requires 9 outputs (3 strides × score/bbox/kps), got {num_outputs}"
            )));
        }

        let stride_indices = discover_output_indices(&output_names);
        tracing::debug!(?stride_indices, "SCRFD output tensor mapping");

        Ok(Self {
            inner: Arc::new(Mutex::new(ScrfdSession {
                session,
                stride_indices,
            })),
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            nms_threshold: DEFAULT_NMS_THRESHOLD,
        })
    }

    pub fn with_thresholds(mut self, confidence: f32, nms: f32) -> Self {
        self.confidence_threshold = confidence;
        self.nms_threshold = nms;
        self
    }
}

#[async_trait]
impl FaceDetector for ScrfdDetector {
    async fn detect(&self, frame: &Frame) -> Result<Vec<FaceObservation>, DetectionError> {
        let inner = Arc::clone(&self.inner);
        let data = frame.data.clone();
        let (width, height) = (frame.width as usize, frame.height as usize);
        let threshold = self.confidence_threshold;

        let candidates = tokio::task::spawn_blocking(move || {
            let (input, letterbox) = preprocess(&data, width, height);
            let mut guard = inner
                .lock()
                .map_err(|_| DetectionError::InferenceFailed("detector session lock poisoned".into()))?;
            guard.infer(input, &letterbox, threshold)
        })
        .await
        .map_err(|e| DetectionError::InferenceFailed(format!("detector task: {e}")))??;

        let mut result = nms(candidates, self.nms_threshold);
        result.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        Ok(result
            .into_iter()
            .map(|c| FaceObservation {
                rect: c.rect,
                confidence: c.confidence,
                landmarks: c.landmarks,
                frame_timestamp_ms: frame.timestamp_ms,
            })
            .collect())
    }
}

impl ScrfdSession {
    fn infer(
        &mut self,
        input: Array4<f32>,
        letterbox: &LetterboxInfo,
        threshold: f32,
    ) -> Result<Vec<Candidate>, DetectionError> {
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut all_detections = Vec::new();

        for (stride_pos, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx, kps_idx) = self.stride_indices[stride_pos];

            let (_, scores) = outputs[score_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectionError::MalformedOutput(format!("scores stride {stride}: {e}")))?;
            let (_, bboxes) = outputs[bbox_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectionError::MalformedOutput(format!("bboxes stride {stride}: {e}")))?;
            let (_, kps) = outputs[kps_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectionError::MalformedOutput(format!("kps stride {stride}: {e}")))?;

            all_detections.extend(decode_stride(
                scores,
                bboxes,
                kps,
                stride,
                SCRFD_INPUT_SIZE,
                SCRFD_INPUT_SIZE,
                letterbox,
                threshold,
            )?);
        }

        Ok(all_detections)
    }
}

/// Letterbox a luma frame into the 640×640 NCHW input tensor.
fn preprocess(frame: &[u8], width: usize, height: usize) -> (Array4<f32>, LetterboxInfo) {
    let size = SCRFD_INPUT_SIZE;
    let scale = (size as f32 / width as f32).min(size as f32 / height as f32);
    let new_w = ((width as f32 * scale).round() as usize).clamp(1, size);
    let new_h = ((height as f32 * scale).round() as usize).clamp(1, size);
    let letterbox = LetterboxInfo {
        scale,
        pad_x: (size - new_w) as f32 / 2.0,
        pad_y: (size - new_h) as f32 / 2.0,
    };

    let resized = resize_luma(frame, width, height, new_w, new_h);
    let (x_off, y_off) = (letterbox.pad_x as usize, letterbox.pad_y as usize);

    // Padding stays at zero, which is where the mean pixel lands.
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (i, &pixel) in resized.iter().enumerate() {
        let (y, x) = (y_off + i / new_w, x_off + i % new_w);
        let v = (pixel as f32 - SCRFD_MEAN) / SCRFD_STD;
        // Luma replicated into all three channels.
        for c in 0..3 {
            tensor[[0, c, y, x]] = v;
        }
    }

    (tensor, letterbox)
}

/// Discover output tensor ordering by name.
///
/// SCRFD exports name their tensors either "score_8", "bbox_16", ... or with
/// generic integers. Unrecognized names fall back to the standard positional
/// ordering: [0-2] = scores, [3-5] = bboxes, [6-8] = kps (strides 8, 16, 32).
fn discover_output_indices(names: &[String]) -> [StrideOutputIndices; 3] {
    let find = |prefix: &str, stride: usize| -> Option<usize> {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| n == &target)
    };

    let named: Option<Vec<StrideOutputIndices>> = SCRFD_STRIDES
        .iter()
        .map(|&stride| Some((find("score", stride)?, find("bbox", stride)?, find("kps", stride)?)))
        .collect();

    match named {
        Some(indices) => {
            tracing::info!("SCRFD: using name-based output tensor mapping");
            [indices[0], indices[1], indices[2]]
        }
        None => {
            tracing::info!(
                ?names,
                "SCRFD: output names not recognized, using positional mapping [0-2]=scores, [3-5]=bboxes, [6-8]=kps"
            );
            [(0, 3, 6), (1, 4, 7), (2, 5, 8)]
        }
    }
}

/// Decode detections for a single stride level.
#[allow(clippy::too_many_arguments)]
fn decode_stride(
    scores: &[f32],
    bboxes: &[f32],
    kps: &[f32],
    stride: usize,
    input_width: usize,
    input_height: usize,
    letterbox: &LetterboxInfo,
    threshold: f32,
) -> Result<Vec<Candidate>, DetectionError> {
    let grid_h = input_height / stride;
    let grid_w = input_width / stride;
    let num_anchors = grid_h * grid_w * SCRFD_ANCHORS_PER_CELL;

    if scores.len() < num_anchors || bboxes.len() < num_anchors * 4 {
        return Err(DetectionError::MalformedOutput(format!(
            "stride {stride}: expected {num_anchors} anchors, got {} scores / {} bbox values",
            scores.len(),
            bboxes.len()
        )));
    }
    let has_kps = kps.len() >= num_anchors * 10;

    let unmap = |x: f32, y: f32| {
        (
            (x - letterbox.pad_x) / letterbox.scale,
            (y - letterbox.pad_y) / letterbox.scale,
        )
    };

    let mut detections = Vec::new();

    for idx in 0..num_anchors {
        let score = scores[idx];
        if !score.is_finite() || score <= threshold {
            continue;
        }

        let anchor_idx = idx / SCRFD_ANCHORS_PER_CELL;
        let anchor_cx = ((anchor_idx % grid_w) * stride) as f32;
        let anchor_cy = ((anchor_idx / grid_w) * stride) as f32;
        let s = stride as f32;

        // bbox: [x1_offset, y1_offset, x2_offset, y2_offset] * stride
        let b = &bboxes[idx * 4..idx * 4 + 4];
        let (x1, y1) = unmap(anchor_cx - b[0] * s, anchor_cy - b[1] * s);
        let (x2, y2) = unmap(anchor_cx + b[2] * s, anchor_cy + b[3] * s);
        if ![x1, y1, x2, y2].iter().all(|v| v.is_finite()) {
            continue;
        }

        let landmarks = has_kps.then(|| {
            let k = &kps[idx * 10..idx * 10 + 10];
            std::array::from_fn(|i| unmap(anchor_cx + k[i * 2] * s, anchor_cy + k[i * 2 + 1] * s))
        });

        detections.push(Candidate {
            rect: Rect::new(x1.min(x2), y1.min(y2), x1.max(x2), y1.max(y2)),
            confidence: score,
            landmarks,
        });
    }

    Ok(detections)
}

/// Non-Maximum Suppression: remove overlapping detections.
fn nms(mut detections: Vec<Candidate>, iou_threshold: f32) -> Vec<Candidate> {
    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep: Vec<Candidate> = Vec::new();
    for det in detections {
        if keep.iter().all(|k| k.rect.iou(&det.rect) <= iou_threshold) {
            keep.push(det);
        }
    }
    keep
}
