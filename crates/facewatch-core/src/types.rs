use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("invalid luma length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("frame has zero area ({width}x{height})")]
    Empty { width: u32, height: u32 },
}

/// Axis-aligned rectangle, `left <= right` and `top <= bottom` when well-formed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
}

impl Rect {
    pub fn new(left: f32, top: f32, right: f32, bottom: f32) -> Self {
        Self { left, top, right, bottom }
    }

    pub fn width(&self) -> f32 {
        self.right - self.left
    }

    pub fn height(&self) -> f32 {
        self.bottom - self.top
    }

    pub fn area(&self) -> f32 {
        self.width().max(0.0) * self.height().max(0.0)
    }

    pub fn center(&self) -> (f32, f32) {
        ((self.left + self.right) / 2.0, (self.top + self.bottom) / 2.0)
    }

    /// Intersection-over-Union with another rectangle.
    pub fn iou(&self, other: &Rect) -> f32 {
        let inter = Rect {
            left: self.left.max(other.left),
            top: self.top.max(other.top),
            right: self.right.min(other.right),
            bottom: self.bottom.min(other.bottom),
        }
        .area();
        let union = self.area() + other.area() - inter;
        if union > 0.0 {
            inter / union
        } else {
            0.0
        }
    }
}

/// A single grayscale camera frame.
///
/// The core borrows a frame for the duration of one processing call and never
/// keeps a reference past it.
#[derive(Clone)]
pub struct Frame {
    /// Luma pixel data (width * height bytes, row-major).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Monotonic capture timestamp in milliseconds.
    pub timestamp_ms: u64,
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("timestamp_ms", &self.timestamp_ms)
            .finish()
    }
}

impl Frame {
    pub fn new(data: Vec<u8>, width: u32, height: u32, timestamp_ms: u64) -> Result<Self, FrameError> {
        if width == 0 || height == 0 {
            return Err(FrameError::Empty { width, height });
        }
        let expected = width as usize * height as usize;
        if data.len() != expected {
            return Err(FrameError::InvalidLength {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            data,
            width,
            height,
            timestamp_ms,
        })
    }

    /// Convert a decoded image of any color type to a luma frame.
    pub fn from_image(image: &image::DynamicImage, timestamp_ms: u64) -> Result<Self, FrameError> {
        let luma = image.to_luma8();
        let (width, height) = luma.dimensions();
        Self::new(luma.into_raw(), width, height, timestamp_ms)
    }

    /// Cut out a face region, grown around its center by `scale` and clamped
    /// to the frame bounds.
    pub fn crop(&self, rect: &Rect, scale: f32) -> FaceCrop {
        let (cx, cy) = rect.center();
        let half_w = rect.width().max(1.0) * scale / 2.0;
        let half_h = rect.height().max(1.0) * scale / 2.0;

        let x0 = ((cx - half_w).floor().max(0.0) as u32).min(self.width - 1);
        let y0 = ((cy - half_h).floor().max(0.0) as u32).min(self.height - 1);
        let x1 = ((cx + half_w).ceil().max(0.0) as u32).clamp(x0 + 1, self.width);
        let y1 = ((cy + half_h).ceil().max(0.0) as u32).clamp(y0 + 1, self.height);

        let w = (x1 - x0) as usize;
        let h = (y1 - y0) as usize;
        let stride = self.width as usize;
        let mut data = Vec::with_capacity(w * h);
        for y in y0 as usize..y1 as usize {
            let row = y * stride;
            data.extend_from_slice(&self.data[row + x0 as usize..row + x1 as usize]);
        }

        FaceCrop {
            data,
            width: w as u32,
            height: h as u32,
        }
    }
}

/// A grayscale face crop handed to liveness and embedding backends.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceCrop {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl FaceCrop {
    /// Bilinear resize to a `size`×`size` square.
    pub fn resize_square(&self, size: usize) -> Vec<u8> {
        let (w, h) = (self.width as usize, self.height as usize);
        if w == 0 || h == 0 || self.data.len() < w * h {
            return vec![0u8; size * size];
        }
        resize_luma(&self.data, w, h, size, size)
    }
}

/// Bilinear resize of a row-major luma buffer, sampling at pixel centers.
pub(crate) fn resize_luma(src: &[u8], w: usize, h: usize, dst_w: usize, dst_h: usize) -> Vec<u8> {
    // Source coordinate and blend weight for destination index `i`.
    let axis = |i: usize, scale: f32, len: usize| {
        let s = ((i as f32 + 0.5) * scale - 0.5).max(0.0);
        let lo = (s as usize).min(len - 1);
        (lo, (lo + 1).min(len - 1), s - lo as f32)
    };
    let (sx, sy) = (w as f32 / dst_w as f32, h as f32 / dst_h as f32);

    let mut out = Vec::with_capacity(dst_w * dst_h);
    for y in 0..dst_h {
        let (r0, r1, wy) = axis(y, sy, h);
        let wy = wy.clamp(0.0, 1.0);
        for x in 0..dst_w {
            let (c0, c1, wx) = axis(x, sx, w);
            let wx = wx.clamp(0.0, 1.0);
            let px = |r: usize, c: usize| src[r * w + c] as f32;
            let top = px(r0, c0) + (px(r0, c1) - px(r0, c0)) * wx;
            let bottom = px(r1, c0) + (px(r1, c1) - px(r1, c0)) * wx;
            out.push((top + (bottom - top) * wy).round().clamp(0.0, 255.0) as u8);
        }
    }
    out
}

/// One detected face in frame space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceObservation {
    pub rect: Rect,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
    /// Timestamp of the frame this face was found in.
    pub frame_timestamp_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LivenessVerdict {
    pub is_live: bool,
    /// Live probability in [0, 1].
    pub score: f32,
}

impl LivenessVerdict {
    /// Fail-closed verdict used whenever the backend cannot be trusted.
    pub fn rejected() -> Self {
        Self {
            is_live: false,
            score: 0.0,
        }
    }
}

/// Face embedding vector (512-dimensional for ArcFace w600k_r50).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingVector {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl EmbeddingVector {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Whether two vectors may be compared at all: same length and, when
    /// both carry one, the same model version.
    pub fn is_comparable(&self, other: &EmbeddingVector) -> bool {
        if self.values.len() != other.values.len() {
            return false;
        }
        match (&self.model_version, &other.model_version) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        }
    }

    /// Cosine similarity in [-1, 1]. Higher = more similar.
    pub fn similarity(&self, other: &EmbeddingVector) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 {
            dot / denom
        } else {
            0.0
        }
    }

    pub fn euclidean_distance(&self, other: &EmbeddingVector) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }

    /// Scale to unit L2 norm in place. Zero vectors are left untouched.
    pub fn normalize(&mut self) {
        l2_normalize(&mut self.values);
    }
}

pub(crate) fn l2_normalize(values: &mut [f32]) {
    let norm: f32 = values.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in values.iter_mut() {
            *v /= norm;
        }
    }
}

/// A known identity inside a gallery snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GalleryEntry {
    pub person_id: String,
    pub display_name: String,
    pub embedding: EmbeddingVector,
    /// Unnormalized feature map kept from legacy records.
    pub raw_features: Option<Vec<f32>>,
}

/// Outcome of a gallery search. `person_id = None` means nothing cleared the
/// acceptance threshold; `confidence` still carries the best observed score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub person_id: Option<String>,
    pub display_name: Option<String>,
    pub confidence: f32,
}

impl MatchResult {
    pub fn no_match(confidence: f32) -> Self {
        Self {
            person_id: None,
            display_name: None,
            confidence,
        }
    }

    pub fn key(&self) -> MatchKey {
        match &self.person_id {
            Some(id) => MatchKey::Person(id.clone()),
            None => MatchKey::Unknown,
        }
    }
}

/// Identity key used for event deduplication.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKey {
    Person(String),
    Unknown,
}

impl std::fmt::Display for MatchKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MatchKey::Person(id) => f.write_str(id),
            MatchKey::Unknown => f.write_str("unknown"),
        }
    }
}

/// Why a decision was not forwarded to the capture sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuppressionReason {
    NoFace,
    DetectionFailure,
    Spoof,
    LivenessFailure,
    EmbeddingFailure,
    EmbeddingDimension,
    Cooldown,
    UnknownSuppressed,
}

impl SuppressionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SuppressionReason::NoFace => "no_face",
            SuppressionReason::DetectionFailure => "detection_failure",
            SuppressionReason::Spoof => "spoof",
            SuppressionReason::LivenessFailure => "liveness_failure",
            SuppressionReason::EmbeddingFailure => "embedding_failure",
            SuppressionReason::EmbeddingDimension => "embedding_dimension",
            SuppressionReason::Cooldown => "cooldown",
            SuppressionReason::UnknownSuppressed => "unknown_suppressed",
        }
    }
}

impl std::fmt::Display for SuppressionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output of one orchestration cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognitionDecision {
    pub frame_timestamp_ms: u64,
    /// `None` only when no face was found or detection failed.
    pub face: Option<FaceObservation>,
    pub liveness: Option<LivenessVerdict>,
    pub match_result: Option<MatchResult>,
    pub emitted: bool,
    pub reason: Option<SuppressionReason>,
}

impl RecognitionDecision {
    pub(crate) fn suppressed(frame_timestamp_ms: u64, reason: SuppressionReason) -> Self {
        Self {
            frame_timestamp_ms,
            face: None,
            liveness: None,
            match_result: None,
            emitted: false,
            reason: Some(reason),
        }
    }
}
