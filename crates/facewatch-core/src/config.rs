//! Runtime configuration: defaults, then an optional TOML file, then
//! `FACEWATCH_*` environment overrides.

use crate::matcher::Metric;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("parse {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FacewatchConfig {
    pub recognition: RecognitionConfig,
    pub models: ModelConfig,
    pub gallery: GalleryConfig,
    pub capture: CaptureConfig,
}

/// Recognition policy knobs. All of them are tuning constants, not contracts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecognitionConfig {
    /// Minimum score for a gallery entry to count as a match (inclusive).
    pub accept_threshold: f32,
    pub metric: Metric,
    /// Minimum time between two emitted events for the same identity.
    pub cooldown_min_interval_ms: u64,
    /// Minimum live probability (inclusive).
    pub liveness_threshold: f32,
    /// Fixed by the embedding model (512 for w600k_r50).
    pub embedding_dimension: usize,
    /// Deadline for each detector / liveness / embedding call.
    pub backend_timeout_ms: u64,
    /// How far the liveness crop extends around the detected box.
    pub liveness_crop_scale: f32,
    /// Whether faces matching nobody still produce capture events.
    pub emit_unknown: bool,
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            accept_threshold: 0.65,
            metric: Metric::Cosine,
            cooldown_min_interval_ms: crate::cooldown::DEFAULT_MIN_INTERVAL_MS,
            liveness_threshold: crate::liveness::DEFAULT_LIVENESS_THRESHOLD,
            embedding_dimension: crate::recognizer::ARCFACE_EMBEDDING_DIM,
            backend_timeout_ms: 2000,
            liveness_crop_scale: 1.5,
            emit_unknown: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    pub detector_file: String,
    pub embedding_file: String,
    pub liveness_file: String,
    /// Output index of the live class in the liveness model.
    pub liveness_live_class: usize,
    pub detection_confidence: f32,
    pub nms_threshold: f32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_dir: default_data_dir().join("models"),
            detector_file: "det_10g.onnx".into(),
            embedding_file: "w600k_r50.onnx".into(),
            liveness_file: "minifasnet.onnx".into(),
            liveness_live_class: crate::liveness::DEFAULT_LIVE_CLASS,
            detection_confidence: crate::detector::DEFAULT_CONFIDENCE_THRESHOLD,
            nms_threshold: crate::detector::DEFAULT_NMS_THRESHOLD,
        }
    }
}

impl ModelConfig {
    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> String {
        self.model_path(&self.detector_file)
    }

    /// Path to the ArcFace recognition model.
    pub fn arcface_model_path(&self) -> String {
        self.model_path(&self.embedding_file)
    }

    /// Path to the anti-spoofing model.
    pub fn liveness_model_path(&self) -> String {
        self.model_path(&self.liveness_file)
    }

    fn model_path(&self, file: &str) -> String {
        self.model_dir.join(file).to_string_lossy().into_owned()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GalleryConfig {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Reload the gallery this often while watching; 0 disables.
    pub refresh_interval_secs: u64,
}

impl Default for GalleryConfig {
    fn default() -> Self {
        Self {
            db_path: default_data_dir().join("faces.db"),
            refresh_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// JSON-lines file that receives emitted capture events.
    pub output_path: PathBuf,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            output_path: default_data_dir().join("captures.jsonl"),
        }
    }
}

impl FacewatchConfig {
    /// Defaults, overlaid with `path` (if any), overlaid with the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Apply `FACEWATCH_*` overrides read through `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let r = &mut self.recognition;
        override_parsed(&lookup, "FACEWATCH_ACCEPT_THRESHOLD", &mut r.accept_threshold);
        override_parsed(&lookup, "FACEWATCH_COOLDOWN_MS", &mut r.cooldown_min_interval_ms);
        override_parsed(&lookup, "FACEWATCH_LIVENESS_THRESHOLD", &mut r.liveness_threshold);
        override_parsed(&lookup, "FACEWATCH_EMBEDDING_DIM", &mut r.embedding_dimension);
        override_parsed(&lookup, "FACEWATCH_BACKEND_TIMEOUT_MS", &mut r.backend_timeout_ms);
        if let Some(v) = lookup("FACEWATCH_EMIT_UNKNOWN") {
            r.emit_unknown = v != "0";
        }
        if let Some(v) = lookup("FACEWATCH_METRIC") {
            match v.as_str() {
                "cosine" => r.metric = Metric::Cosine,
                "negative_euclidean" | "euclidean" => r.metric = Metric::NegativeEuclidean,
                other => tracing::warn!(value = other, "ignoring unknown FACEWATCH_METRIC"),
            }
        }
        if let Some(v) = lookup("FACEWATCH_MODEL_DIR") {
            self.models.model_dir = PathBuf::from(v);
        }
        override_parsed(&lookup, "FACEWATCH_LIVE_CLASS", &mut self.models.liveness_live_class);
        if let Some(v) = lookup("FACEWATCH_DB_PATH") {
            self.gallery.db_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("FACEWATCH_CAPTURE_PATH") {
            self.capture.output_path = PathBuf::from(v);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let r = &self.recognition;
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        match r.metric {
            Metric::Cosine if !(-1.0..=1.0).contains(&r.accept_threshold) => {
                return invalid(format!(
                    "accept_threshold {} outside [-1, 1] for cosine",
                    r.accept_threshold
                ));
            }
            Metric::NegativeEuclidean if !(r.accept_threshold <= 0.0) => {
                return invalid(format!(
                    "accept_threshold {} must be <= 0 for negative_euclidean",
                    r.accept_threshold
                ));
            }
            _ => {}
        }
        if !(0.0..=1.0).contains(&r.liveness_threshold) {
            return invalid(format!("liveness_threshold {} outside [0, 1]", r.liveness_threshold));
        }
        if r.embedding_dimension == 0 {
            return invalid("embedding_dimension must be non-zero".into());
        }
        if r.backend_timeout_ms == 0 {
            return invalid("backend_timeout_ms must be non-zero".into());
        }
        if !(r.liveness_crop_scale.is_finite() && r.liveness_crop_scale >= 1.0) {
            return invalid(format!("liveness_crop_scale {} must be >= 1", r.liveness_crop_scale));
        }
        Ok(())
    }
}

/// `$XDG_DATA_HOME/facewatch`, falling back to `~/.local/share/facewatch`.
pub fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facewatch")
}

fn override_parsed<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    slot: &mut T,
) {
    if let Some(raw) = lookup(key) {
        match raw.parse() {
            Ok(v) => *slot = v,
            Err(_) => tracing::warn!(key, value = %raw, "ignoring unparsable override"),
        }
    }
}
