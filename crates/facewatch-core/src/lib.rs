//! facewatch-core: on-device face recognition pipeline.
//!
//! SCRFD finds faces, a MiniFASNet-style classifier rejects spoofs, ArcFace
//! embeds live faces and a linear matcher compares them against a small
//! gallery. The orchestrator sequences the stages per frame and deduplicates
//! events before they reach a capture sink. Inference runs via ONNX Runtime
//! on the CPU.

pub mod alignment;
pub mod config;
pub mod cooldown;
pub mod detector;
pub mod gallery;
pub mod liveness;
pub mod mapper;
pub mod matcher;
pub mod orchestrator;
pub mod recognizer;
pub mod sink;
pub mod store;
pub mod stream;
pub mod types;

pub use config::FacewatchConfig;
pub use detector::{FaceDetector, ScrfdDetector};
pub use gallery::{Gallery, GallerySnapshot};
pub use liveness::{LivenessChecker, LivenessGate, OnnxLivenessChecker};
pub use mapper::CoordinateMapper;
pub use matcher::{LinearMatcher, Matcher, Metric};
pub use orchestrator::{OrchestratorConfig, RecognitionOrchestrator};
pub use recognizer::{ArcFaceExtractor, EmbeddingExtractor};
pub use sink::{CaptureSink, ChannelSink, JsonLinesSink};
pub use store::{GalleryStore, MemoryGalleryStore, SqliteGalleryStore};
pub use stream::run_stream;
pub use types::{
    EmbeddingVector, FaceObservation, Frame, LivenessVerdict, MatchResult, RecognitionDecision,
    Rect, SuppressionReason,
};
