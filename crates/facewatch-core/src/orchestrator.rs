//! Per-frame recognition cycle.
//!
//! One orchestrator runs at most one cycle at a time. A frame that arrives
//! while a cycle is in flight is dropped on the floor; stale frames are
//! worthless for a live overlay.

use crate::alignment::align_face;
use crate::config::RecognitionConfig;
use crate::cooldown::{self, CooldownState};
use crate::detector::{DetectionError, FaceDetector};
use crate::gallery::Gallery;
use crate::liveness::LivenessGate;
use crate::matcher::Matcher;
use crate::recognizer::{EmbeddingError, EmbeddingExtractor};
use crate::sink::CaptureSink;
use crate::types::{
    FaceObservation, Frame, LivenessVerdict, MatchKey, RecognitionDecision, SuppressionReason,
};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Orchestration policy.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Deadline for the detector, extractor and capture sink calls. The
    /// liveness gate carries its own.
    pub backend_timeout: Duration,
    pub cooldown_min_interval_ms: u64,
    /// Length every embedding must have before it is matched.
    pub embedding_dimension: usize,
    /// Grow factor applied to the detected box before the liveness check.
    pub liveness_crop_scale: f32,
    pub emit_unknown: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self::from(&RecognitionConfig::default())
    }
}

impl From<&RecognitionConfig> for OrchestratorConfig {
    fn from(config: &RecognitionConfig) -> Self {
        Self {
            backend_timeout: Duration::from_millis(config.backend_timeout_ms),
            cooldown_min_interval_ms: config.cooldown_min_interval_ms,
            embedding_dimension: config.embedding_dimension,
            liveness_crop_scale: config.liveness_crop_scale,
            emit_unknown: config.emit_unknown,
        }
    }
}

/// Where the orchestrator is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum OrchestratorState {
    Idle = 0,
    Detecting = 1,
    Liveness = 2,
    Embedding = 3,
    Matching = 4,
    Deciding = 5,
}

impl OrchestratorState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Detecting,
            2 => Self::Liveness,
            3 => Self::Embedding,
            4 => Self::Matching,
            5 => Self::Deciding,
            _ => Self::Idle,
        }
    }
}

/// Counters since construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OrchestratorStats {
    /// Frames that ran a full or partial cycle.
    pub processed: u64,
    /// Frames rejected because a cycle was in flight or after shutdown.
    pub dropped: u64,
    pub emitted: u64,
    pub suppressed: u64,
}

#[derive(Default)]
struct Counters {
    processed: AtomicU64,
    dropped: AtomicU64,
    emitted: AtomicU64,
    suppressed: AtomicU64,
}

/// Returns the orchestrator to `Idle` however the cycle ends, including
/// when the `process_frame` future is dropped mid-flight.
struct CycleGuard<'a> {
    state: &'a AtomicU8,
}

impl CycleGuard<'_> {
    fn advance(&self, next: OrchestratorState) {
        self.state.store(next as u8, Ordering::Release);
    }
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.state.store(OrchestratorState::Idle as u8, Ordering::Release);
    }
}

pub struct RecognitionOrchestrator {
    detector: Arc<dyn FaceDetector>,
    liveness: LivenessGate,
    extractor: Arc<dyn EmbeddingExtractor>,
    gallery: Arc<Gallery>,
    matcher: Box<dyn Matcher>,
    sink: Arc<dyn CaptureSink>,
    config: OrchestratorConfig,
    state: AtomicU8,
    shut_down: AtomicBool,
    cooldown: Mutex<CooldownState>,
    counters: Counters,
}

impl RecognitionOrchestrator {
    pub fn new(
        detector: Arc<dyn FaceDetector>,
        liveness: LivenessGate,
        extractor: Arc<dyn EmbeddingExtractor>,
        gallery: Arc<Gallery>,
        matcher: Box<dyn Matcher>,
        sink: Arc<dyn CaptureSink>,
        config: OrchestratorConfig,
    ) -> Self {
        if extractor.dimension() != config.embedding_dimension {
            tracing::warn!(
                extractor = extractor.dimension(),
                configured = config.embedding_dimension,
                "extractor dimension differs from configured embedding dimension; every face will be suppressed"
            );
        }
        let cooldown = Mutex::new(CooldownState::new(config.cooldown_min_interval_ms));
        Self {
            detector,
            liveness,
            extractor,
            gallery,
            matcher,
            sink,
            config,
            state: AtomicU8::new(OrchestratorState::Idle as u8),
            shut_down: AtomicBool::new(false),
            cooldown,
            counters: Counters::default(),
        }
    }

    pub fn state(&self) -> OrchestratorState {
        OrchestratorState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn gallery(&self) -> &Arc<Gallery> {
        &self.gallery
    }

    /// Current dedup state.
    pub fn cooldown_state(&self) -> CooldownState {
        self.cooldown.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn stats(&self) -> OrchestratorStats {
        OrchestratorStats {
            processed: self.counters.processed.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            emitted: self.counters.emitted.load(Ordering::Relaxed),
            suppressed: self.counters.suppressed.load(Ordering::Relaxed),
        }
    }

    /// Refuse all further cycles. A cycle already in flight runs to completion.
    pub fn shutdown(&self) {
        if !self.shut_down.swap(true, Ordering::AcqRel) {
            tracing::info!("orchestrator shut down");
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Run one recognition cycle over `frame`.
    ///
    /// Returns `None` without touching any backend when another cycle is in
    /// flight or the orchestrator has been shut down.
    pub async fn process_frame(&self, frame: &Frame) -> Option<RecognitionDecision> {
        if self.is_shut_down() {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        if self
            .state
            .compare_exchange(
                OrchestratorState::Idle as u8,
                OrchestratorState::Detecting as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(ts = frame.timestamp_ms, "cycle in flight; frame dropped");
            return None;
        }
        let guard = CycleGuard { state: &self.state };
        self.counters.processed.fetch_add(1, Ordering::Relaxed);

        let decision = self.run_cycle(frame, &guard).await;

        if decision.emitted {
            self.counters.emitted.fetch_add(1, Ordering::Relaxed);
            tracing::info!(
                ts = decision.frame_timestamp_ms,
                person = ?decision.match_result.as_ref().and_then(|m| m.person_id.as_deref()),
                confidence = decision.match_result.as_ref().map(|m| m.confidence),
                "recognition event emitted"
            );
            let capture = self.sink.capture(&decision);
            match tokio::time::timeout(self.config.backend_timeout, capture).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => tracing::warn!(error = %err, "capture sink rejected event"),
                Err(_) => tracing::warn!(
                    timeout_ms = self.config.backend_timeout.as_millis() as u64,
                    "capture sink timed out; event dropped"
                ),
            }
        } else {
            self.counters.suppressed.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                ts = decision.frame_timestamp_ms,
                reason = ?decision.reason,
                "decision suppressed"
            );
        }

        drop(guard);
        Some(decision)
    }

    async fn run_cycle(&self, frame: &Frame, guard: &CycleGuard<'_>) -> RecognitionDecision {
        let ts = frame.timestamp_ms;
        let deadline = self.config.backend_timeout;

        // Detecting
        let detected = tokio::time::timeout(deadline, self.detector.detect(frame))
            .await
            .unwrap_or_else(|_| Err(DetectionError::Timeout(deadline.as_millis() as u64)));
        let face = match detected {
            Ok(faces) => match faces.into_iter().next() {
                Some(face) => face,
                None => return RecognitionDecision::suppressed(ts, SuppressionReason::NoFace),
            },
            Err(err) => {
                tracing::warn!(ts, error = %err, "face detection failed");
                return RecognitionDecision::suppressed(ts, SuppressionReason::DetectionFailure);
            }
        };
        tracing::debug!(ts, confidence = face.confidence, "face detected");

        // Liveness
        guard.advance(OrchestratorState::Liveness);
        let crop = frame.crop(&face.rect, self.config.liveness_crop_scale);
        let verdict = match self.liveness.evaluate(&crop).await {
            Ok(verdict) => verdict,
            Err(err) => {
                tracing::warn!(ts, error = %err, "liveness check failed; rejecting face");
                return stage_suppressed(
                    ts,
                    face,
                    Some(LivenessVerdict::rejected()),
                    SuppressionReason::LivenessFailure,
                );
            }
        };
        if !verdict.is_live {
            tracing::debug!(ts, score = verdict.score, "spoof rejected");
            return stage_suppressed(ts, face, Some(verdict), SuppressionReason::Spoof);
        }

        // Embedding
        guard.advance(OrchestratorState::Embedding);
        let aligned = align_face(frame, &face);
        let embedded = tokio::time::timeout(deadline, self.extractor.embed(&aligned))
            .await
            .unwrap_or_else(|_| Err(EmbeddingError::Timeout(deadline.as_millis() as u64)));
        let embedding = match embedded {
            Ok(embedding) => embedding,
            Err(err @ EmbeddingError::DimensionMismatch { .. }) => {
                tracing::warn!(ts, error = %err, "embedding has unexpected dimension");
                return stage_suppressed(
                    ts,
                    face,
                    Some(verdict),
                    SuppressionReason::EmbeddingDimension,
                );
            }
            Err(err) => {
                tracing::warn!(ts, error = %err, "embedding failed; no match attempted");
                return stage_suppressed(
                    ts,
                    face,
                    Some(verdict),
                    SuppressionReason::EmbeddingFailure,
                );
            }
        };
        if embedding.len() != self.config.embedding_dimension {
            tracing::warn!(
                ts,
                expected = self.config.embedding_dimension,
                actual = embedding.len(),
                "embedding has unexpected dimension"
            );
            return stage_suppressed(
                ts,
                face,
                Some(verdict),
                SuppressionReason::EmbeddingDimension,
            );
        }

        // Matching
        guard.advance(OrchestratorState::Matching);
        let snapshot = self.gallery.snapshot();
        let match_result = self.matcher.best_match(&embedding, &snapshot);
        tracing::debug!(
            ts,
            generation = snapshot.generation(),
            person = ?match_result.person_id,
            confidence = match_result.confidence,
            "match computed"
        );

        // Deciding
        guard.advance(OrchestratorState::Deciding);
        let key = match_result.key();
        let reason = if key == MatchKey::Unknown && !self.config.emit_unknown {
            Some(SuppressionReason::UnknownSuppressed)
        } else if self.should_emit(&key, ts) {
            None
        } else {
            Some(SuppressionReason::Cooldown)
        };

        RecognitionDecision {
            frame_timestamp_ms: ts,
            face: Some(face),
            liveness: Some(verdict),
            match_result: Some(match_result),
            emitted: reason.is_none(),
            reason,
        }
    }

    /// Apply the cooldown policy and advance the state on emission.
    fn should_emit(&self, key: &MatchKey, now_ms: u64) -> bool {
        let mut state = self.cooldown.lock().unwrap_or_else(|e| e.into_inner());
        let decision = cooldown::decide(&state, key, now_ms);
        if decision.emit {
            *state = decision.next;
        }
        decision.emit
    }
}

fn stage_suppressed(
    ts: u64,
    face: FaceObservation,
    liveness: Option<LivenessVerdict>,
    reason: SuppressionReason,
) -> RecognitionDecision {
    RecognitionDecision {
        face: Some(face),
        liveness,
        ..RecognitionDecision::suppressed(ts, reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::liveness::{LivenessChecker, LivenessError};
    use crate::matcher::{LinearMatcher, Metric};
    use crate::sink::{ChannelSink, SinkError};
    use crate::store::{MemoryGalleryStore, StoredIdentity};
    use crate::types::{EmbeddingVector, FaceCrop, Rect};
    use async_trait::async_trait;

    struct OneFace;

    #[async_trait]
    impl FaceDetector for OneFace {
        async fn detect(&self, frame: &Frame) -> Result<Vec<FaceObservation>, DetectionError> {
            Ok(vec![FaceObservation {
                rect: Rect::new(8.0, 8.0, 24.0, 24.0),
                confidence: 0.9,
                landmarks: None,
                frame_timestamp_ms: frame.timestamp_ms,
            }])
        }
    }

    struct Live;

    #[async_trait]
    impl LivenessChecker for Live {
        async fn score(&self, _crop: &FaceCrop) -> Result<f32, LivenessError> {
            Ok(0.9)
        }
    }

    struct Fixed(Vec<f32>);

    #[async_trait]
    impl EmbeddingExtractor for Fixed {
        async fn embed(&self, _aligned: &FaceCrop) -> Result<EmbeddingVector, EmbeddingError> {
            Ok(EmbeddingVector::new(self.0.clone()))
        }

        fn dimension(&self) -> usize {
            self.0.len()
        }
    }

    struct Hanging;

    #[async_trait]
    impl EmbeddingExtractor for Hanging {
        async fn embed(&self, _aligned: &FaceCrop) -> Result<EmbeddingVector, EmbeddingError> {
            std::future::pending().await
        }

        fn dimension(&self) -> usize {
            2
        }
    }

    struct WrongLength;

    #[async_trait]
    impl EmbeddingExtractor for WrongLength {
        async fn embed(&self, _aligned: &FaceCrop) -> Result<EmbeddingVector, EmbeddingError> {
            Err(EmbeddingError::DimensionMismatch {
                expected: 2,
                actual: 3,
            })
        }

        fn dimension(&self) -> usize {
            2
        }
    }

    struct ClosedSink;

    #[async_trait]
    impl CaptureSink for ClosedSink {
        async fn capture(&self, _decision: &RecognitionDecision) -> Result<(), SinkError> {
            Err(SinkError::Closed)
        }
    }

    fn frame(ts: u64) -> Frame {
        Frame::new(vec![128; 32 * 32], 32, 32, ts).unwrap()
    }

    async fn gallery_with(ids: &[(&str, Vec<f32>)]) -> Arc<Gallery> {
        let records = ids
            .iter()
            .map(|(id, v)| StoredIdentity {
                person_id: id.to_string(),
                display_name: id.to_uppercase(),
                embedding: Some(v.clone()),
                raw_features: None,
                model_version: None,
            })
            .collect();
        let gallery = Arc::new(Gallery::new(Arc::new(MemoryGalleryStore::new(records)), 2));
        gallery.refresh().await.unwrap();
        gallery
    }

    fn build(
        extractor: Arc<dyn EmbeddingExtractor>,
        gallery: Arc<Gallery>,
        sink: Arc<dyn CaptureSink>,
        config: OrchestratorConfig,
    ) -> RecognitionOrchestrator {
        let liveness = LivenessGate::new(Arc::new(Live), 0.5, config.backend_timeout);
        RecognitionOrchestrator::new(
            Arc::new(OneFace),
            liveness,
            extractor,
            gallery,
            Box::new(LinearMatcher::new(Metric::Cosine, 0.65)),
            sink,
            config,
        )
    }

    fn config() -> OrchestratorConfig {
        OrchestratorConfig {
            embedding_dimension: 2,
            ..OrchestratorConfig::default()
        }
    }

    #[tokio::test]
    async fn test_emits_match_and_returns_to_idle() {
        let gallery = gallery_with(&[("alice", vec![1.0, 0.0])]).await;
        let (sink, mut rx) = ChannelSink::new(4);
        let orch = build(Arc::new(Fixed(vec![1.0, 0.0])), gallery, Arc::new(sink), config());

        let decision = orch.process_frame(&frame(100)).await.unwrap();
        assert!(decision.emitted);
        assert_eq!(decision.reason, None);
        let m = decision.match_result.as_ref().unwrap();
        assert_eq!(m.person_id.as_deref(), Some("alice"));
        assert_eq!(m.display_name.as_deref(), Some("ALICE"));
        assert!(decision.liveness.unwrap().is_live);
        assert_eq!(orch.state(), OrchestratorState::Idle);

        assert_eq!(rx.recv().await.unwrap(), decision);
        assert_eq!(
            orch.cooldown_state().last_event_key,
            Some(MatchKey::Person("alice".into()))
        );
    }

    #[tokio::test]
    async fn test_unknown_suppressed_when_disabled() {
        let gallery = gallery_with(&[("alice", vec![1.0, 0.0])]).await;
        let (sink, _rx) = ChannelSink::new(4);
        let cfg = OrchestratorConfig {
            emit_unknown: false,
            ..config()
        };
        let orch = build(Arc::new(Fixed(vec![0.0, 1.0])), gallery, Arc::new(sink), cfg);

        let decision = orch.process_frame(&frame(0)).await.unwrap();
        assert!(!decision.emitted);
        assert_eq!(decision.reason, Some(SuppressionReason::UnknownSuppressed));
        assert_eq!(decision.match_result.unwrap().person_id, None);
        assert_eq!(orch.cooldown_state().last_event_key, None);
    }

    #[tokio::test]
    async fn test_unknown_emitted_by_default() {
        let gallery = gallery_with(&[]).await;
        let (sink, _rx) = ChannelSink::new(4);
        let orch = build(Arc::new(Fixed(vec![0.0, 1.0])), gallery, Arc::new(sink), config());

        let decision = orch.process_frame(&frame(0)).await.unwrap();
        assert!(decision.emitted);
        assert_eq!(decision.match_result.unwrap().confidence, 0.0);
        assert_eq!(orch.cooldown_state().last_event_key, Some(MatchKey::Unknown));
    }

    #[tokio::test]
    async fn test_wrong_dimension_suppressed() {
        let gallery = gallery_with(&[("alice", vec![1.0, 0.0])]).await;
        let (sink, _rx) = ChannelSink::new(4);
        let orch = build(Arc::new(Fixed(vec![1.0, 0.0, 0.0])), gallery, Arc::new(sink), config());

        let decision = orch.process_frame(&frame(0)).await.unwrap();
        assert_eq!(decision.reason, Some(SuppressionReason::EmbeddingDimension));
        assert!(decision.face.is_some());
        assert!(decision.match_result.is_none());
    }

    #[tokio::test]
    async fn test_backend_dimension_mismatch_reported_as_dimension() {
        let gallery = gallery_with(&[("alice", vec![1.0, 0.0])]).await;
        let (sink, _rx) = ChannelSink::new(4);
        let orch = build(Arc::new(WrongLength), gallery, Arc::new(sink), config());

        let decision = orch.process_frame(&frame(0)).await.unwrap();
        assert_eq!(decision.reason, Some(SuppressionReason::EmbeddingDimension));
        assert!(decision.match_result.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_sink_does_not_wedge_orchestrator() {
        let gallery = gallery_with(&[("alice", vec![1.0, 0.0])]).await;
        // Capacity 1 and never read.
        let (sink, _rx) = ChannelSink::new(1);
        let orch = build(Arc::new(Fixed(vec![1.0, 0.0])), gallery, Arc::new(sink), config());

        assert!(orch.process_frame(&frame(0)).await.unwrap().emitted);
        // Cooldown elapsed, so this one emits into the full channel.
        assert!(orch.process_frame(&frame(3_000)).await.unwrap().emitted);
        assert_eq!(orch.state(), OrchestratorState::Idle);

        let third = orch.process_frame(&frame(3_010)).await;
        assert_eq!(third.unwrap().reason, Some(SuppressionReason::Cooldown));
        assert_eq!(orch.stats().processed, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_embedding_timeout_is_failure() {
        let gallery = gallery_with(&[("alice", vec![1.0, 0.0])]).await;
        let (sink, _rx) = ChannelSink::new(4);
        let cfg = OrchestratorConfig {
            backend_timeout: Duration::from_millis(50),
            ..config()
        };
        let orch = build(Arc::new(Hanging), gallery, Arc::new(sink), cfg);

        let decision = orch.process_frame(&frame(0)).await.unwrap();
        assert_eq!(decision.reason, Some(SuppressionReason::EmbeddingFailure));
        assert!(decision.match_result.is_none());
        assert_eq!(orch.state(), OrchestratorState::Idle);
    }

    #[tokio::test]
    async fn test_sink_error_does_not_change_decision() {
        let gallery = gallery_with(&[("alice", vec![1.0, 0.0])]).await;
        let orch = build(Arc::new(Fixed(vec![1.0, 0.0])), gallery, Arc::new(ClosedSink), config());

        let decision = orch.process_frame(&frame(0)).await.unwrap();
        assert!(decision.emitted);
        assert_eq!(orch.stats().emitted, 1);
    }

    #[tokio::test]
    async fn test_dropped_future_resets_state() {
        let gallery = gallery_with(&[("alice", vec![1.0, 0.0])]).await;
        let (sink, _rx) = ChannelSink::new(4);
        let orch = build(Arc::new(Hanging), gallery, Arc::new(sink), config());

        let f = frame(0);
        let pending = tokio::time::timeout(Duration::from_millis(10), orch.process_frame(&f)).await;
        assert!(pending.is_err());
        assert_eq!(orch.state(), OrchestratorState::Idle);
    }

    #[tokio::test]
    async fn test_shutdown_refuses_frames() {
        let gallery = gallery_with(&[]).await;
        let (sink, _rx) = ChannelSink::new(4);
        let orch = build(Arc::new(Fixed(vec![1.0, 0.0])), gallery, Arc::new(sink), config());

        orch.shutdown();
        assert!(orch.process_frame(&frame(0)).await.is_none());
        assert_eq!(
            orch.stats(),
            OrchestratorStats {
                processed: 0,
                dropped: 1,
                emitted: 0,
                suppressed: 0,
            }
        );
    }
}
