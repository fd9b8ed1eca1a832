//! Frame pump between a producer channel and an orchestrator.

use crate::orchestrator::RecognitionOrchestrator;
use crate::types::Frame;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

/// Totals for one [`run_stream`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StreamSummary {
    pub received: u64,
    /// Frames that ran a cycle.
    pub processed: u64,
    /// Frames that lost the race for the in-flight slot.
    pub dropped: u64,
    pub emitted: u64,
    pub suppressed: u64,
}

/// Feed every frame from `frames` to `orchestrator` until the channel closes.
///
/// Each frame gets its own task; whichever finds the orchestrator idle runs
/// the cycle, the rest are dropped. Outstanding cycles are awaited before
/// returning.
pub async fn run_stream(
    orchestrator: Arc<RecognitionOrchestrator>,
    mut frames: mpsc::Receiver<Frame>,
) -> StreamSummary {
    let mut summary = StreamSummary::default();
    let mut tasks = JoinSet::new();

    while let Some(frame) = frames.recv().await {
        summary.received += 1;
        let orch = Arc::clone(&orchestrator);
        tasks.spawn(async move { orch.process_frame(&frame).await });

        // Reap finished cycles so the set does not grow with the stream.
        while let Some(joined) = tasks.try_join_next() {
            tally(&mut summary, joined);
        }
    }

    while let Some(joined) = tasks.join_next().await {
        tally(&mut summary, joined);
    }

    tracing::info!(
        received = summary.received,
        processed = summary.processed,
        dropped = summary.dropped,
        emitted = summary.emitted,
        suppressed = summary.suppressed,
        "frame stream closed"
    );
    summary
}

fn tally(
    summary: &mut StreamSummary,
    joined: Result<Option<crate::types::RecognitionDecision>, tokio::task::JoinError>,
) {
    match joined {
        Ok(Some(decision)) => {
            summary.processed += 1;
            if decision.emitted {
                summary.emitted += 1;
            } else {
                summary.suppressed += 1;
            }
        }
        Ok(None) => summary.dropped += 1,
        Err(err) => {
            tracing::error!(error = %err, "recognition task failed");
            summary.dropped += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::{DetectionError, FaceDetector};
    use crate::gallery::Gallery;
    use crate::liveness::{LivenessChecker, LivenessError, LivenessGate};
    use crate::matcher::{LinearMatcher, Metric};
    use crate::orchestrator::OrchestratorConfig;
    use crate::recognizer::{EmbeddingError, EmbeddingExtractor};
    use crate::sink::ChannelSink;
    use crate::store::MemoryGalleryStore;
    use crate::types::{EmbeddingVector, FaceCrop, FaceObservation};
    use async_trait::async_trait;
    use std::time::Duration;

    struct NoFaces;

    #[async_trait]
    impl FaceDetector for NoFaces {
        async fn detect(&self, _frame: &Frame) -> Result<Vec<FaceObservation>, DetectionError> {
            Ok(Vec::new())
        }
    }

    struct Unused;

    #[async_trait]
    impl LivenessChecker for Unused {
        async fn score(&self, _crop: &FaceCrop) -> Result<f32, LivenessError> {
            Ok(1.0)
        }
    }

    #[async_trait]
    impl EmbeddingExtractor for Unused {
        async fn embed(&self, _aligned: &FaceCrop) -> Result<EmbeddingVector, EmbeddingError> {
            Ok(EmbeddingVector::new(vec![1.0]))
        }

        fn dimension(&self) -> usize {
            1
        }
    }

    #[tokio::test]
    async fn test_pump_counts_every_frame() {
        let gallery = Arc::new(Gallery::new(Arc::new(MemoryGalleryStore::default()), 1));
        let (sink, _rx) = ChannelSink::new(8);
        let orch = Arc::new(RecognitionOrchestrator::new(
            Arc::new(NoFaces),
            LivenessGate::new(Arc::new(Unused), 0.5, Duration::from_secs(1)),
            Arc::new(Unused),
            gallery,
            Box::new(LinearMatcher::new(Metric::Cosine, 0.65)),
            Arc::new(sink),
            OrchestratorConfig {
                embedding_dimension: 1,
                ..OrchestratorConfig::default()
            },
        ));

        let (tx, rx) = mpsc::channel(16);
        for ts in 0..5 {
            tx.send(Frame::new(vec![0; 4], 2, 2, ts).unwrap()).await.unwrap();
        }
        drop(tx);

        let summary = run_stream(Arc::clone(&orch), rx).await;
        assert_eq!(summary.received, 5);
        assert_eq!(summary.processed + summary.dropped, 5);
        assert_eq!(summary.emitted, 0);
        assert_eq!(summary.suppressed, summary.processed);
        assert!(summary.processed >= 1);

        let stats = orch.stats();
        assert_eq!(stats.processed, summary.processed);
        assert_eq!(stats.dropped, summary.dropped);
    }
}
