//! Anti-spoofing gate.
//!
//! A [`LivenessChecker`] only scores a crop; the [`LivenessGate`] owns the
//! threshold and the failure policy. Every failure path (backend error,
//! timeout, garbage score) fails closed.

use crate::types::{FaceCrop, LivenessVerdict};
use async_trait::async_trait;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_LIVENESS_THRESHOLD: f32 = 0.5;

const FASNET_INPUT_SIZE: usize = 80;
/// Index of the "real face" logit in the MiniFASNet output.
pub const DEFAULT_LIVE_CLASS: usize = 1;

#[derive(Error, Debug)]
pub enum LivenessError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("liveness backend returned invalid score {0}")]
    InvalidScore(f32),
    #[error("liveness check timed out after {0} ms")]
    Timeout(u64),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Scores a face crop with the probability that it shows a live face.
#[async_trait]
pub trait LivenessChecker: Send + Sync {
    /// Live probability in [0, 1].
    async fn score(&self, crop: &FaceCrop) -> Result<f32, LivenessError>;
}

/// Threshold policy wrapped around a [`LivenessChecker`].
#[derive(Clone)]
pub struct LivenessGate {
    checker: Arc<dyn LivenessChecker>,
    threshold: f32,
    timeout: Duration,
}

impl LivenessGate {
    pub fn new(checker: Arc<dyn LivenessChecker>, threshold: f32, timeout: Duration) -> Self {
        Self {
            checker,
            threshold,
            timeout,
        }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Score a crop and apply the threshold, surfacing backend failures.
    pub async fn evaluate(&self, crop: &FaceCrop) -> Result<LivenessVerdict, LivenessError> {
        let score = tokio::time::timeout(self.timeout, self.checker.score(crop))
            .await
            .map_err(|_| LivenessError::Timeout(self.timeout.as_millis() as u64))??;

        if !score.is_finite() || !(0.0..=1.0).contains(&score) {
            return Err(LivenessError::InvalidScore(score));
        }

        Ok(LivenessVerdict {
            is_live: score >= self.threshold,
            score,
        })
    }

    /// Fail-closed check: any failure is reported as `{is_live: false, score: 0}`.
    pub async fn check(&self, crop: &FaceCrop) -> LivenessVerdict {
        match self.evaluate(crop).await {
            Ok(verdict) => verdict,
            Err(err) => {
                tracing::warn!(error = %err, "liveness check failed; rejecting face");
                LivenessVerdict::rejected()
            }
        }
    }
}

/// MiniFASNet-style passive anti-spoofing classifier.
///
/// Takes an 80×80 crop (replicated to 3 channels, raw 0–255 range) and
/// returns class logits; the live probability is the softmax of the live
/// class.
pub struct OnnxLivenessChecker {
    session: Arc<Mutex<Session>>,
    live_class: usize,
}

impl OnnxLivenessChecker {
    pub fn load(model_path: &str) -> Result<Self, LivenessError> {
        if !Path::new(model_path).exists() {
            return Err(LivenessError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(1)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded liveness model"
        );

        Ok(Self {
            session: Arc::new(Mutex::new(session)),
            live_class: DEFAULT_LIVE_CLASS,
        })
    }

    /// Override which logit counts as live, for exports with a different class order.
    pub fn with_live_class(mut self, live_class: usize) -> Self {
        self.live_class = live_class;
        self
    }

    fn preprocess(crop: &FaceCrop) -> Array4<f32> {
        let size = FASNET_INPUT_SIZE;
        let resized = crop.resize_square(size);
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
        for y in 0..size {
            for x in 0..size {
                let v = resized[y * size + x] as f32;
                for c in 0..3 {
                    tensor[[0, c, y, x]] = v;
                }
            }
        }
        tensor
    }
}

#[async_trait]
impl LivenessChecker for OnnxLivenessChecker {
    async fn score(&self, crop: &FaceCrop) -> Result<f32, LivenessError> {
        let session = Arc::clone(&self.session);
        let input = Self::preprocess(crop);
        let live_class = self.live_class;

        let logits = tokio::task::spawn_blocking(move || -> Result<Vec<f32>, LivenessError> {
            let mut session = session
                .lock()
                .map_err(|_| LivenessError::InferenceFailed("liveness session lock poisoned".into()))?;
            let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
            let (_, data) = outputs[0]
                .try_extract_tensor::<f32>()
                .map_err(|e| LivenessError::InferenceFailed(format!("liveness output: {e}")))?;
            Ok(data.to_vec())
        })
        .await
        .map_err(|e| LivenessError::InferenceFailed(format!("liveness task: {e}")))??;

        live_probability(&logits, live_class)
    }
}

/// Softmax over the logits, returning the probability of `live_class`.
fn live_probability(logits: &[f32], live_class: usize) -> Result<f32, LivenessError> {
    if live_class >= logits.len() {
        return Err(LivenessError::InferenceFailed(format!(
            "live class {live_class} out of range for {} logits",
            logits.len()
        )));
    }
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exp: Vec<f32> = logits.iter().map(|l| (l - max).exp()).collect();
    let sum: f32 = exp.iter().sum();
    if !sum.is_finite() || sum <= 0.0 {
        return Err(LivenessError::InvalidScore(sum));
    }
    Ok(exp[live_class] / sum)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedScore(f32);

    #[async_trait]
    impl LivenessChecker for FixedScore {
        async fn score(&self, _crop: &FaceCrop) -> Result<f32, LivenessError> {
            Ok(self.0)
        }
    }

    struct Failing;

    #[async_trait]
    impl LivenessChecker for Failing {
        async fn score(&self, _crop: &FaceCrop) -> Result<f32, LivenessError> {
            Err(LivenessError::InferenceFailed("backend down".into()))
        }
    }

    struct Slow;

    #[async_trait]
    impl LivenessChecker for Slow {
        async fn score(&self, _crop: &FaceCrop) -> Result<f32, LivenessError> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(1.0)
        }
    }

    fn crop() -> FaceCrop {
        FaceCrop {
            data: vec![100; 16],
            width: 4,
            height: 4,
        }
    }

    fn gate(checker: impl LivenessChecker + 'static) -> LivenessGate {
        LivenessGate::new(Arc::new(checker), DEFAULT_LIVENESS_THRESHOLD, Duration::from_millis(500))
    }

    #[tokio::test]
    async fn test_threshold_is_inclusive() {
        let verdict = gate(FixedScore(0.5)).check(&crop()).await;
        assert!(verdict.is_live);
        assert_eq!(verdict.score, 0.5);

        let verdict = gate(FixedScore(0.49)).check(&crop()).await;
        assert!(!verdict.is_live);
    }

    #[tokio::test]
    async fn test_backend_failure_fails_closed() {
        let verdict = gate(Failing).check(&crop()).await;
        assert_eq!(verdict, LivenessVerdict::rejected());
    }

    #[tokio::test]
    async fn test_out_of_range_score_fails_closed() {
        assert_eq!(gate(FixedScore(f32::NAN)).check(&crop()).await, LivenessVerdict::rejected());
        assert!(matches!(
            gate(FixedScore(1.5)).evaluate(&crop()).await,
            Err(LivenessError::InvalidScore(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fails_closed() {
        let g = gate(Slow);
        assert!(matches!(g.evaluate(&crop()).await, Err(LivenessError::Timeout(500))));
        assert_eq!(g.check(&crop()).await, LivenessVerdict::rejected());
    }

    #[test]
    fn test_live_probability_softmax() {
        let p = live_probability(&[0.0, 0.0], 1).unwrap();
        assert!((p - 0.5).abs() < 1e-6);

        let p = live_probability(&[-5.0, 5.0, -5.0], 1).unwrap();
        assert!(p > 0.99);

        assert!(live_probability(&[1.0], 1).is_err());
    }

    #[test]
    fn test_preprocess_shape() {
        let tensor = OnnxLivenessChecker::preprocess(&crop());
        assert_eq!(tensor.shape(), &[1, 3, FASNET_INPUT_SIZE, FASNET_INPUT_SIZE]);
        assert_eq!(tensor[[0, 2, 40, 40]], 100.0);
    }
}
