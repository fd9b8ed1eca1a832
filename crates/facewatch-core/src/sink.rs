//! Capture sinks: where emitted recognition decisions go.
//!
//! The orchestrator only calls a sink for emitted decisions; durable storage,
//! geotagging and alerting are the sink's business.

use crate::types::RecognitionDecision;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Mutex};

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("capture receiver dropped")]
    Closed,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("encode: {0}")]
    Encode(#[from] serde_json::Error),
}

#[async_trait]
pub trait CaptureSink: Send + Sync {
    async fn capture(&self, decision: &RecognitionDecision) -> Result<(), SinkError>;
}

/// One persisted capture event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureRecord {
    pub event_id: uuid::Uuid,
    pub captured_at: chrono::DateTime<chrono::Utc>,
    pub decision: RecognitionDecision,
}

impl CaptureRecord {
    pub fn new(decision: RecognitionDecision) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4(),
            captured_at: chrono::Utc::now(),
            decision,
        }
    }
}

/// Forwards each decision into a tokio channel.
pub struct ChannelSink {
    tx: mpsc::Sender<RecognitionDecision>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<RecognitionDecision>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl CaptureSink for ChannelSink {
    async fn capture(&self, decision: &RecognitionDecision) -> Result<(), SinkError> {
        self.tx
            .send(decision.clone())
            .await
            .map_err(|_| SinkError::Closed)
    }
}

/// Appends one JSON [`CaptureRecord`] per line.
pub struct JsonLinesSink {
    path: PathBuf,
    file: Mutex<tokio::fs::File>,
}

impl JsonLinesSink {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, SinkError> {
        let path = path.as_ref().to_path_buf();
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        tracing::info!(path = %path.display(), "capture log opened");
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl CaptureSink for JsonLinesSink {
    async fn capture(&self, decision: &RecognitionDecision) -> Result<(), SinkError> {
        let record = CaptureRecord::new(decision.clone());
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');

        let mut file = self.file.lock().await;
        file.write_all(&line).await?;
        file.flush().await?;
        tracing::debug!(event_id = %record.event_id, "capture written");
        Ok(())
    }
}
