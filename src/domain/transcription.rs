//! Speech recognition model and transport port

use crate::domain::shared::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Streaming recognition configuration, written as the first frame of every stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecognitionConfig {
    pub encoding: String,
    pub sample_rate_hertz: u32,
    pub audio_channel_count: u16,
    pub language_codes: Vec<String>,
    pub model: String,
    pub interim_results: bool,
}

/// One transcript hypothesis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognitionAlternative {
    pub transcript: String,
    #[serde(default)]
    pub confidence: Option<f32>,
}

/// One result frame entry, alternatives ordered best first
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecognitionResult {
    #[serde(default)]
    pub alternatives: Vec<RecognitionAlternative>,
    #[serde(default)]
    pub is_final: bool,
}

impl RecognitionResult {
    pub fn top_transcript(&self) -> Option<&str> {
        self.alternatives.first().map(|a| a.transcript.as_str())
    }
}

/// Frames written to a recognition stream
#[derive(Debug, Clone)]
pub enum AsrFrame {
    Config(RecognitionConfig),
    Audio(Bytes),
}

/// Events produced by a recognition stream
#[derive(Debug, Clone)]
pub enum AsrEvent {
    Data(Vec<RecognitionResult>),
    Error(String),
    Closed,
}

/// Transcript emitted for one track
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transcript {
    pub track: String,
    pub text: String,
    pub is_final: bool,
}

/// Listener registered once per stream at construction
pub type TranscriptListener = mpsc::UnboundedSender<Transcript>;

/// Write half of an open recognition stream
#[async_trait]
pub trait AsrConnection: Send + Sync {
    async fn write(&self, frame: AsrFrame) -> Result<()>;

    async fn close(&self);
}

/// An opened recognition stream: the write half plus its event feed
pub struct AsrStream {
    pub connection: Box<dyn AsrConnection>,
    pub events: mpsc::UnboundedReceiver<AsrEvent>,
}

/// Opens recognition streams against the speech-to-text service
#[async_trait]
pub trait AsrTransport: Send + Sync {
    async fn open(&self, track: &str) -> Result<AsrStream>;
}
