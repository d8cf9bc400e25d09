//! Speech synthesis model and transport port

use crate::domain::shared::{DomainError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Voice parameters sent with every begin-of-stream frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceSettings {
    pub voice_id: String,
    pub stability: f32,
    pub similarity_boost: f32,
    pub use_speaker_boost: bool,
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self {
            voice_id: "21m00Tcm4TlvDq8ikWAM".to_string(),
            stability: 0.5,
            similarity_boost: 0.8,
            use_speaker_boost: false,
        }
    }
}

/// Frames written to the synthesis connection
#[derive(Debug, Clone, PartialEq)]
pub enum TtsFrame {
    BeginOfStream {
        voice: VoiceSettings,
        api_key: String,
    },
    Text(String),
    EndOfStream,
}

/// Events read from the synthesis connection
#[derive(Debug, Clone, PartialEq)]
pub enum TtsEvent {
    /// Base64 audio; the final frame of an utterance may carry no audio
    Audio {
        payload: Option<String>,
        is_final: bool,
    },
    Error(String),
    Closed,
}

/// Decoded audio tagged with its per-connection sequence number (first is 1)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynthesisChunk {
    pub sequence: u64,
    pub audio: Bytes,
}

/// Receives the output of one synthesis request
pub trait SynthesisListener: Send + Sync {
    fn on_audio_chunk(&self, chunk: SynthesisChunk);

    fn on_error(&self, error: DomainError);
}

#[async_trait]
pub trait TtsConnection: Send + Sync {
    async fn send(&self, frame: TtsFrame) -> Result<()>;

    async fn close(&self);
}

/// An opened synthesis connection: write half plus its event feed
pub struct TtsStream {
    pub connection: Box<dyn TtsConnection>,
    pub events: mpsc::UnboundedReceiver<TtsEvent>,
}

/// Opens connections to the text-to-speech service
#[async_trait]
pub trait TtsTransport: Send + Sync {
    async fn open(&self) -> Result<TtsStream>;
}
