//! Media-channel control envelope

use crate::domain::shared::Result;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

fn default_track() -> String {
    "inbound".to_string()
}

/// Payload of a `start` event
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartPayload {
    #[serde(default)]
    pub stream_sid: Option<String>,
    #[serde(default)]
    pub call_sid: Option<String>,
    #[serde(default)]
    pub tracks: Vec<String>,
}

/// Payload of an inbound `media` event
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MediaPayload {
    #[serde(default = "default_track")]
    pub track: String,
    pub payload: String,
}

impl MediaPayload {
    pub fn decode_audio(&self) -> Result<Bytes> {
        Ok(Bytes::from(STANDARD.decode(self.payload.as_bytes())?))
    }
}

/// Messages arriving on the media channel
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum InboundMessage {
    Start {
        #[serde(default)]
        start: StartPayload,
        #[serde(rename = "streamSid", default)]
        stream_sid: Option<String>,
    },
    Media {
        media: MediaPayload,
        #[serde(rename = "streamSid", default)]
        stream_sid: Option<String>,
    },
    /// Any other event (`connected`, `stop`, `mark`, ...)
    #[serde(other)]
    Other,
}

impl InboundMessage {
    pub fn parse(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboundPayload {
    pub track: String,
    pub payload: String,
}

/// One synthesized audio chunk on its way back to the caller
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboundMedia {
    pub event: &'static str,
    #[serde(rename = "streamSid")]
    pub stream_sid: Option<String>,
    pub media: OutboundPayload,
}

impl OutboundMedia {
    pub fn new(stream_sid: Option<String>, track: &str, audio: &[u8]) -> Self {
        Self {
            event: "media",
            stream_sid,
            media: OutboundPayload {
                track: track.to_string(),
                payload: STANDARD.encode(audio),
            },
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
