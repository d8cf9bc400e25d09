//! WebSocket speech-to-text transport
//!
//! Protocol: the first text frame carries `{"streamingConfig": {...}}`, audio
//! follows as binary frames. The service answers with
//! `{"results": [{"alternatives": [{"transcript": ...}], "isFinal": ...}]}`
//! or `{"error": {"code": ..., "message": ...}}`.

use crate::domain::shared::{DomainError, Result};
use crate::domain::transcription::{
    AsrConnection, AsrEvent, AsrFrame, AsrStream, AsrTransport, RecognitionResult,
};
use async_trait::async_trait;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

#[derive(Debug, Deserialize)]
struct AsrResponse {
    #[serde(default)]
    results: Vec<RecognitionResult>,
    #[serde(default)]
    error: Option<AsrErrorBody>,
}

#[derive(Debug, Deserialize)]
struct AsrErrorBody {
    #[serde(default)]
    code: Option<i64>,
    #[serde(default)]
    message: String,
}

/// Translate one text frame from the service into an event
pub fn parse_asr_message(text: &str) -> Option<AsrEvent> {
    let response: AsrResponse = match serde_json::from_str(text) {
        Ok(response) => response,
        Err(e) => {
            warn!("Ignoring malformed recognition frame: {}", e);
            return None;
        }
    };

    if let Some(error) = response.error {
        let message = match error.code {
            Some(code) => format!("{} (code {})", error.message, code),
            None => error.message,
        };
        return Some(AsrEvent::Error(message));
    }

    if response.results.is_empty() {
        return None;
    }
    Some(AsrEvent::Data(response.results))
}

fn encode_frame(frame: AsrFrame) -> Result<Message> {
    match frame {
        AsrFrame::Config(config) => {
            let body = json!({ "streamingConfig": config });
            Ok(Message::Text(serde_json::to_string(&body)?))
        }
        AsrFrame::Audio(audio) => Ok(Message::Binary(audio.to_vec())),
    }
}

/// Opens one WebSocket per recognition stream
pub struct WebSocketAsrTransport {
    url: String,
    api_key: String,
}

impl WebSocketAsrTransport {
    pub fn new(url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            api_key: api_key.into(),
        }
    }
}

#[async_trait]
impl AsrTransport for WebSocketAsrTransport {
    async fn open(&self, track: &str) -> Result<AsrStream> {
        let mut request = self.url.as_str().into_client_request()?;
        if !self.api_key.is_empty() {
            let value = HeaderValue::from_str(&format!("Bearer {}", self.api_key))
                .map_err(|e| DomainError::Configuration(format!("invalid ASR api key: {}", e)))?;
            request.headers_mut().insert("Authorization", value);
        }

        let (ws_stream, _) = connect_async(request).await?;
        info!(track = %track, "Connected to recognition service");

        let (sink, mut stream) = ws_stream.split();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let track = track.to_string();

        tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                match message {
                    Ok(Message::Text(text)) => {
                        if let Some(event) = parse_asr_message(&text) {
                            if event_tx.send(event).is_err() {
                                return;
                            }
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        debug!(track = %track, "Recognition socket closed: {:?}", frame);
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        let _ = event_tx.send(AsrEvent::Error(e.to_string()));
                        return;
                    }
                }
            }
            let _ = event_tx.send(AsrEvent::Closed);
        });

        Ok(AsrStream {
            connection: Box::new(WebSocketAsrConnection {
                sink: Mutex::new(sink),
            }),
            events: event_rx,
        })
    }
}

struct WebSocketAsrConnection {
    sink: Mutex<WsSink>,
}

#[async_trait]
impl AsrConnection for WebSocketAsrConnection {
    async fn write(&self, frame: AsrFrame) -> Result<()> {
        let message = encode_frame(frame)?;
        self.sink.lock().await.send(message).await?;
        Ok(())
    }

    async fn close(&self) {
        let mut sink = self.sink.lock().await;
        if let Err(e) = sink.close().await {
            debug!("Recognition socket close failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::transcription::RecognitionConfig;
    use bytes::Bytes;

    #[test]
    fn test_parse_results() {
        let event = parse_asr_message(
            r#"{"results":[{"alternatives":[{"transcript":"book a room","confidence":0.9}],"isFinal":true}]}"#,
        );
        match event {
            Some(AsrEvent::Data(results)) => {
                assert_eq!(results.len(), 1);
                assert!(results[0].is_final);
                assert_eq!(results[0].top_transcript(), Some("book a room"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_parse_error() {
        let event = parse_asr_message(
            r#"{"error":{"code":11,"message":"Exceeded maximum allowed stream duration"}}"#,
        );
        match event {
            Some(AsrEvent::Error(message)) => {
                assert!(message.contains("maximum allowed stream duration"));
                assert!(message.contains("code 11"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_parse_ignores_empty_and_malformed_frames() {
        assert!(parse_asr_message(r#"{"results":[]}"#).is_none());
        assert!(parse_asr_message(r#"{"speechEventType":"END_OF_SINGLE_UTTERANCE"}"#).is_none());
        assert!(parse_asr_message("garbage").is_none());
    }

    #[test]
    fn test_encode_frames() {
        let config = RecognitionConfig {
            encoding: "MULAW".to_string(),
            sample_rate_hertz: 8000,
            audio_channel_count: 1,
            language_codes: vec!["en-US".to_string(), "es-ES".to_string()],
            model: "phone_call".to_string(),
            interim_results: true,
        };

        let Message::Text(text) = encode_frame(AsrFrame::Config(config)).unwrap() else {
            panic!("config must be a text frame");
        };
        let json: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(json["streamingConfig"]["encoding"], "MULAW");
        assert_eq!(json["streamingConfig"]["languageCodes"][1], "es-ES");

        let audio = encode_frame(AsrFrame::Audio(Bytes::from_static(&[1, 2, 3]))).unwrap();
        assert_eq!(audio, Message::Binary(vec![1, 2, 3]));
    }
}
