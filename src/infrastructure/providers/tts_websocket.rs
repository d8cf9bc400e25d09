//! WebSocket text-to-speech transport
//!
//! Speaks the streaming-input protocol: a begin-of-stream frame carrying voice
//! settings and credentials, text frames, and an empty-text end-of-stream
//! frame. The service streams back `{"audio": <base64>, "isFinal": bool}`.

use crate::domain::shared::{DomainError, Result};
use crate::domain::synthesis::{TtsConnection, TtsEvent, TtsFrame, TtsStream, TtsTransport};
use async_trait::async_trait;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TtsResponse {
    #[serde(default)]
    audio: Option<String>,
    #[serde(default)]
    is_final: Option<bool>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Translate one frame from the service into an event
pub fn parse_tts_message(text: &str) -> Option<TtsEvent> {
    let response: TtsResponse = match serde_json::from_str(text) {
        Ok(response) => response,
        Err(e) => {
            warn!("Ignoring malformed synthesis frame: {}", e);
            return None;
        }
    };

    if let Some(error) = response.error {
        let detail = response.message.unwrap_or_default();
        return Some(TtsEvent::Error(format!("{} {}", error, detail).trim().to_string()));
    }

    let is_final = response.is_final.unwrap_or(false);
    if response.audio.is_none() && !is_final {
        return None;
    }

    Some(TtsEvent::Audio {
        payload: response.audio,
        is_final,
    })
}

/// Wire representation of a synthesis frame
pub fn encode_tts_frame(frame: &TtsFrame) -> Value {
    match frame {
        TtsFrame::BeginOfStream { voice, api_key } => json!({
            "text": " ",
            "voice_settings": {
                "stability": voice.stability,
                "similarity_boost": voice.similarity_boost,
                "use_speaker_boost": voice.use_speaker_boost,
            },
            "xi_api_key": api_key,
        }),
        TtsFrame::Text(text) => json!({
            "text": text,
            "try_trigger_generation": true,
        }),
        TtsFrame::EndOfStream => json!({ "text": "" }),
    }
}

/// Opens the shared synthesis WebSocket.
///
/// `url` may contain a `{voice_id}` placeholder.
pub struct WebSocketTtsTransport {
    url: String,
}

impl WebSocketTtsTransport {
    pub fn new(url: &str, voice_id: &str) -> Self {
        Self {
            url: url.replace("{voice_id}", voice_id),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl TtsTransport for WebSocketTtsTransport {
    async fn open(&self) -> Result<TtsStream> {
        let (ws_stream, _) = connect_async(self.url.as_str()).await?;
        info!("Connected to synthesis service");

        let (sink, mut stream) = ws_stream.split();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                match message {
                    Ok(Message::Text(text)) => {
                        if let Some(event) = parse_tts_message(&text) {
                            if event_tx.send(event).is_err() {
                                return;
                            }
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        debug!("Synthesis socket closed: {:?}", frame);
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        let _ = event_tx.send(TtsEvent::Error(e.to_string()));
                        return;
                    }
                }
            }
            let _ = event_tx.send(TtsEvent::Closed);
        });

        Ok(TtsStream {
            connection: Box::new(WebSocketTtsConnection {
                sink: Mutex::new(sink),
            }),
            events: event_rx,
        })
    }
}

struct WebSocketTtsConnection {
    sink: Mutex<WsSink>,
}

#[async_trait]
impl TtsConnection for WebSocketTtsConnection {
    async fn send(&self, frame: TtsFrame) -> Result<()> {
        let body = serde_json::to_string(&encode_tts_frame(&frame))?;
        self.sink
            .lock()
            .await
            .send(Message::Text(body))
            .await
            .map_err(|e| DomainError::Connection(format!("synthesis send failed: {}", e)))
    }

    async fn close(&self) {
        let mut sink = self.sink.lock().await;
        if let Err(e) = sink.close().await {
            debug!("Synthesis socket close failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::synthesis::VoiceSettings;

    #[test]
    fn test_begin_of_stream_frame() {
        let frame = TtsFrame::BeginOfStream {
            voice: VoiceSettings::default(),
            api_key: "key".to_string(),
        };
        let json = encode_tts_frame(&frame);
        assert_eq!(json["text"], " ");
        assert_eq!(json["xi_api_key"], "key");
        assert_eq!(json["voice_settings"]["stability"], 0.5);
    }

    #[test]
    fn test_text_and_end_frames() {
        let json = encode_tts_frame(&TtsFrame::Text("Hello there. ".to_string()));
        assert_eq!(json["text"], "Hello there. ");
        assert_eq!(json["try_trigger_generation"], true);

        assert_eq!(encode_tts_frame(&TtsFrame::EndOfStream), json!({ "text": "" }));
    }

    #[test]
    fn test_parse_audio_frames() {
        assert_eq!(
            parse_tts_message(r#"{"audio":"AAEC","isFinal":false}"#),
            Some(TtsEvent::Audio {
                payload: Some("AAEC".to_string()),
                is_final: false
            })
        );
        assert_eq!(
            parse_tts_message(r#"{"audio":null,"isFinal":true}"#),
            Some(TtsEvent::Audio {
                payload: None,
                is_final: true
            })
        );
        assert_eq!(parse_tts_message(r#"{"normalizedAlignment":{}}"#), None);
    }

    #[test]
    fn test_parse_error_frame() {
        assert_eq!(
            parse_tts_message(r#"{"error":"input_timeout_exceeded","message":"no text received"}"#),
            Some(TtsEvent::Error("input_timeout_exceeded no text received".to_string()))
        );
    }

    #[test]
    fn test_voice_placeholder() {
        let transport = WebSocketTtsTransport::new(
            "wss://tts.example.com/v1/text-to-speech/{voice_id}/stream-input",
            "abc",
        );
        assert_eq!(
            transport.url(),
            "wss://tts.example.com/v1/text-to-speech/abc/stream-input"
        );
    }
}
