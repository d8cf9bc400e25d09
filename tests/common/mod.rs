//! In-memory collaborators for integration tests
#![allow(dead_code, unused_macros)]

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use voxrelay::application::{RunQueue, SessionContext, SessionSettings};
use voxrelay::domain::backoff::ReconnectPolicy;
use voxrelay::domain::completion::{CompletionBackend, TokenSink};
use voxrelay::domain::language::LanguageRegistry;
use voxrelay::domain::synthesis::{TtsConnection, TtsEvent, TtsFrame, TtsStream, TtsTransport};
use voxrelay::domain::transcription::{
    AsrConnection, AsrEvent, AsrFrame, AsrStream, AsrTransport, RecognitionAlternative,
    RecognitionConfig, RecognitionResult,
};
use voxrelay::infrastructure::speech::{SpeechSynthesizer, SynthesizerSettings, TranscriptionSettings};
use voxrelay::{DomainError, Result};

/// Poll a condition until it holds or two seconds pass
macro_rules! eventually {
    ($cond:expr) => {{
        let mut held = false;
        for _ in 0..400 {
            if $cond {
                held = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        held
    }};
}

pub fn fast_policy(max_attempts: u32) -> ReconnectPolicy {
    ReconnectPolicy {
        base_delay_ms: 1,
        max_delay_ms: 1,
        max_attempts,
    }
}

pub fn fast_transcription_settings() -> TranscriptionSettings {
    TranscriptionSettings {
        reconnect: fast_policy(5),
        ..TranscriptionSettings::default()
    }
}

// ---------------------------------------------------------------------------
// Recognition
// ---------------------------------------------------------------------------

/// One stream opened through [`FakeAsrTransport`]
#[derive(Clone)]
pub struct FakeAsrStream {
    pub track: String,
    frames: Arc<Mutex<Vec<AsrFrame>>>,
    closed: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<AsrEvent>,
}

impl FakeAsrStream {
    pub fn config(&self) -> Option<RecognitionConfig> {
        self.frames.lock().unwrap().iter().find_map(|frame| match frame {
            AsrFrame::Config(config) => Some(config.clone()),
            AsrFrame::Audio(_) => None,
        })
    }

    pub fn audio_chunks(&self) -> usize {
        self.frames
            .lock()
            .unwrap()
            .iter()
            .filter(|frame| matches!(frame, AsrFrame::Audio(_)))
            .count()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn emit(&self, text: &str, is_final: bool) {
        let _ = self.events.send(AsrEvent::Data(vec![RecognitionResult {
            alternatives: vec![RecognitionAlternative {
                transcript: text.to_string(),
                confidence: Some(0.9),
            }],
            is_final,
        }]));
    }

    pub fn fail(&self, message: &str) {
        let _ = self.events.send(AsrEvent::Error(message.to_string()));
    }
}

struct FakeAsrConnection {
    frames: Arc<Mutex<Vec<AsrFrame>>>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl AsrConnection for FakeAsrConnection {
    async fn write(&self, frame: AsrFrame) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DomainError::Stream("stream closed".to_string()));
        }
        self.frames.lock().unwrap().push(frame);
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct FakeAsrTransport {
    streams: Mutex<Vec<FakeAsrStream>>,
    fail_opens: AtomicBool,
    open_attempts: AtomicUsize,
}

impl FakeAsrTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_fail_opens(&self, fail: bool) {
        self.fail_opens.store(fail, Ordering::SeqCst);
    }

    pub fn streams(&self) -> Vec<FakeAsrStream> {
        self.streams.lock().unwrap().clone()
    }

    pub fn streams_for(&self, track: &str) -> Vec<FakeAsrStream> {
        self.streams().into_iter().filter(|s| s.track == track).collect()
    }

    pub fn latest(&self, track: &str) -> Option<FakeAsrStream> {
        self.streams_for(track).pop()
    }

    pub fn open_attempts(&self) -> usize {
        self.open_attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AsrTransport for FakeAsrTransport {
    async fn open(&self, track: &str) -> Result<AsrStream> {
        self.open_attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_opens.load(Ordering::SeqCst) {
            return Err(DomainError::Connection("recognition service unreachable".to_string()));
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let frames = Arc::new(Mutex::new(Vec::new()));
        let closed = Arc::new(AtomicBool::new(false));
        self.streams.lock().unwrap().push(FakeAsrStream {
            track: track.to_string(),
            frames: frames.clone(),
            closed: closed.clone(),
            events: events_tx,
        });

        Ok(AsrStream {
            connection: Box::new(FakeAsrConnection { frames, closed }),
            events: events_rx,
        })
    }
}

// ---------------------------------------------------------------------------
// Synthesis
// ---------------------------------------------------------------------------

/// One connection opened through [`FakeTtsTransport`]
#[derive(Clone)]
pub struct FakeTtsConnectionHandle {
    frames: Arc<Mutex<Vec<TtsFrame>>>,
    closed: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<TtsEvent>,
}

impl FakeTtsConnectionHandle {
    pub fn frames(&self) -> Vec<TtsFrame> {
        self.frames.lock().unwrap().clone()
    }

    pub fn texts(&self) -> Vec<String> {
        self.frames()
            .into_iter()
            .filter_map(|frame| match frame {
                TtsFrame::Text(text) => Some(text),
                _ => None,
            })
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn audio(&self, bytes: &[u8], is_final: bool) {
        let _ = self.events.send(TtsEvent::Audio {
            payload: Some(STANDARD.encode(bytes)),
            is_final,
        });
    }

    /// Final frame of an utterance, without audio
    pub fn finish(&self) {
        let _ = self.events.send(TtsEvent::Audio {
            payload: None,
            is_final: true,
        });
    }

    pub fn drop_connection(&self) {
        let _ = self.events.send(TtsEvent::Error("connection reset".to_string()));
    }
}

struct FakeTtsConnection {
    handle: FakeTtsConnectionHandle,
    auto_reply: bool,
}

#[async_trait]
impl TtsConnection for FakeTtsConnection {
    async fn send(&self, frame: TtsFrame) -> Result<()> {
        if self.handle.is_closed() {
            return Err(DomainError::Connection("connection closed".to_string()));
        }
        let end_of_stream = frame == TtsFrame::EndOfStream;
        self.handle.frames.lock().unwrap().push(frame);

        if end_of_stream && self.auto_reply {
            // Echo the last text back as one audio chunk, then finish
            let text = self.handle.texts().pop().unwrap_or_default();
            self.handle.audio(text.as_bytes(), false);
            self.handle.finish();
        }
        Ok(())
    }

    async fn close(&self) {
        self.handle.closed.store(true, Ordering::SeqCst);
    }
}

pub struct FakeTtsTransport {
    connections: Mutex<Vec<FakeTtsConnectionHandle>>,
    auto_reply: bool,
}

impl FakeTtsTransport {
    /// Replies to every finished request with one chunk of audio
    pub fn echoing() -> Arc<Self> {
        Arc::new(Self {
            connections: Mutex::new(Vec::new()),
            auto_reply: true,
        })
    }

    /// Never replies on its own; tests drive the audio frames
    pub fn silent() -> Arc<Self> {
        Arc::new(Self {
            connections: Mutex::new(Vec::new()),
            auto_reply: false,
        })
    }

    pub fn connections(&self) -> Vec<FakeTtsConnectionHandle> {
        self.connections.lock().unwrap().clone()
    }

    pub fn latest(&self) -> Option<FakeTtsConnectionHandle> {
        self.connections().pop()
    }

    /// Every text frame sent over every connection, in order
    pub fn texts(&self) -> Vec<String> {
        self.connections().iter().flat_map(|c| c.texts()).collect()
    }
}

#[async_trait]
impl TtsTransport for FakeTtsTransport {
    async fn open(&self) -> Result<TtsStream> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let handle = FakeTtsConnectionHandle {
            frames: Arc::new(Mutex::new(Vec::new())),
            closed: Arc::new(AtomicBool::new(false)),
            events: events_tx,
        };
        self.connections.lock().unwrap().push(handle.clone());

        Ok(TtsStream {
            connection: Box::new(FakeTtsConnection {
                handle,
                auto_reply: self.auto_reply,
            }),
            events: events_rx,
        })
    }
}

// ---------------------------------------------------------------------------
// Language model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendCall {
    CreateThread(Option<String>),
    Append { thread_id: String, text: String },
    RunStarted(String),
    RunFinished(String),
}

/// Scripted backend that streams a fixed list of deltas for every run
pub struct FakeBackend {
    deltas: Vec<String>,
    run_delay: Duration,
    calls: Mutex<Vec<BackendCall>>,
    threads: AtomicUsize,
    active_runs: AtomicUsize,
    max_active_runs: AtomicUsize,
}

impl FakeBackend {
    pub fn new(deltas: &[&str]) -> Arc<Self> {
        Self::with_run_delay(deltas, Duration::ZERO)
    }

    pub fn with_run_delay(deltas: &[&str], run_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            deltas: deltas.iter().map(|d| d.to_string()).collect(),
            run_delay,
            calls: Mutex::new(Vec::new()),
            threads: AtomicUsize::new(0),
            active_runs: AtomicUsize::new(0),
            max_active_runs: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> Vec<BackendCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn appended(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                BackendCall::Append { text, .. } => Some(text),
                _ => None,
            })
            .collect()
    }

    pub fn runs_started(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                BackendCall::RunStarted(thread_id) => Some(thread_id),
                _ => None,
            })
            .collect()
    }

    pub fn runs_finished(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, BackendCall::RunFinished(_)))
            .count()
    }

    pub fn max_active_runs(&self) -> usize {
        self.max_active_runs.load(Ordering::SeqCst)
    }

    fn record(&self, call: BackendCall) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl CompletionBackend for FakeBackend {
    async fn create_thread(&self, greeting: Option<String>) -> Result<String> {
        self.record(BackendCall::CreateThread(greeting));
        let n = self.threads.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("thread_{}", n))
    }

    async fn append_message(&self, thread_id: &str, text: &str) -> Result<()> {
        self.record(BackendCall::Append {
            thread_id: thread_id.to_string(),
            text: text.to_string(),
        });
        Ok(())
    }

    async fn stream_run(&self, thread_id: &str, on_delta: TokenSink) -> Result<()> {
        let active = self.active_runs.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active_runs.fetch_max(active, Ordering::SeqCst);
        self.record(BackendCall::RunStarted(thread_id.to_string()));

        for delta in &self.deltas {
            if !self.run_delay.is_zero() {
                tokio::time::sleep(self.run_delay).await;
            }
            on_delta(delta);
        }

        self.active_runs.fetch_sub(1, Ordering::SeqCst);
        self.record(BackendCall::RunFinished(thread_id.to_string()));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

pub struct Harness {
    pub asr: Arc<FakeAsrTransport>,
    pub tts: Arc<FakeTtsTransport>,
    pub backend: Arc<FakeBackend>,
    pub context: SessionContext,
}

impl Harness {
    pub fn new(deltas: &[&str]) -> Self {
        Self::with_backend(FakeBackend::new(deltas))
    }

    pub fn with_backend(backend: Arc<FakeBackend>) -> Self {
        let asr = FakeAsrTransport::new();
        let tts = FakeTtsTransport::echoing();
        let synthesizer = SpeechSynthesizer::new(
            tts.clone(),
            SynthesizerSettings {
                api_key: "xi-test".to_string(),
                reconnect: fast_policy(3),
                ..SynthesizerSettings::default()
            },
        );

        let context = SessionContext {
            run_queue: RunQueue::new(backend.clone()),
            synthesizer,
            asr_transport: asr.clone(),
            transcription: fast_transcription_settings(),
            languages: LanguageRegistry::new("en-US", &["en-US".to_string()]),
            settings: SessionSettings {
                greeting: "Hello! How can I help?".to_string(),
                greeting_track: "inbound".to_string(),
            },
        };

        Self {
            asr,
            tts,
            backend,
            context,
        }
    }
}

pub fn start_message(stream_sid: &str) -> String {
    serde_json::json!({
        "event": "start",
        "streamSid": stream_sid,
        "start": { "streamSid": stream_sid, "callSid": "CA123", "tracks": ["inbound"] }
    })
    .to_string()
}

pub fn media_message(stream_sid: &str, track: &str, audio: &[u8]) -> String {
    serde_json::json!({
        "event": "media",
        "streamSid": stream_sid,
        "media": { "track": track, "payload": STANDARD.encode(audio) }
    })
    .to_string()
}
