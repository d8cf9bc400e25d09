//! Live call session
//!
//! One session per media-channel connection. Inbound audio is fanned out to a
//! recognition stream per track; final transcripts become queued runs whose
//! streamed text is cut at punctuation and spoken back incrementally through
//! the shared synthesizer.
//!
//! Runs and synthesis requests are not cancelled when the session closes.
//! Their callbacks may fire afterwards, so everything deferred checks the
//! session's liveness flag before touching session state or the channel.

use crate::application::run_queue::RunQueue;
use crate::domain::completion::TokenSink;
use crate::domain::language::{normalize_language_codes, LanguageRegistry};
use crate::domain::media::{InboundMessage, MediaPayload, OutboundMedia, StartPayload};
use crate::domain::shared::{DomainError, Result};
use crate::domain::synthesis::{SynthesisChunk, SynthesisListener};
use crate::domain::transcription::{AsrTransport, Transcript};
use crate::infrastructure::speech::{SpeechSynthesizer, TranscriptionSettings, TranscriptionStream};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Characters that end a speakable fragment
pub const SENTENCE_BOUNDARIES: [char; 9] = ['.', ',', '/', ';', '!', '?', ':', '[', ']'];

pub fn contains_sentence_boundary(text: &str) -> bool {
    text.contains(&SENTENCE_BOUNDARIES[..])
}

/// Session behaviour settings
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Spoken as soon as the call starts; empty disables the greeting
    pub greeting: String,
    /// Track label used on outbound greeting audio
    pub greeting_track: String,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            greeting: "Hello! How can I help you today?".to_string(),
            greeting_track: "inbound".to_string(),
        }
    }
}

/// Process-wide resources every session works with
#[derive(Clone)]
pub struct SessionContext {
    pub run_queue: RunQueue,
    pub synthesizer: SpeechSynthesizer,
    pub asr_transport: Arc<dyn AsrTransport>,
    pub transcription: TranscriptionSettings,
    pub languages: LanguageRegistry,
    pub settings: SessionSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    AwaitingStart,
    Active,
    Closed,
}

/// Snapshot for monitoring
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: Uuid,
    pub state: SessionState,
    pub stream_sid: Option<String>,
    pub thread_id: Option<String>,
    pub tracks: Vec<String>,
    pub chunks_sent: u64,
    pub started_at: DateTime<Utc>,
}

/// Text queued for synthesis
struct Utterance {
    track: String,
    text: String,
}

/// State shared with callbacks that may outlive the session
struct SessionShared {
    id: Uuid,
    alive: AtomicBool,
    stream_sid: Mutex<Option<String>>,
    outbound: mpsc::UnboundedSender<String>,
    chunks_sent: AtomicU64,
}

impl SessionShared {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn stream_sid(&self) -> Option<String> {
        self.stream_sid
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    fn remember_stream_sid(&self, stream_sid: Option<String>) {
        if let Some(sid) = stream_sid {
            let mut current = self.stream_sid.lock().unwrap_or_else(|p| p.into_inner());
            if current.is_none() {
                *current = Some(sid);
            }
        }
    }
}

/// Routes one utterance's audio onto the media channel
struct OutboundAudio {
    shared: Arc<SessionShared>,
    track: String,
}

impl SynthesisListener for OutboundAudio {
    fn on_audio_chunk(&self, chunk: SynthesisChunk) {
        if !self.shared.is_alive() {
            debug!(session_id = %self.shared.id, sequence = chunk.sequence, "Dropping audio for closed session");
            return;
        }

        let message = OutboundMedia::new(self.shared.stream_sid(), &self.track, &chunk.audio);
        match message.to_json() {
            Ok(json) => {
                if self.shared.outbound.send(json).is_err() {
                    debug!(session_id = %self.shared.id, "Media channel writer is gone");
                    return;
                }
                self.shared.chunks_sent.fetch_add(1, Ordering::SeqCst);
            }
            Err(e) => error!(session_id = %self.shared.id, "Failed to encode outbound media: {}", e),
        }
    }

    fn on_error(&self, error: DomainError) {
        warn!(session_id = %self.shared.id, track = %self.track, "Synthesis failed: {}", error);
    }
}

struct SessionData {
    state: SessionState,
    thread_id: Option<String>,
    streams: HashMap<String, TranscriptionStream>,
    buffers: HashMap<String, String>,
    language_codes: Vec<String>,
    /// Final transcripts that arrived before the thread was created
    pending_finals: Vec<Transcript>,
}

struct SessionInner {
    context: SessionContext,
    shared: Arc<SessionShared>,
    data: Mutex<SessionData>,
    transcripts: mpsc::UnboundedSender<Transcript>,
    speech: mpsc::UnboundedSender<Utterance>,
    started_at: DateTime<Utc>,
}

impl SessionInner {
    fn data(&self) -> MutexGuard<'_, SessionData> {
        self.data.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn speak(&self, track: &str, text: String) {
        if text.trim().is_empty() {
            return;
        }
        let utterance = Utterance {
            track: track.to_string(),
            text,
        };
        if self.speech.send(utterance).is_err() {
            debug!(session_id = %self.shared.id, "Speech worker is gone");
        }
    }

    /// Accumulate a delta; flush the track buffer at a sentence boundary
    fn on_token_delta(&self, track: &str, delta: &str) {
        if !self.shared.is_alive() {
            return;
        }

        let flushed = {
            let mut data = self.data();
            let buffer = data.buffers.entry(track.to_string()).or_default();
            buffer.push_str(delta);
            if contains_sentence_boundary(delta) {
                buffer.push(' ');
                Some(std::mem::take(buffer))
            } else {
                None
            }
        };

        if let Some(text) = flushed {
            debug!(session_id = %self.shared.id, track = %track, "Flushing {} chars to synthesis", text.len());
            self.speak(track, text);
        }
    }

    /// Speak whatever is left once a run ends
    fn flush_remaining(&self, track: &str) {
        if !self.shared.is_alive() {
            return;
        }
        let remaining = {
            let mut data = self.data();
            data.buffers.get_mut(track).map(std::mem::take)
        };
        if let Some(text) = remaining {
            self.speak(track, text);
        }
    }
}

/// Orchestrates one live call
#[derive(Clone)]
pub struct CallSession {
    inner: Arc<SessionInner>,
}

impl CallSession {
    /// Create a session writing outbound JSON messages to `outbound`
    pub fn new(context: SessionContext, outbound: mpsc::UnboundedSender<String>) -> Self {
        let id = Uuid::new_v4();
        let (transcript_tx, transcript_rx) = mpsc::unbounded_channel();
        let (speech_tx, speech_rx) = mpsc::unbounded_channel();
        let language_codes = context.languages.current();

        let shared = Arc::new(SessionShared {
            id,
            alive: AtomicBool::new(true),
            stream_sid: Mutex::new(None),
            outbound,
            chunks_sent: AtomicU64::new(0),
        });

        let inner = Arc::new(SessionInner {
            context,
            shared: shared.clone(),
            data: Mutex::new(SessionData {
                state: SessionState::AwaitingStart,
                thread_id: None,
                streams: HashMap::new(),
                buffers: HashMap::new(),
                language_codes,
                pending_finals: Vec::new(),
            }),
            transcripts: transcript_tx,
            speech: speech_tx,
            started_at: Utc::now(),
        });

        spawn_speech_worker(shared, inner.context.synthesizer.clone(), speech_rx);
        spawn_transcript_worker(Arc::downgrade(&inner), transcript_rx);

        info!(session_id = %id, "Call session created");
        Self { inner }
    }

    pub fn id(&self) -> Uuid {
        self.inner.shared.id
    }

    /// Handle one raw message from the media channel. Never fails.
    pub async fn handle_message(&self, text: &str) {
        let message = match InboundMessage::parse(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(session_id = %self.id(), "Ignoring malformed message: {}", e);
                return;
            }
        };

        let result = match message {
            InboundMessage::Start { start, stream_sid } => self.handle_start(start, stream_sid).await,
            InboundMessage::Media { media, stream_sid } => self.handle_media(media, stream_sid).await,
            InboundMessage::Other => {
                debug!(session_id = %self.id(), "Ignoring unsupported event");
                Ok(())
            }
        };

        if let Err(e) = result {
            warn!(session_id = %self.id(), "Failed to handle message: {}", e);
        }
    }

    /// Begin the conversation: create the thread and speak the greeting
    pub async fn handle_start(&self, start: StartPayload, stream_sid: Option<String>) -> Result<()> {
        {
            let mut data = self.inner.data();
            if data.state != SessionState::AwaitingStart {
                info!(session_id = %self.id(), "Ignoring repeated start event");
                return Ok(());
            }
            data.state = SessionState::Active;
        }

        self.inner
            .shared
            .remember_stream_sid(start.stream_sid.or(stream_sid));
        info!(
            session_id = %self.id(),
            call_sid = ?start.call_sid,
            "Call started"
        );

        let settings = &self.inner.context.settings;
        let greeting = Some(settings.greeting.clone()).filter(|g| !g.trim().is_empty());
        if let Some(greeting) = &greeting {
            self.inner.speak(&settings.greeting_track, greeting.clone());
        }

        let thread_id = self
            .inner
            .context
            .run_queue
            .backend()
            .create_thread(greeting)
            .await?;

        if !self.inner.shared.is_alive() {
            return Ok(());
        }
        info!(session_id = %self.id(), thread_id = %thread_id, "Conversation thread ready");
        let pending = {
            let mut data = self.inner.data();
            data.thread_id = Some(thread_id.clone());
            std::mem::take(&mut data.pending_finals)
        };

        for transcript in pending {
            self.enqueue_reply(thread_id.clone(), transcript);
        }
        Ok(())
    }

    /// Forward one audio chunk to its track's recognition stream
    pub async fn handle_media(&self, media: MediaPayload, stream_sid: Option<String>) -> Result<()> {
        if !self.inner.shared.is_alive() {
            return Ok(());
        }
        self.inner.shared.remember_stream_sid(stream_sid);

        let audio = media.decode_audio()?;
        let stream = {
            let mut data = self.inner.data();
            let language_codes = data.language_codes.clone();
            data.streams
                .entry(media.track.clone())
                .or_insert_with(|| {
                    info!(session_id = %self.inner.shared.id, track = %media.track, "Provisioning recognition stream");
                    TranscriptionStream::new(
                        media.track.clone(),
                        self.inner.context.asr_transport.clone(),
                        self.inner.context.transcription.clone(),
                        &language_codes,
                        self.inner.transcripts.clone(),
                    )
                })
                .clone()
        };

        stream.send(audio).await;
        Ok(())
    }

    /// React to a transcript: final ones become runs
    pub async fn handle_transcript(&self, transcript: Transcript) -> Result<()> {
        if !self.inner.shared.is_alive() {
            debug!(session_id = %self.id(), "Dropping transcript for closed session");
            return Ok(());
        }

        if !transcript.is_final {
            debug!(session_id = %self.id(), track = %transcript.track, "Interim: {}", transcript.text);
            return Ok(());
        }

        if transcript.text.trim().is_empty() {
            return Ok(());
        }

        let thread_id = {
            let mut data = self.inner.data();
            match data.thread_id.clone() {
                Some(thread_id) => thread_id,
                None => {
                    info!(session_id = %self.id(), track = %transcript.track, "Holding final transcript until the thread exists");
                    data.pending_finals.push(transcript);
                    return Ok(());
                }
            }
        };

        self.enqueue_reply(thread_id, transcript);
        Ok(())
    }

    /// Queue a run answering `transcript` and speak its output on the same track
    fn enqueue_reply(&self, thread_id: String, transcript: Transcript) {
        let text = transcript.text.trim();
        info!(session_id = %self.id(), track = %transcript.track, "Caller said: {}", text);

        let weak = Arc::downgrade(&self.inner);
        let track = transcript.track.clone();
        let sink: TokenSink = Arc::new(move |delta: &str| {
            if let Some(inner) = weak.upgrade() {
                inner.on_token_delta(&track, delta);
            }
        });

        let ticket = self
            .inner
            .context
            .run_queue
            .enqueue_message_run(thread_id, text, sink);

        let weak = Arc::downgrade(&self.inner);
        let track = transcript.track;
        tokio::spawn(async move {
            let outcome = ticket.wait().await;
            if let Some(inner) = weak.upgrade() {
                if let Err(e) = &outcome {
                    warn!(session_id = %inner.shared.id, "Run ended with error: {}", e);
                }
                inner.flush_remaining(&track);
            }
        });
    }

    /// Apply a new language list to every track of this session
    pub async fn set_language_codes(&self, codes: &[String]) {
        let (codes, streams) = {
            let mut data = self.inner.data();
            let codes = normalize_language_codes(codes, self.inner.context.languages.default_code());
            data.language_codes = codes.clone();
            (codes, data.streams.values().cloned().collect::<Vec<_>>())
        };

        for stream in streams {
            stream.set_language_codes(&codes).await;
        }
    }

    /// Tear down the session's recognition streams.
    ///
    /// The shared synthesizer stays connected; in-flight runs finish but can no
    /// longer reach this session.
    pub async fn close(&self) {
        let streams = {
            let mut data = self.inner.data();
            if data.state == SessionState::Closed {
                return;
            }
            data.state = SessionState::Closed;
            data.buffers.clear();
            data.pending_finals.clear();
            self.inner.shared.alive.store(false, Ordering::SeqCst);
            data.streams.drain().map(|(_, stream)| stream).collect::<Vec<_>>()
        };

        for stream in streams {
            stream.close().await;
        }
        info!(session_id = %self.id(), "Call session closed");
    }

    pub fn state(&self) -> SessionState {
        self.inner.data().state
    }

    pub fn thread_id(&self) -> Option<String> {
        self.inner.data().thread_id.clone()
    }

    pub fn stream_for(&self, track: &str) -> Option<TranscriptionStream> {
        self.inner.data().streams.get(track).cloned()
    }

    pub fn track_count(&self) -> usize {
        self.inner.data().streams.len()
    }

    /// Audio chunks written to the media channel so far
    pub fn chunks_sent(&self) -> u64 {
        self.inner.shared.chunks_sent.load(Ordering::SeqCst)
    }

    pub fn info(&self) -> SessionInfo {
        let data = self.inner.data();
        let mut tracks: Vec<String> = data.streams.keys().cloned().collect();
        tracks.sort();
        SessionInfo {
            id: self.inner.shared.id,
            state: data.state,
            stream_sid: self.inner.shared.stream_sid(),
            thread_id: data.thread_id.clone(),
            tracks,
            chunks_sent: self.chunks_sent(),
            started_at: self.inner.started_at,
        }
    }
}

/// Speak a session's utterances one at a time, in the order they were cut
fn spawn_speech_worker(
    shared: Arc<SessionShared>,
    synthesizer: SpeechSynthesizer,
    mut speech: mpsc::UnboundedReceiver<Utterance>,
) {
    tokio::spawn(async move {
        while let Some(utterance) = speech.recv().await {
            if !shared.is_alive() {
                debug!(session_id = %shared.id, "Skipping synthesis for closed session");
                continue;
            }
            let listener = Arc::new(OutboundAudio {
                shared: shared.clone(),
                track: utterance.track,
            });
            synthesizer.text_to_speech(&utterance.text, listener, true).await;
        }
    });
}

fn spawn_transcript_worker(session: Weak<SessionInner>, mut transcripts: mpsc::UnboundedReceiver<Transcript>) {
    tokio::spawn(async move {
        while let Some(transcript) = transcripts.recv().await {
            let Some(inner) = session.upgrade() else {
                break;
            };
            let session = CallSession { inner };
            if let Err(e) = session.handle_transcript(transcript).await {
                warn!(session_id = %session.id(), "Failed to handle transcript: {}", e);
            }
        }
    });
}
