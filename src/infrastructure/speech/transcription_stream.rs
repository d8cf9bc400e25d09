//! Per-track speech-to-text stream adapter
//!
//! Wraps one recognition stream for a single audio track. The stream is
//! created lazily on the first chunk and rotated when it becomes invalid,
//! when it outlives the vendor's maximum stream lifetime, or when the
//! language configuration changes. Stream errors and failed opens trigger a
//! bounded backoff reconnect loop; once that is exhausted the adapter stays
//! invalid and drops audio until it is reconfigured.

use crate::domain::backoff::{Backoff, ReconnectPolicy};
use crate::domain::language::normalize_language_codes;
use crate::domain::shared::{DomainError, Result};
use crate::domain::transcription::{
    AsrConnection, AsrEvent, AsrFrame, AsrTransport, RecognitionConfig, Transcript,
    TranscriptListener,
};
use bytes::Bytes;
use metrics::counter;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

/// Recognition stream settings
#[derive(Debug, Clone)]
pub struct TranscriptionSettings {
    pub encoding: String,
    pub sample_rate_hertz: u32,
    pub audio_channel_count: u16,
    pub model: String,
    pub interim_results: bool,
    pub default_language: String,
    /// Streams are rotated before the vendor closes them
    pub max_stream_lifetime: Duration,
    /// Close and reopen the stream after every final result
    pub rotate_after_final: bool,
    pub reconnect: ReconnectPolicy,
}

impl Default for TranscriptionSettings {
    fn default() -> Self {
        Self {
            encoding: "MULAW".to_string(),
            sample_rate_hertz: 8000,
            audio_channel_count: 1,
            model: "phone_call".to_string(),
            interim_results: true,
            default_language: "en-US".to_string(),
            max_stream_lifetime: Duration::from_secs(290),
            rotate_after_final: true,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// What happened to a chunk handed to [`TranscriptionStream::send`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    Dropped,
}

struct StreamState {
    connection: Option<Box<dyn AsrConnection>>,
    created_at: Option<Instant>,
    valid: bool,
    new_stream_required: bool,
    language_codes: Vec<String>,
    backoff: Backoff,
    /// Bumped on every stream creation; readers of older streams go quiet
    generation: u64,
    reconnecting: bool,
    exhausted: bool,
    closed: bool,
}

impl StreamState {
    fn requires_new_stream(&self, max_lifetime: Duration) -> bool {
        if self.connection.is_none() || !self.valid || self.new_stream_required {
            return true;
        }
        match self.created_at {
            Some(created_at) => created_at.elapsed() >= max_lifetime,
            None => true,
        }
    }
}

struct StreamInner {
    track: String,
    transport: Arc<dyn AsrTransport>,
    settings: TranscriptionSettings,
    listener: TranscriptListener,
    state: Mutex<StreamState>,
    streams_opened: AtomicU64,
}

/// Reconnecting recognition stream for one track
#[derive(Clone)]
pub struct TranscriptionStream {
    inner: Arc<StreamInner>,
}

impl TranscriptionStream {
    /// Create the adapter. No stream is opened until the first chunk arrives.
    pub fn new(
        track: impl Into<String>,
        transport: Arc<dyn AsrTransport>,
        settings: TranscriptionSettings,
        language_codes: &[String],
        listener: TranscriptListener,
    ) -> Self {
        let language_codes = normalize_language_codes(language_codes, &settings.default_language);
        let backoff = Backoff::new(settings.reconnect);

        Self {
            inner: Arc::new(StreamInner {
                track: track.into(),
                transport,
                settings,
                listener,
                state: Mutex::new(StreamState {
                    connection: None,
                    created_at: None,
                    valid: false,
                    new_stream_required: false,
                    language_codes,
                    backoff,
                    generation: 0,
                    reconnecting: false,
                    exhausted: false,
                    closed: false,
                }),
                streams_opened: AtomicU64::new(0),
            }),
        }
    }

    pub fn track(&self) -> &str {
        &self.inner.track
    }

    /// Write one audio chunk, opening or rotating the stream first if needed.
    ///
    /// Chunks that cannot be delivered are dropped, never buffered.
    pub async fn send(&self, chunk: Bytes) -> SendOutcome {
        let inner = &self.inner;
        let mut state = inner.state.lock().await;

        if state.closed {
            debug!(track = %inner.track, "Dropping audio for closed stream");
            return SendOutcome::Dropped;
        }

        if state.requires_new_stream(inner.settings.max_stream_lifetime) {
            if state.exhausted || state.reconnecting {
                warn!(
                    track = %inner.track,
                    "Recognition stream unavailable, dropping {} bytes of audio",
                    chunk.len()
                );
                return SendOutcome::Dropped;
            }

            if let Err(e) = inner.create_stream(&mut state).await {
                warn!(track = %inner.track, "Could not open recognition stream, dropping audio: {}", e);
                inner.schedule_reconnect(&mut state);
                return SendOutcome::Dropped;
            }
        }

        let write = match state.connection.as_ref() {
            Some(connection) => connection.write(AsrFrame::Audio(chunk)).await,
            None => Err(DomainError::Stream("no recognition stream".to_string())),
        };

        match write {
            Ok(()) => SendOutcome::Sent,
            Err(e) => {
                warn!(track = %inner.track, "Audio write failed, dropping chunk: {}", e);
                state.valid = false;
                SendOutcome::Dropped
            }
        }
    }

    /// Replace the language list; takes effect on the next stream.
    ///
    /// An empty list falls back to the default language.
    pub async fn set_language_codes(&self, codes: &[String]) {
        let inner = &self.inner;
        let codes = normalize_language_codes(codes, &inner.settings.default_language);

        let mut state = inner.state.lock().await;
        info!(track = %inner.track, "Language codes set to {:?}", codes);
        state.language_codes = codes;
        state.new_stream_required = true;
        state.exhausted = false;
        state.backoff.reset();
    }

    pub async fn language_codes(&self) -> Vec<String> {
        self.inner.state.lock().await.language_codes.clone()
    }

    /// Close the current stream and open a new one before returning
    pub async fn force_new_stream(&self) -> Result<()> {
        let inner = &self.inner;
        let mut state = inner.state.lock().await;

        if state.closed {
            return Err(DomainError::InvalidOperation(
                "recognition stream is closed".to_string(),
            ));
        }

        info!(track = %inner.track, "Forcing new recognition stream");
        state.exhausted = false;
        state.backoff.reset();
        inner.create_stream(&mut state).await
    }

    /// Tear down the stream; no further reconnects happen
    pub async fn close(&self) {
        let inner = &self.inner;
        let mut state = inner.state.lock().await;
        if state.closed {
            return;
        }

        state.closed = true;
        state.valid = false;
        state.generation += 1;
        if let Some(connection) = state.connection.take() {
            connection.close().await;
        }
        info!(track = %inner.track, "Recognition stream closed");
    }

    pub async fn is_valid(&self) -> bool {
        let state = self.inner.state.lock().await;
        state.valid && state.connection.is_some()
    }

    /// Whether the next chunk would open a new stream
    pub async fn new_stream_required(&self) -> bool {
        let state = self.inner.state.lock().await;
        state.requires_new_stream(self.inner.settings.max_stream_lifetime)
    }

    /// Whether the reconnect policy gave up
    pub async fn is_exhausted(&self) -> bool {
        self.inner.state.lock().await.exhausted
    }

    pub async fn reconnect_attempts(&self) -> u32 {
        self.inner.state.lock().await.backoff.attempts()
    }

    /// Number of streams successfully opened over the adapter's life
    pub fn streams_opened(&self) -> u64 {
        self.inner.streams_opened.load(Ordering::SeqCst)
    }
}

impl StreamInner {
    fn recognition_config(&self, language_codes: &[String]) -> RecognitionConfig {
        RecognitionConfig {
            encoding: self.settings.encoding.clone(),
            sample_rate_hertz: self.settings.sample_rate_hertz,
            audio_channel_count: self.settings.audio_channel_count,
            language_codes: language_codes.to_vec(),
            model: self.settings.model.clone(),
            interim_results: self.settings.interim_results,
        }
    }

    /// Close any previous stream, open a new one and write its configuration.
    ///
    /// Called with the state lock held, so concurrent callers wait for the
    /// stream being created instead of opening their own.
    async fn create_stream(self: &Arc<Self>, state: &mut StreamState) -> Result<()> {
        if let Some(previous) = state.connection.take() {
            previous.close().await;
        }
        state.valid = false;
        state.generation += 1;
        let generation = state.generation;

        let stream = self.transport.open(&self.track).await?;
        let config = self.recognition_config(&state.language_codes);

        if let Err(e) = stream.connection.write(AsrFrame::Config(config)).await {
            stream.connection.close().await;
            return Err(e);
        }

        state.connection = Some(stream.connection);
        state.created_at = Some(Instant::now());
        state.valid = true;
        state.new_stream_required = false;
        state.exhausted = false;
        state.backoff.reset();
        self.streams_opened.fetch_add(1, Ordering::SeqCst);

        info!(
            track = %self.track,
            generation,
            "Recognition stream opened with languages {:?}",
            state.language_codes
        );

        self.spawn_reader(generation, stream.events);
        Ok(())
    }

    fn spawn_reader(self: &Arc<Self>, generation: u64, events: mpsc::UnboundedReceiver<AsrEvent>) {
        let inner = self.clone();
        tokio::spawn(async move {
            inner.read_events(generation, events).await;
        });
    }

    async fn is_current(&self, generation: u64) -> bool {
        let state = self.state.lock().await;
        !state.closed && state.generation == generation
    }

    async fn read_events(self: Arc<Self>, generation: u64, mut events: mpsc::UnboundedReceiver<AsrEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                AsrEvent::Data(results) => {
                    if !self.is_current(generation).await {
                        return;
                    }

                    let mut saw_final = false;
                    for result in &results {
                        let Some(text) = result.top_transcript() else {
                            continue;
                        };
                        saw_final |= result.is_final;
                        counter!("voxrelay_transcripts_total", "final" => result.is_final.to_string())
                            .increment(1);

                        let transcript = Transcript {
                            track: self.track.clone(),
                            text: text.to_string(),
                            is_final: result.is_final,
                        };
                        if self.listener.send(transcript).is_err() {
                            debug!(track = %self.track, "Transcript listener is gone");
                        }
                    }

                    if saw_final && self.settings.rotate_after_final {
                        // Vendor streams stop producing results after a final
                        self.rotate_after_final(generation).await;
                        return;
                    }
                }
                AsrEvent::Error(message) => {
                    warn!(track = %self.track, generation, "Recognition stream error: {}", message);
                    self.handle_stream_error(generation).await;
                    return;
                }
                AsrEvent::Closed => break,
            }
        }

        let mut state = self.state.lock().await;
        if !state.closed && state.generation == generation {
            debug!(track = %self.track, generation, "Recognition stream ended");
            state.valid = false;
        }
    }

    async fn rotate_after_final(self: &Arc<Self>, generation: u64) {
        let mut state = self.state.lock().await;
        if state.closed || state.generation != generation {
            return;
        }

        debug!(track = %self.track, generation, "Rotating recognition stream after final result");
        if let Err(e) = self.create_stream(&mut state).await {
            warn!(track = %self.track, "Stream rotation failed: {}", e);
            self.schedule_reconnect(&mut state);
        }
    }

    /// Hand retries to the backoff loop. Sends drop audio until it settles.
    fn schedule_reconnect(self: &Arc<Self>, state: &mut StreamState) {
        state.valid = false;
        if state.closed || state.reconnecting {
            return;
        }
        state.reconnecting = true;

        let inner = self.clone();
        tokio::spawn(async move {
            inner.reconnect().await;
        });
    }

    async fn handle_stream_error(self: &Arc<Self>, generation: u64) {
        {
            let mut state = self.state.lock().await;
            if state.closed || state.generation != generation {
                return;
            }
            state.valid = false;
            if state.reconnecting {
                return;
            }
            state.reconnecting = true;
        }

        self.reconnect().await;
    }

    /// Retry stream creation with backoff until it succeeds or attempts run out
    async fn reconnect(self: &Arc<Self>) {
        loop {
            let (attempt, delay) = {
                let mut state = self.state.lock().await;
                if state.closed || state.valid {
                    state.reconnecting = false;
                    return;
                }
                match state.backoff.next_delay() {
                    Some(delay) => (state.backoff.attempts(), delay),
                    None => {
                        state.reconnecting = false;
                        state.exhausted = true;
                        warn!(
                            track = %self.track,
                            "Giving up on recognition stream after {} attempts",
                            state.backoff.attempts()
                        );
                        return;
                    }
                }
            };

            counter!("voxrelay_stream_reconnects_total", "adapter" => "asr").increment(1);
            info!(track = %self.track, attempt, "Reconnecting recognition stream in {:?}", delay);
            tokio::time::sleep(delay).await;

            let mut state = self.state.lock().await;
            if state.closed || state.valid {
                state.reconnecting = false;
                return;
            }
            match self.create_stream(&mut state).await {
                Ok(()) => {
                    state.reconnecting = false;
                    info!(track = %self.track, attempt, "Recognition stream reconnected");
                    return;
                }
                Err(e) => {
                    warn!(track = %self.track, attempt, "Reconnect attempt failed: {}", e);
                }
            }
        }
    }
}
