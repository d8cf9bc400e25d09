//! Shared text-to-speech connection
//!
//! One synthesizer is shared by every call in the process. Requests are
//! serialized by a request lock: a request owns the connection from its
//! begin-of-stream frame until its final audio frame arrives (last chunk) or
//! until its frames are written (intermediate chunk), so frames of different
//! calls never interleave. Audio is routed only to the request that owns the
//! connection; an intermediate request of another listener is ended before the
//! next request starts. Audio frames are tagged with a sequence number that
//! starts at 1 on every new connection.

use crate::domain::backoff::{Backoff, ReconnectPolicy};
use crate::domain::shared::{DomainError, Result};
use crate::domain::synthesis::{
    SynthesisChunk, SynthesisListener, TtsConnection, TtsEvent, TtsFrame, TtsTransport,
    VoiceSettings,
};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use metrics::counter;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

/// Synthesizer settings
#[derive(Debug, Clone)]
pub struct SynthesizerSettings {
    pub api_key: String,
    pub voice: VoiceSettings,
    pub reconnect: ReconnectPolicy,
    /// How long a finished request may wait for its final audio frame
    pub final_frame_timeout: Duration,
}

impl Default for SynthesizerSettings {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            voice: VoiceSettings::default(),
            reconnect: ReconnectPolicy::default(),
            final_frame_timeout: Duration::from_secs(15),
        }
    }
}

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

struct ConnState {
    connection: Option<Box<dyn TtsConnection>>,
    state: ConnectionState,
    generation: u64,
    backoff: Backoff,
    reconnecting: bool,
    closed: bool,
}

/// Request currently owning the connection
struct ActiveRequest {
    id: u64,
    listener: Arc<dyn SynthesisListener>,
    finished: Option<oneshot::Sender<()>>,
    /// Text was written without an end-of-stream frame
    open: bool,
}

struct SynthInner {
    transport: Arc<dyn TtsTransport>,
    settings: SynthesizerSettings,
    conn: Mutex<ConnState>,
    request_lock: Mutex<()>,
    active: std::sync::Mutex<Option<ActiveRequest>>,
    connects: AtomicU64,
    next_request: AtomicU64,
}

/// Reconnecting, request-serializing text-to-speech client
#[derive(Clone)]
pub struct SpeechSynthesizer {
    inner: Arc<SynthInner>,
}

impl SpeechSynthesizer {
    pub fn new(transport: Arc<dyn TtsTransport>, settings: SynthesizerSettings) -> Self {
        let backoff = Backoff::new(settings.reconnect);
        Self {
            inner: Arc::new(SynthInner {
                transport,
                settings,
                conn: Mutex::new(ConnState {
                    connection: None,
                    state: ConnectionState::Disconnected,
                    generation: 0,
                    backoff,
                    reconnecting: false,
                    closed: false,
                }),
                request_lock: Mutex::new(()),
                active: std::sync::Mutex::new(None),
                connects: AtomicU64::new(0),
                next_request: AtomicU64::new(1),
            }),
        }
    }

    /// Open the connection. A no-op when already connected.
    pub async fn connect(&self) -> Result<()> {
        let mut conn = self.inner.conn.lock().await;
        if conn.state == ConnectionState::Connected && conn.connection.is_some() {
            return Ok(());
        }
        conn.closed = false;
        self.inner.open_connection(&mut conn).await
    }

    /// Synthesize `text`, delivering audio chunks and failures to `listener`.
    ///
    /// When `is_last` is set an end-of-stream frame follows the text and the
    /// call returns once the final audio frame has been delivered, or once
    /// `final_frame_timeout` passes without one.
    pub async fn text_to_speech(
        &self,
        text: &str,
        listener: Arc<dyn SynthesisListener>,
        is_last: bool,
    ) {
        let _request = self.inner.request_lock.lock().await;

        self.inner.end_foreign_request(&listener).await;

        if let Err(e) = self.connect().await {
            warn!("Synthesizer unavailable: {}", e);
            listener.on_error(e);
            return;
        }

        let id = self.inner.next_request.fetch_add(1, Ordering::SeqCst);
        let (finished_tx, finished_rx) = if is_last {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        self.inner.set_active(ActiveRequest {
            id,
            listener: listener.clone(),
            finished: finished_tx,
            open: !is_last,
        });

        let mut frames = vec![
            TtsFrame::BeginOfStream {
                voice: self.inner.settings.voice.clone(),
                api_key: self.inner.settings.api_key.clone(),
            },
            TtsFrame::Text(text.to_string()),
        ];
        if is_last {
            frames.push(TtsFrame::EndOfStream);
        }

        debug!(request = id, chars = text.len(), is_last, "Sending synthesis request");
        for frame in frames {
            if let Err(e) = self.inner.send_frame(frame).await {
                warn!(request = id, "Synthesis request failed: {}", e);
                self.inner.clear_active(id);
                listener.on_error(e);
                return;
            }
        }

        if let Some(finished) = finished_rx {
            self.inner.await_final(id, listener, finished).await;
        }
    }

    /// Tear down the connection and stop reconnecting
    pub async fn close(&self) {
        {
            let mut conn = self.inner.conn.lock().await;
            conn.closed = true;
            conn.generation += 1;
            conn.state = ConnectionState::Disconnected;
            if let Some(connection) = conn.connection.take() {
                connection.close().await;
            }
        }
        self.inner.complete_active();
        info!("Synthesizer connection closed");
    }

    pub async fn state(&self) -> ConnectionState {
        self.inner.conn.lock().await.state
    }

    pub async fn reconnect_attempts(&self) -> u32 {
        self.inner.conn.lock().await.backoff.attempts()
    }

    /// Number of connections opened so far
    pub fn connection_count(&self) -> u64 {
        self.inner.connects.load(Ordering::SeqCst)
    }
}

impl SynthInner {
    fn lock_active(&self) -> std::sync::MutexGuard<'_, Option<ActiveRequest>> {
        self.active.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_active(&self, request: ActiveRequest) {
        *self.lock_active() = Some(request);
    }

    fn active_listener(&self) -> Option<Arc<dyn SynthesisListener>> {
        self.lock_active().as_ref().map(|request| request.listener.clone())
    }

    /// Forget request `id` if it still owns the connection
    fn clear_active(&self, id: u64) {
        let mut active = self.lock_active();
        if active.as_ref().map(|request| request.id) == Some(id) {
            *active = None;
        }
    }

    /// The owning request is done; release whoever waits on it
    fn complete_active(&self) {
        let request = self.lock_active().take();
        if let Some(finished) = request.and_then(|r| r.finished) {
            let _ = finished.send(());
        }
    }

    /// End an intermediate request of another listener so its audio finishes
    /// before the next request takes the connection
    async fn end_foreign_request(&self, listener: &Arc<dyn SynthesisListener>) {
        let (id, owner, finished) = {
            let mut active = self.lock_active();
            match active.as_mut() {
                Some(request) if request.open && !Arc::ptr_eq(&request.listener, listener) => {
                    let (tx, rx) = oneshot::channel();
                    request.finished = Some(tx);
                    request.open = false;
                    (request.id, request.listener.clone(), rx)
                }
                _ => return,
            }
        };

        debug!(request = id, "Ending intermediate request before the next one");
        if let Err(e) = self.send_frame(TtsFrame::EndOfStream).await {
            warn!(request = id, "Could not end intermediate request: {}", e);
            self.clear_active(id);
            owner.on_error(e);
            return;
        }
        self.await_final(id, owner, finished).await;
    }

    /// Wait for the final frame of request `id`. On expiry the connection is
    /// dropped so late audio cannot reach the next request.
    async fn await_final(
        &self,
        id: u64,
        listener: Arc<dyn SynthesisListener>,
        finished: oneshot::Receiver<()>,
    ) {
        let limit = self.settings.final_frame_timeout;
        // Resolves on the final audio frame or when the connection drops
        if tokio::time::timeout(limit, finished).await.is_ok() {
            return;
        }

        warn!(request = id, "No final audio frame within {:?}, dropping connection", limit);
        counter!("voxrelay_synthesis_timeouts_total").increment(1);
        self.clear_active(id);
        self.abandon_connection().await;
        listener.on_error(DomainError::Stream(format!(
            "no final audio frame within {:?}",
            limit
        )));
    }

    /// Close the current connection without reconnecting; the next request
    /// opens a fresh one
    async fn abandon_connection(&self) {
        let mut conn = self.conn.lock().await;
        conn.generation += 1;
        conn.state = ConnectionState::Disconnected;
        if let Some(connection) = conn.connection.take() {
            connection.close().await;
        }
    }

    async fn is_current(&self, generation: u64) -> bool {
        let conn = self.conn.lock().await;
        !conn.closed && conn.generation == generation
    }

    async fn open_connection(self: &Arc<Self>, conn: &mut ConnState) -> Result<()> {
        conn.state = ConnectionState::Connecting;
        if let Some(previous) = conn.connection.take() {
            previous.close().await;
        }

        let stream = match self.transport.open().await {
            Ok(stream) => stream,
            Err(e) => {
                conn.state = ConnectionState::Disconnected;
                return Err(e);
            }
        };

        conn.generation += 1;
        conn.connection = Some(stream.connection);
        conn.state = ConnectionState::Connected;
        conn.backoff.reset();
        self.connects.fetch_add(1, Ordering::SeqCst);
        info!(generation = conn.generation, "Synthesizer connected");

        self.spawn_reader(conn.generation, stream.events);
        Ok(())
    }

    async fn send_frame(&self, frame: TtsFrame) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let result = match conn.connection.as_ref() {
            Some(connection) => connection.send(frame).await,
            None => Err(DomainError::Connection("synthesizer is not connected".to_string())),
        };
        if result.is_err() {
            conn.state = ConnectionState::Disconnected;
        }
        result
    }

    fn spawn_reader(self: &Arc<Self>, generation: u64, events: mpsc::UnboundedReceiver<TtsEvent>) {
        let inner = self.clone();
        tokio::spawn(async move {
            inner.read_events(generation, events).await;
        });
    }

    async fn read_events(self: Arc<Self>, generation: u64, mut events: mpsc::UnboundedReceiver<TtsEvent>) {
        // Sequence numbers are scoped to this connection
        let mut sequence: u64 = 0;

        while let Some(event) = events.recv().await {
            match event {
                TtsEvent::Audio { payload, is_final } => {
                    if !self.is_current(generation).await {
                        debug!(generation, "Ignoring audio from a replaced connection");
                        return;
                    }
                    if let Some(payload) = payload.filter(|p| !p.is_empty()) {
                        match STANDARD.decode(payload.as_bytes()) {
                            Ok(audio) => {
                                sequence += 1;
                                counter!("voxrelay_synthesis_chunks_total").increment(1);
                                let chunk = SynthesisChunk {
                                    sequence,
                                    audio: Bytes::from(audio),
                                };
                                match self.active_listener() {
                                    Some(listener) => listener.on_audio_chunk(chunk),
                                    None => debug!(sequence, "Audio chunk with no active request"),
                                }
                            }
                            Err(e) => warn!("Undecodable audio frame: {}", e),
                        }
                    }
                    if is_final {
                        self.complete_active();
                    }
                }
                TtsEvent::Error(message) => {
                    warn!(generation, "Synthesizer error: {}", message);
                    break;
                }
                TtsEvent::Closed => break,
            }
        }

        self.handle_drop(generation).await;
    }

    async fn handle_drop(self: &Arc<Self>, generation: u64) {
        {
            let mut conn = self.conn.lock().await;
            if conn.closed || conn.generation != generation {
                return;
            }
            warn!(generation, "Synthesizer connection dropped");
            conn.connection = None;
            conn.state = ConnectionState::Disconnected;
            if conn.reconnecting {
                return;
            }
            conn.reconnecting = true;
        }

        // Requests still expecting audio lose it with the connection
        let interrupted = {
            let active = self.lock_active();
            active
                .as_ref()
                .filter(|request| request.finished.is_some() || request.open)
                .map(|request| request.listener.clone())
        };
        if let Some(listener) = interrupted {
            listener.on_error(DomainError::Connection(
                "synthesizer connection dropped".to_string(),
            ));
        }
        self.complete_active();

        self.reconnect().await;
    }

    /// Reconnect with backoff; stays disconnected once attempts run out
    async fn reconnect(self: &Arc<Self>) {
        loop {
            let (attempt, delay) = {
                let mut conn = self.conn.lock().await;
                if conn.closed || conn.state == ConnectionState::Connected {
                    conn.reconnecting = false;
                    return;
                }
                match conn.backoff.next_delay() {
                    Some(delay) => (conn.backoff.attempts(), delay),
                    None => {
                        conn.reconnecting = false;
                        conn.state = ConnectionState::Disconnected;
                        warn!(
                            "Giving up on synthesizer after {} attempts",
                            conn.backoff.attempts()
                        );
                        return;
                    }
                }
            };

            counter!("voxrelay_stream_reconnects_total", "adapter" => "tts").increment(1);
            info!(attempt, "Reconnecting synthesizer in {:?}", delay);
            tokio::time::sleep(delay).await;

            let mut conn = self.conn.lock().await;
            if conn.closed || conn.state == ConnectionState::Connected {
                conn.reconnecting = false;
                return;
            }
            match self.open_connection(&mut conn).await {
                Ok(()) => {
                    conn.reconnecting = false;
                    return;
                }
                Err(e) => warn!(attempt, "Synthesizer reconnect failed: {}", e),
            }
        }
    }
}
