//! Language-model run queue
//!
//! The completion account accepts one streamed run at a time, so every run in
//! the process, whichever call enqueued it, passes through this FIFO gate of
//! concurrency 1. Entries execute strictly in enqueue order; a failing run is
//! logged and the queue moves on.

use crate::domain::completion::{CompletionBackend, TokenSink};
use crate::domain::shared::{DomainError, Result};
use metrics::{counter, gauge};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;
use tracing::{debug, error, info};
use uuid::Uuid;

/// One queued run
pub struct RunEntry {
    pub id: Uuid,
    pub thread_id: String,
    /// User message appended right before the run starts
    pub message: Option<String>,
    pub on_token_delta: TokenSink,
    completion: oneshot::Sender<Result<()>>,
}

/// Handle for the outcome of an enqueued run.
///
/// Dropping the ticket is fine; the run still executes.
pub struct RunTicket {
    pub id: Uuid,
    receiver: oneshot::Receiver<Result<()>>,
}

impl RunTicket {
    /// Wait for the run to complete or fail
    pub async fn wait(self) -> Result<()> {
        self.receiver
            .await
            .unwrap_or_else(|_| Err(DomainError::Internal("run was dropped".to_string())))
    }
}

/// Queue statistics for monitoring
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunQueueStats {
    pub pending: usize,
    pub in_progress: bool,
    pub completed: u64,
    pub failed: u64,
}

struct QueueState {
    entries: VecDeque<RunEntry>,
    in_progress: bool,
    completed: u64,
    failed: u64,
}

struct QueueInner {
    backend: Arc<dyn CompletionBackend>,
    state: Mutex<QueueState>,
}

/// Process-wide FIFO admission gate around streamed runs
#[derive(Clone)]
pub struct RunQueue {
    inner: Arc<QueueInner>,
}

impl RunQueue {
    pub fn new(backend: Arc<dyn CompletionBackend>) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                backend,
                state: Mutex::new(QueueState {
                    entries: VecDeque::new(),
                    in_progress: false,
                    completed: 0,
                    failed: 0,
                }),
            }),
        }
    }

    pub fn backend(&self) -> Arc<dyn CompletionBackend> {
        self.inner.backend.clone()
    }

    /// Queue a run on `thread_id`. Returns immediately.
    ///
    /// Must be called from within a tokio runtime.
    pub fn enqueue_run(&self, thread_id: impl Into<String>, on_token_delta: TokenSink) -> RunTicket {
        self.enqueue(thread_id.into(), None, on_token_delta)
    }

    /// Queue a run that first appends `message` to the thread
    pub fn enqueue_message_run(
        &self,
        thread_id: impl Into<String>,
        message: impl Into<String>,
        on_token_delta: TokenSink,
    ) -> RunTicket {
        self.enqueue(thread_id.into(), Some(message.into()), on_token_delta)
    }

    fn enqueue(&self, thread_id: String, message: Option<String>, on_token_delta: TokenSink) -> RunTicket {
        let (tx, rx) = oneshot::channel();
        let id = Uuid::new_v4();

        {
            let mut state = self.inner.lock();
            state.entries.push_back(RunEntry {
                id,
                thread_id: thread_id.clone(),
                message,
                on_token_delta,
                completion: tx,
            });
            gauge!("voxrelay_runs_pending").set(state.entries.len() as f64);
            debug!(run_id = %id, thread_id = %thread_id, pending = state.entries.len(), "Run enqueued");
        }

        self.process_queue();

        RunTicket { id, receiver: rx }
    }

    /// Start draining the queue unless a run is already in progress
    pub fn process_queue(&self) {
        let first = {
            let mut state = self.inner.lock();
            if state.in_progress {
                return;
            }
            match state.entries.pop_front() {
                Some(entry) => {
                    state.in_progress = true;
                    entry
                }
                None => return,
            }
        };

        let inner = self.inner.clone();
        tokio::spawn(async move {
            inner.drain(first).await;
        });
    }

    pub fn stats(&self) -> RunQueueStats {
        let state = self.inner.lock();
        RunQueueStats {
            pending: state.entries.len(),
            in_progress: state.in_progress,
            completed: state.completed,
            failed: state.failed,
        }
    }
}

impl QueueInner {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Execute entries one after another until the queue is empty
    async fn drain(self: Arc<Self>, first: RunEntry) {
        let mut next = Some(first);

        while let Some(entry) = next {
            let RunEntry {
                id,
                thread_id,
                message,
                on_token_delta,
                completion,
            } = entry;

            info!(run_id = %id, thread_id = %thread_id, "Run started");
            let outcome = self.execute_run(thread_id.clone(), message, on_token_delta).await;

            match &outcome {
                Ok(()) => {
                    info!(run_id = %id, thread_id = %thread_id, "Run completed");
                    counter!("voxrelay_runs_total", "outcome" => "completed").increment(1);
                }
                Err(e) => {
                    error!(run_id = %id, thread_id = %thread_id, "Run failed: {}", e);
                    counter!("voxrelay_runs_total", "outcome" => "failed").increment(1);
                }
            }

            next = {
                let mut state = self.lock();
                if outcome.is_ok() {
                    state.completed += 1;
                } else {
                    state.failed += 1;
                }
                let next = state.entries.pop_front();
                if next.is_none() {
                    state.in_progress = false;
                }
                gauge!("voxrelay_runs_pending").set(state.entries.len() as f64);
                next
            };

            // Nobody waiting on the ticket is fine
            let _ = completion.send(outcome);
        }
    }

    /// Append the pending message (if any) and stream one run to completion
    async fn execute_run(
        &self,
        thread_id: String,
        message: Option<String>,
        on_token_delta: TokenSink,
    ) -> Result<()> {
        let backend = self.backend.clone();

        // Run on its own task so a panicking backend cannot wedge the gate
        let handle = tokio::spawn(async move {
            if let Some(message) = message {
                backend.append_message(&thread_id, &message).await?;
            }
            backend.stream_run(&thread_id, on_token_delta).await
        });

        match handle.await {
            Ok(result) => result,
            Err(e) => Err(DomainError::Internal(format!("run task aborted: {}", e))),
        }
    }
}
