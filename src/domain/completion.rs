//! Conversational completion port

use crate::domain::shared::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// Invoked with every incremental text delta of a run, in generation order
pub type TokenSink = Arc<dyn Fn(&str) + Send + Sync>;

/// Thread-scoped access to the language-model service.
///
/// The backing account allows one streamed run at a time; callers go
/// through [`crate::application::RunQueue`] rather than calling
/// [`CompletionBackend::stream_run`] directly.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    /// Create a conversation thread, optionally seeded with an assistant message
    async fn create_thread(&self, greeting: Option<String>) -> Result<String>;

    /// Append a user message to a thread
    async fn append_message(&self, thread_id: &str, text: &str) -> Result<()>;

    /// Start a run against the configured assistant and stream its deltas.
    ///
    /// Resolves when the run completes, fails when the run or stream fails.
    async fn stream_run(&self, thread_id: &str, on_delta: TokenSink) -> Result<()>;
}
