//! Assistants-style language-model client
//!
//! Threads hold the conversation; a run executes the configured assistant
//! against a thread and streams its output as server-sent events.

use crate::domain::completion::{CompletionBackend, TokenSink};
use crate::domain::shared::{DomainError, Result};
use async_trait::async_trait;
use eventsource_stream::{Event, EventStreamError, Eventsource};
use futures::{Stream, StreamExt};
use std::fmt::Display;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

/// Outcome of one streamed event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunProgress {
    Delta(String),
    Completed,
    Failed(String),
    Ignored,
}

#[derive(Debug, Deserialize)]
struct MessageDelta {
    delta: DeltaBody,
}

#[derive(Debug, Deserialize)]
struct DeltaBody {
    #[serde(default)]
    content: Vec<DeltaContent>,
}

#[derive(Debug, Deserialize)]
struct DeltaContent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<DeltaText>,
}

#[derive(Debug, Deserialize)]
struct DeltaText {
    #[serde(default)]
    value: String,
}

#[derive(Debug, Deserialize)]
struct ThreadCreated {
    id: String,
}

fn error_message(data: &str) -> String {
    let Ok(value) = serde_json::from_str::<Value>(data) else {
        return data.to_string();
    };
    value
        .pointer("/last_error/message")
        .or_else(|| value.pointer("/error/message"))
        .or_else(|| value.get("message"))
        .and_then(Value::as_str)
        .unwrap_or(data)
        .to_string()
}

/// Interpret one server-sent event of a streamed run
pub fn interpret_event(event: &str, data: &str) -> RunProgress {
    match event {
        "thread.message.delta" => match serde_json::from_str::<MessageDelta>(data) {
            Ok(delta) => {
                let text: String = delta
                    .delta
                    .content
                    .into_iter()
                    .filter(|c| c.kind == "text")
                    .filter_map(|c| c.text.map(|t| t.value))
                    .collect();
                if text.is_empty() {
                    RunProgress::Ignored
                } else {
                    RunProgress::Delta(text)
                }
            }
            Err(e) => {
                warn!("Malformed message delta: {}", e);
                RunProgress::Ignored
            }
        },
        "thread.run.completed" | "done" => RunProgress::Completed,
        "thread.run.failed" | "thread.run.cancelled" | "thread.run.expired" | "error" => {
            RunProgress::Failed(error_message(data))
        }
        _ => RunProgress::Ignored,
    }
}

/// Feed run events to `on_delta` until the run completes or fails
pub async fn drive_run<S, E>(events: S, on_delta: &TokenSink) -> Result<()>
where
    S: Stream<Item = std::result::Result<Event, EventStreamError<E>>>,
    E: Display,
{
    let mut events = std::pin::pin!(events);
    while let Some(event) = events.next().await {
        let event = event.map_err(|e| DomainError::Completion(format!("run stream failed: {}", e)))?;
        match interpret_event(&event.event, &event.data) {
            RunProgress::Delta(text) => on_delta(&text),
            RunProgress::Completed => return Ok(()),
            RunProgress::Failed(message) => return Err(DomainError::Completion(message)),
            RunProgress::Ignored => {}
        }
    }

    Err(DomainError::Completion(
        "run stream ended before completion".to_string(),
    ))
}

/// HTTP client for the assistants API
pub struct AssistantsClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    assistant_id: String,
}

impl AssistantsClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        assistant_id: impl Into<String>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            assistant_id: assistant_id.into(),
        }
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.http
            .post(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.api_key)
            .header("OpenAI-Beta", "assistants=v2")
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(DomainError::Completion(format!(
            "request failed with {}: {}",
            status,
            error_message(&body)
        )))
    }
}

#[async_trait]
impl CompletionBackend for AssistantsClient {
    async fn create_thread(&self, greeting: Option<String>) -> Result<String> {
        let body = match greeting {
            Some(greeting) => json!({
                "messages": [{ "role": "assistant", "content": greeting }]
            }),
            None => json!({}),
        };

        let response = Self::check(self.post("/threads").json(&body).send().await?).await?;
        let thread: ThreadCreated = response.json().await?;
        info!(thread_id = %thread.id, "Thread created");
        Ok(thread.id)
    }

    async fn append_message(&self, thread_id: &str, text: &str) -> Result<()> {
        let body = json!({ "role": "user", "content": text });
        Self::check(
            self.post(&format!("/threads/{}/messages", thread_id))
                .json(&body)
                .send()
                .await?,
        )
        .await?;
        debug!(thread_id = %thread_id, "Message appended");
        Ok(())
    }

    async fn stream_run(&self, thread_id: &str, on_delta: TokenSink) -> Result<()> {
        let body = json!({ "assistant_id": self.assistant_id, "stream": true });
        let response = Self::check(
            self.post(&format!("/threads/{}/runs", thread_id))
                .json(&body)
                .send()
                .await?,
        )
        .await?;

        drive_run(response.bytes_stream().eventsource(), &on_delta).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::convert::Infallible;
    use std::sync::{Arc, Mutex};

    const DELTA: &str = r#"{"id":"msg_1","object":"thread.message.delta","delta":{"content":[{"index":0,"type":"text","text":{"value":"Sure, "}}]}}"#;

    fn collecting_sink(out: Arc<Mutex<String>>) -> TokenSink {
        Arc::new(move |delta: &str| out.lock().unwrap().push_str(delta))
    }

    fn body(chunks: Vec<String>) -> impl Stream<Item = std::result::Result<Bytes, Infallible>> {
        futures::stream::iter(chunks.into_iter().map(|c| Ok(Bytes::from(c))))
    }

    #[test]
    fn test_message_delta() {
        assert_eq!(
            interpret_event("thread.message.delta", DELTA),
            RunProgress::Delta("Sure, ".to_string())
        );
    }

    #[test]
    fn test_delta_without_text_is_ignored() {
        let progress = interpret_event(
            "thread.message.delta",
            r#"{"delta":{"content":[{"index":0,"type":"image_file"}]}}"#,
        );
        assert_eq!(progress, RunProgress::Ignored);
    }

    #[test]
    fn test_terminal_events() {
        assert_eq!(interpret_event("thread.run.completed", "{}"), RunProgress::Completed);
        assert_eq!(interpret_event("done", "[DONE]"), RunProgress::Completed);
        assert_eq!(
            interpret_event(
                "thread.run.failed",
                r#"{"last_error":{"code":"rate_limit_exceeded","message":"Rate limit reached"}}"#
            ),
            RunProgress::Failed("Rate limit reached".to_string())
        );
        assert_eq!(
            interpret_event("error", "upstream exploded"),
            RunProgress::Failed("upstream exploded".to_string())
        );
    }

    #[test]
    fn test_other_events_are_ignored() {
        assert_eq!(interpret_event("thread.run.step.created", "{}"), RunProgress::Ignored);
        assert_eq!(interpret_event("message", "{}"), RunProgress::Ignored);
    }

    #[tokio::test]
    async fn test_run_events_split_across_chunks() {
        let delta_event = format!("event: thread.message.delta\ndata: {}\n\n", DELTA);
        let (head, tail) = delta_event.split_at(30);
        let chunks = vec![
            head.to_string(),
            tail.to_string(),
            "event: thread.run.step.created\r\ndata: {}\r\n\r\n".to_string(),
            "event: thread.message.delta\ndata: ".to_string(),
            DELTA.replace("Sure, ", "I can help.") + "\n\n",
            "event: thread.run.completed\ndata: {}\n\n".to_string(),
        ];

        let out = Arc::new(Mutex::new(String::new()));
        let result = drive_run(body(chunks).eventsource(), &collecting_sink(out.clone())).await;

        assert!(result.is_ok());
        assert_eq!(*out.lock().unwrap(), "Sure, I can help.");
    }

    #[tokio::test]
    async fn test_run_failure_and_truncation() {
        let out = Arc::new(Mutex::new(String::new()));
        let failed = body(vec![
            "event: thread.run.failed\ndata: {\"last_error\":{\"message\":\"boom\"}}\n\n".to_string(),
        ]);
        let result = drive_run(failed.eventsource(), &collecting_sink(out.clone())).await;
        assert!(matches!(result, Err(DomainError::Completion(m)) if m == "boom"));

        let truncated = body(vec![format!("event: thread.message.delta\ndata: {}\n\n", DELTA)]);
        let result = drive_run(truncated.eventsource(), &collecting_sink(out.clone())).await;
        assert!(matches!(result, Err(DomainError::Completion(_))));
        assert_eq!(*out.lock().unwrap(), "Sure, ");
    }

    #[test]
    fn test_base_url_is_trimmed() {
        let client = AssistantsClient::new("https://api.example.com/v1/", "key", "asst_1");
        assert_eq!(client.base_url, "https://api.example.com/v1");
    }
}
