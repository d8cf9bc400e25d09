//! Domain layer - Core relay model and ports
//!
//! This layer contains:
//! - Value types for transcripts, synthesis chunks and the media envelope
//! - Ports (traits) for the speech-to-text, text-to-speech and
//!   language-model collaborators
//! - The shared reconnect backoff
//! - Domain errors

pub mod backoff;
pub mod completion;
pub mod language;
pub mod media;
pub mod shared;
pub mod synthesis;
pub mod transcription;

// Re-export commonly used types
pub use backoff::{Backoff, ReconnectPolicy};
pub use completion::{CompletionBackend, TokenSink};
pub use language::LanguageRegistry;
pub use shared::{DomainError, Result};
