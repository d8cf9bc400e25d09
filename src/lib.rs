//! VoxRelay - A conversational voice relay built with Rust
//!
//! Bridges a telephony media stream to streaming speech recognition, a
//! language-model assistant and streaming speech synthesis, so a caller can
//! hold a spoken conversation with the assistant.

pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod interface;

// Re-export commonly used types
pub use domain::shared::error::DomainError;
pub use domain::shared::Result;
