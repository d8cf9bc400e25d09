//! Interface layer - External interfaces
//!
//! This layer handles:
//! - The media-channel WebSocket
//! - REST endpoints for health, sessions and languages
//! - Prometheus metrics

pub mod api;
