//! Infrastructure layer - Technical implementations
//!
//! This layer contains:
//! - Reconnecting adapters for the streaming speech services
//! - WebSocket and HTTP transports for the external services

pub mod providers;
pub mod speech;
