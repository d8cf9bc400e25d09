//! Shared kernel - Common types used across the relay

pub mod error;

pub use error::{DomainError, Result};
