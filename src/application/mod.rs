//! Application layer - Use cases and application services
//!
//! This layer orchestrates domain objects to fulfill use cases:
//! - Serializing language-model runs across all calls
//! - Driving one call from inbound audio to spoken replies
//! - Tracking the live sessions

pub mod call_session;
pub mod run_queue;
pub mod session_registry;

pub use call_session::{CallSession, SessionContext, SessionInfo, SessionSettings, SessionState};
pub use run_queue::{RunQueue, RunQueueStats, RunTicket};
pub use session_registry::SessionRegistry;
