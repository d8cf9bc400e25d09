//! API interface implementations

pub mod dto;
pub mod handlers;
pub mod media_stream;
pub mod metrics_handler;
pub mod router;

pub use handlers::AppState;
pub use metrics_handler::init_metrics;
pub use router::build_router;
