//! Request and response bodies

use crate::application::{RunQueueStats, SessionInfo};
use crate::infrastructure::speech::ConnectionState;
use serde::{Deserialize, Serialize};

/// Standard API response wrapper
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub active_sessions: usize,
    pub synthesizer: ConnectionState,
    pub run_queue: RunQueueStats,
}

/// Body of `PUT /languages`
#[derive(Debug, Deserialize)]
pub struct UpdateLanguagesRequest {
    pub codes: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LanguagesResponse {
    pub default_code: String,
    pub codes: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct SessionsResponse {
    pub count: usize,
    pub sessions: Vec<SessionInfo>,
}
