//! HTTP handlers and shared state

use super::dto::{
    ApiResponse, HealthResponse, LanguagesResponse, SessionsResponse, UpdateLanguagesRequest,
};
use crate::application::{SessionContext, SessionRegistry};
use axum::{extract::State, Json};
use tracing::info;

/// Shared state for all routes
#[derive(Clone)]
pub struct AppState {
    pub context: SessionContext,
    pub sessions: SessionRegistry,
}

impl AppState {
    pub fn new(context: SessionContext) -> Self {
        Self {
            context,
            sessions: SessionRegistry::new(),
        }
    }
}

pub async fn health_check(State(state): State<AppState>) -> Json<ApiResponse<HealthResponse>> {
    Json(ApiResponse::success(HealthResponse {
        status: "ok".to_string(),
        active_sessions: state.sessions.count(),
        synthesizer: state.context.synthesizer.state().await,
        run_queue: state.context.run_queue.stats(),
    }))
}

pub async fn list_sessions(State(state): State<AppState>) -> Json<ApiResponse<SessionsResponse>> {
    let sessions = state.sessions.snapshot();
    Json(ApiResponse::success(SessionsResponse {
        count: sessions.len(),
        sessions,
    }))
}

pub async fn get_languages(State(state): State<AppState>) -> Json<ApiResponse<LanguagesResponse>> {
    let languages = &state.context.languages;
    Json(ApiResponse::success(LanguagesResponse {
        default_code: languages.default_code().to_string(),
        codes: languages.current(),
    }))
}

/// Replace the language list and push it to every live session
pub async fn update_languages(
    State(state): State<AppState>,
    Json(request): Json<UpdateLanguagesRequest>,
) -> Json<ApiResponse<LanguagesResponse>> {
    let languages = &state.context.languages;
    let codes = languages.replace(&request.codes);
    info!(codes = ?codes, "API: Language codes updated");

    state.sessions.broadcast_language_codes(&codes).await;

    Json(ApiResponse::success(LanguagesResponse {
        default_code: languages.default_code().to_string(),
        codes,
    }))
}
