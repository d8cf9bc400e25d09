//! Prometheus metrics handler

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

/// Install the global Prometheus recorder
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    describe_metrics();
    Ok(handle)
}

fn describe_metrics() {
    describe_gauge!(
        "voxrelay_active_sessions",
        "Number of media channels currently connected"
    );
    describe_gauge!(
        "voxrelay_runs_pending",
        "Runs waiting for the run queue"
    );
    describe_counter!(
        "voxrelay_runs_total",
        "Language-model runs finished, by outcome"
    );
    describe_counter!(
        "voxrelay_transcripts_total",
        "Transcripts received from the recognition service"
    );
    describe_counter!(
        "voxrelay_synthesis_chunks_total",
        "Audio chunks received from the synthesis service"
    );
    describe_counter!(
        "voxrelay_synthesis_timeouts_total",
        "Synthesis requests that never received a final audio frame"
    );
    describe_counter!(
        "voxrelay_stream_reconnects_total",
        "Reconnect attempts made by the speech adapters"
    );
}

/// HTTP metrics handler
pub async fn metrics_handler(State(prometheus_handle): State<PrometheusHandle>) -> Response {
    (StatusCode::OK, prometheus_handle.render()).into_response()
}
