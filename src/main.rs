use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use voxrelay::application::{RunQueue, SessionContext};
use voxrelay::config::Config;
use voxrelay::domain::completion::CompletionBackend;
use voxrelay::domain::language::LanguageRegistry;
use voxrelay::domain::synthesis::TtsTransport;
use voxrelay::domain::transcription::AsrTransport;
use voxrelay::infrastructure::providers::{
    AssistantsClient, WebSocketAsrTransport, WebSocketTtsTransport,
};
use voxrelay::infrastructure::speech::SpeechSynthesizer;
use voxrelay::interface::api::{build_router, init_metrics, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting VoxRelay");

    let config = Config::load()?;
    config.llm.ensure_credentials()?;
    info!(
        bind = %config.bind_address(),
        languages = ?config.asr.language_codes,
        "Configuration loaded"
    );

    let prometheus_handle = init_metrics()?;

    let backend: Arc<dyn CompletionBackend> = Arc::new(AssistantsClient::new(
        config.llm.base_url.clone(),
        config.llm.api_key.clone(),
        config.llm.assistant_id.clone(),
    ));
    let asr_transport: Arc<dyn AsrTransport> = Arc::new(WebSocketAsrTransport::new(
        config.asr.url.clone(),
        config.asr.api_key.clone(),
    ));
    let tts_transport: Arc<dyn TtsTransport> = Arc::new(WebSocketTtsTransport::new(
        &config.tts.url,
        &config.tts.voice.voice_id,
    ));

    let synthesizer = SpeechSynthesizer::new(tts_transport, config.synthesizer_settings());
    if let Err(e) = synthesizer.connect().await {
        // Requests reconnect on demand
        warn!("Synthesizer not connected at startup: {}", e);
    }

    let context = SessionContext {
        run_queue: RunQueue::new(backend),
        synthesizer: synthesizer.clone(),
        asr_transport,
        transcription: config.transcription_settings(),
        languages: LanguageRegistry::new(config.asr.default_language.clone(), &config.asr.language_codes),
        settings: config.session_settings(),
    };

    let app = build_router(AppState::new(context), prometheus_handle);

    let listener = tokio::net::TcpListener::bind(config.bind_address()).await?;
    info!("API server listening on {}", config.bind_address());

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutting down...");
        })
        .await?;

    synthesizer.close().await;
    info!("VoxRelay stopped");
    Ok(())
}
