//! Network transports for the speech and language-model services

pub mod asr_websocket;
pub mod assistants;
pub mod tts_websocket;

pub use asr_websocket::WebSocketAsrTransport;
pub use assistants::AssistantsClient;
pub use tts_websocket::WebSocketTtsTransport;
