//! Configuration management
//!
//! Built-in defaults, then an optional TOML file (`VOXRELAY_CONFIG`, default
//! `voxrelay.toml`), then `VOXRELAY__SECTION__KEY` environment variables.

use crate::application::SessionSettings;
use crate::domain::backoff::ReconnectPolicy;
use crate::domain::language::MAX_LANGUAGE_CODES;
use crate::domain::shared::{DomainError, Result};
use crate::domain::synthesis::VoiceSettings;
use crate::infrastructure::speech::{SynthesizerSettings, TranscriptionSettings};
use config::{Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const CONFIG_PATH_ENV: &str = "VOXRELAY_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "voxrelay.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub asr: AsrConfig,
    pub tts: TtsConfig,
    pub llm: LlmConfig,
    pub session: SessionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Speech recognition service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsrConfig {
    pub url: String,
    pub api_key: String,
    pub encoding: String,
    pub sample_rate_hertz: u32,
    pub audio_channel_count: u16,
    pub model: String,
    pub interim_results: bool,
    pub default_language: String,
    pub language_codes: Vec<String>,
    pub max_stream_lifetime_secs: u64,
    pub rotate_after_final: bool,
    pub reconnect: ReconnectPolicy,
}

/// Speech synthesis service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsConfig {
    /// May contain a `{voice_id}` placeholder
    pub url: String,
    pub api_key: String,
    pub voice: VoiceSettings,
    pub reconnect: ReconnectPolicy,
    /// Longest wait for the final audio frame of a request
    pub final_frame_timeout_ms: u64,
}

/// Language-model service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub base_url: String,
    pub api_key: String,
    pub assistant_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub greeting: String,
    pub greeting_track: String,
}

impl Default for Config {
    fn default() -> Self {
        let transcription = TranscriptionSettings::default();
        let session = SessionSettings::default();
        let synthesizer = SynthesizerSettings::default();
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
            },
            asr: AsrConfig {
                url: "wss://speech.googleapis.com/v1/speech:streamingRecognize".to_string(),
                api_key: String::new(),
                encoding: transcription.encoding,
                sample_rate_hertz: transcription.sample_rate_hertz,
                audio_channel_count: transcription.audio_channel_count,
                model: transcription.model,
                interim_results: transcription.interim_results,
                language_codes: vec![transcription.default_language.clone()],
                default_language: transcription.default_language,
                max_stream_lifetime_secs: transcription.max_stream_lifetime.as_secs(),
                rotate_after_final: transcription.rotate_after_final,
                reconnect: transcription.reconnect,
            },
            tts: TtsConfig {
                url: "wss://api.elevenlabs.io/v1/text-to-speech/{voice_id}/stream-input?model_id=eleven_turbo_v2&output_format=ulaw_8000".to_string(),
                api_key: String::new(),
                voice: synthesizer.voice,
                reconnect: synthesizer.reconnect,
                final_frame_timeout_ms: synthesizer.final_frame_timeout.as_millis() as u64,
            },
            llm: LlmConfig {
                base_url: "https://api.openai.com/v1".to_string(),
                api_key: String::new(),
                assistant_id: String::new(),
            },
            session: SessionConfig {
                greeting: session.greeting,
                greeting_track: session.greeting_track,
            },
        }
    }
}

fn config_error(e: config::ConfigError) -> DomainError {
    DomainError::Configuration(e.to_string())
}

impl Config {
    /// Load from the file named by `VOXRELAY_CONFIG` and the environment
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(&path)
    }

    /// Load with `path` as the (optional) file layer
    pub fn load_from(path: &str) -> Result<Self> {
        let defaults = config::Config::try_from(&Config::default()).map_err(config_error)?;

        let config: Config = config::Config::builder()
            .add_source(defaults)
            .add_source(File::with_name(path).required(false))
            .add_source(
                Environment::with_prefix("VOXRELAY")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("asr.language_codes")
                    .try_parsing(true),
            )
            .build()
            .map_err(config_error)?
            .try_deserialize()
            .map_err(config_error)?;

        config.validate()?;
        Ok(config)
    }

    /// Structural checks; credentials are checked where they are used
    pub fn validate(&self) -> Result<()> {
        if self.asr.url.trim().is_empty() {
            return Err(DomainError::Configuration("asr.url must be set".to_string()));
        }
        if self.tts.url.trim().is_empty() {
            return Err(DomainError::Configuration("tts.url must be set".to_string()));
        }
        if self.asr.sample_rate_hertz == 0 {
            return Err(DomainError::Configuration(
                "asr.sample_rate_hertz must be positive".to_string(),
            ));
        }
        if self.asr.language_codes.len() > MAX_LANGUAGE_CODES {
            return Err(DomainError::Configuration(format!(
                "asr.language_codes allows at most {} entries, got {}",
                MAX_LANGUAGE_CODES,
                self.asr.language_codes.len()
            )));
        }
        if self.tts.final_frame_timeout_ms == 0 {
            return Err(DomainError::Configuration(
                "tts.final_frame_timeout_ms must be positive".to_string(),
            ));
        }
        for (name, policy) in [("asr", &self.asr.reconnect), ("tts", &self.tts.reconnect)] {
            if policy.max_attempts == 0 {
                return Err(DomainError::Configuration(format!(
                    "{}.reconnect.max_attempts must be positive",
                    name
                )));
            }
        }
        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn transcription_settings(&self) -> TranscriptionSettings {
        TranscriptionSettings {
            encoding: self.asr.encoding.clone(),
            sample_rate_hertz: self.asr.sample_rate_hertz,
            audio_channel_count: self.asr.audio_channel_count,
            model: self.asr.model.clone(),
            interim_results: self.asr.interim_results,
            default_language: self.asr.default_language.clone(),
            max_stream_lifetime: Duration::from_secs(self.asr.max_stream_lifetime_secs),
            rotate_after_final: self.asr.rotate_after_final,
            reconnect: self.asr.reconnect,
        }
    }

    pub fn synthesizer_settings(&self) -> SynthesizerSettings {
        SynthesizerSettings {
            api_key: self.tts.api_key.clone(),
            voice: self.tts.voice.clone(),
            reconnect: self.tts.reconnect,
            final_frame_timeout: Duration::from_millis(self.tts.final_frame_timeout_ms),
        }
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            greeting: self.session.greeting.clone(),
            greeting_track: self.session.greeting_track.clone(),
        }
    }
}

impl LlmConfig {
    pub fn ensure_credentials(&self) -> Result<()> {
        if self.api_key.trim().is_empty() {
            return Err(DomainError::Configuration("llm.api_key must be set".to_string()));
        }
        if self.assistant_id.trim().is_empty() {
            return Err(DomainError::Configuration("llm.assistant_id must be set".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.bind_address(), "0.0.0.0:8080");
        assert_eq!(config.asr.language_codes, vec!["en-US".to_string()]);
    }

    #[test]
    fn test_too_many_languages_rejected() {
        let mut config = Config::default();
        config.asr.language_codes = (0..7).map(|i| format!("l{}", i)).collect();
        assert!(matches!(config.validate(), Err(DomainError::Configuration(_))));
    }

    #[test]
    fn test_zero_final_frame_timeout_rejected() {
        let mut config = Config::default();
        config.tts.final_frame_timeout_ms = 0;
        assert!(matches!(config.validate(), Err(DomainError::Configuration(_))));
    }

    #[test]
    fn test_llm_credentials_required() {
        let mut llm = Config::default().llm;
        assert!(llm.ensure_credentials().is_err());
        llm.api_key = "sk-test".to_string();
        llm.assistant_id = "asst_1".to_string();
        assert!(llm.ensure_credentials().is_ok());
    }

    #[test]
    fn test_settings_conversion() {
        let mut config = Config::default();
        config.asr.max_stream_lifetime_secs = 120;
        config.asr.rotate_after_final = false;
        config.tts.api_key = "xi".to_string();
        config.tts.final_frame_timeout_ms = 2500;

        let transcription = config.transcription_settings();
        assert_eq!(transcription.max_stream_lifetime, Duration::from_secs(120));
        assert!(!transcription.rotate_after_final);
        let synthesizer = config.synthesizer_settings();
        assert_eq!(synthesizer.api_key, "xi");
        assert_eq!(synthesizer.final_frame_timeout, Duration::from_millis(2500));
        assert_eq!(config.session_settings().greeting_track, "inbound");
    }

    #[test]
    fn test_file_layer_overrides_defaults() {
        let path = std::env::temp_dir().join(format!("voxrelay-test-{}.toml", uuid::Uuid::new_v4()));
        std::fs::write(
            &path,
            r#"
[server]
port = 9090

[asr]
language_codes = ["es-ES", "en-US"]

[asr.reconnect]
max_attempts = 3

[session]
greeting = "Hola"
"#,
        )
        .unwrap();

        let config = Config::load_from(path.to_str().unwrap()).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.server.port, 9090);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.asr.language_codes, vec!["es-ES", "en-US"]);
        assert_eq!(config.asr.reconnect.max_attempts, 3);
        assert_eq!(config.asr.reconnect.base_delay_ms, 500);
        assert_eq!(config.session.greeting, "Hola");
    }

    #[test]
    fn test_environment_overrides() {
        std::env::set_var("VOXRELAY__LLM__ASSISTANT_ID", "asst_env");
        let config = Config::load_from("/nonexistent/voxrelay-env");
        std::env::remove_var("VOXRELAY__LLM__ASSISTANT_ID");

        assert_eq!(config.unwrap().llm.assistant_id, "asst_env");
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = Config::load_from("/nonexistent/voxrelay-missing").unwrap();
        assert_eq!(config.server.port, 8080);
    }
}
