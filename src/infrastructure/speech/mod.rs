//! Reconnecting adapters around the streaming speech services

pub mod synthesizer;
pub mod transcription_stream;

pub use synthesizer::{ConnectionState, SpeechSynthesizer, SynthesizerSettings};
pub use transcription_stream::{SendOutcome, TranscriptionSettings, TranscriptionStream};
