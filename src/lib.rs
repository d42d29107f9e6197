//! Tidybot Voice - voice assistant orchestration engine
//!
//! Drives the full voice turn pipeline for a home-robot assistant:
//! - Microphone capture with device-rate fallback and resampling
//! - Cloud transcription behind a cached credential-grant token
//! - Response generation via the chat collaborator
//! - Reply filtering so protocol payloads never reach the speaker
//! - Cloud or local speech synthesis with a content-addressed artifact cache
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │                VoiceAssistant                  │
//! │  Idle → Listening → Processing → Speaking → …  │
//! └───────┬───────────┬───────────┬───────────────┘
//!         │           │           │
//!   AudioCapture  Transcriber  ChatClient
//!                               │
//!                      filter_reply → Speaker
//!                        (Cloud TTS │ espeak-ng)
//! ```

pub mod chat;
pub mod config;
pub mod engine;
pub mod error;
pub mod gate;
pub mod voice;

pub use chat::{ChatClient, ChatReply, ResponseGenerator};
pub use config::{Config, TtsBackend};
pub use engine::{AssistantState, MessageKind, VoiceAssistant, VoiceMessage};
pub use error::{Error, Result};
pub use gate::{HostGate, PermissionGate};
pub use voice::{
    AudioCapture, AudioInput, AudioPlayback, CloudSpeaker, LocalSpeaker, RecordedAudio, Speaker,
    SpeechRecognizer, SpeechSynthesisService, Transcriber, filter_reply,
};
