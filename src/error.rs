//! Error types for the tidybot voice engine

use thiserror::Error;

/// Result type alias for voice engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Domain error kinds for the transcription provider
///
/// Provider-specific numeric codes are mapped onto this closed set; anything
/// unrecognized lands in `Unknown` with the raw code preserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscriptionErrorKind {
    /// Audio quality too poor to recognize
    BadAudioQuality,
    /// Request or daily quota exceeded
    QuotaExceeded,
    /// Token invalid or expired at the provider
    AuthFailure,
    /// Audio payload malformed or too long
    MalformedAudio,
    /// Sample rate or container not supported
    UnsupportedFormat,
    /// Unmapped provider code
    Unknown,
}

impl std::fmt::Display for TranscriptionErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::BadAudioQuality => "bad audio quality",
            Self::QuotaExceeded => "quota exceeded",
            Self::AuthFailure => "auth failure",
            Self::MalformedAudio => "malformed audio",
            Self::UnsupportedFormat => "unsupported format",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Domain error kinds for the synthesis provider
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SynthesisErrorKind {
    /// Request rejected as invalid
    InvalidRequest,
    /// Concurrency limit exceeded
    ConcurrencyExceeded,
    /// Provider backend busy
    ServerBusy,
    /// Requested voice does not exist
    VoiceNotFound,
    /// Unmapped provider code
    Unknown,
}

impl std::fmt::Display for SynthesisErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::InvalidRequest => "invalid request",
            Self::ConcurrencyExceeded => "concurrency exceeded",
            Self::ServerBusy => "server busy",
            Self::VoiceNotFound => "voice not found",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Errors that can occur in the voice engine
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Microphone permission absent
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// No microphone present or device busy
    #[error("hardware unavailable: {0}")]
    HardwareUnavailable(String),

    /// Capture failed after the fallback configuration was tried
    #[error("recording failed: {0}")]
    RecordingFailed(String),

    /// Recording finished but produced no audio
    #[error("empty audio artifact")]
    EmptyArtifact,

    /// Token issuance or refresh failed
    #[error("auth failure: {0}")]
    Auth(String),

    /// Transcription provider rejected the request
    #[error("transcription error ({kind}, code {code}): {message}")]
    Transcription {
        /// Mapped domain kind
        kind: TranscriptionErrorKind,
        /// Raw provider code
        code: i64,
        /// Raw provider message
        message: String,
    },

    /// Provider returned no candidate transcripts
    #[error("no transcript")]
    NoTranscript,

    /// Synthesis provider rejected the request
    #[error("synthesis error ({kind}, code {code}): {message}")]
    Synthesis {
        /// Mapped domain kind
        kind: SynthesisErrorKind,
        /// Raw provider code
        code: i64,
        /// Raw provider message
        message: String,
    },

    /// Speaker output failed
    #[error("playback failure: {0}")]
    Playback(String),

    /// Reply rejected by the response filter (silent no-op turn)
    #[error("reply rejected by filter")]
    FilteredEmpty,

    /// Response-generation collaborator error
    #[error("chat error: {0}")]
    Chat(String),

    /// Remote call exceeded the bounded timeout
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Whether this error warrants the `Error` assistant state
    /// (caller intervention required) rather than a silent return to idle.
    #[must_use]
    pub const fn needs_intervention(&self) -> bool {
        matches!(self, Self::PermissionDenied(_))
    }
}
