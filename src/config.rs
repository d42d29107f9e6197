//! Configuration management for the voice engine
//!
//! Environment variables take priority; an optional `voice.toml` in the XDG
//! config directory supplies overrides for the tunable synthesis parameters.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::Result;

/// Bounded timeout for transcription, synthesis, and chat calls
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Which speaker backend synthesizes assistant replies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TtsBackend {
    /// Remote synthesis provider with the on-disk artifact cache
    #[default]
    Cloud,
    /// Local espeak-ng fallback (no network, no cache)
    Local,
}

/// Voice engine configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Data directory (recordings, synthesis cache)
    pub data_dir: PathBuf,

    /// Directory holding the active recording artifact
    pub recordings_dir: PathBuf,

    /// Content-addressed synthesis artifact cache
    pub tts_cache_dir: PathBuf,

    /// Transcription provider settings
    pub stt: SttConfig,

    /// Synthesis provider settings
    pub tts: TtsConfig,

    /// Response-generation collaborator settings
    pub chat: ChatConfig,

    /// Selected speaker backend
    pub tts_backend: TtsBackend,
}

/// Transcription provider configuration
#[derive(Debug, Clone)]
pub struct SttConfig {
    /// Credential-grant client id
    pub api_key: String,

    /// Credential-grant client secret
    pub secret_key: String,

    /// Token issuance endpoint
    pub token_url: String,

    /// Recognition endpoint
    pub recognize_url: String,

    /// Device identifier sent with recognition requests
    pub device_id: String,

    /// Seconds subtracted from the provider-declared token TTL
    /// to refresh early and absorb clock skew
    pub token_margin_secs: u64,
}

/// Synthesis provider configuration
#[derive(Debug, Clone)]
pub struct TtsConfig {
    /// Provider application id
    pub app_id: String,

    /// Provider access token
    pub access_token: String,

    /// Provider cluster identifier
    pub cluster: String,

    /// Synthesis endpoint
    pub url: String,

    /// Voice identifier
    pub voice_type: String,

    /// Speed ratio (clamped into the provider range at call time)
    pub speed_ratio: f32,

    /// Loudness ratio (clamped into the provider range at call time)
    pub loudness_ratio: f32,

    /// Audio encoding requested from the provider
    pub encoding: String,

    /// Output sample rate requested from the provider
    pub sample_rate: u32,

    /// Language hint
    pub language: String,
}

/// Response-generation collaborator configuration
#[derive(Debug, Clone)]
pub struct ChatConfig {
    /// Collaborator endpoint accepting `{ query, context }`
    pub url: String,
}

/// Optional overrides read from `voice.toml`
#[derive(Debug, Default, Deserialize)]
struct FileOverrides {
    voice_type: Option<String>,
    speed_ratio: Option<f32>,
    loudness_ratio: Option<f32>,
    tts_backend: Option<TtsBackend>,
    chat_url: Option<String>,
}

impl Config {
    /// Load configuration from the environment plus optional `voice.toml`
    ///
    /// # Errors
    ///
    /// Returns error if the data directory cannot be created
    pub fn load() -> Result<Self> {
        let data_dir = directories::ProjectDirs::from("dev", "tidybot", "tidybot")
            .map_or_else(|| PathBuf::from(".tidybot"), |d| d.data_dir().to_path_buf());

        let recordings_dir = data_dir.join("recordings");
        let tts_cache_dir = data_dir.join("tts-cache");
        std::fs::create_dir_all(&recordings_dir)?;
        std::fs::create_dir_all(&tts_cache_dir)?;

        let overrides = Self::load_overrides();

        let device_id = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "tidybot-device".to_string());

        let stt = SttConfig {
            api_key: std::env::var("TIDYBOT_STT_API_KEY").unwrap_or_default(),
            secret_key: std::env::var("TIDYBOT_STT_SECRET_KEY").unwrap_or_default(),
            token_url: std::env::var("TIDYBOT_STT_TOKEN_URL")
                .unwrap_or_else(|_| "https://openapi.speech.dev/oauth/2.0/token".to_string()),
            recognize_url: std::env::var("TIDYBOT_STT_URL")
                .unwrap_or_else(|_| "https://vop.speech.dev/server_api".to_string()),
            device_id,
            token_margin_secs: 60,
        };

        let tts = TtsConfig {
            app_id: std::env::var("TIDYBOT_TTS_APP_ID").unwrap_or_default(),
            access_token: std::env::var("TIDYBOT_TTS_TOKEN").unwrap_or_default(),
            cluster: std::env::var("TIDYBOT_TTS_CLUSTER")
                .unwrap_or_else(|_| "volcano_tts".to_string()),
            url: std::env::var("TIDYBOT_TTS_URL")
                .unwrap_or_else(|_| "https://openspeech.speech.dev/api/v1/tts".to_string()),
            voice_type: overrides
                .voice_type
                .or_else(|| std::env::var("TIDYBOT_TTS_VOICE").ok())
                .unwrap_or_else(|| "zh_female_cancan".to_string()),
            speed_ratio: overrides
                .speed_ratio
                .or_else(|| env_f32("TIDYBOT_TTS_SPEED"))
                .unwrap_or(1.0),
            loudness_ratio: overrides
                .loudness_ratio
                .or_else(|| env_f32("TIDYBOT_TTS_LOUDNESS"))
                .unwrap_or(1.0),
            encoding: "mp3".to_string(),
            sample_rate: 24000,
            language: "cn".to_string(),
        };

        let chat = ChatConfig {
            url: overrides
                .chat_url
                .or_else(|| std::env::var("TIDYBOT_CHAT_URL").ok())
                .unwrap_or_else(|| "http://localhost:8600/api/chat".to_string()),
        };

        let tts_backend = overrides.tts_backend.unwrap_or_else(|| {
            std::env::var("TIDYBOT_TTS_BACKEND").map_or(TtsBackend::Cloud, |v| {
                if v.eq_ignore_ascii_case("local") {
                    TtsBackend::Local
                } else {
                    TtsBackend::Cloud
                }
            })
        });

        Ok(Self {
            data_dir,
            recordings_dir,
            tts_cache_dir,
            stt,
            tts,
            chat,
            tts_backend,
        })
    }

    /// Read `voice.toml` overrides from the XDG config dir, tolerating absence
    fn load_overrides() -> FileOverrides {
        let Some(dirs) = directories::ProjectDirs::from("dev", "tidybot", "tidybot") else {
            return FileOverrides::default();
        };
        Self::read_overrides(&dirs.config_dir().join("voice.toml"))
    }

    fn read_overrides(path: &Path) -> FileOverrides {
        if !path.exists() {
            return FileOverrides::default();
        }

        match std::fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(overrides) => {
                    tracing::info!(path = %path.display(), "loaded voice.toml overrides");
                    overrides
                }
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "failed to parse voice.toml, using defaults"
                    );
                    FileOverrides::default()
                }
            },
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to read voice.toml");
                FileOverrides::default()
            }
        }
    }
}

fn env_f32(key: &str) -> Option<f32> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_parse() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("voice.toml");
        std::fs::write(
            &path,
            "voice_type = \"zh_male_ahu\"\nspeed_ratio = 1.2\ntts_backend = \"local\"\n",
        )
        .unwrap();

        let overrides = Config::read_overrides(&path);
        assert_eq!(overrides.voice_type.as_deref(), Some("zh_male_ahu"));
        assert_eq!(overrides.speed_ratio, Some(1.2));
        assert_eq!(overrides.tts_backend, Some(TtsBackend::Local));
        assert!(overrides.loudness_ratio.is_none());
    }

    #[test]
    fn missing_overrides_default() {
        let overrides = Config::read_overrides(Path::new("/nonexistent/voice.toml"));
        assert!(overrides.voice_type.is_none());
        assert!(overrides.tts_backend.is_none());
    }
}
