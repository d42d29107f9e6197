//! Text-to-speech (TTS) processing
//!
//! Synthesis goes through a content-addressed on-disk cache keyed by
//! (text, voice, speed, loudness). Entries never expire on their own; a cache
//! write publishes atomically (temp file, then rename), so two callers racing
//! on the same key both land on identical bytes.

use std::io::Write;
use std::path::PathBuf;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use sha2::{Digest, Sha256};

use crate::config::{REQUEST_TIMEOUT, TtsConfig};
use crate::error::SynthesisErrorKind;
use crate::{Error, Result};

/// Provider-declared valid range for the speed ratio
const SPEED_RANGE: std::ops::RangeInclusive<f32> = 0.5..=2.0;

/// Provider-declared valid range for the loudness ratio
const LOUDNESS_RANGE: std::ops::RangeInclusive<f32> = 0.5..=2.0;

/// One synthesis call, with ratios already clamped into provider ranges
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisRequest {
    /// Text to synthesize
    pub text: String,
    /// Voice identifier
    pub voice_type: String,
    /// Clamped speed ratio
    pub speed_ratio: f32,
    /// Clamped loudness ratio
    pub loudness_ratio: f32,
}

/// Issues one remote synthesis call and returns decoded audio bytes
#[async_trait]
pub trait SynthesisBackend: Send + Sync {
    /// Synthesize `request` into encoded audio bytes
    async fn fetch(&self, request: &SynthesisRequest) -> Result<Vec<u8>>;
}

/// Synthesizes speech with a content-addressed artifact cache
pub struct SpeechSynthesisService {
    backend: Box<dyn SynthesisBackend>,
    cache_dir: PathBuf,
    voice_type: String,
    speed_ratio: f32,
    loudness_ratio: f32,
    extension: String,
}

impl SpeechSynthesisService {
    /// Create a service over `backend` caching artifacts under `cache_dir`
    #[must_use]
    pub fn new(backend: Box<dyn SynthesisBackend>, cache_dir: PathBuf, config: &TtsConfig) -> Self {
        Self {
            backend,
            cache_dir,
            voice_type: config.voice_type.clone(),
            speed_ratio: config.speed_ratio,
            loudness_ratio: config.loudness_ratio,
            extension: config.encoding.clone(),
        }
    }

    /// Synthesize `text` with the configured voice parameters
    ///
    /// # Errors
    ///
    /// Returns error if the remote call or the cache write fails
    pub async fn synthesize(&self, text: &str) -> Result<PathBuf> {
        self.synthesize_with(text, &self.voice_type, self.speed_ratio, self.loudness_ratio)
            .await
    }

    /// Synthesize with explicit voice parameters
    ///
    /// # Errors
    ///
    /// Returns error if the remote call or the cache write fails
    pub async fn synthesize_with(
        &self,
        text: &str,
        voice_type: &str,
        speed_ratio: f32,
        loudness_ratio: f32,
    ) -> Result<PathBuf> {
        let speed = speed_ratio.clamp(*SPEED_RANGE.start(), *SPEED_RANGE.end());
        let loudness = loudness_ratio.clamp(*LOUDNESS_RANGE.start(), *LOUDNESS_RANGE.end());

        let key = cache_key(text, voice_type, speed, loudness);
        let path = self.cache_dir.join(format!("{key}.{}", self.extension));

        if path.exists() {
            tracing::debug!(key = %key, "synthesis cache hit");
            return Ok(path);
        }

        let request = SynthesisRequest {
            text: text.to_string(),
            voice_type: voice_type.to_string(),
            speed_ratio: speed,
            loudness_ratio: loudness,
        };

        let bytes = self.backend.fetch(&request).await?;
        tracing::debug!(key = %key, bytes = bytes.len(), "synthesis complete, publishing");

        // Atomic publish: never expose a partially written entry
        let mut tmp = tempfile::NamedTempFile::new_in(&self.cache_dir)?;
        tmp.write_all(&bytes)?;
        tmp.persist(&path)
            .map_err(|e| Error::Io(e.error))?;

        Ok(path)
    }

    /// Remove every cached artifact, returning how many were deleted
    ///
    /// # Errors
    ///
    /// Returns error if the cache directory cannot be read
    pub fn clear_cache(&self) -> Result<usize> {
        let mut removed = 0;
        for entry in std::fs::read_dir(&self.cache_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                std::fs::remove_file(entry.path())?;
                removed += 1;
            }
        }
        tracing::info!(removed, "synthesis cache cleared");
        Ok(removed)
    }
}

/// Deterministic cache key over the four synthesis parameters
fn cache_key(text: &str, voice_type: &str, speed: f32, loudness: f32) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hasher.update(b"|");
    hasher.update(voice_type.as_bytes());
    hasher.update(b"|");
    hasher.update(format!("{speed:.2}|{loudness:.2}").as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(serde::Serialize)]
struct ProviderRequest<'a> {
    app: AppSection<'a>,
    user: UserSection<'a>,
    audio: AudioSection<'a>,
    request: RequestSection<'a>,
}

#[derive(serde::Serialize)]
struct AppSection<'a> {
    appid: &'a str,
    token: &'a str,
    cluster: &'a str,
}

#[derive(serde::Serialize)]
struct UserSection<'a> {
    uid: &'a str,
}

#[derive(serde::Serialize)]
struct AudioSection<'a> {
    voice_type: &'a str,
    encoding: &'a str,
    rate: u32,
    speed_ratio: f32,
    loudness_ratio: f32,
    language: &'a str,
}

#[derive(serde::Serialize)]
struct RequestSection<'a> {
    reqid: String,
    text: &'a str,
    text_type: &'a str,
    operation: &'a str,
}

#[derive(serde::Deserialize)]
struct ProviderResponse {
    code: i64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    data: Option<String>,
}

/// HTTP client for the remote synthesis provider
pub struct HttpSynthesisBackend {
    client: reqwest::Client,
    config: TtsConfig,
}

impl HttpSynthesisBackend {
    /// Create a backend for the configured provider
    #[must_use]
    pub fn new(config: TtsConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }
}

#[async_trait]
impl SynthesisBackend for HttpSynthesisBackend {
    async fn fetch(&self, request: &SynthesisRequest) -> Result<Vec<u8>> {
        let reqid = uuid::Uuid::new_v4().to_string();
        tracing::debug!(reqid = %reqid, text_len = request.text.len(), "synthesis request");

        let body = ProviderRequest {
            app: AppSection {
                appid: &self.config.app_id,
                token: &self.config.access_token,
                cluster: &self.config.cluster,
            },
            user: UserSection { uid: "tidybot" },
            audio: AudioSection {
                voice_type: &request.voice_type,
                encoding: &self.config.encoding,
                rate: self.config.sample_rate,
                speed_ratio: request.speed_ratio,
                loudness_ratio: request.loudness_ratio,
                language: &self.config.language,
            },
            request: RequestSection {
                reqid,
                text: &request.text,
                text_type: "plain",
                operation: "query",
            },
        };

        let response = self
            .client
            .post(&self.config.url)
            .timeout(REQUEST_TIMEOUT)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %text, "synthesis endpoint error");
            return Err(Error::Synthesis {
                kind: SynthesisErrorKind::Unknown,
                code: i64::from(status.as_u16()),
                message: text,
            });
        }

        let body: ProviderResponse = response.json().await?;

        if body.code != 3000 {
            let kind = map_provider_code(body.code);
            tracing::warn!(code = body.code, %kind, message = %body.message, "synthesis rejected");
            return Err(Error::Synthesis {
                kind,
                code: body.code,
                message: body.message,
            });
        }

        let data = body.data.ok_or_else(|| Error::Synthesis {
            kind: SynthesisErrorKind::Unknown,
            code: body.code,
            message: "success response carried no audio payload".to_string(),
        })?;

        BASE64.decode(data).map_err(|e| Error::Synthesis {
            kind: SynthesisErrorKind::Unknown,
            code: body.code,
            message: format!("audio payload decode failed: {e}"),
        })
    }
}

/// Map provider response codes onto the closed domain set
const fn map_provider_code(code: i64) -> SynthesisErrorKind {
    match code {
        3001 => SynthesisErrorKind::InvalidRequest,
        3003 => SynthesisErrorKind::ConcurrencyExceeded,
        3005 => SynthesisErrorKind::ServerBusy,
        3011 => SynthesisErrorKind::VoiceNotFound,
        _ => SynthesisErrorKind::Unknown,
    }
}
