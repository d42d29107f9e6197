//! Speech-to-text (STT) processing
//!
//! Client for the remote recognition provider: a credential-grant token
//! endpoint feeding a single cached token slot, and a recognition endpoint
//! taking base64 audio with a format hint derived from the artifact
//! extension.

use std::path::Path;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;

use super::capture::{RecordedAudio, SAMPLE_RATE};
use crate::config::{REQUEST_TIMEOUT, SttConfig};
use crate::error::TranscriptionErrorKind;
use crate::{Error, Result};

/// Recognized audio containers and the hint sent for each
const FORMAT_TABLE: &[(&str, &str)] = &[
    ("wav", "wav"),
    ("pcm", "pcm"),
    ("amr", "amr"),
    ("m4a", "m4a"),
];

/// Hint used when the artifact extension is unrecognized
const DEFAULT_FORMAT: &str = "pcm";

/// Converts audio artifacts to text
///
/// Object-safe seam so the engine can be tested without the provider.
#[async_trait]
pub trait SpeechRecognizer: Send + Sync {
    /// Transcribe a finished recording
    async fn transcribe(&self, audio: &RecordedAudio) -> Result<String>;
}

/// A token issued by the provider with its declared TTL
#[derive(Debug, Clone)]
pub struct IssuedToken {
    /// Bearer token value
    pub value: String,
    /// Provider-declared time to live
    pub ttl: Duration,
}

/// Issues fresh access tokens
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Fetch a new token from the provider
    async fn fetch(&self) -> Result<IssuedToken>;
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

/// Single-slot access-token cache
///
/// Refreshes lazily once the token is within the safety margin of expiry;
/// refreshes are serialized by the slot mutex and the token never touches
/// disk.
pub struct TokenCache {
    source: Box<dyn TokenSource>,
    margin: Duration,
    slot: tokio::sync::Mutex<Option<CachedToken>>,
}

impl TokenCache {
    /// Create a cache over `source` with an early-refresh `margin`
    pub fn new(source: Box<dyn TokenSource>, margin: Duration) -> Self {
        Self {
            source,
            margin,
            slot: tokio::sync::Mutex::new(None),
        }
    }

    /// Return a valid token, refreshing if expired
    ///
    /// # Errors
    ///
    /// Returns error if the provider rejects the refresh
    pub async fn token(&self) -> Result<String> {
        let mut slot = self.slot.lock().await;

        if let Some(cached) = slot.as_ref() {
            if Instant::now() < cached.expires_at {
                return Ok(cached.value.clone());
            }
            tracing::debug!("access token expired, refreshing");
        }

        let issued = self.source.fetch().await?;
        let lifetime = issued.ttl.saturating_sub(self.margin);
        let cached = CachedToken {
            value: issued.value,
            expires_at: Instant::now() + lifetime,
        };
        let value = cached.value.clone();
        *slot = Some(cached);

        tracing::debug!(lifetime_secs = lifetime.as_secs(), "access token refreshed");
        Ok(value)
    }
}

/// Credential-grant token endpoint client
struct HttpTokenSource {
    client: reqwest::Client,
    token_url: String,
    api_key: String,
    secret_key: String,
}

#[derive(serde::Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    expires_in: Option<u64>,
    error: Option<String>,
    error_description: Option<String>,
}

#[async_trait]
impl TokenSource for HttpTokenSource {
    async fn fetch(&self) -> Result<IssuedToken> {
        let response = self
            .client
            .post(&self.token_url)
            .timeout(REQUEST_TIMEOUT)
            .query(&[
                ("grant_type", "client_credentials"),
                ("client_id", &self.api_key),
                ("client_secret", &self.secret_key),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Auth(format!("token endpoint error {status}: {body}")));
        }

        let body: TokenResponse = response.json().await?;

        if let Some(error) = body.error {
            let description = body.error_description.unwrap_or_default();
            return Err(Error::Auth(format!("{error}: {description}")));
        }

        let value = body
            .access_token
            .ok_or_else(|| Error::Auth("token endpoint returned no token".to_string()))?;

        Ok(IssuedToken {
            value,
            ttl: Duration::from_secs(body.expires_in.unwrap_or(0)),
        })
    }
}

#[derive(serde::Serialize)]
struct RecognizeRequest<'a> {
    format: &'a str,
    rate: u32,
    channel: u16,
    cuid: &'a str,
    token: &'a str,
    speech: String,
    len: usize,
}

#[derive(serde::Deserialize)]
struct RecognizeResponse {
    err_no: i64,
    #[serde(default)]
    err_msg: String,
    #[serde(default)]
    result: Vec<String>,
}

/// Transcribes recordings via the remote recognition provider
pub struct Transcriber {
    client: reqwest::Client,
    config: SttConfig,
    tokens: TokenCache,
}

impl Transcriber {
    /// Create a transcriber for the configured provider
    #[must_use]
    pub fn new(config: SttConfig) -> Self {
        let client = reqwest::Client::new();
        let source = HttpTokenSource {
            client: client.clone(),
            token_url: config.token_url.clone(),
            api_key: config.api_key.clone(),
            secret_key: config.secret_key.clone(),
        };
        let margin = Duration::from_secs(config.token_margin_secs);

        Self {
            client,
            config,
            tokens: TokenCache::new(Box::new(source), margin),
        }
    }
}

#[async_trait]
impl SpeechRecognizer for Transcriber {
    async fn transcribe(&self, audio: &RecordedAudio) -> Result<String> {
        let token = self.tokens.token().await?;

        let bytes = std::fs::read(&audio.path)?;
        let format = format_hint(&audio.path);

        tracing::debug!(
            bytes = bytes.len(),
            format,
            duration_ms = audio.duration_ms,
            "submitting recognition request"
        );

        let request = RecognizeRequest {
            format,
            rate: SAMPLE_RATE,
            channel: 1,
            cuid: &self.config.device_id,
            token: &token,
            speech: BASE64.encode(&bytes),
            len: bytes.len(),
        };

        let response = self
            .client
            .post(&self.config.recognize_url)
            .timeout(REQUEST_TIMEOUT)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "recognition endpoint error");
            return Err(Error::Transcription {
                kind: TranscriptionErrorKind::Unknown,
                code: i64::from(status.as_u16()),
                message: body,
            });
        }

        let body: RecognizeResponse = response.json().await?;

        if body.err_no != 0 {
            let kind = map_error_code(body.err_no);
            tracing::warn!(code = body.err_no, %kind, message = %body.err_msg, "recognition failed");
            return Err(Error::Transcription {
                kind,
                code: body.err_no,
                message: body.err_msg,
            });
        }

        // First candidate wins
        let transcript = body
            .result
            .into_iter()
            .next()
            .filter(|t| !t.trim().is_empty())
            .ok_or(Error::NoTranscript)?;

        tracing::info!(transcript = %transcript, "transcription complete");
        Ok(transcript)
    }
}

/// Derive the provider format hint from the artifact extension
fn format_hint(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);

    match ext.as_deref().and_then(|ext| {
        FORMAT_TABLE
            .iter()
            .find(|(known, _)| *known == ext)
            .map(|(_, hint)| *hint)
    }) {
        Some(hint) => hint,
        None => {
            tracing::warn!(path = %path.display(), "unrecognized audio extension, defaulting to pcm");
            DEFAULT_FORMAT
        }
    }
}

/// Map provider codes onto the closed domain set
const fn map_error_code(code: i64) -> TranscriptionErrorKind {
    match code {
        3301 => TranscriptionErrorKind::BadAudioQuality,
        3302 => TranscriptionErrorKind::AuthFailure,
        3304 | 3305 => TranscriptionErrorKind::QuotaExceeded,
        3308..=3310 => TranscriptionErrorKind::MalformedAudio,
        3311 | 3312 => TranscriptionErrorKind::UnsupportedFormat,
        _ => TranscriptionErrorKind::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSource {
        calls: std::sync::Arc<AtomicUsize>,
        ttl: Duration,
    }

    #[async_trait]
    impl TokenSource for CountingSource {
        async fn fetch(&self) -> Result<IssuedToken> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(IssuedToken {
                value: format!("token-{n}"),
                ttl: self.ttl,
            })
        }
    }

    #[tokio::test]
    async fn token_fetched_once_within_validity() {
        let calls = std::sync::Arc::new(AtomicUsize::new(0));
        let cache = TokenCache::new(
            Box::new(CountingSource {
                calls: std::sync::Arc::clone(&calls),
                ttl: Duration::from_secs(3600),
            }),
            Duration::from_secs(60),
        );

        let first = cache.token().await.unwrap();
        let second = cache.token().await.unwrap();

        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expired_token_triggers_one_refresh() {
        let calls = std::sync::Arc::new(AtomicUsize::new(0));
        // TTL below the margin: the cached token is already expired
        let cache = TokenCache::new(
            Box::new(CountingSource {
                calls: std::sync::Arc::clone(&calls),
                ttl: Duration::from_secs(10),
            }),
            Duration::from_secs(60),
        );

        let first = cache.token().await.unwrap();
        let second = cache.token().await.unwrap();

        assert_ne!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn format_hint_table() {
        assert_eq!(format_hint(Path::new("a.wav")), "wav");
        assert_eq!(format_hint(Path::new("a.PCM")), "pcm");
        assert_eq!(format_hint(Path::new("a.amr")), "amr");
        assert_eq!(format_hint(Path::new("a.m4a")), "m4a");
        assert_eq!(format_hint(Path::new("a.ogg")), "pcm");
        assert_eq!(format_hint(Path::new("noext")), "pcm");
    }

    #[test]
    fn error_code_mapping_is_closed() {
        assert_eq!(map_error_code(3301), TranscriptionErrorKind::BadAudioQuality);
        assert_eq!(map_error_code(3302), TranscriptionErrorKind::AuthFailure);
        assert_eq!(map_error_code(3304), TranscriptionErrorKind::QuotaExceeded);
        assert_eq!(map_error_code(3305), TranscriptionErrorKind::QuotaExceeded);
        assert_eq!(map_error_code(3309), TranscriptionErrorKind::MalformedAudio);
        assert_eq!(map_error_code(3311), TranscriptionErrorKind::UnsupportedFormat);
        assert_eq!(map_error_code(9999), TranscriptionErrorKind::Unknown);
    }
}
