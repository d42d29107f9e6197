//! Speaker capability
//!
//! Single seam for "turn text into audible speech": the engine never branches
//! on backend identity. The cloud implementation routes through the cached
//! synthesis service and the playback controller; the local fallback shells
//! out to espeak-ng for network-free operation.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::playback::AudioPlayback;
use super::tts::SpeechSynthesisService;
use crate::{Error, Result};

/// Synthesize-and-speak capability
#[async_trait]
pub trait Speaker: Send + Sync {
    /// Speak `text` to completion (or until stopped)
    async fn speak(&self, text: &str) -> Result<()>;

    /// Stop any in-flight speech; safe no-op when silent
    async fn stop(&self);
}

/// Cloud speaker: remote synthesis with the artifact cache, then playback
pub struct CloudSpeaker {
    synthesis: SpeechSynthesisService,
    playback: Arc<AudioPlayback>,
}

impl CloudSpeaker {
    /// Create a cloud speaker over the synthesis service and playback device
    #[must_use]
    pub fn new(synthesis: SpeechSynthesisService, playback: Arc<AudioPlayback>) -> Self {
        Self { synthesis, playback }
    }
}

#[async_trait]
impl Speaker for CloudSpeaker {
    async fn speak(&self, text: &str) -> Result<()> {
        let artifact = self.synthesis.synthesize(text).await?;
        self.playback.play(&artifact).await
    }

    async fn stop(&self) {
        self.playback.stop();
    }
}

/// Local fallback speaker driving espeak-ng
pub struct LocalSpeaker {
    binary: PathBuf,
    voice: String,
    child: Mutex<Option<tokio::process::Child>>,
}

impl LocalSpeaker {
    /// Locate espeak-ng and build a local speaker
    ///
    /// # Errors
    ///
    /// Returns error if no espeak-ng binary is on the PATH
    pub fn new(voice: impl Into<String>) -> Result<Self> {
        let binary = which::which("espeak-ng")
            .or_else(|_| which::which("espeak"))
            .map_err(|e| Error::Config(format!("local TTS backend needs espeak-ng: {e}")))?;

        tracing::debug!(binary = %binary.display(), "local speaker initialized");
        Ok(Self {
            binary,
            voice: voice.into(),
            child: Mutex::new(None),
        })
    }
}

#[async_trait]
impl Speaker for LocalSpeaker {
    async fn speak(&self, text: &str) -> Result<()> {
        // One utterance at a time
        self.stop().await;

        let child = tokio::process::Command::new(&self.binary)
            .arg("-v")
            .arg(&self.voice)
            .arg(text)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()
            .map_err(|e| Error::Playback(format!("espeak-ng spawn failed: {e}")))?;

        *self.child.lock().await = Some(child);

        // Poll instead of awaiting wait() so stop() can take the handle and
        // kill the process mid-utterance
        loop {
            {
                let mut slot = self.child.lock().await;
                let Some(child) = slot.as_mut() else {
                    // Stopped from outside
                    return Ok(());
                };
                match child.try_wait() {
                    Ok(Some(status)) => {
                        *slot = None;
                        if status.success() {
                            return Ok(());
                        }
                        return Err(Error::Playback(format!("espeak-ng exited with {status}")));
                    }
                    Ok(None) => {}
                    Err(e) => {
                        *slot = None;
                        return Err(Error::Playback(format!("espeak-ng wait failed: {e}")));
                    }
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
    }

    async fn stop(&self) {
        let mut slot = self.child.lock().await;
        if let Some(mut child) = slot.take() {
            if let Err(e) = child.start_kill() {
                tracing::debug!(error = %e, "espeak-ng already exited");
            }
        }
    }
}
