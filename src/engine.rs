//! Voice assistant orchestration engine
//!
//! Drives one turn of the pipeline at a time: record, transcribe, generate,
//! filter, speak. All state transitions funnel through a single watch channel
//! so observers always see a consistent view, and a turn epoch keeps a
//! superseded background turn from stomping the state of its replacement.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio::time::timeout;
use uuid::Uuid;

use crate::chat::{ChatClient, ChatReply, ResponseGenerator};
use crate::config::{Config, REQUEST_TIMEOUT, TtsBackend};
use crate::gate::{HostGate, PermissionGate};
use crate::voice::{
    AudioCapture, AudioInput, AudioPlayback, CloudSpeaker, HttpSynthesisBackend, LocalSpeaker,
    RecordedAudio, Speaker, SpeechRecognizer, SpeechSynthesisService, Transcriber, filter_reply,
};
use crate::{Error, Result};

/// Where the assistant is in its turn lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssistantState {
    /// Ready for a new turn
    Idle,
    /// Microphone is capturing
    Listening,
    /// Transcription and response generation are in flight
    Processing,
    /// Response audio is playing
    Speaking,
    /// Recording permission was denied; needs user intervention
    Error,
}

impl std::fmt::Display for AssistantState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Listening => "listening",
            Self::Processing => "processing",
            Self::Speaking => "speaking",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Payload kind of a conversation entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Text,
    Audio,
}

/// One entry in the conversation transcript
#[derive(Debug, Clone)]
pub struct VoiceMessage {
    pub id: Uuid,
    pub content: String,
    pub is_from_user: bool,
    pub kind: MessageKind,
    pub timestamp_ms: i64,
    /// Set for audio entries so the UI can replay the artifact
    pub audio_path: Option<PathBuf>,
}

impl VoiceMessage {
    fn user_audio(content: String, audio_path: PathBuf) -> Self {
        Self {
            id: Uuid::new_v4(),
            content,
            is_from_user: true,
            kind: MessageKind::Audio,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            audio_path: Some(audio_path),
        }
    }

    fn assistant_text(content: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            content,
            is_from_user: false,
            kind: MessageKind::Text,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            audio_path: None,
        }
    }
}

struct EngineInner {
    gate: Arc<dyn PermissionGate>,
    input: tokio::sync::Mutex<Box<dyn AudioInput>>,
    recognizer: Arc<dyn SpeechRecognizer>,
    generator: Arc<dyn ResponseGenerator>,
    speaker: Arc<dyn Speaker>,
    state_tx: watch::Sender<AssistantState>,
    speech_tx: watch::Sender<Option<String>>,
    action_tx: watch::Sender<Option<ChatReply>>,
    error_tx: watch::Sender<Option<String>>,
    history: Mutex<Vec<VoiceMessage>>,
    /// Bumped on every `start_recording`; a background turn only writes state
    /// while its epoch is still current
    epoch: AtomicU64,
}

impl EngineInner {
    fn set_state(&self, state: AssistantState) {
        if state != AssistantState::Speaking {
            self.speech_tx.send_replace(None);
        }
        self.state_tx.send_replace(state);
        tracing::debug!(%state, "assistant state");
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.epoch.load(Ordering::SeqCst) == epoch
    }

    fn set_state_if_current(&self, epoch: u64, state: AssistantState) {
        if self.is_current(epoch) {
            self.set_state(state);
        }
    }

    fn push_message(&self, message: VoiceMessage) {
        if let Ok(mut history) = self.history.lock() {
            history.push(message);
        }
    }
}

/// The orchestrator; cheap to clone and share across tasks
#[derive(Clone)]
pub struct VoiceAssistant {
    inner: Arc<EngineInner>,
}

impl VoiceAssistant {
    /// Assemble an engine from explicit collaborators
    #[must_use]
    pub fn new(
        gate: Arc<dyn PermissionGate>,
        input: Box<dyn AudioInput>,
        recognizer: Arc<dyn SpeechRecognizer>,
        generator: Arc<dyn ResponseGenerator>,
        speaker: Arc<dyn Speaker>,
    ) -> Self {
        let (state_tx, _) = watch::channel(AssistantState::Idle);
        let (speech_tx, _) = watch::channel(None);
        let (action_tx, _) = watch::channel(None);
        let (error_tx, _) = watch::channel(None);
        Self {
            inner: Arc::new(EngineInner {
                gate,
                input: tokio::sync::Mutex::new(input),
                recognizer,
                generator,
                speaker,
                state_tx,
                speech_tx,
                action_tx,
                error_tx,
                history: Mutex::new(Vec::new()),
                epoch: AtomicU64::new(0),
            }),
        }
    }

    /// Wire up the production pipeline from configuration
    ///
    /// # Errors
    ///
    /// Returns error if the local TTS backend is selected but unavailable
    pub fn from_config(config: &Config) -> Result<Self> {
        let playback = Arc::new(AudioPlayback::new());
        let speaker: Arc<dyn Speaker> = match config.tts_backend {
            TtsBackend::Cloud => {
                let synthesis = SpeechSynthesisService::new(
                    Box::new(HttpSynthesisBackend::new(config.tts.clone())),
                    config.tts_cache_dir.clone(),
                    &config.tts,
                );
                Arc::new(CloudSpeaker::new(synthesis, playback))
            }
            TtsBackend::Local => {
                // espeak-ng names Mandarin "cmn"
                let voice = if config.tts.language == "cn" {
                    "cmn"
                } else {
                    config.tts.language.as_str()
                };
                Arc::new(LocalSpeaker::new(voice)?)
            }
        };

        Ok(Self::new(
            Arc::new(HostGate),
            Box::new(AudioCapture::new(config.recordings_dir.clone())),
            Arc::new(Transcriber::new(config.stt.clone())),
            Arc::new(ChatClient::new(&config.chat)),
            speaker,
        ))
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> AssistantState {
        *self.inner.state_tx.borrow()
    }

    /// Watch receiver for state transitions
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<AssistantState> {
        self.inner.state_tx.subscribe()
    }

    /// Watch receiver carrying the text currently being spoken, if any
    #[must_use]
    pub fn subscribe_speech(&self) -> watch::Receiver<Option<String>> {
        self.inner.speech_tx.subscribe()
    }

    /// Watch receiver carrying the latest structured reply (action, emotion)
    #[must_use]
    pub fn subscribe_actions(&self) -> watch::Receiver<Option<ChatReply>> {
        self.inner.action_tx.subscribe()
    }

    /// Watch receiver carrying the most recent turn failure, if any
    ///
    /// Cleared when a new recording starts.
    #[must_use]
    pub fn subscribe_errors(&self) -> watch::Receiver<Option<String>> {
        self.inner.error_tx.subscribe()
    }

    /// Snapshot of the conversation so far
    #[must_use]
    pub fn history(&self) -> Vec<VoiceMessage> {
        self.inner
            .history
            .lock()
            .map(|h| h.clone())
            .unwrap_or_default()
    }

    /// Drop the conversation transcript
    pub fn clear_history(&self) {
        if let Ok(mut history) = self.inner.history.lock() {
            history.clear();
        }
    }

    /// Begin capturing microphone audio
    ///
    /// Idempotent while already listening. Starting while the assistant is
    /// speaking cuts the speech off; the new turn replaces the old one.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PermissionDenied`] when recording is not allowed and
    /// [`Error::RecordingFailed`] when the capture device cannot start.
    pub async fn start_recording(&self) -> Result<()> {
        if self.state() == AssistantState::Listening {
            return Ok(());
        }

        if !self.inner.gate.can_record_audio() {
            let err = Error::PermissionDenied("microphone access denied".to_string());
            self.inner.error_tx.send_replace(Some(err.to_string()));
            self.inner.set_state(AssistantState::Error);
            return Err(err);
        }

        // Stop-and-replace: a new turn supersedes whatever was in flight
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        self.inner.speaker.stop().await;
        self.inner.error_tx.send_replace(None);

        let mut input = self.inner.input.lock().await;
        if let Err(e) = input.start() {
            self.inner.error_tx.send_replace(Some(e.to_string()));
            self.inner.set_state(AssistantState::Idle);
            return Err(e);
        }

        self.inner.set_state(AssistantState::Listening);
        tracing::info!("recording started");
        Ok(())
    }

    /// Stop capturing and kick off the background turn
    ///
    /// Returns the recorded artifact, or `Ok(None)` when nothing was being
    /// recorded.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EmptyArtifact`] when the capture produced no samples.
    pub async fn stop_recording(&self) -> Result<Option<RecordedAudio>> {
        if self.state() != AssistantState::Listening {
            // An explicit action resolves the error state back to idle
            if self.state() == AssistantState::Error {
                self.inner.set_state(AssistantState::Idle);
            }
            return Ok(None);
        }

        let stopped = {
            let mut input = self.inner.input.lock().await;
            input.stop()
        };

        let recorded = match stopped {
            Ok(Some(recorded)) => recorded,
            Ok(None) => {
                let err = Error::EmptyArtifact;
                self.inner.error_tx.send_replace(Some(err.to_string()));
                self.inner.set_state(AssistantState::Idle);
                return Err(err);
            }
            Err(e) => {
                self.inner.error_tx.send_replace(Some(e.to_string()));
                self.inner.set_state(AssistantState::Idle);
                return Err(e);
            }
        };

        tracing::info!(
            duration_ms = recorded.duration_ms,
            samples = recorded.sample_count,
            "recording stopped"
        );

        self.inner.set_state(AssistantState::Processing);
        let inner = Arc::clone(&self.inner);
        let epoch = inner.epoch.load(Ordering::SeqCst);
        let audio = recorded.clone();
        tokio::spawn(async move {
            if let Err(e) = run_turn(&inner, epoch, audio).await {
                tracing::warn!(error = %e, "turn failed");
                // A filtered reply is a silent no-op turn, not a surfaced error
                if !matches!(e, Error::FilteredEmpty) && inner.is_current(epoch) {
                    inner.error_tx.send_replace(Some(e.to_string()));
                }
                let next = if e.needs_intervention() {
                    AssistantState::Error
                } else {
                    AssistantState::Idle
                };
                inner.set_state_if_current(epoch, next);
            }
        });

        Ok(Some(recorded))
    }

    /// Speak `text` directly, bypassing transcription and the reply filter
    ///
    /// # Errors
    ///
    /// Returns error if synthesis or playback fails.
    pub async fn say(&self, text: &str) -> Result<()> {
        let epoch = self.inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.speaker.stop().await;
        self.inner
            .push_message(VoiceMessage::assistant_text(text.to_string()));
        self.inner.set_state(AssistantState::Speaking);
        self.inner.speech_tx.send_replace(Some(text.to_string()));
        let outcome = self.inner.speaker.speak(text).await;
        // A recording started mid-speech owns the state now; leave it alone
        self.inner.set_state_if_current(epoch, AssistantState::Idle);
        outcome
    }

    /// Cut off any in-flight speech; safe when nothing is playing
    pub async fn stop_speaking(&self) {
        self.inner.speaker.stop().await;
        if matches!(
            self.state(),
            AssistantState::Speaking | AssistantState::Error
        ) {
            self.inner.set_state(AssistantState::Idle);
        }
    }
}

/// One background turn: transcribe, generate, filter, speak
async fn run_turn(inner: &Arc<EngineInner>, epoch: u64, audio: RecordedAudio) -> Result<()> {
    let transcript = timeout(REQUEST_TIMEOUT, inner.recognizer.transcribe(&audio))
        .await
        .map_err(|_| Error::Timeout(REQUEST_TIMEOUT))??;

    if transcript.trim().is_empty() {
        return Err(Error::NoTranscript);
    }

    // A newer recording supersedes this turn; drop it without speaking
    if !inner.is_current(epoch) {
        tracing::debug!(%transcript, "turn superseded after transcription");
        return Ok(());
    }

    tracing::info!(%transcript, "transcribed");
    inner.push_message(VoiceMessage::user_audio(
        transcript.clone(),
        audio.path.clone(),
    ));

    let reply = timeout(REQUEST_TIMEOUT, inner.generator.generate(&transcript))
        .await
        .map_err(|_| Error::Timeout(REQUEST_TIMEOUT))??;

    if !inner.is_current(epoch) {
        tracing::debug!("turn superseded after generation");
        return Ok(());
    }

    let speakable = filter_reply(&reply.message);
    if speakable.is_empty() {
        tracing::debug!("reply suppressed by filter");
        return Err(Error::FilteredEmpty);
    }

    inner.push_message(VoiceMessage::assistant_text(speakable.clone()));
    inner.action_tx.send_replace(Some(reply));

    inner.set_state_if_current(epoch, AssistantState::Speaking);
    if inner.is_current(epoch) {
        inner.speech_tx.send_replace(Some(speakable.clone()));
        inner.speaker.speak(&speakable).await?;
    }
    inner.set_state_if_current(epoch, AssistantState::Idle);
    Ok(())
}
