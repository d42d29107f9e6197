//! Engine state machine integration tests
//!
//! The engine is exercised end to end with scripted collaborators; no audio
//! hardware or network is touched.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tidybot_voice::chat::{ChatReply, ResponseGenerator};
use tidybot_voice::voice::{AudioInput, RecordedAudio, Speaker, SpeechRecognizer};
use tidybot_voice::{AssistantState, Error, PermissionGate, Result, VoiceAssistant};

struct AllowGate;

impl PermissionGate for AllowGate {
    fn can_record_audio(&self) -> bool {
        true
    }
    fn can_modify_audio_settings(&self) -> bool {
        true
    }
}

struct DenyGate;

impl PermissionGate for DenyGate {
    fn can_record_audio(&self) -> bool {
        false
    }
    fn can_modify_audio_settings(&self) -> bool {
        false
    }
}

/// Scripted microphone: start counts calls, stop yields a canned artifact
struct ScriptedInput {
    recording: bool,
    starts: Arc<AtomicUsize>,
    artifact: Option<RecordedAudio>,
}

impl ScriptedInput {
    fn new(artifact: Option<RecordedAudio>) -> (Self, Arc<AtomicUsize>) {
        let starts = Arc::new(AtomicUsize::new(0));
        (
            Self {
                recording: false,
                starts: Arc::clone(&starts),
                artifact,
            },
            starts,
        )
    }
}

impl AudioInput for ScriptedInput {
    fn start(&mut self) -> Result<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.recording = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<Option<RecordedAudio>> {
        if !self.recording {
            return Ok(None);
        }
        self.recording = false;
        Ok(self.artifact.clone())
    }

    fn is_recording(&self) -> bool {
        self.recording
    }
}

struct FixedRecognizer(&'static str);

#[async_trait]
impl SpeechRecognizer for FixedRecognizer {
    async fn transcribe(&self, _audio: &RecordedAudio) -> Result<String> {
        Ok(self.0.to_string())
    }
}

struct FailingRecognizer;

#[async_trait]
impl SpeechRecognizer for FailingRecognizer {
    async fn transcribe(&self, _audio: &RecordedAudio) -> Result<String> {
        Err(Error::NoTranscript)
    }
}

struct CannedGenerator(ChatReply);

#[async_trait]
impl ResponseGenerator for CannedGenerator {
    async fn generate(&self, _query: &str) -> Result<ChatReply> {
        Ok(self.0.clone())
    }
}

/// Canned reply delivered after a delay, keeping the turn in flight
struct SlowGenerator {
    reply: ChatReply,
    delay_ms: u64,
}

#[async_trait]
impl ResponseGenerator for SlowGenerator {
    async fn generate(&self, _query: &str) -> Result<ChatReply> {
        tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
        Ok(self.reply.clone())
    }
}

/// Records everything spoken; never touches audio hardware
#[derive(Default)]
struct RecordingSpeaker {
    spoken: std::sync::Mutex<Vec<String>>,
    stops: AtomicUsize,
    delay_ms: u64,
}

#[async_trait]
impl Speaker for &'static RecordingSpeaker {
    async fn speak(&self, text: &str) -> Result<()> {
        self.spoken.lock().unwrap().push(text.to_string());
        if self.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
        }
        Ok(())
    }

    async fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

fn artifact() -> RecordedAudio {
    RecordedAudio {
        path: PathBuf::from("turn.wav"),
        sample_count: 16000,
        duration_ms: 1000,
    }
}

fn reply(message: &str) -> ChatReply {
    ChatReply {
        message: message.to_string(),
        ..ChatReply::default()
    }
}

fn engine_with(
    gate: Arc<dyn PermissionGate>,
    input: Box<dyn AudioInput>,
    recognizer: Arc<dyn SpeechRecognizer>,
    generator: Arc<dyn ResponseGenerator>,
) -> (VoiceAssistant, &'static RecordingSpeaker) {
    let speaker: &'static RecordingSpeaker = Box::leak(Box::default());
    let engine = VoiceAssistant::new(gate, input, recognizer, generator, Arc::new(speaker));
    (engine, speaker)
}

/// Poll until the engine settles back to idle
async fn wait_for_idle(engine: &VoiceAssistant) {
    for _ in 0..100 {
        if engine.state() == AssistantState::Idle {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("engine did not settle to idle, stuck in {}", engine.state());
}

#[tokio::test]
async fn denied_permission_enters_error_state() {
    let (input, _) = ScriptedInput::new(Some(artifact()));
    let (engine, _) = engine_with(
        Arc::new(DenyGate),
        Box::new(input),
        Arc::new(FixedRecognizer("开始清洁")),
        Arc::new(CannedGenerator(reply("好的"))),
    );

    let err = engine.start_recording().await.unwrap_err();
    assert!(matches!(err, Error::PermissionDenied(_)));
    assert!(err.needs_intervention());
    assert_eq!(engine.state(), AssistantState::Error);

    // The next explicit action resolves the error state back to idle
    assert!(engine.stop_recording().await.unwrap().is_none());
    assert_eq!(engine.state(), AssistantState::Idle);
}

#[tokio::test]
async fn start_while_listening_is_idempotent() {
    let (input, starts) = ScriptedInput::new(Some(artifact()));
    let (engine, _) = engine_with(
        Arc::new(AllowGate),
        Box::new(input),
        Arc::new(FixedRecognizer("开始清洁")),
        Arc::new(CannedGenerator(reply("好的"))),
    );

    engine.start_recording().await.unwrap();
    engine.start_recording().await.unwrap();
    engine.start_recording().await.unwrap();

    assert_eq!(starts.load(Ordering::SeqCst), 1);
    assert_eq!(engine.state(), AssistantState::Listening);
}

#[tokio::test]
async fn stop_when_idle_is_a_noop() {
    let (input, _) = ScriptedInput::new(Some(artifact()));
    let (engine, speaker) = engine_with(
        Arc::new(AllowGate),
        Box::new(input),
        Arc::new(FixedRecognizer("开始清洁")),
        Arc::new(CannedGenerator(reply("好的"))),
    );

    let out = engine.stop_recording().await.unwrap();
    assert!(out.is_none());
    assert_eq!(engine.state(), AssistantState::Idle);
    assert!(speaker.spoken.lock().unwrap().is_empty());
    assert!(engine.history().is_empty());
}

#[tokio::test]
async fn empty_capture_returns_to_idle() {
    let (input, _) = ScriptedInput::new(None);
    let (engine, speaker) = engine_with(
        Arc::new(AllowGate),
        Box::new(input),
        Arc::new(FixedRecognizer("开始清洁")),
        Arc::new(CannedGenerator(reply("好的"))),
    );

    engine.start_recording().await.unwrap();
    let err = engine.stop_recording().await.unwrap_err();
    assert!(matches!(err, Error::EmptyArtifact));
    assert_eq!(engine.state(), AssistantState::Idle);
    assert!(speaker.spoken.lock().unwrap().is_empty());
}

#[tokio::test]
async fn full_turn_speaks_reply_and_records_history() {
    let (input, _) = ScriptedInput::new(Some(artifact()));
    let (engine, speaker) = engine_with(
        Arc::new(AllowGate),
        Box::new(input),
        Arc::new(FixedRecognizer("帮我打扫客厅")),
        Arc::new(CannedGenerator(reply("好的，我这就开始打扫客厅。"))),
    );

    engine.start_recording().await.unwrap();
    assert_eq!(engine.state(), AssistantState::Listening);

    let recorded = engine.stop_recording().await.unwrap().unwrap();
    assert_eq!(recorded.duration_ms, 1000);

    wait_for_idle(&engine).await;

    let spoken = speaker.spoken.lock().unwrap().clone();
    assert_eq!(spoken, vec!["好的，我这就开始打扫客厅。"]);

    let history = engine.history();
    assert_eq!(history.len(), 2);
    assert!(history[0].is_from_user);
    assert_eq!(history[0].content, "帮我打扫客厅");
    assert!(!history[1].is_from_user);
    assert_eq!(history[1].content, "好的，我这就开始打扫客厅。");
    assert!(history[0].timestamp_ms <= history[1].timestamp_ms);
}

#[tokio::test]
async fn transcription_failure_settles_to_idle() {
    let (input, _) = ScriptedInput::new(Some(artifact()));
    let (engine, speaker) = engine_with(
        Arc::new(AllowGate),
        Box::new(input),
        Arc::new(FailingRecognizer),
        Arc::new(CannedGenerator(reply("好的"))),
    );

    let errors = engine.subscribe_errors();

    engine.start_recording().await.unwrap();
    engine.stop_recording().await.unwrap();

    wait_for_idle(&engine).await;
    assert!(speaker.spoken.lock().unwrap().is_empty());
    assert!(engine.history().is_empty());
    assert!(errors.borrow().is_some());
}

#[tokio::test]
async fn protocol_reply_is_silently_dropped() {
    let (input, _) = ScriptedInput::new(Some(artifact()));
    let (engine, speaker) = engine_with(
        Arc::new(AllowGate),
        Box::new(input),
        Arc::new(FixedRecognizer("开始清洁")),
        Arc::new(CannedGenerator(reply(
            r#"{"name": "start_clean", "arguments": {}}"#,
        ))),
    );

    let errors = engine.subscribe_errors();

    engine.start_recording().await.unwrap();
    engine.stop_recording().await.unwrap();

    wait_for_idle(&engine).await;

    // Nothing spoken, no surfaced error, and only the user side of the turn kept
    assert!(speaker.spoken.lock().unwrap().is_empty());
    assert!(errors.borrow().is_none());
    let history = engine.history();
    assert_eq!(history.len(), 1);
    assert!(history[0].is_from_user);
}

#[tokio::test]
async fn action_reply_is_published() {
    let (input, _) = ScriptedInput::new(Some(artifact()));
    let action = ChatReply {
        message: "好的，我来帮您启动扫地机器人开始清洁。".to_string(),
        action_type: "start_clean".to_string(),
        action_params: serde_json::json!({ "mode": "auto" }),
        emotion_type: "happy".to_string(),
    };
    let (engine, _) = engine_with(
        Arc::new(AllowGate),
        Box::new(input),
        Arc::new(FixedRecognizer("开始清洁")),
        Arc::new(CannedGenerator(action)),
    );

    let mut actions = engine.subscribe_actions();

    engine.start_recording().await.unwrap();
    engine.stop_recording().await.unwrap();
    wait_for_idle(&engine).await;

    let published = actions.borrow_and_update().clone().expect("action published");
    assert_eq!(published.action_type, "start_clean");
    assert_eq!(published.action_params["mode"], "auto");
}

#[tokio::test]
async fn speech_observable_tracks_the_spoken_reply() {
    let (input, _) = ScriptedInput::new(Some(artifact()));
    // Slow speaker keeps the engine in its speaking state long enough to observe
    let speaker: &'static RecordingSpeaker = Box::leak(Box::new(RecordingSpeaker {
        delay_ms: 500,
        ..RecordingSpeaker::default()
    }));
    let engine = VoiceAssistant::new(
        Arc::new(AllowGate),
        Box::new(input),
        Arc::new(FixedRecognizer("开始清洁")),
        Arc::new(CannedGenerator(reply("好的，现在开始清洁。"))),
        Arc::new(speaker),
    );

    let mut speech = engine.subscribe_speech();
    assert!(speech.borrow().is_none());

    engine.start_recording().await.unwrap();
    engine.stop_recording().await.unwrap();

    // The spoken text is published while speaking
    let mut saw_text = false;
    for _ in 0..100 {
        if speech
            .borrow_and_update()
            .as_deref()
            .is_some_and(|t| t == "好的，现在开始清洁。")
        {
            saw_text = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(saw_text);

    // And cleared once the turn settles
    wait_for_idle(&engine).await;
    assert!(speech.borrow().is_none());
}

#[tokio::test]
async fn say_bypasses_the_reply_filter() {
    let (input, _) = ScriptedInput::new(Some(artifact()));
    let (engine, speaker) = engine_with(
        Arc::new(AllowGate),
        Box::new(input),
        Arc::new(FixedRecognizer("开始清洁")),
        Arc::new(CannedGenerator(reply("好的"))),
    );

    // Short text the filter would reject is still spoken verbatim
    engine.say("嗯。").await.unwrap();

    assert_eq!(engine.state(), AssistantState::Idle);
    let spoken = speaker.spoken.lock().unwrap().clone();
    assert_eq!(spoken, vec!["嗯。"]);
    assert_eq!(engine.history().len(), 1);
}

#[tokio::test]
async fn stop_speaking_when_silent_is_safe() {
    let (input, _) = ScriptedInput::new(Some(artifact()));
    let (engine, speaker) = engine_with(
        Arc::new(AllowGate),
        Box::new(input),
        Arc::new(FixedRecognizer("开始清洁")),
        Arc::new(CannedGenerator(reply("好的"))),
    );

    engine.stop_speaking().await;
    engine.stop_speaking().await;

    assert_eq!(engine.state(), AssistantState::Idle);
    assert!(speaker.stops.load(Ordering::SeqCst) >= 2);
}

#[tokio::test]
async fn new_recording_cuts_off_speech() {
    let (input, _) = ScriptedInput::new(Some(artifact()));
    let (engine, speaker) = engine_with(
        Arc::new(AllowGate),
        Box::new(input),
        Arc::new(FixedRecognizer("开始清洁")),
        Arc::new(CannedGenerator(reply("好的"))),
    );

    engine.start_recording().await.unwrap();
    assert_eq!(speaker.stops.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn new_recording_supersedes_an_in_flight_turn() {
    let (input, _) = ScriptedInput::new(Some(artifact()));
    let (engine, speaker) = engine_with(
        Arc::new(AllowGate),
        Box::new(input),
        Arc::new(FixedRecognizer("帮我打扫客厅")),
        Arc::new(SlowGenerator {
            reply: reply("好的，我这就开始打扫客厅。"),
            delay_ms: 200,
        }),
    );

    engine.start_recording().await.unwrap();
    engine.stop_recording().await.unwrap();
    assert_eq!(engine.state(), AssistantState::Processing);

    // A second recording starts while the first turn is still generating
    tokio::time::sleep(Duration::from_millis(50)).await;
    engine.start_recording().await.unwrap();
    assert_eq!(engine.state(), AssistantState::Listening);

    // The stale turn finishes in the background without speaking or
    // touching the live capture session
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(engine.state(), AssistantState::Listening);
    assert!(speaker.spoken.lock().unwrap().is_empty());
    assert!(engine.history().iter().all(|m| m.is_from_user));

    assert!(engine.stop_recording().await.unwrap().is_some());
}

#[tokio::test]
async fn recording_during_say_keeps_the_mic_session() {
    let (input, _) = ScriptedInput::new(Some(artifact()));
    let speaker: &'static RecordingSpeaker = Box::leak(Box::new(RecordingSpeaker {
        delay_ms: 300,
        ..RecordingSpeaker::default()
    }));
    let engine = VoiceAssistant::new(
        Arc::new(AllowGate),
        Box::new(input),
        Arc::new(FixedRecognizer("开始清洁")),
        Arc::new(CannedGenerator(reply("好的"))),
        Arc::new(speaker),
    );

    let announcer = engine.clone();
    let handle = tokio::spawn(async move { announcer.say("现在开始清洁任务。").await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    engine.start_recording().await.unwrap();
    assert_eq!(engine.state(), AssistantState::Listening);

    handle.await.unwrap().unwrap();

    // The finished announcement must not reclaim the state from the capture
    assert_eq!(engine.state(), AssistantState::Listening);
    assert!(engine.stop_recording().await.unwrap().is_some());
}

#[tokio::test]
async fn clear_history_empties_the_transcript() {
    let (input, _) = ScriptedInput::new(Some(artifact()));
    let (engine, _) = engine_with(
        Arc::new(AllowGate),
        Box::new(input),
        Arc::new(FixedRecognizer("开始清洁")),
        Arc::new(CannedGenerator(reply("好的，现在开始清洁。"))),
    );

    engine.start_recording().await.unwrap();
    engine.stop_recording().await.unwrap();
    wait_for_idle(&engine).await;
    assert!(!engine.history().is_empty());

    engine.clear_history();
    assert!(engine.history().is_empty());
}
