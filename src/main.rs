use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use tidybot_voice::voice::{AudioCapture, AudioInput, AudioPlayback, SpeechSynthesisService};
use tidybot_voice::{AssistantState, Config, VoiceAssistant};

/// Tidybot - push-to-talk voice assistant for the home robot
#[derive(Parser)]
#[command(name = "tidybot", version, about)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Test speaker output
    TestSpeaker,
    /// Speak a line of text through the configured backend
    Say {
        /// Text to speak
        #[arg(default_value = "你好，我是清洁机器人。")]
        text: String,
    },
    /// Remove all cached synthesis artifacts
    ClearCache,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "info,tidybot_voice=info",
        1 => "info,tidybot_voice=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load()?;

    if let Some(cmd) = cli.command {
        return match cmd {
            Command::TestMic { duration } => test_mic(&config, duration).await,
            Command::TestSpeaker => test_speaker().await,
            Command::Say { text } => say(&config, &text).await,
            Command::ClearCache => clear_cache(&config),
        };
    }

    interactive(&config).await
}

/// Push-to-talk loop: Enter toggles recording, `q` quits
async fn interactive(config: &Config) -> anyhow::Result<()> {
    let engine = VoiceAssistant::from_config(config)?;

    // Echo state transitions so the user sees where a turn is
    let mut state_rx = engine.subscribe_state();
    tokio::spawn(async move {
        while state_rx.changed().await.is_ok() {
            let state = *state_rx.borrow_and_update();
            println!("  [{state}]");
        }
    });

    println!("Tidybot ready. Press Enter to start/stop recording, q to quit.");

    loop {
        let (read, line) = tokio::task::spawn_blocking(|| {
            let mut buf = String::new();
            let n = std::io::stdin().read_line(&mut buf);
            (n, buf)
        })
        .await?;

        match read {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => anyhow::bail!("stdin read failed: {e}"),
        }

        let trimmed = line.trim();
        if trimmed.eq_ignore_ascii_case("q") || trimmed.eq_ignore_ascii_case("quit") {
            break;
        }

        if engine.state() == AssistantState::Listening {
            match engine.stop_recording().await {
                Ok(Some(recorded)) => {
                    println!("  captured {} ms of audio", recorded.duration_ms);
                }
                Ok(None) => {}
                Err(e) => println!("  {e}"),
            }
        } else if let Err(e) = engine.start_recording().await {
            println!("  {e}");
        }
    }

    engine.stop_speaking().await;
    Ok(())
}

/// Record for `duration` seconds, then report level statistics from the artifact
async fn test_mic(config: &Config, duration: u64) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let mut capture = AudioCapture::new(config.recordings_dir.clone());
    capture.start()?;
    tokio::time::sleep(Duration::from_secs(duration)).await;

    let Some(recorded) = capture.stop()? else {
        anyhow::bail!("no audio captured; check your input device");
    };

    let mut reader = hound::WavReader::open(&recorded.path)?;
    let samples: Vec<f32> = reader
        .samples::<i16>()
        .map(|s| f32::from(s.unwrap_or(0)) / f32::from(i16::MAX))
        .collect();

    let rms = calculate_rms(&samples);
    let peak = samples.iter().map(|s| s.abs()).fold(0.0_f32, f32::max);

    println!("Captured {} ms ({} samples)", recorded.duration_ms, recorded.sample_count);
    println!("RMS: {rms:.4} | Peak: {peak:.4}");
    println!("\n---");
    println!("If RMS stayed near 0, check:");
    println!("  1. Is your mic plugged in?");
    println!("  2. Run: pactl info | grep 'Default Source'");
    println!("  3. Run: arecord -l (to list devices)");

    Ok(())
}

/// Calculate RMS energy
#[allow(clippy::cast_precision_loss)]
fn calculate_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}

/// Play a 440 Hz tone for 2 seconds through the playback path
async fn test_speaker() -> anyhow::Result<()> {
    println!("Testing speaker output...");
    println!("You should hear a 440Hz tone for 2 seconds\n");

    let sample_rate = 24000_u32;
    let frequency = 440.0_f32;
    let num_samples = (sample_rate * 2) as usize;

    #[allow(clippy::cast_precision_loss)]
    let samples: Vec<i16> = (0..num_samples)
        .map(|i| {
            let t = i as f32 / sample_rate as f32;
            let v = (2.0 * std::f32::consts::PI * frequency * t).sin() * 0.3;
            #[allow(clippy::cast_possible_truncation)]
            let s = (v * f32::from(i16::MAX)) as i16;
            s
        })
        .collect();

    // Write the tone as a WAV artifact and run it through the normal pipeline
    let dir = tempfile::tempdir()?;
    let tone = dir.path().join("tone.wav");
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(&tone, spec)?;
    for s in samples {
        writer.write_sample(s)?;
    }
    writer.finalize()?;

    let playback = AudioPlayback::new();
    playback.play(&tone).await?;

    println!("\n---");
    println!("If you heard the tone, your speakers are working!");
    println!("If you didn't hear anything, check:");
    println!("  1. Run: pactl info | grep 'Default Sink'");
    println!("  2. Run: pactl list sinks short");

    Ok(())
}

/// Speak `text` through the configured backend, bypassing the reply filter
async fn say(config: &Config, text: &str) -> anyhow::Result<()> {
    let engine = VoiceAssistant::from_config(config)?;
    println!("Speaking: \"{text}\"");
    engine.say(text).await?;
    Ok(())
}

/// Drop every cached synthesis artifact
fn clear_cache(config: &Config) -> anyhow::Result<()> {
    use tidybot_voice::voice::HttpSynthesisBackend;

    let service = SpeechSynthesisService::new(
        Box::new(HttpSynthesisBackend::new(config.tts.clone())),
        config.tts_cache_dir.clone(),
        &config.tts,
    );
    let removed = service.clear_cache()?;
    println!("Removed {removed} cached artifact(s)");
    Ok(())
}
