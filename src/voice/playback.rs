//! Audio playback to speakers
//!
//! At most one playback session exists at a time; starting a new one stops
//! and releases the previous session first. A session always settles — on
//! device error the play call returns instead of hanging, so the engine can
//! never be stranded in its speaking state.

use std::io::Cursor;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};

use crate::{Error, Result};

/// Preferred playback rate (matches the synthesis provider output)
const PLAYBACK_SAMPLE_RATE: u32 = 24000;

/// Plays synthesized artifacts on the default output device
pub struct AudioPlayback {
    current: Mutex<Option<Arc<AtomicBool>>>,
}

impl Default for AudioPlayback {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioPlayback {
    /// Create a playback controller
    #[must_use]
    pub fn new() -> Self {
        Self {
            current: Mutex::new(None),
        }
    }

    /// Play an MP3 or WAV artifact to completion
    ///
    /// Resolves when playback finishes, is stopped, or fails.
    ///
    /// # Errors
    ///
    /// Returns error if the artifact cannot be decoded or the output device
    /// cannot be opened
    pub async fn play(&self, artifact: &Path) -> Result<()> {
        let bytes = std::fs::read(artifact)?;
        let (samples, rate) = decode_artifact(artifact, &bytes)?;
        let samples = super::resample(&samples, rate, PLAYBACK_SAMPLE_RATE)
            .map_err(|e| Error::Playback(e.to_string()))?;

        // Stop-and-replace: tear down any prior session first
        let cancel = Arc::new(AtomicBool::new(false));
        {
            let mut current = self.current.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            if let Some(prior) = current.replace(Arc::clone(&cancel)) {
                prior.store(true, Ordering::SeqCst);
            }
        }

        let flag = Arc::clone(&cancel);
        let result = tokio::task::spawn_blocking(move || play_samples_blocking(&samples, &flag))
            .await
            .map_err(|e| Error::Playback(format!("playback task failed: {e}")))?;

        // Clear the slot only if it still belongs to this session
        let mut current = self.current.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if current
            .as_ref()
            .is_some_and(|active| Arc::ptr_eq(active, &cancel))
        {
            *current = None;
        }

        result
    }

    /// Stop the active session; safe no-op when nothing is playing
    pub fn stop(&self) {
        let mut current = self.current.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(active) = current.take() {
            active.store(true, Ordering::SeqCst);
            tracing::debug!("playback stopped");
        }
    }
}

/// Play mono samples, polling for completion or cancellation
fn play_samples_blocking(samples: &[f32], cancel: &Arc<AtomicBool>) -> Result<()> {
    if samples.is_empty() {
        return Ok(());
    }

    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| Error::Playback("no output device".to_string()))?;

    let config = output_config(&device)?;
    let channels = usize::from(config.channels);

    let shared: Arc<[f32]> = samples.into();
    let position = Arc::new(Mutex::new(0usize));
    let finished = Arc::new(AtomicBool::new(false));

    let cb_samples = Arc::clone(&shared);
    let cb_position = Arc::clone(&position);
    let cb_finished = Arc::clone(&finished);

    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let Ok(mut pos) = cb_position.lock() else {
                    return;
                };
                for frame in data.chunks_mut(channels) {
                    let sample = if *pos < cb_samples.len() {
                        let s = cb_samples[*pos];
                        *pos += 1;
                        s
                    } else {
                        cb_finished.store(true, Ordering::SeqCst);
                        0.0
                    };
                    for out in frame.iter_mut() {
                        *out = sample;
                    }
                }
            },
            |err| tracing::error!(error = %err, "audio playback error"),
            None,
        )
        .map_err(|e| Error::Playback(e.to_string()))?;

    stream.play().map_err(|e| Error::Playback(e.to_string()))?;

    let duration_ms = shared.len() as u64 * 1000 / u64::from(PLAYBACK_SAMPLE_RATE);
    let deadline = std::time::Instant::now() + std::time::Duration::from_millis(duration_ms + 500);

    while !finished.load(Ordering::SeqCst) && !cancel.load(Ordering::SeqCst) {
        if std::time::Instant::now() > deadline {
            break;
        }
        std::thread::sleep(std::time::Duration::from_millis(50));
    }

    // Let the device drain the final buffer
    if !cancel.load(Ordering::SeqCst) {
        std::thread::sleep(std::time::Duration::from_millis(100));
    }

    drop(stream);
    tracing::debug!(samples = shared.len(), "playback complete");
    Ok(())
}

/// Pick a mono (or stereo fallback) output config at the playback rate
fn output_config(device: &cpal::Device) -> Result<StreamConfig> {
    let supported = device
        .supported_output_configs()
        .map_err(|e| Error::Playback(e.to_string()))?
        .find(|c| {
            c.channels() == 1
                && c.min_sample_rate() <= SampleRate(PLAYBACK_SAMPLE_RATE)
                && c.max_sample_rate() >= SampleRate(PLAYBACK_SAMPLE_RATE)
        })
        .or_else(|| {
            device.supported_output_configs().ok()?.find(|c| {
                c.channels() == 2
                    && c.min_sample_rate() <= SampleRate(PLAYBACK_SAMPLE_RATE)
                    && c.max_sample_rate() >= SampleRate(PLAYBACK_SAMPLE_RATE)
            })
        })
        .ok_or_else(|| Error::Playback("no suitable output config".to_string()))?;

    Ok(supported
        .with_sample_rate(SampleRate(PLAYBACK_SAMPLE_RATE))
        .config())
}

/// Decode an artifact to mono f32 samples plus its source rate
fn decode_artifact(path: &Path, bytes: &[u8]) -> Result<(Vec<f32>, u32)> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("mp3") => decode_mp3(bytes),
        Some("wav") => decode_wav(bytes),
        other => Err(Error::Playback(format!(
            "unsupported artifact format: {other:?}"
        ))),
    }
}

/// Decode MP3 bytes to mono f32 samples
fn decode_mp3(data: &[u8]) -> Result<(Vec<f32>, u32)> {
    let mut decoder = minimp3::Decoder::new(Cursor::new(data));
    let mut samples = Vec::new();
    let mut rate = PLAYBACK_SAMPLE_RATE;

    loop {
        match decoder.next_frame() {
            Ok(frame) => {
                #[allow(clippy::cast_sign_loss)]
                {
                    rate = frame.sample_rate as u32;
                }
                if frame.channels == 2 {
                    samples.extend(frame.data.chunks(2).map(|chunk| {
                        let left = f32::from(chunk[0]) / 32768.0;
                        let right = f32::from(chunk.get(1).copied().unwrap_or(chunk[0])) / 32768.0;
                        f32::midpoint(left, right)
                    }));
                } else {
                    samples.extend(frame.data.iter().map(|&s| f32::from(s) / 32768.0));
                }
            }
            Err(minimp3::Error::Eof) => break,
            Err(e) => return Err(Error::Playback(format!("MP3 decode error: {e}"))),
        }
    }

    Ok((samples, rate))
}

/// Decode WAV bytes to mono f32 samples
fn decode_wav(data: &[u8]) -> Result<(Vec<f32>, u32)> {
    let mut reader = hound::WavReader::new(Cursor::new(data))
        .map_err(|e| Error::Playback(format!("WAV decode error: {e}")))?;
    let spec = reader.spec();

    let mono: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Int => {
            let samples: Vec<f32> = reader
                .samples::<i16>()
                .map(|s| s.map(|v| f32::from(v) / 32768.0))
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| Error::Playback(format!("WAV decode error: {e}")))?;
            mixdown(&samples, spec.channels)
        }
        hound::SampleFormat::Float => {
            let samples: Vec<f32> = reader
                .samples::<f32>()
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| Error::Playback(format!("WAV decode error: {e}")))?;
            mixdown(&samples, spec.channels)
        }
    };

    Ok((mono, spec.sample_rate))
}

#[allow(clippy::cast_precision_loss)]
fn mixdown(samples: &[f32], channels: u16) -> Vec<f32> {
    if channels <= 1 {
        return samples.to_vec();
    }
    samples
        .chunks(usize::from(channels))
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}
