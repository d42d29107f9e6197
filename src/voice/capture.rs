//! Audio capture from microphone
//!
//! The cpal stream is not `Send`, so it lives on a dedicated thread owned by
//! the active recording; stopping joins that thread, which guarantees the
//! hardware is released on every exit path.

use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, SampleRate, StreamConfig};

use crate::{Error, Result};

/// Sample rate expected by the transcription provider (mono 16 kHz)
pub const SAMPLE_RATE: u32 = 16000;

/// How long to wait for the capture thread to report stream startup
const STREAM_READY_TIMEOUT: Duration = Duration::from_secs(3);

/// A finished recording artifact
#[derive(Debug, Clone)]
pub struct RecordedAudio {
    /// Path to the WAV file (overwritten by the next recording)
    pub path: PathBuf,

    /// Number of mono 16 kHz samples
    pub sample_count: usize,

    /// Approximate recording duration
    pub duration_ms: u64,
}

/// Microphone source for the engine
///
/// Object-safe so tests can substitute scripted audio for real hardware.
pub trait AudioInput: Send {
    /// Begin capturing; fails if already recording or hardware is unavailable
    fn start(&mut self) -> Result<()>;

    /// Finish capturing and return the artifact, `None` when it is empty.
    /// Safe to call when not recording (no-op returning `Ok(None)`).
    fn stop(&mut self) -> Result<Option<RecordedAudio>>;

    /// Whether a capture session is active
    fn is_recording(&self) -> bool;
}

/// Stream configuration tier chosen for a capture session
#[derive(Debug, Clone)]
struct CaptureTier {
    config: StreamConfig,
    format: SampleFormat,
}

struct ActiveRecording {
    buffer: Arc<Mutex<Vec<f32>>>,
    stop_tx: mpsc::Sender<()>,
    handle: std::thread::JoinHandle<()>,
    source_rate: u32,
    source_channels: u16,
}

/// Captures audio from the default input device into a WAV artifact
pub struct AudioCapture {
    recordings_dir: PathBuf,
    active: Option<ActiveRecording>,
}

impl AudioCapture {
    /// Create a capture controller writing artifacts under `recordings_dir`
    #[must_use]
    pub fn new(recordings_dir: PathBuf) -> Self {
        Self {
            recordings_dir,
            active: None,
        }
    }

    /// Preferred tier: a native mono 16 kHz stream
    fn preferred_tier() -> Result<Option<CaptureTier>> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| Error::HardwareUnavailable("no input device".to_string()))?;

        let found = device
            .supported_input_configs()
            .map_err(|e| Error::HardwareUnavailable(e.to_string()))?
            .find(|c| {
                c.channels() == 1
                    && c.min_sample_rate() <= SampleRate(SAMPLE_RATE)
                    && c.max_sample_rate() >= SampleRate(SAMPLE_RATE)
            });

        Ok(found.map(|c| {
            let format = c.sample_format();
            CaptureTier {
                config: c.with_sample_rate(SampleRate(SAMPLE_RATE)).config(),
                format,
            }
        }))
    }

    /// Baseline tier: whatever the device opens by default, converted later
    fn baseline_tier() -> Result<CaptureTier> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| Error::HardwareUnavailable("no input device".to_string()))?;

        let default = device
            .default_input_config()
            .map_err(|e| Error::HardwareUnavailable(e.to_string()))?;

        Ok(CaptureTier {
            format: default.sample_format(),
            config: default.config(),
        })
    }

    /// Spawn the thread that owns the stream for one session
    fn spawn_session(tier: CaptureTier) -> Result<ActiveRecording> {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let (ready_tx, ready_rx) = mpsc::channel::<std::result::Result<(), String>>();

        let source_rate = tier.config.sample_rate.0;
        let source_channels = tier.config.channels;
        let thread_buffer = Arc::clone(&buffer);

        let handle = std::thread::spawn(move || {
            let host = cpal::default_host();
            let Some(device) = host.default_input_device() else {
                let _ = ready_tx.send(Err("no input device".to_string()));
                return;
            };

            let stream = match build_stream(&device, &tier, &thread_buffer) {
                Ok(s) => s,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };

            if let Err(e) = stream.play() {
                let _ = ready_tx.send(Err(e.to_string()));
                return;
            }

            let _ = ready_tx.send(Ok(()));

            // Block until stop is signalled (or the controller is dropped)
            let _ = stop_rx.recv();
            drop(stream);
        });

        match ready_rx.recv_timeout(STREAM_READY_TIMEOUT) {
            Ok(Ok(())) => Ok(ActiveRecording {
                buffer,
                stop_tx,
                handle,
                source_rate,
                source_channels,
            }),
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(Error::RecordingFailed(e))
            }
            Err(_) => {
                drop(stop_tx);
                let _ = handle.join();
                Err(Error::RecordingFailed("stream startup timed out".to_string()))
            }
        }
    }

    /// Fresh artifact location, overwriting any stale recording
    fn artifact_path(&self) -> PathBuf {
        self.recordings_dir.join("recording.wav")
    }
}

impl AudioInput for AudioCapture {
    fn start(&mut self) -> Result<()> {
        if self.active.is_some() {
            return Err(Error::RecordingFailed("already recording".to_string()));
        }

        let path = self.artifact_path();
        if path.exists() {
            let _ = std::fs::remove_file(&path);
        }

        // Two-tier fallback: native mono 16 kHz, then the device default
        let session = match Self::preferred_tier()? {
            Some(tier) => match Self::spawn_session(tier) {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!(error = %e, "preferred capture config failed, falling back");
                    Self::spawn_session(Self::baseline_tier()?)?
                }
            },
            None => {
                tracing::debug!("no native mono 16 kHz config, using device default");
                Self::spawn_session(Self::baseline_tier()?)?
            }
        };

        tracing::debug!(
            rate = session.source_rate,
            channels = session.source_channels,
            "audio capture started"
        );
        self.active = Some(session);
        Ok(())
    }

    fn stop(&mut self) -> Result<Option<RecordedAudio>> {
        let Some(session) = self.active.take() else {
            return Ok(None);
        };

        let _ = session.stop_tx.send(());
        if session.handle.join().is_err() {
            tracing::error!("capture thread panicked");
        }

        let raw = session
            .buffer
            .lock()
            .map(|mut b| std::mem::take(&mut *b))
            .unwrap_or_default();

        tracing::debug!(samples = raw.len(), "audio capture stopped");

        let mono = downmix(&raw, session.source_channels);
        let samples = super::resample(&mono, session.source_rate, SAMPLE_RATE)?;

        if samples.is_empty() {
            return Ok(None);
        }

        let path = self.artifact_path();
        write_wav(&path, &samples, SAMPLE_RATE)?;

        let duration_ms = samples.len() as u64 * 1000 / u64::from(SAMPLE_RATE);
        Ok(Some(RecordedAudio {
            path,
            sample_count: samples.len(),
            duration_ms,
        }))
    }

    fn is_recording(&self) -> bool {
        self.active.is_some()
    }
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        if let Some(session) = self.active.take() {
            let _ = session.stop_tx.send(());
            let _ = session.handle.join();
        }
    }
}

/// Build an input stream for the tier's sample format, converting to f32
fn build_stream(
    device: &cpal::Device,
    tier: &CaptureTier,
    buffer: &Arc<Mutex<Vec<f32>>>,
) -> std::result::Result<cpal::Stream, String> {
    let err_fn = |err| tracing::error!(error = %err, "audio capture error");

    let stream = match tier.format {
        SampleFormat::F32 => {
            let buf = Arc::clone(buffer);
            device.build_input_stream(
                &tier.config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    if let Ok(mut b) = buf.lock() {
                        b.extend_from_slice(data);
                    }
                },
                err_fn,
                None,
            )
        }
        SampleFormat::I16 => {
            let buf = Arc::clone(buffer);
            device.build_input_stream(
                &tier.config,
                move |data: &[i16], _: &cpal::InputCallbackInfo| {
                    if let Ok(mut b) = buf.lock() {
                        b.extend(data.iter().map(|&s| f32::from(s) / 32768.0));
                    }
                },
                err_fn,
                None,
            )
        }
        SampleFormat::U16 => {
            let buf = Arc::clone(buffer);
            device.build_input_stream(
                &tier.config,
                move |data: &[u16], _: &cpal::InputCallbackInfo| {
                    if let Ok(mut b) = buf.lock() {
                        b.extend(data.iter().map(|&s| (f32::from(s) - 32768.0) / 32768.0));
                    }
                },
                err_fn,
                None,
            )
        }
        other => return Err(format!("unsupported sample format {other}")),
    };

    stream.map_err(|e| e.to_string())
}

/// Average interleaved channels down to mono
#[allow(clippy::cast_precision_loss)]
fn downmix(samples: &[f32], channels: u16) -> Vec<f32> {
    if channels <= 1 {
        return samples.to_vec();
    }
    let n = usize::from(channels);
    samples
        .chunks(n)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Write mono f32 samples as 16-bit PCM WAV
fn write_wav(path: &Path, samples: &[f32], sample_rate: u32) -> Result<()> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut writer =
        hound::WavWriter::create(path, spec).map_err(|e| Error::RecordingFailed(e.to_string()))?;

    for &sample in samples {
        #[allow(clippy::cast_possible_truncation)]
        let sample_i16 = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
        writer
            .write_sample(sample_i16)
            .map_err(|e| Error::RecordingFailed(e.to_string()))?;
    }

    writer
        .finalize()
        .map_err(|e| Error::RecordingFailed(e.to_string()))?;
    Ok(())
}
