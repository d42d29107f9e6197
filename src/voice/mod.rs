//! Voice processing module
//!
//! Audio capture and playback, transcription and synthesis provider clients,
//! the reply filter, and the speaker capability used by the engine.

mod capture;
mod filter;
mod playback;
mod speaker;
mod stt;
mod tts;

pub use capture::{AudioCapture, AudioInput, RecordedAudio, SAMPLE_RATE};
pub use filter::filter_reply;
pub use playback::AudioPlayback;
pub use speaker::{CloudSpeaker, LocalSpeaker, Speaker};
pub use stt::{IssuedToken, SpeechRecognizer, TokenCache, TokenSource, Transcriber};
pub use tts::{HttpSynthesisBackend, SpeechSynthesisService, SynthesisBackend, SynthesisRequest};

use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};

use crate::{Error, Result};

/// Chunk size fed to the resampler
const RESAMPLE_CHUNK: usize = 1024;

/// Resample mono f32 samples between rates
///
/// Used by capture when the device cannot open a native 16 kHz stream, and by
/// playback when artifact and device rates differ.
#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss, clippy::cast_sign_loss)]
pub(crate) fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>> {
    if from_rate == to_rate || samples.is_empty() {
        return Ok(samples.to_vec());
    }

    let params = SincInterpolationParameters {
        sinc_len: 128,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 128,
        window: WindowFunction::Blackman2,
    };

    let ratio = f64::from(to_rate) / f64::from(from_rate);
    let mut resampler = SincFixedIn::<f32>::new(ratio, 2.0, params, RESAMPLE_CHUNK, 1)
        .map_err(|e| Error::RecordingFailed(format!("resampler init: {e}")))?;

    let mut out = Vec::with_capacity((samples.len() as f64 * ratio) as usize + RESAMPLE_CHUNK);
    let mut pos = 0;

    while pos + RESAMPLE_CHUNK <= samples.len() {
        let frames = resampler
            .process(&[&samples[pos..pos + RESAMPLE_CHUNK]], None)
            .map_err(|e| Error::RecordingFailed(format!("resample: {e}")))?;
        out.extend_from_slice(&frames[0]);
        pos += RESAMPLE_CHUNK;
    }

    if pos < samples.len() {
        let frames = resampler
            .process_partial(Some(&[&samples[pos..]]), None)
            .map_err(|e| Error::RecordingFailed(format!("resample tail: {e}")))?;
        out.extend_from_slice(&frames[0]);
    }

    Ok(out)
}
