//! WAV files: offload tone rendering, record dumps, looping playback
//!
//! The `Transcoder` and `MediaPlayer` traits are the seams where a codec
//! and a platform media player would plug in. The defaults keep the WAV
//! as-is and stream it through an [`AudioDevice`] output.

use super::sine::SineGenerator;
use super::{AudioDevice, PcmFormat};
use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};

fn wav_spec(format: PcmFormat) -> hound::WavSpec {
    hound::WavSpec {
        channels: format.channels,
        sample_rate: format.sample_rate,
        bits_per_sample: format.bits_per_sample,
        sample_format: hound::SampleFormat::Int,
    }
}

fn full_scale(bits: u16) -> f32 {
    ((1u64 << (bits.clamp(2, 32) - 1)) - 1) as f32
}

/// Write interleaved normalised samples as integer PCM
pub fn write_samples(path: &Path, format: PcmFormat, samples: &[f32]) -> Result<()> {
    let mut writer = hound::WavWriter::create(path, wav_spec(format))
        .with_context(|| format!("Failed to create {}", path.display()))?;
    let scale = full_scale(format.bits_per_sample);
    for s in samples {
        writer
            .write_sample((s.clamp(-1.0, 1.0) * scale).round() as i32)
            .with_context(|| format!("Failed to write {}", path.display()))?;
    }
    writer
        .finalize()
        .with_context(|| format!("Failed to finalize {}", path.display()))?;
    Ok(())
}

/// Render `secs` seconds of the tone mix into a WAV file
pub fn write_tone_file(
    path: &Path,
    format: PcmFormat,
    freqs: &[f64],
    amplitude: f64,
    secs: u32,
) -> Result<()> {
    let mut sine = SineGenerator::new(freqs, amplitude, format);
    let samples = sine.render(format.sample_rate as usize * secs as usize);
    write_samples(path, format, &samples)?;
    log::debug!("Tone file written: {} ({}s, {})", path.display(), secs, format);
    Ok(())
}

/// Read a WAV back as interleaved normalised samples
pub fn read_samples(path: &Path) -> Result<(PcmFormat, Vec<f32>)> {
    let mut reader = hound::WavReader::open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let spec = reader.spec();
    let format = PcmFormat::new(spec.sample_rate, spec.channels, spec.bits_per_sample);

    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Int => {
            let scale = full_scale(spec.bits_per_sample);
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<Result<_, _>>()
                .with_context(|| format!("Corrupt samples in {}", path.display()))?
        }
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<Result<_, _>>()
            .with_context(|| format!("Corrupt samples in {}", path.display()))?,
    };
    Ok((format, samples))
}

pub trait Transcoder: Send + Sync {
    /// Encode a rendered WAV; returns the path to play
    fn transcode(&self, wav: &Path) -> Result<PathBuf>;
}

/// Keeps the WAV unchanged
pub struct PassthroughTranscoder;

impl Transcoder for PassthroughTranscoder {
    fn transcode(&self, wav: &Path) -> Result<PathBuf> {
        Ok(wav.to_path_buf())
    }
}

pub trait MediaPlayer: Send + Sync {
    /// Play `file` on repeat until `should_stop` returns true
    fn play_looped(
        &self,
        file: &Path,
        device: &dyn AudioDevice,
        frame_ms: u32,
        should_stop: &dyn Fn() -> bool,
    ) -> Result<()>;
}

/// Decodes WAV into memory and streams it frame by frame
pub struct WavLoopPlayer;

impl MediaPlayer for WavLoopPlayer {
    fn play_looped(
        &self,
        file: &Path,
        device: &dyn AudioDevice,
        frame_ms: u32,
        should_stop: &dyn Fn() -> bool,
    ) -> Result<()> {
        let (format, samples) = read_samples(file)?;
        if samples.is_empty() {
            bail!("{} holds no samples", file.display());
        }

        let mut output = device.open_output(format, frame_ms)?;
        let frame_len = format.frame_len(frame_ms).max(1);
        let mut frame = vec![0.0f32; frame_len];
        let mut pos = 0usize;
        let mut loops = 0u64;

        while !should_stop() {
            for slot in frame.iter_mut() {
                *slot = samples[pos];
                pos += 1;
                if pos == samples.len() {
                    pos = 0;
                    loops += 1;
                }
            }
            output.write_frame(&frame)?;
        }
        log::debug!("Looped {} {} times", file.display(), loops);
        Ok(())
    }
}
