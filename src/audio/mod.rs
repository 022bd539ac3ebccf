//! Audio device seam
//!
//! Controllers only ever see [`AudioDevice`]: open an output or input at a
//! PCM format, then write or read one frame at a time. Frames are
//! interleaved `f32` samples normalised to [-1, 1]; the bit depth of the
//! format is applied by quantizing, not by changing the sample type.
//!
//! Backends:
//! - `null`: paced sink/silence source
//! - `loopback` (default): outputs are audible on inputs, used by tests
//! - `cpal` (`cpal_device` feature): real hardware

pub mod level;
pub mod loopback;
pub mod sine;
pub mod wav;

cfg_if::cfg_if! {
    if #[cfg(feature = "cpal_device")] {
        pub mod cpal_device;
    }
}

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Sample rate, channel count and bit depth of one PCM stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PcmFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
}

impl PcmFormat {
    pub const fn new(sample_rate: u32, channels: u16, bits_per_sample: u16) -> Self {
        Self {
            sample_rate,
            channels,
            bits_per_sample,
        }
    }

    /// Samples per channel in one frame
    pub fn samples_per_frame(&self, frame_ms: u32) -> usize {
        (self.sample_rate as u64 * frame_ms as u64 / 1000) as usize
    }

    /// Interleaved samples in one frame
    pub fn frame_len(&self, frame_ms: u32) -> usize {
        self.samples_per_frame(frame_ms) * self.channels as usize
    }

    /// Interleaved samples covering `ms` milliseconds
    pub fn samples_for_ms(&self, ms: u32) -> usize {
        self.frame_len(ms)
    }

    /// Round a sample to the nearest level representable at this bit depth
    pub fn quantize(&self, sample: f32) -> f32 {
        let levels = ((1u64 << (self.bits_per_sample.clamp(2, 32) - 1)) - 1) as f64;
        let clamped = sample.clamp(-1.0, 1.0) as f64;
        ((clamped * levels).round() / levels) as f32
    }
}

impl std::fmt::Display for PcmFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}Hz/{}ch/{}bit",
            self.sample_rate, self.channels, self.bits_per_sample
        )
    }
}

pub fn frame_duration(frame_ms: u32) -> Duration {
    Duration::from_millis(frame_ms as u64)
}

/// Output stream; `write_frame` blocks for about one frame period
pub trait PcmWriter: Send {
    fn write_frame(&mut self, samples: &[f32]) -> Result<()>;
}

/// Input stream; `read_frame` blocks for about one frame period
pub trait PcmReader: Send {
    fn read_frame(&mut self, into: &mut [f32]) -> Result<()>;
}

pub trait AudioDevice: Send + Sync {
    fn name(&self) -> &str;

    fn open_output(&self, format: PcmFormat, frame_ms: u32) -> Result<Box<dyn PcmWriter>>;

    fn open_input(&self, format: PcmFormat, frame_ms: u32) -> Result<Box<dyn PcmReader>>;
}

pub type SharedDevice = Arc<dyn AudioDevice>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioBackend {
    Null,
    Loopback,
    Cpal,
}

/// Audio backend selection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioDeviceConfig {
    pub backend: AudioBackend,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_device: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_device: Option<String>,
}

impl Default for AudioDeviceConfig {
    fn default() -> Self {
        Self {
            backend: AudioBackend::Loopback,
            output_device: None,
            input_device: None,
        }
    }
}

cfg_if::cfg_if! {
    if #[cfg(feature = "cpal_device")] {
        fn cpal_backend(config: &AudioDeviceConfig) -> SharedDevice {
            Arc::new(cpal_device::CpalDevice::new(
                config.output_device.clone(),
                config.input_device.clone(),
            ))
        }
    } else {
        fn cpal_backend(_config: &AudioDeviceConfig) -> SharedDevice {
            log::warn!("cpal backend requested but cpal_device feature is off, using loopback");
            Arc::new(loopback::LoopbackDevice::new())
        }
    }
}

/// Build the configured backend
///
/// Asking for `cpal` without the `cpal_device` feature falls back to loopback.
pub fn open_device(config: &AudioDeviceConfig) -> Result<SharedDevice> {
    let device: SharedDevice = match config.backend {
        AudioBackend::Null => Arc::new(loopback::NullDevice::new()),
        AudioBackend::Loopback => Arc::new(loopback::LoopbackDevice::new()),
        AudioBackend::Cpal => cpal_backend(config),
    };
    log::info!("✓ Audio backend: {}", device.name());
    Ok(device)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_sizes() {
        let fmt = PcmFormat::new(44100, 2, 16);
        assert_eq!(fmt.samples_per_frame(20), 882);
        assert_eq!(fmt.frame_len(20), 1764);

        let voip = PcmFormat::new(8000, 1, 16);
        assert_eq!(voip.frame_len(20), 160);
    }

    #[test]
    fn test_quantize() {
        let eight = PcmFormat::new(8000, 1, 8);
        assert_eq!(eight.quantize(1.0), 1.0);
        assert_eq!(eight.quantize(2.0), 1.0);
        assert_eq!(eight.quantize(0.0), 0.0);
        // 127 levels: 0.5 lands on 64/127
        assert!((eight.quantize(0.5) - 64.0 / 127.0).abs() < 1e-6);

        let full = PcmFormat::new(8000, 1, 32);
        assert!((full.quantize(0.123456) - 0.123456).abs() < 1e-6);
    }

    #[test]
    fn test_backend_config_serde() {
        let cfg: AudioDeviceConfig = toml::from_str(r#"backend = "null""#).unwrap();
        assert_eq!(cfg.backend, AudioBackend::Null);
        assert!(cfg.output_device.is_none());
    }

    #[test]
    fn test_open_device_backends() {
        let null = open_device(&AudioDeviceConfig {
            backend: AudioBackend::Null,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(null.name(), "null");
        let lb = open_device(&AudioDeviceConfig::default()).unwrap();
        assert_eq!(lb.name(), "loopback");
    }
}
