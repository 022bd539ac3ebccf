//! Per-channel sine synthesis
//!
//! Channel `c` plays `freqs[c]`, or the last frequency when fewer are given.
//! Phase is accumulated per channel so frequency and amplitude can change
//! between frames (live VoIP config) without a phase jump.

use super::PcmFormat;
use std::f64::consts::TAU;

pub struct SineGenerator {
    freqs: Vec<f64>,
    phases: Vec<f64>,
    amplitude: f64,
    format: PcmFormat,
}

impl SineGenerator {
    pub fn new(freqs: &[f64], amplitude: f64, format: PcmFormat) -> Self {
        Self {
            freqs: freqs.to_vec(),
            phases: vec![0.0; format.channels.max(1) as usize],
            amplitude,
            format,
        }
    }

    pub fn format(&self) -> PcmFormat {
        self.format
    }

    pub fn frequencies(&self) -> &[f64] {
        &self.freqs
    }

    pub fn amplitude(&self) -> f64 {
        self.amplitude
    }

    /// Retune; phases carry over
    pub fn set_frequencies(&mut self, freqs: &[f64]) {
        self.freqs = freqs.to_vec();
    }

    pub fn set_amplitude(&mut self, amplitude: f64) {
        self.amplitude = amplitude;
    }

    /// Fill an interleaved frame
    pub fn fill(&mut self, out: &mut [f32]) {
        let channels = self.phases.len();
        let rate = self.format.sample_rate as f64;
        if self.freqs.is_empty() {
            out.fill(0.0);
            return;
        }
        let steps: Vec<f64> = (0..channels)
            .map(|c| TAU * self.freqs[c.min(self.freqs.len() - 1)] / rate)
            .collect();

        for frame in out.chunks_mut(channels) {
            for (c, s) in frame.iter_mut().enumerate() {
                let phase = &mut self.phases[c];
                *s = self.format.quantize((self.amplitude * phase.sin()) as f32);
                *phase = (*phase + steps[c]) % TAU;
            }
        }
    }

    /// Render `samples_per_channel` samples into a new interleaved buffer
    pub fn render(&mut self, samples_per_channel: usize) -> Vec<f32> {
        let mut out = vec![0.0; samples_per_channel * self.format.channels.max(1) as usize];
        self.fill(&mut out);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::level;

    #[test]
    fn test_amplitude_bound() {
        let mut sine = SineGenerator::new(&[440.0, 880.0], 0.6, PcmFormat::new(44100, 2, 32));
        let frame = sine.render(4410);
        assert!(level::peak(&frame) <= 0.6 + 1e-6);
        assert!(level::peak(&frame) > 0.59);
    }

    #[test]
    fn test_frequency_per_channel() {
        let fmt = PcmFormat::new(8000, 2, 32);
        let mut sine = SineGenerator::new(&[1000.0, 2000.0], 1.0, fmt);
        let frame = sine.render(4);
        // 2000 Hz at 8 kHz: 0, 1, 0, -1
        assert!((frame[3] - 1.0).abs() < 1e-6);
        assert!((frame[5]).abs() < 1e-6);
        // 1000 Hz: sin(pi/4) at n=1
        assert!((frame[2] - std::f32::consts::FRAC_1_SQRT_2).abs() < 1e-6);

        // extra channels reuse the last frequency
        let mut mono_list = SineGenerator::new(&[500.0], 1.0, fmt);
        let f = mono_list.render(16);
        for pair in f.chunks(2) {
            assert_eq!(pair[0], pair[1]);
        }
    }

    #[test]
    fn test_channels_identical() {
        let mut sine = SineGenerator::new(&[1000.0], 0.5, PcmFormat::new(8000, 2, 16));
        let frame = sine.render(160);
        for pair in frame.chunks(2) {
            assert_eq!(pair[0], pair[1]);
        }
    }

    #[test]
    fn test_live_retune_keeps_phase_continuous() {
        let fmt = PcmFormat::new(8000, 1, 32);
        let mut sine = SineGenerator::new(&[300.0], 1.0, fmt);
        let a = sine.render(160);
        sine.set_frequencies(&[310.0]);
        let b = sine.render(1);
        // one step at ~300 Hz cannot move more than 2*pi*310/8000 in phase
        let max_step = (TAU * 310.0 / 8000.0) as f32;
        assert!((b[0] - a[159]).abs() <= max_step + 1e-3);
        assert_eq!(sine.frequencies(), &[310.0]);
    }

    #[test]
    fn test_zero_amplitude_is_silence() {
        let mut sine = SineGenerator::new(&[440.0], 0.0, PcmFormat::new(16000, 1, 16));
        assert_eq!(level::peak(&sine.render(320)), 0.0);
    }
}
