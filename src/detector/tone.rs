//! Tone presence detector
//!
//! Every `process-frame-ms` of input is scanned, per channel, across each
//! target's tolerance band with a single-bin DFT. A target is active when the
//! strongest bin in its band reaches [`AMPLITUDE_THRESHOLD`] and lies within
//! `tolerance-semitone` of the target.

use super::Detector;
use crate::audio::PcmFormat;
use anyhow::{bail, Context, Result};
use serde_json::{json, Map, Value};
use std::f64::consts::TAU;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

pub const CLASS_NAME: &str = "ToneDetector";

/// Normalised peak amplitude needed to call a tone present
pub const AMPLITUDE_THRESHOLD: f64 = 0.05;

pub const DEFAULT_PROCESS_FRAME_MS: u32 = 50;
pub const DEFAULT_TOLERANCE_SEMITONE: f64 = 1.0;

/// True when `freq` is within `tolerance` semitones of `target`
pub fn tone_detected(freq: f64, target: f64, tolerance: f64) -> bool {
    if freq <= 0.0 || target <= 0.0 || !freq.is_finite() || !target.is_finite() {
        return false;
    }
    (freq / target).log2().abs() * 12.0 < tolerance
}

/// Normalised amplitude of `freq` in `window` (a full-scale sine reads ~1.0)
fn bin_amplitude(window: &[f32], freq: f64, sample_rate: f64) -> f64 {
    if window.is_empty() {
        return 0.0;
    }
    let w = TAU * freq / sample_rate;
    let (mut re, mut im) = (0.0f64, 0.0f64);
    for (n, s) in window.iter().enumerate() {
        let phase = w * n as f64;
        re += *s as f64 * phase.cos();
        im -= *s as f64 * phase.sin();
    }
    2.0 * (re * re + im * im).sqrt() / window.len() as f64
}

/// Strongest (frequency, amplitude) inside the tolerance band of `target`
fn band_peak(window: &[f32], target: f64, tolerance: f64, sample_rate: f64) -> (f64, f64) {
    let low = target * 2f64.powf(-tolerance / 12.0);
    let high = (target * 2f64.powf(tolerance / 12.0)).min(sample_rate / 2.0);
    // half-bin steps
    let step = (sample_rate / window.len().max(1) as f64 / 2.0).max(0.5);

    let mut best = (target, bin_amplitude(window, target, sample_rate));
    let mut f = low;
    while f <= high {
        let amp = bin_amplitude(window, f, sample_rate);
        if amp > best.1 {
            best = (f, amp);
        }
        f += step;
    }
    best
}

pub struct ToneDetector {
    handle: String,
    targets: Vec<f64>,
    active: Vec<bool>,
    process_frame_ms: u32,
    tolerance: f64,
    dump_history: bool,
    history_path: PathBuf,
    /// Pending samples per channel
    pending: Vec<Vec<f32>>,
}

impl ToneDetector {
    pub fn new(handle: String, data_dir: PathBuf) -> Self {
        let history_path = data_dir.join(format!("{}.txt", handle));
        Self {
            handle,
            targets: Vec::new(),
            active: Vec::new(),
            process_frame_ms: DEFAULT_PROCESS_FRAME_MS,
            tolerance: DEFAULT_TOLERANCE_SEMITONE,
            dump_history: false,
            history_path,
            pending: Vec::new(),
        }
    }

    pub fn targets(&self) -> &[f64] {
        &self.targets
    }

    pub fn active_targets(&self) -> Vec<f64> {
        self.targets
            .iter()
            .zip(&self.active)
            .filter(|(_, a)| **a)
            .map(|(t, _)| *t)
            .collect()
    }

    fn event_payload(&self) -> Value {
        let targets: Vec<Value> = self
            .active_targets()
            .into_iter()
            .map(|f| json!({ "target-freq": f }))
            .collect();
        json!({ "class-handle": self.handle, "targets": targets })
    }

    fn record_history(&self, changed: &[(f64, bool)]) {
        if !self.dump_history || changed.is_empty() {
            return;
        }
        let result = (|| -> Result<()> {
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.history_path)
                .with_context(|| format!("Failed to open {}", self.history_path.display()))?;
            let now = chrono::Utc::now().timestamp_millis();
            for (freq, on) in changed {
                writeln!(
                    file,
                    "{}: {} {}",
                    now,
                    freq,
                    if *on { "active" } else { "inactive" }
                )?;
            }
            Ok(())
        })();
        if let Err(e) = result {
            log::warn!("{}: history dump failed: {:#}", self.handle, e);
        }
    }

    fn analyse(&mut self, format: PcmFormat, window_len: usize) -> Option<Value> {
        let rate = format.sample_rate as f64;
        let windows: Vec<Vec<f32>> = self
            .pending
            .iter_mut()
            .map(|ch| ch.drain(..window_len).collect())
            .collect();

        let next: Vec<bool> = self
            .targets
            .iter()
            .map(|target| {
                windows.iter().any(|w| {
                    let (freq, amp) = band_peak(w, *target, self.tolerance, rate);
                    amp >= AMPLITUDE_THRESHOLD && tone_detected(freq, *target, self.tolerance)
                })
            })
            .collect();

        if next == self.active {
            return None;
        }
        let changed: Vec<(f64, bool)> = self
            .targets
            .iter()
            .zip(next.iter().zip(&self.active))
            .filter(|(_, (n, o))| n != o)
            .map(|(t, (n, _))| (*t, *n))
            .collect();
        self.active = next;
        self.record_history(&changed);
        log::debug!("{}: active targets {:?}", self.handle, self.active_targets());
        Some(self.event_payload())
    }
}

fn parse_freqs(value: &Value) -> Result<Vec<f64>> {
    let values: Vec<&Value> = match value {
        Value::Array(items) => items.iter().collect(),
        single => vec![single],
    };
    values
        .into_iter()
        .map(|v| {
            let f = v
                .as_f64()
                .with_context(|| format!("target-freq must be numeric, got {}", v))?;
            if !(f > 0.0 && f.is_finite()) {
                bail!("target-freq must be positive, got {}", f);
            }
            Ok(f)
        })
        .collect()
}

impl Detector for ToneDetector {
    fn handle(&self) -> &str {
        &self.handle
    }

    fn class_name(&self) -> &'static str {
        CLASS_NAME
    }

    fn set_params(&mut self, params: &Map<String, Value>) -> Result<()> {
        // validate everything before touching state
        let freqs = params.get("target-freq").map(parse_freqs).transpose()?;
        let frame_ms = match params.get("process-frame-ms") {
            Some(v) => match v.as_u64() {
                Some(ms) if ms > 0 && ms <= 10_000 => Some(ms as u32),
                _ => bail!("process-frame-ms must be a positive integer, got {}", v),
            },
            None => None,
        };
        let tolerance = match params.get("tolerance-semitone") {
            Some(v) => match v.as_f64() {
                Some(t) if t > 0.0 && t.is_finite() => Some(t),
                _ => bail!("tolerance-semitone must be positive, got {}", v),
            },
            None => None,
        };
        let clear = params
            .get("clear-target")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let dump_history = params.get("dump-history").and_then(Value::as_bool);

        if clear {
            self.targets.clear();
            self.active.clear();
        }
        for f in freqs.unwrap_or_default() {
            if !self.targets.contains(&f) {
                self.targets.push(f);
                self.active.push(false);
            }
        }
        if let Some(ms) = frame_ms {
            self.process_frame_ms = ms;
            self.pending.clear();
        }
        if let Some(t) = tolerance {
            self.tolerance = t;
        }
        if let Some(d) = dump_history {
            self.dump_history = d;
        }
        Ok(())
    }

    fn feed(&mut self, frame: &[f32], format: PcmFormat) -> Option<Value> {
        let channels = format.channels.max(1) as usize;
        if self.pending.len() != channels {
            self.pending = vec![Vec::new(); channels];
        }
        for chunk in frame.chunks(channels) {
            for (ch, s) in chunk.iter().enumerate() {
                self.pending[ch].push(*s);
            }
        }

        let window_len = format.samples_per_frame(self.process_frame_ms).max(1);
        let mut event = None;
        while self.pending[0].len() >= window_len {
            if let Some(e) = self.analyse(format, window_len) {
                event = Some(e);
            }
        }
        event
    }

    fn to_json(&self) -> Value {
        json!({
            "class": CLASS_NAME,
            "class-handle": self.handle,
            "target-freq": self.targets,
            "process-frame-ms": self.process_frame_ms,
            "tolerance-semitone": self.tolerance,
            "dump-history": self.dump_history,
            "active": self.active_targets(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::sine::SineGenerator;

    fn detector(params: Value) -> (ToneDetector, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut d = ToneDetector::new("ToneDetector@1".into(), dir.path().to_path_buf());
        d.set_params(params.as_object().unwrap()).unwrap();
        (d, dir)
    }

    #[test]
    fn test_detects_and_releases() {
        let fmt = PcmFormat::new(8000, 1, 16);
        let (mut d, _dir) = detector(json!({"target-freq": 300}));
        let mut sine = SineGenerator::new(&[300.0], 0.5, fmt);

        let event = d.feed(&sine.render(400), fmt).expect("tone should activate");
        assert_eq!(
            event,
            json!({"class-handle": "ToneDetector@1", "targets": [{"target-freq": 300.0}]})
        );
        // steady state: no new event
        assert!(d.feed(&sine.render(400), fmt).is_none());

        let event = d.feed(&vec![0.0; 400], fmt).expect("silence should release");
        assert_eq!(event["targets"], json!([]));
    }

    #[test]
    fn test_far_tone_ignored() {
        let fmt = PcmFormat::new(44100, 2, 16);
        let (mut d, _dir) = detector(json!({"target-freq": [440, 2000]}));
        let mut sine = SineGenerator::new(&[1320.0], 0.6, fmt);
        assert!(d.feed(&sine.render(4410), fmt).is_none());
        assert!(d.active_targets().is_empty());
    }

    #[test]
    fn test_quiet_tone_ignored() {
        let fmt = PcmFormat::new(16000, 1, 16);
        let (mut d, _dir) = detector(json!({"target-freq": 1000}));
        let mut sine = SineGenerator::new(&[1000.0], 0.01, fmt);
        assert!(d.feed(&sine.render(1600), fmt).is_none());
    }

    #[test]
    fn test_params_validation_is_atomic() {
        let (mut d, _dir) = detector(json!({"target-freq": 440}));
        let bad = json!({"target-freq": [500, -1], "tolerance-semitone": 2});
        assert!(d.set_params(bad.as_object().unwrap()).is_err());
        assert_eq!(d.targets(), &[440.0]);
        assert_eq!(d.to_json()["tolerance-semitone"], 1.0);

        let clear = json!({"clear-target": true, "target-freq": [500]});
        d.set_params(clear.as_object().unwrap()).unwrap();
        assert_eq!(d.targets(), &[500.0]);

        assert!(d
            .set_params(json!({"process-frame-ms": 0}).as_object().unwrap())
            .is_err());
    }

    #[test]
    fn test_history_dump() {
        let fmt = PcmFormat::new(8000, 1, 16);
        let (mut d, dir) = detector(json!({"target-freq": 300, "dump-history": true}));
        let mut sine = SineGenerator::new(&[300.0], 0.5, fmt);
        d.feed(&sine.render(400), fmt);
        d.feed(&vec![0.0; 400], fmt);

        let text = std::fs::read_to_string(dir.path().join("ToneDetector@1.txt")).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with(": 300 active"));
        assert!(lines[1].ends_with(": 300 inactive"));
    }
}

#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn within_tolerance_detected(target in 50.0f64..8000.0, tol in 0.1f64..3.0, frac in -0.98f64..0.98) {
            let f = target * 2f64.powf(frac * tol / 12.0);
            prop_assert!(tone_detected(f, target, tol));
        }

        #[test]
        fn outside_tolerance_rejected(target in 50.0f64..8000.0, tol in 0.1f64..3.0, frac in 1.02f64..4.0, up in any::<bool>()) {
            let semis = if up { frac * tol } else { -frac * tol };
            let f = target * 2f64.powf(semis / 12.0);
            prop_assert!(!tone_detected(f, target, tol));
        }

        #[test]
        fn symmetric_in_octave_space(a in 20.0f64..20000.0, b in 20.0f64..20000.0, tol in 0.1f64..24.0) {
            prop_assert_eq!(tone_detected(a, b, tol), tone_detected(b, a, tol));
        }
    }
}
