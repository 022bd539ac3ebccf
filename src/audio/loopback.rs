//! Simulated devices paced by the frame period
//!
//! `NullDevice` discards output and reads silence. `LoopbackDevice` routes
//! every output into a shared mono bus that inputs read back, so a Playback
//! task is audible to a Record task in the same process.

use super::{frame_duration, AudioDevice, PcmFormat, PcmReader, PcmWriter};
use anyhow::Result;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Internal bus rate; streams are converted nearest-neighbour
const BUS_RATE: u32 = 48_000;
/// One second of history
const BUS_CAPACITY: usize = BUS_RATE as usize;

/// Sleeps so that consecutive calls are one period apart on average
struct Pacer {
    period: Duration,
    next: Instant,
}

impl Pacer {
    fn new(period: Duration) -> Self {
        Self {
            period,
            next: Instant::now(),
        }
    }

    fn wait(&mut self) {
        self.next += self.period;
        let now = Instant::now();
        if self.next > now {
            std::thread::sleep(self.next - now);
        } else if now - self.next > self.period * 4 {
            // fell far behind (debugger, loaded CI box): resync instead of bursting
            self.next = now;
        }
    }
}

pub struct NullDevice;

impl NullDevice {
    pub fn new() -> Self {
        Self
    }
}

impl Default for NullDevice {
    fn default() -> Self {
        Self::new()
    }
}

struct NullWriter {
    pacer: Pacer,
}

impl PcmWriter for NullWriter {
    fn write_frame(&mut self, _samples: &[f32]) -> Result<()> {
        self.pacer.wait();
        Ok(())
    }
}

struct NullReader {
    pacer: Pacer,
}

impl PcmReader for NullReader {
    fn read_frame(&mut self, into: &mut [f32]) -> Result<()> {
        self.pacer.wait();
        into.fill(0.0);
        Ok(())
    }
}

impl AudioDevice for NullDevice {
    fn name(&self) -> &str {
        "null"
    }

    fn open_output(&self, format: PcmFormat, frame_ms: u32) -> Result<Box<dyn PcmWriter>> {
        log::debug!("null output opened at {}", format);
        Ok(Box::new(NullWriter {
            pacer: Pacer::new(frame_duration(frame_ms)),
        }))
    }

    fn open_input(&self, format: PcmFormat, frame_ms: u32) -> Result<Box<dyn PcmReader>> {
        log::debug!("null input opened at {}", format);
        Ok(Box::new(NullReader {
            pacer: Pacer::new(frame_duration(frame_ms)),
        }))
    }
}

type Bus = Arc<Mutex<VecDeque<f32>>>;

#[derive(Clone)]
pub struct LoopbackDevice {
    bus: Bus,
}

impl LoopbackDevice {
    pub fn new() -> Self {
        Self {
            bus: Arc::new(Mutex::new(VecDeque::with_capacity(BUS_CAPACITY))),
        }
    }

    /// Push mono samples straight onto the bus, bypassing pacing
    pub fn inject(&self, mono: &[f32], sample_rate: u32) {
        push_to_bus(&self.bus, mono, sample_rate);
    }

    /// Samples currently buffered on the bus
    pub fn pending(&self) -> usize {
        self.bus.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl Default for LoopbackDevice {
    fn default() -> Self {
        Self::new()
    }
}

fn push_to_bus(bus: &Bus, mono: &[f32], sample_rate: u32) {
    if mono.is_empty() || sample_rate == 0 {
        return;
    }
    let bus_len = mono.len() * BUS_RATE as usize / sample_rate as usize;
    let mut bus = bus.lock().unwrap_or_else(PoisonError::into_inner);
    for j in 0..bus_len {
        let src = (j * sample_rate as usize / BUS_RATE as usize).min(mono.len() - 1);
        bus.push_back(mono[src]);
    }
    let overflow = bus.len().saturating_sub(BUS_CAPACITY);
    bus.drain(..overflow);
}

struct LoopbackWriter {
    bus: Bus,
    format: PcmFormat,
    pacer: Pacer,
}

impl PcmWriter for LoopbackWriter {
    fn write_frame(&mut self, samples: &[f32]) -> Result<()> {
        let channels = self.format.channels.max(1) as usize;
        let mono: Vec<f32> = samples
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
            .collect();
        push_to_bus(&self.bus, &mono, self.format.sample_rate);
        self.pacer.wait();
        Ok(())
    }
}

struct LoopbackReader {
    bus: Bus,
    format: PcmFormat,
    pacer: Pacer,
}

impl PcmReader for LoopbackReader {
    fn read_frame(&mut self, into: &mut [f32]) -> Result<()> {
        self.pacer.wait();

        let channels = self.format.channels.max(1) as usize;
        let rate = self.format.sample_rate.max(1) as usize;
        let needed = into.len() / channels;
        let bus_needed = (needed * BUS_RATE as usize).div_ceil(rate);

        let taken: Vec<f32> = {
            let mut bus = self.bus.lock().unwrap_or_else(PoisonError::into_inner);
            let n = bus_needed.min(bus.len());
            bus.drain(..n).collect()
        };

        for (i, frame) in into.chunks_mut(channels).enumerate() {
            let src = i * BUS_RATE as usize / rate;
            let value = self.format.quantize(taken.get(src).copied().unwrap_or(0.0));
            frame.fill(value);
        }
        Ok(())
    }
}

impl AudioDevice for LoopbackDevice {
    fn name(&self) -> &str {
        "loopback"
    }

    fn open_output(&self, format: PcmFormat, frame_ms: u32) -> Result<Box<dyn PcmWriter>> {
        log::debug!("loopback output opened at {}", format);
        Ok(Box::new(LoopbackWriter {
            bus: self.bus.clone(),
            format,
            pacer: Pacer::new(frame_duration(frame_ms)),
        }))
    }

    fn open_input(&self, format: PcmFormat, frame_ms: u32) -> Result<Box<dyn PcmReader>> {
        log::debug!("loopback input opened at {}", format);
        Ok(Box::new(LoopbackReader {
            bus: self.bus.clone(),
            format,
            pacer: Pacer::new(frame_duration(frame_ms)),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_reads_silence() {
        let dev = NullDevice::new();
        let fmt = PcmFormat::new(8000, 1, 16);
        let mut input = dev.open_input(fmt, 5).unwrap();
        let mut buf = vec![1.0; fmt.frame_len(5)];
        input.read_frame(&mut buf).unwrap();
        assert!(buf.iter().all(|s| *s == 0.0));
    }

    #[test]
    fn test_pacing() {
        let dev = NullDevice::new();
        let fmt = PcmFormat::new(8000, 1, 16);
        let mut out = dev.open_output(fmt, 10).unwrap();
        let frame = vec![0.0; fmt.frame_len(10)];
        let start = Instant::now();
        for _ in 0..5 {
            out.write_frame(&frame).unwrap();
        }
        assert!(start.elapsed() >= Duration::from_millis(45));
    }

    #[test]
    fn test_loopback_carries_signal_across_rates() {
        let dev = LoopbackDevice::new();
        let out_fmt = PcmFormat::new(8000, 2, 16);
        let in_fmt = PcmFormat::new(16000, 1, 16);
        let mut out = dev.open_output(out_fmt, 5).unwrap();
        let mut input = dev.open_input(in_fmt, 5).unwrap();

        out.write_frame(&vec![0.5; out_fmt.frame_len(5)]).unwrap();
        let mut buf = vec![0.0; in_fmt.frame_len(5)];
        input.read_frame(&mut buf).unwrap();
        assert!(buf.iter().all(|s| (*s - 0.5).abs() < 1e-3));
        assert_eq!(dev.pending(), 0);
    }

    #[test]
    fn test_loopback_underrun_pads_silence() {
        let dev = LoopbackDevice::new();
        dev.inject(&[0.25; 10], 48_000);
        let fmt = PcmFormat::new(48_000, 1, 32);
        let mut input = dev.open_input(fmt, 1).unwrap();
        let mut buf = vec![1.0; fmt.frame_len(1)];
        input.read_frame(&mut buf).unwrap();
        assert!((buf[0] - 0.25).abs() < 1e-6);
        assert_eq!(buf[47], 0.0);
    }

    #[test]
    fn test_bus_is_bounded() {
        let dev = LoopbackDevice::new();
        dev.inject(&vec![0.1; BUS_CAPACITY * 2], BUS_RATE);
        assert_eq!(dev.pending(), BUS_CAPACITY);
    }
}
