//! Hardware backend through CPAL
//!
//! Thread Safety:
//! `cpal::Stream` is not `Send` on every host, so each stream lives on its
//! own keeper thread. The writer/reader handed to controllers only owns the
//! ring buffer half and a stop channel to that thread.

use super::{AudioDevice, PcmFormat, PcmReader, PcmWriter};
use anyhow::{anyhow, bail, Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::SampleFormat;
use crossbeam_channel::{bounded, Sender};
use ringbuf::traits::{Consumer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use std::time::{Duration, Instant};

/// Frames of slack between the task and the device callback
const RING_FRAMES: usize = 8;
const OPEN_TIMEOUT: Duration = Duration::from_secs(5);
const STALL_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy)]
struct StreamStop;

pub struct CpalDevice {
    output_name: Option<String>,
    input_name: Option<String>,
}

impl CpalDevice {
    pub fn new(output_name: Option<String>, input_name: Option<String>) -> Self {
        Self {
            output_name,
            input_name,
        }
    }
}

fn stream_config(format: PcmFormat) -> cpal::StreamConfig {
    cpal::StreamConfig {
        channels: format.channels,
        sample_rate: cpal::SampleRate(format.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    }
}

fn find_output(name: Option<&str>) -> Result<cpal::Device> {
    let host = cpal::default_host();
    match name {
        Some(name) => host
            .output_devices()?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            .with_context(|| format!("Output device not found: {}", name)),
        None => host
            .default_output_device()
            .context("No default output device available"),
    }
}

fn find_input(name: Option<&str>) -> Result<cpal::Device> {
    let host = cpal::default_host();
    match name {
        Some(name) => host
            .input_devices()?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            .with_context(|| format!("Input device not found: {}", name)),
        None => host
            .default_input_device()
            .context("No default input device available"),
    }
}

fn build_output(
    name: Option<&str>,
    format: PcmFormat,
    mut cons: HeapCons<f32>,
) -> Result<cpal::Stream> {
    let device = find_output(name)?;
    log::info!("Using output device: {}", device.name()?);
    let config = stream_config(format);

    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let n = cons.pop_slice(data);
                data[n..].fill(0.0);
            },
            |err| log::error!("Output stream error: {}", err),
            None,
        )
        .with_context(|| format!("Output stream at {} unsupported", format))?;
    stream.play()?;
    Ok(stream)
}

fn build_input(
    name: Option<&str>,
    format: PcmFormat,
    mut prod: HeapProd<f32>,
) -> Result<cpal::Stream> {
    let device = find_input(name)?;
    log::info!("Using input device: {}", device.name()?);
    let config = stream_config(format);
    let default_format = device
        .default_input_config()
        .map(|c| c.sample_format())
        .unwrap_or(SampleFormat::F32);

    let stream = match default_format {
        SampleFormat::I16 => device.build_input_stream(
            &config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                for s in data {
                    let _ = prod.try_push(*s as f32 / i16::MAX as f32);
                }
            },
            |err| log::error!("Input stream error: {}", err),
            None,
        )?,
        _ => device.build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                prod.push_slice(data);
            },
            |err| log::error!("Input stream error: {}", err),
            None,
        )?,
    };
    stream.play()?;
    Ok(stream)
}

/// Run `build` on a keeper thread that holds the stream until stopped
fn spawn_keeper<F>(label: &'static str, build: F) -> Result<Sender<StreamStop>>
where
    F: FnOnce() -> Result<cpal::Stream> + Send + 'static,
{
    let (stop_tx, stop_rx) = bounded::<StreamStop>(1);
    let (ready_tx, ready_rx) = bounded::<std::result::Result<(), String>>(1);

    // NOT tokio::spawn - std::thread to avoid Send issues
    std::thread::spawn(move || match build() {
        Ok(stream) => {
            let _ = ready_tx.send(Ok(()));
            let _ = stop_rx.recv();
            drop(stream);
            log::debug!("✓ {} stream closed", label);
        }
        Err(e) => {
            let _ = ready_tx.send(Err(format!("{:#}", e)));
        }
    });

    match ready_rx.recv_timeout(OPEN_TIMEOUT) {
        Ok(Ok(())) => Ok(stop_tx),
        Ok(Err(e)) => Err(anyhow!("{} stream failed: {}", label, e)),
        Err(_) => bail!("{} stream did not open within {:?}", label, OPEN_TIMEOUT),
    }
}

struct CpalWriter {
    prod: HeapProd<f32>,
    stop_tx: Sender<StreamStop>,
}

impl PcmWriter for CpalWriter {
    fn write_frame(&mut self, samples: &[f32]) -> Result<()> {
        let started = Instant::now();
        let mut offset = 0;
        while offset < samples.len() {
            offset += self.prod.push_slice(&samples[offset..]);
            if offset < samples.len() {
                if started.elapsed() > STALL_TIMEOUT {
                    bail!("Output device stalled");
                }
                std::thread::sleep(Duration::from_millis(1));
            }
        }
        Ok(())
    }
}

impl Drop for CpalWriter {
    fn drop(&mut self) {
        let _ = self.stop_tx.try_send(StreamStop);
    }
}

struct CpalReader {
    cons: HeapCons<f32>,
    stop_tx: Sender<StreamStop>,
}

impl PcmReader for CpalReader {
    fn read_frame(&mut self, into: &mut [f32]) -> Result<()> {
        let started = Instant::now();
        let mut offset = 0;
        while offset < into.len() {
            offset += self.cons.pop_slice(&mut into[offset..]);
            if offset < into.len() {
                if started.elapsed() > STALL_TIMEOUT {
                    bail!("Input device stalled");
                }
                std::thread::sleep(Duration::from_millis(1));
            }
        }
        Ok(())
    }
}

impl Drop for CpalReader {
    fn drop(&mut self) {
        let _ = self.stop_tx.try_send(StreamStop);
    }
}

impl AudioDevice for CpalDevice {
    fn name(&self) -> &str {
        "cpal"
    }

    fn open_output(&self, format: PcmFormat, frame_ms: u32) -> Result<Box<dyn PcmWriter>> {
        let rb = HeapRb::<f32>::new(format.frame_len(frame_ms).max(1) * RING_FRAMES);
        let (prod, cons) = rb.split();
        let name = self.output_name.clone();
        let stop_tx = spawn_keeper("Output", move || build_output(name.as_deref(), format, cons))?;
        log::info!("✓ Output opened at {}", format);
        Ok(Box::new(CpalWriter { prod, stop_tx }))
    }

    fn open_input(&self, format: PcmFormat, frame_ms: u32) -> Result<Box<dyn PcmReader>> {
        let rb = HeapRb::<f32>::new(format.frame_len(frame_ms).max(1) * RING_FRAMES);
        let (prod, cons) = rb.split();
        let name = self.input_name.clone();
        let stop_tx = spawn_keeper("Input", move || build_input(name.as_deref(), format, prod))?;
        log::info!("✓ Input opened at {}", format);
        Ok(Box::new(CpalReader { cons, stop_tx }))
    }
}
