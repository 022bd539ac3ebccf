//! Signal detectors attached to a running recording
//!
//! Detectors are resolved by class name (last dotted segment), get a unique
//! `<Class>@<hex>` handle and are fed every consumed frame on the recording
//! thread. A detection change produces an event payload that the owning
//! controller wraps into an event function for the registering listener.

pub mod tone;

use crate::audio::PcmFormat;
use crate::function::SharedListener;
use anyhow::Result;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use thiserror::Error;

pub trait Detector: Send {
    fn handle(&self) -> &str;

    fn class_name(&self) -> &'static str;

    /// Apply a JSON parameter object; on error nothing changes
    fn set_params(&mut self, params: &Map<String, Value>) -> Result<()>;

    /// Consume one interleaved frame; returns an event payload on change
    fn feed(&mut self, frame: &[f32], format: PcmFormat) -> Option<Value>;

    fn to_json(&self) -> Value;
}

#[derive(Error, Debug, PartialEq)]
pub enum DetectorError {
    #[error("invalid detector class name")]
    UnknownClass(String),

    #[error("invalid class handle")]
    UnknownHandle(String),

    #[error("invalid detector parameters: {0}")]
    InvalidParams(String),
}

static NEXT_HANDLE: AtomicU32 = AtomicU32::new(1);

fn next_handle(class: &str) -> String {
    format!("{}@{:x}", class, NEXT_HANDLE.fetch_add(1, Ordering::Relaxed))
}

/// Resolve a class name to a fresh detector instance
pub fn create(class: &str, data_dir: &Path) -> Result<Box<dyn Detector>, DetectorError> {
    let short = class.rsplit('.').next().unwrap_or(class);
    match short {
        tone::CLASS_NAME => Ok(Box::new(tone::ToneDetector::new(
            next_handle(tone::CLASS_NAME),
            data_dir.to_path_buf(),
        ))),
        _ => Err(DetectorError::UnknownClass(class.to_string())),
    }
}

pub fn is_known_class(class: &str) -> bool {
    let short = class.rsplit('.').next().unwrap_or(class);
    short == tone::CLASS_NAME
}

fn parse_params(params: Option<&str>) -> Result<Map<String, Value>, DetectorError> {
    match params {
        None => Ok(Map::new()),
        Some(text) => crate::validation::validate_json_object(text)
            .map_err(|e| DetectorError::InvalidParams(e.to_string())),
    }
}

struct Registered {
    detector: Box<dyn Detector>,
    listener: SharedListener,
}

/// A detection change ready to be delivered outside the registry lock
pub struct PendingEvent {
    pub class_handle: String,
    pub payload: Value,
    pub listener: SharedListener,
}

/// Detectors registered against one recording
pub struct DetectorRegistry {
    data_dir: PathBuf,
    entries: Vec<Registered>,
}

impl DetectorRegistry {
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            entries: Vec::new(),
        }
    }

    /// Create, configure and attach a detector; returns its handle
    pub fn register(
        &mut self,
        class: &str,
        params: Option<&str>,
        listener: SharedListener,
    ) -> Result<String, DetectorError> {
        let mut detector = create(class, &self.data_dir)?;
        let params = parse_params(params)?;
        detector
            .set_params(&params)
            .map_err(|e| DetectorError::InvalidParams(format!("{:#}", e)))?;
        let handle = detector.handle().to_string();
        log::info!("Detector registered: {}", handle);
        self.entries.push(Registered { detector, listener });
        Ok(handle)
    }

    pub fn unregister(&mut self, handle: &str) -> Result<(), DetectorError> {
        let index = self
            .entries
            .iter()
            .position(|e| e.detector.handle() == handle)
            .ok_or_else(|| DetectorError::UnknownHandle(handle.to_string()))?;
        self.entries.remove(index);
        log::info!("Detector unregistered: {}", handle);
        Ok(())
    }

    pub fn set_params(&mut self, handle: &str, params: Option<&str>) -> Result<(), DetectorError> {
        let params = parse_params(params)?;
        let entry = self
            .entries
            .iter_mut()
            .find(|e| e.detector.handle() == handle)
            .ok_or_else(|| DetectorError::UnknownHandle(handle.to_string()))?;
        entry
            .detector
            .set_params(&params)
            .map_err(|e| DetectorError::InvalidParams(format!("{:#}", e)))
    }

    pub fn feed(&mut self, frame: &[f32], format: PcmFormat) -> Vec<PendingEvent> {
        self.entries
            .iter_mut()
            .filter_map(|e| {
                e.detector.feed(frame, format).map(|payload| PendingEvent {
                    class_handle: e.detector.handle().to_string(),
                    payload,
                    listener: e.listener.clone(),
                })
            })
            .collect()
    }

    /// Detector state keyed by handle
    pub fn to_json(&self) -> Value {
        let map: Map<String, Value> = self
            .entries
            .iter()
            .map(|e| (e.detector.handle().to_string(), e.detector.to_json()))
            .collect();
        Value::Object(map)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        if !self.entries.is_empty() {
            log::debug!("Clearing {} detectors", self.entries.len());
        }
        self.entries.clear();
    }
}
