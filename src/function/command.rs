//! Typed view of a valid function
//!
//! Controllers match on [`Command`] instead of poking at parameter slots.
//! Conversion also enforces the rules that depend on more than one slot.

use super::{FunctionKind, WorkerFunction};
use crate::audio::PcmFormat;
use crate::validation::{self, ValidationError};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlaybackType {
    Offload,
    NonOffload,
}

impl PlaybackType {
    pub fn as_str(self) -> &'static str {
        match self {
            PlaybackType::Offload => "offload",
            PlaybackType::NonOffload => "non-offload",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "offload" => Some(PlaybackType::Offload),
            "non-offload" => Some(PlaybackType::NonOffload),
            _ => None,
        }
    }
}

impl fmt::Display for PlaybackType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackStart {
    pub playback_type: PlaybackType,
    pub target_freqs: Vec<f64>,
    pub playback_id: u32,
    pub low_latency: bool,
    pub amplitude: f64,
    pub format: PcmFormat,
    /// Carried for peers; playback always synthesizes the tone
    pub file: Option<String>,
}

impl PlaybackStart {
    /// Build the equivalent wire function
    pub fn to_function(&self, command_id: impl Into<String>) -> WorkerFunction {
        let freqs = self
            .target_freqs
            .iter()
            .map(|f| f.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let mut f = WorkerFunction::with_id(FunctionKind::PlaybackStart, command_id);
        f.set_parameter("type", self.playback_type.as_str());
        f.set_parameter("target-freqs", freqs);
        f.set_parameter("playback-id", self.playback_id);
        f.set_parameter("low-latency-mode", self.low_latency);
        f.set_parameter("amplitude", self.amplitude);
        f.set_parameter("sampling-freq", self.format.sample_rate);
        f.set_parameter("num-channels", self.format.channels as i64);
        f.set_parameter("pcm-bit-width", self.format.bits_per_sample as i64);
        if let Some(file) = &self.file {
            f.set_parameter("file", file.as_str());
        }
        f
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaybackStop {
    pub playback_type: PlaybackType,
    pub playback_id: u32,
}

impl PlaybackStop {
    pub fn to_function(&self, command_id: Option<&str>) -> WorkerFunction {
        let mut f = WorkerFunction::new(FunctionKind::PlaybackStop);
        f.set_command_id(command_id.map(str::to_string));
        f.set_parameter("type", self.playback_type.as_str());
        f.set_parameter("playback-id", self.playback_id);
        f
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RecordStart {
    pub format: PcmFormat,
    pub dump_buffer_ms: u32,
    pub btsco_on: bool,
}

impl RecordStart {
    pub fn to_function(&self, command_id: impl Into<String>) -> WorkerFunction {
        let mut f = WorkerFunction::with_id(FunctionKind::RecordStart, command_id);
        f.set_parameter("sampling-freq", self.format.sample_rate);
        f.set_parameter("num-channels", self.format.channels as i64);
        f.set_parameter("pcm-bit-width", self.format.bits_per_sample as i64);
        f.set_parameter("dump-buffer-ms", self.dump_buffer_ms);
        f.set_parameter("btsco-on", self.btsco_on);
        f
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DetectOp {
    Register {
        class: String,
        params: Option<String>,
    },
    Unregister {
        handle: String,
    },
    SetParams {
        handle: String,
        params: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct VoipStart {
    pub rx_target_freq: f64,
    pub rx_amplitude: f64,
    pub rx_format: PcmFormat,
    pub tx_format: PcmFormat,
    pub tx_dump_buffer_ms: u32,
}

/// Live Rx update; `None` keeps the running value
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VoipConfig {
    pub rx_target_freq: Option<f64>,
    pub rx_amplitude: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectorEvent {
    pub class_handle: String,
    pub event: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    PlaybackStart(PlaybackStart),
    PlaybackStop(PlaybackStop),
    PlaybackInfo { filename: Option<String> },
    RecordStart(RecordStart),
    RecordStop,
    RecordInfo { filename: Option<String> },
    RecordDetect(DetectOp),
    RecordDump { filename: String },
    RecordEvent(DetectorEvent),
    VoipStart(VoipStart),
    VoipStop,
    VoipConfig(VoipConfig),
    VoipInfo { filename: Option<String> },
    VoipDetect(DetectOp),
    VoipTxDump { filename: String },
    VoipEvent(DetectorEvent),
}

fn missing(attr: &str) -> ValidationError {
    ValidationError::MissingRequired(attr.to_string())
}

fn req_str<'a>(f: &'a WorkerFunction, attr: &str) -> Result<&'a str, ValidationError> {
    f.str(attr).ok_or_else(|| missing(attr))
}

fn req_int(f: &WorkerFunction, attr: &str) -> Result<i64, ValidationError> {
    f.int(attr).ok_or_else(|| missing(attr))
}

fn req_float(f: &WorkerFunction, attr: &str) -> Result<f64, ValidationError> {
    f.float(attr).ok_or_else(|| missing(attr))
}

fn format(f: &WorkerFunction, prefix: &str) -> Result<PcmFormat, ValidationError> {
    Ok(PcmFormat {
        sample_rate: validation::validate_sampling_freq(req_int(
            f,
            &format!("{}sampling-freq", prefix),
        )?)?,
        channels: validation::validate_num_channels(req_int(f, &format!("{}num-channels", prefix))?)?,
        bits_per_sample: validation::validate_bit_width(req_int(
            f,
            &format!("{}pcm-bit-width", prefix),
        )?)?,
    })
}

fn playback_type(f: &WorkerFunction) -> Result<PlaybackType, ValidationError> {
    let s = req_str(f, "type")?;
    PlaybackType::parse(s)
        .ok_or_else(|| ValidationError::InvalidFormat(format!("Unknown playback type '{}'", s)))
}

fn info_filename(f: &WorkerFunction) -> Option<String> {
    f.str("filename")
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn detect_op(f: &WorkerFunction) -> Result<DetectOp, ValidationError> {
    let params = f.str("params").map(str::to_string);
    match req_str(f, "type")? {
        "register" => Ok(DetectOp::Register {
            class: req_str(f, "class")?.to_string(),
            params,
        }),
        "unregister" => Ok(DetectOp::Unregister {
            handle: req_str(f, "class-handle")?.to_string(),
        }),
        "setparams" => Ok(DetectOp::SetParams {
            handle: req_str(f, "class-handle")?.to_string(),
            params,
        }),
        other => Err(ValidationError::InvalidFormat(format!(
            "Unknown detect operation '{}'",
            other
        ))),
    }
}

fn detector_event(f: &WorkerFunction) -> Result<DetectorEvent, ValidationError> {
    Ok(DetectorEvent {
        class_handle: req_str(f, "class-handle")?.to_string(),
        event: validation::validate_json_object(req_str(f, "event")?)?,
    })
}

fn unchanged_if_sentinel(v: Option<f64>) -> Option<f64> {
    v.filter(|x| *x != -1.0)
}

impl TryFrom<&WorkerFunction> for Command {
    type Error = ValidationError;

    fn try_from(f: &WorkerFunction) -> Result<Self, Self::Error> {
        let command = match f.kind() {
            FunctionKind::PlaybackStart => {
                let playback_type = playback_type(f)?;
                let file = req_str(f, "file")?;
                validation::validate_playback_file(file, playback_type.as_str())?;
                Command::PlaybackStart(PlaybackStart {
                    playback_type,
                    target_freqs: validation::validate_target_freqs(req_str(f, "target-freqs")?)?,
                    playback_id: validation::validate_non_negative(
                        req_int(f, "playback-id")?,
                        "playback-id",
                    )?,
                    low_latency: f.bool("low-latency-mode").unwrap_or(false),
                    amplitude: validation::validate_amplitude(req_float(f, "amplitude")?)?,
                    format: format(f, "")?,
                    file: (file != "null").then(|| file.to_string()),
                })
            }
            FunctionKind::PlaybackStop => Command::PlaybackStop(PlaybackStop {
                playback_type: playback_type(f)?,
                playback_id: validation::validate_non_negative(
                    req_int(f, "playback-id")?,
                    "playback-id",
                )?,
            }),
            FunctionKind::PlaybackInfo => Command::PlaybackInfo {
                filename: info_filename(f),
            },
            FunctionKind::RecordStart => Command::RecordStart(RecordStart {
                format: format(f, "")?,
                dump_buffer_ms: validation::validate_dump_buffer_ms(req_int(f, "dump-buffer-ms")?)?,
                btsco_on: f.bool("btsco-on").unwrap_or(false),
            }),
            FunctionKind::RecordStop => Command::RecordStop,
            FunctionKind::RecordInfo => Command::RecordInfo {
                filename: info_filename(f),
            },
            FunctionKind::RecordDetect => Command::RecordDetect(detect_op(f)?),
            FunctionKind::RecordDump => Command::RecordDump {
                filename: validation::validate_file_name(req_str(f, "filename")?)?,
            },
            FunctionKind::RecordEvent => Command::RecordEvent(detector_event(f)?),
            FunctionKind::VoipStart => Command::VoipStart(VoipStart {
                rx_target_freq: validation::validate_frequency(req_float(f, "rx-target-freq")?)?,
                rx_amplitude: validation::validate_amplitude(req_float(f, "rx-amplitude")?)?,
                rx_format: format(f, "rx-")?,
                tx_format: format(f, "tx-")?,
                tx_dump_buffer_ms: validation::validate_dump_buffer_ms(req_int(f, "tx-dump-buffer-ms")?)?,
            }),
            FunctionKind::VoipStop => Command::VoipStop,
            FunctionKind::VoipConfig => Command::VoipConfig(VoipConfig {
                rx_target_freq: unchanged_if_sentinel(f.float("rx-target-freq")),
                rx_amplitude: unchanged_if_sentinel(f.float("rx-amplitude")),
            }),
            FunctionKind::VoipInfo => Command::VoipInfo {
                filename: info_filename(f),
            },
            FunctionKind::VoipDetect => Command::VoipDetect(detect_op(f)?),
            FunctionKind::VoipTxDump => Command::VoipTxDump {
                filename: validation::validate_file_name(req_str(f, "filename")?)?,
            },
            FunctionKind::VoipEvent => Command::VoipEvent(detector_event(f)?),
        };
        Ok(command)
    }
}
