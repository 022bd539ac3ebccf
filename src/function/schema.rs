//! Per-kind parameter schemas
//!
//! Each kind owns an ordered table of (attribute, type, required, default,
//! acceptance) entries. The acceptance predicate sees the already coerced
//! value plus the sibling slots, so cross-attribute rules such as the
//! playback file extension can consult the current `type`.

use super::{FunctionKind, ParamValue, Parameter};
use crate::validation::{self, ValidationError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    Bool,
    Int,
    Float,
    Str,
}

/// Compile-time default of a slot
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DefaultValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(&'static str),
}

impl DefaultValue {
    pub fn to_value(self) -> ParamValue {
        match self {
            DefaultValue::Null => ParamValue::Null,
            DefaultValue::Bool(v) => ParamValue::Bool(v),
            DefaultValue::Int(v) => ParamValue::Int(v),
            DefaultValue::Float(v) => ParamValue::Float(v),
            DefaultValue::Str(v) => ParamValue::Str(v.to_string()),
        }
    }
}

pub type Acceptor = fn(&ParamValue, &[Parameter]) -> Result<(), ValidationError>;

pub struct ParamSpec {
    pub attr: &'static str,
    pub ty: ParamType,
    pub required: bool,
    pub default: DefaultValue,
    pub accept: Acceptor,
}

impl std::fmt::Debug for ParamSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParamSpec")
            .field("attr", &self.attr)
            .field("ty", &self.ty)
            .field("required", &self.required)
            .field("default", &self.default)
            .finish()
    }
}

const fn spec(
    attr: &'static str,
    ty: ParamType,
    required: bool,
    default: DefaultValue,
    accept: Acceptor,
) -> ParamSpec {
    ParamSpec {
        attr,
        ty,
        required,
        default,
        accept,
    }
}

pub const PLAYBACK_TYPES: [&str; 2] = ["offload", "non-offload"];
pub const DETECT_OPS: [&str; 3] = ["register", "unregister", "setparams"];

fn accept_any(_: &ParamValue, _: &[Parameter]) -> Result<(), ValidationError> {
    Ok(())
}

fn accept_playback_type(v: &ParamValue, _: &[Parameter]) -> Result<(), ValidationError> {
    match v.as_str() {
        Some(s) => validation::validate_choice(s, &PLAYBACK_TYPES).map(|_| ()),
        None => Ok(()),
    }
}

fn accept_detect_op(v: &ParamValue, _: &[Parameter]) -> Result<(), ValidationError> {
    match v.as_str() {
        Some(s) => validation::validate_choice(s, &DETECT_OPS).map(|_| ()),
        None => Ok(()),
    }
}

fn accept_target_freqs(v: &ParamValue, _: &[Parameter]) -> Result<(), ValidationError> {
    match v.as_str() {
        Some(s) => validation::validate_target_freqs(s).map(|_| ()),
        None => Ok(()),
    }
}

fn accept_non_negative(v: &ParamValue, _: &[Parameter]) -> Result<(), ValidationError> {
    match v.as_i64() {
        Some(n) => validation::validate_non_negative(n, "value").map(|_| ()),
        None => Ok(()),
    }
}

fn accept_dump_buffer_ms(v: &ParamValue, _: &[Parameter]) -> Result<(), ValidationError> {
    match v.as_i64() {
        Some(n) => validation::validate_dump_buffer_ms(n).map(|_| ()),
        None => Ok(()),
    }
}

fn accept_code(v: &ParamValue, allowed: &[i64], what: &str) -> Result<(), ValidationError> {
    match v.as_i64() {
        Some(n) => validation::validate_code(n, allowed, what).map(|_| ()),
        None => Ok(()),
    }
}

fn accept_stream_type(v: &ParamValue, _: &[Parameter]) -> Result<(), ValidationError> {
    accept_code(v, &validation::STREAM_TYPES, "stream-type")
}

fn accept_usage(v: &ParamValue, _: &[Parameter]) -> Result<(), ValidationError> {
    accept_code(v, &validation::USAGES, "usage")
}

fn accept_content_type(v: &ParamValue, _: &[Parameter]) -> Result<(), ValidationError> {
    accept_code(v, &validation::CONTENT_TYPES, "content-type")
}

fn accept_performance_mode(v: &ParamValue, _: &[Parameter]) -> Result<(), ValidationError> {
    accept_code(v, &validation::PERFORMANCE_MODES, "performance-mode")
}

fn accept_amplitude(v: &ParamValue, _: &[Parameter]) -> Result<(), ValidationError> {
    match v.as_f64() {
        Some(a) => validation::validate_amplitude(a).map(|_| ()),
        None => Ok(()),
    }
}

fn accept_frequency(v: &ParamValue, _: &[Parameter]) -> Result<(), ValidationError> {
    match v.as_f64() {
        Some(f) => validation::validate_frequency(f).map(|_| ()),
        None => Ok(()),
    }
}

// -1 keeps the running value
fn accept_config_amplitude(v: &ParamValue, siblings: &[Parameter]) -> Result<(), ValidationError> {
    match v.as_f64() {
        Some(a) if a == -1.0 => Ok(()),
        _ => accept_amplitude(v, siblings),
    }
}

fn accept_config_frequency(v: &ParamValue, siblings: &[Parameter]) -> Result<(), ValidationError> {
    match v.as_f64() {
        Some(f) if f == -1.0 => Ok(()),
        _ => accept_frequency(v, siblings),
    }
}

fn accept_sampling_freq(v: &ParamValue, _: &[Parameter]) -> Result<(), ValidationError> {
    match v.as_i64() {
        Some(n) => validation::validate_sampling_freq(n).map(|_| ()),
        None => Ok(()),
    }
}

fn accept_channels(v: &ParamValue, _: &[Parameter]) -> Result<(), ValidationError> {
    match v.as_i64() {
        Some(n) => validation::validate_num_channels(n).map(|_| ()),
        None => Ok(()),
    }
}

fn accept_bit_width(v: &ParamValue, _: &[Parameter]) -> Result<(), ValidationError> {
    match v.as_i64() {
        Some(n) => validation::validate_bit_width(n).map(|_| ()),
        None => Ok(()),
    }
}

fn accept_playback_file(v: &ParamValue, siblings: &[Parameter]) -> Result<(), ValidationError> {
    let Some(file) = v.as_str() else {
        return Ok(());
    };
    let playback_type = siblings
        .iter()
        .find(|p| p.attribute() == "type")
        .and_then(|p| p.value().as_str())
        .unwrap_or("");
    validation::validate_playback_file(file, playback_type)
}

fn accept_json_object(v: &ParamValue, _: &[Parameter]) -> Result<(), ValidationError> {
    match v.as_str() {
        Some(s) => validation::validate_json_object(s).map(|_| ()),
        None => Ok(()),
    }
}

fn accept_file_name(v: &ParamValue, _: &[Parameter]) -> Result<(), ValidationError> {
    match v.as_str() {
        Some(s) => validation::validate_file_name(s).map(|_| ()),
        None => Ok(()),
    }
}

// Info file names may be empty (no file side effect)
fn accept_optional_file_name(v: &ParamValue, siblings: &[Parameter]) -> Result<(), ValidationError> {
    match v.as_str() {
        Some("") | None => Ok(()),
        Some(_) => accept_file_name(v, siblings),
    }
}

use DefaultValue as D;
use ParamType as T;

static PLAYBACK_START: [ParamSpec; 13] = [
    spec("type", T::Str, true, D::Null, accept_playback_type),
    spec("target-freqs", T::Str, true, D::Null, accept_target_freqs),
    spec("playback-id", T::Int, true, D::Null, accept_non_negative),
    spec("low-latency-mode", T::Bool, false, D::Bool(false), accept_any),
    spec("amplitude", T::Float, false, D::Float(0.6), accept_amplitude),
    spec("sampling-freq", T::Int, false, D::Int(44100), accept_sampling_freq),
    spec("num-channels", T::Int, false, D::Int(2), accept_channels),
    spec("pcm-bit-width", T::Int, false, D::Int(16), accept_bit_width),
    spec("file", T::Str, false, D::Str("null"), accept_playback_file),
    spec("stream-type", T::Int, false, D::Int(3), accept_stream_type),
    spec("usage", T::Int, false, D::Int(1), accept_usage),
    spec("content-type", T::Int, false, D::Int(2), accept_content_type),
    spec("performance-mode", T::Int, false, D::Int(-1), accept_performance_mode),
];

static PLAYBACK_STOP: [ParamSpec; 2] = [
    spec("type", T::Str, false, D::Str("non-offload"), accept_playback_type),
    spec("playback-id", T::Int, false, D::Int(0), accept_non_negative),
];

static INFO: [ParamSpec; 1] = [spec(
    "filename",
    T::Str,
    false,
    D::Str(""),
    accept_optional_file_name,
)];

static RECORD_START: [ParamSpec; 5] = [
    spec("sampling-freq", T::Int, false, D::Int(44100), accept_sampling_freq),
    spec("num-channels", T::Int, false, D::Int(2), accept_channels),
    spec("pcm-bit-width", T::Int, false, D::Int(16), accept_bit_width),
    spec("dump-buffer-ms", T::Int, false, D::Int(0), accept_dump_buffer_ms),
    spec("btsco-on", T::Bool, false, D::Bool(false), accept_any),
];

static DETECT: [ParamSpec; 4] = [
    spec("type", T::Str, true, D::Null, accept_detect_op),
    spec("class", T::Str, false, D::Null, accept_any),
    spec("class-handle", T::Str, false, D::Null, accept_any),
    spec("params", T::Str, false, D::Null, accept_json_object),
];

static DUMP: [ParamSpec; 1] = [spec("filename", T::Str, true, D::Null, accept_file_name)];

static EVENT: [ParamSpec; 2] = [
    spec("event", T::Str, true, D::Null, accept_json_object),
    spec("class-handle", T::Str, true, D::Null, accept_any),
];

static VOIP_START: [ParamSpec; 10] = [
    spec("rx-target-freq", T::Float, true, D::Null, accept_frequency),
    spec("rx-amplitude", T::Float, false, D::Float(0.6), accept_amplitude),
    spec("rx-sampling-freq", T::Int, false, D::Int(8000), accept_sampling_freq),
    spec("rx-num-channels", T::Int, false, D::Int(1), accept_channels),
    spec("rx-pcm-bit-width", T::Int, false, D::Int(16), accept_bit_width),
    spec("rx-use-spkr", T::Bool, false, D::Bool(false), accept_any),
    spec("tx-sampling-freq", T::Int, false, D::Int(8000), accept_sampling_freq),
    spec("tx-num-channels", T::Int, false, D::Int(1), accept_channels),
    spec("tx-pcm-bit-width", T::Int, false, D::Int(16), accept_bit_width),
    spec("tx-dump-buffer-ms", T::Int, false, D::Int(0), accept_dump_buffer_ms),
];

static VOIP_CONFIG: [ParamSpec; 2] = [
    spec("rx-target-freq", T::Float, false, D::Float(-1.0), accept_config_frequency),
    spec("rx-amplitude", T::Float, false, D::Float(-1.0), accept_config_amplitude),
];

static EMPTY: [ParamSpec; 0] = [];

pub(super) fn schema_for(kind: FunctionKind) -> &'static [ParamSpec] {
    match kind {
        FunctionKind::PlaybackStart => &PLAYBACK_START,
        FunctionKind::PlaybackStop => &PLAYBACK_STOP,
        FunctionKind::PlaybackInfo | FunctionKind::RecordInfo | FunctionKind::VoipInfo => &INFO,
        FunctionKind::RecordStart => &RECORD_START,
        FunctionKind::RecordStop | FunctionKind::VoipStop => &EMPTY,
        FunctionKind::RecordDetect | FunctionKind::VoipDetect => &DETECT,
        FunctionKind::RecordDump | FunctionKind::VoipTxDump => &DUMP,
        FunctionKind::RecordEvent | FunctionKind::VoipEvent => &EVENT,
        FunctionKind::VoipStart => &VOIP_START,
        FunctionKind::VoipConfig => &VOIP_CONFIG,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::WorkerFunction;
    use std::collections::HashSet;

    #[test]
    fn test_attributes_unique_per_kind() {
        for kind in FunctionKind::ALL {
            let attrs: HashSet<_> = kind.schema().iter().map(|s| s.attr).collect();
            assert_eq!(attrs.len(), kind.schema().len(), "{}", kind);
        }
    }

    #[test]
    fn test_defaults_pass_their_predicate() {
        for kind in FunctionKind::ALL {
            let params: Vec<Parameter> = kind.schema().iter().map(Parameter::new).collect();
            for p in &params {
                assert!(
                    (p.spec.accept)(p.value(), &params).is_ok(),
                    "{}.{}",
                    kind,
                    p.attribute()
                );
            }
        }
    }

    #[test]
    fn test_required_slots_have_no_default() {
        for kind in FunctionKind::ALL {
            for s in kind.schema().iter().filter(|s| s.required) {
                assert_eq!(s.default, DefaultValue::Null, "{}.{}", kind, s.attr);
            }
        }
    }

    #[test]
    fn test_config_sentinel() {
        let params: Vec<Parameter> = VOIP_CONFIG.iter().map(Parameter::new).collect();
        assert!(accept_config_amplitude(&ParamValue::Float(-1.0), &params).is_ok());
        assert!(accept_config_amplitude(&ParamValue::Float(-0.5), &params).is_err());
        assert!(accept_config_frequency(&ParamValue::Float(-1.0), &params).is_ok());
        assert!(accept_config_frequency(&ParamValue::Float(0.0), &params).is_err());
        assert!(accept_config_frequency(&ParamValue::Float(1000.0), &params).is_ok());
    }

    #[test]
    fn test_output_attributes_pass_through() {
        let wire = r#"{"class":"PlaybackStartFunction","command-id":"p::40","params":{
            "type":"non-offload","target-freqs":"1000","playback-id":0,
            "stream-type":0,"usage":2,"content-type":1997,"performance-mode":1}}"#;
        let f = WorkerFunction::from_wire(wire).unwrap();
        assert!(f.is_valid());
        assert_eq!(f.int("stream-type"), Some(0));
        assert_eq!(f.int("usage"), Some(2));
        assert_eq!(f.int("content-type"), Some(1997));
        assert_eq!(f.int("performance-mode"), Some(1));

        let mut f = WorkerFunction::new(FunctionKind::PlaybackStart);
        assert!(!f.set_parameter("usage", 15));
        assert_eq!(f.int("usage"), Some(1));
        assert!(!f.set_parameter("performance-mode", 7));
        assert_eq!(f.int("performance-mode"), Some(-1));

        let mut v = WorkerFunction::new(FunctionKind::VoipStart);
        assert_eq!(v.bool("rx-use-spkr"), Some(false));
        assert!(v.set_parameter("rx-use-spkr", true));
        assert!(v.to_wire().contains(r#""rx-use-spkr":true"#));
    }
}
