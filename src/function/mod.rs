//! Worker function object model
//!
//! A [`WorkerFunction`] is one parameterized command: a kind, a correlation
//! id, an ordered parameter set fixed by the kind's schema, and the Acks
//! received for it so far. Controllers never look at raw parameters; they
//! convert a valid function into a typed [`Command`] first.

pub mod ack;
pub mod command;
pub mod id;
pub mod schema;
pub mod wire;

pub use ack::{Ack, AckListener, SharedListener};
pub use command::Command;
pub use id::CommandIdGenerator;
pub use schema::{ParamSpec, ParamType};

use crate::validation::ValidationError;
use std::fmt;

/// Routing family of a function kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FunctionGroup {
    Playback,
    Record,
    Voip,
}

/// Every concrete command kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FunctionKind {
    PlaybackStart,
    PlaybackStop,
    PlaybackInfo,
    RecordStart,
    RecordStop,
    RecordInfo,
    RecordDetect,
    RecordDump,
    RecordEvent,
    VoipStart,
    VoipStop,
    VoipConfig,
    VoipInfo,
    VoipDetect,
    VoipTxDump,
    VoipEvent,
}

impl FunctionKind {
    pub const ALL: [FunctionKind; 16] = [
        FunctionKind::PlaybackStart,
        FunctionKind::PlaybackStop,
        FunctionKind::PlaybackInfo,
        FunctionKind::RecordStart,
        FunctionKind::RecordStop,
        FunctionKind::RecordInfo,
        FunctionKind::RecordDetect,
        FunctionKind::RecordDump,
        FunctionKind::RecordEvent,
        FunctionKind::VoipStart,
        FunctionKind::VoipStop,
        FunctionKind::VoipConfig,
        FunctionKind::VoipInfo,
        FunctionKind::VoipDetect,
        FunctionKind::VoipTxDump,
        FunctionKind::VoipEvent,
    ];

    /// Wire class identifier
    pub fn class_name(self) -> &'static str {
        match self {
            FunctionKind::PlaybackStart => "PlaybackStartFunction",
            FunctionKind::PlaybackStop => "PlaybackStopFunction",
            FunctionKind::PlaybackInfo => "PlaybackInfoFunction",
            FunctionKind::RecordStart => "RecordStartFunction",
            FunctionKind::RecordStop => "RecordStopFunction",
            FunctionKind::RecordInfo => "RecordInfoFunction",
            FunctionKind::RecordDetect => "RecordDetectFunction",
            FunctionKind::RecordDump => "RecordDumpFunction",
            FunctionKind::RecordEvent => "RecordEventFunction",
            FunctionKind::VoipStart => "VoIPStartFunction",
            FunctionKind::VoipStop => "VoIPStopFunction",
            FunctionKind::VoipConfig => "VoIPConfigFunction",
            FunctionKind::VoipInfo => "VoIPInfoFunction",
            FunctionKind::VoipDetect => "VoIPDetectFunction",
            FunctionKind::VoipTxDump => "VoIPTxDumpFunction",
            FunctionKind::VoipEvent => "VoIPEventFunction",
        }
    }

    /// Resolve a wire class name; dotted names match on their last segment
    pub fn from_class_name(name: &str) -> Option<Self> {
        let short = name.rsplit('.').next().unwrap_or(name);
        Self::ALL.into_iter().find(|kind| kind.class_name() == short)
    }

    pub fn group(self) -> FunctionGroup {
        match self {
            FunctionKind::PlaybackStart | FunctionKind::PlaybackStop | FunctionKind::PlaybackInfo => {
                FunctionGroup::Playback
            }
            FunctionKind::RecordStart
            | FunctionKind::RecordStop
            | FunctionKind::RecordInfo
            | FunctionKind::RecordDetect
            | FunctionKind::RecordDump
            | FunctionKind::RecordEvent => FunctionGroup::Record,
            _ => FunctionGroup::Voip,
        }
    }

    /// Kinds that launch a task answered by more than one Ack
    pub fn is_start(self) -> bool {
        matches!(
            self,
            FunctionKind::PlaybackStart | FunctionKind::RecordStart | FunctionKind::VoipStart
        )
    }

    pub fn is_stop(self) -> bool {
        matches!(
            self,
            FunctionKind::PlaybackStop | FunctionKind::RecordStop | FunctionKind::VoipStop
        )
    }

    /// Detector notifications raised by a running task
    pub fn is_event(self) -> bool {
        matches!(self, FunctionKind::RecordEvent | FunctionKind::VoipEvent)
    }

    pub fn schema(self) -> &'static [ParamSpec] {
        schema::schema_for(self)
    }
}

impl fmt::Display for FunctionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.class_name())
    }
}

/// Dynamically typed parameter value
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl ParamValue {
    pub fn is_null(&self) -> bool {
        matches!(self, ParamValue::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ParamValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Float(v) => Some(*v),
            ParamValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParamValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::Str(v) => Some(v),
            _ => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            ParamValue::Null => serde_json::Value::Null,
            ParamValue::Bool(v) => serde_json::Value::Bool(*v),
            ParamValue::Int(v) => serde_json::Value::from(*v),
            ParamValue::Float(v) => serde_json::Number::from_f64(*v)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            ParamValue::Str(v) => serde_json::Value::String(v.clone()),
        }
    }

    /// Convert to the slot type, by value; `None` when no conversion exists
    pub fn coerce(self, ty: ParamType) -> Option<ParamValue> {
        match (ty, self) {
            (_, ParamValue::Null) => None,
            (ParamType::Int, ParamValue::Int(v)) => Some(ParamValue::Int(v)),
            (ParamType::Int, ParamValue::Float(v)) if v.is_finite() => {
                Some(ParamValue::Int(v.trunc() as i64))
            }
            (ParamType::Int, ParamValue::Str(s)) => {
                let s = s.trim();
                s.parse::<i64>()
                    .ok()
                    .or_else(|| s.parse::<f64>().ok().filter(|v| v.is_finite()).map(|v| v.trunc() as i64))
                    .map(ParamValue::Int)
            }
            (ParamType::Float, ParamValue::Int(v)) => Some(ParamValue::Float(v as f64)),
            (ParamType::Float, ParamValue::Float(v)) => Some(ParamValue::Float(v)),
            (ParamType::Float, ParamValue::Str(s)) => {
                s.trim().parse::<f64>().ok().map(ParamValue::Float)
            }
            (ParamType::Bool, ParamValue::Bool(v)) => Some(ParamValue::Bool(v)),
            (ParamType::Bool, ParamValue::Str(s)) => match s.trim() {
                "true" => Some(ParamValue::Bool(true)),
                "false" => Some(ParamValue::Bool(false)),
                _ => None,
            },
            (ParamType::Str, ParamValue::Str(s)) => Some(ParamValue::Str(s)),
            (ParamType::Str, ParamValue::Int(v)) => Some(ParamValue::Str(v.to_string())),
            (ParamType::Str, ParamValue::Float(v)) => Some(ParamValue::Str(v.to_string())),
            (ParamType::Str, ParamValue::Bool(v)) => Some(ParamValue::Str(v.to_string())),
            _ => None,
        }
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Int(v)
    }
}

impl From<i32> for ParamValue {
    fn from(v: i32) -> Self {
        ParamValue::Int(v as i64)
    }
}

impl From<u32> for ParamValue {
    fn from(v: u32) -> Self {
        ParamValue::Int(v as i64)
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Float(v)
    }
}

impl From<f32> for ParamValue {
    fn from(v: f32) -> Self {
        ParamValue::Float(v as f64)
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        ParamValue::Bool(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Str(v.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        ParamValue::Str(v)
    }
}

impl<T: Into<ParamValue>> From<Option<T>> for ParamValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(ParamValue::Null)
    }
}

impl From<&serde_json::Value> for ParamValue {
    fn from(v: &serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => ParamValue::Null,
            serde_json::Value::Bool(b) => ParamValue::Bool(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => ParamValue::Int(i),
                None => n.as_f64().map(ParamValue::Float).unwrap_or(ParamValue::Null),
            },
            serde_json::Value::String(s) => ParamValue::Str(s.clone()),
            // Arrays and objects travel as their JSON text
            other => ParamValue::Str(other.to_string()),
        }
    }
}

/// A named, typed value slot owned by one function
#[derive(Debug, Clone)]
pub struct Parameter {
    spec: &'static ParamSpec,
    value: ParamValue,
    set: bool,
}

impl Parameter {
    fn new(spec: &'static ParamSpec) -> Self {
        Self {
            spec,
            value: spec.default.to_value(),
            set: false,
        }
    }

    pub fn attribute(&self) -> &'static str {
        self.spec.attr
    }

    pub fn param_type(&self) -> ParamType {
        self.spec.ty
    }

    pub fn is_required(&self) -> bool {
        self.spec.required
    }

    pub fn value(&self) -> &ParamValue {
        &self.value
    }

    /// True once a value was explicitly assigned
    pub fn is_set(&self) -> bool {
        self.set
    }
}

/// One parameterized command with its correlation id and Ack history
#[derive(Debug, Clone)]
pub struct WorkerFunction {
    kind: FunctionKind,
    command_id: Option<String>,
    params: Vec<Parameter>,
    acks: Vec<Ack>,
}

impl WorkerFunction {
    pub fn new(kind: FunctionKind) -> Self {
        Self {
            kind,
            command_id: None,
            params: kind.schema().iter().map(Parameter::new).collect(),
            acks: Vec::new(),
        }
    }

    pub fn with_id(kind: FunctionKind, command_id: impl Into<String>) -> Self {
        let mut function = Self::new(kind);
        function.command_id = Some(command_id.into());
        function
    }

    pub fn kind(&self) -> FunctionKind {
        self.kind
    }

    pub fn group(&self) -> FunctionGroup {
        self.kind.group()
    }

    pub fn command_id(&self) -> Option<&str> {
        self.command_id.as_deref()
    }

    pub fn set_command_id(&mut self, command_id: Option<String>) {
        self.command_id = command_id;
    }

    pub fn parameters(&self) -> &[Parameter] {
        &self.params
    }

    pub fn parameter(&self, attr: &str) -> Option<&Parameter> {
        self.params.iter().find(|p| p.attribute() == attr)
    }

    pub fn value(&self, attr: &str) -> &ParamValue {
        const NULL: ParamValue = ParamValue::Null;
        self.parameter(attr).map(|p| p.value()).unwrap_or(&NULL)
    }

    /// Assign a parameter; rejected values leave the slot untouched
    ///
    /// Returns whether the value was applied.
    pub fn set_parameter(&mut self, attr: &str, value: impl Into<ParamValue>) -> bool {
        match self.try_set_parameter(attr, value) {
            Ok(applied) => applied,
            Err(e) => {
                log::debug!("{}: rejected '{}': {}", self.kind, attr, e);
                false
            }
        }
    }

    /// Assign a parameter, reporting why a value was rejected
    ///
    /// `Ok(false)` means the value was null and nothing changed.
    pub fn try_set_parameter(
        &mut self,
        attr: &str,
        value: impl Into<ParamValue>,
    ) -> Result<bool, ValidationError> {
        let index = self
            .params
            .iter()
            .position(|p| p.attribute() == attr)
            .ok_or_else(|| ValidationError::UnknownAttribute(attr.to_string()))?;

        let value = value.into();
        if value.is_null() {
            return Ok(false);
        }

        let spec = self.params[index].spec;
        let coerced = value.clone().coerce(spec.ty).ok_or_else(|| {
            ValidationError::InvalidFormat(format!(
                "'{}' expects {:?}, got {:?}",
                attr, spec.ty, value
            ))
        })?;
        (spec.accept)(&coerced, &self.params)?;

        let slot = &mut self.params[index];
        slot.value = coerced;
        slot.set = true;
        Ok(true)
    }

    /// Attributes that are required but were never assigned
    pub fn required_not_defined(&self) -> Vec<&'static str> {
        self.params
            .iter()
            .filter(|p| p.is_required() && (!p.is_set() || p.value().is_null()))
            .map(|p| p.attribute())
            .collect()
    }

    /// Full validation: required slots, per-attribute predicates, kind rules
    pub fn validate(&self) -> Result<(), ValidationError> {
        if let Some(attr) = self.required_not_defined().first() {
            return Err(ValidationError::MissingRequired(attr.to_string()));
        }
        for param in &self.params {
            (param.spec.accept)(param.value(), &self.params)?;
        }
        Command::try_from(self).map(|_| ())
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    pub fn push_ack(&mut self, ack: Ack) {
        self.acks.push(ack);
    }

    pub fn acks(&self) -> &[Ack] {
        &self.acks
    }

    pub fn has_ack(&self) -> bool {
        !self.acks.is_empty()
    }

    pub fn int(&self, attr: &str) -> Option<i64> {
        self.value(attr).as_i64()
    }

    pub fn float(&self, attr: &str) -> Option<f64> {
        self.value(attr).as_f64()
    }

    pub fn bool(&self, attr: &str) -> Option<bool> {
        self.value(attr).as_bool()
    }

    pub fn str(&self, attr: &str) -> Option<&str> {
        self.value(attr).as_str()
    }
}

impl fmt::Display for WorkerFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_wire())
    }
}


#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn int_into_float_slot_keeps_value(v in 0i64..=1) {
            let mut f = WorkerFunction::new(FunctionKind::PlaybackStart);
            prop_assert!(f.set_parameter("amplitude", v));
            prop_assert_eq!(f.float("amplitude"), Some(v as f64));
        }

        #[test]
        fn float_into_int_slot_truncates(v in 0.0f64..1.0e6) {
            let mut f = WorkerFunction::new(FunctionKind::RecordStart);
            prop_assert!(f.set_parameter("dump-buffer-ms", v));
            prop_assert_eq!(f.int("dump-buffer-ms"), Some(v.trunc() as i64));
        }

        #[test]
        fn any_missing_required_is_invalid(mask in 0u8..7) {
            // bit i set => i-th required playback attribute assigned
            let mut f = WorkerFunction::with_id(FunctionKind::PlaybackStart, "dev::9");
            if mask & 1 != 0 { f.set_parameter("type", "non-offload"); }
            if mask & 2 != 0 { f.set_parameter("target-freqs", "440"); }
            if mask & 4 != 0 { f.set_parameter("playback-id", 0); }
            prop_assert!(!f.is_valid());
        }
    }
}
