//! JSON wire form of functions, Acks and peer hellos

use super::{Ack, FunctionKind, WorkerFunction};
use serde_json::{json, Map, Value};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WireError {
    #[error("Malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unknown function class: {class}")]
    UnknownClass {
        class: String,
        command_id: Option<String>,
    },

    #[error("Message is neither a function nor an ack")]
    NotAFunction { command_id: Option<String> },
}

impl WireError {
    /// Correlation id recovered from a message that failed to parse
    pub fn command_id(&self) -> Option<&str> {
        match self {
            WireError::NotAFunction { command_id } | WireError::UnknownClass { command_id, .. } => {
                command_id.as_deref()
            }
            _ => None,
        }
    }
}

/// Any message a peer may send
#[derive(Debug, Clone)]
pub enum WireMessage {
    Function(WorkerFunction),
    Ack(Ack),
    Hello(String),
}

impl WorkerFunction {
    pub fn to_json(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("class".into(), json!(self.kind().class_name()));

        let params: Map<String, Value> = self
            .parameters()
            .iter()
            .map(|p| (p.attribute().to_string(), p.value().to_json()))
            .collect();
        obj.insert("params".into(), Value::Object(params));

        obj.insert("has-ack".into(), json!(self.has_ack()));
        if self.has_ack() {
            let acks: Vec<Value> = self.acks().iter().map(|a| json!(a.to_wire())).collect();
            obj.insert("ack".into(), Value::Array(acks));
        }

        let missing = self.required_not_defined();
        if !missing.is_empty() {
            obj.insert("required-not-defined".into(), json!(missing));
        }
        if let Some(id) = self.command_id() {
            obj.insert("command-id".into(), json!(id));
        }
        Value::Object(obj)
    }

    pub fn to_wire(&self) -> String {
        self.to_json().to_string()
    }

    /// Parse a wire function
    ///
    /// Parameters are applied in schema order so cross-attribute rules see
    /// their dependencies. Rejected or unknown attributes are skipped; the
    /// result may therefore be invalid and is left for the controller to
    /// refuse.
    pub fn from_wire(text: &str) -> Result<Self, WireError> {
        let value: Value = serde_json::from_str(text)?;
        Self::from_json(&value)
    }

    pub fn from_json(value: &Value) -> Result<Self, WireError> {
        let command_id = value
            .get("command-id")
            .and_then(Value::as_str)
            .map(str::to_string);

        let class = value
            .get("class")
            .and_then(Value::as_str)
            .ok_or_else(|| WireError::NotAFunction {
                command_id: command_id.clone(),
            })?;
        let kind = FunctionKind::from_class_name(class).ok_or_else(|| {
            log::warn!("Unknown function class '{}'", class);
            WireError::UnknownClass {
                class: class.to_string(),
                command_id: command_id.clone(),
            }
        })?;

        let mut function = WorkerFunction::new(kind);
        function.set_command_id(command_id);

        if let Some(params) = value.get("params").and_then(Value::as_object) {
            for spec in kind.schema() {
                if let Some(v) = params.get(spec.attr) {
                    function.set_parameter(spec.attr, v);
                }
            }
            for key in params.keys() {
                if function.parameter(key).is_none() {
                    log::debug!("{}: ignoring unknown attribute '{}'", kind, key);
                }
            }
        }

        if let Some(acks) = value.get("ack").and_then(Value::as_array) {
            for raw in acks {
                let parsed = match raw {
                    Value::String(s) => serde_json::from_str::<Ack>(s),
                    other => serde_json::from_value::<Ack>(other.clone()),
                };
                match parsed {
                    Ok(ack) => function.push_ack(ack),
                    Err(e) => log::warn!("{}: dropping malformed ack: {}", kind, e),
                }
            }
        }

        Ok(function)
    }
}

impl WireMessage {
    pub fn parse(text: &str) -> Result<Self, WireError> {
        let value: Value = serde_json::from_str(text)?;
        let Some(obj) = value.as_object() else {
            return Err(WireError::NotAFunction { command_id: None });
        };

        if obj.contains_key("target") && obj.contains_key("code") {
            return Ok(WireMessage::Ack(serde_json::from_value(value)?));
        }
        if obj.contains_key("class") {
            return WorkerFunction::from_json(&value).map(WireMessage::Function);
        }
        if let Some(name) = obj.get("SN").and_then(Value::as_str) {
            return Ok(WireMessage::Hello(name.to_string()));
        }
        Err(WireError::NotAFunction {
            command_id: obj
                .get("command-id")
                .and_then(Value::as_str)
                .map(str::to_string),
        })
    }

    pub fn hello(name: &str) -> String {
        json!({ "SN": name }).to_string()
    }

    pub fn to_wire(&self) -> String {
        match self {
            WireMessage::Function(f) => f.to_wire(),
            WireMessage::Ack(a) => a.to_wire(),
            WireMessage::Hello(name) => Self::hello(name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::ParamValue;

    fn playback_start() -> WorkerFunction {
        let mut f = WorkerFunction::with_id(FunctionKind::PlaybackStart, "pixel::1700000000000");
        f.set_parameter("type", "non-offload");
        f.set_parameter("target-freqs", "440,880");
        f.set_parameter("playback-id", 3);
        f.set_parameter("amplitude", 0.25);
        f.set_parameter("sampling-freq", 48000);
        f
    }

    #[test]
    fn test_serialized_shape() {
        let f = playback_start();
        let v = f.to_json();
        assert_eq!(v["class"], "PlaybackStartFunction");
        assert_eq!(v["command-id"], "pixel::1700000000000");
        assert_eq!(v["has-ack"], false);
        assert_eq!(v["params"]["playback-id"], 3);
        assert_eq!(v["params"]["file"], "null");
        assert!(v.get("ack").is_none());
        assert!(v.get("required-not-defined").is_none());

        let empty = WorkerFunction::new(FunctionKind::PlaybackStart).to_json();
        assert_eq!(
            empty["required-not-defined"],
            json!(["type", "target-freqs", "playback-id"])
        );
        assert!(empty.get("command-id").is_none());
    }

    #[test]
    fn test_round_trip_preserves_values() {
        let mut f = playback_start();
        f.push_ack(Ack::to_function(&f).with_code(0).with_description("playback start"));

        let parsed = WorkerFunction::from_wire(&f.to_wire()).unwrap();
        assert_eq!(parsed.command_id(), f.command_id());
        assert_eq!(parsed.kind(), f.kind());
        for p in f.parameters() {
            assert_eq!(parsed.value(p.attribute()), p.value(), "{}", p.attribute());
        }
        assert_eq!(parsed.acks(), f.acks());
        assert!(parsed.is_valid());
    }

    #[test]
    fn test_file_applied_after_type() {
        // keys arrive sorted, "file" before "type"
        let text = r#"{"class":"PlaybackStartFunction","command-id":"a::1",
            "params":{"file":"beep.mp3","playback-id":0,"target-freqs":"440","type":"offload"}}"#;
        let f = WorkerFunction::from_wire(text).unwrap();
        assert_eq!(f.str("file"), Some("beep.mp3"));
        assert!(f.is_valid());
    }

    #[test]
    fn test_qualified_class_and_coercion() {
        let text = r#"{"class":"com.example.audioworker.function.RecordStartFunction",
            "command-id":"b::2","params":{"sampling-freq":"16000","num-channels":1.0}}"#;
        let f = WorkerFunction::from_wire(text).unwrap();
        assert_eq!(f.kind(), FunctionKind::RecordStart);
        assert_eq!(f.value("sampling-freq"), &ParamValue::Int(16000));
        assert_eq!(f.value("num-channels"), &ParamValue::Int(1));
    }

    #[test]
    fn test_rejected_param_leaves_invalid_function() {
        let text = r#"{"class":"PlaybackStartFunction","command-id":"c::3",
            "params":{"type":"non-offload","target-freqs":"440","playback-id":0,"sampling-freq":12345}}"#;
        let f = WorkerFunction::from_wire(text).unwrap();
        // default kept, function still valid
        assert_eq!(f.int("sampling-freq"), Some(44100));
        assert!(f.is_valid());

        let text = r#"{"class":"PlaybackStartFunction","command-id":"c::4",
            "params":{"type":"streaming","target-freqs":"440","playback-id":0}}"#;
        assert!(!WorkerFunction::from_wire(text).unwrap().is_valid());
    }

    #[test]
    fn test_message_classification() {
        let ack = Ack::for_target("x::1").with_code(0).with_description("record start");
        assert!(matches!(WireMessage::parse(&ack.to_wire()), Ok(WireMessage::Ack(a)) if a == ack));

        let f = playback_start();
        assert!(matches!(
            WireMessage::parse(&f.to_wire()),
            Ok(WireMessage::Function(g)) if g.command_id() == f.command_id()
        ));

        assert!(matches!(
            WireMessage::parse(&WireMessage::hello("tablet")),
            Ok(WireMessage::Hello(n)) if n == "tablet"
        ));

        let err = WireMessage::parse(r#"{"class":"ShellFunction","command-id":"z::9"}"#).unwrap_err();
        assert_eq!(err.command_id(), Some("z::9"));

        assert!(matches!(WireMessage::parse("not json"), Err(WireError::Json(_))));
        assert!(WireMessage::parse("[1,2]").is_err());
    }
}
