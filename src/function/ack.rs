//! Correlated replies and the listener seam they flow through

use super::WorkerFunction;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Target used when a function carries no correlation id
pub const NO_TARGET: &str = "N/A";

/// Reply to one command id
///
/// A code of 0 or above is success or information, below 0 is failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ack {
    pub target: String,
    #[serde(rename = "code")]
    pub return_code: i32,
    #[serde(rename = "desc", default)]
    pub description: String,
    #[serde(rename = "return", default)]
    pub returns: Vec<serde_json::Value>,
}

impl Ack {
    pub fn for_target(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            return_code: -1,
            description: String::new(),
            returns: Vec::new(),
        }
    }

    /// Ack addressed to the function's own correlation id
    pub fn to_function(function: &WorkerFunction) -> Self {
        Self::for_target(function.command_id().unwrap_or(NO_TARGET))
    }

    pub fn with_code(mut self, code: i32) -> Self {
        self.return_code = code;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_return(mut self, value: impl Into<serde_json::Value>) -> Self {
        self.returns.push(value.into());
        self
    }

    pub fn with_returns(mut self, values: Vec<serde_json::Value>) -> Self {
        self.returns = values;
        self
    }

    pub fn is_success(&self) -> bool {
        self.return_code >= 0
    }

    pub fn to_wire(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            log::error!("Ack serialization failed: {}", e);
            String::from("{}")
        })
    }
}

/// Receiver of Acks and detector events for one execute() call
///
/// Called from controller threads, never while a controller lock is held.
pub trait AckListener: Send + Sync {
    fn on_ack(&self, ack: Ack);

    /// Detector event produced on behalf of the command
    fn on_event(&self, event: WorkerFunction) {
        log::debug!("Unhandled event {}", event.kind());
    }
}

impl<F> AckListener for F
where
    F: Fn(Ack) + Send + Sync,
{
    fn on_ack(&self, ack: Ack) {
        self(ack)
    }
}

pub type SharedListener = Arc<dyn AckListener>;

/// Listener that drops everything; used for internal fire-and-forget stops
pub fn discard() -> SharedListener {
    Arc::new(|_ack: Ack| {})
}
