//! Correlation id generation (`<serial>::<millis>`)

use std::sync::atomic::{AtomicI64, Ordering};

pub struct CommandIdGenerator {
    serial: String,
    last_millis: AtomicI64,
}

impl CommandIdGenerator {
    pub fn new(serial: impl Into<String>) -> Self {
        Self {
            serial: serial.into(),
            last_millis: AtomicI64::new(0),
        }
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    /// Next id; the millis part strictly increases even within one millisecond
    pub fn next_id(&self) -> String {
        let now = chrono::Utc::now().timestamp_millis();
        let mut prev = self.last_millis.load(Ordering::Relaxed);
        loop {
            let candidate = now.max(prev + 1);
            match self.last_millis.compare_exchange_weak(
                prev,
                candidate,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return format!("{}::{}", self.serial, candidate),
                Err(actual) => prev = actual,
            }
        }
    }
}

cfg_if::cfg_if! {
    if #[cfg(windows)] {
        fn host_name() -> Option<String> {
            std::env::var("COMPUTERNAME").ok()
        }
    } else {
        fn host_name() -> Option<String> {
            std::env::var("HOSTNAME").ok().or_else(|| {
                std::fs::read_to_string("/etc/hostname")
                    .ok()
                    .map(|s| s.trim().to_string())
            })
        }
    }
}

/// Device serial used when the config leaves it unset
pub fn default_serial() -> String {
    host_name()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "audioworker".to_string())
}
