/**
 * Parameter Validation Module
 *
 * Acceptance predicates for every worker function attribute.
 * A rejected value never reaches a controller: setParameter drops it
 * and the slot keeps its previous value.
 */
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Invalid range: {0}")]
    InvalidRange(String),

    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Path traversal detected")]
    PathTraversal,

    #[error("Unknown attribute: {0}")]
    UnknownAttribute(String),

    #[error("Required attribute not defined: {0}")]
    MissingRequired(String),
}

/// Sampling rates accepted by every PCM format parameter
pub const SAMPLING_FREQS: [i64; 7] = [8000, 16000, 22050, 24000, 32000, 44100, 48000];

/// Bit widths accepted by every PCM format parameter
pub const BIT_WIDTHS: [i64; 4] = [8, 16, 24, 32];

/// Validate sampling frequency against the enumerated set
pub fn validate_sampling_freq(freq: i64) -> Result<u32, ValidationError> {
    if !SAMPLING_FREQS.contains(&freq) {
        return Err(ValidationError::InvalidRange(format!(
            "Sampling frequency must be one of {:?}, got {}",
            SAMPLING_FREQS, freq
        )));
    }
    Ok(freq as u32)
}

/// Validate channel count (1 or 2)
pub fn validate_num_channels(channels: i64) -> Result<u16, ValidationError> {
    if !(1..=2).contains(&channels) {
        return Err(ValidationError::InvalidRange(format!(
            "Channel count must be 1 or 2, got {}",
            channels
        )));
    }
    Ok(channels as u16)
}

/// Validate PCM bit width (8, 16, 24, 32)
pub fn validate_bit_width(bits: i64) -> Result<u16, ValidationError> {
    if !BIT_WIDTHS.contains(&bits) {
        return Err(ValidationError::InvalidRange(format!(
            "Bit width must be one of {:?}, got {}",
            BIT_WIDTHS, bits
        )));
    }
    Ok(bits as u16)
}

/// Validate amplitude (0.0 to 1.0)
pub fn validate_amplitude(amplitude: f64) -> Result<f64, ValidationError> {
    if !(0.0..=1.0).contains(&amplitude) {
        return Err(ValidationError::InvalidRange(format!(
            "Amplitude must be between 0.0 and 1.0, got {}",
            amplitude
        )));
    }
    Ok(amplitude)
}

/// Validate a single tone frequency (strictly positive, finite)
pub fn validate_frequency(freq: f64) -> Result<f64, ValidationError> {
    if !freq.is_finite() || freq <= 0.0 {
        return Err(ValidationError::InvalidRange(format!(
            "Frequency must be positive, got {}",
            freq
        )));
    }
    Ok(freq)
}

/// Parse and validate a frequency list
///
/// Accepts `"440"`, `"440, 880"` and the bracketed JSON form `"[440,880]"`.
pub fn validate_target_freqs(s: &str) -> Result<Vec<f64>, ValidationError> {
    let trimmed = s.trim();
    let inner = trimmed
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .unwrap_or(trimmed);

    if inner.trim().is_empty() {
        return Err(ValidationError::InvalidFormat(
            "Frequency list cannot be empty".to_string(),
        ));
    }

    inner
        .split(',')
        .map(|token| {
            let token = token.trim();
            let freq = token.parse::<f64>().map_err(|_| {
                ValidationError::InvalidFormat(format!("Not a frequency: '{}'", token))
            })?;
            validate_frequency(freq)
        })
        .collect()
}

/// Validate a non-negative integer (playback ids, buffer sizes)
pub fn validate_non_negative(value: i64, what: &str) -> Result<u32, ValidationError> {
    if value < 0 || value > u32::MAX as i64 {
        return Err(ValidationError::InvalidRange(format!(
            "{} must be >= 0, got {}",
            what, value
        )));
    }
    Ok(value as u32)
}

/// Longest record dump ring
pub const MAX_DUMP_BUFFER_MS: i64 = 60_000;

/// Validate a dump ring length in milliseconds (0 disables the ring)
pub fn validate_dump_buffer_ms(value: i64) -> Result<u32, ValidationError> {
    if !(0..=MAX_DUMP_BUFFER_MS).contains(&value) {
        return Err(ValidationError::InvalidRange(format!(
            "dump buffer must be 0..={} ms, got {}",
            MAX_DUMP_BUFFER_MS, value
        )));
    }
    Ok(value as u32)
}

/// Output stream type codes a playback start may carry
pub const STREAM_TYPES: [i64; 8] = [0, 1, 2, 3, 4, 5, 8, 10];

/// Output usage codes
pub const USAGES: [i64; 13] = [0, 1, 2, 3, 4, 5, 6, 10, 11, 12, 13, 14, 16];

/// Output content type codes (1997 is ultrasound)
pub const CONTENT_TYPES: [i64; 6] = [0, 1, 2, 3, 4, 1997];

/// Performance modes; -1 leaves the choice to `low-latency-mode`
pub const PERFORMANCE_MODES: [i64; 4] = [-1, 0, 1, 2];

/// Validate an integer code against an enumerated set
pub fn validate_code(value: i64, allowed: &[i64], what: &str) -> Result<i64, ValidationError> {
    if !allowed.contains(&value) {
        return Err(ValidationError::InvalidRange(format!(
            "{} must be one of {:?}, got {}",
            what, allowed, value
        )));
    }
    Ok(value)
}

/// Validate that a string holds a JSON object
pub fn validate_json_object(s: &str) -> Result<serde_json::Map<String, serde_json::Value>, ValidationError> {
    match serde_json::from_str::<serde_json::Value>(s) {
        Ok(serde_json::Value::Object(map)) => Ok(map),
        Ok(_) => Err(ValidationError::InvalidFormat(
            "Expected a JSON object".to_string(),
        )),
        Err(e) => Err(ValidationError::InvalidFormat(e.to_string())),
    }
}

/// Validate a string against an allowed set (case sensitive)
pub fn validate_choice<'a>(value: &str, allowed: &[&'a str]) -> Result<&'a str, ValidationError> {
    allowed
        .iter()
        .find(|candidate| **candidate == value)
        .copied()
        .ok_or_else(|| {
            ValidationError::InvalidFormat(format!(
                "Expected one of {:?}, got '{}'",
                allowed, value
            ))
        })
}

/// Validate a data file name (no control characters, no traversal)
pub fn validate_file_name(name: &str) -> Result<String, ValidationError> {
    if name.is_empty() {
        return Err(ValidationError::InvalidPath(
            "Path cannot be empty".to_string(),
        ));
    }

    if name.len() > 256 {
        return Err(ValidationError::InvalidPath(format!(
            "Path too long: max 256, got {}",
            name.len()
        )));
    }

    if name.chars().any(|c| c.is_control()) {
        return Err(ValidationError::InvalidPath(
            "Path contains control characters".to_string(),
        ));
    }

    if Path::new(name)
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(ValidationError::PathTraversal);
    }

    Ok(name.to_string())
}

/// Resolve a validated file name against a controller data directory
///
/// Absolute names are kept as-is; relative names land under `base`.
pub fn resolve_data_path(name: &str, base: &Path) -> Result<PathBuf, ValidationError> {
    let name = validate_file_name(name)?;
    let path = Path::new(&name);
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(base.join(path))
    }
}

/// Playback file names depend on the playback type
pub fn validate_playback_file(file: &str, playback_type: &str) -> Result<(), ValidationError> {
    if file == "null" {
        return Ok(());
    }
    let accepted = match playback_type {
        "non-offload" => file.ends_with(".wav"),
        "offload" => file.ends_with(".mp3") || file.ends_with(".aac"),
        _ => false,
    };
    if !accepted {
        return Err(ValidationError::InvalidFormat(format!(
            "File '{}' is not playable as {}",
            file, playback_type
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sampling_freq_valid() {
        for f in SAMPLING_FREQS {
            assert_eq!(validate_sampling_freq(f).unwrap(), f as u32);
        }
    }

    #[test]
    fn test_sampling_freq_invalid() {
        assert!(validate_sampling_freq(44000).is_err());
        assert!(validate_sampling_freq(0).is_err());
        assert!(validate_sampling_freq(-8000).is_err());
    }

    #[test]
    fn test_channels_and_bits() {
        assert!(validate_num_channels(1).is_ok());
        assert!(validate_num_channels(2).is_ok());
        assert!(validate_num_channels(3).is_err());
        assert!(validate_num_channels(0).is_err());
        assert!(validate_bit_width(24).is_ok());
        assert!(validate_bit_width(12).is_err());
    }

    #[test]
    fn test_target_freqs_forms() {
        assert_eq!(validate_target_freqs("440").unwrap(), vec![440.0]);
        assert_eq!(validate_target_freqs("440, 880.5").unwrap(), vec![440.0, 880.5]);
        assert_eq!(validate_target_freqs("[300,400]").unwrap(), vec![300.0, 400.0]);
    }

    #[test]
    fn test_target_freqs_invalid() {
        assert!(validate_target_freqs("").is_err());
        assert!(validate_target_freqs("[]").is_err());
        assert!(validate_target_freqs("440,-1").is_err());
        assert!(validate_target_freqs("abc").is_err());
        assert!(validate_target_freqs("0").is_err());
    }

    #[test]
    fn test_json_object() {
        assert!(validate_json_object(r#"{"target-freq": [440]}"#).is_ok());
        assert!(validate_json_object("[1,2]").is_err());
        assert!(validate_json_object("{not json").is_err());
    }

    #[test]
    fn test_file_name_traversal() {
        assert_eq!(
            validate_file_name("../etc/passwd"),
            Err(ValidationError::PathTraversal)
        );
        assert!(validate_file_name("dump.wav").is_ok());
        assert!(validate_file_name("sub/dump.wav").is_ok());
        assert!(validate_file_name("bad\x00name").is_err());
        assert!(validate_file_name("").is_err());
    }

    #[test]
    fn test_resolve_data_path() {
        let base = Path::new("/tmp/audioworker/Record");
        assert_eq!(
            resolve_data_path("a.wav", base).unwrap(),
            PathBuf::from("/tmp/audioworker/Record/a.wav")
        );
        assert_eq!(
            resolve_data_path("/data/a.wav", base).unwrap(),
            PathBuf::from("/data/a.wav")
        );
    }

    #[test]
    fn test_playback_file() {
        assert!(validate_playback_file("null", "offload").is_ok());
        assert!(validate_playback_file("tone.wav", "non-offload").is_ok());
        assert!(validate_playback_file("tone.mp3", "offload").is_ok());
        assert!(validate_playback_file("tone.aac", "offload").is_ok());
        assert!(validate_playback_file("tone.mp3", "non-offload").is_err());
        assert!(validate_playback_file("tone.wav", "offload").is_err());
    }

    #[test]
    fn test_dump_buffer_bounds() {
        assert_eq!(validate_dump_buffer_ms(0), Ok(0));
        assert_eq!(validate_dump_buffer_ms(MAX_DUMP_BUFFER_MS), Ok(60_000));
        assert!(validate_dump_buffer_ms(MAX_DUMP_BUFFER_MS + 1).is_err());
        assert!(validate_dump_buffer_ms(4_000_000_000).is_err());
        assert!(validate_dump_buffer_ms(-1).is_err());
    }

    #[test]
    fn test_output_codes() {
        assert_eq!(validate_code(3, &STREAM_TYPES, "stream-type"), Ok(3));
        assert!(validate_code(6, &STREAM_TYPES, "stream-type").is_err());
        assert!(validate_code(16, &USAGES, "usage").is_ok());
        assert!(validate_code(15, &USAGES, "usage").is_err());
        assert!(validate_code(1997, &CONTENT_TYPES, "content-type").is_ok());
        assert!(validate_code(-1, &PERFORMANCE_MODES, "performance-mode").is_ok());
        assert!(validate_code(3, &PERFORMANCE_MODES, "performance-mode").is_err());
    }

    #[test]
    fn test_choice_case_sensitive() {
        assert_eq!(validate_choice("offload", &["offload", "non-offload"]), Ok("offload"));
        assert!(validate_choice("Offload", &["offload", "non-offload"]).is_err());
    }
}
