//! Audio level metering for per-frame trace logs

/// RMS of a frame of normalised samples
pub fn rms(frame: &[f32]) -> f32 {
    if frame.is_empty() {
        return 0.0;
    }

    let sum = frame.iter().map(|x| x * x).sum::<f32>();
    (sum / frame.len() as f32).sqrt()
}

/// RMS soft-clipped to [0, 1]; a full-scale sine reads about 0.71
pub fn normalized_rms(frame: &[f32]) -> f32 {
    rms(frame).clamp(0.0, 1.0)
}

/// Peak absolute sample
pub fn peak(frame: &[f32]) -> f32 {
    frame.iter().fold(0.0f32, |acc, s| acc.max(s.abs()))
}
