use log::warn;

/// Rate substituted when a source reports no usable frame rate.
pub const FALLBACK_FRAME_RATE: f64 = 30.0;
pub const DEFAULT_MAX_FRAME_WAIT_MS: u64 = 1000;

/// Returns the reported rate if it is finite and positive, otherwise
/// `FALLBACK_FRAME_RATE`.
pub fn validate_frame_rate(source_id: &str, reported: Option<f64>) -> f64 {
    match reported {
        Some(rate) if rate.is_finite() && rate > 0.0 => rate,
        Some(rate) => {
            warn!(
                "Invalid frame rate {} reported for {}, using {} Hz",
                rate, source_id, FALLBACK_FRAME_RATE
            );
            FALLBACK_FRAME_RATE
        }
        None => {
            warn!(
                "No frame rate available for {}, using {} Hz",
                source_id, FALLBACK_FRAME_RATE
            );
            FALLBACK_FRAME_RATE
        }
    }
}

/// Inter-frame wait in whole milliseconds, unclamped.
///
/// The base interval is `floor(1000 / frame_rate_hz)`. Once more than one
/// request is waiting the base is divided (integer division) by
/// `speedup_factor`, so a single queued follow-up is never rushed. The result
/// is at least one millisecond.
pub fn wait_millis(frame_rate_hz: f64, backlog_len: usize, speedup_factor: u32) -> u64 {
    let rate = if frame_rate_hz.is_finite() && frame_rate_hz > 0.0 {
        frame_rate_hz
    } else {
        FALLBACK_FRAME_RATE
    };
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let base = (1000.0 / rate).floor() as u64;
    let effective = if backlog_len > 1 {
        base / u64::from(speedup_factor.max(1))
    } else {
        base
    };
    effective.max(1)
}

/// Frame pacing with a fixed speed-up factor and an upper bound on any
/// single wait, which is also the worst-case command poll latency.
#[derive(Clone, Copy, Debug)]
pub struct FramePacer {
    speedup_factor: u32,
    max_wait_ms: u64,
}

impl FramePacer {
    pub fn new(speedup_factor: u32, max_wait_ms: u64) -> Self {
        Self {
            speedup_factor: speedup_factor.max(1),
            max_wait_ms: max_wait_ms.max(1),
        }
    }

    pub fn wait_millis(&self, frame_rate_hz: f64, backlog_len: usize) -> u64 {
        wait_millis(frame_rate_hz, backlog_len, self.speedup_factor).min(self.max_wait_ms)
    }
}
