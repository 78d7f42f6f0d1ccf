//! Exact rational frame rate.
//!
//! The header stores fps as an f32. Broadcast rates are snapped to their
//! NTSC rationals, everything else becomes a millirational. Every
//! time/frame/sample conversion goes through integer math so that frame
//! positions never drift, no matter how long the stream plays.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Snap tolerance for the NTSC rates.
const SNAP_EPSILON: f32 = 0.02;

/// Known broadcast rates as (numerator, denominator).
const BROADCAST_RATES: [(u32, u32); 3] = [(24000, 1001), (30000, 1001), (60000, 1001)];

const MICROS_PER_SEC: u128 = 1_000_000;

/// Frames per second as `num / den`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timebase {
    num: u32,
    den: u32,
}

impl Timebase {
    /// Exact rate. Returns `None` for a zero numerator or denominator.
    pub fn new(num: u32, den: u32) -> Option<Self> {
        if num == 0 || den == 0 {
            return None;
        }
        Some(Self { num, den })
    }

    /// Derive the rational from the header's float rate.
    pub fn from_fps(fps: f32) -> Option<Self> {
        if !fps.is_finite() || fps <= 0.0 {
            return None;
        }

        for (num, den) in BROADCAST_RATES {
            if (fps - num as f32 / den as f32).abs() < SNAP_EPSILON {
                return Some(Self { num, den });
            }
        }

        let num = (f64::from(fps) * 1000.0).round();
        if num < 1.0 || num > f64::from(u32::MAX) {
            return None;
        }
        Some(Self {
            num: num as u32,
            den: 1000,
        })
    }

    pub fn num(&self) -> u32 {
        self.num
    }

    pub fn den(&self) -> u32 {
        self.den
    }

    pub fn fps(&self) -> f64 {
        f64::from(self.num) / f64::from(self.den)
    }

    /// Nominal frame duration, for display and diagnostics only.
    pub fn frame_duration_ms(&self) -> f64 {
        1000.0 * f64::from(self.den) / f64::from(self.num)
    }

    /// Whole frames that fit in `elapsed` (floor).
    pub fn frames_in(&self, elapsed: Duration) -> u64 {
        let us = elapsed.as_micros();
        let frames = us * u128::from(self.num) / (u128::from(self.den) * MICROS_PER_SEC);
        u64::try_from(frames).unwrap_or(u64::MAX)
    }

    /// Start time of `frame` relative to frame zero (floor to the microsecond).
    pub fn frame_start(&self, frame: u64) -> Duration {
        let us = u128::from(frame) * u128::from(self.den) * MICROS_PER_SEC / u128::from(self.num);
        Duration::from_micros(u64::try_from(us).unwrap_or(u64::MAX))
    }

    /// Total frame shown at `ms`, clamped into `[0, total_frames)`.
    pub fn ms_to_frame(&self, ms: u64, total_frames: u32) -> u32 {
        if total_frames == 0 {
            return 0;
        }
        let frames = u128::from(ms) * u128::from(self.num) / (u128::from(self.den) * 1000);
        frames.min(u128::from(total_frames - 1)) as u32
    }

    /// Audio samples elapsed by the start of `frame`, rounded to nearest.
    pub fn samples_at(&self, frame: u64, sample_rate: u32) -> u64 {
        let scaled = u128::from(frame) * u128::from(sample_rate) * u128::from(self.den);
        let num = u128::from(self.num);
        let rounded = (scaled * 2 + num) / (num * 2);
        u64::try_from(rounded).unwrap_or(u64::MAX)
    }
}

impl std::fmt::Display for Timebase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{} ({:.3} fps)", self.num, self.den, self.fps())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snaps_broadcast_rates() {
        assert_eq!(Timebase::from_fps(23.976), Timebase::new(24000, 1001));
        assert_eq!(Timebase::from_fps(29.97), Timebase::new(30000, 1001));
        assert_eq!(Timebase::from_fps(59.94), Timebase::new(60000, 1001));
    }

    #[test]
    fn test_millirational_fallback() {
        assert_eq!(Timebase::from_fps(30.0), Timebase::new(30000, 1000));
        assert_eq!(Timebase::from_fps(12.5), Timebase::new(12500, 1000));
        assert_eq!(Timebase::from_fps(0.0), None);
        assert_eq!(Timebase::from_fps(f32::NAN), None);
        assert_eq!(Timebase::from_fps(-24.0), None);
    }

    #[test]
    fn test_no_drift_over_long_runs() {
        let tb = Timebase::from_fps(29.97).unwrap();
        // One hour of NTSC video is exactly 107892 frames + change.
        let hour = Duration::from_secs(3600);
        assert_eq!(tb.frames_in(hour), 107_892);

        for frame in [0u64, 1, 1001, 30_000, 107_892, 1_000_000] {
            let start = tb.frame_start(frame);
            assert_eq!(tb.frames_in(start + Duration::from_micros(1)), frame);
        }
    }

    #[test]
    fn test_ms_to_frame_clamps() {
        let tb = Timebase::new(30, 1).unwrap();
        assert_eq!(tb.ms_to_frame(0, 100), 0);
        assert_eq!(tb.ms_to_frame(1000, 100), 30);
        assert_eq!(tb.ms_to_frame(1_000_000, 100), 99);
        assert_eq!(tb.ms_to_frame(1000, 0), 0);
    }

    #[test]
    fn test_samples_match_float_rounding() {
        let tb = Timebase::from_fps(29.97).unwrap();
        for rate in [22050u32, 44100, 48000] {
            let expected = (150.0 * f64::from(rate) / 29.97).round() as u64;
            assert_eq!(tb.samples_at(150, rate), expected, "rate {rate}");
        }
        assert_eq!(tb.samples_at(0, 44100), 0);
    }
}
