use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TimelineError {
    #[error("invalid zoom: {0} pixels per second")]
    InvalidZoom(f64),
}

pub type ClockTime = u64; // nanoseconds from the start of the media

pub const NSECOND: ClockTime = 1;
pub const MSECOND: ClockTime = 1_000_000;
pub const SECOND: ClockTime = 1_000_000_000;

/// Rounds `value` down to a multiple of `interval`.
pub fn quantize(value: ClockTime, interval: ClockTime) -> ClockTime {
    if interval == 0 { return value; }
    value - value % interval
}

/// Rounds `value` up to a multiple of `interval`.
pub fn quantize_up(value: ClockTime, interval: ClockTime) -> ClockTime {
    let down = quantize(value, interval);
    if down < value { down + interval } else { down }
}

/// Horizontal scale of the timeline.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Zoom {
    pixels_per_second: f64,
}

impl Zoom {
    pub fn new(pixels_per_second: f64) -> Result<Self, TimelineError> {
        if !pixels_per_second.is_finite() || pixels_per_second <= 0.0 {
            return Err(TimelineError::InvalidZoom(pixels_per_second));
        }
        Ok(Self { pixels_per_second })
    }

    pub fn pixels_per_second(&self) -> f64 { self.pixels_per_second }

    pub fn ns_to_pixel(&self, time: ClockTime) -> f64 {
        time as f64 * self.pixels_per_second / SECOND as f64
    }

    /// Negative pixel offsets clamp to zero.
    pub fn pixel_to_ns(&self, pixels: f64) -> ClockTime {
        if pixels <= 0.0 { return 0; }
        (pixels * SECOND as f64 / self.pixels_per_second).round() as ClockTime
    }
}

impl Default for Zoom {
    fn default() -> Self { Self { pixels_per_second: 100.0 } }
}

/// Visible portion of a timeline element, in widget-local pixels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub const fn new(x: f64, y: f64, width: f64, height: f64) -> Self { Self { x, y, width, height } }
}

/// Placement of an element's media on the timeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClipTiming {
    pub in_point: ClockTime,
    /// Full duration of the underlying asset, not of the trimmed clip.
    /// Previews are keyed by the asset's digest and always cover all of it.
    /// Zero when unknown.
    pub duration: ClockTime,
}

impl ClipTiming {
    pub const fn new(in_point: ClockTime, duration: ClockTime) -> Self { Self { in_point, duration } }
}

/// Buckets `start, start + step, ...` strictly below `end`.
pub fn buckets(start: ClockTime, end: ClockTime, step: ClockTime) -> impl Iterator<Item = ClockTime> {
    let step = step.max(1);
    (0..).map(move |i: u64| start + i * step).take_while(move |t| *t < end)
}

/// Resolves `time` to the closest bucket at or below it, or the first bucket
/// above it when `time` precedes them all.
pub fn nearest_bucket(buckets: &BTreeSet<ClockTime>, time: ClockTime) -> Option<ClockTime> {
    buckets
        .range(..=time)
        .next_back()
        .or_else(|| buckets.range(time..).next())
        .copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quantize_rounds_down_and_up() {
        assert_eq!(quantize(1_250, 500), 1_000);
        assert_eq!(quantize(1_000, 500), 1_000);
        assert_eq!(quantize_up(1_250, 500), 1_500);
        assert_eq!(quantize_up(1_500, 500), 1_500);
        assert_eq!(quantize(42, 0), 42);
    }

    #[test]
    fn test_zoom_conversions() {
        let zoom = Zoom::new(100.0).unwrap();
        assert_eq!(zoom.ns_to_pixel(SECOND), 100.0);
        assert_eq!(zoom.pixel_to_ns(50.0), SECOND / 2);
        assert_eq!(zoom.pixel_to_ns(-10.0), 0);
        assert!(Zoom::new(0.0).is_err());
        assert!(Zoom::new(f64::NAN).is_err());
    }

    #[test]
    fn test_buckets_stop_before_end() {
        let all: Vec<_> = buckets(0, 1_500, 500).collect();
        assert_eq!(all, vec![0, 500, 1_000]);
        assert_eq!(buckets(10, 10, 5).count(), 0);
    }

    #[test]
    fn test_nearest_bucket_prefers_below() {
        let set: BTreeSet<_> = [500, 1_000, 1_500].into_iter().collect();
        assert_eq!(nearest_bucket(&set, 1_000), Some(1_000));
        assert_eq!(nearest_bucket(&set, 1_499), Some(1_000));
        assert_eq!(nearest_bucket(&set, 20), Some(500));
        assert_eq!(nearest_bucket(&BTreeSet::new(), 20), None);
    }
}
