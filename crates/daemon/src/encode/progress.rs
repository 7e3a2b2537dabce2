//! Parsing of the encoder's diagnostic stream.
//!
//! FFmpeg writes its progress to stderr in a human oriented format:
//!
//! ```text
//!   Duration: 00:01:02.50, start: 0.000000, bitrate: 1234 kb/s
//! Output #0, hls, to 'output/job/720p.m3u8':
//!   Stream #0:0: Video: h264, yuv420p(progressive), 1280x720, q=2-31, 1000 kb/s
//! frame=  100 fps= 50 q=28.0 size=N/A time=00:00:04.00 bitrate=N/A speed=2.0x
//! ```
//!
//! Each line is turned into zero or more [`DiagnosticEvent`]s and fed to a
//! [`ProgressTracker`]. Nothing here touches processes or I/O.

use regex::Regex;
use std::sync::LazyLock;

static DURATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Duration:\s*(\d+:\d{1,2}:\d{1,2}(?:\.\d+)?)").expect("valid duration regex")
});

static TIME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"time=\s*(\d+:\d{1,2}:\d{1,2}(?:\.\d+)?)").expect("valid time regex")
});

static DIMENSIONS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\d{2,5})x(\d{2,5})\b").expect("valid dimensions regex"));

/// One fact extracted from a diagnostic line.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DiagnosticEvent {
    /// Total input duration in seconds.
    Duration(f64),
    /// Current output position in seconds.
    Position(f64),
    /// Start of the output section of the stream dump.
    OutputSection,
    /// Dimensions of a video stream listed in the stream dump.
    VideoStream { width: u32, height: u32 },
}

/// Parse `HH:MM:SS.ff` into seconds.
///
/// Returns `None` for anything that is not three non-negative numeric fields
/// with minutes and seconds below 60.
pub fn parse_timestamp(s: &str) -> Option<f64> {
    let parts: Vec<&str> = s.trim().split(':').collect();
    if parts.len() != 3 {
        return None;
    }

    let hours: u64 = parts[0].parse().ok()?;
    let minutes: u64 = parts[1].parse().ok()?;
    let seconds: f64 = parts[2].parse().ok()?;

    if minutes >= 60 || !seconds.is_finite() || !(0.0..60.0).contains(&seconds) {
        return None;
    }

    Some(hours as f64 * 3600.0 + minutes as f64 * 60.0 + seconds)
}

/// Extract every event a single diagnostic line carries.
///
/// Lines that match nothing, including garbled ones, yield no events.
pub fn parse_line(line: &str) -> Vec<DiagnosticEvent> {
    let mut events = Vec::new();

    if line.trim_start().starts_with("Output #") {
        events.push(DiagnosticEvent::OutputSection);
    }

    if let Some(secs) = DURATION_RE
        .captures(line)
        .and_then(|c| parse_timestamp(&c[1]))
    {
        events.push(DiagnosticEvent::Duration(secs));
    }

    if let Some(secs) = TIME_RE.captures(line).and_then(|c| parse_timestamp(&c[1])) {
        events.push(DiagnosticEvent::Position(secs));
    }

    if line.contains("Stream #") && line.contains("Video:") {
        if let Some(caps) = DIMENSIONS_RE.captures(line) {
            if let (Ok(width), Ok(height)) = (caps[1].parse(), caps[2].parse()) {
                events.push(DiagnosticEvent::VideoStream { width, height });
            }
        }
    }

    events
}

/// Per-rendition progress state built from diagnostic events.
#[derive(Debug, Clone, Default)]
pub struct ProgressTracker {
    duration: Option<f64>,
    position: f64,
    fraction: f64,
    in_output: bool,
    output_width: Option<u32>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one event in. Returns the new fraction when it moved forward.
    pub fn apply(&mut self, event: DiagnosticEvent) -> Option<f64> {
        match event {
            DiagnosticEvent::Duration(secs) => {
                // The first non-zero duration is the input's; later ones belong
                // to other sections of the dump.
                if self.duration.is_none() && secs > 0.0 {
                    self.duration = Some(secs);
                }
                self.recompute()
            }
            DiagnosticEvent::Position(secs) => {
                self.position = secs;
                self.recompute()
            }
            DiagnosticEvent::OutputSection => {
                self.in_output = true;
                None
            }
            DiagnosticEvent::VideoStream { width, .. } => {
                if self.in_output && self.output_width.is_none() {
                    self.output_width = Some(width);
                }
                None
            }
        }
    }

    /// Parse a raw line and fold every event in.
    pub fn apply_line(&mut self, line: &str) -> Option<f64> {
        let mut moved = None;
        for event in parse_line(line) {
            if let Some(fraction) = self.apply(event) {
                moved = Some(fraction);
            }
        }
        moved
    }

    fn recompute(&mut self) -> Option<f64> {
        let duration = self.duration?;
        let fraction = (self.position / duration).clamp(0.0, 1.0);
        if fraction > self.fraction {
            self.fraction = fraction;
            Some(fraction)
        } else {
            None
        }
    }

    /// Progress in [0, 1]; stays 0 until a duration has been seen.
    pub fn fraction(&self) -> f64 {
        self.fraction
    }

    pub fn duration(&self) -> Option<f64> {
        self.duration
    }

    /// Width of the first output video stream, if the encoder printed it.
    pub fn output_width(&self) -> Option<u32> {
        self.output_width
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_timestamp() {
        assert_eq!(parse_timestamp("00:00:10.50"), Some(10.5));
        assert_eq!(parse_timestamp("01:30:00.00"), Some(5400.0));
        assert_eq!(parse_timestamp("00:01:02"), Some(62.0));
        assert_eq!(parse_timestamp("invalid"), None);
        assert_eq!(parse_timestamp("00:61:00.00"), None);
        assert_eq!(parse_timestamp("00:00:-1.0"), None);
        assert_eq!(parse_timestamp("N/A"), None);
    }

    #[test]
    fn test_parse_duration_line() {
        let events = parse_line("  Duration: 00:01:02.50, start: 0.000000, bitrate: 1234 kb/s");
        assert_eq!(events, vec![DiagnosticEvent::Duration(62.5)]);
    }

    #[test]
    fn test_parse_progress_line() {
        let events = parse_line(
            "frame=  100 fps= 50 q=28.0 size=N/A time=00:00:04.00 bitrate=N/A speed=2.0x",
        );
        assert_eq!(events, vec![DiagnosticEvent::Position(4.0)]);
    }

    #[test]
    fn test_parse_output_stream_dimensions() {
        assert_eq!(
            parse_line("Output #0, hls, to 'output/j/720p.m3u8':"),
            vec![DiagnosticEvent::OutputSection]
        );
        let events = parse_line(
            "  Stream #0:0: Video: h264, yuv420p(progressive), 1280x720 [SAR 1:1 DAR 16:9], q=2-31, 1000 kb/s",
        );
        assert_eq!(
            events,
            vec![DiagnosticEvent::VideoStream {
                width: 1280,
                height: 720
            }]
        );
    }

    #[test]
    fn test_garbled_lines_yield_nothing() {
        for line in [
            "",
            "time=",
            "time=N/A bitrate=N/A",
            "Duration: N/A, start: 0.000000",
            "Duration: ab:cd:ef",
            "\u{fffd}\u{fffd}time=0x:zz",
            "[libx264 @ 0x55d] frame I:3 Avg QP:20.00",
        ] {
            assert!(parse_line(line).is_empty(), "line {:?} should be ignored", line);
        }
    }

    #[test]
    fn test_tracker_without_duration_stays_zero() {
        let mut tracker = ProgressTracker::new();
        assert_eq!(tracker.apply_line("frame=1 time=00:00:04.00 bitrate=1k"), None);
        assert_eq!(tracker.fraction(), 0.0);
    }

    #[test]
    fn test_tracker_follows_position() {
        let mut tracker = ProgressTracker::new();
        tracker.apply_line("  Duration: 00:00:10.00, start: 0.0");
        assert_eq!(tracker.apply_line("time=00:00:02.50"), Some(0.25));
        assert_eq!(tracker.apply_line("time=00:00:05.00"), Some(0.5));
        // a stale line does not move progress backwards
        assert_eq!(tracker.apply_line("time=00:00:04.00"), None);
        assert_eq!(tracker.fraction(), 0.5);
        // overshoot is clamped
        assert_eq!(tracker.apply_line("time=00:00:12.00"), Some(1.0));
        assert_eq!(tracker.fraction(), 1.0);
    }

    #[test]
    fn test_tracker_keeps_first_duration() {
        let mut tracker = ProgressTracker::new();
        tracker.apply_line("  Duration: 00:00:10.00, start: 0.0");
        tracker.apply_line("  Duration: 00:00:20.00, start: 0.0");
        assert_eq!(tracker.duration(), Some(10.0));
    }

    #[test]
    fn test_tracker_records_output_width_only() {
        let mut tracker = ProgressTracker::new();
        tracker.apply_line("  Stream #0:0: Video: h264 (High), yuv420p, 1920x1080, 25 fps");
        assert_eq!(tracker.output_width(), None);
        tracker.apply_line("Output #0, hls, to '360p.m3u8':");
        tracker.apply_line("  Stream #0:0: Video: h264, yuv420p, 640x360, q=2-31");
        assert_eq!(tracker.output_width(), Some(640));
    }

    // Property: fractions are always within [0, 1] and never decrease, no
    // matter how positions arrive.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_fraction_clamped_and_monotonic(
            duration in 0.5f64..20_000.0,
            positions in proptest::collection::vec(0.0f64..40_000.0, 1..40),
        ) {
            let mut tracker = ProgressTracker::new();
            tracker.apply(DiagnosticEvent::Duration(duration));
            let mut last = 0.0;
            for pos in positions {
                tracker.apply(DiagnosticEvent::Position(pos));
                let f = tracker.fraction();
                prop_assert!((0.0..=1.0).contains(&f));
                prop_assert!(f >= last);
                last = f;
            }
        }

        #[test]
        fn prop_timestamp_round_trip(
            h in 0u64..100,
            m in 0u64..60,
            s in 0u64..60,
            cs in 0u64..100,
        ) {
            let text = format!("{:02}:{:02}:{:02}.{:02}", h, m, s, cs);
            let secs = parse_timestamp(&text).unwrap();
            let expected = (h * 3600 + m * 60 + s) as f64 + cs as f64 / 100.0;
            prop_assert!((secs - expected).abs() < 1e-6);
        }
    }
}
