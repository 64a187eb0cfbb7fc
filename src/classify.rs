/// Probe output line classification.
///
/// The whole protocol with the external probe command is substring based:
/// - a line containing the round-trip-time marker (`time=`) is a reply
/// - the very first line starting with the banner token (`PING`) is ignored
/// - every other line is a failure (timeouts, unreachable, summaries, blanks)
use regex::Regex;
use std::sync::LazyLock;
use std::time::Duration;

pub const DEFAULT_SUCCESS_MARKER: &str = "time=";
pub const DEFAULT_BANNER_PREFIX: &str = "PING";

/// Matches the round-trip value in lines like `64 bytes from ...: time=10.4 ms`.
static RTT_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"time[=<]\s*([0-9]+(?:\.[0-9]+)?)\s*(ms|s)?").unwrap());

/// What a single probe output line means for the monitor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LineKind {
    /// A reply was received. `rtt` is set when the value could be parsed.
    Reply { rtt: Option<Duration> },
    /// Startup banner identifying the invocation.
    Banner,
    /// Anything else.
    Failure,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineClassifier {
    success_marker: String,
    banner_prefix: String,
}

impl LineClassifier {
    pub fn new(success_marker: impl Into<String>, banner_prefix: impl Into<String>) -> Self {
        Self {
            success_marker: success_marker.into(),
            banner_prefix: banner_prefix.into(),
        }
    }

    /// Classify one line. `first_line` is true only for the first line the
    /// current probe process produced.
    pub fn classify(&self, line: &str, first_line: bool) -> LineKind {
        if line.contains(&self.success_marker) {
            LineKind::Reply {
                rtt: parse_rtt(line),
            }
        } else if first_line && line.starts_with(&self.banner_prefix) {
            LineKind::Banner
        } else {
            LineKind::Failure
        }
    }
}

impl Default for LineClassifier {
    fn default() -> Self {
        Self::new(DEFAULT_SUCCESS_MARKER, DEFAULT_BANNER_PREFIX)
    }
}

/// Extract the round-trip time from a reply line, if present.
pub fn parse_rtt(line: &str) -> Option<Duration> {
    let caps = RTT_PATTERN.captures(line)?;
    let value: f64 = caps.get(1)?.as_str().parse().ok()?;
    let nanos_per_unit = match caps.get(2).map(|m| m.as_str()) {
        Some("s") => 1_000_000_000.0,
        _ => 1_000_000.0,
    };
    let nanos = (value * nanos_per_unit).round();
    if !nanos.is_finite() || nanos > u64::MAX as f64 {
        return None;
    }
    Some(Duration::from_nanos(nanos as u64))
}
