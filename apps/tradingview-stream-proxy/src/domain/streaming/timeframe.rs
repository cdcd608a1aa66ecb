//! Timeframe normalization.
//!
//! Callers speak in human timeframes (`5m`, `1h`, `D`, `2W`). The upstream
//! series API wants a resolution code (minutes as a bare number, or a
//! `<n>D` / `<n>W` / `<n>M` code) and the history planner needs the bar
//! length in seconds.

use std::fmt;

const MINUTE: u64 = 60;
const DAY: u64 = 86_400;
const WEEK: u64 = 604_800;
const MONTH: u64 = 2_592_000;

/// Bar length used when a timeframe cannot be interpreted.
pub const DEFAULT_BAR_SECONDS: u64 = DAY;

/// A normalized timeframe: upstream resolution code plus bar length.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Timeframe {
    resolution: String,
    bar_seconds: u64,
}

impl Timeframe {
    /// Normalize a caller-supplied timeframe string.
    ///
    /// Unrecognized input falls back to one day.
    #[must_use]
    pub fn parse(input: &str) -> Self {
        let input = input.trim();
        match input {
            "1D" | "D" => return Self::daily(),
            "1W" | "W" => return Self::new("1W", WEEK),
            "1M" | "M" => return Self::new("1M", MONTH),
            _ => {}
        }

        if let Some(digits) = input.strip_suffix('m') {
            return count(digits).and_then(Self::minutes).unwrap_or_else(Self::daily);
        }
        if let Some(digits) = input.strip_suffix(['h', 'H']) {
            return count(digits)
                .and_then(|n| n.checked_mul(60))
                .and_then(Self::minutes)
                .unwrap_or_else(Self::daily);
        }
        if let Some(digits) = input.strip_suffix(['D', 'd']) {
            return Self::scaled(digits, 'D', DAY);
        }
        if let Some(digits) = input.strip_suffix(['W', 'w']) {
            return Self::scaled(digits, 'W', WEEK);
        }
        if let Some(digits) = input.strip_suffix('M') {
            return Self::scaled(digits, 'M', MONTH);
        }

        match input.parse::<u64>() {
            Ok(n) if n > 0 => Self::minutes(n).unwrap_or_else(Self::daily),
            _ => Self::daily(),
        }
    }

    /// The one-day timeframe.
    #[must_use]
    pub fn daily() -> Self {
        Self::new("1D", DAY)
    }

    /// `None` when the bar length overflows.
    fn minutes(n: u64) -> Option<Self> {
        n.checked_mul(MINUTE).map(|seconds| Self::new(n.to_string(), seconds))
    }

    fn scaled(digits: &str, code: char, unit: u64) -> Self {
        count(digits)
            .and_then(|n| {
                n.checked_mul(unit)
                    .map(|seconds| Self::new(format!("{n}{code}"), seconds))
            })
            .unwrap_or_else(Self::daily)
    }

    fn new(resolution: impl Into<String>, bar_seconds: u64) -> Self {
        Self {
            resolution: resolution.into(),
            bar_seconds,
        }
    }

    /// Resolution code sent in `create_series`.
    #[must_use]
    pub fn resolution(&self) -> &str {
        &self.resolution
    }

    /// Length of one bar in seconds.
    #[must_use]
    pub const fn bar_seconds(&self) -> u64 {
        self.bar_seconds
    }

    /// Whether this is the single-day resolution.
    #[must_use]
    pub fn is_daily(&self) -> bool {
        self.resolution == "1D"
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.resolution)
    }
}

/// Multiplier prefix of a unit-suffixed timeframe. An empty prefix means one.
fn count(digits: &str) -> Option<u64> {
    if digits.is_empty() {
        return Some(1);
    }
    digits.parse::<u64>().ok().filter(|n| *n > 0)
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test_case("1m", "1", 60 ; "one minute")]
    #[test_case("5m", "5", 300 ; "five minutes")]
    #[test_case("15m", "15", 900 ; "fifteen minutes")]
    #[test_case("1h", "60", 3_600 ; "one hour")]
    #[test_case("4h", "240", 14_400 ; "four hours")]
    #[test_case("D", "1D", 86_400 ; "bare day")]
    #[test_case("1D", "1D", 86_400 ; "one day")]
    #[test_case("3D", "3D", 259_200 ; "three days")]
    #[test_case("W", "1W", 604_800 ; "bare week")]
    #[test_case("2W", "2W", 1_209_600 ; "two weeks")]
    #[test_case("M", "1M", 2_592_000 ; "bare month")]
    #[test_case("2M", "2M", 5_184_000 ; "two months")]
    #[test_case("30", "30", 1_800 ; "bare minutes")]
    #[test_case("banana", "1D", 86_400 ; "unrecognized")]
    #[test_case("", "1D", 86_400 ; "empty")]
    #[test_case("0m", "1D", 86_400 ; "zero minutes")]
    #[test_case("18446744073709551615h", "1D", 86_400 ; "hours overflow")]
    #[test_case("999999999999999999", "1D", 86_400 ; "bare minutes overflow")]
    #[test_case("99999999999999999999m", "1D", 86_400 ; "minutes beyond u64")]
    #[test_case("999999999999999W", "1D", 86_400 ; "weeks overflow")]
    #[test_case("999999999999999M", "1D", 86_400 ; "months overflow")]
    fn normalizes(input: &str, resolution: &str, seconds: u64) {
        let tf = Timeframe::parse(input);
        assert_eq!(tf.resolution(), resolution);
        assert_eq!(tf.bar_seconds(), seconds);
    }

    #[test]
    fn daily_detection() {
        assert!(Timeframe::parse("D").is_daily());
        assert!(Timeframe::parse("1D").is_daily());
        assert!(!Timeframe::parse("1h").is_daily());
        assert!(!Timeframe::parse("2D").is_daily());
    }

    #[test]
    fn display_is_resolution() {
        assert_eq!(Timeframe::parse("1h").to_string(), "60");
    }
}
