//! Absolute and relative time windows.

use core::fmt;
use core::str::FromStr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use time::{Date, Duration, OffsetDateTime};

use crate::error::{ParseError, ParseResult};

/// An inclusive `[start, end]` window of source timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct TimeRange {
    /// First instant included in the window.
    #[cfg_attr(feature = "serde", serde(with = "time::serde::rfc3339"))]
    pub start: OffsetDateTime,
    /// Last instant included in the window.
    #[cfg_attr(feature = "serde", serde(with = "time::serde::rfc3339"))]
    pub end: OffsetDateTime,
}

impl TimeRange {
    /// Create a range, rejecting windows that end before they start.
    pub fn new(start: OffsetDateTime, end: OffsetDateTime) -> ParseResult<Self> {
        if end < start {
            return Err(ParseError::invalid_range(
                format!("{start}..{end}"),
                "end is before start",
            ));
        }
        Ok(Self { start, end })
    }

    /// Earliest instant a window can start at.
    pub const EARLIEST: OffsetDateTime = Date::MIN.midnight().assume_utc();

    /// The window of `span` ending at `now`.
    ///
    /// The start saturates at [`TimeRange::EARLIEST`] instead of overflowing.
    pub fn last(span: Duration, now: OffsetDateTime) -> Self {
        let start = now
            .checked_sub(span.abs())
            .unwrap_or(Self::EARLIEST)
            .min(now);
        Self { start, end: now }
    }

    /// Whether `ts` falls inside the window.
    pub fn contains(&self, ts: OffsetDateTime) -> bool {
        ts >= self.start && ts <= self.end
    }

    /// Length of the window.
    pub fn duration(&self) -> Duration {
        self.end - self.start
    }
}

/// A window expressed relative to "now", e.g. `-1h` or `-30m`.
///
/// Accepted units: `s`, `m`, `h`, `d`, `w`. The leading `-` is optional.
///
/// # Examples
///
/// ```
/// use moldwatch_types::RelativeRange;
/// use time::Duration;
///
/// let range: RelativeRange = "-1h".parse().unwrap();
/// assert_eq!(range.span(), Duration::hours(1));
/// assert_eq!(range.to_string(), "-1h");
/// assert!("-1y".parse::<RelativeRange>().is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RelativeRange {
    span: Duration,
}

impl RelativeRange {
    /// Longest span accepted (100 years).
    pub const MAX_SPAN: Duration = Duration::days(36_525);

    /// Create from a span; the sign is ignored.
    ///
    /// Returns an error for a zero span or one longer than [`Self::MAX_SPAN`].
    pub fn new(span: Duration) -> ParseResult<Self> {
        let span = span.abs();
        if span.is_zero() {
            return Err(ParseError::invalid_range(
                format!("{span}"),
                "span must be positive",
            ));
        }
        if span > Self::MAX_SPAN {
            return Err(ParseError::invalid_range(
                format!("{span}"),
                "span exceeds 100 years",
            ));
        }
        Ok(Self { span })
    }

    /// Length of the window.
    pub fn span(&self) -> Duration {
        self.span
    }

    /// Resolve against a concrete "now".
    pub fn resolve(&self, now: OffsetDateTime) -> TimeRange {
        TimeRange::last(self.span, now)
    }
}

impl Default for RelativeRange {
    fn default() -> Self {
        Self {
            span: Duration::HOUR,
        }
    }
}

impl FromStr for RelativeRange {
    type Err = ParseError;

    fn from_str(s: &str) -> ParseResult<Self> {
        let trimmed = s.trim();
        let body = trimmed.strip_prefix('-').unwrap_or(trimmed);
        let Some(unit_char) = body.chars().last() else {
            return Err(ParseError::invalid_range(s, "expected <number><unit>"));
        };
        let (digits, unit) = body.split_at(body.len() - unit_char.len_utf8());
        if digits.is_empty() {
            return Err(ParseError::invalid_range(s, "expected <number><unit>"));
        }
        let amount: i64 = digits
            .parse()
            .map_err(|_| ParseError::invalid_range(s, format!("'{digits}' is not a number")))?;
        if amount <= 0 {
            return Err(ParseError::invalid_range(s, "span must be positive"));
        }

        let unit_secs: i64 = match unit {
            "s" => 1,
            "m" => 60,
            "h" => 3_600,
            "d" => 86_400,
            "w" => 604_800,
            other => {
                return Err(ParseError::invalid_range(
                    s,
                    format!("unknown unit '{other}' (expected s, m, h, d or w)"),
                ));
            }
        };
        let secs = amount
            .checked_mul(unit_secs)
            .filter(|secs| *secs <= Self::MAX_SPAN.whole_seconds())
            .ok_or_else(|| ParseError::invalid_range(s, "span exceeds 100 years"))?;

        Ok(Self {
            span: Duration::seconds(secs),
        })
    }
}

impl fmt::Display for RelativeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.span.whole_seconds();
        let (amount, unit) = [(604_800, "w"), (86_400, "d"), (3_600, "h"), (60, "m")]
            .into_iter()
            .find(|(size, _)| secs % size == 0)
            .map(|(size, unit)| (secs / size, unit))
            .unwrap_or((secs, "s"));
        write!(f, "-{amount}{unit}")
    }
}

#[cfg(feature = "serde")]
impl Serialize for RelativeRange {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[cfg(feature = "serde")]
impl<'de> Deserialize<'de> for RelativeRange {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
