//! Wall-clock time for issuance and expiry.
//!
//! Every timestamp that ends up inside a signed message is truncated to
//! millisecond precision and rendered as RFC 3339 UTC with a `Z` suffix, so
//! that a verifying node re-rendering the same value produces the same bytes.

use crate::errors::{Result, TesseraError};
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// A UTC instant with millisecond precision
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Build from Unix milliseconds
    pub fn from_millis(ms: i64) -> Result<Self> {
        Utc.timestamp_millis_opt(ms)
            .single()
            .map(Self)
            .ok_or_else(|| TesseraError::internal(format!("timestamp {ms}ms out of range")))
    }

    /// Build from a chrono value, dropping sub-millisecond precision
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        let ms = dt.timestamp_millis();
        Self(Utc.timestamp_millis_opt(ms).single().unwrap_or(dt))
    }

    /// Unix milliseconds
    pub fn as_millis(&self) -> i64 {
        self.0.timestamp_millis()
    }

    /// Canonical RFC 3339 rendering, e.g. `2024-01-01T00:00:00.000Z`
    pub fn to_canonical(&self) -> String {
        self.0.to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    /// `self + duration`, or `None` on overflow
    pub fn checked_add(&self, duration: Duration) -> Option<Self> {
        let delta = chrono::Duration::from_std(duration).ok()?;
        self.0.checked_add_signed(delta).map(Self::from_datetime)
    }

    /// `self - duration`, clamped at the earliest representable instant
    pub fn saturating_sub(&self, duration: Duration) -> Self {
        chrono::Duration::from_std(duration)
            .ok()
            .and_then(|delta| self.0.checked_sub_signed(delta))
            .map(Self::from_datetime)
            .unwrap_or(Self(DateTime::<Utc>::MIN_UTC))
    }

    /// Time remaining from `self` until `later`, zero if `later` is not after
    pub fn duration_until(&self, later: &Timestamp) -> Duration {
        (later.0 - self.0).to_std().unwrap_or(Duration::ZERO)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_canonical())
    }
}

impl FromStr for Timestamp {
    type Err = TesseraError;

    fn from_str(s: &str) -> Result<Self> {
        DateTime::parse_from_rfc3339(s)
            .map(|dt| Self::from_datetime(dt.with_timezone(&Utc)))
            .map_err(|e| TesseraError::invalid_delegation(format!("bad timestamp {s:?}: {e}")))
    }
}

impl TryFrom<String> for Timestamp {
    type Error = TesseraError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Timestamp> for String {
    fn from(ts: Timestamp) -> Self {
        ts.to_canonical()
    }
}

/// Source of wall-clock time
pub trait Clock: Send + Sync {
    /// Current time
    fn now(&self) -> Timestamp;
}

/// Clock backed by the host system time
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Timestamp::from_datetime(Utc::now())
    }
}

impl<C: Clock + ?Sized> Clock for std::sync::Arc<C> {
    fn now(&self) -> Timestamp {
        (**self).now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_rendering() {
        let ts = Timestamp::from_millis(1_704_067_200_123).unwrap();
        assert_eq!(ts.to_canonical(), "2024-01-01T00:00:00.123Z");
        assert_eq!(ts.to_canonical().parse::<Timestamp>().unwrap(), ts);
    }

    #[test]
    fn test_parse_normalizes_offsets() {
        let a: Timestamp = "2024-01-01T01:00:00.000+01:00".parse().unwrap();
        let b: Timestamp = "2024-01-01T00:00:00.000Z".parse().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_arithmetic() {
        let start = Timestamp::from_millis(1_000_000).unwrap();
        let later = start.checked_add(Duration::from_secs(600)).unwrap();
        assert_eq!(later.as_millis(), 1_600_000);
        assert_eq!(start.duration_until(&later), Duration::from_secs(600));
        assert_eq!(later.duration_until(&start), Duration::ZERO);
        assert_eq!(later.saturating_sub(Duration::from_secs(600)), start);
    }
}
