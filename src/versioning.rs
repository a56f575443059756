//! Timestamp-based cache key versioning.
//!
//! A versioned key carries the last-modified time of the data it was built
//! from, as `"{base}-v{millis}"`. When the data changes the key changes with it,
//! so stale entries are never read again and simply age out of the cache.

use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

/// JSON field names probed for a last-modified time, in order.
const TIMESTAMP_FIELDS: [&str; 3] = ["updatedAt", "updated_at", "lastModified"];

fn version_suffix() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^(.*)-v(\d+)$").expect("valid version pattern"))
}

/// Splits a versioned key into base and timestamp. A suffix whose digits do
/// not fit an `i64` is part of the base key.
fn split_versioned(key: &str) -> Option<(&str, i64)> {
    let caps = version_suffix().captures(key)?;
    let millis = caps.get(2)?.as_str().parse().ok()?;
    Some((caps.get(1)?.as_str(), millis))
}

/// A value exposing its last modification time.
pub trait Timestamped {
    /// Last modification time, if known.
    fn updated_at(&self) -> Option<DateTime<Utc>>;
}

/// Anything a version can be derived from.
#[derive(Clone, Copy)]
pub enum VersionSource<'a> {
    /// Milliseconds since the Unix epoch.
    Millis(i64),
    /// A point in time.
    DateTime(DateTime<Utc>),
    /// A calendar date, taken at midnight UTC.
    Date(NaiveDate),
    /// A system clock reading.
    SystemTime(SystemTime),
    /// RFC 3339 text.
    Text(&'a str),
    /// A JSON object carrying one of the well-known timestamp fields.
    Json(&'a Value),
    /// A domain object.
    Object(&'a dyn Timestamped),
}

impl From<i64> for VersionSource<'_> {
    fn from(millis: i64) -> Self {
        VersionSource::Millis(millis)
    }
}

impl From<DateTime<Utc>> for VersionSource<'_> {
    fn from(value: DateTime<Utc>) -> Self {
        VersionSource::DateTime(value)
    }
}

impl From<NaiveDate> for VersionSource<'_> {
    fn from(value: NaiveDate) -> Self {
        VersionSource::Date(value)
    }
}

impl From<SystemTime> for VersionSource<'_> {
    fn from(value: SystemTime) -> Self {
        VersionSource::SystemTime(value)
    }
}

impl<'a> From<&'a str> for VersionSource<'a> {
    fn from(value: &'a str) -> Self {
        VersionSource::Text(value)
    }
}

impl<'a> From<&'a Value> for VersionSource<'a> {
    fn from(value: &'a Value) -> Self {
        VersionSource::Json(value)
    }
}

impl<'a> From<&'a dyn Timestamped> for VersionSource<'a> {
    fn from(value: &'a dyn Timestamped) -> Self {
        VersionSource::Object(value)
    }
}

/// Pulls a millisecond timestamp out of a [`VersionSource`].
pub trait TimestampExtractor: Send + Sync {
    /// Timestamp in milliseconds since the epoch, `None` when the source
    /// carries none.
    fn extract(&self, source: &VersionSource<'_>) -> Option<i64>;
}

/// Handles every [`VersionSource`] variant. Times before the epoch yield
/// nothing, since the key suffix only carries unsigned digits.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultTimestampExtractor;

impl DefaultTimestampExtractor {
    fn from_json(value: &Value) -> Option<i64> {
        let object = value.as_object()?;
        TIMESTAMP_FIELDS
            .iter()
            .filter_map(|field| object.get(*field))
            .find_map(|field| match field {
                Value::Number(n) => n.as_i64(),
                Value::String(s) => DateTime::parse_from_rfc3339(s)
                    .ok()
                    .map(|dt| dt.timestamp_millis()),
                _ => None,
            })
    }
}

impl TimestampExtractor for DefaultTimestampExtractor {
    fn extract(&self, source: &VersionSource<'_>) -> Option<i64> {
        let millis = match source {
            VersionSource::Millis(millis) => Some(*millis),
            VersionSource::DateTime(dt) => Some(dt.timestamp_millis()),
            VersionSource::Date(date) => date
                .and_hms_opt(0, 0, 0)
                .map(|midnight| midnight.and_utc().timestamp_millis()),
            VersionSource::SystemTime(time) => time
                .duration_since(UNIX_EPOCH)
                .ok()
                .and_then(|d| i64::try_from(d.as_millis()).ok()),
            VersionSource::Text(text) => DateTime::parse_from_rfc3339(text.trim())
                .ok()
                .map(|dt| dt.timestamp_millis()),
            VersionSource::Json(value) => Self::from_json(value),
            VersionSource::Object(object) => object.updated_at().map(|dt| dt.timestamp_millis()),
        };
        millis.filter(|m| *m >= 0)
    }
}

/// Builds and parses timestamp-versioned cache keys.
pub struct CacheKeyVersioner {
    extractor: Box<dyn TimestampExtractor>,
}

impl Default for CacheKeyVersioner {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheKeyVersioner {
    /// Versioner using [`DefaultTimestampExtractor`].
    pub fn new() -> Self {
        Self::with_extractor(DefaultTimestampExtractor)
    }

    /// Versioner with a custom extractor.
    pub fn with_extractor(extractor: impl TimestampExtractor + 'static) -> Self {
        Self {
            extractor: Box::new(extractor),
        }
    }

    /// `"{base_key}-v{millis}"` using the newest timestamp among `sources`,
    /// or `base_key` unchanged when none of them carries a timestamp.
    pub fn generate_versioned_key(&self, base_key: &str, sources: &[VersionSource<'_>]) -> String {
        match sources.iter().filter_map(|s| self.extractor.extract(s)).max() {
            Some(millis) => format!("{}-v{}", base_key, millis),
            None => base_key.to_string(),
        }
    }

    /// Key without its version suffix.
    pub fn extract_base_key<'k>(&self, key: &'k str) -> &'k str {
        split_versioned(key).map_or(key, |(base, _)| base)
    }

    /// Version timestamp of a key, if it has one.
    pub fn extract_timestamp(&self, key: &str) -> Option<i64> {
        split_versioned(key).map(|(_, millis)| millis)
    }

    /// Whether the key carries a version suffix.
    pub fn is_versioned_key(&self, key: &str) -> bool {
        self.extract_timestamp(key).is_some()
    }

    /// Whether a key's version predates `current_millis`. Unversioned keys are
    /// never considered stale.
    pub fn is_stale(&self, key: &str, current_millis: i64) -> bool {
        self.extract_timestamp(key)
            .map_or(false, |version| version < current_millis)
    }
}
