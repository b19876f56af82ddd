//! Fetch and schema metadata tracking
//!
//! `FetchMeta` is the single global row that records which build and schema generation last
//! touched a database. `SourceFile` identifies one vendor file so unchanged sources can be skipped.

use chrono::{DateTime, Months, NaiveDate, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};

/// Schema generation written by this build
pub const LATEST_SCHEMA_VERSION: u32 = 2;

/// Revision of the running build
pub const REVISION: &str = match option_env!("VERGEN_GIT_SHA") {
    Some(sha) => sha,
    None => "unknown",
};

/// Fetch metadata stored once per database
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchMeta {
    pub revision: String,
    pub schema_version: u32,
    pub last_fetched_at: DateTime<Utc>,
}

impl FetchMeta {
    /// Metadata reported for a database that has no fetch_meta row yet
    pub fn current() -> Self {
        Self {
            revision: REVISION.to_string(),
            schema_version: LATEST_SCHEMA_VERSION,
            last_fetched_at: fixed_date(1000),
        }
    }

    pub fn is_outdated(&self) -> bool {
        self.schema_version != LATEST_SCHEMA_VERSION
    }

    /// Fail when the database schema generation is not the one this build writes.
    pub fn ensure_current(&self) -> Result<()> {
        if self.is_outdated() {
            return Err(StoreError::SchemaOutdated {
                stored: self.schema_version,
                latest: LATEST_SCHEMA_VERSION,
            });
        }
        Ok(())
    }

    /// Stamp with the running revision and the latest schema version.
    pub fn restamp(&mut self) {
        self.revision = REVISION.to_string();
        self.schema_version = LATEST_SCHEMA_VERSION;
    }
}

/// Identity of one ingested vendor file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub name: String,
    pub timestamp: DateTime<Utc>,
}

impl SourceFile {
    pub fn new(name: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            timestamp,
        }
    }
}

/// Zero-value time (`0001-01-01T00:00:00Z`) used for absent advisory dates
pub fn zero_time() -> DateTime<Utc> {
    fixed_date(1)
}

/// Last-modified value for a partition that was never ingested
pub fn stale_sentinel(now: DateTime<Utc>) -> DateTime<Utc> {
    now.checked_sub_months(Months::new(100 * 12))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn fixed_date(year: i32) -> DateTime<Utc> {
    NaiveDate::from_ymd_opt(year, 1, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Timestamps are persisted as RFC 3339 text so every dialect stores them identically.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::InvalidTimestamp {
            value: value.to_string(),
            reason: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_fetch_meta_current_is_not_outdated() {
        let meta = FetchMeta::current();
        assert!(!meta.is_outdated());
        assert!(meta.ensure_current().is_ok());
        assert_eq!(meta.last_fetched_at.format("%Y-%m-%d").to_string(), "1000-01-01");
    }

    #[test]
    fn test_fetch_meta_outdated() {
        let mut meta = FetchMeta {
            revision: "old".to_string(),
            schema_version: 1,
            last_fetched_at: zero_time(),
        };
        assert!(meta.is_outdated());
        assert!(matches!(
            meta.ensure_current(),
            Err(StoreError::SchemaOutdated { stored: 1, latest: 2 })
        ));

        meta.restamp();
        assert!(!meta.is_outdated());
        assert_eq!(meta.revision, REVISION);
    }

    #[test]
    fn test_zero_time() {
        assert_eq!(format_timestamp(&zero_time()), "0001-01-01T00:00:00Z");
    }

    #[test]
    fn test_stale_sentinel_is_a_century_old() {
        let now = Utc::now();
        let stale = stale_sentinel(now);
        assert!(now.signed_duration_since(stale).num_days() > 365 * 50);
    }

    #[test]
    fn test_timestamp_roundtrip() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 15, 9, 30, 0).unwrap();
        let formatted = format_timestamp(&ts);
        assert_eq!(formatted, "2024-03-15T09:30:00Z");
        assert_eq!(parse_timestamp(&formatted).unwrap(), ts);

        assert_eq!(parse_timestamp("0001-01-01T00:00:00Z").unwrap(), zero_time());
    }

    #[test]
    fn test_parse_timestamp_invalid() {
        let err = parse_timestamp("yesterday").unwrap_err();
        assert!(matches!(err, StoreError::InvalidTimestamp { .. }));
    }
}
