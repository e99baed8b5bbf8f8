//! Month-granularity partitions for archived messages.
//!
//! A bucket is named `deleted-messages-YYYY-MM-01` after the first day of the
//! month its records were archived in. Both the metadata records and the
//! time-partitioned blobs of that month live under the same name, so expiring
//! a month is one bucket deletion instead of a scan over every message.

use crate::clock::Clock;
use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Prefix shared by every bucket the vault creates.
pub const BUCKET_PREFIX: &str = "deleted-messages-";

/// Name of a time partition.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct BucketName(String);

impl BucketName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BucketName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for BucketName {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Maps instants to bucket names and bucket names back to their end boundary.
#[derive(Debug, Default, Clone, Copy)]
pub struct BucketNameGenerator;

impl BucketNameGenerator {
    /// Bucket holding everything archived "now".
    pub fn current_bucket(&self, clock: &dyn Clock) -> BucketName {
        Self::bucket_for(clock.now())
    }

    /// Bucket for an arbitrary instant, truncated to the first day of its month.
    pub fn bucket_for(instant: DateTime<Utc>) -> BucketName {
        BucketName(format!(
            "{}{:04}-{:02}-01",
            BUCKET_PREFIX,
            instant.year(),
            instant.month()
        ))
    }

    /// First instant of the month following the bucket's month, in UTC.
    ///
    /// Returns `None` for anything that is not exactly
    /// `deleted-messages-YYYY-MM-01`: callers treat such names as foreign
    /// data and leave them alone.
    pub fn bucket_end_time(&self, bucket: &BucketName) -> Option<DateTime<Utc>> {
        let (year, month) = parse_year_month(bucket.as_str())?;
        let (next_year, next_month) = if month == 12 {
            (year.checked_add(1)?, 1)
        } else {
            (year, month + 1)
        };
        let start = NaiveDate::from_ymd_opt(next_year, next_month, 1)?.and_hms_opt(0, 0, 0)?;
        Some(Utc.from_utc_datetime(&start))
    }
}

fn parse_year_month(name: &str) -> Option<(i32, u32)> {
    let date = name.strip_prefix(BUCKET_PREFIX)?.as_bytes();
    // YYYY-MM-01
    if date.len() != 10 || date[4] != b'-' || date[7] != b'-' || &date[8..] != b"01" {
        return None;
    }
    let year = parse_digits(&date[0..4])?;
    let month = parse_digits(&date[5..7])?;
    if !(1..=12).contains(&month) {
        return None;
    }
    Some((year as i32, month))
}

fn parse_digits(digits: &[u8]) -> Option<u32> {
    digits.iter().try_fold(0u32, |acc, b| {
        b.is_ascii_digit().then(|| acc * 10 + u32::from(b - b'0'))
    })
}
