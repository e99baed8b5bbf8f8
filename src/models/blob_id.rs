//! Identifiers for archived message content.

use crate::clock::Clock;
use chrono::Datelike;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of one blob inside a blob-store namespace.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct BlobId(String);

impl BlobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Deduplicating id used by the legacy shared namespace: the md5 of the
    /// content, so identical messages share one blob.
    pub fn for_legacy_content(content: &[u8]) -> Self {
        Self(format!("{:x}", md5::compute(content)))
    }
}

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Generates time-prefixed blob ids of the form `YYYY/MM/<128 random bits>`.
#[derive(Debug, Default, Clone, Copy)]
pub struct BlobIdGenerator;

impl BlobIdGenerator {
    pub fn current_blob_id(&self, clock: &dyn Clock) -> BlobId {
        let now = clock.now();
        let suffix: u128 = rand::random();
        BlobId(format!("{:04}/{:02}/{:032x}", now.year(), now.month(), suffix))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use chrono::{TimeZone, Utc};
    use std::collections::HashSet;

    #[test]
    fn blob_id_embeds_year_and_month() {
        let clock = FixedClock::new(Utc.with_ymd_and_hms(2024, 5, 9, 8, 30, 0).unwrap());
        let id = BlobIdGenerator.current_blob_id(&clock);
        let parts: Vec<&str> = id.as_str().split('/').collect();

        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "2024");
        assert_eq!(parts[1], "05");
        assert_eq!(parts[2].len(), 32);
        assert!(parts[2].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn blob_ids_do_not_collide() {
        let clock = FixedClock::new(Utc.with_ymd_and_hms(2024, 5, 9, 8, 30, 0).unwrap());
        let ids: HashSet<BlobId> = (0..10_000)
            .map(|_| BlobIdGenerator.current_blob_id(&clock))
            .collect();
        assert_eq!(ids.len(), 10_000);
    }

    #[test]
    fn legacy_ids_deduplicate_content() {
        let a = BlobId::for_legacy_content(b"Subject: hello\r\n\r\nbody");
        let b = BlobId::for_legacy_content(b"Subject: hello\r\n\r\nbody");
        let c = BlobId::for_legacy_content(b"Subject: other\r\n\r\nbody");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.as_str().len(), 32);
    }
}
