//! Serializable descriptors exchanged with the task execution framework.

use crate::errors::{VaultError, VaultResult};
use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Stable discriminator of the garbage collection task.
pub const TASK_TYPE: &str = "deleted-messages-blob-store-based-garbage-collection";

/// Persistent form of the garbage collection task.
///
/// The task carries no parameters of its own: retention, parallelism and the
/// stores come from the vault it is rebuilt against.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct GarbageCollectionTaskDto {
    #[serde(rename = "type")]
    pub task_type: String,
}

impl Default for GarbageCollectionTaskDto {
    fn default() -> Self {
        Self {
            task_type: TASK_TYPE.to_string(),
        }
    }
}

impl GarbageCollectionTaskDto {
    pub fn to_json(&self) -> VaultResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> VaultResult<Self> {
        let dto: Self = serde_json::from_str(json)?;
        ensure_type(&dto.task_type)?;
        Ok(dto)
    }
}

/// Progress and outcome report of one garbage collection run.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AdditionalInformation {
    #[serde(rename = "type")]
    pub task_type: String,
    pub beginning_of_retention_period: DateTime<FixedOffset>,
    pub deleted_buckets: BTreeSet<String>,
    pub deleted_blob_count: u64,
    pub timestamp: DateTime<Utc>,
}

impl AdditionalInformation {
    pub fn new(
        beginning_of_retention_period: DateTime<FixedOffset>,
        deleted_buckets: BTreeSet<String>,
        deleted_blob_count: u64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            task_type: TASK_TYPE.to_string(),
            beginning_of_retention_period,
            deleted_buckets,
            deleted_blob_count,
            timestamp,
        }
    }

    pub fn to_json(&self) -> VaultResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> VaultResult<Self> {
        let info: Self = serde_json::from_str(json)?;
        ensure_type(&info.task_type)?;
        Ok(info)
    }
}

fn ensure_type(task_type: &str) -> VaultResult<()> {
    if task_type == TASK_TYPE {
        Ok(())
    } else {
        Err(VaultError::Serialization(format!(
            "unexpected task type `{}`",
            task_type
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn information() -> AdditionalInformation {
        let paris = FixedOffset::east_opt(2 * 3600).unwrap();
        AdditionalInformation::new(
            paris.with_ymd_and_hms(2024, 6, 3, 10, 15, 30).unwrap(),
            BTreeSet::from([
                "deleted-messages-2024-04-01".to_string(),
                "deleted-messages-2024-05-01".to_string(),
            ]),
            12,
            Utc.with_ymd_and_hms(2024, 6, 10, 8, 0, 0).unwrap(),
        )
    }

    #[test]
    fn task_round_trips() {
        let dto = GarbageCollectionTaskDto::default();
        let json = dto.to_json().unwrap();
        assert_eq!(json, format!(r#"{{"type":"{}"}}"#, TASK_TYPE));
        assert_eq!(GarbageCollectionTaskDto::from_json(&json).unwrap(), dto);
    }

    #[test]
    fn foreign_task_type_is_rejected() {
        let err = GarbageCollectionTaskDto::from_json(r#"{"type":"mailbox-reindex"}"#).unwrap_err();
        assert!(matches!(err, VaultError::Serialization(_)));
    }

    #[test]
    fn additional_information_round_trips() {
        let info = information();
        let json = info.to_json().unwrap();
        assert_eq!(AdditionalInformation::from_json(&json).unwrap(), info);
    }

    #[test]
    fn additional_information_json_shape() {
        let value: serde_json::Value = serde_json::from_str(&information().to_json().unwrap()).unwrap();

        assert_eq!(value["type"], TASK_TYPE);
        assert_eq!(value["beginningOfRetentionPeriod"], "2024-06-03T10:15:30+02:00");
        assert_eq!(
            value["deletedBuckets"],
            serde_json::json!(["deleted-messages-2024-04-01", "deleted-messages-2024-05-01"])
        );
        assert_eq!(value["deletedBlobCount"], 12);
        assert_eq!(value["timestamp"], "2024-06-10T08:00:00Z");
    }

    #[test]
    fn additional_information_reads_external_json() {
        let json = r#"{
            "type": "deleted-messages-blob-store-based-garbage-collection",
            "beginningOfRetentionPeriod": "2024-06-03T10:15:30+02:00",
            "deletedBuckets": ["deleted-messages-2024-05-01", "deleted-messages-2024-04-01"],
            "deletedBlobCount": 12,
            "timestamp": "2024-06-10T08:00:00Z"
        }"#;
        assert_eq!(AdditionalInformation::from_json(json).unwrap(), information());
    }
}
