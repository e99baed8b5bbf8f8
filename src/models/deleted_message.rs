//! Archived message records.

use super::{blob_id::BlobId, bucket::BucketName};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Blob-store namespace shared by every blob written in the legacy format.
pub const LEGACY_NAMESPACE: &str = "deleted-messages-legacy";

/// Descriptive metadata of a permanently deleted message.
///
/// Built once when the message is archived and never mutated afterwards.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeletedMessage {
    /// User the message belonged to.
    pub owner: String,

    /// Identifier of the message in the user's mailboxes.
    pub message_id: String,

    /// Path of the mailbox the message was deleted from (e.g. `INBOX/Archive`).
    pub origin_mailbox: String,

    /// Envelope sender; `None` for the null sender.
    pub sender: Option<String>,

    pub recipients: Vec<String>,

    pub subject: Option<String>,

    /// Size of the raw message in bytes.
    pub size: u64,

    #[serde(default)]
    pub has_attachment: bool,

    pub internal_date: DateTime<Utc>,
    pub deletion_date: DateTime<Utc>,
    pub delivery_date: DateTime<Utc>,
}

/// Where the raw content of an archived message lives.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum StorageReference {
    /// Content-hash addressed blob in [`LEGACY_NAMESPACE`]. Only read, never
    /// chosen for new appends.
    #[serde(rename_all = "camelCase")]
    Legacy { blob_id: BlobId },

    /// Time-prefixed blob stored in the namespace of its bucket.
    #[serde(rename_all = "camelCase")]
    Partitioned { bucket: BucketName, blob_id: BlobId },
}

impl StorageReference {
    /// Blob-store namespace holding the content.
    pub fn namespace(&self) -> &str {
        match self {
            StorageReference::Legacy { .. } => LEGACY_NAMESPACE,
            StorageReference::Partitioned { bucket, .. } => bucket.as_str(),
        }
    }

    pub fn blob_id(&self) -> &BlobId {
        match self {
            StorageReference::Legacy { blob_id } | StorageReference::Partitioned { blob_id, .. } => {
                blob_id
            }
        }
    }
}

/// A metadata record as the vault files it: the message, the bucket the
/// record is filed under, and the reference to its content.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeletedMessageWithStorage {
    pub message: DeletedMessage,
    pub bucket: BucketName,
    pub storage: StorageReference,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespace_follows_reference_variant() {
        let legacy = StorageReference::Legacy {
            blob_id: BlobId::new("0cc175b9c0f1b6a831c399e269772661"),
        };
        let partitioned = StorageReference::Partitioned {
            bucket: BucketName::new("deleted-messages-2024-01-01"),
            blob_id: BlobId::new("2024/01/abc"),
        };

        assert_eq!(legacy.namespace(), LEGACY_NAMESPACE);
        assert_eq!(partitioned.namespace(), "deleted-messages-2024-01-01");
        assert_eq!(partitioned.blob_id().as_str(), "2024/01/abc");
    }

    #[test]
    fn storage_reference_json_is_tagged() {
        let reference = StorageReference::Partitioned {
            bucket: BucketName::new("deleted-messages-2024-01-01"),
            blob_id: BlobId::new("2024/01/abc"),
        };
        let json = serde_json::to_value(&reference).unwrap();
        assert_eq!(json["kind"], "partitioned");
        assert_eq!(json["bucket"], "deleted-messages-2024-01-01");
        assert_eq!(json["blobId"], "2024/01/abc");
    }
}
