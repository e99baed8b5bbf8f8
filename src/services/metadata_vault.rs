//! src/services/metadata_vault.rs
//!
//! Structured records of archived messages, filed per owner and per bucket.
//! `SqliteMetadataVault` keeps them in one SQLite table; the row mapping below
//! is where the legacy and time-partitioned storage references meet.

use crate::errors::{VaultError, VaultResult};
use crate::models::{BlobId, BucketName, DeletedMessage, DeletedMessageWithStorage, StorageReference};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{
    StreamExt, TryStreamExt,
    stream::{self, BoxStream},
};
use sqlx::{FromRow, QueryBuilder, SqlitePool, sqlite::Sqlite};
use std::sync::Arc;
use tracing::{debug, info};

/// Records fetched per round-trip when listing a bucket.
pub const PAGE_SIZE: usize = 100;

const KIND_LEGACY: &str = "legacy";
const KIND_PARTITIONED: &str = "partitioned";

const COLUMNS: &str = "owner, bucket, message_id, origin_mailbox, sender, recipients, subject, \
     size_bytes, has_attachment, internal_date, deletion_date, delivery_date, \
     storage_kind, blob_id, storage_bucket";

const MIGRATION: &str = include_str!("../../migrations/0001_init.sql");

/// Index of archived message records.
///
/// Operations targeting missing owners, buckets or messages succeed as
/// no-ops; only store failures surface as errors.
#[async_trait]
pub trait MetadataVault: Send + Sync {
    /// File `record` under its owner and bucket, replacing any previous
    /// record with the same message id there.
    async fn store(&self, record: &DeletedMessageWithStorage) -> VaultResult<()>;

    async fn retrieve(
        &self,
        owner: &str,
        bucket: &BucketName,
        message_id: &str,
    ) -> VaultResult<Option<DeletedMessageWithStorage>>;

    /// Buckets currently holding at least one record of `owner`.
    async fn list_buckets(&self, owner: &str) -> VaultResult<Vec<BucketName>>;

    /// Lazily paginated records of `owner` in `bucket`.
    fn list_messages(
        &self,
        owner: &str,
        bucket: &BucketName,
    ) -> BoxStream<'static, VaultResult<DeletedMessageWithStorage>>;

    /// Every bucket holding records, whatever their owner.
    async fn list_related_buckets(&self) -> VaultResult<Vec<BucketName>>;

    /// Lazily paginated records of every owner in `bucket`.
    fn list_bucket_messages(
        &self,
        bucket: &BucketName,
    ) -> BoxStream<'static, VaultResult<DeletedMessageWithStorage>>;

    async fn remove(&self, owner: &str, bucket: &BucketName, message_id: &str) -> VaultResult<()>;

    async fn remove_bucket(&self, owner: &str, bucket: &BucketName) -> VaultResult<()>;

    /// Drop every record filed under `bucket`, returning how many were removed.
    async fn remove_metadata_related_to_bucket(&self, bucket: &BucketName) -> VaultResult<u64>;

    /// Records still pointing at the shared legacy blob `blob_id`.
    async fn legacy_reference_count(&self, blob_id: &BlobId) -> VaultResult<u64>;
}

/// One row of `deleted_messages`.
#[derive(FromRow, Debug)]
struct DeletedMessageRow {
    owner: String,
    bucket: String,
    message_id: String,
    origin_mailbox: String,
    sender: Option<String>,
    recipients: String,
    subject: Option<String>,
    size_bytes: i64,
    has_attachment: bool,
    internal_date: DateTime<Utc>,
    deletion_date: DateTime<Utc>,
    delivery_date: DateTime<Utc>,
    storage_kind: String,
    blob_id: String,
    storage_bucket: Option<String>,
}

impl TryFrom<DeletedMessageRow> for DeletedMessageWithStorage {
    type Error = VaultError;

    fn try_from(row: DeletedMessageRow) -> VaultResult<Self> {
        let storage = match (row.storage_kind.as_str(), row.storage_bucket) {
            (KIND_LEGACY, _) => StorageReference::Legacy {
                blob_id: BlobId::new(row.blob_id),
            },
            (KIND_PARTITIONED, Some(storage_bucket)) => StorageReference::Partitioned {
                bucket: BucketName::new(storage_bucket),
                blob_id: BlobId::new(row.blob_id),
            },
            (KIND_PARTITIONED, None) => {
                return Err(VaultError::CorruptedRecord(format!(
                    "message `{}` of `{}` is partitioned but has no storage bucket",
                    row.message_id, row.owner
                )));
            }
            (other, _) => {
                return Err(VaultError::CorruptedRecord(format!(
                    "message `{}` of `{}` has unknown storage kind `{}`",
                    row.message_id, row.owner, other
                )));
            }
        };

        let recipients: Vec<String> = serde_json::from_str(&row.recipients).map_err(|err| {
            VaultError::CorruptedRecord(format!(
                "message `{}` of `{}` has unreadable recipients: {}",
                row.message_id, row.owner, err
            ))
        })?;
        let size = u64::try_from(row.size_bytes).map_err(|_| {
            VaultError::CorruptedRecord(format!(
                "message `{}` of `{}` has negative size {}",
                row.message_id, row.owner, row.size_bytes
            ))
        })?;

        Ok(DeletedMessageWithStorage {
            message: DeletedMessage {
                owner: row.owner,
                message_id: row.message_id,
                origin_mailbox: row.origin_mailbox,
                sender: row.sender,
                recipients,
                subject: row.subject,
                size,
                has_attachment: row.has_attachment,
                internal_date: row.internal_date,
                deletion_date: row.deletion_date,
                delivery_date: row.delivery_date,
            },
            bucket: BucketName::new(row.bucket),
            storage,
        })
    }
}

/// Keyset position inside a bucket listing.
enum Page {
    First,
    After { owner: String, message_id: String },
    Done,
}

#[derive(Clone)]
pub struct SqliteMetadataVault {
    /// Shared SQLite connection pool.
    pub db: Arc<SqlitePool>,
}

impl SqliteMetadataVault {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Create the schema if it does not exist yet.
    pub async fn migrate(&self) -> VaultResult<()> {
        let statements = MIGRATION
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        info!("Running {} migration statements...", statements.len());

        for stmt in statements {
            debug!("Executing migration SQL: {}", stmt);
            sqlx::query(stmt).execute(&*self.db).await?;
        }

        Ok(())
    }

    fn paged(
        &self,
        bucket: &BucketName,
        owner: Option<&str>,
    ) -> BoxStream<'static, VaultResult<DeletedMessageWithStorage>> {
        let db = self.db.clone();
        let bucket = bucket.to_string();
        let owner = owner.map(str::to_string);

        stream::try_unfold(Page::First, move |page| {
            next_page(db.clone(), bucket.clone(), owner.clone(), page)
        })
        .map_ok(|records| stream::iter(records.into_iter().map(Ok::<_, VaultError>)))
        .try_flatten()
        .boxed()
    }
}

async fn next_page(
    db: Arc<SqlitePool>,
    bucket: String,
    owner: Option<String>,
    page: Page,
) -> VaultResult<Option<(Vec<DeletedMessageWithStorage>, Page)>> {
    if matches!(page, Page::Done) {
        return Ok(None);
    }
    let rows = fetch_page(&db, bucket, owner, page).await?;
    let next = match rows.last() {
        Some(last) if rows.len() == PAGE_SIZE => Page::After {
            owner: last.owner.clone(),
            message_id: last.message_id.clone(),
        },
        _ => Page::Done,
    };
    let records = rows
        .into_iter()
        .map(DeletedMessageWithStorage::try_from)
        .collect::<VaultResult<Vec<_>>>()?;
    Ok(Some((records, next)))
}

async fn fetch_page(
    db: &SqlitePool,
    bucket: String,
    owner: Option<String>,
    page: Page,
) -> VaultResult<Vec<DeletedMessageRow>> {
    let mut builder = QueryBuilder::<Sqlite>::new(format!(
        "SELECT {} FROM deleted_messages WHERE bucket = ",
        COLUMNS
    ));
    builder.push_bind(bucket);

    if let Some(owner) = owner {
        builder.push(" AND owner = ");
        builder.push_bind(owner);
    }

    if let Page::After { owner, message_id } = page {
        builder.push(" AND (owner > ");
        builder.push_bind(owner.clone());
        builder.push(" OR (owner = ");
        builder.push_bind(owner);
        builder.push(" AND message_id > ");
        builder.push_bind(message_id);
        builder.push("))");
    }

    builder.push(" ORDER BY owner ASC, message_id ASC LIMIT ");
    builder.push_bind(PAGE_SIZE as i64);

    Ok(builder
        .build_query_as::<DeletedMessageRow>()
        .fetch_all(db)
        .await?)
}

#[async_trait]
impl MetadataVault for SqliteMetadataVault {
    async fn store(&self, record: &DeletedMessageWithStorage) -> VaultResult<()> {
        let message = &record.message;
        let (kind, storage_bucket) = match &record.storage {
            StorageReference::Legacy { .. } => (KIND_LEGACY, None),
            StorageReference::Partitioned { bucket, .. } => (KIND_PARTITIONED, Some(bucket.as_str())),
        };
        let size_bytes = i64::try_from(message.size).map_err(|_| {
            VaultError::CorruptedRecord(format!("message size {} out of range", message.size))
        })?;

        sqlx::query(
            r#"
            INSERT INTO deleted_messages (
                owner, bucket, message_id, origin_mailbox, sender, recipients, subject,
                size_bytes, has_attachment, internal_date, deletion_date, delivery_date,
                storage_kind, blob_id, storage_bucket
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(owner, bucket, message_id) DO UPDATE SET
                origin_mailbox = excluded.origin_mailbox,
                sender = excluded.sender,
                recipients = excluded.recipients,
                subject = excluded.subject,
                size_bytes = excluded.size_bytes,
                has_attachment = excluded.has_attachment,
                internal_date = excluded.internal_date,
                deletion_date = excluded.deletion_date,
                delivery_date = excluded.delivery_date,
                storage_kind = excluded.storage_kind,
                blob_id = excluded.blob_id,
                storage_bucket = excluded.storage_bucket
            "#,
        )
        .bind(&message.owner)
        .bind(record.bucket.as_str())
        .bind(&message.message_id)
        .bind(&message.origin_mailbox)
        .bind(&message.sender)
        .bind(serde_json::to_string(&message.recipients)?)
        .bind(&message.subject)
        .bind(size_bytes)
        .bind(message.has_attachment)
        .bind(message.internal_date)
        .bind(message.deletion_date)
        .bind(message.delivery_date)
        .bind(kind)
        .bind(record.storage.blob_id().as_str())
        .bind(storage_bucket)
        .execute(&*self.db)
        .await?;

        Ok(())
    }

    async fn retrieve(
        &self,
        owner: &str,
        bucket: &BucketName,
        message_id: &str,
    ) -> VaultResult<Option<DeletedMessageWithStorage>> {
        let row = sqlx::query_as::<_, DeletedMessageRow>(&format!(
            "SELECT {} FROM deleted_messages WHERE owner = ? AND bucket = ? AND message_id = ?",
            COLUMNS
        ))
        .bind(owner)
        .bind(bucket.as_str())
        .bind(message_id)
        .fetch_optional(&*self.db)
        .await?;

        row.map(DeletedMessageWithStorage::try_from).transpose()
    }

    async fn list_buckets(&self, owner: &str) -> VaultResult<Vec<BucketName>> {
        let names = sqlx::query_scalar::<_, String>(
            "SELECT DISTINCT bucket FROM deleted_messages WHERE owner = ? ORDER BY bucket",
        )
        .bind(owner)
        .fetch_all(&*self.db)
        .await?;

        Ok(names.into_iter().map(BucketName::from).collect())
    }

    fn list_messages(
        &self,
        owner: &str,
        bucket: &BucketName,
    ) -> BoxStream<'static, VaultResult<DeletedMessageWithStorage>> {
        self.paged(bucket, Some(owner))
    }

    async fn list_related_buckets(&self) -> VaultResult<Vec<BucketName>> {
        let names = sqlx::query_scalar::<_, String>(
            "SELECT DISTINCT bucket FROM deleted_messages ORDER BY bucket",
        )
        .fetch_all(&*self.db)
        .await?;

        Ok(names.into_iter().map(BucketName::from).collect())
    }

    fn list_bucket_messages(
        &self,
        bucket: &BucketName,
    ) -> BoxStream<'static, VaultResult<DeletedMessageWithStorage>> {
        self.paged(bucket, None)
    }

    async fn remove(&self, owner: &str, bucket: &BucketName, message_id: &str) -> VaultResult<()> {
        sqlx::query("DELETE FROM deleted_messages WHERE owner = ? AND bucket = ? AND message_id = ?")
            .bind(owner)
            .bind(bucket.as_str())
            .bind(message_id)
            .execute(&*self.db)
            .await?;
        Ok(())
    }

    async fn remove_bucket(&self, owner: &str, bucket: &BucketName) -> VaultResult<()> {
        sqlx::query("DELETE FROM deleted_messages WHERE owner = ? AND bucket = ?")
            .bind(owner)
            .bind(bucket.as_str())
            .execute(&*self.db)
            .await?;
        Ok(())
    }

    async fn remove_metadata_related_to_bucket(&self, bucket: &BucketName) -> VaultResult<u64> {
        let result = sqlx::query("DELETE FROM deleted_messages WHERE bucket = ?")
            .bind(bucket.as_str())
            .execute(&*self.db)
            .await?;
        Ok(result.rows_affected())
    }

    async fn legacy_reference_count(&self, blob_id: &BlobId) -> VaultResult<u64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM deleted_messages WHERE storage_kind = ? AND blob_id = ?",
        )
        .bind(KIND_LEGACY)
        .bind(blob_id.as_str())
        .fetch_one(&*self.db)
        .await?;
        Ok(count.max(0) as u64)
    }
}
