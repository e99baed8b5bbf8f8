//! src/services/vault.rs
//!
//! DeletedMessageVault: append, search, load and delete archived messages.
//! Content goes to the blob store, records to the metadata vault. Records
//! written before time partitioning existed point at the shared legacy
//! namespace; every read path dispatches on the record's storage reference,
//! so both formats are served side by side.

use super::{
    blob_store::BlobStore, bounded, garbage_collection::BlobStoreVaultGarbageCollectionTask,
    metadata_vault::MetadataVault,
};
use crate::{
    clock::Clock,
    config::VaultConfig,
    errors::VaultResult,
    metrics::{self, MetricsSink, timed},
    models::{
        BlobId, BlobIdGenerator, BucketName, BucketNameGenerator, DeletedMessage,
        DeletedMessageWithStorage, LEGACY_NAMESPACE, Query, StorageReference,
    },
};
use bytes::{Bytes, BytesMut};
use futures::{Stream, TryStreamExt};
use std::{io, sync::Arc};
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct DeletedMessageVault {
    blob_store: Arc<dyn BlobStore>,
    metadata: Arc<dyn MetadataVault>,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn MetricsSink>,
    config: VaultConfig,
}

impl DeletedMessageVault {
    pub fn new(
        blob_store: Arc<dyn BlobStore>,
        metadata: Arc<dyn MetadataVault>,
        clock: Arc<dyn Clock>,
        metrics: Arc<dyn MetricsSink>,
        config: VaultConfig,
    ) -> Self {
        Self {
            blob_store,
            metadata,
            clock,
            metrics,
            config,
        }
    }

    /// Garbage collection task over the same stores, clock and settings.
    pub fn garbage_collection_task(&self) -> BlobStoreVaultGarbageCollectionTask {
        BlobStoreVaultGarbageCollectionTask::new(
            self.blob_store.clone(),
            self.metadata.clone(),
            self.clock.clone(),
            self.metrics.clone(),
            self.config.clone(),
        )
    }

    /// Archive `message` with its raw `content` in the current bucket.
    ///
    /// The blob is written first, then the record. A failed record write
    /// leaves an orphaned blob behind; it is reclaimed when its bucket
    /// expires.
    pub async fn append<S>(
        &self,
        message: DeletedMessage,
        content: S,
    ) -> VaultResult<DeletedMessageWithStorage>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        timed(&*self.metrics, metrics::APPEND, self.append_partitioned(message, content)).await
    }

    /// Archive in the pre-partitioning format: content-hash addressed blob in
    /// the shared legacy namespace. Kept so legacy data can still be produced
    /// and read back; new archival goes through [`Self::append`].
    ///
    /// Shared blobs are dropped once their reference count reaches zero, with
    /// no lock between the count and the delete: an identical legacy append
    /// racing that window loses its content.
    pub async fn append_legacy<S>(
        &self,
        message: DeletedMessage,
        content: S,
    ) -> VaultResult<DeletedMessageWithStorage>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        timed(&*self.metrics, metrics::APPEND, self.append_shared(message, content)).await
    }

    /// Archived messages of `owner` matching `query`, in no particular order.
    pub async fn search(&self, owner: &str, query: &Query) -> VaultResult<Vec<DeletedMessage>> {
        timed(&*self.metrics, metrics::SEARCH, self.search_all_buckets(owner, query)).await
    }

    /// Raw content of an archived message; `None` once it is gone.
    pub async fn load_mime_message(&self, owner: &str, message_id: &str) -> VaultResult<Option<Bytes>> {
        timed(
            &*self.metrics,
            metrics::LOAD_MIME_MESSAGE,
            self.load_content(owner, message_id),
        )
        .await
    }

    /// Forget an archived message. Deleting a missing message succeeds.
    pub async fn delete(&self, owner: &str, message_id: &str) -> VaultResult<()> {
        timed(&*self.metrics, metrics::DELETE, self.delete_everywhere(owner, message_id)).await
    }

    async fn append_partitioned<S>(
        &self,
        message: DeletedMessage,
        content: S,
    ) -> VaultResult<DeletedMessageWithStorage>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        let blob_id = BlobIdGenerator.current_blob_id(&*self.clock);
        let bucket = BucketNameGenerator.current_bucket(&*self.clock);
        let content = read_content(content).await?;

        self.put_blob(bucket.as_str(), &blob_id, content).await?;

        let record = DeletedMessageWithStorage {
            message,
            bucket: bucket.clone(),
            storage: StorageReference::Partitioned { bucket, blob_id },
        };
        self.store_record(&record).await?;

        info!(
            owner = %record.message.owner,
            message_id = %record.message.message_id,
            bucket = %record.bucket,
            "archived deleted message"
        );
        Ok(record)
    }

    async fn append_shared<S>(
        &self,
        message: DeletedMessage,
        content: S,
    ) -> VaultResult<DeletedMessageWithStorage>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        let bucket = BucketNameGenerator.current_bucket(&*self.clock);
        let content = read_content(content).await?;
        let blob_id = BlobId::for_legacy_content(&content);

        self.put_blob(LEGACY_NAMESPACE, &blob_id, content).await?;

        let record = DeletedMessageWithStorage {
            message,
            bucket,
            storage: StorageReference::Legacy { blob_id },
        };
        self.store_record(&record).await?;

        debug!(
            owner = %record.message.owner,
            message_id = %record.message.message_id,
            "archived deleted message in legacy format"
        );
        Ok(record)
    }

    async fn search_all_buckets(&self, owner: &str, query: &Query) -> VaultResult<Vec<DeletedMessage>> {
        let limit = query.limit.unwrap_or(usize::MAX);
        let mut found = Vec::new();
        if limit == 0 {
            return Ok(found);
        }

        for bucket in self.list_buckets(owner).await? {
            let mut records = self.metadata.list_messages(owner, &bucket);
            while let Some(record) =
                bounded("list messages", self.config.store_timeout, records.try_next()).await?
            {
                if query.matches(&record.message) {
                    found.push(record.message);
                    if found.len() >= limit {
                        return Ok(found);
                    }
                }
            }
        }

        Ok(found)
    }

    async fn load_content(&self, owner: &str, message_id: &str) -> VaultResult<Option<Bytes>> {
        let Some(record) = self.find(owner, message_id).await? else {
            debug!(owner, message_id, "no archived record to load");
            return Ok(None);
        };

        let storage = &record.storage;
        bounded(
            "blob get",
            self.config.store_timeout,
            self.blob_store.get(storage.namespace(), storage.blob_id()),
        )
        .await
    }

    async fn delete_everywhere(&self, owner: &str, message_id: &str) -> VaultResult<()> {
        for bucket in self.list_buckets(owner).await? {
            let retrieved = bounded(
                "retrieve record",
                self.config.store_timeout,
                self.metadata.retrieve(owner, &bucket, message_id),
            )
            .await?;
            let Some(record) = retrieved else {
                continue;
            };

            bounded(
                "remove record",
                self.config.store_timeout,
                self.metadata.remove(owner, &bucket, message_id),
            )
            .await?;
            self.delete_blob_best_effort(&record).await;

            debug!(owner, message_id, bucket = %bucket, "deleted archived message");
        }
        Ok(())
    }

    /// Most recent record of `message_id`, whichever bucket holds it.
    async fn find(&self, owner: &str, message_id: &str) -> VaultResult<Option<DeletedMessageWithStorage>> {
        for bucket in self.list_buckets(owner).await?.iter().rev() {
            let retrieved = bounded(
                "retrieve record",
                self.config.store_timeout,
                self.metadata.retrieve(owner, bucket, message_id),
            )
            .await?;
            if retrieved.is_some() {
                return Ok(retrieved);
            }
        }
        Ok(None)
    }

    /// Remove the content of a record whose metadata is already gone.
    /// Shared legacy blobs survive while another record still points at them.
    async fn delete_blob_best_effort(&self, record: &DeletedMessageWithStorage) {
        let storage = &record.storage;
        let result = match storage {
            StorageReference::Partitioned { .. } => self.delete_blob(storage).await,
            StorageReference::Legacy { blob_id } => {
                match bounded(
                    "count legacy references",
                    self.config.store_timeout,
                    self.metadata.legacy_reference_count(blob_id),
                )
                .await
                {
                    Ok(0) => self.delete_blob(storage).await,
                    Ok(_) => Ok(false),
                    Err(err) => Err(err),
                }
            }
        };

        if let Err(err) = result {
            warn!(
                owner = %record.message.owner,
                message_id = %record.message.message_id,
                error = %err,
                "failed to delete archived content, leaving it for garbage collection"
            );
        }
    }

    async fn delete_blob(&self, storage: &StorageReference) -> VaultResult<bool> {
        bounded(
            "blob delete",
            self.config.store_timeout,
            self.blob_store.delete(storage.namespace(), storage.blob_id()),
        )
        .await
    }

    async fn list_buckets(&self, owner: &str) -> VaultResult<Vec<BucketName>> {
        bounded(
            "list buckets",
            self.config.store_timeout,
            self.metadata.list_buckets(owner),
        )
        .await
    }

    async fn put_blob(&self, namespace: &str, blob_id: &BlobId, content: Bytes) -> VaultResult<()> {
        bounded(
            "blob put",
            self.config.store_timeout,
            self.blob_store.put(namespace, blob_id, content),
        )
        .await
    }

    async fn store_record(&self, record: &DeletedMessageWithStorage) -> VaultResult<()> {
        bounded(
            "store record",
            self.config.store_timeout,
            self.metadata.store(record),
        )
        .await
    }
}

async fn read_content<S>(content: S) -> io::Result<Bytes>
where
    S: Stream<Item = io::Result<Bytes>>,
{
    let buffer = content
        .try_fold(BytesMut::new(), |mut buffer, chunk| async move {
            buffer.extend_from_slice(&chunk);
            Ok(buffer)
        })
        .await?;
    Ok(buffer.freeze())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        clock::FixedClock,
        errors::VaultError,
        metrics::RecordingMetrics,
        models::Criterion,
        services::{blob_store::FileBlobStore, metadata_vault::tests::memory_vault},
    };
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use futures::stream;
    use std::{collections::HashSet, time::Duration};
    use tempfile::TempDir;

    pub(crate) fn content(bytes: &'static [u8]) -> impl Stream<Item = io::Result<Bytes>> + Send {
        stream::iter(vec![Ok(Bytes::from_static(bytes))])
    }

    pub(crate) fn message(owner: &str, id: &str, subject: &str) -> DeletedMessage {
        let date = Utc.with_ymd_and_hms(2024, 3, 10, 8, 0, 0).unwrap();
        DeletedMessage {
            owner: owner.into(),
            message_id: id.into(),
            origin_mailbox: "INBOX".into(),
            sender: Some("alice@example.com".into()),
            recipients: vec![owner.into()],
            subject: Some(subject.into()),
            size: 64,
            has_attachment: false,
            internal_date: date,
            deletion_date: date,
            delivery_date: date,
        }
    }

    struct Fixture {
        vault: DeletedMessageVault,
        blobs: Arc<FileBlobStore>,
        metadata: Arc<crate::services::metadata_vault::SqliteMetadataVault>,
        clock: Arc<FixedClock>,
        metrics: Arc<RecordingMetrics>,
        _temp: TempDir,
    }

    async fn fixture() -> Fixture {
        let temp = TempDir::new().unwrap();
        let blobs = Arc::new(FileBlobStore::new(temp.path().join("blobs")));
        let metadata = Arc::new(memory_vault().await);
        let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2024, 3, 15, 12, 0, 0).unwrap()));
        let metrics = Arc::new(RecordingMetrics::default());
        let vault = DeletedMessageVault::new(
            blobs.clone(),
            metadata.clone(),
            clock.clone(),
            metrics.clone(),
            VaultConfig::default(),
        );
        Fixture {
            vault,
            blobs,
            metadata,
            clock,
            metrics,
            _temp: temp,
        }
    }

    fn ids(messages: &[DeletedMessage]) -> HashSet<String> {
        messages.iter().map(|m| m.message_id.clone()).collect()
    }

    #[tokio::test]
    async fn append_files_content_under_current_bucket() {
        let f = fixture().await;
        let record = f
            .vault
            .append(message("bob", "m1", "hello"), content(b"raw message"))
            .await
            .unwrap();

        assert_eq!(record.bucket.as_str(), "deleted-messages-2024-03-01");
        match &record.storage {
            StorageReference::Partitioned { bucket, blob_id } => {
                assert_eq!(bucket, &record.bucket);
                assert!(blob_id.as_str().starts_with("2024/03/"));
            }
            other => panic!("expected a partitioned reference, got {other:?}"),
        }
        let stored = f
            .blobs
            .get(record.storage.namespace(), record.storage.blob_id())
            .await
            .unwrap();
        assert_eq!(stored.as_deref(), Some(&b"raw message"[..]));
    }

    #[tokio::test]
    async fn chunked_content_is_reassembled() {
        let f = fixture().await;
        let chunks = stream::iter(vec![
            Ok(Bytes::from_static(b"Subject: a\r\n")),
            Ok(Bytes::from_static(b"\r\n")),
            Ok(Bytes::from_static(b"body")),
        ]);
        f.vault.append(message("bob", "m1", "a"), chunks).await.unwrap();

        let loaded = f.vault.load_mime_message("bob", "m1").await.unwrap();
        assert_eq!(loaded.as_deref(), Some(&b"Subject: a\r\n\r\nbody"[..]));
    }

    #[tokio::test]
    async fn failing_content_stream_writes_nothing() {
        let f = fixture().await;
        let broken = stream::iter(vec![
            Ok(Bytes::from_static(b"partial")),
            Err(io::Error::other("connection reset")),
        ]);
        let err = f.vault.append(message("bob", "m1", "a"), broken).await.unwrap_err();

        assert!(matches!(err, VaultError::Io(_)));
        assert!(f.vault.search("bob", &Query::all()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn legacy_and_partitioned_records_coexist() {
        let f = fixture().await;
        f.vault
            .append_legacy(message("bob", "old", "legacy one"), content(b"legacy content"))
            .await
            .unwrap();
        f.vault
            .append(message("bob", "new", "fresh one"), content(b"new content"))
            .await
            .unwrap();

        let found = f.vault.search("bob", &Query::all()).await.unwrap();
        assert_eq!(ids(&found), HashSet::from(["old".to_string(), "new".to_string()]));

        let old = f.vault.load_mime_message("bob", "old").await.unwrap();
        let new = f.vault.load_mime_message("bob", "new").await.unwrap();
        assert_eq!(old.as_deref(), Some(&b"legacy content"[..]));
        assert_eq!(new.as_deref(), Some(&b"new content"[..]));
    }

    #[tokio::test]
    async fn search_filters_and_limits() {
        let f = fixture().await;
        for (id, subject) in [("1", "Invoice March"), ("2", "invoice april"), ("3", "Lunch")] {
            f.vault
                .append(message("bob", id, subject), content(b"x"))
                .await
                .unwrap();
        }
        f.vault
            .append(message("alice", "4", "Invoice May"), content(b"x"))
            .await
            .unwrap();

        let invoices = Query::all().with_criterion(Criterion::SubjectContains("INVOICE".into()));
        let found = f.vault.search("bob", &invoices).await.unwrap();
        assert_eq!(ids(&found), HashSet::from(["1".to_string(), "2".to_string()]));

        let limited = f.vault.search("bob", &invoices.clone().with_limit(1)).await.unwrap();
        assert_eq!(limited.len(), 1);
        assert!(ids(&found).is_superset(&ids(&limited)));

        let none = f.vault.search("bob", &Query::all().with_limit(0)).await.unwrap();
        assert!(none.is_empty());
        assert!(f.vault.search("carol", &Query::all()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn search_spans_buckets() {
        let f = fixture().await;
        f.vault.append(message("bob", "feb", "a"), content(b"x")).await.unwrap();
        f.clock.set(Utc.with_ymd_and_hms(2024, 4, 2, 0, 0, 0).unwrap());
        f.vault.append(message("bob", "apr", "b"), content(b"y")).await.unwrap();

        let found = f.vault.search("bob", &Query::all()).await.unwrap();
        assert_eq!(ids(&found), HashSet::from(["feb".to_string(), "apr".to_string()]));
        assert_eq!(f.metadata.list_buckets("bob").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn load_of_unknown_message_is_none() {
        let f = fixture().await;
        assert_eq!(f.vault.load_mime_message("bob", "nope").await.unwrap(), None);
    }

    #[tokio::test]
    async fn load_with_missing_blob_is_none() {
        let f = fixture().await;
        let record = f
            .vault
            .append(message("bob", "m1", "a"), content(b"x"))
            .await
            .unwrap();
        f.blobs.delete_namespace(record.bucket.as_str()).await.unwrap();

        assert_eq!(f.vault.load_mime_message("bob", "m1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let f = fixture().await;
        let record = f
            .vault
            .append(message("bob", "m1", "a"), content(b"x"))
            .await
            .unwrap();
        f.vault.append(message("bob", "m2", "b"), content(b"y")).await.unwrap();

        f.vault.delete("bob", "m1").await.unwrap();
        let after_first = f.vault.search("bob", &Query::all()).await.unwrap();
        f.vault.delete("bob", "m1").await.unwrap();
        let after_second = f.vault.search("bob", &Query::all()).await.unwrap();
        f.vault.delete("nobody", "m1").await.unwrap();

        assert_eq!(ids(&after_first), HashSet::from(["m2".to_string()]));
        assert_eq!(ids(&after_first), ids(&after_second));
        assert_eq!(f.vault.load_mime_message("bob", "m1").await.unwrap(), None);
        assert!(
            f.blobs
                .get(record.storage.namespace(), record.storage.blob_id())
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn shared_legacy_blob_outlives_one_of_its_records() {
        let f = fixture().await;
        f.vault
            .append_legacy(message("bob", "a", "same"), content(b"identical"))
            .await
            .unwrap();
        let second = f
            .vault
            .append_legacy(message("alice", "b", "same"), content(b"identical"))
            .await
            .unwrap();

        f.vault.delete("bob", "a").await.unwrap();
        let still_there = f.vault.load_mime_message("alice", "b").await.unwrap();
        assert_eq!(still_there.as_deref(), Some(&b"identical"[..]));

        f.vault.delete("alice", "b").await.unwrap();
        assert!(
            f.blobs
                .get(LEGACY_NAMESPACE, second.storage.blob_id())
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn metadata_failure_surfaces_and_keeps_the_blob() {
        let f = fixture().await;
        f.metadata.db.close().await;

        let err = f
            .vault
            .append(message("bob", "m1", "a"), content(b"orphan"))
            .await
            .unwrap_err();
        assert!(err.is_retryable());

        let namespace = "deleted-messages-2024-03-01";
        let mut dirs = tokio::fs::read_dir(f.blobs.base_path.join(namespace)).await.unwrap();
        assert!(dirs.next_entry().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn every_operation_is_timed() {
        let f = fixture().await;
        f.vault.append(message("bob", "m1", "a"), content(b"x")).await.unwrap();
        f.vault.append_legacy(message("bob", "m2", "b"), content(b"y")).await.unwrap();
        f.vault.search("bob", &Query::all()).await.unwrap();
        f.vault.load_mime_message("bob", "m1").await.unwrap();
        f.vault.delete("bob", "m1").await.unwrap();
        f.vault.delete("bob", "missing").await.unwrap();

        assert_eq!(f.metrics.samples(metrics::APPEND), 2);
        assert_eq!(f.metrics.samples(metrics::SEARCH), 1);
        assert_eq!(f.metrics.samples(metrics::LOAD_MIME_MESSAGE), 1);
        assert_eq!(f.metrics.samples(metrics::DELETE), 2);
    }

    struct StalledBlobStore;

    #[async_trait]
    impl BlobStore for StalledBlobStore {
        async fn put(&self, _: &str, _: &BlobId, _: Bytes) -> VaultResult<()> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        }

        async fn get(&self, _: &str, _: &BlobId) -> VaultResult<Option<Bytes>> {
            Ok(None)
        }

        async fn delete(&self, _: &str, _: &BlobId) -> VaultResult<bool> {
            Ok(false)
        }

        async fn delete_namespace(&self, _: &str) -> VaultResult<bool> {
            Ok(false)
        }
    }

    #[tokio::test]
    async fn slow_store_times_out() {
        let metadata = Arc::new(memory_vault().await);
        let vault = DeletedMessageVault::new(
            Arc::new(StalledBlobStore),
            metadata,
            Arc::new(FixedClock::new(Utc::now())),
            Arc::new(RecordingMetrics::default()),
            VaultConfig {
                store_timeout: Duration::from_millis(50),
                ..VaultConfig::default()
            },
        );

        let err = vault
            .append(message("bob", "m1", "a"), content(b"x"))
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::Timeout { operation: "blob put", .. }));
        assert!(err.is_retryable());
    }
}
