//! src/services/garbage_collection.rs
//!
//! Expiry of whole buckets. A run computes the beginning of the retention
//! period, lists every bucket known to the metadata vault, and deletes the
//! records and blobs of each bucket whose end time is not after that instant.
//! Deletion is idempotent, so a failed or cancelled run can simply be
//! started again.

use super::{
    blob_store::BlobStore,
    bounded,
    metadata_vault::MetadataVault,
    task::{AdditionalInformation, GarbageCollectionTaskDto, TASK_TYPE},
    vault::DeletedMessageVault,
};
use crate::{
    clock::Clock,
    config::VaultConfig,
    errors::{VaultError, VaultResult},
    metrics::{self, MetricsSink},
    models::{BlobId, BucketName, BucketNameGenerator, LEGACY_NAMESPACE, StorageReference},
};
use chrono::{DateTime, Utc};
use futures::{StreamExt, TryStreamExt, future, stream};
use serde::Serialize;
use std::{
    collections::BTreeSet,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum GcPhase {
    Idle,
    Scanning,
    Deleting,
    Completed,
    Cancelled,
    Failed,
}

/// Terminal status reported to the task framework.
#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum TaskStatus {
    Completed,
    Cancelled,
    Failed,
}

#[derive(Serialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    pub status: TaskStatus,
    pub additional_information: AdditionalInformation,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Live state of one garbage collection run, shared with whoever wants to
/// report on it while it progresses.
#[derive(Debug)]
pub struct GarbageCollectionRun {
    beginning_of_retention_period: DateTime<Utc>,
    phase: Mutex<GcPhase>,
    inspected_buckets: Mutex<BTreeSet<BucketName>>,
    deleted_buckets: Mutex<BTreeSet<BucketName>>,
    deleted_blob_count: AtomicU64,
    skipped_for_cancellation: AtomicBool,
    completed_at: Mutex<Option<DateTime<Utc>>>,
}

impl GarbageCollectionRun {
    fn new(beginning_of_retention_period: DateTime<Utc>) -> Self {
        Self {
            beginning_of_retention_period,
            phase: Mutex::new(GcPhase::Idle),
            inspected_buckets: Mutex::new(BTreeSet::new()),
            deleted_buckets: Mutex::new(BTreeSet::new()),
            deleted_blob_count: AtomicU64::new(0),
            skipped_for_cancellation: AtomicBool::new(false),
            completed_at: Mutex::new(None),
        }
    }

    pub fn beginning_of_retention_period(&self) -> DateTime<Utc> {
        self.beginning_of_retention_period
    }

    pub fn phase(&self) -> GcPhase {
        *lock(&self.phase)
    }

    pub fn inspected_buckets(&self) -> BTreeSet<BucketName> {
        lock(&self.inspected_buckets).clone()
    }

    pub fn deleted_buckets(&self) -> BTreeSet<BucketName> {
        lock(&self.deleted_buckets).clone()
    }

    pub fn deleted_blob_count(&self) -> u64 {
        self.deleted_blob_count.load(Ordering::SeqCst)
    }

    /// Snapshot for reporting; `now` stands in for the timestamp until the
    /// run has terminated.
    pub fn additional_information(&self, now: DateTime<Utc>) -> AdditionalInformation {
        AdditionalInformation::new(
            self.beginning_of_retention_period.into(),
            self.deleted_buckets()
                .into_iter()
                .map(|bucket| bucket.to_string())
                .collect(),
            self.deleted_blob_count(),
            lock(&self.completed_at).unwrap_or(now),
        )
    }

    fn set_phase(&self, phase: GcPhase) {
        *lock(&self.phase) = phase;
    }

    fn inspect(&self, bucket: &BucketName) {
        lock(&self.inspected_buckets).insert(bucket.clone());
    }

    fn record_deleted(&self, bucket: BucketName, blobs: u64) {
        self.deleted_blob_count.fetch_add(blobs, Ordering::SeqCst);
        lock(&self.deleted_buckets).insert(bucket);
    }

    fn finish(&self, phase: GcPhase, now: DateTime<Utc>) {
        self.set_phase(phase);
        *lock(&self.completed_at) = Some(now);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// The `deleted-messages-blob-store-based-garbage-collection` task.
#[derive(Clone)]
pub struct BlobStoreVaultGarbageCollectionTask {
    blob_store: Arc<dyn BlobStore>,
    metadata: Arc<dyn MetadataVault>,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn MetricsSink>,
    config: VaultConfig,
}

impl BlobStoreVaultGarbageCollectionTask {
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

    /// Rebuild a persisted task against the stores of `vault`.
    pub fn from_dto(_dto: &GarbageCollectionTaskDto, vault: &DeletedMessageVault) -> Self {
        vault.garbage_collection_task()
    }

    pub fn task_type(&self) -> &'static str {
        TASK_TYPE
    }

    pub fn to_dto(&self) -> GarbageCollectionTaskDto {
        GarbageCollectionTaskDto::default()
    }

    /// Fix the retention cutoff for a new run without executing it yet.
    pub fn start(&self) -> Arc<GarbageCollectionRun> {
        Arc::new(GarbageCollectionRun::new(
            self.clock.now() - self.config.retention,
        ))
    }

    /// Start and execute a run.
    pub async fn run(&self, cancel: &CancellationToken) -> TaskResult {
        let run = self.start();
        self.execute(&run, cancel).await
    }

    /// Delete every bucket that expired before the run's cutoff.
    ///
    /// Cancellation is checked before each bucket starts; buckets already
    /// being deleted finish. On failure the buckets deleted so far stay
    /// recorded in the result.
    pub async fn execute(&self, run: &GarbageCollectionRun, cancel: &CancellationToken) -> TaskResult {
        let cutoff = run.beginning_of_retention_period();
        info!(%cutoff, "starting deleted messages garbage collection");
        run.set_phase(GcPhase::Scanning);

        let expired = match self.expired_buckets(run, cutoff).await {
            Ok(expired) => expired,
            Err(err) => return self.fail(run, err.to_string()),
        };

        run.set_phase(GcPhase::Deleting);
        let deleted = stream::iter(expired)
            .map(|bucket| self.delete_unless_cancelled(bucket, run, cancel))
            .buffer_unordered(self.config.gc_parallelism.max(1))
            .try_for_each(|deleted| {
                if let Some((bucket, blobs)) = deleted {
                    self.metrics.increment(metrics::GC_DELETED_BUCKETS, 1);
                    self.metrics.increment(metrics::GC_DELETED_BLOBS, blobs);
                    run.record_deleted(bucket, blobs);
                }
                future::ready(Ok::<(), VaultError>(()))
            })
            .await;

        if let Err(err) = deleted {
            return self.fail(run, err.to_string());
        }

        let phase = if run.skipped_for_cancellation.load(Ordering::SeqCst) {
            GcPhase::Cancelled
        } else {
            GcPhase::Completed
        };
        let now = self.clock.now();
        run.finish(phase, now);

        let information = run.additional_information(now);
        info!(
            deleted_buckets = information.deleted_buckets.len(),
            deleted_blobs = information.deleted_blob_count,
            ?phase,
            "deleted messages garbage collection finished"
        );

        TaskResult {
            status: if phase == GcPhase::Cancelled {
                TaskStatus::Cancelled
            } else {
                TaskStatus::Completed
            },
            additional_information: information,
            error: None,
        }
    }

    async fn expired_buckets(
        &self,
        run: &GarbageCollectionRun,
        cutoff: DateTime<Utc>,
    ) -> VaultResult<Vec<BucketName>> {
        let buckets = bounded(
            "list related buckets",
            self.config.store_timeout,
            self.metadata.list_related_buckets(),
        )
        .await?;

        let expired = buckets
            .into_iter()
            .filter(|bucket| {
                run.inspect(bucket);
                match BucketNameGenerator.bucket_end_time(bucket) {
                    Some(end) => end <= cutoff,
                    None => {
                        warn!(%bucket, "skipping bucket with unrecognised name");
                        false
                    }
                }
            })
            .collect();
        Ok(expired)
    }

    async fn delete_unless_cancelled(
        &self,
        bucket: BucketName,
        run: &GarbageCollectionRun,
        cancel: &CancellationToken,
    ) -> VaultResult<Option<(BucketName, u64)>> {
        if cancel.is_cancelled() {
            run.skipped_for_cancellation.store(true, Ordering::SeqCst);
            return Ok(None);
        }
        let blobs = self.delete_bucket(&bucket).await?;
        Ok(Some((bucket, blobs)))
    }

    /// Drain the bucket's records, then drop its blob namespace, its records,
    /// and the legacy blobs no other record still points at.
    async fn delete_bucket(&self, bucket: &BucketName) -> VaultResult<u64> {
        let timeout = self.config.store_timeout;
        let mut in_namespace = 0u64;
        let mut elsewhere = Vec::new();
        let mut legacy = BTreeSet::new();

        let mut records = self.metadata.list_bucket_messages(bucket);
        while let Some(record) = bounded("list bucket messages", timeout, records.try_next()).await? {
            match record.storage {
                StorageReference::Partitioned {
                    bucket: ref storage_bucket,
                    ..
                } if storage_bucket == bucket => in_namespace += 1,
                StorageReference::Partitioned {
                    bucket: storage_bucket,
                    blob_id,
                } => elsewhere.push((storage_bucket, blob_id)),
                StorageReference::Legacy { blob_id } => {
                    legacy.insert(blob_id);
                }
            }
        }

        let namespace_removed = bounded(
            "delete blob namespace",
            timeout,
            self.blob_store.delete_namespace(bucket.as_str()),
        )
        .await?;

        // Records whose content went with the namespace. A namespace already
        // gone was counted by the run that removed it.
        let mut deleted = if namespace_removed { in_namespace } else { 0 };
        for (storage_bucket, blob_id) in elsewhere {
            if self.delete_blob(storage_bucket.as_str(), &blob_id).await? {
                deleted += 1;
            }
        }

        bounded(
            "remove bucket metadata",
            timeout,
            self.metadata.remove_metadata_related_to_bucket(bucket),
        )
        .await?;

        for blob_id in legacy {
            let references = bounded(
                "count legacy references",
                timeout,
                self.metadata.legacy_reference_count(&blob_id),
            )
            .await?;
            if references == 0 && self.delete_blob(LEGACY_NAMESPACE, &blob_id).await? {
                deleted += 1;
            }
        }

        debug!(%bucket, deleted_blobs = deleted, "deleted expired bucket");
        Ok(deleted)
    }

    async fn delete_blob(&self, namespace: &str, blob_id: &BlobId) -> VaultResult<bool> {
        bounded(
            "blob delete",
            self.config.store_timeout,
            self.blob_store.delete(namespace, blob_id),
        )
        .await
    }

    fn fail(&self, run: &GarbageCollectionRun, message: String) -> TaskResult {
        let now = self.clock.now();
        run.finish(GcPhase::Failed, now);
        error!(error = %message, "deleted messages garbage collection failed");
        TaskResult {
            status: TaskStatus::Failed,
            additional_information: run.additional_information(now),
            error: Some(message),
        }
    }
}

/// Run the task every `interval` until `cancel` fires.
pub async fn schedule(
    task: BlobStoreVaultGarbageCollectionTask,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let result = task.run(&cancel).await;
                debug!(status = ?result.status, "scheduled garbage collection done");
            }
        }
    }
    info!("garbage collection scheduler stopped");
}
