//! Storage-facing services: the blob store and metadata vault boundaries,
//! the vault engine on top of them, and the garbage collection task.

pub mod blob_store;
pub mod garbage_collection;
pub mod metadata_vault;
pub mod task;
pub mod vault;

use crate::errors::{VaultError, VaultResult};
use std::time::Duration;

/// Run one backing-store call under `limit`, turning expiry into a retryable
/// [`VaultError::Timeout`].
pub(crate) async fn bounded<F, T>(operation: &'static str, limit: Duration, fut: F) -> VaultResult<T>
where
    F: Future<Output = VaultResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(VaultError::Timeout {
            operation,
            after: limit,
        }),
    }
}
