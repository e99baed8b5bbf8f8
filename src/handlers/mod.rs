//! HTTP handlers and the state they share.

pub mod health_handlers;
pub mod task_handlers;
pub mod vault_handlers;

use crate::services::vault::DeletedMessageVault;
use sqlx::SqlitePool;
use std::{path::PathBuf, sync::Arc};
use tokio_util::sync::CancellationToken;

/// State handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub vault: DeletedMessageVault,

    /// Pool behind the metadata vault, probed by `/readyz`.
    pub db: Arc<SqlitePool>,

    /// Root of the blob store, probed by `/readyz`.
    pub storage_dir: PathBuf,

    /// Fired on shutdown; garbage collection started over HTTP stops with it.
    pub shutdown: CancellationToken,
}
