//! src/services/blob_store.rs
//!
//! Raw content storage for archived messages. Blobs are grouped in
//! namespaces: one per bucket for time-partitioned content, plus the shared
//! legacy namespace. `FileBlobStore` keeps payloads on local disk sharded
//! beneath `base_path/{namespace}/{shard}/{shard}/{id}`.

use crate::errors::{VaultError, VaultResult};
use crate::models::BlobId;
use async_trait::async_trait;
use bytes::Bytes;
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::debug;
use uuid::Uuid;

const MAX_BLOB_ID_LEN: usize = 1024;
const NAMESPACE_MIN_LEN: usize = 3;
const NAMESPACE_MAX_LEN: usize = 63;

/// Byte-oriented blob storage addressed by `(namespace, id)`.
///
/// Reads of missing blobs return `None`; deletes of missing blobs or
/// namespaces succeed and report `false`.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, namespace: &str, id: &BlobId, content: Bytes) -> VaultResult<()>;

    async fn get(&self, namespace: &str, id: &BlobId) -> VaultResult<Option<Bytes>>;

    async fn delete(&self, namespace: &str, id: &BlobId) -> VaultResult<bool>;

    async fn delete_namespace(&self, namespace: &str) -> VaultResult<bool>;
}

#[derive(Clone, Debug)]
pub struct FileBlobStore {
    /// Base directory on disk where blobs are stored.
    pub base_path: PathBuf,
}

impl FileBlobStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    /// Reject ids that could escape the namespace directory.
    fn ensure_id_safe(namespace: &str, id: &BlobId) -> VaultResult<()> {
        let key = id.as_str();
        let invalid = key.is_empty()
            || key.len() > MAX_BLOB_ID_LEN
            || key.starts_with('/')
            || key.ends_with('/')
            || key.contains("..")
            || key.contains("//")
            || key
                .bytes()
                .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0');
        if invalid {
            return Err(invalid_reference(namespace, key));
        }
        Ok(())
    }

    /// Namespaces become directory names: lowercase letters, digits, dots
    /// and hyphens, 3 to 63 characters, no leading dot or hyphen.
    fn ensure_namespace_safe(namespace: &str) -> VaultResult<()> {
        let len = namespace.len();
        let invalid = !(NAMESPACE_MIN_LEN..=NAMESPACE_MAX_LEN).contains(&len)
            || !namespace
                .chars()
                .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '.' | '-'))
            || namespace.starts_with('.')
            || namespace.starts_with('-')
            || namespace.contains("..");
        if invalid {
            return Err(invalid_reference(namespace, ""));
        }
        Ok(())
    }

    fn namespace_root(&self, namespace: &str) -> PathBuf {
        self.base_path.join(namespace)
    }

    /// Two-level shard directories from MD5(namespace/id), keeping the
    /// number of entries per directory small.
    fn blob_shards(namespace: &str, id: &BlobId) -> (String, String) {
        let digest = md5::compute(format!("{}/{}", namespace, id));
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    fn blob_path(&self, namespace: &str, id: &BlobId) -> PathBuf {
        let (shard_a, shard_b) = Self::blob_shards(namespace, id);
        let mut path = self.namespace_root(namespace);
        path.push(shard_a);
        path.push(shard_b);
        path.push(id.as_str());
        path
    }

    async fn write_durably(tmp_path: &Path, content: &[u8]) -> io::Result<()> {
        let mut file = File::create(tmp_path).await?;
        file.write_all(content).await?;
        file.flush().await?;
        file.sync_all().await
    }

    /// Remove emptied directories from `start` up to, but excluding, `stop`.
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl BlobStore for FileBlobStore {
    /// Write to a temporary sibling, fsync, then rename into place so readers
    /// never observe a partial blob.
    async fn put(&self, namespace: &str, id: &BlobId, content: Bytes) -> VaultResult<()> {
        Self::ensure_namespace_safe(namespace)?;
        Self::ensure_id_safe(namespace, id)?;

        let file_path = self.blob_path(namespace, id);
        let parent = file_path
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| io::Error::other("blob path missing parent directory"))?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));

        if let Err(err) = Self::write_durably(&tmp_path, &content).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(VaultError::Io(err));
        }

        if let Err(err) = fs::rename(&tmp_path, &file_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(VaultError::Io(err));
        }

        debug!(namespace, blob_id = %id, size = content.len(), "stored blob");
        Ok(())
    }

    async fn get(&self, namespace: &str, id: &BlobId) -> VaultResult<Option<Bytes>> {
        Self::ensure_namespace_safe(namespace)?;
        Self::ensure_id_safe(namespace, id)?;

        match fs::read(self.blob_path(namespace, id)).await {
            Ok(bytes) => Ok(Some(Bytes::from(bytes))),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(VaultError::Io(err)),
        }
    }

    async fn delete(&self, namespace: &str, id: &BlobId) -> VaultResult<bool> {
        Self::ensure_namespace_safe(namespace)?;
        Self::ensure_id_safe(namespace, id)?;

        let file_path = self.blob_path(namespace, id);
        let removed = match fs::remove_file(&file_path).await {
            Ok(_) => {
                debug!("removed blob {}", file_path.display());
                true
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("blob {} already missing", file_path.display());
                false
            }
            Err(err) => return Err(VaultError::Io(err)),
        };

        if let Some(parent) = file_path.parent() {
            let root = self.namespace_root(namespace);
            self.prune_empty_dirs(parent, &root).await;
        }

        Ok(removed)
    }

    async fn delete_namespace(&self, namespace: &str) -> VaultResult<bool> {
        Self::ensure_namespace_safe(namespace)?;

        match fs::remove_dir_all(self.namespace_root(namespace)).await {
            Ok(_) => {
                debug!(namespace, "removed blob namespace");
                Ok(true)
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(VaultError::Io(err)),
        }
    }
}

fn invalid_reference(namespace: &str, id: &str) -> VaultError {
    VaultError::InvalidBlobReference {
        namespace: namespace.to_string(),
        id: id.to_string(),
    }
}
