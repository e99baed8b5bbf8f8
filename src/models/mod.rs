//! Core data models of the deleted message vault.
//!
//! Bucket and blob naming, the archived message record with its storage
//! reference, and search queries. Records serialize naturally as JSON via
//! `serde`; the SQLite row mapping lives next to the metadata vault.

pub mod blob_id;
pub mod bucket;
pub mod deleted_message;
pub mod query;

pub use blob_id::{BlobId, BlobIdGenerator};
pub use bucket::{BucketName, BucketNameGenerator};
pub use deleted_message::{DeletedMessage, DeletedMessageWithStorage, LEGACY_NAMESPACE, StorageReference};
pub use query::{Criterion, Query};
