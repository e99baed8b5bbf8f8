//! Retention-managed archive of soft-deleted mail messages.
//!
//! Messages land in monthly buckets; the garbage collector drops whole
//! buckets once they fall out of the retention window.

pub mod clock;
pub mod config;
pub mod errors;
pub mod handlers;
pub mod metrics;
pub mod models;
pub mod routes;
pub mod services;
