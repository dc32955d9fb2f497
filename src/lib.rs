//! Replication of repository objects as archival packages.
//!
//! Objects are packed into bags ([`pack`]), shipped to an object store
//! through the [`services::ReplicaManager`], audited, and restored from
//! deletion catalogs by the curation [`tasks`].

pub mod config;
pub mod content;
pub mod db;
pub mod errors;
pub mod models;
pub mod pack;
pub mod services;
pub mod tasks;

pub use errors::{ReplicaError, ReplicaResult};
