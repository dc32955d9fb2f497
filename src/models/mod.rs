//! Core data models for the replication store.
//!
//! `Group` and `StoredObject` map onto the local backend's SQLite index,
//! `OdometerReading` onto the single odometer row. They serialize naturally
//! as JSON via `serde` for the command line.

pub mod group;
pub mod object;
pub mod odometer;
pub mod task;
