//! Durable storage for Conductor.
//!
//! A single SQLite database backs both the metrics store used by agent
//! scoring and the execution store used for progress polling and recovery.

pub mod store;

pub use store::SqliteStore;
