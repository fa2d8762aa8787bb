//! Infrastructure layer for batchflow.
//!
//! Contains implementations of the repository traits defined in
//! `batchflow-core` (SQLite execution history) plus configuration loading
//! and data directory resolution.

pub mod config;
pub mod filesystem;
pub mod sqlite;
