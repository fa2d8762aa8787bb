//! Shared domain types for batchflow.
//!
//! Statuses, exit signals, job parameters and identities, execution records,
//! flow events and engine configuration. Every other crate in the workspace
//! speaks in these types.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, sha2, thiserror.

pub mod config;
pub mod error;
pub mod event;
pub mod execution;
pub mod job;
pub mod status;
