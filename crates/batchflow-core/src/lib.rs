//! Flow-control engine for batch jobs.
//!
//! This crate defines the flow graph model, the executor that walks it and
//! the repository traits (ports) that the infrastructure layer implements.
//! It depends only on `batchflow-types`, never on `batchflow-infra` or any
//! database crate.

pub mod event;
pub mod flow;
pub mod job;
pub mod repository;

#[cfg(test)]
pub(crate) mod testing;
