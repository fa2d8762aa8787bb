//! Registered jobs and the runner that executes them.

pub mod definition;
pub mod runner;

pub use definition::{JobDefinition, JobReport};
pub use runner::{JobError, JobRunner, JobRunnerBuilder};
