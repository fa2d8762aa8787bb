//! Job parameters and job instance identity.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A single job parameter value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobParameter {
    pub value: String,
    /// Identifying parameters take part in the job instance identity.
    #[serde(default = "default_identifying")]
    pub identifying: bool,
}

fn default_identifying() -> bool {
    true
}

/// Ordered parameter set handed to a job run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobParameters {
    entries: BTreeMap<String, JobParameter>,
}

impl JobParameters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an identifying parameter (builder style).
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value, true);
        self
    }

    /// Add a non-identifying parameter (builder style).
    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value, false);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>, identifying: bool) {
        self.entries.insert(
            key.into(),
            JobParameter {
                value: value.into(),
                identifying,
            },
        );
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(|p| p.value.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &JobParameter)> {
        self.entries.iter()
    }

    /// Identifying parameters in key order.
    pub fn identifying(&self) -> impl Iterator<Item = (&String, &JobParameter)> {
        self.entries.iter().filter(|(_, p)| p.identifying)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Parse a `key=value` pair as produced on a command line.
    pub fn parse_pair(pair: &str) -> Result<(String, String), String> {
        match pair.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() => {
                Ok((key.trim().to_string(), value.to_string()))
            }
            _ => Err(format!("expected key=value, got '{pair}'")),
        }
    }
}

/// Deterministic identity of a logical job instance.
///
/// Two runs with the same job name and the same identifying parameters share
/// an instance and therefore share restart history. Non-identifying
/// parameters never change the identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobInstanceId(String);

impl JobInstanceId {
    /// SHA-256 over the job name and the identifying parameters in key
    /// order, hex encoded. Every field is length-prefixed so that no two
    /// distinct parameter sets hash the same input.
    pub fn derive(job_name: &str, parameters: &JobParameters) -> Self {
        let mut hasher = Sha256::new();
        hash_field(&mut hasher, job_name);
        for (key, param) in parameters.identifying() {
            hash_field(&mut hasher, key);
            hash_field(&mut hasher, &param.value);
        }
        Self(format!("{:x}", hasher.finalize()))
    }

    /// Wrap an already-derived identity (e.g. read back from storage).
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex characters, for display.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

fn hash_field(hasher: &mut Sha256, field: &str) {
    hasher.update((field.len() as u64).to_le_bytes());
    hasher.update(field.as_bytes());
}

impl fmt::Display for JobInstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
