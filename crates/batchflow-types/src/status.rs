//! Lifecycle statuses and exit signals.
//!
//! `BatchStatus` is the closed set of lifecycle states a job, node or split
//! branch can be in. `ExitStatus` is the free-form routing key a node hands
//! back to the engine; by convention its code starts out as the status name
//! but a step or transition may replace it with anything.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// BatchStatus
// ---------------------------------------------------------------------------

/// Coarse lifecycle classification of a job execution or a node outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    Starting,
    Started,
    Stopping,
    Stopped,
    Completed,
    Failed,
    Abandoned,
    Unknown,
}

impl BatchStatus {
    pub const ALL: [BatchStatus; 8] = [
        BatchStatus::Starting,
        BatchStatus::Started,
        BatchStatus::Stopping,
        BatchStatus::Stopped,
        BatchStatus::Completed,
        BatchStatus::Failed,
        BatchStatus::Abandoned,
        BatchStatus::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Starting => "STARTING",
            BatchStatus::Started => "STARTED",
            BatchStatus::Stopping => "STOPPING",
            BatchStatus::Stopped => "STOPPED",
            BatchStatus::Completed => "COMPLETED",
            BatchStatus::Failed => "FAILED",
            BatchStatus::Abandoned => "ABANDONED",
            BatchStatus::Unknown => "UNKNOWN",
        }
    }

    /// Severity rank. `COMPLETED` is the mildest outcome, `UNKNOWN` the worst.
    fn rank(&self) -> u8 {
        match self {
            BatchStatus::Completed => 0,
            BatchStatus::Starting => 1,
            BatchStatus::Started => 2,
            BatchStatus::Stopping => 3,
            BatchStatus::Stopped => 4,
            BatchStatus::Failed => 5,
            BatchStatus::Abandoned => 6,
            BatchStatus::Unknown => 7,
        }
    }

    /// Whether an execution in this status still holds the instance.
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            BatchStatus::Starting | BatchStatus::Started | BatchStatus::Stopping
        )
    }

    /// `FAILED` or anything more severe.
    pub fn is_unsuccessful(&self) -> bool {
        self.rank() >= BatchStatus::Failed.rank()
    }

    /// Whether a later attempt may pick the instance up again.
    pub fn is_restartable(&self) -> bool {
        matches!(self, BatchStatus::Failed | BatchStatus::Stopped)
    }

    /// Combine two statuses into the one that should be reported for both.
    ///
    /// Once either side has gone past `STARTED` the more severe status wins.
    /// Otherwise a `COMPLETED` side wins over a still-running one.
    pub fn upgrade_to(self, other: BatchStatus) -> BatchStatus {
        let past_started = |s: BatchStatus| s.rank() > BatchStatus::Started.rank();
        if past_started(self) || past_started(other) {
            return if self.rank() >= other.rank() { self } else { other };
        }
        if self == BatchStatus::Completed || other == BatchStatus::Completed {
            return BatchStatus::Completed;
        }
        if self.rank() >= other.rank() { self } else { other }
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BatchStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BatchStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown batch status: '{s}'"))
    }
}

// ---------------------------------------------------------------------------
// ExitStatus
// ---------------------------------------------------------------------------

/// Routing key produced when a node finishes.
///
/// Only `code` takes part in transition matching. Matching is case-sensitive
/// and codes are never normalized.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExitStatus {
    pub code: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

impl ExitStatus {
    pub const UNKNOWN: &'static str = "UNKNOWN";
    pub const EXECUTING: &'static str = "EXECUTING";
    pub const COMPLETED: &'static str = "COMPLETED";
    pub const NOOP: &'static str = "NOOP";
    pub const FAILED: &'static str = "FAILED";
    pub const STOPPED: &'static str = "STOPPED";

    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            description: String::new(),
        }
    }

    pub fn completed() -> Self {
        Self::new(Self::COMPLETED)
    }

    pub fn failed() -> Self {
        Self::new(Self::FAILED)
    }

    pub fn stopped() -> Self {
        Self::new(Self::STOPPED)
    }

    pub fn unknown() -> Self {
        Self::new(Self::UNKNOWN)
    }

    pub fn noop() -> Self {
        Self::new(Self::NOOP)
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Append to the existing description, separated by `"; "`.
    pub fn add_description(mut self, description: impl AsRef<str>) -> Self {
        let extra = description.as_ref();
        if extra.is_empty() {
            return self;
        }
        if self.description.is_empty() {
            self.description = extra.to_string();
        } else {
            self.description = format!("{}; {extra}", self.description);
        }
        self
    }

    /// Same description, different routing code.
    pub fn replace_code(mut self, code: impl Into<String>) -> Self {
        self.code = code.into();
        self
    }

    pub fn is_running(&self) -> bool {
        self.code == Self::EXECUTING || self.code == Self::UNKNOWN
    }

    pub fn is_failed(&self) -> bool {
        self.code == Self::FAILED
    }
}

impl From<BatchStatus> for ExitStatus {
    fn from(status: BatchStatus) -> Self {
        match status {
            BatchStatus::Starting | BatchStatus::Started | BatchStatus::Stopping => {
                ExitStatus::new(Self::EXECUTING)
            }
            other => ExitStatus::new(other.as_str()),
        }
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.description.is_empty() {
            f.write_str(&self.code)
        } else {
            write!(f, "{} ({})", self.code, self.description)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_status_display_and_parse() {
        for status in BatchStatus::ALL {
            let parsed: BatchStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("completed".parse::<BatchStatus>().is_err());
    }

    #[test]
    fn batch_status_serde_is_screaming_case() {
        let json = serde_json::to_string(&BatchStatus::Stopped).unwrap();
        assert_eq!(json, "\"STOPPED\"");
    }

    #[test]
    fn upgrade_prefers_more_severe_terminal_status() {
        assert_eq!(
            BatchStatus::Completed.upgrade_to(BatchStatus::Failed),
            BatchStatus::Failed
        );
        assert_eq!(
            BatchStatus::Stopped.upgrade_to(BatchStatus::Completed),
            BatchStatus::Stopped
        );
        assert_eq!(
            BatchStatus::Failed.upgrade_to(BatchStatus::Stopped),
            BatchStatus::Failed
        );
    }

    #[test]
    fn upgrade_completed_beats_running() {
        assert_eq!(
            BatchStatus::Started.upgrade_to(BatchStatus::Completed),
            BatchStatus::Completed
        );
        assert_eq!(
            BatchStatus::Starting.upgrade_to(BatchStatus::Started),
            BatchStatus::Started
        );
    }

    #[test]
    fn running_and_unsuccessful_helpers() {
        assert!(BatchStatus::Stopping.is_running());
        assert!(!BatchStatus::Stopped.is_running());
        assert!(BatchStatus::Abandoned.is_unsuccessful());
        assert!(!BatchStatus::Stopped.is_unsuccessful());
        assert!(BatchStatus::Stopped.is_restartable());
        assert!(!BatchStatus::Completed.is_restartable());
    }

    #[test]
    fn exit_status_from_batch_status() {
        assert_eq!(ExitStatus::from(BatchStatus::Completed).code, "COMPLETED");
        assert_eq!(ExitStatus::from(BatchStatus::Started).code, "EXECUTING");
        assert!(ExitStatus::from(BatchStatus::Starting).is_running());
    }

    #[test]
    fn exit_status_descriptions_accumulate() {
        let exit = ExitStatus::failed()
            .add_description("reader broke")
            .add_description("")
            .add_description("retry exhausted");
        assert_eq!(exit.description, "reader broke; retry exhausted");
        assert_eq!(exit.to_string(), "FAILED (reader broke; retry exhausted)");
    }

    #[test]
    fn replace_code_keeps_description() {
        let exit = ExitStatus::completed()
            .with_description("3 records skipped")
            .replace_code("COMPLETED WITH SKIPS");
        assert_eq!(exit.code, "COMPLETED WITH SKIPS");
        assert_eq!(exit.description, "3 records skipped");
    }
}
