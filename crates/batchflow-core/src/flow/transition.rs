//! Transition matching: exit-code patterns, specificity ordering and lookup.
//!
//! Patterns support exactly two wildcards: `*` (zero or more characters) and
//! `?` (exactly one character). Every other character is literal. A pattern
//! must match the whole exit code and matching is case-sensitive.
//!
//! Transition tables are sorted once, when the graph is built, so that the
//! most specific pattern is tried first. Lookup then returns the first
//! structural match, which makes the result independent of the order the
//! transitions were declared in.

use std::cmp::Ordering;

use batchflow_types::status::BatchStatus;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Transition
// ---------------------------------------------------------------------------

/// What happens when a transition is selected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum TransitionAction {
    /// Move on to another node of the same graph.
    Continue { target: String },
    /// Seal the flow `COMPLETED`.
    End,
    /// Seal the flow `FAILED`; a restart re-runs the node that produced the exit.
    Fail,
    /// Seal the flow `STOPPED`; a restart begins at `restart`.
    Stop { restart: String },
}

/// Rule mapping an exit-code pattern to the next node or a terminal action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub pattern: String,
    #[serde(flatten)]
    pub action: TransitionAction,
    /// Replaces the exit code the flow is sealed with (terminal actions only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<String>,
    /// Replaces the status the flow is sealed with (terminal actions only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<BatchStatus>,
}

impl Transition {
    fn with_action(pattern: impl Into<String>, action: TransitionAction) -> Self {
        Self {
            pattern: pattern.into(),
            action,
            exit_code: None,
            status: None,
        }
    }

    pub fn to(pattern: impl Into<String>, target: impl Into<String>) -> Self {
        Self::with_action(
            pattern,
            TransitionAction::Continue {
                target: target.into(),
            },
        )
    }

    pub fn end(pattern: impl Into<String>) -> Self {
        Self::with_action(pattern, TransitionAction::End)
    }

    pub fn fail(pattern: impl Into<String>) -> Self {
        Self::with_action(pattern, TransitionAction::Fail)
    }

    pub fn stop(pattern: impl Into<String>, restart: impl Into<String>) -> Self {
        Self::with_action(
            pattern,
            TransitionAction::Stop {
                restart: restart.into(),
            },
        )
    }

    pub fn with_exit_code(mut self, code: impl Into<String>) -> Self {
        self.exit_code = Some(code.into());
        self
    }

    pub fn with_status(mut self, status: BatchStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn matches(&self, exit_code: &str) -> bool {
        pattern_matches(&self.pattern, exit_code)
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self.action, TransitionAction::Continue { .. })
    }

    /// The node id this transition refers to, if any.
    pub fn referenced_node(&self) -> Option<&str> {
        match &self.action {
            TransitionAction::Continue { target } => Some(target),
            TransitionAction::Stop { restart } => Some(restart),
            TransitionAction::End | TransitionAction::Fail => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Pattern matching
// ---------------------------------------------------------------------------

/// Anchored glob match supporting `*` and `?`.
///
/// Iterative: on a mismatch the most recent `*` absorbs one more character
/// and matching resumes after it, so the cost is bounded by
/// `pattern.len() * text.len()`.
pub fn pattern_matches(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();

    let (mut pi, mut ti) = (0, 0);
    // Position after the last `*` seen, and the text index it was tried at.
    let mut star: Option<(usize, usize)> = None;

    while ti < text.len() {
        match pattern.get(pi) {
            Some('*') => {
                pi += 1;
                star = Some((pi, ti));
            }
            Some(&c) if c == '?' || c == text[ti] => {
                pi += 1;
                ti += 1;
            }
            _ => match star {
                Some((after_star, tried)) => {
                    pi = after_star;
                    ti = tried + 1;
                    star = Some((after_star, ti));
                }
                None => return false,
            },
        }
    }

    pattern[pi..].iter().all(|&c| c == '*')
}

// ---------------------------------------------------------------------------
// Specificity
// ---------------------------------------------------------------------------

/// Sort key describing how specific a pattern is.
///
/// `Ord` is defined so that the most specific pattern sorts first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Specificity {
    literals: usize,
    stars: usize,
    questions: usize,
    literal_prefix: usize,
    pattern: String,
}

impl Specificity {
    pub fn of(pattern: &str) -> Self {
        let mut literals = 0;
        let mut stars = 0;
        let mut questions = 0;
        for c in pattern.chars() {
            match c {
                '*' => stars += 1,
                '?' => questions += 1,
                _ => literals += 1,
            }
        }
        let literal_prefix = pattern.chars().take_while(|c| *c != '*' && *c != '?').count();
        Self {
            literals,
            stars,
            questions,
            literal_prefix,
            pattern: pattern.to_string(),
        }
    }

    pub fn is_literal(&self) -> bool {
        self.stars == 0 && self.questions == 0
    }
}

impl Ord for Specificity {
    fn cmp(&self, other: &Self) -> Ordering {
        // Literal patterns first, then more literal characters, fewer `*`,
        // fewer `?`, longer literal prefix. The pattern text breaks any
        // remaining tie so the order is total.
        other
            .is_literal()
            .cmp(&self.is_literal())
            .then_with(|| other.literals.cmp(&self.literals))
            .then_with(|| self.stars.cmp(&other.stars))
            .then_with(|| self.questions.cmp(&other.questions))
            .then_with(|| other.literal_prefix.cmp(&self.literal_prefix))
            .then_with(|| self.pattern.cmp(&other.pattern))
    }
}

impl PartialOrd for Specificity {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Sort a transition table from most to least specific pattern.
pub fn sort_by_specificity(transitions: &mut [Transition]) {
    transitions.sort_by_cached_key(|t| Specificity::of(&t.pattern));
}

// ---------------------------------------------------------------------------
// Lookup
// ---------------------------------------------------------------------------

/// No transition in the table matched the exit code.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("no transition matches exit code '{exit_code}'")]
pub struct NoMatch {
    pub exit_code: String,
}

/// Return the first transition (in table order) whose pattern matches.
///
/// The table is expected to be sorted with [`sort_by_specificity`]; the
/// graph builder guarantees that for every node it produces.
pub fn match_exit<'a>(exit_code: &str, transitions: &'a [Transition]) -> Result<&'a Transition, NoMatch> {
    transitions
        .iter()
        .find(|t| t.matches(exit_code))
        .ok_or_else(|| NoMatch {
            exit_code: exit_code.to_string(),
        })
}
