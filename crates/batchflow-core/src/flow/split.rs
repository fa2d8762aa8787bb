//! Split coordination: run branch sub-graphs concurrently and join them.
//!
//! Every branch is traversed in its own task on a `JoinSet`. The split does
//! not finish until every branch has reached a terminal status; there is no
//! fail-fast. Branch outcomes are then folded into one aggregate exit signal
//! that the split node's own transitions route on.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use batchflow_types::execution::{ExecutionContext, FlowOutcome};
use batchflow_types::status::{BatchStatus, ExitStatus};
use futures_util::FutureExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::repository::ExecutionRepository;

use super::executor::{FlowExecutor, FlowStart, NodeRun, Traversal};
use super::graph::FlowGraph;

/// Aggregate status and exit of a joined split.
///
/// `FAILED` if any branch ended unsuccessfully, otherwise `COMPLETED`. A
/// branch that stopped does not change the aggregate; its outcome stays in
/// the per-branch detail.
pub fn aggregate(outcomes: &[FlowOutcome]) -> (BatchStatus, ExitStatus) {
    let failed: Vec<&str> = outcomes
        .iter()
        .filter(|o| o.status.is_unsuccessful())
        .map(|o| o.flow.as_str())
        .collect();
    if !failed.is_empty() {
        let exit = ExitStatus::failed().with_description(format!("failed branches: {}", failed.join(", ")));
        return (BatchStatus::Failed, exit);
    }

    (BatchStatus::Completed, ExitStatus::completed())
}

/// True if any branch of a joined split ended `STOPPED`.
pub(crate) fn any_stopped(outcomes: &[FlowOutcome]) -> bool {
    outcomes.iter().any(|o| o.status == BatchStatus::Stopped)
}

/// Run a split node.
///
/// `prior` carries the branch outcomes of an earlier attempt when the split
/// is being resumed: branches that completed are reused as they are and
/// everything else resumes at its own restart node.
pub(crate) async fn run_split<R: ExecutionRepository + 'static>(
    executor: &FlowExecutor<R>,
    split: &str,
    branches: &[Arc<FlowGraph>],
    context: &ExecutionContext,
    prior: Option<Vec<FlowOutcome>>,
) -> NodeRun {
    let limit = executor.config().max_parallel_branches;
    let permits = (limit > 0).then(|| Arc::new(Semaphore::new(limit)));
    let mut prior: HashMap<String, FlowOutcome> = prior
        .unwrap_or_default()
        .into_iter()
        .map(|o| (o.flow.clone(), o))
        .collect();

    let mut slots: Vec<Option<Traversal>> = branches.iter().map(|_| None).collect();
    let mut join_set = JoinSet::new();

    for (index, branch) in branches.iter().enumerate() {
        let previous = prior.remove(branch.name());
        if let Some(done) = previous.as_ref().filter(|o| o.status == BatchStatus::Completed) {
            tracing::debug!(split, branch = branch.name(), "reusing completed branch");
            slots[index] = Some(Traversal {
                outcome: done.clone(),
                context: context.clone(),
                updates: ExecutionContext::new(),
            });
            continue;
        }

        let start = match &previous {
            Some(previous) => FlowStart::resume(branch, previous),
            None => FlowStart::entry(branch),
        };
        let exec = executor.clone();
        let graph = Arc::clone(branch);
        let ctx = context.clone();
        let permits = permits.clone();

        join_set.spawn(async move {
            let _permit = match permits {
                Some(semaphore) => semaphore.acquire_owned().await.ok(),
                None => None,
            };
            let result = AssertUnwindSafe(exec.traverse(graph, start, ctx, None))
                .catch_unwind()
                .await;
            (index, result)
        });
    }

    let spawned = join_set.len();
    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok((index, Ok(Ok(traversal)))) => slots[index] = Some(traversal),
            Ok((index, Ok(Err(e)))) => {
                let name = branches[index].name();
                tracing::warn!(split, branch = name, error = %e, "branch traversal aborted");
                slots[index] = Some(failed_branch(name, context, e.to_string()));
            }
            Ok((index, Err(_))) => {
                let name = branches[index].name();
                tracing::warn!(split, branch = name, "branch panicked");
                slots[index] = Some(failed_branch(name, context, "branch panicked"));
            }
            Err(e) => {
                tracing::warn!(split, error = %e, "branch task did not complete");
            }
        }
    }

    let traversals: Vec<Traversal> = slots
        .into_iter()
        .zip(branches)
        .map(|(slot, branch)| {
            slot.unwrap_or_else(|| failed_branch(branch.name(), context, "branch task lost"))
        })
        .collect();

    let mut updates = ExecutionContext::new();
    for traversal in &traversals {
        updates.merge(&traversal.updates);
    }
    let outcomes: Vec<FlowOutcome> = traversals.into_iter().map(|t| t.outcome).collect();
    let (status, exit) = aggregate(&outcomes);

    tracing::debug!(
        split,
        branches = outcomes.len(),
        ran = spawned,
        status = %status,
        "split joined"
    );

    NodeRun {
        status,
        exit,
        updates,
        branches: Some(outcomes),
        failure: None,
    }
}

/// Outcome recorded for a branch that never produced one of its own. No
/// restart node, so a later attempt runs the branch from its entry.
fn failed_branch(flow: &str, context: &ExecutionContext, description: impl Into<String>) -> Traversal {
    Traversal {
        outcome: FlowOutcome {
            flow: flow.to_string(),
            status: BatchStatus::Failed,
            exit: ExitStatus::failed().with_description(description),
            completed_nodes: Vec::new(),
            last_node: None,
            last_exit: None,
            restart_node: None,
            failure: None,
            splits: Default::default(),
        },
        context: context.clone(),
        updates: ExecutionContext::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(flow: &str, status: BatchStatus) -> FlowOutcome {
        FlowOutcome {
            flow: flow.to_string(),
            status,
            exit: ExitStatus::from(status),
            completed_nodes: Vec::new(),
            last_node: None,
            last_exit: None,
            restart_node: None,
            failure: None,
            splits: Default::default(),
        }
    }

    #[test]
    fn all_completed_aggregates_completed() {
        let (status, exit) = aggregate(&[
            outcome("a", BatchStatus::Completed),
            outcome("b", BatchStatus::Completed),
        ]);
        assert_eq!(status, BatchStatus::Completed);
        assert_eq!(exit.code, ExitStatus::COMPLETED);
    }

    #[test]
    fn any_failure_wins_and_is_named() {
        let (status, exit) = aggregate(&[
            outcome("a", BatchStatus::Completed),
            outcome("b", BatchStatus::Failed),
            outcome("c", BatchStatus::Stopped),
        ]);
        assert_eq!(status, BatchStatus::Failed);
        assert_eq!(exit.code, ExitStatus::FAILED);
        assert!(exit.description.contains('b'));
    }

    #[test]
    fn stopped_branch_without_failure_aggregates_completed() {
        let outcomes = [
            outcome("a", BatchStatus::Completed),
            outcome("b", BatchStatus::Stopped),
        ];
        let (status, exit) = aggregate(&outcomes);
        assert_eq!(status, BatchStatus::Completed);
        assert_eq!(exit.code, ExitStatus::COMPLETED);
        assert!(any_stopped(&outcomes));
        assert!(!any_stopped(&outcomes[..1]));
    }

    #[test]
    fn abandoned_branch_counts_as_failed() {
        let (status, _) = aggregate(&[outcome("a", BatchStatus::Abandoned)]);
        assert_eq!(status, BatchStatus::Failed);
    }

    #[test]
    fn no_branches_is_completed() {
        let (status, _) = aggregate(&[]);
        assert_eq!(status, BatchStatus::Completed);
    }
}
