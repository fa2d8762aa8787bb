//! Flow graphs and the engine that executes them.

pub mod checkpoint;
pub mod decider;
pub mod executor;
pub mod graph;
pub mod launcher;
pub mod restart;
pub mod split;
pub mod step;
pub mod transition;

pub use checkpoint::{CheckpointError, CheckpointManager};
pub use decider::{BoxDecider, Decider, DeciderRegistry};
pub use executor::{AttemptScope, Collaborators, ExecutorError, FlowExecutor, FlowStart, Traversal};
pub use graph::{FlowBuilder, FlowGraph, FlowNode, GraphError, NodeKind};
pub use launcher::{BoxJobLauncher, ContextParameterExtractor, JobLauncher, LaunchOutcome, ParameterExtractor};
pub use restart::{RestartError, StartPoint, resolve_start};
pub use split::aggregate;
pub use step::{BoxStep, Step, StepContext, StepRegistry, StepResult};
pub use transition::{NoMatch, Transition, TransitionAction, match_exit};
