//! Typed error taxonomy for the orchestrator boundary: one `thiserror::Error`
//! enum per concern (planning, execution, QA, composition), collapsed into a
//! single top-level `BlackboardError` via `#[from]`.

use thiserror::Error;

/// Base error type covering programming errors not fitting a more specific kind.
#[derive(Debug, Error)]
pub enum BlackboardError {
    #[error(transparent)]
    Planning(#[from] PlanningError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error(transparent)]
    Qa(#[from] QaError),

    #[error(transparent)]
    Composition(#[from] CompositionError),

    #[error("memory store error: {0}")]
    Memory(String),

    #[error("{0}")]
    Other(String),
}

/// Planner LLM failed or returned unparseable JSON and no replay candidate exists.
#[derive(Debug, Error)]
pub enum PlanningError {
    #[error("planner LLM call failed: {0}")]
    LlmFailed(String),

    #[error("planner returned unparseable JSON and no replay candidate exists")]
    Unparseable,

    #[error("plan has no nodes after compilation and repair")]
    EmptyPlan,
}

/// Solver failed twice for the same node, or the token budget was exhausted mid-run.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("node '{0}' failed twice and was bypassed")]
    NodeFailed(String),

    #[error("solve call timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("token budget exhausted: used {used} of {max} ({scope})")]
    BudgetExhausted {
        used: u64,
        max: u64,
        scope: &'static str,
    },
}

/// Reserved for unrecoverable contract violations.
///
/// In practice the executor turns repeated QA failures into a
/// `needs_more_depth` artifact rather than raising; this variant exists for
/// completeness of the taxonomy.
#[derive(Debug, Error)]
pub enum QaError {
    #[error("contract violated irrecoverably for node '{0}': {1}")]
    Irrecoverable(String, String),
}

/// The composer received no artifacts at all.
#[derive(Debug, Error)]
pub enum CompositionError {
    #[error("composer received zero artifacts for a plan of {0} node(s)")]
    NoArtifacts(usize),
}

pub type Result<T> = std::result::Result<T, BlackboardError>;
