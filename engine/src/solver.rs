//! The two contracts the core depends on but never implements: a black-box
//! solver and a planner LLM. Both are narrow `#[async_trait]`s rather than a
//! concrete backend type, so the rest of the crate never needs to know what
//! actually answers a prompt.

use crate::error::Result;
use crate::types::{SolveContext, SolverResult};
use async_trait::async_trait;
use std::time::Duration;

/// A black-box generative backend. Implementations must return a
/// distinguishable timeout error so the executor's retry/bypass logic can
/// recognize it.
#[async_trait]
pub trait Solver: Send + Sync {
    async fn solve(&self, task: &str, context: &SolveContext) -> Result<SolverResult>;
}

/// The planner's own LLM contract: a single deterministic-at-zero-temperature
/// completion call.
#[async_trait]
pub trait PlannerLlm: Send + Sync {
    async fn complete(&self, prompt: &str, temperature: f64, timeout: Duration) -> Result<String>;
}

/// Deterministic solver used for `--mock` and tests: emits a markdown section
/// named after the contract and echoes the task, grounded on the original
/// `EchoSolver`.
pub struct EchoSolver;

#[async_trait]
impl Solver for EchoSolver {
    async fn solve(&self, task: &str, context: &SolveContext) -> Result<SolverResult> {
        let section = context
            .get("node")
            .map(|s| s.as_str())
            .unwrap_or("Answer");
        let text = format!("## {section}\n\n{task}\n");
        Ok(SolverResult {
            total_tokens: Some((text.len() as u64 / 4).max(1)),
            ..SolverResult::text_only(text)
        })
    }
}

/// Deterministic planner LLM used for `--mock`: always proposes the same
/// three-node plan, grounded on the original `PromptLLM`.
pub struct TemplatePlannerLlm;

#[async_trait]
impl PlannerLlm for TemplatePlannerLlm {
    async fn complete(&self, _prompt: &str, _temperature: f64, _timeout: Duration) -> Result<String> {
        Ok(r#"{"nodes":[
            {"name":"analysis","tmpl":"GENERIC","deps":[],"role":"backbone","contract":{"format":{"markdown_section":"Analysis"},"tests":[{"kind":"nonempty","arg":""},{"kind":"header_present","arg":"Analysis"},{"kind":"word_count_min","arg":60}]}},
            {"name":"answer","tmpl":"GENERIC","deps":["analysis"],"role":"backbone","contract":{"format":{"markdown_section":"Answer"},"tests":[{"kind":"nonempty","arg":""},{"kind":"header_present","arg":"Answer"},{"kind":"word_count_min","arg":80}]}},
            {"name":"examples","tmpl":"GENERIC","deps":["answer"],"role":"adjunct","contract":{"format":{"markdown_section":"Examples"},"tests":[{"kind":"nonempty","arg":""},{"kind":"header_present","arg":"Examples"}]}}
        ]}"#.to_string())
    }
}
