//! Hedged concurrent execution of a [`Plan`] under quality contracts: the
//! six-state improvement loop, the DAG scheduler with retry-then-bypass
//! failure handling, the homeostat that nudges `max_rounds` from sampled
//! failure/quality signals, and the stability check that tightens
//! concurrency and the acceptance floor between passes.

use crate::config::Config;
use crate::error::{BlackboardError, ExecutionError, Result};
use crate::judges::{run_judges, JudgeRegistry};
use crate::memory::MemoryStore;
use crate::solver::Solver;
use crate::types::{
    Artifact, ArtifactStatus, Contract, Node, NodeRole, Patch, PatchKind, Plan, QaResult,
    SolveContext, SolverResult,
};
use crate::util::{apply_patches, approx_tokens, fmt, run_tests, GlobalRateLimiter};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// Per-run token accounting shared across every node task.
pub struct RunTokens {
    used: AtomicU64,
    max: u64,
}

impl RunTokens {
    pub fn new(max: u64) -> Self {
        RunTokens {
            used: AtomicU64::new(0),
            max,
        }
    }

    pub fn used(&self) -> u64 {
        self.used.load(Ordering::Relaxed)
    }

    pub fn max(&self) -> u64 {
        self.max
    }

    fn try_spend(&self, n: u64) -> Result<()> {
        let new = self.used.fetch_add(n, Ordering::Relaxed) + n;
        if new > self.max {
            Err(BlackboardError::Execution(ExecutionError::BudgetExhausted {
                used: new,
                max: self.max,
                scope: "run",
            }))
        } else {
            Ok(())
        }
    }
}

/// Samples recent node outcomes once a second and nudges `max_rounds`: more
/// than 2 failures among the last 5 outcomes pushes it up (capped at 5);
/// average quality above 0.9 across at least 3 recent artifacts eases it
/// back down (floor 1).
pub struct Homeostat {
    max_rounds: AtomicU32,
    failures: tokio::sync::Mutex<std::collections::VecDeque<bool>>,
    scores: tokio::sync::Mutex<std::collections::VecDeque<f64>>,
}

const HOMEOSTAT_FAILURE_WINDOW: usize = 5;
const HOMEOSTAT_SCORE_WINDOW: usize = 10;
const HOMEOSTAT_MAX_ROUNDS_CAP: u32 = 5;
const HOMEOSTAT_MAX_ROUNDS_FLOOR: u32 = 1;

impl Homeostat {
    pub fn new(initial: u32) -> Arc<Self> {
        Arc::new(Homeostat {
            max_rounds: AtomicU32::new(initial.max(HOMEOSTAT_MAX_ROUNDS_FLOOR)),
            failures: tokio::sync::Mutex::new(std::collections::VecDeque::new()),
            scores: tokio::sync::Mutex::new(std::collections::VecDeque::new()),
        })
    }

    pub fn current_max_rounds(&self) -> u32 {
        self.max_rounds.load(Ordering::Relaxed)
    }

    async fn record(&self, failed: bool, score: Option<f64>) {
        {
            let mut f = self.failures.lock().await;
            f.push_back(failed);
            while f.len() > HOMEOSTAT_FAILURE_WINDOW {
                f.pop_front();
            }
        }
        if let Some(s) = score {
            let mut sc = self.scores.lock().await;
            sc.push_back(s);
            while sc.len() > HOMEOSTAT_SCORE_WINDOW {
                sc.pop_front();
            }
        }
    }

    async fn tick(&self) {
        let failure_count = self.failures.lock().await.iter().filter(|f| **f).count();
        if failure_count > 2 {
            let cur = self.max_rounds.load(Ordering::Relaxed);
            self.max_rounds
                .store((cur + 1).min(HOMEOSTAT_MAX_ROUNDS_CAP), Ordering::Relaxed);
            return;
        }
        let scores = self.scores.lock().await;
        if scores.len() >= 3 {
            let avg = scores.iter().sum::<f64>() / scores.len() as f64;
            if avg > 0.9 {
                let cur = self.max_rounds.load(Ordering::Relaxed);
                self.max_rounds
                    .store(cur.saturating_sub(1).max(HOMEOSTAT_MAX_ROUNDS_FLOOR), Ordering::Relaxed);
            }
        }
    }

    /// Spawns the 1 Hz sampling loop. The caller aborts the handle once the
    /// run completes; the task carries no state that needs graceful teardown.
    fn spawn_sampler(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let homeostat = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            loop {
                ticker.tick().await;
                homeostat.tick().await;
            }
        })
    }
}

/// Tracks predicted quality (a blend of a 5-sample moving average and an
/// exponentially smoothed score history) and tightens concurrency/min_score
/// whenever the Lyapunov-style energy `E` fails to decrease between checks.
struct StabilityTracker {
    recent: Vec<f64>,
    ema: f64,
    prev_e: Option<f64>,
}

impl StabilityTracker {
    fn new() -> Self {
        StabilityTracker {
            recent: Vec::new(),
            ema: 0.7,
            prev_e: None,
        }
    }

    fn record(&mut self, score: f64) {
        self.recent.push(score);
        if self.recent.len() > 5 {
            self.recent.remove(0);
        }
        self.ema = 0.3 * score + 0.7 * self.ema;
    }

    fn predicted_quality(&self) -> f64 {
        if self.recent.is_empty() {
            return self.ema;
        }
        let ma = self.recent.iter().sum::<f64>() / self.recent.len() as f64;
        0.5 * ma + 0.5 * self.ema
    }

    /// Returns the (possibly tightened) concurrency and min_score for the
    /// next pass.
    fn check(&mut self, pending_tokens: u64, max_tokens: u64, concurrency: usize, min_score: f64) -> (usize, f64) {
        let e = (pending_tokens as f64 / max_tokens.max(1) as f64) + (1.0 - self.predicted_quality());
        let tightened = matches!(self.prev_e, Some(prev) if e >= prev);
        self.prev_e = Some(e);
        if tightened {
            (concurrency.saturating_sub(1).max(1), (min_score + 0.02).min(0.95))
        } else {
            (concurrency, min_score)
        }
    }
}

#[derive(Clone)]
struct ExecCtx {
    solver: Arc<dyn Solver>,
    judges: Arc<JudgeRegistry>,
    memory: Arc<MemoryStore>,
    limiter: Arc<GlobalRateLimiter>,
    config: Config,
    query: String,
    run_tokens: Arc<RunTokens>,
    homeostat: Arc<Homeostat>,
    min_score: f64,
}

async fn call_solver(ctx: &ExecCtx, prompt: &str, mode: &str, node_name: &str) -> Result<SolverResult> {
    let mut context = SolveContext::new();
    context.insert("node".to_string(), node_name.to_string());
    context.insert("mode".to_string(), mode.to_string());
    let _slot = ctx.limiter.slot().await;
    match tokio::time::timeout(ctx.config.node_timeout, ctx.solver.solve(prompt, &context)).await {
        Ok(r) => r,
        Err(_) => Err(BlackboardError::Execution(ExecutionError::Timeout(ctx.config.node_timeout))),
    }
}

/// Issues the call immediately, and — when hedging is enabled — a duplicate
/// call after `hedge_delay`, returning whichever completes first and
/// dropping the other. Spends tokens against both the per-node and per-run
/// budgets before and after the call.
async fn hedged_solve(ctx: &ExecCtx, prompt: &str, node: &Node, node_used: &mut u64) -> Result<SolverResult> {
    let prompt_tokens = approx_tokens(prompt);
    if *node_used + prompt_tokens > ctx.config.max_tokens_per_node {
        return Err(BlackboardError::Execution(ExecutionError::BudgetExhausted {
            used: *node_used + prompt_tokens,
            max: ctx.config.max_tokens_per_node,
            scope: "node",
        }));
    }
    ctx.run_tokens.try_spend(prompt_tokens)?;
    *node_used += prompt_tokens;

    let mode = crate::types::solve_mode::NODE;
    let result = if !ctx.config.hedge_enable {
        call_solver(ctx, prompt, mode, &node.name).await?
    } else {
        let timeout = ctx.config.node_timeout;
        let fut_a = {
            let ctx = ctx.clone();
            let prompt = prompt.to_string();
            let name = node.name.clone();
            async move { tokio::time::timeout(timeout, ctx.solver.solve(&prompt, &mode_ctx(&name, mode))).await }
        };
        let fut_b = {
            let ctx = ctx.clone();
            let prompt = prompt.to_string();
            let name = node.name.clone();
            let delay = ctx.config.hedge_delay;
            async move {
                tokio::time::sleep(delay).await;
                tokio::time::timeout(timeout, ctx.solver.solve(&prompt, &mode_ctx(&name, mode))).await
            }
        };
        tokio::pin!(fut_a);
        tokio::pin!(fut_b);
        let outcome: std::result::Result<SolverResult, BlackboardError> = tokio::select! {
            a = &mut fut_a => match a {
                Ok(inner) => inner,
                Err(_) => Err(BlackboardError::Execution(ExecutionError::Timeout(timeout))),
            },
            b = &mut fut_b => match b {
                Ok(inner) => inner,
                Err(_) => Err(BlackboardError::Execution(ExecutionError::Timeout(timeout))),
            },
        };
        outcome?
    };

    let completion_tokens = result.total_tokens.unwrap_or_else(|| approx_tokens(&result.text));
    if *node_used + completion_tokens > ctx.config.max_tokens_per_node {
        return Err(BlackboardError::Execution(ExecutionError::BudgetExhausted {
            used: *node_used + completion_tokens,
            max: ctx.config.max_tokens_per_node,
            scope: "node",
        }));
    }
    ctx.run_tokens.try_spend(completion_tokens)?;
    *node_used += completion_tokens;
    Ok(result)
}

fn mode_ctx(node_name: &str, mode: &str) -> SolveContext {
    let mut ctx = SolveContext::new();
    ctx.insert("node".to_string(), node_name.to_string());
    ctx.insert("mode".to_string(), mode.to_string());
    ctx
}

const NODE_PROMPT: &str = "Write the \"{section}\" section for the following task.\n\n\
Query:\n{q}\n\n{deps}{guidance}Respond in markdown starting with a \"## {section}\" heading.\n";

fn extract_dep_preview(content: &str, dep: &str) -> String {
    let marker = format!("### {dep}");
    if let Some(idx) = content.to_lowercase().find(&marker.to_lowercase()) {
        let rest = &content[idx + marker.len()..];
        let end = rest.find("\n#").unwrap_or(rest.len());
        return rest[..end].trim().to_string();
    }
    let trimmed = content.trim();
    let mut end = trimmed.len().min(120);
    while end > 0 && !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    if trimmed.len() > end {
        format!("{}…", &trimmed[..end])
    } else {
        trimmed[..end].to_string()
    }
}

fn dependency_bullets(node: &Node, blackboard: &HashMap<String, Artifact>) -> String {
    let mut out = String::new();
    for dep in &node.deps {
        let Some(artifact) = blackboard.get(dep) else {
            continue;
        };
        out.push_str(&format!("- **{dep}**: {}\n", extract_dep_preview(&artifact.content, dep)));
    }
    out
}

fn build_prompt(node: &Node, blackboard: &HashMap<String, Artifact>, query: &str, guidance: Option<&str>) -> String {
    if let Some(p) = &node.prompt_override {
        return p.clone();
    }
    let section = node.contract.markdown_section().unwrap_or(&node.name).to_string();
    let deps = dependency_bullets(node, blackboard);
    let deps_block = if deps.is_empty() { String::new() } else { format!("Dependencies:\n{deps}\n") };
    let guidance_block = guidance
        .map(|g| format!("Iterative Constraints:\n{g}\n\n"))
        .unwrap_or_default();

    let mut kwargs = HashMap::new();
    kwargs.insert("section", section);
    kwargs.insert("q", query.to_string());
    kwargs.insert("deps", deps_block);
    kwargs.insert("guidance", guidance_block);
    fmt(NODE_PROMPT, &kwargs)
}

fn issue_hint(i: &crate::types::Issue) -> String {
    match i.code.as_str() {
        "header_missing" => format!(
            "Add the header '{}'.",
            i.details.get("wanted").cloned().unwrap_or_default()
        ),
        "too_short" => format!(
            "Expand to at least {} words (currently {}).",
            i.details.get("needed").cloned().unwrap_or_default(),
            i.details.get("have").cloned().unwrap_or_default()
        ),
        "contains_missing" => format!(
            "Must mention '{}'.",
            i.details.get("needle").cloned().unwrap_or_default()
        ),
        "regex_fail" => format!(
            "Must match the pattern: {}",
            i.details.get("pattern").cloned().unwrap_or_default()
        ),
        "empty" | "nonempty_fail" => "Content must not be empty.".to_string(),
        other => format!("Issue: {other}"),
    }
}

fn summarize_guidance(qa: &QaResult) -> String {
    qa.issues.iter().map(|i| format!("- {}", issue_hint(i))).collect::<Vec<_>>().join("\n")
}

fn patch_kind_name(k: PatchKind) -> &'static str {
    match k {
        PatchKind::InsertHeader => "insert_header",
        PatchKind::AppendText => "append_text",
        PatchKind::PrependText => "prepend_text",
        PatchKind::RegexSub => "regex_sub",
    }
}

const RECOMMEND_PROMPT: &str = "Suggest up to 10 concrete improvements to the following content, \
one per line, each starting with \"- \". Respond with nothing else.\n\nContent:\n{content}\n";

const APPLY_PROMPT: &str = "Revise the following content to address these recommendations, keeping \
its existing heading and overall structure.\n\nRecommendations:\n{recs}\n\nContent:\n{content}\n";

/// Post-loop step: ask for up to 10 recommendations, and when
/// `apply_node_recs` is set and recommendations came back, apply them in one
/// revision call and re-run QA and judges once.
async fn recommend_and_maybe_apply(node: &Node, artifact: &mut Artifact, ctx: &ExecCtx) {
    let mut kwargs = HashMap::new();
    kwargs.insert("content", artifact.content.clone());
    let prompt = fmt(RECOMMEND_PROMPT, &kwargs);
    let Ok(result) = call_solver(ctx, &prompt, crate::types::solve_mode::NODE_RECOMMEND, &node.name).await else {
        return;
    };
    let recs: Vec<String> = result
        .text
        .lines()
        .filter_map(|l| {
            let t = l.trim().trim_start_matches(['-', '*']).trim();
            if t.is_empty() {
                None
            } else {
                Some(t.to_string())
            }
        })
        .take(10)
        .collect();
    artifact.recommendations = recs.clone();

    if ctx.config.apply_node_recs && !recs.is_empty() {
        let mut kwargs = HashMap::new();
        kwargs.insert("recs", recs.join("\n"));
        kwargs.insert("content", artifact.content.clone());
        let prompt = fmt(APPLY_PROMPT, &kwargs);
        if let Ok(result) = call_solver(ctx, &prompt, crate::types::solve_mode::NODE_APPLY, &node.name).await {
            artifact.content = result.text;
            artifact.qa = run_tests(&artifact.content, &node.contract);
            let pairs = run_judges(&ctx.judges, &artifact.content, &node.contract, ctx.config.judge_timeout).await;
            artifact.critiques = pairs.into_iter().map(|(_, c)| c).collect();
            artifact.status = if artifact.qa.ok {
                ArtifactStatus::Ok
            } else {
                ArtifactStatus::NeedsMoreDepth
            };
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum LoopState {
    Draft,
    Review,
    Patch,
    Rewrite,
    Done,
    ShortCircuit,
}

/// Runs the DRAFT/REVIEW/PATCH/REWRITE state machine to a terminal state,
/// then computes telemetry critiques and runs the recommend-then-apply step.
/// Critiques never gate acceptance; only QA does.
async fn run_improvement_loop(node: &Node, blackboard: &HashMap<String, Artifact>, ctx: &ExecCtx) -> Result<Artifact> {
    let mut state = LoopState::Draft;
    let mut content = String::new();
    let mut qa = QaResult { ok: false, issues: vec![] };
    let mut rounds: u32 = 0;
    let mut node_used: u64 = 0;

    loop {
        match state {
            LoopState::Draft => {
                let prompt = build_prompt(node, blackboard, &ctx.query, None);
                let result = hedged_solve(ctx, &prompt, node, &mut node_used).await?;
                content = result.text;
                qa = run_tests(&content, &node.contract);
                state = LoopState::Review;
            }
            LoopState::Review => {
                if qa.ok {
                    state = LoopState::Done;
                } else {
                    rounds += 1;
                    let budget_exhausted = ctx.run_tokens.used() >= ctx.run_tokens.max();
                    if budget_exhausted || rounds > ctx.homeostat.current_max_rounds() {
                        state = LoopState::ShortCircuit;
                    } else if qa.issues.iter().any(|i| !i.suggested.is_empty()) {
                        state = LoopState::Patch;
                    } else {
                        state = LoopState::Rewrite;
                    }
                }
            }
            LoopState::Patch => {
                let patches: Vec<Patch> = qa.issues.iter().flat_map(|i| i.suggested.clone()).collect();
                content = apply_patches(&content, &patches);
                for p in &patches {
                    ctx.memory.record_patch(patch_kind_name(p.kind), true).await;
                }
                qa = run_tests(&content, &node.contract);
                state = LoopState::Review;
            }
            LoopState::Rewrite => {
                let guidance = summarize_guidance(&qa);
                let prompt = build_prompt(node, blackboard, &ctx.query, Some(&guidance));
                let result = hedged_solve(ctx, &prompt, node, &mut node_used).await?;
                content = result.text;
                qa = run_tests(&content, &node.contract);
                state = LoopState::Review;
            }
            LoopState::Done | LoopState::ShortCircuit => break,
        }
    }

    let critiques = {
        let pairs = run_judges(&ctx.judges, &content, &node.contract, ctx.config.judge_timeout).await;
        pairs.into_iter().map(|(_, c)| c).collect::<Vec<_>>()
    };
    let status = if qa.ok {
        ArtifactStatus::Ok
    } else {
        ArtifactStatus::NeedsMoreDepth
    };

    let mut artifact = Artifact {
        node: node.name.clone(),
        content,
        qa,
        critiques,
        status,
        recommendations: Vec::new(),
    };
    recommend_and_maybe_apply(node, &mut artifact, ctx).await;
    Ok(artifact)
}

enum NodeOutcome {
    Ok(Artifact),
    Bypass(Artifact),
}

async fn execute_node_with_retry(node: &Node, blackboard: &HashMap<String, Artifact>, ctx: &ExecCtx) -> NodeOutcome {
    match run_improvement_loop(node, blackboard, ctx).await {
        Ok(artifact) => NodeOutcome::Ok(artifact),
        Err(_) => match run_improvement_loop(node, blackboard, ctx).await {
            Ok(artifact) => NodeOutcome::Ok(artifact),
            Err(_) => NodeOutcome::Bypass(Artifact {
                node: node.name.clone(),
                content: String::new(),
                qa: QaResult { ok: false, issues: vec![] },
                critiques: vec![],
                status: ArtifactStatus::Bypassed,
                recommendations: vec![],
            }),
        },
    }
}

/// One concurrency-bounded pass over `nodes`: ready nodes (all deps present
/// in `seed` or already completed this pass) launch immediately, up to
/// `concurrency` at a time. A node that fails twice is marked `Bypassed`
/// with empty content and spliced out of every successor's deps (replaced
/// by its own deps, which are already satisfied), so downstream nodes still
/// run.
async fn run_partition(
    nodes: &[Node],
    seed: HashMap<String, Artifact>,
    ctx: &ExecCtx,
    concurrency: usize,
) -> HashMap<String, Artifact> {
    if nodes.is_empty() {
        return seed;
    }
    let mut deps: HashMap<String, Vec<String>> = nodes.iter().map(|n| (n.name.clone(), n.deps.clone())).collect();
    let node_by_name: HashMap<String, Node> = nodes.iter().map(|n| (n.name.clone(), n.clone())).collect();
    let mut pending: HashSet<String> = node_by_name.keys().cloned().collect();
    let mut blackboard = seed;
    let sem = Arc::new(Semaphore::new(concurrency.max(1)));
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<(String, NodeOutcome)>();
    let mut in_flight: HashSet<String> = HashSet::new();

    loop {
        let ready: Vec<String> = pending
            .iter()
            .filter(|n| !in_flight.contains(*n))
            .filter(|n| {
                deps[*n]
                    .iter()
                    .all(|d| blackboard.contains_key(d) || !node_by_name.contains_key(d))
            })
            .cloned()
            .collect();

        for name in ready {
            in_flight.insert(name.clone());
            let node = node_by_name[&name].clone();
            let ctx = ctx.clone();
            let tx = tx.clone();
            let sem = sem.clone();
            let snapshot = blackboard.clone();
            tokio::spawn(async move {
                let _permit = sem.acquire_owned().await.expect("semaphore is never closed");
                let outcome = execute_node_with_retry(&node, &snapshot, &ctx).await;
                let _ = tx.send((name, outcome));
            });
        }

        if in_flight.is_empty() {
            break;
        }
        let Some((name, outcome)) = rx.recv().await else {
            break;
        };
        in_flight.remove(&name);
        pending.remove(&name);

        let failed = matches!(outcome, NodeOutcome::Bypass(_));
        let score = match &outcome {
            NodeOutcome::Ok(a) | NodeOutcome::Bypass(a) => {
                if a.critiques.is_empty() {
                    None
                } else {
                    Some(a.critiques.iter().map(|c| c.score).sum::<f64>() / a.critiques.len() as f64)
                }
            }
        };
        ctx.homeostat.record(failed, score).await;

        if failed {
            let own_deps = deps.get(&name).cloned().unwrap_or_default();
            for (succ, succ_deps) in deps.iter_mut() {
                if succ == &name {
                    continue;
                }
                if succ_deps.contains(&name) {
                    succ_deps.retain(|d| d != &name);
                    for od in &own_deps {
                        if !succ_deps.contains(od) {
                            succ_deps.push(od.clone());
                        }
                    }
                }
            }
        }

        let artifact = match outcome {
            NodeOutcome::Ok(a) | NodeOutcome::Bypass(a) => a,
        };
        blackboard.insert(name, artifact);
    }

    blackboard
}

fn backbone_closure(plan: &Plan) -> HashSet<String> {
    let mut closure: HashSet<String> = plan
        .nodes
        .iter()
        .filter(|n| matches!(n.role, NodeRole::Backbone))
        .map(|n| n.name.clone())
        .collect();
    let mut changed = true;
    while changed {
        changed = false;
        for n in &plan.nodes {
            if closure.contains(&n.name) {
                for d in &n.deps {
                    if closure.insert(d.clone()) {
                        changed = true;
                    }
                }
            }
        }
    }
    closure
}

/// Runs a plan to completion: the backbone transitive closure first, then
/// the remaining adjuncts seeded with the backbone's artifacts, with a
/// stability check between passes. `on_pass` is called with a label after
/// each pass completes.
pub async fn execute_plan(
    plan: &Plan,
    solver: Arc<dyn Solver>,
    judges: Arc<JudgeRegistry>,
    memory: Arc<MemoryStore>,
    limiter: Arc<GlobalRateLimiter>,
    config: &Config,
    query: &str,
    mut on_pass: impl FnMut(&str),
) -> HashMap<String, Artifact> {
    let run_tokens = Arc::new(RunTokens::new(config.max_tokens_per_run));
    let homeostat = Homeostat::new(config.max_rounds);
    let sampler = homeostat.spawn_sampler();

    let mut ctx = ExecCtx {
        solver,
        judges,
        memory,
        limiter,
        config: config.clone(),
        query: query.to_string(),
        run_tokens: run_tokens.clone(),
        homeostat,
        min_score: config.min_score,
    };

    let closure = backbone_closure(plan);
    let backbone_nodes: Vec<Node> = plan.nodes.iter().filter(|n| closure.contains(&n.name)).cloned().collect();
    let adjunct_nodes: Vec<Node> = plan.nodes.iter().filter(|n| !closure.contains(&n.name)).cloned().collect();

    let mut tracker = StabilityTracker::new();
    let mut concurrency = ctx.config.concurrent;

    let mut blackboard = run_partition(&backbone_nodes, HashMap::new(), &ctx, concurrency).await;
    for a in blackboard.values() {
        if !a.critiques.is_empty() {
            tracker.record(a.critiques.iter().map(|c| c.score).sum::<f64>() / a.critiques.len() as f64);
        }
    }
    let pending = run_tokens.max().saturating_sub(run_tokens.used());
    let (new_c, new_m) = tracker.check(pending, run_tokens.max(), concurrency, ctx.min_score);
    concurrency = new_c;
    ctx.min_score = new_m;
    on_pass("backbone");

    if !adjunct_nodes.is_empty() {
        let seed = blackboard.clone();
        let adjunct_artifacts = run_partition(&adjunct_nodes, seed, &ctx, concurrency).await;
        blackboard = adjunct_artifacts;
        for a in blackboard.values() {
            if !a.critiques.is_empty() {
                tracker.record(a.critiques.iter().map(|c| c.score).sum::<f64>() / a.critiques.len() as f64);
            }
        }
        let pending = run_tokens.max().saturating_sub(run_tokens.used());
        let _ = tracker.check(pending, run_tokens.max(), concurrency, ctx.min_score);
        on_pass("adjuncts");
    }

    sampler.abort();
    blackboard
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::judges::default_registry;
    use crate::solver::EchoSolver;
    use crate::types::Contract;
    use async_trait::async_trait;
    use std::collections::HashSet as StdHashSet;

    fn test_config() -> Config {
        let mut c = Config::default();
        c.node_timeout = Duration::from_secs(5);
        c.judge_timeout = Duration::from_secs(5);
        c.hedge_delay = Duration::from_millis(5);
        c.global_qps = 1000;
        c.global_max_concurrent = 64;
        c
    }

    async fn test_memory() -> Arc<MemoryStore> {
        let path = std::env::temp_dir().join(format!(
            "blackboard_executor_test_{}_{}.json",
            std::process::id(),
            rand_suffix()
        ));
        let _ = tokio::fs::remove_file(&path).await;
        Arc::new(MemoryStore::load(&path).await)
    }

    fn rand_suffix() -> u64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap().subsec_nanos() as u64
    }

    #[tokio::test]
    async fn execute_plan_runs_a_two_node_hybrid_plan_with_deps() {
        let plan = Plan {
            nodes: vec![
                Node {
                    name: "analysis".into(),
                    tmpl: "GENERIC".into(),
                    deps: vec![],
                    contract: Contract::for_section("Analysis", Some(2)),
                    role: NodeRole::Backbone,
                    prompt_override: None,
                },
                Node {
                    name: "answer".into(),
                    tmpl: "GENERIC".into(),
                    deps: vec!["analysis".into()],
                    contract: Contract::for_section("Answer", Some(2)),
                    role: NodeRole::Backbone,
                    prompt_override: None,
                },
            ],
        };
        let config = test_config();
        let limiter = Arc::new(GlobalRateLimiter::new(64, 1000, Duration::from_millis(100)));
        let mut passes = Vec::new();
        let blackboard = execute_plan(
            &plan,
            Arc::new(EchoSolver),
            Arc::new(default_registry()),
            test_memory().await,
            limiter,
            &config,
            "what is rust ownership",
            |label| passes.push(label.to_string()),
        )
        .await;

        assert_eq!(blackboard.len(), 2);
        assert_eq!(blackboard["analysis"].status, ArtifactStatus::Ok);
        assert_eq!(blackboard["answer"].status, ArtifactStatus::Ok);
        assert!(blackboard["answer"].content.contains("## Answer"));
        assert_eq!(passes, vec!["backbone".to_string()]);
    }

    struct SelectiveFailSolver {
        fail_for: StdHashSet<String>,
    }

    #[async_trait]
    impl Solver for SelectiveFailSolver {
        async fn solve(&self, task: &str, context: &SolveContext) -> Result<SolverResult> {
            let node = context.get("node").cloned().unwrap_or_default();
            if self.fail_for.contains(&node) {
                return Err(BlackboardError::Other("forced failure".to_string()));
            }
            EchoSolver.solve(task, context).await
        }
    }

    #[tokio::test]
    async fn a_twice_failing_node_is_bypassed_and_its_successor_still_runs() {
        let plan = Plan {
            nodes: vec![
                Node {
                    name: "a".into(),
                    tmpl: "GENERIC".into(),
                    deps: vec![],
                    contract: Contract::for_section("A", Some(1)),
                    role: NodeRole::Backbone,
                    prompt_override: None,
                },
                Node {
                    name: "b".into(),
                    tmpl: "GENERIC".into(),
                    deps: vec!["a".into()],
                    contract: Contract::for_section("B", Some(1)),
                    role: NodeRole::Backbone,
                    prompt_override: None,
                },
                Node {
                    name: "c".into(),
                    tmpl: "GENERIC".into(),
                    deps: vec!["b".into()],
                    contract: Contract::for_section("C", Some(1)),
                    role: NodeRole::Backbone,
                    prompt_override: None,
                },
            ],
        };
        let mut fail_for = StdHashSet::new();
        fail_for.insert("b".to_string());
        let solver = Arc::new(SelectiveFailSolver { fail_for });
        let config = test_config();
        let limiter = Arc::new(GlobalRateLimiter::new(64, 1000, Duration::from_millis(100)));

        let blackboard = execute_plan(
            &plan,
            solver,
            Arc::new(default_registry()),
            test_memory().await,
            limiter,
            &config,
            "q",
            |_| {},
        )
        .await;

        assert_eq!(blackboard["b"].status, ArtifactStatus::Bypassed);
        assert_eq!(blackboard["c"].status, ArtifactStatus::Ok);
    }

    #[test]
    fn backbone_closure_pulls_in_an_adjunct_dependency() {
        let plan = Plan {
            nodes: vec![
                Node {
                    name: "helper".into(),
                    tmpl: "GENERIC".into(),
                    deps: vec![],
                    contract: Contract::for_section("Helper", None),
                    role: NodeRole::Adjunct,
                    prompt_override: None,
                },
                Node {
                    name: "answer".into(),
                    tmpl: "GENERIC".into(),
                    deps: vec!["helper".into()],
                    contract: Contract::for_section("Answer", None),
                    role: NodeRole::Backbone,
                    prompt_override: None,
                },
            ],
        };
        let closure = backbone_closure(&plan);
        assert!(closure.contains("helper"));
        assert!(closure.contains("answer"));
    }

    #[test]
    fn stability_tracker_tightens_when_energy_fails_to_decrease() {
        let mut tracker = StabilityTracker::new();
        tracker.record(0.5);
        let (c1, m1) = tracker.check(100, 100, 4, 0.7);
        tracker.record(0.5);
        let (c2, m2) = tracker.check(100, 100, c1, m1);
        assert!(c2 <= c1);
        assert!(m2 >= m1);
    }
}
