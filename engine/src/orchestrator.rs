//! Top-level run loop: classify the query, compile a plan, execute it,
//! resolve cross-artifact contradictions, compose and polish the final
//! document, and persist the run into k-line memory.

use crate::adapter;
use crate::config::Config;
use crate::error::Result;
use crate::executor;
use crate::judges::JudgeRegistry;
use crate::memory::{KlineUpdate, MemoryStore};
use crate::planner;
use crate::solver::{PlannerLlm, Solver};
use crate::types::{
    Artifact, BeliefClaim, Classification, ClassificationKind, KlineNodeSnapshot, KlineTrace, Plan,
    SolveContext, solve_mode,
};
use crate::util::{ensure_header, first_json_object, fmt, safe_json_parse, sanitize_text, GlobalRateLimiter};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Timeout for the bounded planning-adjacent LLM calls (classification, CQAP
/// meta-analysis) — shorter than `make_plan`'s own 70s since these return
/// much smaller payloads.
const PLANNER_CALL_TIMEOUT: Duration = Duration::from_secs(45);

/// Everything [`run`] needs; callers build one per invocation.
pub struct RunOptions<'a> {
    pub query: &'a str,
    pub solver: Arc<dyn Solver>,
    pub planner_llm: Arc<dyn PlannerLlm>,
    pub memory: Arc<MemoryStore>,
    pub judges: Arc<JudgeRegistry>,
    pub limiter: Arc<GlobalRateLimiter>,
    pub config: Config,
    /// Skip the CQAP meta-analysis phase even if the config would otherwise run it.
    pub skip_mission_meta: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorResult {
    pub run_id: String,
    pub sig: String,
    pub classification: Classification,
    pub plan: Plan,
    pub artifacts: HashMap<String, Artifact>,
    pub conflicts: Vec<(String, String, String)>,
    pub resolution: String,
    pub final_pre_cohesion: String,
    pub final_document: String,
    pub global_recommendations: Vec<String>,
}

fn new_run_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

fn normalize_query(q: &str) -> String {
    let collapsed = q.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase();
    let mut end = collapsed.len().min(512);
    while end > 0 && !collapsed.is_char_boundary(end) {
        end -= 1;
    }
    collapsed[..end].to_string()
}

fn compute_sig(kind: &str, query: &str) -> String {
    let normalized = normalize_query(query);
    let mut hasher = Sha256::new();
    hasher.update(format!("{kind}:{normalized}"));
    hasher.finalize().iter().take(8).map(|b| format!("{b:02x}")).collect()
}

/// Reuses a high-similarity neighbor's node structure instead of calling the
/// planner LLM, when that neighbor's prior run succeeded on at least 80% of
/// its nodes.
async fn try_kline_replay(memory: &MemoryStore, hits: &[crate::types::KlineHit]) -> Option<Plan> {
    for hit in hits {
        if hit.sim < 0.8 {
            continue;
        }
        let entry = memory.get_kline(&hit.sig).await?;
        if entry.nodes.is_empty() {
            continue;
        }
        let quality = entry.ok_nodes.len() as f64 / entry.nodes.len() as f64;
        if quality < 0.8 {
            continue;
        }
        if let Some(nodes) = memory.replay_kline(&hit.sig).await {
            return Some(Plan {
                nodes: planner::validate_and_repair_plan(nodes),
            });
        }
    }
    None
}

static CLAIM_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b([A-Za-z][A-Za-z0-9_' -]{0,40}?)\s+is(\s+not)?\s+([^.\n]{0,80})").unwrap());

struct Claim {
    node: String,
    subject: String,
    polarity: bool,
    object: String,
}

fn extract_claims(node: &str, text: &str) -> Vec<Claim> {
    CLAIM_RE
        .captures_iter(text)
        .filter_map(|cap| {
            let subject = cap[1].trim().to_lowercase();
            if subject.is_empty() {
                return None;
            }
            let object = cap.get(3).map(|m| m.as_str().trim().to_string()).unwrap_or_default();
            Some(Claim {
                node: node.to_string(),
                subject,
                polarity: cap.get(2).is_none(),
                object,
            })
        })
        .collect()
}

/// Unique (node_a, node_b, subject) triples where two different nodes assert
/// opposite polarity about the same subject.
fn detect_contradictions(artifacts: &HashMap<String, Artifact>) -> Vec<(String, String, String)> {
    let mut claims = Vec::new();
    for (name, artifact) in artifacts {
        claims.extend(extract_claims(name, &artifact.content));
    }
    let mut seen: HashSet<(String, String, String)> = HashSet::new();
    let mut conflicts = Vec::new();
    for i in 0..claims.len() {
        for j in (i + 1)..claims.len() {
            let a = &claims[i];
            let b = &claims[j];
            if a.node == b.node || a.subject != b.subject || a.polarity == b.polarity {
                continue;
            }
            let (first, second) = if a.node < b.node {
                (a.node.clone(), b.node.clone())
            } else {
                (b.node.clone(), a.node.clone())
            };
            let key = (first, second, a.subject.clone());
            if seen.insert(key.clone()) {
                conflicts.push(key);
            }
        }
    }
    conflicts
}

const RESOLUTION_PROMPT: &str = "Two sections of a document disagree about whether \"{subject}\" \
holds.\n\n### {node_a}\n{content_a}\n\n### {node_b}\n{content_b}\n\nWrite one short paragraph \
resolving the disagreement in favor of whichever claim is better supported.\n";

fn title_case(subject: &str) -> String {
    subject
        .split_whitespace()
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

async fn resolve_contradictions(
    conflicts: &[(String, String, String)],
    artifacts: &HashMap<String, Artifact>,
    solver: &Arc<dyn Solver>,
    limiter: &Arc<GlobalRateLimiter>,
    timeout: Duration,
) -> String {
    if conflicts.is_empty() {
        return String::new();
    }
    let mut out = String::new();
    for (node_a, node_b, subject) in conflicts {
        let content_a = artifacts.get(node_a).map(|a| a.content.as_str()).unwrap_or("");
        let content_b = artifacts.get(node_b).map(|a| a.content.as_str()).unwrap_or("");
        let mut kwargs = HashMap::new();
        kwargs.insert("subject", subject.clone());
        kwargs.insert("node_a", node_a.clone());
        kwargs.insert("node_b", node_b.clone());
        kwargs.insert("content_a", content_a.to_string());
        kwargs.insert("content_b", content_b.to_string());
        let prompt = fmt(RESOLUTION_PROMPT, &kwargs);

        let mut ctx: SolveContext = SolveContext::new();
        ctx.insert("mode".to_string(), solve_mode::CONTRADICTION_RESOLUTION.to_string());
        let _slot = limiter.slot().await;
        let body = match tokio::time::timeout(timeout, solver.solve(&prompt, &ctx)).await {
            Ok(Ok(result)) if !result.text.trim().is_empty() => result.text.trim().to_string(),
            _ => format!(
                "Sections `{node_a}` and `{node_b}` disagree about \"{subject}\"; no automated resolution was available."
            ),
        };
        out.push_str(&format!("### {}\n\n{body}\n\n", title_case(subject)));
    }
    out
}

static BLANK_RUNS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());
static DEPS_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^Dependencies:\n(?:-[^\n]*\n?)+\n?").unwrap());
static CONSTRAINTS_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^(?:Iterative )?Constraints:\n(?:-[^\n]*\n?)+\n?").unwrap());

/// Strips the internal prompt scaffolding (`build_prompt`'s `Dependencies:`
/// context block and `Iterative Constraints:` guidance list) that the mock
/// solver echoes straight back into node content.
fn strip_internal_scaffolding(content: &str) -> String {
    let stripped = DEPS_BLOCK.replace_all(content, "");
    CONSTRAINTS_BLOCK.replace_all(&stripped, "").into_owned()
}

fn compose_document(plan: &Plan, artifacts: &HashMap<String, Artifact>, resolution: &str) -> String {
    let mut sections: Vec<String> = Vec::new();
    for node in &plan.nodes {
        let Some(artifact) = artifacts.get(&node.name) else {
            continue;
        };
        let section = node.contract.markdown_section().unwrap_or(&node.name);
        let mut content = sanitize_text(&strip_internal_scaffolding(&artifact.content));
        let (has_header, suggestion) = ensure_header(&content, section);
        if !has_header {
            if let Some((level, title)) = suggestion {
                let hashes = "#".repeat(level as usize);
                content = format!("{hashes} {title}\n\n{content}");
            }
        }
        let collapsed = BLANK_RUNS.replace_all(content.trim(), "\n\n");
        sections.push(collapsed.trim().to_string());
    }
    let mut doc = sections.join("\n\n---\n\n");
    if !resolution.trim().is_empty() {
        if !doc.is_empty() {
            doc.push_str("\n\n---\n\n");
        }
        doc.push_str("## Contradiction Resolution\n\n");
        doc.push_str(resolution.trim());
    }
    doc.push('\n');
    doc
}

const COHESION_PROMPT: &str = "Review the following composed document for consistency, coherence, \
and duplicate content across sections. Respond with a single JSON object: \
{{\"recommendations\": [\"...\"], \"revised\": \"...\"}}. If no revision is needed, echo the \
document back verbatim in \"revised\".\n\nDocument:\n{doc}\n";

const COHESION_APPLY_PROMPT: &str = "Revise the following document to address these \
recommendations, preserving its section headers.\n\nRecommendations:\n{recs}\n\nDocument:\n{doc}\n";

async fn cohesion_pass(
    doc: &str,
    solver: &Arc<dyn Solver>,
    limiter: &Arc<GlobalRateLimiter>,
    timeout: Duration,
    apply_global_recs: bool,
) -> (Vec<String>, String) {
    let mut kwargs = HashMap::new();
    kwargs.insert("doc", doc.to_string());
    let prompt = fmt(COHESION_PROMPT, &kwargs);
    let mut ctx: SolveContext = SolveContext::new();
    ctx.insert("mode".to_string(), solve_mode::COHESION.to_string());

    let result = {
        let _slot = limiter.slot().await;
        tokio::time::timeout(timeout, solver.solve(&prompt, &ctx)).await
    };
    let Ok(Ok(result)) = result else {
        return (vec![], doc.to_string());
    };
    let Some(blob) = first_json_object(&result.text) else {
        return (vec![], doc.to_string());
    };
    #[derive(Deserialize)]
    struct Raw {
        #[serde(default)]
        recommendations: Vec<String>,
        #[serde(default)]
        revised: String,
    }
    let raw: Raw = safe_json_parse(blob).unwrap_or(Raw {
        recommendations: vec![],
        revised: String::new(),
    });
    let mut revised = if raw.revised.trim().is_empty() { doc.to_string() } else { raw.revised };

    if apply_global_recs && !raw.recommendations.is_empty() {
        let mut kwargs2 = HashMap::new();
        kwargs2.insert("recs", raw.recommendations.join("\n"));
        kwargs2.insert("doc", revised.clone());
        let prompt2 = fmt(COHESION_APPLY_PROMPT, &kwargs2);
        let mut ctx2: SolveContext = SolveContext::new();
        ctx2.insert("mode".to_string(), solve_mode::COHESION_APPLY.to_string());
        let result2 = {
            let _slot = limiter.slot().await;
            tokio::time::timeout(timeout, solver.solve(&prompt2, &ctx2)).await
        };
        if let Ok(Ok(r2)) = result2 {
            if !r2.text.trim().is_empty() {
                revised = r2.text;
            }
        }
    }
    (raw.recommendations, revised)
}

const DENSE_FINAL_PROMPT: &str = "Expand the following document with additional supporting detail \
and examples without changing its structure or section headers.\n\nDocument:\n{doc}\n";

async fn dense_final(doc: &str, solver: &Arc<dyn Solver>, limiter: &Arc<GlobalRateLimiter>, timeout: Duration) -> String {
    let mut kwargs = HashMap::new();
    kwargs.insert("doc", doc.to_string());
    let prompt = fmt(DENSE_FINAL_PROMPT, &kwargs);
    let mut ctx: SolveContext = SolveContext::new();
    ctx.insert("mode".to_string(), solve_mode::DENSE_FINAL.to_string());
    let result = {
        let _slot = limiter.slot().await;
        tokio::time::timeout(timeout, solver.solve(&prompt, &ctx)).await
    };
    match result {
        Ok(Ok(r)) if !r.text.trim().is_empty() => r.text,
        _ => doc.to_string(),
    }
}

/// Runs the full pipeline: classify, plan, execute, resolve contradictions,
/// compose, polish, and persist. Never fails on planner/solver trouble —
/// those degrade to fallbacks throughout — only `Err` on a truly empty
/// compiled plan.
pub async fn run(opts: RunOptions<'_>) -> Result<OrchestratorResult> {
    let RunOptions {
        query,
        solver,
        planner_llm,
        memory,
        judges,
        limiter,
        config,
        skip_mission_meta,
    } = opts;

    let run_id = new_run_id();

    let cqap_meta = if config.use_cqap && config.use_llm_cqap && !skip_mission_meta {
        planner::cqap_meta_analysis(planner_llm.as_ref(), query, PLANNER_CALL_TIMEOUT).await
    } else {
        None
    };

    let classification = if config.use_llm_classifier {
        planner::classify_query_llm(query, planner_llm.as_ref(), PLANNER_CALL_TIMEOUT).await
    } else {
        planner::classify_query(query)
    };

    let sig = compute_sig(&classification.kind.to_string(), query);

    let (hits, hints) = if config.kline_enable {
        let hits = memory
            .query_klines(query, config.kline_top_k, config.kline_min_sim, config.kline_embed_dim)
            .await;
        let hints = memory.summarize_neighbors(&hits, config.kline_hint_tokens as usize).await;
        (hits, hints)
    } else {
        (vec![], String::new())
    };

    let (query_clean, mission_opt) = adapter::extract_mission(query);

    let mut plan = None;
    if config.plan_from_meta {
        if let Some(mission) = &mission_opt {
            plan = planner::mission_plan(mission);
        }
    }
    if plan.is_none() && config.use_cqap {
        if let Some(cqap) = &cqap_meta {
            plan = planner::cqap_plan(cqap, &classification);
        }
    }
    if plan.is_none() && config.kline_enable {
        plan = try_kline_replay(&memory, &hits).await;
    }
    let plan = match plan {
        Some(p) => p,
        None => planner::make_plan(planner_llm.as_ref(), &query_clean, &classification, &hints).await,
    };

    let mut passes = Vec::new();
    let artifacts = executor::execute_plan(
        &plan,
        solver.clone(),
        judges,
        memory.clone(),
        limiter.clone(),
        &config,
        &query_clean,
        |label| passes.push(label.to_string()),
    )
    .await;

    for (name, artifact) in &artifacts {
        let claims: Vec<BeliefClaim> = extract_claims(name, &artifact.content)
            .into_iter()
            .map(|c| BeliefClaim {
                subject: c.subject,
                predicate: "is".to_string(),
                object: c.object,
                polarity: c.polarity,
                confidence: None,
            })
            .collect();
        if !claims.is_empty() {
            memory.add_beliefs(&claims, &sig, name, &run_id).await;
        }
    }

    let conflicts = detect_contradictions(&artifacts);
    let resolution = resolve_contradictions(&conflicts, &artifacts, &solver, &limiter, config.node_timeout).await;

    let final_pre_cohesion = compose_document(&plan, &artifacts, &resolution);

    let (mut global_recs, mut final_document) = cohesion_pass(
        &final_pre_cohesion,
        &solver,
        &limiter,
        config.node_timeout,
        config.apply_global_recs,
    )
    .await;

    if config.dense_final_enable {
        final_document = dense_final(&final_document, &solver, &limiter, config.node_timeout).await;
    }

    global_recs.truncate(10);

    if config.kline_enable {
        let ok_nodes: Vec<String> = artifacts
            .iter()
            .filter(|(_, a)| matches!(a.status, crate::types::ArtifactStatus::Ok))
            .map(|(name, _)| name.clone())
            .collect();
        let snapshots: Vec<KlineNodeSnapshot> = plan.nodes.iter().map(KlineNodeSnapshot::from).collect();
        memory
            .append_kline_trace(
                &sig,
                KlineTrace {
                    ts: 0.0,
                    nodes: snapshots.clone(),
                },
            )
            .await;
        memory
            .upsert_kline(
                &sig,
                KlineUpdate {
                    nodes: Some(snapshots),
                    ok_nodes: Some(ok_nodes),
                    global_recs: Some(global_recs.clone()),
                    run_id: Some(run_id.clone()),
                },
                Some(&query_clean),
                Some(classification.clone()),
                config.kline_embed_dim,
                config.kline_max_entries,
            )
            .await;

        let self_model = serde_json::json!({
            "run_id": run_id,
            "classification": classification.kind.to_string(),
            "node_count": plan.nodes.len(),
            "ok_count": artifacts.values().filter(|a| matches!(a.status, crate::types::ArtifactStatus::Ok)).count(),
            "conflict_count": conflicts.len(),
        });
        memory.store_self_model(&sig, self_model).await;
    }

    Ok(OrchestratorResult {
        run_id,
        sig,
        classification,
        plan,
        artifacts,
        conflicts,
        resolution,
        final_pre_cohesion,
        final_document,
        global_recommendations: global_recs,
    })
}
