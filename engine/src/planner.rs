//! Query classification and plan compilation: the heuristic/LLM classifier,
//! the three plan compilers (mission, CQAP, free-form) in priority order, and
//! the topological validator that repairs whatever a compiler hands back.

use crate::error::Result;
use crate::solver::PlannerLlm;
use crate::types::{
    Classification, ClassificationKind, Contract, Node, NodeRole, Plan, TestArg, TestKind,
    TestSpec,
};
use crate::util::{first_json_object, fmt, safe_json_parse, slug, word_count};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

static DELIVERABLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(design|architecture|spec|contract|roadmap|benchmark|compare|trade[- ]?offs?|rfc|plan|protocol|implementation|experiment|evaluate)\b").unwrap()
});
static DEPENDENCY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(after|before|then|depends|precede|follow|stage|phase|blocker|unblock)\b")
        .unwrap()
});
static BULLET: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)(^\s*[-*]\s+|\d+\.\s+)").unwrap());
static VERBS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(\w+?)(?:ed|ing|e|ify|ise|ize)\b").unwrap());

/// Weighted-sum heuristic: deliverable/dependency/bullet/length/verb cues,
/// thresholds 0.25 and 0.55 partition into Atomic/Hybrid/Composite.
pub fn classify_query(query: &str) -> Classification {
    let q = query.trim();
    let wc = word_count(q);
    let score = 0.34 * (DELIVERABLE.find_iter(q).count() as f64 / 3.0).min(1.0)
        + 0.26 * (DEPENDENCY.find_iter(q).count() as f64 / 2.0).min(1.0)
        + 0.20 * (BULLET.find_iter(q).count() as f64 / 3.0).min(1.0)
        + 0.10 * if wc > 100 { 1.0 } else { 0.0 }
        + 0.10 * (VERBS.find_iter(q).count() as f64 / 14.0).min(1.0);
    let score = (score * 1000.0).round() / 1000.0;
    let kind = if score < 0.25 {
        ClassificationKind::Atomic
    } else if score < 0.55 {
        ClassificationKind::Hybrid
    } else {
        ClassificationKind::Composite
    };
    Classification { kind, score }
}

const CLASSIFIER_PROMPT: &str = "Classify the following query's scope.\n\
Respond with a single JSON object: {{\"kind\": \"Atomic|Hybrid|Composite\", \"score\": 0..1, \"cues\": {{...}}}}.\n\n\
Query:\n{q}\n";

/// Asks the planner LLM for a classification; falls back to the heuristic on
/// any call/parse failure or unrecognized `kind`. When the LLM says Atomic
/// but cue counts suggest real breadth or dependency depth, nudges the score
/// up to flag a possible hybrid without overriding the chosen kind.
pub async fn classify_query_llm(
    query: &str,
    planner: &dyn PlannerLlm,
    timeout: Duration,
) -> Classification {
    let heuristic = classify_query(query);
    let mut kwargs = HashMap::new();
    kwargs.insert("q", query.to_string());
    let prompt = fmt(CLASSIFIER_PROMPT, &kwargs);

    let raw = match planner.complete(&prompt, 0.0, timeout).await {
        Ok(r) => r,
        Err(_) => return heuristic,
    };
    let Some(blob) = first_json_object(&raw) else {
        return heuristic;
    };

    #[derive(serde::Deserialize)]
    struct Raw {
        kind: Option<String>,
        score: Option<f64>,
    }
    let Some(parsed): Option<Raw> = safe_json_parse(blob) else {
        return heuristic;
    };
    let kind = match parsed.kind.as_deref().map(|s| s.to_lowercase()).as_deref() {
        Some("atomic") => ClassificationKind::Atomic,
        Some("hybrid") => ClassificationKind::Hybrid,
        Some("composite") => ClassificationKind::Composite,
        _ => return heuristic,
    };
    let mut score = parsed.score.unwrap_or(heuristic.score).clamp(0.0, 1.0);
    if kind == ClassificationKind::Atomic {
        let breadth = DELIVERABLE.find_iter(query).count();
        let depth = DEPENDENCY.find_iter(query).count();
        if breadth >= 2 || depth >= 2 {
            score = (score + 0.1).min(1.0);
        }
    }
    Classification { kind, score }
}

/// Tolerant contract parser: filters tests to known kinds, guarantees a
/// `nonempty` and a `header_present` test are present, defaults the section.
pub fn parse_contract(v: Option<&serde_json::Value>, fallback_section: &str) -> Contract {
    let Some(v) = v else {
        return Contract::for_section(fallback_section, Some(50));
    };
    let section = v
        .get("format")
        .and_then(|f| f.get("markdown_section"))
        .and_then(|s| s.as_str())
        .unwrap_or(fallback_section)
        .to_string();

    let mut tests = Vec::new();
    let mut has_nonempty = false;
    let mut has_header = false;
    if let Some(arr) = v.get("tests").and_then(|t| t.as_array()) {
        for t in arr {
            let Some(kind_str) = t.get("kind").and_then(|k| k.as_str()) else {
                continue;
            };
            let kind = match kind_str {
                "nonempty" => {
                    has_nonempty = true;
                    TestKind::Nonempty
                }
                "regex" => TestKind::Regex,
                "contains" => TestKind::Contains,
                "word_count_min" => TestKind::WordCountMin,
                "header_present" => {
                    has_header = true;
                    TestKind::HeaderPresent
                }
                _ => continue,
            };
            let arg = match t.get("arg") {
                Some(serde_json::Value::Number(n)) => {
                    TestArg::Count(n.as_u64().unwrap_or(0) as usize)
                }
                Some(serde_json::Value::String(s)) => TestArg::Text(s.clone()),
                _ => TestArg::Text(String::new()),
            };
            tests.push(TestSpec { kind, arg });
        }
    }
    if !has_nonempty {
        tests.insert(
            0,
            TestSpec {
                kind: TestKind::Nonempty,
                arg: TestArg::Text(String::new()),
            },
        );
    }
    if !has_header {
        tests.push(TestSpec {
            kind: TestKind::HeaderPresent,
            arg: TestArg::Text(section.clone()),
        });
    }
    let mut format = HashMap::new();
    format.insert("markdown_section".to_string(), section);
    Contract { format, tests }
}

/// Drop forward/self deps, run Kahn's algorithm, and clear the deps of any
/// node still carrying positive in-degree afterward (i.e. on a cycle).
/// Preserves the caller's node order throughout.
pub fn validate_and_repair_plan(nodes: Vec<Node>) -> Vec<Node> {
    let order: HashMap<String, usize> = nodes
        .iter()
        .enumerate()
        .map(|(i, n)| (n.name.clone(), i))
        .collect();
    let mut nodes: Vec<Node> = nodes
        .into_iter()
        .enumerate()
        .map(|(i, mut n)| {
            n.deps
                .retain(|d| order.get(d).copied().map(|oi| oi < i).unwrap_or(false));
            n
        })
        .collect();

    let mut indeg: HashMap<String, usize> = nodes.iter().map(|n| (n.name.clone(), 0)).collect();
    let mut succ: HashMap<String, Vec<String>> =
        nodes.iter().map(|n| (n.name.clone(), Vec::new())).collect();
    for n in &nodes {
        for d in &n.deps {
            *indeg.get_mut(&n.name).unwrap() += 1;
            succ.get_mut(d).unwrap().push(n.name.clone());
        }
    }

    let mut queue: VecDeque<String> = indeg
        .iter()
        .filter(|(_, &d)| d == 0)
        .map(|(k, _)| k.clone())
        .collect();
    let mut live_indeg = indeg.clone();
    let mut seen = 0usize;
    while let Some(name) = queue.pop_front() {
        seen += 1;
        for s in succ.get(&name).cloned().unwrap_or_default() {
            let e = live_indeg.get_mut(&s).unwrap();
            *e -= 1;
            if *e == 0 {
                queue.push_back(s);
            }
        }
    }

    if seen != nodes.len() {
        for n in nodes.iter_mut() {
            if live_indeg.get(&n.name).copied().unwrap_or(0) > 0 {
                n.deps.clear();
            }
        }
    }
    nodes
}

const PLANNER_PROMPT: &str = "Decompose the following query into a small dependency graph of \
named sub-tasks. Respond with a single JSON object: \
{{\"nodes\": [{{\"name\": \"...\", \"deps\": [...], \"tmpl\": \"GENERIC\", \"role\": \"backbone|adjunct\", \
\"prompt\": \"...\", \"contract\": {{\"format\": {{\"markdown_section\": \"...\"}}, \"tests\": [...]}} }}]}}.\n\n\
{hints}\nQuery:\n{q}\n";

/// Slugifies and dedups node names, fills every default (template, role,
/// contract), and falls back to a single `answer` node when `raw_nodes` is
/// empty. Shared by [`make_plan`] (planner LLM output) and
/// [`crate::adapter::plan_from_backend`] (a bare backend's raw completion).
pub fn compile_raw_nodes(raw_nodes: &[serde_json::Value]) -> Vec<Node> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut nodes = Vec::new();
    for (i, raw) in raw_nodes.iter().enumerate() {
        let fallback = format!("step-{}", i + 1);
        let raw_name = raw.get("name").and_then(|n| n.as_str()).unwrap_or(&fallback);
        let mut name = slug(raw_name, &fallback);
        if seen.contains(&name) {
            name = format!("{name}-{}", i + 1);
        }
        seen.insert(name.clone());

        let deps: Vec<String> = raw
            .get("deps")
            .and_then(|d| d.as_array())
            .map(|a| {
                a.iter()
                    .filter_map(|v| v.as_str().map(|s| s.to_string()))
                    .collect()
            })
            .unwrap_or_default();
        let tmpl = raw
            .get("tmpl")
            .and_then(|t| t.as_str())
            .unwrap_or("GENERIC")
            .to_string();
        let role = match raw.get("role").and_then(|r| r.as_str()).map(|s| s.to_lowercase()) {
            Some(ref s) if s == "backbone" => NodeRole::Backbone,
            _ => NodeRole::Adjunct,
        };
        let prompt_override = raw.get("prompt").and_then(|p| p.as_str()).map(|s| s.to_string());
        let contract = parse_contract(raw.get("contract"), "Section");
        nodes.push(Node {
            name,
            tmpl,
            deps,
            contract,
            role,
            prompt_override,
        });
    }

    if nodes.is_empty() {
        nodes.push(Node {
            name: "answer".to_string(),
            tmpl: "GENERIC".to_string(),
            deps: vec![],
            contract: Contract::for_section("Answer", Some(120)),
            role: NodeRole::Backbone,
            prompt_override: None,
        });
    }
    nodes
}

/// Calls the planner LLM, extracts the first JSON object, slugifies and
/// dedups node names, fills every default, and trims to the classification's
/// size bounds before handing the result to the validator. Never fails: a
/// call/parse failure or empty node list falls back to a single `answer`
/// node, matching the original's degrade-to-single-node behavior.
pub async fn make_plan(planner: &dyn PlannerLlm, query: &str, cls: &Classification, hints: &str) -> Plan {
    let mut kwargs = HashMap::new();
    kwargs.insert("q", query.to_string());
    kwargs.insert("hints", hints.to_string());
    let prompt = fmt(PLANNER_PROMPT, &kwargs);

    let raw = planner
        .complete(&prompt, 0.0, Duration::from_secs_f64(70.0))
        .await
        .unwrap_or_default();
    let blob = first_json_object(&raw).unwrap_or("{}");
    let data: serde_json::Value = safe_json_parse(blob).unwrap_or_else(|| serde_json::json!({}));
    let raw_nodes = data
        .get("nodes")
        .and_then(|n| n.as_array())
        .cloned()
        .unwrap_or_default();

    let mut nodes = compile_raw_nodes(&raw_nodes);

    let bound = match cls.kind {
        ClassificationKind::Atomic => 1,
        ClassificationKind::Hybrid => 2.max(4.min(nodes.len())),
        ClassificationKind::Composite => 4.max(8.min(nodes.len())),
    };
    nodes.truncate(bound);

    Plan {
        nodes: validate_and_repair_plan(nodes),
    }
}

fn value_is_blank(v: &serde_json::Value) -> bool {
    match v {
        serde_json::Value::Null => true,
        serde_json::Value::String(s) => s.trim().is_empty(),
        serde_json::Value::Array(a) => a.is_empty(),
        serde_json::Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

fn title_case(s: &str) -> String {
    let mut c = s.chars();
    match c.next() {
        None => String::new(),
        Some(f) => f.to_uppercase().collect::<String>() + c.as_str(),
    }
}

/// Compiles a tolerant mission JSON (`query_context`, `Strategy: [{Objective,
/// queries, tactics}]`) into a Plan: one backbone objective node per stage
/// (depending on its queries node and all its tactic nodes), one adjunct
/// tactic node per tactic (dependency names rewritten from `expected_artifact`
/// to the producing tactic's node name when they match), and a trailing
/// `final_synthesis` backbone depending on every objective. Returns `None`
/// when `Strategy` is missing or empty so the caller can fall through to the
/// next compiler.
pub fn mission_plan(mission: &serde_json::Value) -> Option<Plan> {
    let strategy = mission
        .get("Strategy")
        .or_else(|| mission.get("strategy"))?
        .as_array()?;
    if strategy.is_empty() {
        return None;
    }

    let mut nodes = Vec::new();
    let mut objective_names = Vec::new();

    for (i, stage) in strategy.iter().enumerate() {
        let idx = i + 1;
        let title = stage
            .get("Objective")
            .or_else(|| stage.get("objective"))
            .and_then(|v| v.as_str())
            .unwrap_or("Objective")
            .to_string();

        let mut tactic_names = Vec::new();
        let mut artifact_to_node: HashMap<String, String> = HashMap::new();
        let mut pending: Vec<(String, Vec<String>)> = Vec::new();

        if let Some(tactics) = stage.get("tactics").and_then(|t| t.as_array()) {
            for (j, t) in tactics.iter().enumerate() {
                let name = format!("o{idx}_t{}", j + 1);
                if let Some(art) = t.get("expected_artifact").and_then(|v| v.as_str()) {
                    artifact_to_node.insert(art.to_string(), name.clone());
                }
                let raw_deps: Vec<String> = t
                    .get("dependencies")
                    .and_then(|v| v.as_array())
                    .map(|arr| {
                        arr.iter()
                            .filter_map(|v| v.as_str().map(|s| s.to_string()))
                            .collect()
                    })
                    .unwrap_or_default();
                tactic_names.push(name.clone());
                pending.push((name, raw_deps));
            }
        }

        for (name, raw_deps) in pending {
            let deps: Vec<String> = raw_deps
                .into_iter()
                .map(|d| {
                    if tactic_names.contains(&d) {
                        d
                    } else if let Some(mapped) = artifact_to_node.get(&d) {
                        mapped.clone()
                    } else {
                        d
                    }
                })
                .collect();
            nodes.push(Node {
                name: name.clone(),
                tmpl: "GENERIC".to_string(),
                deps,
                contract: Contract::for_section(&title_case(&name.replace('_', " ")), Some(30)),
                role: NodeRole::Adjunct,
                prompt_override: None,
            });
        }

        let mut objective_deps = tactic_names.clone();
        if let Some(q) = stage.get("queries") {
            if !value_is_blank(q) {
                let qname = format!("o{idx}_queries");
                nodes.push(Node {
                    name: qname.clone(),
                    tmpl: "GENERIC".to_string(),
                    deps: vec![],
                    contract: Contract::for_section(&format!("O{idx} Queries"), Some(30)),
                    role: NodeRole::Adjunct,
                    prompt_override: None,
                });
                objective_deps.push(qname);
            }
        }

        let obj_name = format!("o{idx}_objective");
        nodes.push(Node {
            name: obj_name.clone(),
            tmpl: "GENERIC".to_string(),
            deps: objective_deps,
            contract: Contract::for_section(&format!("O{idx}: {title}"), Some(80)),
            role: NodeRole::Backbone,
            prompt_override: None,
        });
        objective_names.push(obj_name);
    }

    nodes.push(Node {
        name: "final_synthesis".to_string(),
        tmpl: "GENERIC".to_string(),
        deps: objective_names,
        contract: Contract::for_section("Final Synthesis", Some(120)),
        role: NodeRole::Backbone,
        prompt_override: None,
    });

    Some(Plan {
        nodes: validate_and_repair_plan(nodes),
    })
}

const CQAP_TIER1: [&str; 3] = ["goal", "obstacles", "facts"];
const CQAP_TIER1_EXTRA: [&str; 2] = ["precision", "toneanalysis"];
const CQAP_TIER2: [&str; 5] = [
    "structuralrelationships",
    "boundaryanalysis",
    "embeddedassumptions",
    "knowledgegaps",
    "factreflectionseparation",
];
const CQAP_TIER3: [&str; 3] = ["uncertainty", "responsestrategy", "rationale"];

fn cqap_node(key: &str, deps: Vec<String>, role: NodeRole) -> Node {
    Node {
        name: key.to_string(),
        tmpl: "GENERIC".to_string(),
        deps,
        contract: Contract::for_section(&title_case(key), Some(40)),
        role,
        prompt_override: None,
    }
}

/// Compiles a normalized CQAP slot map into a Plan. Tier-1 slots (`goal`,
/// `obstacles`, `facts`) chain backbone-to-backbone when present; `precision`
/// and `toneanalysis` become adjuncts depending on `facts`; Tier-2 slots
/// (enabled for Hybrid/Composite) chain linearly off `facts`; Tier-3 slots
/// (Composite only) depend on `facts` plus the last Tier-2 node; a trailing
/// `finalanswer` backbone depends on every emitted node. Returns `None` when
/// no slot is present.
pub fn cqap_plan(slots: &serde_json::Value, cls: &Classification) -> Option<Plan> {
    let obj = slots.as_object()?;
    let present = |k: &str| obj.get(k).map(|v| !value_is_blank(v)).unwrap_or(false);

    let mut nodes = Vec::new();
    let mut chain_prev: Option<String> = None;
    for key in CQAP_TIER1 {
        if !present(key) {
            continue;
        }
        let deps = chain_prev.clone().into_iter().collect();
        nodes.push(cqap_node(key, deps, NodeRole::Backbone));
        chain_prev = Some(key.to_string());
    }
    if nodes.is_empty() {
        return None;
    }
    let facts = "facts".to_string();

    for key in CQAP_TIER1_EXTRA {
        if present(key) {
            nodes.push(cqap_node(key, vec![facts.clone()], NodeRole::Adjunct));
        }
    }

    let mut last_tier2 = facts.clone();
    if matches!(cls.kind, ClassificationKind::Hybrid | ClassificationKind::Composite) {
        for key in CQAP_TIER2 {
            if present(key) {
                nodes.push(cqap_node(key, vec![last_tier2.clone()], NodeRole::Adjunct));
                last_tier2 = key.to_string();
            }
        }
    }

    if matches!(cls.kind, ClassificationKind::Composite) {
        for key in CQAP_TIER3 {
            if present(key) {
                let mut deps = vec![facts.clone()];
                if last_tier2 != facts {
                    deps.push(last_tier2.clone());
                }
                nodes.push(cqap_node(key, deps, NodeRole::Adjunct));
            }
        }
    }

    let all_names: Vec<String> = nodes.iter().map(|n| n.name.clone()).collect();
    nodes.push(Node {
        name: "finalanswer".to_string(),
        tmpl: "GENERIC".to_string(),
        deps: all_names,
        contract: Contract::for_section("Final Answer", Some(120)),
        role: NodeRole::Backbone,
        prompt_override: None,
    });

    Some(Plan {
        nodes: validate_and_repair_plan(nodes),
    })
}

const CQAP_META_PROMPT: &str = "Perform a cognitive query analysis. Respond with a single JSON \
object whose keys are a subset of: goal, obstacles, facts, precision, toneanalysis, \
structuralrelationships, boundaryanalysis, embeddedassumptions, knowledgegaps, \
factreflectionseparation, uncertainty, responsestrategy, rationale.\n\nQuery:\n{q}\n";

/// Bounded CQAP meta-analysis phase: one call, and on unparseable output one
/// repair retry appending a terse correction instruction; gives up (returning
/// `None`) after that.
pub async fn cqap_meta_analysis(
    planner: &dyn PlannerLlm,
    query: &str,
    timeout: Duration,
) -> Option<serde_json::Value> {
    let mut kwargs = HashMap::new();
    kwargs.insert("q", query.to_string());
    let prompt = fmt(CQAP_META_PROMPT, &kwargs);

    for attempt in 0..2 {
        let sent = if attempt == 0 {
            prompt.clone()
        } else {
            format!("{prompt}\nYour previous reply was not valid JSON. Reply with ONLY the JSON object.")
        };
        let Ok(raw) = planner.complete(&sent, 0.0, timeout).await else {
            continue;
        };
        let Some(blob) = first_json_object(&raw) else {
            continue;
        };
        if let Some(v) = safe_json_parse::<serde_json::Value>(blob) {
            if v.is_object() {
                return Some(v);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BlackboardError;
    use async_trait::async_trait;

    struct StaticLlm(String);

    #[async_trait]
    impl PlannerLlm for StaticLlm {
        async fn complete(&self, _prompt: &str, _temperature: f64, _timeout: Duration) -> Result<String> {
            Ok(self.0.clone())
        }
    }

    struct FailingLlm;

    #[async_trait]
    impl PlannerLlm for FailingLlm {
        async fn complete(&self, _prompt: &str, _temperature: f64, _timeout: Duration) -> Result<String> {
            Err(BlackboardError::Other("boom".to_string()))
        }
    }

    #[test]
    fn classify_query_flags_atomic_for_short_question() {
        let cls = classify_query("What is 2+2?");
        assert_eq!(cls.kind, ClassificationKind::Atomic);
    }

    #[test]
    fn classify_query_flags_composite_for_dense_planning_prose() {
        let q = "Design the architecture and roadmap: first draft a spec, then \
                  benchmark trade-offs, then evaluate the protocol after comparing \
                  alternatives and implementing a prototype.\n\
                  - stage one\n- stage two\n- stage three";
        let cls = classify_query(q);
        assert_eq!(cls.kind, ClassificationKind::Composite);
    }

    #[tokio::test]
    async fn classify_query_llm_falls_back_to_heuristic_on_llm_error() {
        let cls = classify_query_llm("What is 2+2?", &FailingLlm, Duration::from_secs(1)).await;
        assert_eq!(cls.kind, ClassificationKind::Atomic);
    }

    #[test]
    fn validate_and_repair_plan_breaks_a_two_cycle() {
        let nodes = vec![
            Node {
                name: "a".into(),
                tmpl: "GENERIC".into(),
                deps: vec!["b".into()],
                contract: Contract::for_section("A", None),
                role: NodeRole::Backbone,
                prompt_override: None,
            },
            Node {
                name: "b".into(),
                tmpl: "GENERIC".into(),
                deps: vec!["a".into()],
                contract: Contract::for_section("B", None),
                role: NodeRole::Backbone,
                prompt_override: None,
            },
        ];
        let repaired = validate_and_repair_plan(nodes);
        assert!(repaired.iter().all(|n| n.deps.is_empty()));
    }

    #[test]
    fn validate_and_repair_plan_drops_forward_references() {
        let nodes = vec![
            Node {
                name: "a".into(),
                tmpl: "GENERIC".into(),
                deps: vec!["b".into()],
                contract: Contract::for_section("A", None),
                role: NodeRole::Backbone,
                prompt_override: None,
            },
            Node {
                name: "b".into(),
                tmpl: "GENERIC".into(),
                deps: vec![],
                contract: Contract::for_section("B", None),
                role: NodeRole::Backbone,
                prompt_override: None,
            },
        ];
        let repaired = validate_and_repair_plan(nodes);
        assert!(repaired[0].deps.is_empty());
    }

    #[tokio::test]
    async fn make_plan_falls_back_to_single_answer_node_on_unparseable_output() {
        let llm = StaticLlm("not json at all".to_string());
        let cls = Classification {
            kind: ClassificationKind::Atomic,
            score: 0.1,
        };
        let plan = make_plan(&llm, "hello", &cls, "").await;
        assert_eq!(plan.nodes.len(), 1);
        assert_eq!(plan.nodes[0].name, "answer");
    }

    #[tokio::test]
    async fn make_plan_dedups_colliding_slugs_and_trims_to_hybrid_bounds() {
        let raw = serde_json::json!({"nodes": [
            {"name": "Step"}, {"name": "Step"}, {"name": "Step"},
            {"name": "Step"}, {"name": "Step"}, {"name": "Step"}
        ]})
        .to_string();
        let llm = StaticLlm(raw);
        let cls = Classification {
            kind: ClassificationKind::Hybrid,
            score: 0.4,
        };
        let plan = make_plan(&llm, "q", &cls, "").await;
        assert_eq!(plan.nodes.len(), 4);
        let names: HashSet<&str> = plan.nodes.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names.len(), plan.nodes.len());
    }

    #[test]
    fn mission_plan_emits_objective_per_stage_and_final_synthesis() {
        let mission = serde_json::json!({
            "query_context": "q",
            "Strategy": [
                {
                    "Objective": "Clarify scope",
                    "queries": {"Q1": "what"},
                    "tactics": [
                        {"t1": "draft brief", "dependencies": [], "expected_artifact": "Brief.md"}
                    ]
                },
                {
                    "Objective": "Design",
                    "tactics": [
                        {"t1": "propose design", "dependencies": ["Brief.md"], "expected_artifact": "Design.md"}
                    ]
                }
            ]
        });
        let plan = mission_plan(&mission).expect("mission should compile");
        assert!(plan.get("final_synthesis").is_some());
        assert!(plan.get("o1_objective").is_some());
        assert!(plan.get("o2_objective").is_some());
        let o2_t1 = plan.get("o2_t1").expect("tactic node present");
        assert!(o2_t1.deps.contains(&"o1_t1".to_string()));
    }

    #[test]
    fn cqap_plan_atomic_only_emits_tier1_and_final() {
        let slots = serde_json::json!({
            "goal": "ship the feature",
            "obstacles": "time",
            "facts": "known constraints",
            "uncertainty": "ignored at atomic tier"
        });
        let cls = Classification {
            kind: ClassificationKind::Atomic,
            score: 0.1,
        };
        let plan = cqap_plan(&slots, &cls).expect("cqap should compile");
        assert!(plan.get("uncertainty").is_none());
        assert!(plan.get("finalanswer").is_some());
    }

    #[test]
    fn cqap_plan_composite_includes_all_tiers() {
        let slots = serde_json::json!({
            "goal": "g", "obstacles": "o", "facts": "f",
            "structuralrelationships": "s", "uncertainty": "u"
        });
        let cls = Classification {
            kind: ClassificationKind::Composite,
            score: 0.8,
        };
        let plan = cqap_plan(&slots, &cls).expect("cqap should compile");
        assert!(plan.get("structuralrelationships").is_some());
        assert!(plan.get("uncertainty").is_some());
    }
}
