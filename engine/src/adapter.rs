//! The thin façade external callers go through instead of the core directly:
//! a mission-embedding convention for carrying a structured mission alongside
//! a free-text task, and a best-effort JSON planning helper for callers that
//! only have a raw backend completion to work with.

use crate::planner;
use crate::solver::PlannerLlm;
use crate::types::{Classification, ClassificationKind, Plan};
use crate::util::first_json_object;
use std::time::Duration;

/// Bit-exact delimiter opening a mission block embedded in a task string.
pub const MISSION_JSON_START: &str = "<<<MISSION_JSON>>>";
/// Bit-exact delimiter closing a mission block embedded in a task string.
pub const MISSION_JSON_END: &str = "<<<END_MISSION>>>";

/// Prepends `mission`, wrapped between the bit-exact delimiter tokens, to
/// `task`. Each delimiter sits alone on its own line.
pub fn embed_mission(task: &str, mission: &serde_json::Value) -> String {
    format!(
        "{MISSION_JSON_START}\n{}\n{MISSION_JSON_END}\n{task}",
        serde_json::to_string(mission).unwrap_or_else(|_| "{}".to_string())
    )
}

/// Strips a previously embedded mission block out of `task`, returning the
/// remaining text and the parsed mission JSON, if one was present. Tolerant
/// of surrounding whitespace; absence of either delimiter is not an error,
/// it just means there's no mission.
pub fn extract_mission(task: &str) -> (String, Option<serde_json::Value>) {
    let Some(start) = task.find(MISSION_JSON_START) else {
        return (task.to_string(), None);
    };
    let body_start = start + MISSION_JSON_START.len();
    let Some(end_rel) = task[body_start..].find(MISSION_JSON_END) else {
        return (task.to_string(), None);
    };
    let end = body_start + end_rel;
    let blob = task[body_start..end].trim();
    let mission = serde_json::from_str(blob).ok();
    let remainder_start = end + MISSION_JSON_END.len();
    let mut remainder = String::new();
    remainder.push_str(task[..start].trim_end());
    remainder.push_str(task[remainder_start..].trim_start_matches(['\n', '\r']));
    (remainder.trim().to_string(), mission)
}

/// The lesser of what the caller asked for and what this façade allows,
/// plus a small grace period so a caller-side timeout doesn't race the
/// adapter's own and lose by a hair.
pub fn compose_timeout(requested: Duration, configured_max: Duration, grace: Duration) -> Duration {
    requested.min(configured_max) + grace
}

/// Deterministic fallback when a backend's raw completion can't be turned
/// into anything structured: a single-stage mission wrapping the whole
/// query as one objective.
fn heuristic_mission_plan(query: &str) -> Plan {
    let cls = Classification {
        kind: ClassificationKind::Atomic,
        score: 0.0,
    };
    let mission = serde_json::json!({
        "Strategy": [{
            "Objective": query,
            "tactics": [],
        }]
    });
    planner::mission_plan(&mission).unwrap_or_else(|| {
        Plan {
            nodes: vec![crate::types::Node {
                name: "answer".to_string(),
                tmpl: "GENERIC".to_string(),
                deps: vec![],
                contract: crate::types::Contract::for_section("Answer", Some(80)),
                role: crate::types::NodeRole::Backbone,
                prompt_override: None,
            }],
        }
    })
}

/// Best-effort JSON planning for callers that only hold a raw backend and a
/// query: ask it directly for a DAG-shaped or mission-shaped JSON object,
/// normalize whichever comes back, and fall back to a deterministic
/// heuristic mission on any failure. Unlike [`planner::make_plan`], this
/// never calls back into the classifier or k-line memory — it's meant for
/// contexts that only have a bare completion function.
pub async fn plan_from_backend(
    backend: &dyn PlannerLlm,
    query: &str,
    timeout: Duration,
) -> Plan {
    let prompt = format!(
        "Decompose the following request into either a mission (a \"Strategy\" array of \
        objective stages) or a flat dependency graph (a \"nodes\" array). Respond with a \
        single JSON object in one of those two shapes.\n\nRequest:\n{query}\n"
    );
    let Ok(raw) = backend.complete(&prompt, 0.0, timeout).await else {
        return heuristic_mission_plan(query);
    };
    let Some(blob) = first_json_object(&raw) else {
        return heuristic_mission_plan(query);
    };
    let Ok(value) = serde_json::from_str::<serde_json::Value>(blob) else {
        return heuristic_mission_plan(query);
    };

    if let Some(plan) = planner::mission_plan(&value) {
        return plan;
    }
    if let Some(nodes) = value.get("nodes").and_then(|n| n.as_array()) {
        if !nodes.is_empty() {
            let compiled = planner::compile_raw_nodes(nodes);
            return Plan {
                nodes: planner::validate_and_repair_plan(compiled),
            };
        }
    }
    heuristic_mission_plan(query)
}
