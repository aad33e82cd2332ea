//! End-to-end scenarios driving the orchestrator through its public API with
//! mock solvers and planners: an atomic single-node run, a hybrid plan with
//! inter-node dependencies, cycle repair, node-failure bypass, k-line replay
//! after a planner failure, and cross-artifact contradiction resolution.

use async_trait::async_trait;
use blackboard::error::{BlackboardError, Result};
use blackboard::judges::default_registry;
use blackboard::memory::{KlineUpdate, MemoryStore};
use blackboard::orchestrator::{self, RunOptions};
use blackboard::solver::{EchoSolver, PlannerLlm, Solver, TemplatePlannerLlm};
use blackboard::types::{
    Classification, ClassificationKind, Contract, KlineNodeSnapshot, KlineTrace, Node, NodeRole,
    Plan, SolveContext, SolverResult,
};
use blackboard::util::GlobalRateLimiter;
use blackboard::Config;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

fn fast_config() -> Config {
    let mut c = Config::default();
    c.node_timeout = Duration::from_secs(5);
    c.judge_timeout = Duration::from_secs(5);
    c.hedge_delay = Duration::from_millis(5);
    c.max_rounds = 6;
    c.global_qps = 1000;
    c.global_max_concurrent = 64;
    c
}

async fn fresh_memory(label: &str) -> Arc<MemoryStore> {
    let path = std::env::temp_dir().join(format!(
        "blackboard_scenario_{label}_{}_{}.json",
        std::process::id(),
        rand_suffix(),
    ));
    let _ = tokio::fs::remove_file(&path).await;
    Arc::new(MemoryStore::load(path).await)
}

fn rand_suffix() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().subsec_nanos() as u64
}

fn fresh_limiter() -> Arc<GlobalRateLimiter> {
    Arc::new(GlobalRateLimiter::new(64, 1000, Duration::from_millis(100)))
}

/// Always proposes a single backbone node named "answer" with section "Answer".
struct SingleAnswerPlanner;

#[async_trait]
impl PlannerLlm for SingleAnswerPlanner {
    async fn complete(&self, _prompt: &str, _temperature: f64, _timeout: Duration) -> Result<String> {
        Ok(r#"{"nodes":[{"name":"answer","tmpl":"GENERIC","deps":[],"role":"backbone",
            "contract":{"format":{"markdown_section":"Answer"},
            "tests":[{"kind":"nonempty","arg":""},{"kind":"header_present","arg":"Answer"}]}}]}"#
            .to_string())
    }
}

#[tokio::test]
async fn atomic_echo_produces_a_single_answer_section() {
    let opts = RunOptions {
        query: "What is 2+2?",
        solver: Arc::new(EchoSolver),
        planner_llm: Arc::new(SingleAnswerPlanner),
        memory: fresh_memory("atomic").await,
        judges: Arc::new(default_registry()),
        limiter: fresh_limiter(),
        config: fast_config(),
        skip_mission_meta: true,
    };
    let result = orchestrator::run(opts).await.expect("run should succeed");

    assert_eq!(result.classification.kind, ClassificationKind::Atomic);
    assert_eq!(result.plan.nodes.len(), 1);
    let artifact = &result.artifacts["answer"];
    assert_eq!(artifact.status, blackboard::types::ArtifactStatus::Ok);
    assert!(result.final_document.to_lowercase().contains("## answer"));
    assert!(result.final_document.contains("What is 2+2?"));
}

/// Proposes analysis -> answer -> examples with the dependency/content
/// contracts a hybrid plan needs.
struct HybridPlanner;

#[async_trait]
impl PlannerLlm for HybridPlanner {
    async fn complete(&self, _prompt: &str, _temperature: f64, _timeout: Duration) -> Result<String> {
        Ok(r#"{"nodes":[
            {"name":"analysis","tmpl":"GENERIC","deps":[],"role":"backbone",
             "contract":{"format":{"markdown_section":"Analysis"},
               "tests":[{"kind":"nonempty","arg":""}]}},
            {"name":"answer","tmpl":"GENERIC","deps":["analysis"],"role":"backbone",
             "contract":{"format":{"markdown_section":"Final Answer"},
               "tests":[{"kind":"nonempty","arg":""}]}},
            {"name":"examples","tmpl":"GENERIC","deps":["answer"],"role":"adjunct",
             "contract":{"format":{"markdown_section":"Examples"},
               "tests":[{"kind":"nonempty","arg":""}]}}
        ]}"#
        .to_string())
    }
}

#[tokio::test]
async fn hybrid_plan_composes_all_sections_in_order_with_dependency_content() {
    let opts = RunOptions {
        query: "Compare optimistic and pessimistic locking, then give an example.",
        solver: Arc::new(EchoSolver),
        planner_llm: Arc::new(HybridPlanner),
        memory: fresh_memory("hybrid").await,
        judges: Arc::new(default_registry()),
        limiter: fresh_limiter(),
        config: fast_config(),
        skip_mission_meta: true,
    };
    let result = orchestrator::run(opts).await.expect("run should succeed");

    assert_eq!(result.plan.nodes.len(), 3);
    for status in ["analysis", "answer", "examples"] {
        assert_eq!(
            result.artifacts[status].status,
            blackboard::types::ArtifactStatus::Ok,
            "node {status} did not reach ok"
        );
    }
    assert!(result.artifacts["answer"].content.to_lowercase().contains("analysis"));

    let doc = result.final_pre_cohesion.to_lowercase();
    let pos_analysis = doc.find("## analysis").expect("Analysis header present");
    let pos_answer = doc.find("## final answer").expect("Final Answer header present");
    let pos_examples = doc.find("## examples").expect("Examples header present");
    assert!(pos_analysis < pos_answer && pos_answer < pos_examples);

    let divider_count = result.final_pre_cohesion.matches("\n\n---\n\n").count();
    assert_eq!(
        divider_count, 2,
        "expected a `---` divider between each of the three sections"
    );
}

#[tokio::test]
async fn a_two_node_cycle_is_repaired_and_both_nodes_still_run() {
    let plan = Plan {
        nodes: vec![
            Node {
                name: "a".into(),
                tmpl: "GENERIC".into(),
                deps: vec!["b".into()],
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
        ],
    };
    let repaired = blackboard::planner::validate_and_repair_plan(plan.nodes);
    assert!(repaired.iter().all(|n| n.deps.is_empty()));

    let repaired_plan = Plan { nodes: repaired };
    let config = fast_config();
    let blackboard_map = blackboard::executor::execute_plan(
        &repaired_plan,
        Arc::new(EchoSolver),
        Arc::new(default_registry()),
        fresh_memory("cycle").await,
        fresh_limiter(),
        &config,
        "q",
        |_| {},
    )
    .await;
    assert_eq!(blackboard_map["a"].status, blackboard::types::ArtifactStatus::Ok);
    assert_eq!(blackboard_map["b"].status, blackboard::types::ArtifactStatus::Ok);
}

struct AlwaysFailsForTarget {
    target: String,
}

#[async_trait]
impl Solver for AlwaysFailsForTarget {
    async fn solve(&self, task: &str, context: &SolveContext) -> Result<SolverResult> {
        let node = context.get("node").cloned().unwrap_or_default();
        if node == self.target {
            return Err(BlackboardError::Other("forced node failure".to_string()));
        }
        EchoSolver.solve(task, context).await
    }
}

#[tokio::test]
async fn a_failing_middle_node_is_bypassed_and_the_chain_still_finishes() {
    let plan = Plan {
        nodes: vec![
            Node {
                name: "x".into(),
                tmpl: "GENERIC".into(),
                deps: vec![],
                contract: Contract::for_section("X", Some(1)),
                role: NodeRole::Backbone,
                prompt_override: None,
            },
            Node {
                name: "y".into(),
                tmpl: "GENERIC".into(),
                deps: vec!["x".into()],
                contract: Contract::for_section("Y", Some(1)),
                role: NodeRole::Backbone,
                prompt_override: None,
            },
            Node {
                name: "z".into(),
                tmpl: "GENERIC".into(),
                deps: vec!["y".into()],
                contract: Contract::for_section("Z", Some(1)),
                role: NodeRole::Backbone,
                prompt_override: None,
            },
        ],
    };
    let solver = Arc::new(AlwaysFailsForTarget {
        target: "y".to_string(),
    });
    let config = fast_config();
    let blackboard_map = blackboard::executor::execute_plan(
        &plan,
        solver,
        Arc::new(default_registry()),
        fresh_memory("bypass").await,
        fresh_limiter(),
        &config,
        "q",
        |_| {},
    )
    .await;

    assert_eq!(blackboard_map["y"].status, blackboard::types::ArtifactStatus::Bypassed);
    assert_eq!(blackboard_map["y"].content, "");
    assert_eq!(blackboard_map["z"].status, blackboard::types::ArtifactStatus::Ok);
}

struct AlwaysFailsPlanner;

#[async_trait]
impl PlannerLlm for AlwaysFailsPlanner {
    async fn complete(&self, _prompt: &str, _temperature: f64, _timeout: Duration) -> Result<String> {
        Err(BlackboardError::Other("planner backend unavailable".to_string()))
    }
}

#[tokio::test]
async fn a_stored_plan_is_replayed_when_the_planner_fails() {
    let query = "Draft a five-stage migration plan for the billing service.";
    let memory = fresh_memory("replay").await;

    let stored_nodes = vec![
        Node {
            name: "n1".into(),
            tmpl: "GENERIC".into(),
            deps: vec![],
            contract: Contract::for_section("Stage One", Some(1)),
            role: NodeRole::Backbone,
            prompt_override: None,
        },
        Node {
            name: "n2".into(),
            tmpl: "GENERIC".into(),
            deps: vec!["n1".into()],
            contract: Contract::for_section("Stage Two", Some(1)),
            role: NodeRole::Backbone,
            prompt_override: None,
        },
        Node {
            name: "n3".into(),
            tmpl: "GENERIC".into(),
            deps: vec!["n2".into()],
            contract: Contract::for_section("Stage Three", Some(1)),
            role: NodeRole::Backbone,
            prompt_override: None,
        },
        Node {
            name: "n4".into(),
            tmpl: "GENERIC".into(),
            deps: vec!["n3".into()],
            contract: Contract::for_section("Stage Four", Some(1)),
            role: NodeRole::Adjunct,
            prompt_override: None,
        },
        Node {
            name: "n5".into(),
            tmpl: "GENERIC".into(),
            deps: vec!["n4".into()],
            contract: Contract::for_section("Stage Five", Some(1)),
            role: NodeRole::Adjunct,
            prompt_override: None,
        },
    ];
    let snapshots: Vec<KlineNodeSnapshot> = stored_nodes.iter().map(KlineNodeSnapshot::from).collect();
    let names: Vec<String> = stored_nodes.iter().map(|n| n.name.clone()).collect();
    let sig = "replaytestsig001";

    memory
        .upsert_kline(
            sig,
            KlineUpdate {
                nodes: Some(snapshots.clone()),
                ok_nodes: Some(names.clone()),
                global_recs: Some(vec![]),
                run_id: Some("prior-run".to_string()),
            },
            Some(query),
            Some(Classification {
                kind: ClassificationKind::Composite,
                score: 0.9,
            }),
            256,
            2000,
        )
        .await;
    memory
        .append_kline_trace(
            sig,
            KlineTrace {
                ts: 0.0,
                nodes: snapshots,
            },
        )
        .await;

    let mut config = fast_config();
    config.use_llm_cqap = false;
    config.use_cqap = false;
    config.plan_from_meta = false;

    let opts = RunOptions {
        query,
        solver: Arc::new(EchoSolver),
        planner_llm: Arc::new(AlwaysFailsPlanner),
        memory: memory.clone(),
        judges: Arc::new(default_registry()),
        limiter: fresh_limiter(),
        config,
        skip_mission_meta: true,
    };
    let result = orchestrator::run(opts).await.expect("run should succeed via replay");

    let replayed_names: HashSet<String> = result.plan.nodes.iter().map(|n| n.name.clone()).collect();
    assert_eq!(replayed_names, names.into_iter().collect());
    assert_eq!(result.plan.nodes.len(), 5);
}

struct ContradictingSolver;

#[async_trait]
impl Solver for ContradictingSolver {
    async fn solve(&self, task: &str, context: &SolveContext) -> Result<SolverResult> {
        let node = context.get("node").cloned().unwrap_or_default();
        let text = match node.as_str() {
            "claim_a" => "## Claim A\n\nSystem is distributed across regions.\n".to_string(),
            "claim_b" => "## Claim B\n\nSystem is not distributed; it runs as a single process.\n".to_string(),
            _ => format!("## {node}\n\n{task}\n"),
        };
        Ok(SolverResult {
            total_tokens: Some((text.len() as u64 / 4).max(1)),
            ..SolverResult::text_only(text)
        })
    }
}

struct TwoClaimsPlanner;

#[async_trait]
impl PlannerLlm for TwoClaimsPlanner {
    async fn complete(&self, _prompt: &str, _temperature: f64, _timeout: Duration) -> Result<String> {
        Ok(r#"{"nodes":[
            {"name":"claim_a","tmpl":"GENERIC","deps":[],"role":"backbone",
             "contract":{"format":{"markdown_section":"Claim A"},
               "tests":[{"kind":"nonempty","arg":""},{"kind":"header_present","arg":"Claim A"}]}},
            {"name":"claim_b","tmpl":"GENERIC","deps":[],"role":"backbone",
             "contract":{"format":{"markdown_section":"Claim B"},
               "tests":[{"kind":"nonempty","arg":""},{"kind":"header_present","arg":"Claim B"}]}}
        ]}"#
        .to_string())
    }
}

#[tokio::test]
async fn contradicting_nodes_produce_a_resolution_subsection() {
    let opts = RunOptions {
        query: "Compare the system's deployment topology before and after migration.",
        solver: Arc::new(ContradictingSolver),
        planner_llm: Arc::new(TwoClaimsPlanner),
        memory: fresh_memory("contradiction").await,
        judges: Arc::new(default_registry()),
        limiter: fresh_limiter(),
        config: fast_config(),
        skip_mission_meta: true,
    };
    let result = orchestrator::run(opts).await.expect("run should succeed");

    assert_eq!(result.conflicts.len(), 1);
    assert_eq!(result.conflicts[0].2, "system");
    assert!(result.final_pre_cohesion.contains("## Contradiction Resolution"));
    assert!(result.final_pre_cohesion.contains("### System"));
}

#[tokio::test]
async fn mock_template_planner_produces_a_three_node_backbone_plan() {
    let opts = RunOptions {
        query: "Compare how the scheduler balances load before and after scaling out across workers.",
        solver: Arc::new(EchoSolver),
        planner_llm: Arc::new(TemplatePlannerLlm),
        memory: fresh_memory("template").await,
        judges: Arc::new(default_registry()),
        limiter: fresh_limiter(),
        config: fast_config(),
        skip_mission_meta: true,
    };
    let result = orchestrator::run(opts).await.expect("run should succeed");
    assert_eq!(result.plan.nodes.len(), 3);
    assert!(!result.final_document.is_empty());
}
