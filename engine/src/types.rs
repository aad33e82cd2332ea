//! Core data model: the shapes passed between every other module, kept in
//! one dependency-free module rather than scattered across their consumers.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Coarse-grained scope estimate for a query.
///
/// Atomic = single deliverable, Hybrid = 2-4 interacting deliverables,
/// Composite = multi-phase plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationKind {
    Atomic,
    Hybrid,
    Composite,
}

impl std::fmt::Display for ClassificationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ClassificationKind::Atomic => "Atomic",
            ClassificationKind::Hybrid => "Hybrid",
            ClassificationKind::Composite => "Composite",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Classification {
    pub kind: ClassificationKind,
    pub score: f64,
}

impl Classification {
    /// Plan-size bounds implied by this classification (min, max), inclusive.
    pub fn size_bounds(&self) -> (usize, usize) {
        match self.kind {
            ClassificationKind::Atomic => (1, 1),
            ClassificationKind::Hybrid => (2, 4),
            ClassificationKind::Composite => (4, 8),
        }
    }
}

/// A single acceptance test drawn from a closed set of kinds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestSpec {
    pub kind: TestKind,
    pub arg: TestArg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestKind {
    Nonempty,
    Regex,
    Contains,
    WordCountMin,
    HeaderPresent,
}

/// A test argument: most tests carry a string, `word_count_min` carries a count.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TestArg {
    Text(String),
    Count(usize),
}

impl TestArg {
    pub fn as_text(&self) -> String {
        match self {
            TestArg::Text(s) => s.clone(),
            TestArg::Count(n) => n.to_string(),
        }
    }

    pub fn as_count(&self, default: usize) -> usize {
        match self {
            TestArg::Count(n) => *n,
            TestArg::Text(s) => s.parse().unwrap_or(default),
        }
    }
}

/// Per-node acceptance specification.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Contract {
    pub format: HashMap<String, String>,
    pub tests: Vec<TestSpec>,
}

impl Contract {
    /// The contract's declared `markdown_section`, if present.
    pub fn markdown_section(&self) -> Option<&str> {
        self.format.get("markdown_section").map(|s| s.as_str())
    }

    /// Build a contract requiring a header and optionally a minimum word count.
    ///
    /// Every Contract carries at least one `nonempty` test and a
    /// `header_present` test for its section, per the data-model invariant.
    pub fn for_section(section: &str, min_words: Option<usize>) -> Self {
        let mut format = HashMap::new();
        format.insert("markdown_section".to_string(), section.to_string());
        let mut tests = vec![
            TestSpec {
                kind: TestKind::Nonempty,
                arg: TestArg::Text(String::new()),
            },
            TestSpec {
                kind: TestKind::HeaderPresent,
                arg: TestArg::Text(section.to_string()),
            },
        ];
        if let Some(n) = min_words {
            tests.push(TestSpec {
                kind: TestKind::WordCountMin,
                arg: TestArg::Count(n),
            });
        }
        Contract { format, tests }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    Backbone,
    Adjunct,
}

/// A single typed node in a Plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub tmpl: String,
    pub deps: Vec<String>,
    pub contract: Contract,
    pub role: NodeRole,
    #[serde(default)]
    pub prompt_override: Option<String>,
}

/// Ordered list of nodes; order encodes "earlier in the plan".
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Plan {
    pub nodes: Vec<Node>,
}

impl Plan {
    pub fn get(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.name == name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactStatus {
    Ok,
    NeedsMoreDepth,
    Failed,
    Bypassed,
}

/// An issue surfaced by the QA test runner, with optional suggested patches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    pub code: String,
    #[serde(default)]
    pub details: HashMap<String, String>,
    #[serde(default)]
    pub suggested: Vec<Patch>,
}

impl Issue {
    pub fn new(code: &str) -> Self {
        Issue {
            code: code.to_string(),
            details: HashMap::new(),
            suggested: Vec::new(),
        }
    }

    pub fn with_detail(mut self, key: &str, value: impl ToString) -> Self {
        self.details.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_patch(mut self, patch: Patch) -> Self {
        self.suggested.push(patch);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QaResult {
    pub ok: bool,
    pub issues: Vec<Issue>,
}

/// A correction to apply to node content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Patch {
    pub kind: PatchKind,
    pub arg: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchKind {
    InsertHeader,
    AppendText,
    PrependText,
    RegexSub,
}

/// Advisory judge output; acceptance depends on QA, never on this score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Critique {
    pub score: f64,
    pub comments: String,
    pub guidance: HashMap<String, f64>,
}

impl Critique {
    /// The neutral critique returned when a judge times out or panics.
    pub fn neutral() -> Self {
        Critique {
            score: 0.7,
            comments: String::new(),
            guidance: HashMap::new(),
        }
    }
}

/// The generated content for one node, plus its QA/critique metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub node: String,
    pub content: String,
    pub qa: QaResult,
    pub critiques: Vec<Critique>,
    pub status: ArtifactStatus,
    pub recommendations: Vec<String>,
}

/// Result returned by a solver backend call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolverResult {
    pub text: String,
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
}

impl SolverResult {
    pub fn text_only(text: impl Into<String>) -> Self {
        SolverResult {
            text: text.into(),
            prompt_tokens: None,
            completion_tokens: None,
            total_tokens: None,
        }
    }
}

/// Context passed alongside a solve call; keys observed by the core per §6.
pub type SolveContext = HashMap<String, String>;

pub mod solve_mode {
    pub const NODE: &str = "node";
    pub const NODE_RECOMMEND: &str = "node_recommend";
    pub const NODE_APPLY: &str = "node_apply";
    pub const JUDGE: &str = "judge";
    pub const COHESION: &str = "cohesion";
    pub const COHESION_APPLY: &str = "cohesion_apply";
    pub const DENSE_FINAL: &str = "dense_final";
    pub const CONTRADICTION_RESOLUTION: &str = "contradiction_resolution";
    pub const IMPROVE_ROUND: &str = "improve_round";
}

/// A belief extracted from node content: (subject, predicate, object, polarity).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BeliefClaim {
    pub subject: String,
    pub predicate: String,
    pub object: String,
    #[serde(default = "default_true")]
    pub polarity: bool,
    #[serde(default)]
    pub confidence: Option<f64>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Provenance {
    pub sig: String,
    pub node: String,
    pub run_id: String,
    pub ts: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Belief {
    pub id: String,
    pub subject: String,
    pub predicate: String,
    pub object: String,
    pub polarity: bool,
    pub confidence: f64,
    pub provenance: Vec<Provenance>,
}

/// A single k-line link, by signature, with a clustering weight.
pub type KlineLinks = HashMap<String, f64>;

/// A record of a prior run, keyed by a signature of (classification, normalized query).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KlineEntry {
    pub query: Option<String>,
    pub classification: Option<Classification>,
    pub ts: f64,
    /// int8-quantized hashed embedding; the full-precision copy is never stored.
    pub embedding_q: Option<Vec<i8>>,
    pub nodes: Vec<KlineNodeSnapshot>,
    pub ok_nodes: Vec<String>,
    pub global_recs: Vec<String>,
    pub links: KlineLinks,
    pub penalty: u32,
    pub level: u32,
    pub children: Vec<String>,
    pub traces: Vec<KlineTrace>,
    pub run_id: Option<String>,
}

impl Default for KlineEntry {
    fn default() -> Self {
        KlineEntry {
            query: None,
            classification: None,
            ts: 0.0,
            embedding_q: None,
            nodes: Vec::new(),
            ok_nodes: Vec::new(),
            global_recs: Vec::new(),
            links: HashMap::new(),
            penalty: 0,
            level: 0,
            children: Vec::new(),
            traces: Vec::new(),
            run_id: None,
        }
    }
}

/// Enough of a [`Node`] to reconstruct it on replay: name, template, deps,
/// role, contract, and any prompt override.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KlineNodeSnapshot {
    pub name: String,
    pub tmpl: String,
    pub role: NodeRole,
    pub deps: Vec<String>,
    pub contract: Contract,
    #[serde(default)]
    pub prompt_override: Option<String>,
}

impl From<&Node> for KlineNodeSnapshot {
    fn from(n: &Node) -> Self {
        KlineNodeSnapshot {
            name: n.name.clone(),
            tmpl: n.tmpl.clone(),
            role: n.role,
            deps: n.deps.clone(),
            contract: n.contract.clone(),
            prompt_override: n.prompt_override.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KlineTrace {
    pub ts: f64,
    pub nodes: Vec<KlineNodeSnapshot>,
}

/// A retrieval hit: (signature, similarity, cluster-adjusted score).
#[derive(Debug, Clone)]
pub struct KlineHit {
    pub sig: String,
    pub sim: f64,
    pub cscore: f64,
}
