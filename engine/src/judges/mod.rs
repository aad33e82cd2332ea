//! Advisory scorers plus the deliberation rule that reconciles them.
//!
//! Structure, Brevity, Consistency, and an optional LLM judge, each scoring
//! a node's content against its contract independently of QA. The `Judge`
//! trait is a narrow async seam, same shape as [`crate::solver::Solver`],
//! so a caller can add judges without touching the scheduler.

use crate::error::Result;
use crate::solver::Solver;
use crate::types::{Contract, Critique, SolveContext};
use crate::util::{first_json_object, safe_json_parse};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

#[async_trait]
pub trait Judge: Send + Sync {
    fn name(&self) -> &'static str;
    async fn critique(&self, text: &str, contract: &Contract) -> Critique;
}

/// Registered judges, in registration order.
#[derive(Default)]
pub struct JudgeRegistry {
    judges: Vec<Box<dyn Judge>>,
}

impl JudgeRegistry {
    pub fn new() -> Self {
        JudgeRegistry { judges: Vec::new() }
    }

    pub fn register(&mut self, judge: Box<dyn Judge>) {
        self.judges.push(judge);
    }

    pub fn get_all(&self) -> &[Box<dyn Judge>] {
        &self.judges
    }
}

/// The default registry: Structure, Brevity, Consistency, with the optional
/// LLM judge added by the caller when `config.enable_llm_judge` is set.
pub fn default_registry() -> JudgeRegistry {
    let mut reg = JudgeRegistry::new();
    reg.register(Box::new(StructureJudge));
    reg.register(Box::new(BrevityJudge));
    reg.register(Box::new(ConsistencyJudge));
    reg
}

pub struct StructureJudge;

#[async_trait]
impl Judge for StructureJudge {
    fn name(&self) -> &'static str {
        "structure"
    }

    async fn critique(&self, text: &str, contract: &Contract) -> Critique {
        let desired = contract.markdown_section().unwrap_or("").trim();
        let mut score = 0.85;
        let mut comments = Vec::new();
        let mut guidance = HashMap::new();
        guidance.insert("structure".to_string(), 0.0);
        guidance.insert("brevity".to_string(), 0.0);
        guidance.insert("evidence".to_string(), 0.0);

        if !desired.is_empty() {
            let (ok, _) = crate::util::ensure_header(text, desired);
            if !ok {
                score -= 0.2;
                *guidance.get_mut("structure").unwrap() += 0.2;
                comments.push(format!("Missing header: '{desired}'."));
            }
        }
        if text.trim().len() < 50 {
            score -= 0.15;
            *guidance.get_mut("evidence").unwrap() += 0.15;
            comments.push("Thin content; add details.".to_string());
        }

        Critique {
            score,
            comments: comments.join(" "),
            guidance,
        }
    }
}

pub struct BrevityJudge;

#[async_trait]
impl Judge for BrevityJudge {
    fn name(&self) -> &'static str {
        "brevity"
    }

    async fn critique(&self, text: &str, _contract: &Contract) -> Critique {
        let words = crate::util::word_count(text);
        let score = if (80..=800).contains(&words) { 0.9 } else { 0.72 };
        let mut guidance = HashMap::new();
        guidance.insert(
            "brevity".to_string(),
            (words as f64 - 440.0).abs() / 360.0,
        );
        Critique {
            score,
            comments: String::new(),
            guidance,
        }
    }
}

static RE_IS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b([A-Za-z][A-Za-z0-9_' -]{0,40}?)\s+is(\s+not)?\b").unwrap());

pub struct ConsistencyJudge;

#[async_trait]
impl Judge for ConsistencyJudge {
    fn name(&self) -> &'static str {
        "consistency"
    }

    async fn critique(&self, text: &str, _contract: &Contract) -> Critique {
        let mut positive: HashSet<String> = HashSet::new();
        let mut negative: HashSet<String> = HashSet::new();
        for cap in RE_IS.captures_iter(text) {
            let subject = cap[1].trim().to_lowercase();
            if subject.is_empty() {
                continue;
            }
            if cap.get(2).is_some() {
                negative.insert(subject);
            } else {
                positive.insert(subject);
            }
        }
        let overlap: Vec<&String> = positive.intersection(&negative).collect();
        let mut guidance = HashMap::new();
        if overlap.is_empty() {
            guidance.insert("structure".to_string(), 0.0);
            Critique {
                score: 0.85,
                comments: String::new(),
                guidance,
            }
        } else {
            let penalty = 0.15 * overlap.len() as f64;
            guidance.insert("structure".to_string(), penalty);
            Critique {
                score: (0.85 - penalty).max(0.3),
                comments: format!(
                    "Contradictory claims about: {}",
                    overlap
                        .iter()
                        .map(|s| s.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
                guidance,
            }
        }
    }
}

const LLM_JUDGE_PROMPT: &str = "Critique the following content against its contract. \
Respond with a single JSON object: {{\"score\": <0..1>, \"comments\": \"...\", \"guidance\": {{...}}}}.\n\n\
Contract: {contract}\n\nContent:\n{text}\n";

/// Optional LLM-backed judge. Runs twice to smooth out flaky scores: if the
/// two runs disagree by more than 0.3, keeps whichever is nearer the neutral
/// 0.7 baseline; otherwise averages both.
pub struct LlmJudge {
    solver: std::sync::Arc<dyn Solver>,
}

impl LlmJudge {
    pub fn new(solver: std::sync::Arc<dyn Solver>) -> Self {
        LlmJudge { solver }
    }

    async fn critique_once(&self, text: &str, contract: &Contract) -> Critique {
        let prompt = LLM_JUDGE_PROMPT
            .replace("{contract}", &format!("{:?}", contract.format))
            .replace("{text}", text);
        let mut ctx: SolveContext = SolveContext::new();
        ctx.insert("mode".to_string(), crate::types::solve_mode::JUDGE.to_string());

        let result: Result<Critique> = async {
            let res = self.solver.solve(&prompt, &ctx).await?;
            let obj = first_json_object(&res.text).unwrap_or_else(|| "{}".to_string());
            #[derive(serde::Deserialize)]
            struct Raw {
                #[serde(default)]
                score: Option<f64>,
                #[serde(default)]
                comments: String,
                #[serde(default)]
                guidance: HashMap<String, f64>,
            }
            let raw: Raw = safe_json_parse(&obj).unwrap_or(Raw {
                score: None,
                comments: String::new(),
                guidance: HashMap::new(),
            });
            Ok(Critique {
                score: raw.score.unwrap_or(0.72),
                comments: raw.comments,
                guidance: raw.guidance,
            })
        }
        .await;

        result.unwrap_or_else(|_| Critique {
            score: 0.68,
            comments: "LLM judge error.".to_string(),
            guidance: HashMap::new(),
        })
    }
}

#[async_trait]
impl Judge for LlmJudge {
    fn name(&self) -> &'static str {
        "llm-judge"
    }

    async fn critique(&self, text: &str, contract: &Contract) -> Critique {
        let first = self.critique_once(text, contract).await;
        let second = self.critique_once(text, contract).await;
        if (first.score - second.score).abs() > 0.3 {
            if (first.score - 0.7).abs() <= (second.score - 0.7).abs() {
                first
            } else {
                second
            }
        } else {
            let mut guidance = first.guidance.clone();
            for (k, v) in &second.guidance {
                let entry = guidance.entry(k.clone()).or_insert(0.0);
                *entry = (*entry + v) / 2.0;
            }
            Critique {
                score: (first.score + second.score) / 2.0,
                comments: first.comments,
                guidance,
            }
        }
    }
}

/// Used when a judge times out or panics.
pub fn timeout_fallback() -> Critique {
    Critique::neutral()
}

/// Run every judge with `timeout`, collapsing timeouts/panics into a neutral
/// critique, and return `(judge_name, critique)` pairs in registration order.
pub async fn run_judges(
    registry: &JudgeRegistry,
    text: &str,
    contract: &Contract,
    timeout: Duration,
) -> Vec<(String, Critique)> {
    let mut out = Vec::with_capacity(registry.get_all().len());
    for judge in registry.get_all() {
        let critique = match tokio::time::timeout(timeout, judge.critique(text, contract)).await {
            Ok(c) => c,
            Err(_) => timeout_fallback(),
        };
        out.push((judge.name().to_string(), critique));
    }
    out
}

/// Reconcile a set of critique scores into one acceptance-independent score:
/// the mean when agreement is tight (stdev < 0.15); else the rounded score
/// with at least 2/3 support; else a weighted mean using stored judge
/// weights.
pub fn deliberate(scored: &[(String, Critique)], weights: &HashMap<String, f64>) -> f64 {
    let scores: Vec<f64> = scored.iter().map(|(_, c)| c.score).collect();
    let n = scores.len();
    if n == 0 {
        return 0.7;
    }
    let mean = scores.iter().sum::<f64>() / n as f64;
    let variance = scores.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n as f64;
    let stdev = variance.sqrt();
    if stdev < 0.15 {
        return mean;
    }

    let mut rounded_counts: HashMap<i64, usize> = HashMap::new();
    for s in &scores {
        *rounded_counts.entry((s * 10.0).round() as i64).or_insert(0) += 1;
    }
    if let Some((&bucket, &count)) = rounded_counts.iter().max_by_key(|(_, c)| **c) {
        if count as f64 / n as f64 >= 2.0 / 3.0 {
            return bucket as f64 / 10.0;
        }
    }

    let mut weighted_sum = 0.0;
    let mut weight_total = 0.0;
    for (name, critique) in scored {
        let w = weights.get(name).copied().unwrap_or(1.0);
        weighted_sum += w * critique.score;
        weight_total += w;
    }
    if weight_total > 0.0 {
        weighted_sum / weight_total
    } else {
        mean
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Contract;

    #[tokio::test]
    async fn structure_judge_penalizes_missing_header() {
        let contract = Contract::for_section("Answer", None);
        let c = StructureJudge.critique("no header here but long enough text padded out", &contract).await;
        assert!(c.score < 0.85);
    }

    #[tokio::test]
    async fn brevity_judge_penalizes_short_text() {
        let contract = Contract::for_section("Answer", None);
        let c = BrevityJudge.critique("short", &contract).await;
        assert_eq!(c.score, 0.72);
    }

    #[tokio::test]
    async fn consistency_judge_flags_direct_contradiction() {
        let contract = Contract::for_section("Answer", None);
        let c = ConsistencyJudge
            .critique("Rust is memory-safe. Later, rust is not memory-safe either.", &contract)
            .await;
        assert!(c.score < 0.85);
    }

    #[test]
    fn deliberate_uses_mean_when_scores_agree() {
        let scored = vec![
            ("structure".to_string(), Critique { score: 0.8, comments: String::new(), guidance: HashMap::new() }),
            ("brevity".to_string(), Critique { score: 0.82, comments: String::new(), guidance: HashMap::new() }),
        ];
        let score = deliberate(&scored, &HashMap::new());
        assert!((score - 0.81).abs() < 0.01);
    }

    #[test]
    fn deliberate_falls_back_to_weighted_mean_on_disagreement() {
        let scored = vec![
            ("structure".to_string(), Critique { score: 0.9, comments: String::new(), guidance: HashMap::new() }),
            ("brevity".to_string(), Critique { score: 0.4, comments: String::new(), guidance: HashMap::new() }),
            ("consistency".to_string(), Critique { score: 0.6, comments: String::new(), guidance: HashMap::new() }),
        ];
        let mut weights = HashMap::new();
        weights.insert("structure".to_string(), 2.0);
        let score = deliberate(&scored, &weights);
        assert!(score > 0.4 && score < 0.9);
    }
}
