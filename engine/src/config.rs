//! Orchestrator configuration: every field is env-var-driven with a
//! documented default; each field's doc comment names the exact environment
//! variable it reads.

use std::env;
use std::time::Duration;

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .map(|v| matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(default)
}

#[derive(Debug, Clone)]
pub struct Config {
    /// `LOCAL_CONCURRENT` — node tasks running at once. Default 4.
    pub concurrent: usize,
    /// `MAX_ROUNDS` — improvement-loop rounds before SHORT_CIRCUIT. Default 2.
    pub max_rounds: u32,
    /// `MIN_SCORE` — stability check's acceptance floor. Default 0.7.
    pub min_score: f64,
    /// `MAX_TOKENS_PER_NODE` — per-node token budget. Default 4000.
    pub max_tokens_per_node: u64,
    /// `MAX_TOKENS_PER_RUN` — per-run token budget. Default 20000.
    pub max_tokens_per_run: u64,
    /// `NODE_TIMEOUT_SEC` — per-solve timeout for node generation. Default 80s.
    pub node_timeout: Duration,
    /// `JUDGE_TIMEOUT_SEC` — per-judge critique timeout. Default 10s.
    pub judge_timeout: Duration,

    /// `ENABLE_LLM_JUDGE` — include the optional LLM judge. Default false.
    pub enable_llm_judge: bool,
    /// `APPLY_NODE_RECS` — apply per-node recommendations after the loop. Default true.
    pub apply_node_recs: bool,
    /// `APPLY_GLOBAL_RECS` — apply cohesion recommendations. Default true.
    pub apply_global_recs: bool,
    /// `HEDGE_ENABLE` — issue a duplicate solve after `hedge_delay`. Default true.
    pub hedge_enable: bool,
    /// `HEDGE_DELAY_SEC` — delay before the backup hedge call. Default 0.8s.
    pub hedge_delay: Duration,

    /// `KLINE_ENABLE` — consult/persist k-line memory. Default true.
    pub kline_enable: bool,
    /// `KLINE_TOP_K` — neighbors considered per retrieval. Default 4.
    pub kline_top_k: usize,
    /// `KLINE_MIN_SIM` — minimum cosine similarity to retrieve. Default 0.25.
    pub kline_min_sim: f64,
    /// `KLINE_HINT_TOKENS` — char/4 budget for the neighbor-hint block. Default 500.
    pub kline_hint_tokens: u64,
    /// `KLINE_EMBED_DIM` — hashed-embedding dimension. Default 256.
    pub kline_embed_dim: usize,
    /// `KLINE_MAX_ENTRIES` — pruning cap for the k-line store. Default 2000.
    pub kline_max_entries: usize,

    /// `GLOBAL_MAX_CONCURRENT` — rate limiter concurrency bound. Default 32.
    pub global_max_concurrent: usize,
    /// `GLOBAL_QPS` — rate limiter sliding-window budget. Default 16.
    pub global_qps: usize,
    /// `GLOBAL_BURST_WINDOW` — rate limiter window, seconds. Default 0.5s.
    pub global_burst_window: Duration,
    /// `AUDIT_MAX_CHARS` — truncation budget for audit-log payloads. Default 16384.
    pub audit_max_chars: usize,

    /// `USE_CQAP` — allow the CQAP plan compiler. Default true.
    pub use_cqap: bool,
    /// `USE_LLM_CQAP` — obtain a CQAP meta-analysis from the planner LLM. Default true.
    pub use_llm_cqap: bool,
    /// `PLAN_FROM_META` — prefer the mission compiler when a mission is present. Default true.
    pub plan_from_meta: bool,
    /// `USE_LLM_CLASSIFIER` — classify via the planner LLM, else heuristic-only. Default true.
    pub use_llm_classifier: bool,

    /// Whether the dense-final enrichment pass runs after cohesion. Default true.
    pub dense_final_enable: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            concurrent: env_or("LOCAL_CONCURRENT", 4),
            max_rounds: env_or("MAX_ROUNDS", 2),
            min_score: env_or("MIN_SCORE", 0.7),
            max_tokens_per_node: env_or("MAX_TOKENS_PER_NODE", 4000),
            max_tokens_per_run: env_or("MAX_TOKENS_PER_RUN", 20_000),
            node_timeout: Duration::from_secs_f64(env_or("NODE_TIMEOUT_SEC", 80.0)),
            judge_timeout: Duration::from_secs_f64(env_or("JUDGE_TIMEOUT_SEC", 10.0)),

            enable_llm_judge: env_bool("ENABLE_LLM_JUDGE", false),
            apply_node_recs: env_bool("APPLY_NODE_RECS", true),
            apply_global_recs: env_bool("APPLY_GLOBAL_RECS", true),
            hedge_enable: env_bool("HEDGE_ENABLE", true),
            hedge_delay: Duration::from_secs_f64(env_or("HEDGE_DELAY_SEC", 0.8)),

            kline_enable: env_bool("KLINE_ENABLE", true),
            kline_top_k: env_or("KLINE_TOP_K", 4),
            kline_min_sim: env_or("KLINE_MIN_SIM", 0.25),
            kline_hint_tokens: env_or("KLINE_HINT_TOKENS", 500),
            kline_embed_dim: env_or("KLINE_EMBED_DIM", 256),
            kline_max_entries: env_or("KLINE_MAX_ENTRIES", 2000),

            global_max_concurrent: env_or("GLOBAL_MAX_CONCURRENT", 32),
            global_qps: env_or("GLOBAL_QPS", 16),
            global_burst_window: Duration::from_secs_f64(env_or("GLOBAL_BURST_WINDOW", 0.5)),
            audit_max_chars: env_or("AUDIT_MAX_CHARS", 16384),

            use_cqap: env_bool("USE_CQAP", true),
            use_llm_cqap: env_bool("USE_LLM_CQAP", true),
            plan_from_meta: env_bool("PLAN_FROM_META", true),
            use_llm_classifier: env_bool("USE_LLM_CLASSIFIER", true),

            dense_final_enable: env_bool("DENSE_FINAL_ENABLE", true),
        }
    }
}
