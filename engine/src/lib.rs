//! Reasoning orchestrator library: query classification, DAG plan
//! compilation, hedged concurrent execution under quality contracts, and
//! k-line memory. Flat `src/` with one directory per subsystem and a thin
//! aggregator here.

pub mod adapter;
pub mod config;
pub mod error;
pub mod executor;
pub mod judges;
pub mod memory;
pub mod orchestrator;
pub mod planner;
pub mod solver;
pub mod types;
pub mod util;

pub use config::Config;
pub use error::{BlackboardError, Result};
pub use memory::MemoryStore;
pub use orchestrator::{run, OrchestratorResult};
pub use solver::{PlannerLlm, Solver};
