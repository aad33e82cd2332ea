//! Local JSON-backed memory: judge weights, patch stats, k-line history,
//! beliefs, and self-models. See [`store::MemoryStore`].

mod store;

pub use store::{KlineUpdate, MemoryStore};
