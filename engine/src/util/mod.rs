//! Text sanitation, safe-JSON extraction, hashed embeddings, rate limiting,
//! QA test running, and patch application — the leaf utilities every other
//! component depends on.

pub mod embed;
pub mod json;
pub mod qa;
pub mod ratelimit;
pub mod text;
pub mod tokens;

pub use embed::{cosine, dequantize, hash_embed, quantize};
pub use json::{first_json_object, safe_json_parse};
pub use qa::{apply_patches, run_tests};
pub use ratelimit::GlobalRateLimiter;
pub use text::{ensure_header, fmt, sanitize_text, slug, word_count};
pub use tokens::{approx_tokens, clip_chars};
