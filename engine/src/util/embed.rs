//! Deterministic hashed embeddings, quantization, and cosine similarity.
//!
//! No external model: every token and adjacent bigram hashes into a fixed
//! dimension via BLAKE2b (8-byte digest).

use blake2::digest::{Update, VariableOutput};
use blake2::Blake2bVar;
use once_cell::sync::Lazy;
use regex::Regex;

pub const DEFAULT_DIM: usize = 256;

static TOKEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"[a-z0-9]+").unwrap());
static WS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

fn blake2b8(s: &str) -> u64 {
    let mut hasher = Blake2bVar::new(8).expect("8-byte output is valid for blake2b");
    hasher.update(s.as_bytes());
    let mut out = [0u8; 8];
    hasher.finalize_variable(&mut out).expect("fixed-size output buffer");
    u64::from_be_bytes(out)
}

fn accumulate(vec: &mut [f64], dim: usize, token: &str) {
    let h = blake2b8(token);
    let idx = (h as usize) % dim;
    let sign = if h & 1 == 1 { 1.0 } else { -1.0 };
    vec[idx] += sign;
}

/// Hash `text` into an L2-normalized `dim`-dimensional vector. Deterministic:
/// `hash_embed(s, d) == hash_embed(s, d)` for any `s`, `d`.
pub fn hash_embed(text: &str, dim: usize) -> Vec<f64> {
    let lowered = text.trim().to_lowercase();
    let collapsed = WS.replace_all(&lowered, " ");
    let toks: Vec<&str> = TOKEN.find_iter(&collapsed).map(|m| m.as_str()).collect();
    if toks.is_empty() {
        return vec![0.0; dim];
    }

    let mut vec = vec![0.0_f64; dim];
    for (i, t) in toks.iter().enumerate() {
        accumulate(&mut vec, dim, t);
        if i + 1 < toks.len() {
            let bigram = format!("{}_{}", t, toks[i + 1]);
            accumulate(&mut vec, dim, &bigram);
        }
    }

    let norm = vec.iter().map(|v| v * v).sum::<f64>().sqrt();
    let norm = if norm == 0.0 { 1.0 } else { norm };
    vec.into_iter().map(|v| v / norm).collect()
}

/// Cosine similarity of two equal-length vectors, clamped to [-1, 1].
pub fn cosine(a: &[f64], b: &[f64]) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let num: f64 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let na: f64 = a.iter().map(|x| x * x).sum::<f64>().sqrt();
    let nb: f64 = b.iter().map(|y| y * y).sum::<f64>().sqrt();
    let denom = na * nb;
    if denom == 0.0 {
        0.0
    } else {
        (num / denom).clamp(-1.0, 1.0)
    }
}

/// Clamp to [-1,1], scale by 127, round to int8. Used only for on-disk storage.
pub fn quantize(v: &[f64]) -> Vec<i8> {
    v.iter()
        .map(|x| {
            let clamped = x.clamp(-1.0, 1.0);
            let scaled = (clamped * 127.0).round();
            scaled.clamp(-127.0, 127.0) as i8
        })
        .collect()
}

/// Inverse of [`quantize`].
pub fn dequantize(q: &[i8]) -> Vec<f64> {
    q.iter().map(|x| *x as f64 / 127.0).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_embed_is_deterministic() {
        let a = hash_embed("The quick brown fox", DEFAULT_DIM);
        let b = hash_embed("The quick brown fox", DEFAULT_DIM);
        assert_eq!(a, b);
        let sim = cosine(&a, &b);
        assert!(sim >= 0.999 && sim <= 1.0, "sim={sim}");
    }

    #[test]
    fn hash_embed_is_l2_normalized() {
        let v = hash_embed("some reasonably long sentence with many tokens", DEFAULT_DIM);
        let norm: f64 = v.iter().map(|x| x * x).sum::<f64>().sqrt();
        assert!((norm - 1.0).abs() < 1e-9 || norm == 0.0);
    }

    #[test]
    fn empty_text_yields_zero_vector() {
        let v = hash_embed("   ", 16);
        assert_eq!(v, vec![0.0; 16]);
    }

    #[test]
    fn quantize_roundtrip_is_close() {
        let v = hash_embed("quantization roundtrip test query", DEFAULT_DIM);
        let q = quantize(&v);
        let back = dequantize(&q);
        let diff: f64 = v
            .iter()
            .zip(back.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f64>()
            .sqrt();
        assert!(diff < 0.02, "l2 distance={diff}");
    }

    #[test]
    fn cosine_of_orthogonal_like_vectors_is_bounded() {
        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0];
        assert_eq!(cosine(&a, &b), 0.0);
    }
}
