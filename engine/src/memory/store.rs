//! `MemoryStore`: one JSON file backing judge weights, patch stats, k-line
//! history, beliefs, and self-models. Every public method takes the same
//! process-wide `tokio::sync::Mutex`-guarded state.

use crate::error::{BlackboardError, Result};
use crate::types::{
    Belief, BeliefClaim, Classification, Contract, KlineEntry, KlineHit, KlineNodeSnapshot,
    KlineTrace, Node, Provenance,
};
use crate::util::embed::{cosine, dequantize, hash_embed, quantize};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tracing::{info, warn};

const CLUSTER_MIN_SIM: f64 = 0.4;
const CLUSTER_LINK_WEIGHT: f64 = 0.9;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PatchStat {
    pub ok: u64,
    pub fail: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct MemoryData {
    #[serde(default)]
    judges: HashMap<String, f64>,
    #[serde(default)]
    patch_stats: HashMap<String, PatchStat>,
    #[serde(default)]
    klines: HashMap<String, KlineEntry>,
    #[serde(default)]
    beliefs: HashMap<String, Belief>,
    #[serde(default)]
    self_models: HashMap<String, serde_json::Value>,
}

/// Per-run updates folded into a k-line entry by [`MemoryStore::upsert_kline`].
#[derive(Debug, Clone, Default)]
pub struct KlineUpdate {
    pub nodes: Option<Vec<KlineNodeSnapshot>>,
    pub ok_nodes: Option<Vec<String>>,
    pub global_recs: Option<Vec<String>>,
    pub run_id: Option<String>,
}

pub struct MemoryStore {
    path: PathBuf,
    data: Mutex<MemoryData>,
}

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

fn belief_id(subject: &str, predicate: &str, object: &str, polarity: bool) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!(
        "{subject}|{predicate}|{object}|{}",
        polarity as u8
    ));
    hasher
        .finalize()
        .iter()
        .take(8)
        .map(|b| format!("{b:02x}"))
        .collect()
}

fn ensure_embedding(entry: &KlineEntry, dim: usize) -> Vec<f64> {
    if let Some(q) = &entry.embedding_q {
        return dequantize(q);
    }
    if let Some(q) = &entry.query {
        return hash_embed(q, dim);
    }
    vec![0.0; dim]
}

fn form_clusters(data: &mut MemoryData, dim: usize) {
    let sigs: Vec<String> = data.klines.keys().cloned().collect();
    let embeddings: HashMap<String, Vec<f64>> = sigs
        .iter()
        .map(|s| (s.clone(), ensure_embedding(&data.klines[s], dim)))
        .collect();

    for i in 0..sigs.len() {
        for j in (i + 1)..sigs.len() {
            let sim = cosine(&embeddings[&sigs[i]], &embeddings[&sigs[j]]);
            if sim >= CLUSTER_MIN_SIM {
                let weight = sim * CLUSTER_LINK_WEIGHT;
                link_pair(data, &sigs[i], &sigs[j], weight);
            }
        }
    }
}

fn link_pair(data: &mut MemoryData, a: &str, b: &str, weight: f64) {
    if let Some(e) = data.klines.get_mut(a) {
        let cur = e.links.get(b).copied().unwrap_or(0.0);
        e.links.insert(b.to_string(), cur.max(weight));
    }
    if let Some(e) = data.klines.get_mut(b) {
        let cur = e.links.get(a).copied().unwrap_or(0.0);
        e.links.insert(a.to_string(), cur.max(weight));
    }
}

fn prune_klines(data: &mut MemoryData, max_entries: usize) {
    if data.klines.len() <= max_entries {
        return;
    }
    let mut by_age: Vec<(String, f64)> = data
        .klines
        .iter()
        .map(|(k, v)| (k.clone(), v.ts))
        .collect();
    by_age.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
    let to_remove = data.klines.len() - max_entries;
    for (sig, _) in by_age.into_iter().take(to_remove) {
        data.klines.remove(&sig);
    }
}

impl MemoryStore {
    /// Load from `path`, moving a malformed file aside with a `.corrupt`
    /// suffix and starting fresh rather than failing the run.
    pub async fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let data = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => match serde_json::from_str::<MemoryData>(&raw) {
                Ok(d) => d,
                Err(e) => {
                    warn!(error = %e, path = %path.display(), "memory file is corrupt, moving aside");
                    let corrupt = PathBuf::from(format!("{}.corrupt", path.display()));
                    let _ = tokio::fs::rename(&path, &corrupt).await;
                    MemoryData::default()
                }
            },
            Err(_) => MemoryData::default(),
        };
        MemoryStore {
            path,
            data: Mutex::new(data),
        }
    }

    /// Serialize to a temp file then atomically rename over `path`.
    pub async fn save(&self) -> Result<()> {
        let data = self.data.lock().await;
        let tmp = PathBuf::from(format!("{}.tmp", self.path.display()));
        let raw = serde_json::to_string_pretty(&*data)
            .map_err(|e| BlackboardError::Memory(e.to_string()))?;
        tokio::fs::write(&tmp, raw)
            .await
            .map_err(|e| BlackboardError::Memory(e.to_string()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| BlackboardError::Memory(e.to_string()))?;
        Ok(())
    }

    // ---- judge weights ----------------------------------------------

    pub async fn bump_judge(&self, name: &str, delta: f64) -> f64 {
        let weight = {
            let mut d = self.data.lock().await;
            let w = d.judges.entry(name.to_string()).or_insert(1.0);
            *w = (*w + delta).clamp(0.1, 3.0);
            *w
        };
        let _ = self.save().await;
        weight
    }

    pub async fn get_judge_weight(&self, name: &str) -> f64 {
        self.data
            .lock()
            .await
            .judges
            .get(name)
            .copied()
            .unwrap_or(1.0)
    }

    // ---- patch stats ---------------------------------------------------

    pub async fn record_patch(&self, kind: &str, ok: bool) {
        {
            let mut d = self.data.lock().await;
            let stat = d.patch_stats.entry(kind.to_string()).or_default();
            if ok {
                stat.ok += 1;
            } else {
                stat.fail += 1;
            }
        }
        let _ = self.save().await;
    }

    // ---- beliefs ---------------------------------------------------

    pub async fn add_beliefs(
        &self,
        claims: &[BeliefClaim],
        sig: &str,
        node: &str,
        run_id: &str,
    ) {
        {
            let mut d = self.data.lock().await;
            let ts = now_secs();
            for c in claims {
                let id = belief_id(&c.subject, &c.predicate, &c.object, c.polarity);
                let confidence = c.confidence.unwrap_or(0.6);
                let prov = Provenance {
                    sig: sig.to_string(),
                    node: node.to_string(),
                    run_id: run_id.to_string(),
                    ts,
                };
                d.beliefs
                    .entry(id.clone())
                    .and_modify(|b| {
                        b.confidence = b.confidence.max(confidence);
                        b.provenance.push(prov.clone());
                    })
                    .or_insert_with(|| Belief {
                        id: id.clone(),
                        subject: c.subject.clone(),
                        predicate: c.predicate.clone(),
                        object: c.object.clone(),
                        polarity: c.polarity,
                        confidence,
                        provenance: vec![prov],
                    });
            }
        }
        let _ = self.save().await;
    }

    /// Pairs of beliefs sharing (subject, predicate, object) but disagreeing
    /// on polarity, optionally scoped to beliefs whose provenance names `sig`.
    pub async fn detect_belief_conflicts(&self, scope_sig: Option<&str>) -> Vec<(Belief, Belief)> {
        let d = self.data.lock().await;
        let mut groups: HashMap<(String, String, String), Vec<&Belief>> = HashMap::new();
        for b in d.beliefs.values() {
            if let Some(sig) = scope_sig {
                if !b.provenance.iter().any(|p| p.sig == sig) {
                    continue;
                }
            }
            let key = (
                b.subject.to_lowercase(),
                b.predicate.to_lowercase(),
                b.object.clone(),
            );
            groups.entry(key).or_default().push(b);
        }
        let mut conflicts = Vec::new();
        for group in groups.values() {
            for i in 0..group.len() {
                for j in (i + 1)..group.len() {
                    if group[i].polarity != group[j].polarity {
                        conflicts.push((group[i].clone(), group[j].clone()));
                    }
                }
            }
        }
        conflicts
    }

    // ---- k-lines: basic access ---------------------------------------

    pub async fn get_kline(&self, sig: &str) -> Option<KlineEntry> {
        self.data.lock().await.klines.get(sig).cloned()
    }

    pub async fn put_kline(&self, sig: &str, entry: KlineEntry) {
        {
            let mut d = self.data.lock().await;
            d.klines.insert(sig.to_string(), entry);
        }
        let _ = self.save().await;
    }

    pub async fn iter_klines(&self) -> Vec<(String, KlineEntry)> {
        self.data
            .lock()
            .await
            .klines
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub async fn penalize_kline(&self, sig: &str) {
        {
            let mut d = self.data.lock().await;
            if let Some(e) = d.klines.get_mut(sig) {
                e.penalty += 1;
            }
        }
        let _ = self.save().await;
    }

    pub async fn link_klines(&self, a: &str, b: &str, weight: f64) {
        {
            let mut d = self.data.lock().await;
            link_pair(&mut d, a, b, weight);
        }
        let _ = self.save().await;
    }

    pub async fn cluster_retrieve(&self, sig: &str, max_neighbors: usize) -> Vec<(String, f64)> {
        let d = self.data.lock().await;
        let Some(entry) = d.klines.get(sig) else {
            return Vec::new();
        };
        let mut neighbors: Vec<(String, f64)> =
            entry.links.iter().map(|(k, v)| (k.clone(), *v)).collect();
        neighbors.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        neighbors.truncate(max_neighbors);
        for (neighbor, weight) in &neighbors {
            info!(target: "audit", sig, neighbor = %neighbor, weight, "cluster_recall");
        }
        neighbors
    }

    pub async fn explain_recall(&self, sig: &str) -> Option<serde_json::Value> {
        let d = self.data.lock().await;
        let entry = d.klines.get(sig)?;
        let out = serde_json::json!({
            "query": entry.query,
            "classification": entry.classification,
            "ts": entry.ts,
            "penalty": entry.penalty,
            "links": entry.links,
        });
        info!(target: "audit", sig, "explain_recall");
        Some(out)
    }

    /// Merge `update` into the entry at `sig`, recompute its embedding when
    /// `query` is given, re-cluster, prune to `max_entries`, and persist.
    pub async fn upsert_kline(
        &self,
        sig: &str,
        update: KlineUpdate,
        query: Option<&str>,
        classification: Option<Classification>,
        dim: usize,
        max_entries: usize,
    ) {
        {
            let mut d = self.data.lock().await;
            let entry = d.klines.entry(sig.to_string()).or_default();
            if let Some(nodes) = update.nodes {
                entry.nodes = nodes;
            }
            if let Some(ok) = update.ok_nodes {
                entry.ok_nodes = ok;
            }
            if let Some(recs) = update.global_recs {
                entry.global_recs = recs;
            }
            if let Some(rid) = update.run_id {
                entry.run_id = Some(rid);
            }
            if let Some(q) = query {
                entry.embedding_q = Some(quantize(&hash_embed(q, dim)));
                entry.query = Some(q.to_string());
            }
            if let Some(c) = classification {
                entry.classification = Some(c);
            }
            entry.ts = now_secs();
            form_clusters(&mut d, dim);
            prune_klines(&mut d, max_entries);
        }
        let _ = self.save().await;
    }

    /// Rank stored entries against `text`'s hashed embedding, then expand the
    /// result through the cluster graph per the retrieval recipe.
    pub async fn query_klines(
        &self,
        text: &str,
        top_k: usize,
        min_sim: f64,
        dim: usize,
    ) -> Vec<KlineHit> {
        let d = self.data.lock().await;
        let query_emb = hash_embed(text, dim);

        let embeddings: HashMap<String, Vec<f64>> = d
            .klines
            .iter()
            .map(|(sig, entry)| (sig.clone(), ensure_embedding(entry, dim)))
            .collect();

        let mut candidates: Vec<(String, f64)> = embeddings
            .iter()
            .map(|(sig, emb)| (sig.clone(), cosine(&query_emb, emb)))
            .filter(|(_, sim)| *sim >= min_sim)
            .collect();
        candidates.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        candidates.truncate(top_k.max(1));

        let mut hits: Vec<KlineHit> = candidates
            .into_iter()
            .map(|(sig, sim)| {
                let mut cscore = sim;
                if let Some(entry) = d.klines.get(&sig) {
                    for (neighbor_sig, weight) in &entry.links {
                        if let Some(nemb) = embeddings.get(neighbor_sig) {
                            cscore += 0.1 * weight * cosine(&query_emb, nemb);
                        }
                    }
                }
                KlineHit { sig, sim, cscore }
            })
            .collect();
        hits.sort_by(|a, b| b.cscore.partial_cmp(&a.cscore).unwrap_or(std::cmp::Ordering::Equal));

        let max_len = 4 * top_k.max(1);
        let mut seen: HashSet<String> = hits.iter().map(|h| h.sig.clone()).collect();
        let mut frontier: Vec<(String, f64, u32)> =
            hits.iter().map(|h| (h.sig.clone(), h.cscore, 0u32)).collect();

        let mut i = 0;
        while i < frontier.len() && hits.len() < max_len {
            let (sig, score, depth) = frontier[i].clone();
            i += 1;
            if depth >= 3 {
                continue;
            }
            let Some(entry) = d.klines.get(&sig) else {
                continue;
            };
            if entry.level >= 1 {
                for child in &entry.children {
                    if hits.len() >= max_len || seen.contains(child) || !d.klines.contains_key(child) {
                        continue;
                    }
                    seen.insert(child.clone());
                    let child_score = score * 0.98;
                    let child_sim = embeddings.get(child).map(|e| cosine(&query_emb, e)).unwrap_or(0.0);
                    hits.push(KlineHit {
                        sig: child.clone(),
                        sim: child_sim,
                        cscore: child_score,
                    });
                    frontier.push((child.clone(), child_score, depth + 1));
                }
            }
            for neighbor_sig in entry.links.keys() {
                if hits.len() >= max_len
                    || seen.contains(neighbor_sig)
                    || !d.klines.contains_key(neighbor_sig)
                {
                    continue;
                }
                seen.insert(neighbor_sig.clone());
                let neighbor_score = score * 0.97;
                let neighbor_sim = embeddings
                    .get(neighbor_sig)
                    .map(|e| cosine(&query_emb, e))
                    .unwrap_or(0.0);
                hits.push(KlineHit {
                    sig: neighbor_sig.clone(),
                    sim: neighbor_sim,
                    cscore: neighbor_score,
                });
                frontier.push((neighbor_sig.clone(), neighbor_score, depth + 1));
            }
        }

        hits.sort_by(|a, b| b.cscore.partial_cmp(&a.cscore).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(max_len);
        hits
    }

    /// Compact hint block from a retrieval result: average similarity, the
    /// most common plan shapes, frequently-weak node names, top global
    /// recommendations, and classification-kind mix, capped at `char_budget`.
    pub async fn summarize_neighbors(&self, hits: &[KlineHit], char_budget: usize) -> String {
        if hits.is_empty() {
            return String::new();
        }
        let d = self.data.lock().await;
        let avg_sim: f64 = hits.iter().map(|h| h.sim).sum::<f64>() / hits.len() as f64;

        let mut shape_counts: HashMap<String, usize> = HashMap::new();
        let mut weak_counts: HashMap<String, usize> = HashMap::new();
        let mut rec_counts: HashMap<String, usize> = HashMap::new();
        let mut kind_counts: HashMap<String, usize> = HashMap::new();

        for hit in hits {
            let Some(entry) = d.klines.get(&hit.sig) else {
                continue;
            };
            let shape = entry
                .nodes
                .iter()
                .map(|n| n.name.as_str())
                .collect::<Vec<_>>()
                .join(">");
            if !shape.is_empty() {
                *shape_counts.entry(shape).or_insert(0) += 1;
            }
            let ok: HashSet<&str> = entry.ok_nodes.iter().map(|s| s.as_str()).collect();
            for n in &entry.nodes {
                if !ok.contains(n.name.as_str()) {
                    *weak_counts.entry(n.name.clone()).or_insert(0) += 1;
                }
            }
            for rec in &entry.global_recs {
                *rec_counts.entry(rec.clone()).or_insert(0) += 1;
            }
            if let Some(c) = &entry.classification {
                *kind_counts.entry(c.kind.to_string()).or_insert(0) += 1;
            }
        }

        let mut shapes: Vec<_> = shape_counts.into_iter().collect();
        shapes.sort_by(|a, b| b.1.cmp(&a.1));
        shapes.truncate(2);

        let mut weak: Vec<_> = weak_counts.into_iter().collect();
        weak.sort_by(|a, b| b.1.cmp(&a.1));
        weak.truncate(5);

        let mut recs: Vec<_> = rec_counts.into_iter().collect();
        recs.sort_by(|a, b| b.1.cmp(&a.1));
        recs.truncate(5);

        let mut kinds: Vec<_> = kind_counts.into_iter().collect();
        kinds.sort_by(|a, b| b.1.cmp(&a.1));

        let mut out = format!("avg_sim={avg_sim:.2}");
        if !shapes.is_empty() {
            let s = shapes
                .iter()
                .map(|(s, n)| format!("{s} (x{n})"))
                .collect::<Vec<_>>()
                .join("; ");
            out.push_str(&format!("\nshapes: {s}"));
        }
        if !weak.is_empty() {
            let w = weak
                .iter()
                .map(|(n, c)| format!("{n} (x{c})"))
                .collect::<Vec<_>>()
                .join(", ");
            out.push_str(&format!("\nweak nodes: {w}"));
        }
        if !recs.is_empty() {
            let r = recs.iter().map(|(r, _)| r.clone()).collect::<Vec<_>>().join("; ");
            out.push_str(&format!("\nrecommendations: {r}"));
        }
        if !kinds.is_empty() {
            let k = kinds
                .iter()
                .map(|(k, n)| format!("{k}:{n}"))
                .collect::<Vec<_>>()
                .join(", ");
            out.push_str(&format!("\nkinds: {k}"));
        }

        if out.len() > char_budget {
            let mut end = char_budget.min(out.len());
            while end > 0 && !out.is_char_boundary(end) {
                end -= 1;
            }
            out.truncate(end);
        }
        out
    }

    // ---- trace replay / promotion ---------------------------------------

    pub async fn append_kline_trace(&self, sig: &str, trace: KlineTrace) {
        {
            let mut d = self.data.lock().await;
            if let Some(e) = d.klines.get_mut(sig) {
                e.traces.push(trace);
            }
        }
        let _ = self.save().await;
    }

    /// Reconstruct [`Node`]s from the latest trace (falling back to the
    /// legacy `nodes` field), silently skipping anything that can't be
    /// turned back into a usable node.
    pub async fn replay_kline(&self, sig: &str) -> Option<Vec<Node>> {
        let d = self.data.lock().await;
        let entry = d.klines.get(sig)?;
        let snapshots: &[KlineNodeSnapshot] = if let Some(last) = entry.traces.last() {
            &last.nodes
        } else if !entry.nodes.is_empty() {
            &entry.nodes
        } else {
            return None;
        };

        let nodes: Vec<Node> = snapshots
            .iter()
            .filter(|s| !s.name.is_empty())
            .map(|s| Node {
                name: s.name.clone(),
                tmpl: if s.tmpl.is_empty() {
                    "GENERIC".to_string()
                } else {
                    s.tmpl.clone()
                },
                deps: s.deps.clone(),
                contract: s.contract.clone(),
                role: s.role,
                prompt_override: s.prompt_override.clone(),
            })
            .collect();

        if nodes.is_empty() {
            None
        } else {
            info!(target: "audit", sig, node_count = nodes.len(), "trace_replay");
            Some(nodes)
        }
    }

    /// Create/update a synthetic composite parent over `child_sigs`.
    pub async fn promote_kline(&self, parent_sig: &str, child_sigs: &[String]) {
        {
            let mut d = self.data.lock().await;
            let max_child_level = child_sigs
                .iter()
                .filter_map(|s| d.klines.get(s))
                .map(|e| e.level)
                .max()
                .unwrap_or(0);
            let parent = d.klines.entry(parent_sig.to_string()).or_default();
            for c in child_sigs {
                if !parent.children.contains(c) {
                    parent.children.push(c.clone());
                }
            }
            parent.level = max_child_level + 1;
            parent.ts = now_secs();
        }
        let _ = self.save().await;
    }

    // ---- self-models ---------------------------------------------------

    pub async fn get_self_model(&self, sig: &str) -> Option<serde_json::Value> {
        self.data.lock().await.self_models.get(sig).cloned()
    }

    pub async fn store_self_model(&self, sig: &str, model: serde_json::Value) {
        {
            let mut d = self.data.lock().await;
            d.self_models.insert(sig.to_string(), model);
        }
        let _ = self.save().await;
    }
}
