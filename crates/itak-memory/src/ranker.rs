//! Hybrid result ranking: BM25, reciprocal-rank fusion, weighted re-score.

use itak_core::MemoryId;
use std::collections::HashMap;

/// RRF dampening constant, the usual 60 from the literature.
const RRF_K: f32 = 60.0;

/// One fused search hit.
#[derive(Debug, Clone, PartialEq)]
pub struct RankedHit {
    /// The entry.
    pub id: MemoryId,
    /// Final weighted score.
    pub score: f32,
    /// Reciprocal-rank fusion score, kept as the tie-breaker.
    pub rrf: f32,
}

/// BM25 over a small candidate set, scoring each document against the
/// query terms. Document frequencies come from the candidate set itself.
/// Scores are normalized to `[0, 1]` within the set.
#[must_use]
#[allow(clippy::cast_precision_loss, clippy::arithmetic_side_effects)]
pub fn bm25_scores(terms: &[String], docs: &[(MemoryId, String)]) -> Vec<(MemoryId, f32)> {
    const K1: f32 = 1.2;
    const B: f32 = 0.75;

    if docs.is_empty() || terms.is_empty() {
        return Vec::new();
    }

    let tokenized: Vec<(MemoryId, Vec<String>)> = docs
        .iter()
        .map(|(id, content)| {
            let tokens: Vec<String> = content
                .to_lowercase()
                .split(|c: char| !c.is_alphanumeric())
                .filter(|t| !t.is_empty())
                .map(String::from)
                .collect();
            (*id, tokens)
        })
        .collect();

    let n = tokenized.len() as f32;
    let avgdl = tokenized.iter().map(|(_, t)| t.len() as f32).sum::<f32>() / n;

    // Document frequency per term.
    let mut df: HashMap<&str, f32> = HashMap::new();
    for term in terms {
        let count = tokenized
            .iter()
            .filter(|(_, tokens)| tokens.iter().any(|t| t == term))
            .count() as f32;
        df.insert(term.as_str(), count);
    }

    let mut scored: Vec<(MemoryId, f32)> = tokenized
        .iter()
        .map(|(id, tokens)| {
            let dl = tokens.len() as f32;
            let mut score = 0.0f32;
            for term in terms {
                let tf = tokens.iter().filter(|t| *t == term).count() as f32;
                if tf == 0.0 {
                    continue;
                }
                let d = df.get(term.as_str()).copied().unwrap_or(0.0);
                let idf = ((n - d + 0.5) / (d + 0.5) + 1.0).ln();
                score += idf * (tf * (K1 + 1.0)) / (tf + K1 * (1.0 - B + B * dl / avgdl.max(1.0)));
            }
            (*id, score)
        })
        .collect();

    let max = scored.iter().map(|(_, s)| *s).fold(0.0f32, f32::max);
    if max > 0.0 {
        for (_, s) in &mut scored {
            *s /= max;
        }
    }
    scored.retain(|(_, s)| *s > 0.0);
    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    scored
}

/// Merge three ranked legs with reciprocal-rank fusion, then re-score with
/// the configured weights and truncate to `k`. Each leg's scores must be
/// roughly `[0, 1]`-normalized before fusion.
#[must_use]
#[allow(clippy::cast_precision_loss, clippy::arithmetic_side_effects)]
pub fn fuse(
    vector: &[(MemoryId, f32)],
    bm25: &[(MemoryId, f32)],
    graph: &[(MemoryId, f32)],
    weights: (f32, f32, f32),
    k: usize,
) -> Vec<RankedHit> {
    let (alpha, beta, gamma) = weights;
    let mut merged: HashMap<MemoryId, RankedHit> = HashMap::new();

    for (leg, weight) in [(vector, alpha), (bm25, beta), (graph, gamma)] {
        for (rank, (id, score)) in leg.iter().enumerate() {
            let entry = merged.entry(*id).or_insert(RankedHit {
                id: *id,
                score: 0.0,
                rrf: 0.0,
            });
            entry.score += weight * score.clamp(-1.0, 1.0);
            entry.rrf += 1.0 / (RRF_K + rank as f32 + 1.0);
        }
    }

    let mut hits: Vec<RankedHit> = merged.into_values().collect();
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(
                b.rrf
                    .partial_cmp(&a.rrf)
                    .unwrap_or(std::cmp::Ordering::Equal),
            )
    });
    hits.truncate(k);
    hits
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bm25_prefers_matching_docs() {
        let relevant = MemoryId::new();
        let noise = MemoryId::new();
        let docs = vec![
            (relevant, "the VPS port is 48920".to_string()),
            (noise, "grocery list: apples and bread".to_string()),
        ];
        let scored = bm25_scores(&["vps".to_string(), "port".to_string()], &docs);
        assert_eq!(scored.len(), 1);
        assert_eq!(scored[0].0, relevant);
        assert!((scored[0].1 - 1.0).abs() < 1e-6);
    }

    #[test]
    fn fuse_combines_legs_with_weights() {
        let a = MemoryId::new();
        let b = MemoryId::new();
        // `a` leads the vector leg, `b` leads bm25; vector carries more
        // weight so `a` must win.
        let hits = fuse(
            &[(a, 0.9), (b, 0.2)],
            &[(b, 1.0)],
            &[],
            (0.5, 0.3, 0.2),
            10,
        );
        assert_eq!(hits[0].id, a);
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn fuse_deduplicates_by_id() {
        let a = MemoryId::new();
        let hits = fuse(&[(a, 1.0)], &[(a, 1.0)], &[(a, 1.0)], (0.5, 0.3, 0.2), 10);
        assert_eq!(hits.len(), 1);
        assert!((hits[0].score - 1.0).abs() < 1e-6);
    }

    #[test]
    fn fuse_truncates_to_k() {
        let ids: Vec<MemoryId> = (0..5).map(|_| MemoryId::new()).collect();
        let leg: Vec<(MemoryId, f32)> = ids.iter().map(|id| (*id, 0.5)).collect();
        let hits = fuse(&leg, &[], &[], (0.5, 0.3, 0.2), 3);
        assert_eq!(hits.len(), 3);
    }
}
