//! Hybrid score fusion.
//!
//! Each branch is normalized by its own maximum, the union is keyed by chunk
//! id keeping the best normalized score, then sorted and truncated. A chunk
//! present in both branches never scores below either normalized score.

use std::cmp::Ordering;
use std::collections::HashMap;

use crate::types::{ScoreKind, ScoredChunk};

/// Divide every score by the branch maximum. Branches whose maximum is not a
/// positive finite number are left untouched.
pub fn normalize_by_max(hits: &mut [ScoredChunk]) {
    let max = hits.iter().map(|h| h.score).fold(f32::NEG_INFINITY, f32::max);
    if max.is_finite() && max > 0.0 {
        for hit in hits.iter_mut() {
            hit.score /= max;
        }
    }
}

/// Sort by descending score, ties by id so results are deterministic.
pub fn sort_desc(hits: &mut [ScoredChunk]) {
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.chunk.id.cmp(&b.chunk.id))
    });
}

/// Fuse a vector branch and a keyword branch. Both must carry similarity
/// scores; convert distance branches with [`ScoredChunk::into_similarity`].
pub fn fuse(
    mut vector: Vec<ScoredChunk>,
    mut keyword: Vec<ScoredChunk>,
    k: usize,
) -> Vec<ScoredChunk> {
    normalize_by_max(&mut vector);
    normalize_by_max(&mut keyword);

    let mut by_id: HashMap<String, ScoredChunk> = HashMap::new();
    for hit in vector.into_iter().chain(keyword) {
        by_id
            .entry(hit.chunk.id.clone())
            .and_modify(|old| {
                if hit.score > old.score {
                    old.score = hit.score;
                }
            })
            .or_insert(hit);
    }
    let mut merged: Vec<ScoredChunk> = by_id
        .into_values()
        .map(|mut h| {
            h.score_kind = ScoreKind::Similarity;
            h
        })
        .collect();
    sort_desc(&mut merged);
    merged.truncate(k);
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Chunk;

    fn hit(id: &str, score: f32) -> ScoredChunk {
        ScoredChunk::similarity(Chunk::new(id, ""), score)
    }

    #[test]
    fn fused_score_dominates_each_branch() {
        let vector = vec![hit("a", 0.9), hit("b", 0.45), hit("c", 0.3)];
        let keyword = vec![hit("b", 12.0), hit("d", 6.0)];
        let fused = fuse(vector.clone(), keyword.clone(), 10);

        let mut nv = vector;
        normalize_by_max(&mut nv);
        let mut nk = keyword;
        normalize_by_max(&mut nk);
        for branch_hit in nv.iter().chain(nk.iter()) {
            let f = fused.iter().find(|h| h.chunk.id == branch_hit.chunk.id).expect("present");
            assert!(f.score >= branch_hit.score - 1e-6);
        }
        assert_eq!(fused[0].chunk.id, "a");
        assert!((fused.iter().find(|h| h.chunk.id == "b").expect("b").score - 1.0).abs() < 1e-6);
    }

    #[test]
    fn truncates_to_k() {
        let fused = fuse(vec![hit("a", 1.0), hit("b", 0.5)], vec![hit("c", 2.0)], 2);
        assert_eq!(fused.len(), 2);
        assert!(fused.windows(2).all(|w| w[0].score >= w[1].score));
    }
}
