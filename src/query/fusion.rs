//! Pure scoring helpers: cosine similarity, bounded top-k selection, and
//! the min-max normalized score fusion behind hybrid search.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};

pub(crate) fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

/// Ranked hit; a greater value means a better hit (higher score, then the
/// smaller row id).
#[derive(Clone, Copy, Debug)]
pub(crate) struct ScoredId {
    pub id: i64,
    pub score: f64,
}

impl PartialEq for ScoredId {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ScoredId {}

impl PartialOrd for ScoredId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScoredId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .partial_cmp(&other.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| other.id.cmp(&self.id))
    }
}

/// Size-k min-heap over [`ScoredId`]; the worst survivor is evicted first.
pub(crate) struct TopK {
    heap: BinaryHeap<Reverse<ScoredId>>,
    k: usize,
}

impl TopK {
    pub fn new(k: usize) -> Self {
        Self {
            heap: BinaryHeap::with_capacity(k + 1),
            k,
        }
    }

    pub fn push(&mut self, hit: ScoredId) {
        if self.k == 0 {
            return;
        }
        self.heap.push(Reverse(hit));
        if self.heap.len() > self.k {
            self.heap.pop();
        }
    }

    /// Best-first.
    pub fn into_sorted(self) -> Vec<ScoredId> {
        self.heap
            .into_sorted_vec()
            .into_iter()
            .map(|Reverse(hit)| hit)
            .collect()
    }
}

/// Min-max normalization over the collected candidates; a constant list
/// maps every score to 1.0.
pub(crate) fn min_max_normalize(hits: &[(i64, f64)]) -> HashMap<i64, f64> {
    if hits.is_empty() {
        return HashMap::new();
    }
    let min = hits.iter().map(|(_, s)| *s).fold(f64::INFINITY, f64::min);
    let max = hits.iter().map(|(_, s)| *s).fold(f64::NEG_INFINITY, f64::max);
    let range = max - min;
    hits.iter()
        .map(|(id, score)| {
            let normalized = if range <= f64::EPSILON {
                1.0
            } else {
                (score - min) / range
            };
            (*id, normalized)
        })
        .collect()
}

/// Weighted fusion of the two normalized score lists. A candidate missing
/// from one leg contributes 0 on that side. Ties on the fused score break
/// by vector score, then ascending row id.
pub(crate) fn fuse(
    vector_hits: &[(i64, f64)],
    keyword_hits: &[(i64, f64)],
    alpha: f64,
) -> Vec<ScoredId> {
    let vec_norm = min_max_normalize(vector_hits);
    let kw_norm = min_max_normalize(keyword_hits);
    let mut ids: Vec<i64> = vec_norm.keys().chain(kw_norm.keys()).copied().collect();
    ids.sort_unstable();
    ids.dedup();

    let mut fused: Vec<(ScoredId, f64)> = ids
        .into_iter()
        .map(|id| {
            let v = vec_norm.get(&id).copied().unwrap_or(0.0);
            let k = kw_norm.get(&id).copied().unwrap_or(0.0);
            (
                ScoredId {
                    id,
                    score: alpha * v + (1.0 - alpha) * k,
                },
                v,
            )
        })
        .collect();
    fused.sort_by(|(a, va), (b, vb)| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| vb.partial_cmp(va).unwrap_or(Ordering::Equal))
            .then_with(|| a.id.cmp(&b.id))
    });
    fused.into_iter().map(|(hit, _)| hit).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_of_identical_vectors_is_one() {
        let v = [0.3, -0.5, 0.8];
        assert!((cosine(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_of_orthogonal_vectors_is_zero() {
        assert_eq!(cosine(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
    }

    #[test]
    fn cosine_handles_zero_vector() {
        assert_eq!(cosine(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[test]
    fn top_k_keeps_best_and_breaks_ties_by_id() {
        let mut top = TopK::new(2);
        top.push(ScoredId { id: 5, score: 0.5 });
        top.push(ScoredId { id: 2, score: 0.9 });
        top.push(ScoredId { id: 9, score: 0.5 });
        top.push(ScoredId { id: 1, score: 0.5 });
        let hits = top.into_sorted();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, 2);
        // Of the three 0.5 hits the smallest id survives.
        assert_eq!(hits[1].id, 1);
    }

    #[test]
    fn constant_list_normalizes_to_one() {
        let normalized = min_max_normalize(&[(1, 3.0), (2, 3.0)]);
        assert_eq!(normalized[&1], 1.0);
        assert_eq!(normalized[&2], 1.0);
    }

    #[test]
    fn fuse_weights_legs_by_alpha() {
        let vector = [(1, 1.0), (2, 0.0)];
        let keyword = [(2, 5.0), (3, 1.0)];
        let all_vector = fuse(&vector, &keyword, 1.0);
        assert_eq!(all_vector[0].id, 1);
        let all_keyword = fuse(&vector, &keyword, 0.0);
        assert_eq!(all_keyword[0].id, 2);
    }

    #[test]
    fn missing_leg_contributes_zero() {
        let fused = fuse(&[(1, 1.0), (2, 0.5)], &[], 0.5);
        // Only the vector leg exists; id 1 normalizes to 1.0, id 2 to 0.0.
        assert_eq!(fused[0].id, 1);
        assert_eq!(fused[0].score, 0.5);
        assert_eq!(fused[1].score, 0.0);
    }
}
