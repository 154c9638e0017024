//! Hybrid ranking over indexed chunks.
//!
//! 1. Keyword score: SQLite FTS5 BM25 (negated `rank`, higher is better);
//!    chunks the full-text query does not match score 0.
//! 2. Semantic score: cosine similarity between the query vector and each
//!    chunk vector (chunks without a vector score 0).
//! 3. Both score sets are min-max normalized to `[0, 1]`.
//! 4. Blend: `score = w × semantic + (1 − w) × keyword`.
//! 5. Sort by score (desc), then chunk id (asc); truncate to `top_k`.
//!
//! Without a query vector only the keyword score is used, and chunks the
//! full-text query did not match are dropped.

use std::cmp::Ordering;

use super::index::IndexedChunk;

/// A pool chunk with its BM25 score, if the full-text query matched it.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub chunk: IndexedChunk,
    pub keyword: Option<f64>,
}

#[derive(Debug, Clone, Copy)]
pub struct Scored<'a> {
    pub chunk: &'a IndexedChunk,
    pub score: f64,
    pub semantic: f64,
    pub lexical: f64,
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

/// Lowercase alphanumeric words (underscores kept, so identifiers survive).
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

/// FTS5 expression matching any query term. Terms are quoted so words like
/// `AND` or `NEAR` are never read as operators.
pub fn match_expression(query: &str) -> Option<String> {
    let mut terms = tokenize(query);
    terms.sort();
    terms.dedup();
    if terms.is_empty() {
        return None;
    }
    Some(
        terms
            .iter()
            .map(|t| format!("\"{}\"", t))
            .collect::<Vec<_>>()
            .join(" OR "),
    )
}

/// Min-max normalize to `[0, 1]`. A constant set maps to 1 when positive,
/// otherwise to 0.
pub fn normalize(scores: &[f64]) -> Vec<f64> {
    let min = scores.iter().copied().fold(f64::INFINITY, f64::min);
    let max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);

    scores
        .iter()
        .map(|s| {
            if (max - min).abs() < f64::EPSILON {
                if max > 0.0 {
                    1.0
                } else {
                    0.0
                }
            } else {
                (s - min) / (max - min)
            }
        })
        .collect()
}

pub fn rank<'a>(
    candidates: &'a [Candidate],
    query_vec: Option<&[f32]>,
    semantic_weight: f64,
    top_k: usize,
) -> Vec<Scored<'a>> {
    if top_k == 0 {
        return Vec::new();
    }

    let pool: Vec<&Candidate> = candidates
        .iter()
        .filter(|c| query_vec.is_some() || c.keyword.is_some())
        .collect();
    if pool.is_empty() {
        return Vec::new();
    }

    let raw_lexical: Vec<f64> = pool.iter().map(|c| c.keyword.unwrap_or(0.0)).collect();
    let lexical = normalize(&raw_lexical);

    let (semantic, weight) = match query_vec {
        Some(qv) => {
            let raw: Vec<f64> = pool
                .iter()
                .map(|c| {
                    c.chunk
                        .embedding
                        .as_deref()
                        .map_or(0.0, |e| cosine_similarity(qv, e) as f64)
                })
                .collect();
            (normalize(&raw), semantic_weight.clamp(0.0, 1.0))
        }
        None => (vec![0.0; pool.len()], 0.0),
    };

    let mut scored: Vec<Scored<'a>> = pool
        .into_iter()
        .enumerate()
        .map(|(i, c)| Scored {
            chunk: &c.chunk,
            score: weight * semantic[i] + (1.0 - weight) * lexical[i],
            semantic: semantic[i],
            lexical: lexical[i],
        })
        .collect();

    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.chunk.id.cmp(&b.chunk.id))
    });
    scored.truncate(top_k);
    scored
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DocumentSource, Pool};

    fn candidate(id: &str, keyword: Option<f64>, embedding: Vec<f32>) -> Candidate {
        Candidate {
            chunk: IndexedChunk {
                id: id.to_string(),
                document_id: "doc".to_string(),
                content: format!("chunk {}", id),
                embedding: Some(embedding),
                source: DocumentSource {
                    title: "Docs".to_string(),
                    description: None,
                    url: None,
                    source_type: Pool::Official,
                },
            },
            keyword,
        }
    }

    fn ids(scored: &[Scored<'_>]) -> Vec<String> {
        scored.iter().map(|s| s.chunk.id.clone()).collect()
    }

    // Keyword favours "a", semantic favours "c"
    fn fixture() -> Vec<Candidate> {
        vec![
            candidate("a", Some(3.2), vec![0.0, 1.0]),
            candidate("b", Some(1.1), vec![0.5, 0.5]),
            candidate("c", None, vec![1.0, 0.0]),
        ]
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn test_tokenize() {
        assert_eq!(tokenize("Hello, use_state()!"), vec!["hello", "use_state"]);
    }

    #[test]
    fn test_match_expression() {
        assert_eq!(
            match_expression("useEffect AND cleanup? cleanup").as_deref(),
            Some("\"and\" OR \"cleanup\" OR \"useeffect\"")
        );
        assert_eq!(match_expression("?!"), None);
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize(&[1.0, 3.0, 2.0]), vec![0.0, 1.0, 0.5]);
        assert_eq!(normalize(&[0.4, 0.4]), vec![1.0, 1.0]);
        assert_eq!(normalize(&[0.0, 0.0]), vec![0.0, 0.0]);
    }

    #[test]
    fn test_weight_one_is_pure_semantic() {
        let candidates = fixture();
        let ranked = rank(&candidates, Some(&[1.0, 0.0]), 1.0, 3);
        assert_eq!(ids(&ranked), vec!["c", "b", "a"]);
    }

    #[test]
    fn test_weight_zero_is_pure_keyword() {
        let candidates = fixture();
        let ranked = rank(&candidates, Some(&[1.0, 0.0]), 0.0, 3);
        assert_eq!(ids(&ranked), vec!["a", "b", "c"]);
        assert_eq!(ranked[2].score, 0.0);
    }

    #[test]
    fn test_ties_break_by_id() {
        let candidates = vec![
            candidate("z", Some(1.0), vec![1.0, 0.0]),
            candidate("m", Some(1.0), vec![1.0, 0.0]),
        ];
        let ranked = rank(&candidates, Some(&[1.0, 0.0]), 0.7, 2);
        assert_eq!(ids(&ranked), vec!["m", "z"]);
    }

    #[test]
    fn test_keyword_only_drops_unmatched_chunks() {
        let candidates = fixture();
        let ranked = rank(&candidates, None, 0.7, 5);
        assert_eq!(ids(&ranked), vec!["a", "b"]);
        assert_eq!(ranked[0].score, 1.0);
        assert_eq!(ranked[1].score, 0.0);
    }

    #[test]
    fn test_top_k_truncates() {
        let candidates = fixture();
        assert_eq!(rank(&candidates, Some(&[1.0, 0.0]), 0.5, 1).len(), 1);
        assert!(rank(&candidates, None, 0.5, 0).is_empty());
    }
}
