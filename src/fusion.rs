//! Rank fusion for hybrid retrieval.
//!
//! Lexical and semantic candidate lists are blended on their raw scores:
//! `combined = alpha * semantic + (1 - alpha) * lexical`, with a missing side
//! contributing zero. No per-list normalization is applied, so the weighting
//! stays interpretable against the worked scores each backend reports.

use std::collections::HashMap;

use crate::models::SearchResult;

/// Blend two candidate lists into a single ranking of at most `limit` hits.
///
/// When the same message appears in both lists, the semantic copy's fields
/// win (the scores differ only in provenance, the payload is identical).
/// Ties on the combined score break toward the lexicographically smaller
/// message id so paging over a fused ranking is deterministic.
pub fn fuse_results(
    lexical: Vec<SearchResult>,
    semantic: Vec<SearchResult>,
    alpha: f64,
    limit: usize,
) -> Vec<SearchResult> {
    let mut lexical_scores: HashMap<String, f64> = HashMap::with_capacity(lexical.len());
    let mut merged: HashMap<String, SearchResult> = HashMap::new();

    for hit in lexical {
        lexical_scores.insert(hit.message_id.clone(), hit.relevance_score);
        merged.insert(hit.message_id.clone(), hit);
    }
    let mut semantic_scores: HashMap<String, f64> = HashMap::with_capacity(semantic.len());
    for hit in semantic {
        semantic_scores.insert(hit.message_id.clone(), hit.relevance_score);
        merged.insert(hit.message_id.clone(), hit);
    }

    let mut fused: Vec<SearchResult> = merged
        .into_values()
        .map(|mut hit| {
            let lex = lexical_scores.get(&hit.message_id).copied().unwrap_or(0.0);
            let sem = semantic_scores.get(&hit.message_id).copied().unwrap_or(0.0);
            hit.relevance_score = alpha * sem + (1.0 - alpha) * lex;
            hit
        })
        .collect();

    fused.sort_by(|a, b| {
        b.relevance_score
            .partial_cmp(&a.relevance_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.message_id.cmp(&b.message_id))
    });
    fused.truncate(limit);
    fused
}
