//! In-memory similarity index over all canonical identity vectors.
//!
//! A brute-force linear scan over unit vectors; exact for the corpus
//! sizes this system targets. Concurrent readers share a read lock, so
//! an in-flight query sees either the pre-write or the fully-post-write
//! corpus, never a partial vector.

use crate::types::Embedding;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::RwLock;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum IndexError {
    #[error("duplicate identity: {0} is already enrolled")]
    DuplicateIdentity(String),
    #[error("unknown identity: {0}")]
    UnknownIdentity(String),
    #[error("vector dimension mismatch: corpus is {expected}-dimensional, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
    #[error("cannot index a zero vector")]
    ZeroVector,
}

/// One ranked entry of a query result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedMatch {
    pub identity_key: String,
    pub score: f32,
}

pub struct SimilarityIndex {
    entries: RwLock<BTreeMap<String, Vec<f32>>>,
}

impl SimilarityIndex {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("index lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, identity_key: &str) -> bool {
        self.entries
            .read()
            .expect("index lock poisoned")
            .contains_key(identity_key)
    }

    /// Insert a new identity. Fails with `DuplicateIdentity` if the key
    /// is already present; re-enrollment goes through [`replace`](Self::replace).
    ///
    /// The vector is re-normalized before insertion so queries reduce to
    /// a dot product.
    pub fn insert(&self, identity_key: &str, embedding: &Embedding) -> Result<(), IndexError> {
        let vector = Self::prepare(embedding)?;
        let mut entries = self.entries.write().expect("index lock poisoned");

        if let Some((_, existing)) = entries.iter().next() {
            if existing.len() != vector.len() {
                return Err(IndexError::DimensionMismatch {
                    expected: existing.len(),
                    got: vector.len(),
                });
            }
        }
        if entries.contains_key(identity_key) {
            return Err(IndexError::DuplicateIdentity(identity_key.to_string()));
        }

        entries.insert(identity_key.to_string(), vector);
        Ok(())
    }

    /// Atomically swap the vector for an existing identity. The old
    /// vector is discarded. Fails with `UnknownIdentity` if absent.
    pub fn replace(&self, identity_key: &str, embedding: &Embedding) -> Result<(), IndexError> {
        let vector = Self::prepare(embedding)?;
        let mut entries = self.entries.write().expect("index lock poisoned");

        match entries.get_mut(identity_key) {
            Some(slot) => {
                if slot.len() != vector.len() {
                    return Err(IndexError::DimensionMismatch {
                        expected: slot.len(),
                        got: vector.len(),
                    });
                }
                *slot = vector;
                Ok(())
            }
            None => Err(IndexError::UnknownIdentity(identity_key.to_string())),
        }
    }

    /// Remove an identity. Returns whether it was present.
    pub fn remove(&self, identity_key: &str) -> bool {
        self.entries
            .write()
            .expect("index lock poisoned")
            .remove(identity_key)
            .is_some()
    }

    /// Rank the corpus against a query vector by dot product, descending.
    ///
    /// Ties on score break to the lexicographically smaller identity
    /// key, so repeated queries against a stable corpus are reproducible.
    /// The query is normalized before comparison.
    pub fn query(&self, query: &Embedding, top_k: usize) -> Vec<RankedMatch> {
        let query = query.normalized();
        let entries = self.entries.read().expect("index lock poisoned");

        let mut ranked: Vec<RankedMatch> = entries
            .iter()
            .map(|(key, vector)| RankedMatch {
                identity_key: key.clone(),
                score: dot(&query.values, vector),
            })
            .collect();

        ranked.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.identity_key.cmp(&b.identity_key))
        });
        ranked.truncate(top_k);
        ranked
    }

    fn prepare(embedding: &Embedding) -> Result<Vec<f32>, IndexError> {
        if embedding.norm() == 0.0 {
            return Err(IndexError::ZeroVector);
        }
        Ok(embedding.normalized().values)
    }
}

impl Default for SimilarityIndex {
    fn default() -> Self {
        Self::new()
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn emb(values: Vec<f32>) -> Embedding {
        Embedding {
            values,
            model_version: None,
        }
    }

    #[test]
    fn test_insert_and_query() {
        let index = SimilarityIndex::new();
        index.insert("123456rex", &emb(vec![1.0, 0.0, 0.0])).unwrap();
        index.insert("654321flu", &emb(vec![0.0, 1.0, 0.0])).unwrap();
        index.insert("111111mia", &emb(vec![0.9, 0.1, 0.0])).unwrap();

        let ranked = index.query(&emb(vec![1.0, 0.0, 0.0]), 2);
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].identity_key, "123456rex");
        assert!((ranked[0].score - 1.0).abs() < 1e-6);
        assert_eq!(ranked[1].identity_key, "111111mia");
    }

    #[test]
    fn test_duplicate_insert_rejected() {
        let index = SimilarityIndex::new();
        index.insert("123456rex", &emb(vec![1.0, 0.0])).unwrap();
        let err = index.insert("123456rex", &emb(vec![0.0, 1.0])).unwrap_err();
        assert_eq!(err, IndexError::DuplicateIdentity("123456rex".into()));

        // The first vector is retained.
        let ranked = index.query(&emb(vec![1.0, 0.0]), 1);
        assert!((ranked[0].score - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_replace_swaps_vector() {
        let index = SimilarityIndex::new();
        index.insert("123456rex", &emb(vec![1.0, 0.0])).unwrap();
        index.replace("123456rex", &emb(vec![0.0, 1.0])).unwrap();

        let ranked = index.query(&emb(vec![0.0, 1.0]), 1);
        assert!((ranked[0].score - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_replace_unknown_identity() {
        let index = SimilarityIndex::new();
        let err = index.replace("missing", &emb(vec![1.0])).unwrap_err();
        assert_eq!(err, IndexError::UnknownIdentity("missing".into()));
    }

    #[test]
    fn test_remove() {
        let index = SimilarityIndex::new();
        index.insert("123456rex", &emb(vec![1.0, 0.0])).unwrap();
        assert!(index.remove("123456rex"));
        assert!(!index.remove("123456rex"));
        assert!(index.is_empty());
    }

    #[test]
    fn test_query_empty_corpus() {
        let index = SimilarityIndex::new();
        assert!(index.query(&emb(vec![1.0, 0.0]), 5).is_empty());
    }

    #[test]
    fn test_vectors_normalized_on_insert() {
        let index = SimilarityIndex::new();
        // Not unit length; the index must normalize before storing.
        index.insert("123456rex", &emb(vec![3.0, 4.0])).unwrap();
        let ranked = index.query(&emb(vec![3.0, 4.0]), 1);
        assert!((ranked[0].score - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_zero_vector_rejected() {
        let index = SimilarityIndex::new();
        let err = index.insert("123456rex", &emb(vec![0.0, 0.0])).unwrap_err();
        assert_eq!(err, IndexError::ZeroVector);
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let index = SimilarityIndex::new();
        index.insert("123456rex", &emb(vec![1.0, 0.0])).unwrap();
        let err = index
            .insert("654321flu", &emb(vec![1.0, 0.0, 0.0]))
            .unwrap_err();
        assert_eq!(
            err,
            IndexError::DimensionMismatch {
                expected: 2,
                got: 3
            }
        );
    }

    #[test]
    fn test_equal_scores_break_lexicographically() {
        let index = SimilarityIndex::new();
        // Identical vectors: every key scores the same against the query.
        index.insert("zzz999zed", &emb(vec![1.0, 0.0])).unwrap();
        index.insert("aaa111abe", &emb(vec![1.0, 0.0])).unwrap();
        index.insert("mmm555mid", &emb(vec![1.0, 0.0])).unwrap();

        let ranked = index.query(&emb(vec![1.0, 0.0]), 3);
        let keys: Vec<&str> = ranked.iter().map(|m| m.identity_key.as_str()).collect();
        assert_eq!(keys, vec!["aaa111abe", "mmm555mid", "zzz999zed"]);
    }

    #[test]
    fn test_top_k_truncation() {
        let index = SimilarityIndex::new();
        for i in 0..10 {
            let key = format!("{i:0>6}pet");
            index.insert(&key, &emb(vec![1.0, i as f32 * 0.01])).unwrap();
        }
        assert_eq!(index.query(&emb(vec![1.0, 0.0]), 3).len(), 3);
        assert_eq!(index.query(&emb(vec![1.0, 0.0]), 100).len(), 10);
    }

    #[test]
    fn test_concurrent_queries_are_consistent() {
        let index = Arc::new(SimilarityIndex::new());
        for i in 0..50 {
            let key = format!("{i:0>6}pet");
            let mut v = vec![0.0f32; 8];
            v[i % 8] = 1.0;
            v[(i + 3) % 8] = 0.5;
            index.insert(&key, &emb(v)).unwrap();
        }

        let query = emb(vec![1.0, 0.5, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
        let baseline = index.query(&query, 10);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let index = Arc::clone(&index);
                let query = query.clone();
                std::thread::spawn(move || index.query(&query, 10))
            })
            .collect();

        for handle in handles {
            let ranked = handle.join().unwrap();
            assert_eq!(ranked, baseline);
        }
    }

    #[test]
    fn test_concurrent_insert_never_observed_partially() {
        let index = Arc::new(SimilarityIndex::new());
        index.insert("000000base", &emb(vec![1.0, 0.0, 0.0, 0.0])).unwrap();

        let writer = {
            let index = Arc::clone(&index);
            std::thread::spawn(move || {
                for i in 1..100 {
                    let key = format!("{i:0>6}pet");
                    index.insert(&key, &emb(vec![0.0, 1.0, 0.0, 0.0])).unwrap();
                }
            })
        };

        let reader = {
            let index = Arc::clone(&index);
            std::thread::spawn(move || {
                for _ in 0..200 {
                    for m in index.query(&emb(vec![0.0, 1.0, 0.0, 0.0]), 5) {
                        // Every visible vector is fully written and unit
                        // length, so scores stay within [-1, 1].
                        assert!(m.score >= -1.0 - 1e-5 && m.score <= 1.0 + 1e-5);
                    }
                }
            })
        };

        writer.join().unwrap();
        reader.join().unwrap();
    }
}
