//! Canonical structural hashing for vote bucketing.
//!
//! Quorum and consensus group agent conclusions by value. Bucketing must
//! be independent of JSON object key order, so values are serialized with
//! recursively sorted keys before comparison.

use std::collections::BTreeMap;

/// Serialize a JSON value with all object keys sorted, recursively.
/// Structurally equal values produce identical strings regardless of the
/// key order they were built with.
pub fn canonical_string(value: &serde_json::Value) -> String {
    serde_json::to_string(&canonicalize(value)).unwrap_or_else(|_| "null".to_string())
}

fn canonicalize(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let sorted: BTreeMap<&String, serde_json::Value> =
                map.iter().map(|(k, v)| (k, canonicalize(v))).collect();
            let mut out = serde_json::Map::new();
            for (k, v) in sorted {
                out.insert(k.clone(), v);
            }
            serde_json::Value::Object(out)
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(canonicalize).collect())
        }
        other => other.clone(),
    }
}

/// One vote bucket: a distinct conclusion and its supporters.
#[derive(Debug, Clone)]
pub struct Bucket {
    pub conclusion: serde_json::Value,
    pub votes: usize,
}

/// Equality-based vote grouping with first-seen ordering, used for tie
/// breaks.
#[derive(Debug, Default)]
pub struct Tally {
    buckets: Vec<(String, Bucket)>,
}

impl Tally {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, conclusion: &serde_json::Value) {
        let key = canonical_string(conclusion);
        if let Some((_, bucket)) = self.buckets.iter_mut().find(|(k, _)| *k == key) {
            bucket.votes += 1;
        } else {
            self.buckets.push((
                key,
                Bucket {
                    conclusion: conclusion.clone(),
                    votes: 1,
                },
            ));
        }
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Number of distinct conclusions.
    pub fn distinct(&self) -> usize {
        self.buckets.len()
    }

    /// The largest bucket; ties broken by first-seen order.
    pub fn winner(&self) -> Option<&Bucket> {
        let mut best: Option<&Bucket> = None;
        for (_, bucket) in &self.buckets {
            match best {
                Some(current) if bucket.votes <= current.votes => {}
                _ => best = Some(bucket),
            }
        }
        best
    }

    /// All buckets except the winner, in first-seen order.
    pub fn dissent(&self) -> Vec<&Bucket> {
        let Some(winner) = self.winner() else {
            return vec![];
        };
        let winner_key = canonical_string(&winner.conclusion);
        self.buckets
            .iter()
            .filter(|(k, _)| *k != winner_key)
            .map(|(_, b)| b)
            .collect()
    }

    /// Buckets as JSON for escalation context and decision outputs.
    pub fn positions(&self) -> serde_json::Value {
        serde_json::Value::Array(
            self.buckets
                .iter()
                .map(|(_, b)| {
                    serde_json::json!({
                        "conclusion": b.conclusion,
                        "votes": b.votes,
                    })
                })
                .collect(),
        )
    }
}
