//! Identity decision: best cosine similarity against a user's enrollment set.

use crate::store::EmbeddingStore;
use crate::types::{CosineMatcher, Embedding, Matcher};
use serde::Serialize;

/// Outcome of comparing a probe against one claimed identity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Verification {
    pub accepted: bool,
    /// Maximum similarity over the stored embeddings; 0.0 when there are none.
    pub score: f32,
}

pub struct Verifier<M = CosineMatcher> {
    matcher: M,
    threshold: f32,
}

impl Verifier {
    pub fn new(threshold: f32) -> Self {
        Self::with_matcher(CosineMatcher, threshold)
    }
}

impl<M: Matcher> Verifier<M> {
    pub fn with_matcher(matcher: M, threshold: f32) -> Self {
        Self { matcher, threshold }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Accept when the best similarity reaches the threshold (inclusive).
    ///
    /// A user with no stored embeddings yields `(false, 0.0)`.
    pub fn verify(&self, store: &EmbeddingStore, user_id: &str, query: &Embedding) -> Verification {
        let result = self.matcher.compare(query, store.get(user_id), self.threshold);
        tracing::debug!(
            user = user_id,
            score = result.similarity,
            best_index = ?result.best_index,
            threshold = self.threshold,
            accepted = result.matched,
            "verification"
        );
        Verification {
            accepted: result.matched,
            score: result.similarity,
        }
    }
}
