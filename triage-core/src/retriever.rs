//! Selection of past analyst corrections for in-context learning.

use std::sync::Arc;
use tracing::debug;

use crate::error::StoreError;
use crate::store::StateStore;
use crate::types::RetrievedFeedback;

/// Default number of feedback items injected into one prompt.
pub const DEFAULT_RETRIEVAL_LIMIT: usize = 5;

/// Picks the most instructive feedback to show the model.
///
/// Ranking is relevance first, then recency, capped at `limit`. An empty
/// result is normal for a fresh deployment and must not be treated as an error.
#[derive(Debug, Clone)]
pub struct FeedbackRetriever {
    store: Arc<StateStore>,
    limit: usize,
}

impl FeedbackRetriever {
    pub fn new(store: Arc<StateStore>) -> Self {
        Self {
            store,
            limit: DEFAULT_RETRIEVAL_LIMIT,
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Context for the next prompt, using the configured limit.
    pub async fn context(&self) -> Result<Vec<RetrievedFeedback>, StoreError> {
        self.select_context(self.limit).await
    }

    pub async fn select_context(
        &self,
        limit: usize,
    ) -> Result<Vec<RetrievedFeedback>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let items = self
            .store
            .run_blocking(move |store| store.feedback_for_retrieval(limit))
            .await?;
        debug!(limit, selected = items.len(), "Feedback context selected");
        Ok(items)
    }
}
