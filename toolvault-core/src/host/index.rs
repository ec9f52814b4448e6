//! Vector index contract behind `index.search`

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A stored document fragment attached to a tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fragment {
    pub id: i64,

    /// Original filename of the upload the fragment came from
    pub filename: String,

    pub fragment: String,

    pub metadata: Option<String>,
}

/// Semantic index over the fragments of a tool's uploads
#[async_trait]
pub trait FragmentIndex: Send + Sync {
    /// Embed a query string
    async fn embed(&self, query: &str) -> Result<Vec<f32>>;

    /// Fragments of `tool_id` ordered by similarity to `query_vector`
    async fn similarity_search(
        &self,
        tool_id: &str,
        query_vector: &[f32],
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Fragment>>;
}
