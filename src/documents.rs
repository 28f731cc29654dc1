//! Read-only access to project documents and their embedded chunks.
//!
//! Documents are written by the upload side of the system. Both store
//! backends implement [`DocumentSource`] over their own document tables.

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{ContextChunk, Document};

#[async_trait]
pub trait DocumentSource: Send + Sync {
    /// Every document belonging to `project_id`, in no particular order.
    async fn list(&self, project_id: &str) -> Result<Vec<Document>>;

    /// Embedded chunks for one document, ordered by chunk index.
    ///
    /// An empty vector means the document has not been embedded yet.
    async fn context(&self, project_id: &str, document_id: &str) -> Result<Vec<ContextChunk>>;
}
