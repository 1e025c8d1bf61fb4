//! External-service traits — the abstraction over backends the pipeline
//! consumes as opaque collaborators.
//!
//! Token counting, embedding, knowledge search, and attachment handling
//! are behavior contracts only: implementations (HTTP clients, local
//! models, test stubs) live with the caller.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::message::Attachment;

/// Counts tokens for a given model.
#[async_trait]
pub trait TokenCounter: Send + Sync {
    /// Token count for plain text.
    async fn count(&self, text: &str, model_id: &str) -> Result<usize>;

    /// Token count for a message body including attachment cost.
    async fn count_message(
        &self,
        text: &str,
        model_id: &str,
        attachments: &[Attachment],
    ) -> Result<usize>;
}

/// Produces embedding vectors.
#[async_trait]
pub trait EmbeddingService: Send + Sync {
    async fn embed(&self, text: &str, model_id: &str) -> Result<Vec<f32>>;
}

/// A ranked-search request against a knowledge base.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchQuery {
    /// Query text.
    pub query: String,

    /// Optional precomputed query vector.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vector: Option<Vec<f32>>,

    /// Maximum results.
    pub limit: usize,

    /// Minimum score threshold.
    pub min_score: f32,

    /// Restrict to one knowledge source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,

    /// Model hint for backend-side scoring.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
}

/// A single ranked search result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    /// Stable entry id within its source.
    pub id: String,

    /// Relevance score.
    pub score: f32,

    /// Human-readable source name.
    pub source: String,

    /// The content item.
    pub content: String,

    /// Content tags.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

/// Ranked knowledge-base search.
#[async_trait]
pub trait KnowledgeSearch: Send + Sync {
    async fn search(&self, query: &SearchQuery) -> Result<Vec<SearchHit>>;

    /// Fetch specific entries by id, bypassing scoring (used by
    /// `static`-mode placeholders).
    async fn fetch(&self, ids: &[String], source_id: Option<&str>) -> Result<Vec<SearchHit>>;
}

/// Outcome of a transcription/extraction job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TranscriptOutcome {
    /// Extractable text is available.
    Text(String),
    /// The attachment resolved to binary media (not yet base64-encoded).
    Binary,
    /// The job failed.
    Failed(String),
}

/// Attachment backends: a transcription-completion waiter and a
/// binary-fetch-by-path function.
#[async_trait]
pub trait AttachmentServices: Send + Sync {
    /// Wait (best-effort, bounded by `timeout`) for the given
    /// attachments' transcription jobs, returning whatever completed.
    async fn await_transcriptions(
        &self,
        attachment_ids: &[String],
        timeout: Duration,
    ) -> Result<HashMap<String, TranscriptOutcome>>;

    /// Fetch raw bytes for base64 encoding.
    async fn fetch_bytes(&self, path: &str) -> Result<Vec<u8>>;
}

/// How the target model accepts documents on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentTransport {
    /// Inline base64 content parts.
    InlineBase64,
    /// File-reference wrapper parts.
    FileReference,
}

impl Default for DocumentTransport {
    fn default() -> Self {
        DocumentTransport::InlineBase64
    }
}
