//! Error types for the PromptLoom domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error variant.
//!
//! Most pipeline failures are *recoverable per-item*: the offending
//! message, entry, or attachment is skipped and the run continues. These
//! types exist so the skip sites have something precise to log.

use thiserror::Error;

/// The top-level error type for all PromptLoom operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Session tree errors ---
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    // --- Knowledge-injection (worldbook) errors ---
    #[error("Knowledge error: {0}")]
    Knowledge(#[from] KnowledgeError),

    // --- Retrieval errors ---
    #[error("Retrieval error: {0}")]
    Retrieval(#[from] RetrievalError),

    // --- Attachment errors ---
    #[error("Attachment error: {0}")]
    Attachment(#[from] AttachmentError),

    // --- External service errors ---
    #[error("Token counting failed: {0}")]
    TokenCount(String),

    #[error("Embedding generation failed: {0}")]
    Embedding(String),

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

#[derive(Debug, Clone, Error)]
pub enum SessionError {
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Session has no active leaf")]
    NoActiveLeaf,

    #[error("Cycle detected at node {0} while walking to root")]
    CycleDetected(String),
}

#[derive(Debug, Clone, Error)]
pub enum KnowledgeError {
    #[error("Invalid key pattern '{pattern}' in entry {uid}: {reason}")]
    InvalidKeyPattern {
        uid: u32,
        pattern: String,
        reason: String,
    },

    #[error("Recursion ceiling reached after {0} rounds")]
    RecursionCeiling(u32),
}

#[derive(Debug, Clone, Error)]
pub enum RetrievalError {
    #[error("Malformed placeholder: {0}")]
    MalformedPlaceholder(String),

    #[error("Knowledge search failed: {0}")]
    SearchFailed(String),
}

#[derive(Debug, Clone, Error)]
pub enum AttachmentError {
    #[error("Transcription wait timed out after {0}s")]
    TranscriptionTimeout(u64),

    #[error("Fetch failed for {path}: {reason}")]
    FetchFailed { path: String, reason: String },

    #[error("Attachment {id} has no fetchable path")]
    MissingPath { id: String },
}
