//! # PromptLoom Core
//!
//! Domain types, traits, and error definitions for the PromptLoom prompt
//! assembly pipeline. This crate has **zero framework dependencies** — it
//! defines the domain model the pipeline crate implements against.
//!
//! ## Design Philosophy
//!
//! Every external backend (token counting, embeddings, knowledge search,
//! attachment handling) is defined as a trait here. Implementations live
//! with the caller. This enables:
//! - Running the pipeline against any model/provider stack
//! - Easy testing with mock/stub services
//! - A clean dependency graph (the pipeline crate depends inward on core)
//!
//! The pipeline never reaches into ambient global state: sessions, agents,
//! and profiles arrive as plain read-only snapshots ([`Session`],
//! [`AgentSnapshot`], [`ProfileSnapshot`]).

pub mod agent;
pub mod error;
pub mod message;
pub mod services;
pub mod session;
pub mod worldbook;

// Re-export key types at crate root for ergonomics
pub use agent::{
    AgentSnapshot, AnchorSide, ContextSettings, FormatOverrides, InjectionStrategy, PresetMessage,
    PresetSlot, ProfileSnapshot, RetrievalSettings,
};
pub use error::{AttachmentError, Error, KnowledgeError, Result, RetrievalError, SessionError};
pub use message::{
    Attachment, AttachmentKind, ContentPart, MessageContent, MessageSource, ProcessableMessage,
    Role, TranscriptionStatus, WireMessage,
};
pub use services::{
    AttachmentServices, DocumentTransport, EmbeddingService, KnowledgeSearch, SearchHit,
    SearchQuery, TokenCounter, TranscriptOutcome,
};
pub use session::{MessageNode, NodeMetadata, Session};
pub use worldbook::{
    CharacterFilter, EntryPosition, SelectiveLogic, WorldbookEntry, WorldbookSettings,
    WorldbookSource,
};
