//! The typed shared context every stage reads and mutates.
//!
//! [`ChatContext`] replaces the untyped "shared data bag" of the source
//! design with one field per cross-stage signal: preloaded worldbook
//! sources, the activated-entry record, the embedding and retrieval
//! caches, the per-turn retrieval ring, truncation statistics, and the
//! ordered human-readable log. It is created at pipeline start and
//! discarded at pipeline end — never shared across runs.

use std::collections::{HashMap, VecDeque};

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use promptloom_core::message::{ProcessableMessage, Role};
use promptloom_core::services::{DocumentTransport, SearchHit};
use promptloom_core::worldbook::{EntryPosition, WorldbookSource};
use promptloom_core::{AgentSnapshot, ProfileSnapshot, Session};

/// Severity of a pipeline log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
}

/// One human-readable diagnostic entry, usable for a
/// "preview what will be sent" feature.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// Which stage produced this entry.
    pub processor_id: String,
    pub level: LogLevel,
    pub message: String,
}

/// A worldbook entry that activated during this run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivatedEntry {
    /// Source + uid, e.g. `"wb:main:12"`.
    pub source_id: String,
    pub uid: u32,
    pub content: String,
    pub role: Role,
    pub position: EntryPosition,
    pub depth: Option<usize>,
    pub order: i32,
    /// Token cost charged against the worldbook budget.
    pub tokens: usize,
}

/// A cached retrieval keyed by its query vector.
#[derive(Debug, Clone)]
pub struct CachedRetrieval {
    pub vector: Vec<f32>,
    pub hits: Vec<SearchHit>,
}

/// One turn's retrieval, kept in a bounded ring for temporal blending.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnRetrieval {
    pub query: String,
    pub vector: Vec<f32>,
    pub hits: Vec<SearchHit>,
}

/// Statistics written by the token budget limiter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TruncationStats {
    /// History messages kept (including a partially retained one).
    pub kept: usize,
    /// History messages dropped.
    pub dropped: usize,
    /// 1 if the boundary message was partially retained.
    pub partially_retained: usize,
    /// Tokens saved by dropping/truncating.
    pub tokens_saved: usize,
    /// Token cost of protected (preset/injected) messages.
    pub protected_tokens: usize,
    /// Token cost of the surviving history.
    pub history_tokens: usize,
}

/// Before/after numeric deltas from the shape formatter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FormatDelta {
    pub messages_before: usize,
    pub messages_after: usize,
    pub chars_before: usize,
    pub chars_after: usize,
    pub tokens_before: usize,
    pub tokens_after: usize,
}

/// Cross-stage signals that are not part of the message list itself.
#[derive(Debug, Default)]
pub struct ContextExtras {
    /// Worldbook content preloaded by the caller before the run.
    pub worldbook_sources: Vec<WorldbookSource>,

    /// Entries that activated (including outlet entries).
    pub activated_entries: Vec<ActivatedEntry>,

    /// Outlet-positioned entries, recorded but never spliced.
    pub outlet_entries: Vec<ActivatedEntry>,

    /// Before-character worldbook messages, held for the preset
    /// assembler to place immediately before the character block.
    pub before_character: Vec<ProcessableMessage>,

    /// After-character worldbook messages, placed immediately after
    /// the character block.
    pub after_character: Vec<ProcessableMessage>,

    /// Embedding cache, keyed by exact query text.
    pub embedding_cache: HashMap<String, Vec<f32>>,

    /// Similarity-threshold cache of recent retrievals.
    pub retrieval_cache: Vec<CachedRetrieval>,

    /// Bounded ring of per-turn retrievals for temporal aggregation.
    pub retrieval_history: VecDeque<TurnRetrieval>,

    /// Truncation statistics, once the budget limiter ran.
    pub truncation: Option<TruncationStats>,

    /// Shape-formatter deltas.
    pub format_delta: Option<FormatDelta>,

    /// Binary attachments that failed to convert in the final stage.
    pub attachment_failures: usize,
}

/// The shared mutable context one pipeline run operates on.
pub struct ChatContext {
    /// The working message list. Stages may replace it wholesale.
    pub messages: Vec<ProcessableMessage>,

    /// Read-only session snapshot.
    pub session: Option<Session>,

    /// Read-only agent snapshot.
    pub agent: Option<AgentSnapshot>,

    /// Read-only user-profile snapshot.
    pub profile: Option<ProfileSnapshot>,

    /// Active model identifier, e.g. `"openai/gpt-4o"`.
    pub model_id: String,

    /// How the target model takes documents on the wire.
    pub document_transport: DocumentTransport,

    /// Seedable randomness for activation rolls and group draws.
    pub rng: StdRng,

    /// Typed cross-stage signals.
    pub extras: ContextExtras,

    /// Ordered diagnostic log.
    pub log: Vec<LogEntry>,
}

impl ChatContext {
    /// Create a context for one run. A `None` seed draws from entropy.
    pub fn new(model_id: impl Into<String>, seed: Option<u64>) -> Self {
        Self {
            messages: Vec::new(),
            session: None,
            agent: None,
            profile: None,
            model_id: model_id.into(),
            document_transport: DocumentTransport::default(),
            rng: match seed {
                Some(s) => StdRng::seed_from_u64(s),
                None => StdRng::from_entropy(),
            },
            extras: ContextExtras::default(),
            log: Vec::new(),
        }
    }

    /// Append an info-level log entry.
    pub fn log_info(&mut self, processor_id: &str, message: impl Into<String>) {
        self.log.push(LogEntry {
            processor_id: processor_id.to_string(),
            level: LogLevel::Info,
            message: message.into(),
        });
    }

    /// Append a warn-level log entry.
    pub fn log_warn(&mut self, processor_id: &str, message: impl Into<String>) {
        self.log.push(LogEntry {
            processor_id: processor_id.to_string(),
            level: LogLevel::Warn,
            message: message.into(),
        });
    }

    /// Number of history-sourced messages currently in the list.
    pub fn history_len(&self) -> usize {
        self.messages.iter().filter(|m| !m.is_protected()).count()
    }

    /// Number of history user turns (drives delay gating and
    /// turn-interval retrieval placeholders).
    pub fn user_turns(&self) -> usize {
        self.messages
            .iter()
            .filter(|m| !m.is_protected() && m.role == Role::User)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use promptloom_core::message::ProcessableMessage;

    #[test]
    fn seeded_contexts_share_rng_state() {
        use rand::Rng;
        let mut a = ChatContext::new("m", Some(42));
        let mut b = ChatContext::new("m", Some(42));
        let draws_a: Vec<u32> = (0..5).map(|_| a.rng.gen_range(0..1000)).collect();
        let draws_b: Vec<u32> = (0..5).map(|_| b.rng.gen_range(0..1000)).collect();
        assert_eq!(draws_a, draws_b);
    }

    #[test]
    fn history_len_ignores_protected_messages() {
        let mut ctx = ChatContext::new("m", Some(1));
        ctx.messages.push(ProcessableMessage::history(Role::User, "hi", "n1"));
        ctx.messages
            .push(ProcessableMessage::preset(Role::System, "sys", "p1"));
        assert_eq!(ctx.history_len(), 1);
        assert_eq!(ctx.user_turns(), 1);
    }

    #[test]
    fn log_entries_keep_order() {
        let mut ctx = ChatContext::new("m", Some(1));
        ctx.log_info("a", "first");
        ctx.log_warn("b", "second");
        assert_eq!(ctx.log.len(), 2);
        assert_eq!(ctx.log[0].processor_id, "a");
        assert_eq!(ctx.log[1].level, LogLevel::Warn);
    }
}
