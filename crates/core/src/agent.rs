//! Agent, profile, and preset snapshot types.
//!
//! These are read-only snapshots handed to the pipeline before a run
//! starts. The pipeline never reaches back into any store: everything it
//! needs about the agent travels in [`AgentSnapshot`].

use serde::{Deserialize, Serialize};

use crate::message::Role;
use crate::worldbook::WorldbookSettings;

/// Which side of an anchor an injection lands on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnchorSide {
    Before,
    After,
}

/// How a preset message is placed into the assembled list.
///
/// Absent strategy = skeleton (literal document order). If a preset
/// somehow carries both a depth and an anchor, depth wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum InjectionStrategy {
    /// Insert N messages back from the end of history.
    Depth { depth: usize, order: i32 },
    /// Insert before/after a named anchor in the skeleton.
    Anchor {
        target: String,
        position: AnchorSide,
        order: i32,
    },
}

/// Named slots a skeleton preset can expand to instead of literal text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresetSlot {
    /// Expands to the linearized history (with depth injections).
    ChatHistory,
    /// Expands to the user-profile anchor-injection group.
    UserProfile,
}

/// A configured preset message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresetMessage {
    /// Unique preset ID.
    pub id: String,

    /// Human-readable name; also the anchor target name for
    /// anchor-injections aimed at this preset.
    pub name: String,

    /// Sender role.
    pub role: Role,

    /// Body text (macros are substituted at assembly time).
    pub content: String,

    /// Disabled presets keep their list position but emit nothing.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Regex patterns; if non-empty, the preset only applies when one
    /// matches the active model id (with or without provider prefix).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub model_match: Vec<String>,

    /// Placement strategy. `None` = skeleton.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<InjectionStrategy>,

    /// Special slot this skeleton preset expands to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slot: Option<PresetSlot>,
}

fn default_true() -> bool {
    true
}

impl PresetMessage {
    /// A plain skeleton preset.
    pub fn skeleton(
        id: impl Into<String>,
        name: impl Into<String>,
        role: Role,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            role,
            content: content.into(),
            enabled: true,
            model_match: Vec::new(),
            strategy: None,
            slot: None,
        }
    }

    /// A slot marker (chat history / user profile).
    pub fn slot_marker(id: impl Into<String>, slot: PresetSlot) -> Self {
        let name = match slot {
            PresetSlot::ChatHistory => "chat_history",
            PresetSlot::UserProfile => "user_profile",
        };
        Self {
            slot: Some(slot),
            ..Self::skeleton(id, name, Role::System, "")
        }
    }
}

/// Token-budget and history-conversion parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSettings {
    /// Token ceiling for the assembled context.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,

    /// If set, the boundary message at the budget edge is truncated to
    /// this many leading characters instead of dropped outright.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retained_chars: Option<usize>,

    /// Keep rich markup only on the most recent K history messages;
    /// older bodies are heuristically downgraded to plain text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plain_text_after: Option<usize>,

    /// Seconds to wait for pending attachment transcriptions.
    #[serde(default = "default_transcription_wait")]
    pub transcription_wait_secs: u64,
}

fn default_max_tokens() -> usize {
    4096
}
fn default_transcription_wait() -> u64 {
    30
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            retained_chars: None,
            plain_text_after: None,
            transcription_wait_secs: default_transcription_wait(),
        }
    }
}

/// Retrieval-augmented knowledge parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalSettings {
    /// Model id used for query embeddings.
    #[serde(default)]
    pub embedding_model: String,

    /// How many recent user turns feed the retrieval query.
    #[serde(default = "default_query_window")]
    pub query_window: usize,

    /// Exponential decay applied per turn when blending prior query
    /// vectors and prior results into the current retrieval.
    #[serde(default = "default_blend_decay")]
    pub blend_decay: f32,

    /// How many recent turns participate in blending. 0 disables it.
    #[serde(default = "default_blend_window")]
    pub blend_window: usize,

    /// Cosine similarity above which a recent cached retrieval is
    /// reused instead of hitting the search backend.
    #[serde(default = "default_cache_threshold")]
    pub cache_similarity_threshold: f32,

    /// Ring-buffer capacity for per-turn retrieval history.
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,

    /// Character budget for a formatted result block.
    #[serde(default = "default_char_budget")]
    pub char_budget: usize,

    /// Default result limit when a placeholder omits one.
    #[serde(default = "default_limit")]
    pub default_limit: usize,

    /// Default minimum score when a placeholder omits one.
    #[serde(default = "default_min_score")]
    pub default_min_score: f32,

    /// Template for the substituted block; `{results}` expands to the
    /// joined per-result lines.
    #[serde(default = "default_block_template")]
    pub block_template: String,

    /// Template per result; `{source}`, `{score}`, `{content}` expand.
    #[serde(default = "default_result_template")]
    pub result_template: String,
}

fn default_query_window() -> usize {
    3
}
fn default_blend_decay() -> f32 {
    0.5
}
fn default_blend_window() -> usize {
    3
}
fn default_cache_threshold() -> f32 {
    0.97
}
fn default_history_capacity() -> usize {
    20
}
fn default_char_budget() -> usize {
    4000
}
fn default_limit() -> usize {
    5
}
fn default_min_score() -> f32 {
    0.3
}
fn default_block_template() -> String {
    "Relevant knowledge:\n{results}".into()
}
fn default_result_template() -> String {
    "- [{source}] {content}".into()
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self {
            embedding_model: String::new(),
            query_window: default_query_window(),
            blend_decay: default_blend_decay(),
            blend_window: default_blend_window(),
            cache_similarity_threshold: default_cache_threshold(),
            history_capacity: default_history_capacity(),
            char_budget: default_char_budget(),
            default_limit: default_limit(),
            default_min_score: default_min_score(),
            block_template: default_block_template(),
            result_template: default_result_template(),
        }
    }
}

/// Per-agent overrides for the message shape formatter. `None` defers to
/// the model default, which defers to the built-in default.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FormatOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_system_head: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_consecutive: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_to_user: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ensure_alternation: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_separator: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alternation_user_filler: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alternation_assistant_filler: Option<String>,
}

/// Read-only agent snapshot supplied by the caller before a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSnapshot {
    /// Unique agent ID.
    pub id: String,

    /// Display name (the `{{char}}` macro).
    pub name: String,

    /// Tags, used by worldbook character filters.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    /// Character definition text.
    #[serde(default)]
    pub character_definition: String,

    /// Personality summary.
    #[serde(default)]
    pub personality: String,

    /// Scenario text.
    #[serde(default)]
    pub scenario: String,

    /// Author notes.
    #[serde(default)]
    pub author_notes: String,

    /// Configured preset messages, in document order.
    #[serde(default)]
    pub presets: Vec<PresetMessage>,

    /// Worldbook scan configuration.
    #[serde(default)]
    pub worldbook: WorldbookSettings,

    /// Retrieval configuration.
    #[serde(default)]
    pub retrieval: RetrievalSettings,

    /// Token budget and history conversion.
    #[serde(default)]
    pub context: ContextSettings,

    /// Shape-formatter overrides.
    #[serde(default)]
    pub formatting: FormatOverrides,
}

impl AgentSnapshot {
    /// A minimal agent with just a name.
    pub fn named(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            tags: Vec::new(),
            character_definition: String::new(),
            personality: String::new(),
            scenario: String::new(),
            author_notes: String::new(),
            presets: Vec::new(),
            worldbook: WorldbookSettings::default(),
            retrieval: RetrievalSettings::default(),
            context: ContextSettings::default(),
            formatting: FormatOverrides::default(),
        }
    }
}

/// Read-only user-profile snapshot (the `{{user}}` macro and the
/// "user profile" anchor content).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfileSnapshot {
    pub name: String,

    /// Persona description injected at the user-profile anchor.
    #[serde(default)]
    pub persona: String,
}
