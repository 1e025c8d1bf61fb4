//! Worldbook (knowledge-injection) entry types.
//!
//! A worldbook entry is a keyword-triggered snippet of text injected into
//! the prompt when its activation conditions are met, independent of
//! retrieval scoring. Entries are read-only per pipeline run; activation
//! state lives only in the run's shared context.
//!
//! Field semantics follow tabletop "lore book" conventions: primary and
//! secondary key lists, selective logic, inclusion groups with weighted
//! competition, temporal gating (sticky / cooldown / delay), and
//! recursion controls.

use serde::{Deserialize, Serialize};

use crate::message::Role;

/// Where an activated entry is spliced into the message list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryPosition {
    /// Immediately before the character block.
    BeforeCharacter,
    /// Immediately after the character block.
    AfterCharacter,
    /// Before the first history message.
    BeforeAnchor,
    /// After the first history message.
    AfterAnchor,
    /// Counted backward from the last history message by `depth` slots.
    AtDepth,
    /// Recorded in the shared context only; never spliced. Reserved for
    /// downstream macro substitution.
    Outlet,
}

impl Default for EntryPosition {
    fn default() -> Self {
        EntryPosition::BeforeCharacter
    }
}

/// Logic applied to secondary-key matches when `selective` is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SelectiveLogic {
    /// At least one secondary key must match.
    AndAny,
    /// Every secondary key must match.
    AndAll,
    /// No secondary key may match.
    NotAny,
    /// At least one secondary key must fail to match.
    NotAll,
}

impl Default for SelectiveLogic {
    fn default() -> Self {
        SelectiveLogic::AndAny
    }
}

/// Include/exclude filter by agent name or tag.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CharacterFilter {
    /// When true, a name/tag match *vetoes* activation instead of
    /// being required for it.
    #[serde(default)]
    pub exclude: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub names: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl CharacterFilter {
    /// True if the filter allows activation for the given agent.
    pub fn allows(&self, agent_name: &str, agent_tags: &[String]) -> bool {
        let matched = self
            .names
            .iter()
            .any(|n| n.eq_ignore_ascii_case(agent_name))
            || self
                .tags
                .iter()
                .any(|t| agent_tags.iter().any(|at| at.eq_ignore_ascii_case(t)));
        if self.exclude {
            !matched
        } else {
            self.names.is_empty() && self.tags.is_empty() || matched
        }
    }
}

/// A single worldbook entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorldbookEntry {
    /// Unique id within its source.
    pub uid: u32,

    /// Primary keys: literal substrings, whole words, or `/regex/flags`.
    #[serde(default, rename = "key")]
    pub keys: Vec<String>,

    /// Secondary keys, consulted when `selective` is set.
    #[serde(default, rename = "keysecondary")]
    pub secondary_keys: Vec<String>,

    /// Text injected on activation.
    pub content: String,

    /// Splice position.
    #[serde(default)]
    pub position: EntryPosition,

    /// Depth for [`EntryPosition::AtDepth`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depth: Option<usize>,

    /// Injection order; higher order is spliced first.
    #[serde(default)]
    pub order: i32,

    /// Role of the injected message.
    #[serde(default = "default_role")]
    pub role: Role,

    /// Constant entries always pass the keyword test.
    #[serde(default)]
    pub constant: bool,

    /// Enables secondary-key logic.
    #[serde(default)]
    pub selective: bool,

    #[serde(default)]
    pub selective_logic: SelectiveLogic,

    /// Activation probability in percent, rolled when `use_probability`.
    #[serde(default = "default_probability")]
    pub probability: u8,

    #[serde(default)]
    pub use_probability: bool,

    /// Inclusion group: at most one member of a group activates per run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,

    /// Weight in the group competition draw.
    #[serde(default = "default_group_weight")]
    pub group_weight: u32,

    /// Wins the group outright, bypassing the draw.
    #[serde(default)]
    pub group_override: bool,

    /// Keep this entry's content out of the recursion scan buffer.
    #[serde(default)]
    pub prevent_recursion: bool,

    /// Only becomes eligible once lower recursion levels exhaust.
    #[serde(default)]
    pub delay_until_recursion: bool,

    /// Recursion level this entry waits for.
    #[serde(default)]
    pub delay_until_recursion_level: u32,

    /// Stay activated for N messages after the last live key match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sticky: Option<u32>,

    /// Suppress re-activation within N messages of a key match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooldown: Option<u32>,

    /// Inactive until the history has at least N messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<u32>,

    /// Per-entry override of the scan depth.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scan_depth: Option<usize>,

    /// Commit even when the worldbook token budget is exhausted.
    #[serde(default)]
    pub ignore_budget: bool,

    /// Include/exclude by agent name or tag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub character_filter: Option<CharacterFilter>,

    /// Per-entry case sensitivity override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub case_sensitive: Option<bool>,

    /// Per-entry whole-word override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_whole_words: Option<bool>,

    /// Scan the agent persona/character fields in addition to history.
    #[serde(default)]
    pub match_character: bool,

    /// Scan the user persona.
    #[serde(default)]
    pub match_persona: bool,

    /// Scan the scenario text.
    #[serde(default)]
    pub match_scenario: bool,

    /// Scan the author notes.
    #[serde(default)]
    pub match_notes: bool,

    /// Disabled entries never activate.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_role() -> Role {
    Role::System
}
fn default_probability() -> u8 {
    100
}
fn default_group_weight() -> u32 {
    100
}
fn default_enabled() -> bool {
    true
}

impl WorldbookEntry {
    /// A minimal keyed entry.
    pub fn keyed(uid: u32, keys: Vec<String>, content: impl Into<String>) -> Self {
        Self {
            uid,
            keys,
            secondary_keys: Vec::new(),
            content: content.into(),
            position: EntryPosition::default(),
            depth: None,
            order: 100,
            role: Role::System,
            constant: false,
            selective: false,
            selective_logic: SelectiveLogic::default(),
            probability: 100,
            use_probability: false,
            group: None,
            group_weight: 100,
            group_override: false,
            prevent_recursion: false,
            delay_until_recursion: false,
            delay_until_recursion_level: 0,
            sticky: None,
            cooldown: None,
            delay: None,
            scan_depth: None,
            ignore_budget: false,
            character_filter: None,
            case_sensitive: None,
            match_whole_words: None,
            match_character: false,
            match_persona: false,
            match_scenario: false,
            match_notes: false,
            enabled: true,
        }
    }

    /// A constant entry (always activates).
    pub fn constant(uid: u32, content: impl Into<String>) -> Self {
        Self {
            constant: true,
            ..Self::keyed(uid, Vec::new(), content)
        }
    }
}

/// Worldbook scan configuration on the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorldbookSettings {
    /// How many recent history messages feed the scan buffer.
    #[serde(default = "default_scan_depth")]
    pub scan_depth: usize,

    /// Token budget for committed entries (`ignore_budget` bypasses it).
    #[serde(default = "default_token_budget")]
    pub token_budget: usize,

    /// Whether activated content re-enters the scan (recursion).
    #[serde(default = "default_enabled")]
    pub recursive: bool,

    /// Hard ceiling on recursion rounds.
    #[serde(default = "default_max_recursion")]
    pub max_recursion_steps: u32,

    /// Default key matching case sensitivity.
    #[serde(default)]
    pub case_sensitive: bool,

    /// Default whole-word matching for literal keys.
    #[serde(default = "default_enabled")]
    pub match_whole_words: bool,
}

fn default_scan_depth() -> usize {
    10
}
fn default_token_budget() -> usize {
    1024
}
fn default_max_recursion() -> u32 {
    10
}

impl Default for WorldbookSettings {
    fn default() -> Self {
        Self {
            scan_depth: default_scan_depth(),
            token_budget: default_token_budget(),
            recursive: true,
            max_recursion_steps: default_max_recursion(),
            case_sensitive: false,
            match_whole_words: true,
        }
    }
}

/// A resolved worldbook source preloaded into the run by the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorldbookSource {
    pub id: String,
    pub name: String,
    pub entries: Vec<WorldbookEntry>,
}
