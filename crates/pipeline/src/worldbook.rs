//! Knowledge-Injection (worldbook) engine.
//!
//! Scans recent history (plus flag-gated persona/character/scenario/notes
//! fields and a recursion buffer of already-activated content) against
//! each entry's keys, runs the recursive activation loop with
//! inclusion-group competition and a token budget, then splices the
//! winners into the message list at their mapped positions.
//!
//! Activation draws go through the run's seedable rng, so outcomes are
//! reproducible under a fixed seed.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use async_trait::async_trait;
use rand::Rng;
use regex::RegexBuilder;
use tracing::{debug, warn};

use promptloom_core::message::ProcessableMessage;
use promptloom_core::worldbook::{
    EntryPosition, SelectiveLogic, WorldbookEntry, WorldbookSettings,
};
use promptloom_core::{KnowledgeError, Result};

use crate::context::{ActivatedEntry, ChatContext};
use crate::stage::{ContextProcessor, PipelineServices};

pub struct WorldbookEngine;

const ID: &str = "worldbook_engine";

/// A flattened entry with its source id.
#[derive(Clone)]
struct SourcedEntry {
    source: String,
    entry: WorldbookEntry,
}

impl SourcedEntry {
    fn key(&self) -> String {
        format!("wb:{}:{}", self.source, self.entry.uid)
    }
}

#[async_trait]
impl ContextProcessor for WorldbookEngine {
    fn id(&self) -> &'static str {
        ID
    }

    async fn process(&self, ctx: &mut ChatContext, services: &PipelineServices) -> Result<()> {
        let Some(agent) = ctx.agent.clone() else {
            return Ok(());
        };
        let settings = agent.worldbook.clone();
        let entries: Vec<SourcedEntry> = ctx
            .extras
            .worldbook_sources
            .iter()
            .flat_map(|src| {
                src.entries.iter().map(|e| SourcedEntry {
                    source: src.id.clone(),
                    entry: e.clone(),
                })
            })
            .filter(|s| s.entry.enabled)
            .collect();
        if entries.is_empty() {
            return Ok(());
        }

        let model_id = ctx.model_id.clone();
        let profile_persona = ctx
            .profile
            .as_ref()
            .map(|p| p.persona.clone())
            .unwrap_or_default();

        // Chronological plain-text history; reversed view is built per
        // entry (scan depth varies).
        let history: Vec<String> = ctx.messages.iter().map(|m| m.plain_text()).collect();
        let mut warnings: Vec<String> = Vec::new();
        let mut rng = ctx.rng.clone();

        // Recursion-delay levels, lowest first.
        let levels: BTreeSet<u32> = entries
            .iter()
            .filter(|s| s.entry.delay_until_recursion)
            .map(|s| s.entry.delay_until_recursion_level)
            .collect();

        let mut activated: HashSet<String> = HashSet::new();
        let mut exhausted: HashSet<String> = HashSet::new(); // budget-skipped
        let mut committed_groups: HashSet<String> = HashSet::new();
        let mut committed: Vec<ActivatedEntry> = Vec::new();
        let mut recursion_buffer: Vec<String> = Vec::new();
        let mut budget_spent = 0usize;
        let mut current_level = 0u32;
        let mut hit_ceiling = true;

        for _round in 0..settings.max_recursion_steps.max(1) {
            // Collect this round's candidates.
            let mut candidates: Vec<&SourcedEntry> = Vec::new();
            for sourced in &entries {
                let key = sourced.key();
                if activated.contains(&key) || exhausted.contains(&key) {
                    continue;
                }
                if sourced.entry.delay_until_recursion
                    && sourced.entry.delay_until_recursion_level > current_level
                {
                    continue;
                }
                if let Some(group) = &sourced.entry.group {
                    if committed_groups.contains(group) {
                        continue;
                    }
                }
                if entry_activates(
                    &sourced.entry,
                    &history,
                    &recursion_buffer,
                    &settings,
                    &agent.name,
                    &agent.tags,
                    &agent.character_definition,
                    &agent.personality,
                    &agent.scenario,
                    &agent.author_notes,
                    &profile_persona,
                    &mut rng,
                    &mut warnings,
                ) {
                    candidates.push(sourced);
                }
            }

            // Inclusion-group competition: one winner per group.
            let winners = resolve_groups(candidates, &mut rng);

            // Budgeted commit, highest order first for determinism.
            let mut winners = winners;
            winners.sort_by(|a, b| b.entry.order.cmp(&a.entry.order));
            let mut committed_this_round = false;
            for sourced in winners {
                let key = sourced.key();
                let tokens = match services.token_counter.count(&sourced.entry.content, &model_id).await
                {
                    Ok(n) => n,
                    Err(err) => {
                        warnings.push(format!("token count failed for {key}: {err}"));
                        sourced.entry.content.chars().count() / 4
                    }
                };
                if !sourced.entry.ignore_budget && budget_spent + tokens > settings.token_budget {
                    exhausted.insert(key.clone());
                    debug!(entry = %key, tokens, "worldbook budget exhausted, entry skipped");
                    warnings.push(format!(
                        "entry {key} skipped: {tokens} tokens over budget ({budget_spent}/{})",
                        settings.token_budget
                    ));
                    continue;
                }
                budget_spent += tokens;
                activated.insert(key.clone());
                if let Some(group) = &sourced.entry.group {
                    committed_groups.insert(group.clone());
                }
                if settings.recursive && !sourced.entry.prevent_recursion {
                    recursion_buffer.push(sourced.entry.content.clone());
                }
                committed.push(ActivatedEntry {
                    source_id: key,
                    uid: sourced.entry.uid,
                    content: sourced.entry.content.clone(),
                    role: sourced.entry.role,
                    position: sourced.entry.position,
                    depth: sourced.entry.depth,
                    order: sourced.entry.order,
                    tokens,
                });
                committed_this_round = true;
            }

            if !committed_this_round {
                // Advance to the next delayed-recursion level, if any.
                match levels.iter().find(|l| **l > current_level) {
                    Some(next) => current_level = *next,
                    None => {
                        hit_ceiling = false;
                        break;
                    }
                }
            }
        }
        if hit_ceiling {
            warnings.push(
                KnowledgeError::RecursionCeiling(settings.max_recursion_steps.max(1)).to_string(),
            );
        }

        ctx.rng = rng;
        for w in warnings {
            warn!("{w}");
            ctx.log_warn(ID, w);
        }

        // Splice the winners; outlet entries are recorded only.
        let (outlet, spliced): (Vec<_>, Vec<_>) = committed
            .iter()
            .cloned()
            .partition(|e| e.position == EntryPosition::Outlet);
        inject(ctx, &spliced);
        let committed_count = committed.len();
        ctx.extras.activated_entries = committed;
        ctx.extras.outlet_entries = outlet;

        ctx.log_info(
            ID,
            format!(
                "activated {committed_count} entr(ies), {budget_spent}/{} budget tokens",
                settings.token_budget
            ),
        );
        Ok(())
    }
}

// ── Activation test ───────────────────────────────────────────────────────

#[allow(clippy::too_many_arguments)]
fn entry_activates(
    entry: &WorldbookEntry,
    history: &[String],
    recursion_buffer: &[String],
    settings: &WorldbookSettings,
    agent_name: &str,
    agent_tags: &[String],
    character_definition: &str,
    personality: &str,
    scenario: &str,
    notes: &str,
    persona: &str,
    rng: &mut impl Rng,
    warnings: &mut Vec<String>,
) -> bool {
    let case_sensitive = entry.case_sensitive.unwrap_or(settings.case_sensitive);
    let whole_words = entry.match_whole_words.unwrap_or(settings.match_whole_words);

    let matched = if entry.constant {
        // Constant entries skip the key-based tests entirely.
        true
    } else {
        // Delay: inactive until the history is long enough.
        if let Some(delay) = entry.delay {
            if (history.len() as u32) < delay {
                return false;
            }
        }

        // Cooldown: a key match within the window suppresses activation.
        if let Some(cooldown) = entry.cooldown.filter(|c| *c > 0) {
            if let Some(distance) =
                last_match_distance(entry, history, case_sensitive, whole_words, warnings)
            {
                if distance <= cooldown {
                    return false;
                }
            }
        }

        // Primary keys against the scan buffer.
        let buffer = scan_buffer(
            entry,
            history,
            recursion_buffer,
            settings,
            character_definition,
            personality,
            scenario,
            notes,
            persona,
        );
        let live = any_key_matches(
            entry.uid,
            &entry.keys,
            &buffer,
            case_sensitive,
            whole_words,
            warnings,
        );

        // Sticky: a recent (but no longer live) match keeps the entry on.
        if live {
            true
        } else if let Some(sticky) = entry.sticky.filter(|s| *s > 0) {
            matches!(
                last_match_distance(entry, history, case_sensitive, whole_words, warnings),
                Some(distance) if distance <= sticky
            )
        } else {
            false
        }
    };
    if !matched {
        return false;
    }

    // Selective secondary-key logic can veto.
    if entry.selective && !entry.secondary_keys.is_empty() {
        let buffer = scan_buffer(
            entry,
            history,
            recursion_buffer,
            settings,
            character_definition,
            personality,
            scenario,
            notes,
            persona,
        );
        let hits: Vec<bool> = entry
            .secondary_keys
            .iter()
            .map(|k| {
                single_key_matches(entry.uid, k, &buffer, case_sensitive, whole_words, warnings)
            })
            .collect();
        let passed = match entry.selective_logic {
            SelectiveLogic::AndAny => hits.iter().any(|h| *h),
            SelectiveLogic::AndAll => hits.iter().all(|h| *h),
            SelectiveLogic::NotAny => !hits.iter().any(|h| *h),
            SelectiveLogic::NotAll => hits.iter().any(|h| !*h),
        };
        if !passed {
            return false;
        }
    }

    // Probability roll can veto.
    if entry.use_probability && entry.probability < 100 {
        let roll: u8 = rng.gen_range(0..100);
        if roll >= entry.probability {
            return false;
        }
    }

    // Character filter can veto or require.
    if let Some(filter) = &entry.character_filter {
        if !filter.allows(agent_name, agent_tags) {
            return false;
        }
    }

    true
}

/// Scan buffer for one entry: most-recent-first history slice plus
/// flag-gated agent fields plus the recursion buffer.
#[allow(clippy::too_many_arguments)]
fn scan_buffer(
    entry: &WorldbookEntry,
    history: &[String],
    recursion_buffer: &[String],
    settings: &WorldbookSettings,
    character_definition: &str,
    personality: &str,
    scenario: &str,
    notes: &str,
    persona: &str,
) -> String {
    let depth = entry.scan_depth.unwrap_or(settings.scan_depth);
    let mut parts: Vec<&str> = history
        .iter()
        .rev()
        .take(depth)
        .map(String::as_str)
        .collect();
    if entry.match_character {
        parts.push(character_definition);
        parts.push(personality);
    }
    if entry.match_persona {
        parts.push(persona);
    }
    if entry.match_scenario {
        parts.push(scenario);
    }
    if entry.match_notes {
        parts.push(notes);
    }
    parts.extend(recursion_buffer.iter().map(String::as_str));
    parts.join("\n")
}

/// Distance (1 = most recent) of the newest history message matching any
/// primary key, ignoring scan depth.
fn last_match_distance(
    entry: &WorldbookEntry,
    history: &[String],
    case_sensitive: bool,
    whole_words: bool,
    warnings: &mut Vec<String>,
) -> Option<u32> {
    for (i, text) in history.iter().rev().enumerate() {
        if any_key_matches(
            entry.uid,
            &entry.keys,
            text,
            case_sensitive,
            whole_words,
            warnings,
        ) {
            return Some(i as u32 + 1);
        }
    }
    None
}

fn any_key_matches(
    uid: u32,
    keys: &[String],
    haystack: &str,
    case_sensitive: bool,
    whole_words: bool,
    warnings: &mut Vec<String>,
) -> bool {
    keys.iter()
        .any(|k| single_key_matches(uid, k, haystack, case_sensitive, whole_words, warnings))
}

/// One key against the buffer: `/regex/flags`, whole-word, or substring.
fn single_key_matches(
    uid: u32,
    key: &str,
    haystack: &str,
    case_sensitive: bool,
    whole_words: bool,
    warnings: &mut Vec<String>,
) -> bool {
    let key = key.trim();
    if key.is_empty() {
        return false;
    }

    // `/pattern/flags` syntax.
    if let Some(stripped) = key.strip_prefix('/') {
        if let Some(slash) = stripped.rfind('/') {
            let (pattern, flags) = stripped.split_at(slash);
            let flags = &flags[1..];
            return match RegexBuilder::new(pattern)
                .case_insensitive(flags.contains('i'))
                .multi_line(flags.contains('m'))
                .dot_matches_new_line(flags.contains('s'))
                .build()
            {
                Ok(re) => re.is_match(haystack),
                Err(err) => {
                    // Recoverable per-item: the key just never matches.
                    warnings.push(
                        KnowledgeError::InvalidKeyPattern {
                            uid,
                            pattern: key.to_string(),
                            reason: err.to_string(),
                        }
                        .to_string(),
                    );
                    false
                }
            };
        }
    }

    if whole_words {
        let pattern = format!(r"\b{}\b", regex::escape(key));
        if let Ok(re) = RegexBuilder::new(&pattern)
            .case_insensitive(!case_sensitive)
            .build()
        {
            return re.is_match(haystack);
        }
    }

    if case_sensitive {
        haystack.contains(key)
    } else {
        haystack.to_lowercase().contains(&key.to_lowercase())
    }
}

// ── Group competition ─────────────────────────────────────────────────────

/// One winner per inclusion group: an explicit override wins outright,
/// otherwise a draw weighted by `group_weight`. Non-grouped candidates
/// always proceed.
fn resolve_groups<'a>(
    candidates: Vec<&'a SourcedEntry>,
    rng: &mut impl Rng,
) -> Vec<&'a SourcedEntry> {
    let mut winners: Vec<&SourcedEntry> = Vec::new();
    let mut groups: BTreeMap<&str, Vec<&SourcedEntry>> = BTreeMap::new();
    for sourced in candidates {
        match &sourced.entry.group {
            Some(group) => groups.entry(group.as_str()).or_default().push(sourced),
            None => winners.push(sourced),
        }
    }
    for (_, members) in groups {
        if members.len() == 1 {
            winners.push(members[0]);
            continue;
        }
        if let Some(winner) = members
            .iter()
            .filter(|m| m.entry.group_override)
            .max_by_key(|m| m.entry.order)
        {
            winners.push(winner);
            continue;
        }
        let total: u64 = members.iter().map(|m| m.entry.group_weight.max(1) as u64).sum();
        let mut draw = rng.gen_range(0..total);
        for member in &members {
            let weight = member.entry.group_weight.max(1) as u64;
            if draw < weight {
                winners.push(member);
                break;
            }
            draw -= weight;
        }
    }
    winners
}

// ── Injection ─────────────────────────────────────────────────────────────

/// Splice committed entries into the message list, sorted by descending
/// order. Anchors sit around the first history message and depth counts
/// back from the tail. Before/after-character entries go into the shared
/// context instead: the character block does not exist yet at this
/// stage, so the preset assembler places them once it renders it.
fn inject(ctx: &mut ChatContext, committed: &[ActivatedEntry]) {
    let mut sorted: Vec<&ActivatedEntry> = committed.iter().collect();
    sorted.sort_by(|a, b| b.order.cmp(&a.order));

    let mut head_before: Vec<ProcessableMessage> = Vec::new();
    let mut head_after: Vec<ProcessableMessage> = Vec::new();
    let mut before_anchor: Vec<ProcessableMessage> = Vec::new();
    let mut after_anchor: Vec<ProcessableMessage> = Vec::new();
    let mut at_depth: BTreeMap<usize, Vec<ProcessableMessage>> = BTreeMap::new();

    for entry in sorted {
        let msg = match entry.position {
            EntryPosition::AtDepth => ProcessableMessage::depth_injection(
                entry.role,
                entry.content.clone(),
                &entry.source_id,
            ),
            _ => ProcessableMessage::anchor_injection(
                entry.role,
                entry.content.clone(),
                &entry.source_id,
            ),
        };
        match entry.position {
            EntryPosition::BeforeCharacter => head_before.push(msg),
            EntryPosition::AfterCharacter => head_after.push(msg),
            EntryPosition::BeforeAnchor => before_anchor.push(msg),
            EntryPosition::AfterAnchor => after_anchor.push(msg),
            EntryPosition::AtDepth => at_depth
                .entry(entry.depth.unwrap_or(0))
                .or_default()
                .push(msg),
            EntryPosition::Outlet => {}
        }
    }

    let mut history = std::mem::take(&mut ctx.messages);

    // Depth splices, deepest first; end-relative indices stay valid.
    for (depth, msgs) in at_depth.into_iter().rev() {
        let idx = history.len().saturating_sub(depth);
        history.splice(idx..idx, msgs);
    }

    let mut assembled = Vec::with_capacity(history.len() + 4);
    assembled.append(&mut before_anchor);
    let mut rest = history.into_iter();
    if let Some(first) = rest.next() {
        assembled.push(first);
        assembled.append(&mut after_anchor);
    } else {
        assembled.append(&mut after_anchor);
    }
    assembled.extend(rest);
    ctx.messages = assembled;

    ctx.extras.before_character.append(&mut head_before);
    ctx.extras.after_character.append(&mut head_after);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{mock_services, session_with_turns};
    use crate::linearize::HistoryLinearizer;
    use crate::presets::PresetAssembler;
    use promptloom_core::message::{MessageSource, Role};
    use promptloom_core::worldbook::{CharacterFilter, WorldbookSource};
    use promptloom_core::AgentSnapshot;

    async fn run_engine(
        turns: &[(Role, &str)],
        entries: Vec<WorldbookEntry>,
        tweak: impl FnOnce(&mut AgentSnapshot),
    ) -> ChatContext {
        let services = mock_services();
        let mut ctx = ChatContext::new("test/model-1", Some(7));
        ctx.session = Some(session_with_turns(turns));
        let mut agent = AgentSnapshot::named("a1", "Mira");
        tweak(&mut agent);
        ctx.agent = Some(agent);
        ctx.extras.worldbook_sources = vec![WorldbookSource {
            id: "main".into(),
            name: "Main Book".into(),
            entries,
        }];
        HistoryLinearizer.process(&mut ctx, &services).await.unwrap();
        WorldbookEngine.process(&mut ctx, &services).await.unwrap();
        // Before/after-character entries are placed by the assembler.
        PresetAssembler.process(&mut ctx, &services).await.unwrap();
        ctx
    }

    fn activated_uids(ctx: &ChatContext) -> Vec<u32> {
        let mut uids: Vec<u32> = ctx.extras.activated_entries.iter().map(|e| e.uid).collect();
        uids.sort_unstable();
        uids
    }

    #[tokio::test]
    async fn constant_entry_always_activates() {
        let ctx = run_engine(
            &[(Role::User, "nothing relevant here")],
            vec![WorldbookEntry::constant(1, "Always present lore.")],
            |_| {},
        )
        .await;
        assert_eq!(activated_uids(&ctx), vec![1]);
        assert!(ctx
            .messages
            .iter()
            .any(|m| m.plain_text() == "Always present lore."));
    }

    #[tokio::test]
    async fn keyed_entry_needs_a_key_match() {
        let entries = vec![
            WorldbookEntry::keyed(1, vec!["dragon".into()], "Dragon lore."),
            WorldbookEntry::keyed(2, vec!["kraken".into()], "Kraken lore."),
        ];
        let ctx = run_engine(&[(Role::User, "tell me about the Dragon")], entries, |_| {}).await;
        assert_eq!(activated_uids(&ctx), vec![1]);
    }

    #[tokio::test]
    async fn whole_word_matching_rejects_substrings() {
        let entries = vec![WorldbookEntry::keyed(1, vec!["cat".into()], "Cat lore.")];
        let ctx = run_engine(&[(Role::User, "let's concatenate strings")], entries, |_| {}).await;
        assert!(activated_uids(&ctx).is_empty());
    }

    #[tokio::test]
    async fn substring_matching_when_whole_words_off() {
        let entries = vec![WorldbookEntry::keyed(1, vec!["cat".into()], "Cat lore.")];
        let ctx = run_engine(&[(Role::User, "let's concatenate strings")], entries, |a| {
            a.worldbook.match_whole_words = false;
        })
        .await;
        assert_eq!(activated_uids(&ctx), vec![1]);
    }

    #[tokio::test]
    async fn regex_key_with_flags() {
        let entries = vec![WorldbookEntry::keyed(
            1,
            vec!["/dra(gon|ke)/i".into()],
            "Drake lore.",
        )];
        let ctx = run_engine(&[(Role::User, "a DRAKE appears")], entries, |_| {}).await;
        assert_eq!(activated_uids(&ctx), vec![1]);
    }

    #[tokio::test]
    async fn malformed_regex_is_recoverable() {
        let entries = vec![
            WorldbookEntry::keyed(1, vec!["/dra(gon/i".into()], "Broken."),
            WorldbookEntry::keyed(2, vec!["drake".into()], "Fine."),
        ];
        let ctx = run_engine(&[(Role::User, "a drake appears")], entries, |_| {}).await;
        assert_eq!(activated_uids(&ctx), vec![2]);
        assert!(ctx.log.iter().any(|e| e.message.contains("Invalid key pattern")));
    }

    #[tokio::test]
    async fn selective_and_all_vetoes() {
        let mut entry = WorldbookEntry::keyed(1, vec!["dragon".into()], "Lore.");
        entry.selective = true;
        entry.secondary_keys = vec!["mountain".into(), "gold".into()];
        entry.selective_logic = SelectiveLogic::AndAll;
        let ctx = run_engine(
            &[(Role::User, "the dragon sleeps on gold")],
            vec![entry.clone()],
            |_| {},
        )
        .await;
        assert!(activated_uids(&ctx).is_empty());

        let ctx = run_engine(
            &[(Role::User, "the dragon in the mountain hoards gold")],
            vec![entry],
            |_| {},
        )
        .await;
        assert_eq!(activated_uids(&ctx), vec![1]);
    }

    #[tokio::test]
    async fn selective_not_any_vetoes_on_secondary_hit() {
        let mut entry = WorldbookEntry::keyed(1, vec!["dragon".into()], "Lore.");
        entry.selective = true;
        entry.secondary_keys = vec!["friendly".into()];
        entry.selective_logic = SelectiveLogic::NotAny;
        let ctx = run_engine(
            &[(Role::User, "a friendly dragon waves")],
            vec![entry.clone()],
            |_| {},
        )
        .await;
        assert!(activated_uids(&ctx).is_empty());

        let ctx = run_engine(&[(Role::User, "a grumpy dragon")], vec![entry], |_| {}).await;
        assert_eq!(activated_uids(&ctx), vec![1]);
    }

    #[tokio::test]
    async fn zero_probability_always_vetoes() {
        let mut entry = WorldbookEntry::keyed(1, vec!["dragon".into()], "Lore.");
        entry.use_probability = true;
        entry.probability = 0;
        let ctx = run_engine(&[(Role::User, "dragon!")], vec![entry], |_| {}).await;
        assert!(activated_uids(&ctx).is_empty());
    }

    #[tokio::test]
    async fn group_members_are_mutually_exclusive() {
        let mut a = WorldbookEntry::keyed(1, vec!["dragon".into()], "A.");
        a.group = Some("dragons".into());
        let mut b = WorldbookEntry::keyed(2, vec!["dragon".into()], "B.");
        b.group = Some("dragons".into());
        let ctx = run_engine(&[(Role::User, "dragon")], vec![a, b], |_| {}).await;
        assert_eq!(ctx.extras.activated_entries.len(), 1);
    }

    #[tokio::test]
    async fn group_override_wins_outright() {
        let mut a = WorldbookEntry::keyed(1, vec!["dragon".into()], "A.");
        a.group = Some("dragons".into());
        a.group_weight = 1_000_000;
        let mut b = WorldbookEntry::keyed(2, vec!["dragon".into()], "B.");
        b.group = Some("dragons".into());
        b.group_override = true;
        let ctx = run_engine(&[(Role::User, "dragon")], vec![a, b], |_| {}).await;
        assert_eq!(activated_uids(&ctx), vec![2]);
    }

    #[tokio::test]
    async fn budget_skips_oversized_entry_unless_ignored() {
        // 200 chars → 50 tokens with the 4-chars/token counter.
        let content = "x".repeat(200);
        let mut entry = WorldbookEntry::constant(1, content.clone());
        entry.ignore_budget = false;
        let ctx = run_engine(
            &[
                (Role::User, "one"),
                (Role::Assistant, "two"),
                (Role::User, "three"),
            ],
            vec![entry.clone()],
            |a| a.worldbook.token_budget = 40,
        )
        .await;
        assert!(activated_uids(&ctx).is_empty());
        assert!(ctx.log.iter().any(|e| e.message.contains("over budget")));

        entry.ignore_budget = true;
        let ctx = run_engine(
            &[
                (Role::User, "one"),
                (Role::Assistant, "two"),
                (Role::User, "three"),
            ],
            vec![entry],
            |a| a.worldbook.token_budget = 40,
        )
        .await;
        assert_eq!(activated_uids(&ctx), vec![1]);
    }

    #[tokio::test]
    async fn budgeted_entries_never_exceed_ceiling() {
        // Each entry costs 10 tokens; budget 25 fits two.
        let entries: Vec<WorldbookEntry> = (0..5)
            .map(|i| WorldbookEntry::constant(i, "y".repeat(40)))
            .collect();
        let ctx = run_engine(&[(Role::User, "hi")], entries, |a| {
            a.worldbook.token_budget = 25;
        })
        .await;
        let spent: usize = ctx
            .extras
            .activated_entries
            .iter()
            .map(|e| e.tokens)
            .sum();
        assert!(spent <= 25);
        assert_eq!(ctx.extras.activated_entries.len(), 2);
    }

    #[tokio::test]
    async fn recursion_activates_chained_entries() {
        let a = WorldbookEntry::keyed(1, vec!["dragon".into()], "The dragon guards the citadel.");
        let b = WorldbookEntry::keyed(2, vec!["citadel".into()], "The citadel is ancient.");
        let ctx = run_engine(&[(Role::User, "dragon?")], vec![a, b], |_| {}).await;
        assert_eq!(activated_uids(&ctx), vec![1, 2]);
    }

    #[tokio::test]
    async fn prevent_recursion_blocks_the_chain() {
        let mut a = WorldbookEntry::keyed(1, vec!["dragon".into()], "The dragon guards the citadel.");
        a.prevent_recursion = true;
        let b = WorldbookEntry::keyed(2, vec!["citadel".into()], "The citadel is ancient.");
        let ctx = run_engine(&[(Role::User, "dragon?")], vec![a, b], |_| {}).await;
        assert_eq!(activated_uids(&ctx), vec![1]);
    }

    #[tokio::test]
    async fn recursion_ceiling_is_reported() {
        let a = WorldbookEntry::keyed(1, vec!["dragon".into()], "The dragon guards the citadel.");
        let b = WorldbookEntry::keyed(2, vec!["citadel".into()], "The citadel is ancient.");
        let ctx = run_engine(&[(Role::User, "dragon?")], vec![a, b], |a| {
            a.worldbook.max_recursion_steps = 1;
        })
        .await;
        // The chain's second link never gets a round.
        assert_eq!(activated_uids(&ctx), vec![1]);
        assert!(ctx.log.iter().any(|e| e.message.contains("Recursion ceiling")));
    }

    #[tokio::test]
    async fn delayed_recursion_waits_for_lower_levels() {
        // B only matches A's content AND is delayed to level 1: it must
        // still activate once level 0 exhausts.
        let a = WorldbookEntry::keyed(1, vec!["dragon".into()], "The dragon guards the citadel.");
        let mut b = WorldbookEntry::keyed(2, vec!["citadel".into()], "The citadel is ancient.");
        b.delay_until_recursion = true;
        b.delay_until_recursion_level = 1;
        let ctx = run_engine(&[(Role::User, "dragon?")], vec![a, b], |_| {}).await;
        assert_eq!(activated_uids(&ctx), vec![1, 2]);
    }

    #[tokio::test]
    async fn delay_gates_on_history_length() {
        let mut entry = WorldbookEntry::keyed(1, vec!["hi".into()], "Lore.");
        entry.delay = Some(5);
        let ctx = run_engine(&[(Role::User, "hi")], vec![entry.clone()], |_| {}).await;
        assert!(activated_uids(&ctx).is_empty());

        let turns: Vec<(Role, &str)> = (0..5)
            .map(|i| {
                if i % 2 == 0 {
                    (Role::User, "hi")
                } else {
                    (Role::Assistant, "hello")
                }
            })
            .collect();
        let ctx = run_engine(&turns, vec![entry], |_| {}).await;
        assert_eq!(activated_uids(&ctx), vec![1]);
    }

    #[tokio::test]
    async fn sticky_keeps_entry_alive_past_scan_depth() {
        let mut entry = WorldbookEntry::keyed(1, vec!["dragon".into()], "Lore.");
        entry.scan_depth = Some(1); // only the latest message is scanned
        entry.sticky = Some(3);
        let ctx = run_engine(
            &[
                (Role::User, "the dragon!"),
                (Role::Assistant, "noted"),
                (Role::User, "anyway"),
            ],
            vec![entry],
            |_| {},
        )
        .await;
        assert_eq!(activated_uids(&ctx), vec![1]);
    }

    #[tokio::test]
    async fn cooldown_suppresses_recent_match() {
        let mut entry = WorldbookEntry::keyed(1, vec!["dragon".into()], "Lore.");
        entry.cooldown = Some(2);
        let ctx = run_engine(&[(Role::User, "the dragon!")], vec![entry], |_| {}).await;
        assert!(activated_uids(&ctx).is_empty());
    }

    #[tokio::test]
    async fn character_filter_vetoes_other_agents() {
        let mut entry = WorldbookEntry::keyed(1, vec!["dragon".into()], "Lore.");
        entry.character_filter = Some(CharacterFilter {
            exclude: false,
            names: vec!["Kai".into()],
            tags: vec![],
        });
        let ctx = run_engine(&[(Role::User, "dragon")], vec![entry], |_| {}).await;
        assert!(activated_uids(&ctx).is_empty()); // agent is "Mira"
    }

    #[tokio::test]
    async fn outlet_entries_are_recorded_not_spliced() {
        let mut entry = WorldbookEntry::constant(1, "Outlet content.");
        entry.position = EntryPosition::Outlet;
        let ctx = run_engine(&[(Role::User, "hi")], vec![entry], |_| {}).await;
        assert_eq!(ctx.extras.outlet_entries.len(), 1);
        assert!(!ctx.messages.iter().any(|m| m.plain_text() == "Outlet content."));
    }

    #[tokio::test]
    async fn depth_position_counts_back_from_tail() {
        let mut entry = WorldbookEntry::constant(1, "Depth lore.");
        entry.position = EntryPosition::AtDepth;
        entry.depth = Some(2);
        let turns: Vec<(Role, &str)> = vec![
            (Role::User, "m1"),
            (Role::Assistant, "m2"),
            (Role::User, "m3"),
            (Role::Assistant, "m4"),
            (Role::User, "m5"),
        ];
        let ctx = run_engine(&turns, vec![entry], |_| {}).await;
        let texts: Vec<String> = ctx.messages.iter().map(|m| m.plain_text()).collect();
        // Inserted immediately before the 4th message.
        assert_eq!(texts, vec!["m1", "m2", "m3", "Depth lore.", "m4", "m5"]);
        assert_eq!(ctx.messages[3].source, MessageSource::DepthInjection);
    }

    #[tokio::test]
    async fn character_positions_wrap_the_character_block() {
        use promptloom_core::agent::{PresetMessage, PresetSlot};
        let mut before = WorldbookEntry::constant(1, "Before lore.");
        before.position = EntryPosition::BeforeCharacter;
        let mut after = WorldbookEntry::constant(2, "After lore.");
        after.position = EntryPosition::AfterCharacter;
        let ctx = run_engine(&[(Role::User, "hello")], vec![before, after], |a| {
            a.presets = vec![
                PresetMessage::skeleton("p1", "main", Role::System, "Character card."),
                PresetMessage::slot_marker("p2", PresetSlot::ChatHistory),
            ];
        })
        .await;
        let texts: Vec<String> = ctx.messages.iter().map(|m| m.plain_text()).collect();
        assert_eq!(
            texts,
            vec!["Before lore.", "Character card.", "After lore.", "hello"]
        );
    }

    #[tokio::test]
    async fn injection_order_is_descending() {
        let mut a = WorldbookEntry::constant(1, "low");
        a.order = 10;
        let mut b = WorldbookEntry::constant(2, "high");
        b.order = 90;
        let ctx = run_engine(&[(Role::User, "hi")], vec![a, b], |_| {}).await;
        let texts: Vec<String> = ctx.messages.iter().map(|m| m.plain_text()).collect();
        assert_eq!(texts, vec!["high", "low", "hi"]);
    }

    #[tokio::test]
    async fn match_scenario_flag_scans_agent_fields() {
        let mut entry = WorldbookEntry::keyed(1, vec!["volcano".into()], "Volcano lore.");
        entry.match_scenario = true;
        let ctx = run_engine(&[(Role::User, "hello")], vec![entry], |a| {
            a.scenario = "A tense meeting near the volcano.".into();
        })
        .await;
        assert_eq!(activated_uids(&ctx), vec![1]);
    }
}
