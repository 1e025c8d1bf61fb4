//! Preset/Injection assembler.
//!
//! Takes the agent's configured preset list and merges it with the
//! (already worldbook-augmented) history. Presets are filtered by
//! `model_match` against the active model id (tested with and without
//! the provider prefix, keeping list positions for index bookkeeping),
//! macro-expanded, then classified: skeleton presets render in document
//! order, depth injections splice into history counted back from its
//! tail, and anchor injections render around the named skeleton anchor
//! they target. Worldbook entries positioned before/after the character
//! block arrive through the shared context and wrap the first literal
//! skeleton preset.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use regex::Regex;
use tracing::warn;

use promptloom_core::agent::{AnchorSide, InjectionStrategy, PresetMessage, PresetSlot};
use promptloom_core::message::{ProcessableMessage, Role};
use promptloom_core::Result;

use crate::context::ChatContext;
use crate::macros::MacroScope;
use crate::stage::{ContextProcessor, PipelineServices};

pub struct PresetAssembler;

const ID: &str = "preset_assembler";

#[async_trait]
impl ContextProcessor for PresetAssembler {
    fn id(&self) -> &'static str {
        ID
    }

    async fn process(&self, ctx: &mut ChatContext, _services: &PipelineServices) -> Result<()> {
        // Worldbook entries waiting to flank the character block.
        let mut flank_before = std::mem::take(&mut ctx.extras.before_character);
        let mut flank_after = std::mem::take(&mut ctx.extras.after_character);

        let Some(agent) = ctx.agent.clone() else {
            place_flanks_at_head(ctx, flank_before, flank_after);
            return Ok(());
        };
        if agent.presets.is_empty() {
            place_flanks_at_head(ctx, flank_before, flank_after);
            return Ok(());
        }

        let scope = MacroScope::from_context(ctx);
        let model_id = ctx.model_id.clone();
        let persona = ctx
            .profile
            .as_ref()
            .map(|p| scope.expand(&p.persona))
            .unwrap_or_default();
        let mut warnings: Vec<String> = Vec::new();

        // Applicability filter. Filtered presets stay in the list as
        // `None` so positions are preserved for index bookkeeping.
        let mut filtered = 0usize;
        let applicable: Vec<Option<PresetMessage>> = agent
            .presets
            .iter()
            .map(|preset| {
                if !preset.enabled {
                    return None;
                }
                if !preset.model_match.is_empty()
                    && !model_matches(&preset.model_match, &model_id, &mut warnings)
                {
                    filtered += 1;
                    return None;
                }
                let mut preset = preset.clone();
                preset.content = scope.expand(&preset.content);
                Some(preset)
            })
            .collect();

        // Classification.
        let mut skeleton: Vec<&PresetMessage> = Vec::new();
        let mut depth_groups: BTreeMap<usize, Vec<(i32, ProcessableMessage)>> = BTreeMap::new();
        let mut anchor_groups: HashMap<(String, AnchorSide), Vec<(i32, ProcessableMessage)>> =
            HashMap::new();
        for preset in applicable.iter().flatten() {
            match &preset.strategy {
                Some(InjectionStrategy::Depth { depth, order }) => {
                    let msg = ProcessableMessage::depth_injection(
                        preset.role,
                        preset.content.clone(),
                        &preset.id,
                    );
                    depth_groups.entry(*depth).or_default().push((*order, msg));
                }
                Some(InjectionStrategy::Anchor {
                    target,
                    position,
                    order,
                }) => {
                    let msg = ProcessableMessage::anchor_injection(
                        preset.role,
                        preset.content.clone(),
                        &preset.id,
                    );
                    anchor_groups
                        .entry((target.to_lowercase(), *position))
                        .or_default()
                        .push((*order, msg));
                }
                None => skeleton.push(preset),
            }
        }

        // Depth injections splice into history, deepest first so that
        // end-relative indices stay valid.
        let mut history = std::mem::take(&mut ctx.messages);
        for (depth, mut group) in std::mem::take(&mut depth_groups).into_iter().rev() {
            group.sort_by(|a, b| b.0.cmp(&a.0));
            let idx = history.len().saturating_sub(depth);
            history.splice(idx..idx, group.into_iter().map(|(_, m)| m));
        }

        // Skeleton walk. The first literal skeleton preset is the
        // character block; before/after-character worldbook entries
        // wrap it.
        let mut out: Vec<ProcessableMessage> = Vec::new();
        let mut history_placed = false;
        let mut character_placed = false;
        for preset in &skeleton {
            let target = preset.name.to_lowercase();
            out.extend(drain_anchor(&mut anchor_groups, &target, AnchorSide::Before));
            match preset.slot {
                Some(PresetSlot::ChatHistory) => {
                    out.append(&mut history);
                    history_placed = true;
                }
                Some(PresetSlot::UserProfile) => {
                    if !persona.trim().is_empty() {
                        out.push(ProcessableMessage::anchor_injection(
                            Role::System,
                            persona.clone(),
                            "profile:persona",
                        ));
                    }
                }
                None => {
                    if !preset.content.trim().is_empty() {
                        if !character_placed {
                            out.append(&mut flank_before);
                        }
                        out.push(ProcessableMessage::preset(
                            preset.role,
                            preset.content.clone(),
                            &preset.id,
                        ));
                        if !character_placed {
                            out.append(&mut flank_after);
                            character_placed = true;
                        }
                    }
                }
            }
            out.extend(drain_anchor(&mut anchor_groups, &target, AnchorSide::After));
        }
        if !history_placed {
            out.append(&mut history);
        }
        if !character_placed && (!flank_before.is_empty() || !flank_after.is_empty()) {
            // No character block rendered: both flanks land at the head.
            let mut head = flank_before;
            head.append(&mut flank_after);
            head.append(&mut out);
            out = head;
        }

        for ((target, _), group) in anchor_groups {
            warnings.push(format!(
                "{} anchor injection(s) target '{target}', which is not in the skeleton; dropped",
                group.len()
            ));
        }

        for w in warnings {
            warn!("{w}");
            ctx.log_warn(ID, w);
        }
        let total = out.len();
        ctx.messages = out;
        ctx.log_info(
            ID,
            format!(
                "assembled {total} message(s) from {} preset(s) ({filtered} model-filtered)",
                agent.presets.len()
            ),
        );
        Ok(())
    }
}

/// No skeleton to render: character-flank worldbook entries go to the
/// head of the current list, before-side first.
fn place_flanks_at_head(
    ctx: &mut ChatContext,
    mut before: Vec<ProcessableMessage>,
    mut after: Vec<ProcessableMessage>,
) {
    if before.is_empty() && after.is_empty() {
        return;
    }
    let mut out = Vec::with_capacity(before.len() + after.len() + ctx.messages.len());
    out.append(&mut before);
    out.append(&mut after);
    out.append(&mut ctx.messages);
    ctx.messages = out;
}

/// Remove and render one anchor group, highest order first.
fn drain_anchor(
    groups: &mut HashMap<(String, AnchorSide), Vec<(i32, ProcessableMessage)>>,
    target: &str,
    side: AnchorSide,
) -> Vec<ProcessableMessage> {
    let Some(mut group) = groups.remove(&(target.to_string(), side)) else {
        return Vec::new();
    };
    group.sort_by(|a, b| b.0.cmp(&a.0));
    group.into_iter().map(|(_, m)| m).collect()
}

/// Does any pattern match the model id, with or without its provider
/// prefix? Malformed patterns warn and never match.
fn model_matches(patterns: &[String], model_id: &str, warnings: &mut Vec<String>) -> bool {
    let stripped = model_id.split_once('/').map(|(_, m)| m).unwrap_or(model_id);
    patterns.iter().any(|pattern| match Regex::new(pattern) {
        Ok(re) => re.is_match(model_id) || re.is_match(stripped),
        Err(err) => {
            warnings.push(format!("invalid model_match pattern '{pattern}': {err}"));
            false
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linearize::HistoryLinearizer;
    use crate::test_support::{mock_services, session_with_turns};
    use promptloom_core::message::MessageSource;
    use promptloom_core::{AgentSnapshot, ProfileSnapshot};

    async fn run_assembler(
        model_id: &str,
        turns: &[(Role, &str)],
        presets: Vec<PresetMessage>,
        profile: Option<ProfileSnapshot>,
    ) -> ChatContext {
        let services = mock_services();
        let mut ctx = ChatContext::new(model_id, Some(7));
        ctx.session = Some(session_with_turns(turns));
        let mut agent = AgentSnapshot::named("a1", "Mira");
        agent.presets = presets;
        ctx.agent = Some(agent);
        ctx.profile = profile;
        HistoryLinearizer.process(&mut ctx, &services).await.unwrap();
        PresetAssembler.process(&mut ctx, &services).await.unwrap();
        ctx
    }

    fn texts(ctx: &ChatContext) -> Vec<String> {
        ctx.messages.iter().map(|m| m.plain_text()).collect()
    }

    #[tokio::test]
    async fn skeleton_renders_around_chat_history_slot() {
        let presets = vec![
            PresetMessage::skeleton("p1", "main", Role::System, "You are {{char}}."),
            PresetMessage::slot_marker("p2", PresetSlot::ChatHistory),
            PresetMessage::skeleton("p3", "jail", Role::System, "Stay in character."),
        ];
        let ctx = run_assembler(
            "test/model-1",
            &[(Role::User, "hi"), (Role::Assistant, "hello")],
            presets,
            None,
        )
        .await;
        assert_eq!(
            texts(&ctx),
            vec!["You are Mira.", "hi", "hello", "Stay in character."]
        );
        assert_eq!(ctx.messages[0].source, MessageSource::Preset);
        assert_eq!(ctx.messages[1].source, MessageSource::History);
    }

    #[tokio::test]
    async fn history_appends_last_without_a_slot() {
        let presets = vec![PresetMessage::skeleton("p1", "main", Role::System, "sys")];
        let ctx = run_assembler("test/model-1", &[(Role::User, "hi")], presets, None).await;
        assert_eq!(texts(&ctx), vec!["sys", "hi"]);
    }

    #[tokio::test]
    async fn model_match_tested_with_and_without_provider_prefix() {
        let mut a = PresetMessage::skeleton("p1", "a", Role::System, "alpha");
        a.model_match = vec!["gpt-4.*".into()];
        let mut b = PresetMessage::skeleton("p2", "b", Role::System, "beta");
        b.model_match = vec!["gpt-4.*".into()];

        let ctx = run_assembler("openai/gpt-4o", &[], vec![a.clone(), b.clone()], None).await;
        assert_eq!(texts(&ctx), vec!["alpha", "beta"]);

        let ctx = run_assembler("claude-3", &[], vec![a, b], None).await;
        assert!(texts(&ctx).is_empty());
        assert!(ctx
            .log
            .iter()
            .any(|e| e.message.contains("2 model-filtered")));
    }

    #[tokio::test]
    async fn invalid_model_match_pattern_disables_and_warns() {
        let mut preset = PresetMessage::skeleton("p1", "a", Role::System, "alpha");
        preset.model_match = vec!["gpt-(4".into()];
        let ctx = run_assembler("openai/gpt-4o", &[], vec![preset], None).await;
        assert!(texts(&ctx).is_empty());
        assert!(ctx
            .log
            .iter()
            .any(|e| e.message.contains("invalid model_match")));
    }

    #[tokio::test]
    async fn disabled_preset_emits_nothing() {
        let mut preset = PresetMessage::skeleton("p1", "a", Role::System, "alpha");
        preset.enabled = false;
        let ctx = run_assembler("test/model-1", &[(Role::User, "hi")], vec![preset], None).await;
        assert_eq!(texts(&ctx), vec!["hi"]);
    }

    #[tokio::test]
    async fn depth_injection_counts_back_from_history_tail() {
        let mut inject = PresetMessage::skeleton("p9", "note", Role::System, "injected");
        inject.strategy = Some(InjectionStrategy::Depth { depth: 2, order: 0 });
        let presets = vec![PresetMessage::slot_marker("p2", PresetSlot::ChatHistory), inject];
        let turns = [
            (Role::User, "m1"),
            (Role::Assistant, "m2"),
            (Role::User, "m3"),
            (Role::Assistant, "m4"),
            (Role::User, "m5"),
        ];
        let ctx = run_assembler("test/model-1", &turns, presets, None).await;
        assert_eq!(texts(&ctx), vec!["m1", "m2", "m3", "injected", "m4", "m5"]);
        assert_eq!(ctx.messages[3].source, MessageSource::DepthInjection);
    }

    #[tokio::test]
    async fn same_depth_injections_order_descending() {
        let mut low = PresetMessage::skeleton("p1", "low", Role::System, "low");
        low.strategy = Some(InjectionStrategy::Depth { depth: 1, order: 10 });
        let mut high = PresetMessage::skeleton("p2", "high", Role::System, "high");
        high.strategy = Some(InjectionStrategy::Depth { depth: 1, order: 90 });
        let presets = vec![
            PresetMessage::slot_marker("p0", PresetSlot::ChatHistory),
            low,
            high,
        ];
        let ctx = run_assembler(
            "test/model-1",
            &[(Role::User, "m1"), (Role::Assistant, "m2")],
            presets,
            None,
        )
        .await;
        assert_eq!(texts(&ctx), vec!["m1", "high", "low", "m2"]);
    }

    #[tokio::test]
    async fn anchor_injections_render_around_named_skeleton_preset() {
        let mut before = PresetMessage::skeleton("p1", "b", Role::System, "pre");
        before.strategy = Some(InjectionStrategy::Anchor {
            target: "Main".into(),
            position: AnchorSide::Before,
            order: 0,
        });
        let mut after = PresetMessage::skeleton("p2", "a", Role::System, "post");
        after.strategy = Some(InjectionStrategy::Anchor {
            target: "main".into(),
            position: AnchorSide::After,
            order: 0,
        });
        let presets = vec![
            before,
            PresetMessage::skeleton("p3", "main", Role::System, "core"),
            after,
        ];
        let ctx = run_assembler("test/model-1", &[], presets, None).await;
        assert_eq!(texts(&ctx), vec!["pre", "core", "post"]);
        assert_eq!(ctx.messages[0].source, MessageSource::AnchorInjection);
    }

    #[tokio::test]
    async fn user_profile_slot_expands_persona_and_its_anchors() {
        let mut tail = PresetMessage::skeleton("p1", "t", Role::System, "after profile");
        tail.strategy = Some(InjectionStrategy::Anchor {
            target: "user_profile".into(),
            position: AnchorSide::After,
            order: 0,
        });
        let presets = vec![PresetMessage::slot_marker("p0", PresetSlot::UserProfile), tail];
        let profile = ProfileSnapshot {
            name: "Alex".into(),
            persona: "{{user}} is a night-shift botanist.".into(),
        };
        let ctx = run_assembler("test/model-1", &[], presets, Some(profile)).await;
        assert_eq!(
            texts(&ctx),
            vec!["Alex is a night-shift botanist.", "after profile"]
        );
    }

    #[tokio::test]
    async fn unanchored_injection_is_dropped_with_warning() {
        let mut stray = PresetMessage::skeleton("p1", "s", Role::System, "stray");
        stray.strategy = Some(InjectionStrategy::Anchor {
            target: "ghost".into(),
            position: AnchorSide::Before,
            order: 0,
        });
        let ctx = run_assembler("test/model-1", &[(Role::User, "hi")], vec![stray], None).await;
        assert_eq!(texts(&ctx), vec!["hi"]);
        assert!(ctx.log.iter().any(|e| e.message.contains("ghost")));
    }

    #[tokio::test]
    async fn character_flanks_wrap_the_first_literal_preset() {
        let services = mock_services();
        let mut ctx = ChatContext::new("test/model-1", Some(7));
        ctx.session = Some(session_with_turns(&[(Role::User, "hello")]));
        let mut agent = AgentSnapshot::named("a1", "Mira");
        agent.presets = vec![
            PresetMessage::skeleton("p1", "main", Role::System, "Character card."),
            PresetMessage::slot_marker("p2", PresetSlot::ChatHistory),
        ];
        ctx.agent = Some(agent);
        HistoryLinearizer.process(&mut ctx, &services).await.unwrap();
        ctx.extras.before_character.push(ProcessableMessage::anchor_injection(
            Role::System,
            "Before lore.",
            "wb:main:1",
        ));
        ctx.extras.after_character.push(ProcessableMessage::anchor_injection(
            Role::System,
            "After lore.",
            "wb:main:2",
        ));
        PresetAssembler.process(&mut ctx, &services).await.unwrap();
        assert_eq!(
            texts(&ctx),
            vec!["Before lore.", "Character card.", "After lore.", "hello"]
        );
        assert!(ctx.extras.before_character.is_empty());
        assert!(ctx.extras.after_character.is_empty());
    }

    #[tokio::test]
    async fn character_flanks_fall_back_to_the_head_without_a_skeleton() {
        let services = mock_services();
        let mut ctx = ChatContext::new("test/model-1", Some(7));
        ctx.session = Some(session_with_turns(&[(Role::User, "hello")]));
        ctx.agent = Some(AgentSnapshot::named("a1", "Mira"));
        HistoryLinearizer.process(&mut ctx, &services).await.unwrap();
        ctx.extras.before_character.push(ProcessableMessage::anchor_injection(
            Role::System,
            "Before lore.",
            "wb:main:1",
        ));
        ctx.extras.after_character.push(ProcessableMessage::anchor_injection(
            Role::System,
            "After lore.",
            "wb:main:2",
        ));
        PresetAssembler.process(&mut ctx, &services).await.unwrap();
        assert_eq!(texts(&ctx), vec!["Before lore.", "After lore.", "hello"]);
    }

    #[tokio::test]
    async fn macros_expand_in_preset_bodies() {
        let presets = vec![PresetMessage::skeleton(
            "p1",
            "main",
            Role::System,
            "{{char}} meets {{user}}.",
        )];
        let profile = ProfileSnapshot {
            name: "Alex".into(),
            persona: String::new(),
        };
        let ctx = run_assembler("test/model-1", &[], presets, Some(profile)).await;
        assert_eq!(texts(&ctx), vec!["Mira meets Alex."]);
    }

    #[tokio::test]
    async fn empty_skeleton_content_emits_nothing() {
        let presets = vec![PresetMessage::skeleton("p1", "blank", Role::System, "   ")];
        let ctx = run_assembler("test/model-1", &[(Role::User, "hi")], presets, None).await;
        assert_eq!(texts(&ctx), vec!["hi"]);
    }
}
