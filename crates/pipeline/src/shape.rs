//! Message shape formatter.
//!
//! Normalizes the assembled list into the role shape the target model
//! accepts. Four independently toggleable rules run in a fixed relative
//! order: merge all system messages into one at the head, merge runs of
//! consecutive same-role messages, convert system messages to user
//! role, and enforce strict user/assistant alternation with placeholder
//! turns. Each toggle resolves through three tiers: built-in default →
//! model-family default → per-agent override.

use async_trait::async_trait;
use tracing::debug;

use promptloom_core::agent::FormatOverrides;
use promptloom_core::message::{MessageSource, ProcessableMessage, Role};
use promptloom_core::Result;

use crate::context::{ChatContext, FormatDelta};
use crate::stage::{ContextProcessor, PipelineServices};

pub struct ShapeFormatter;

const ID: &str = "shape_formatter";

/// Fully resolved rule set for one run.
#[derive(Debug, Clone)]
struct ShapeRules {
    merge_system_head: bool,
    merge_consecutive: bool,
    system_to_user: bool,
    ensure_alternation: bool,
    merge_separator: String,
    user_filler: String,
    assistant_filler: String,
}

impl ShapeRules {
    fn builtin() -> Self {
        Self {
            merge_system_head: true,
            merge_consecutive: false,
            system_to_user: false,
            ensure_alternation: false,
            merge_separator: "\n\n".to_string(),
            user_filler: "Continue.".to_string(),
            assistant_filler: "Understood.".to_string(),
        }
    }

    /// Model-family defaults, keyed by substring of the model id.
    fn for_model(model_id: &str) -> Self {
        let mut rules = Self::builtin();
        let id = model_id.to_lowercase();
        if id.contains("claude") {
            rules.merge_consecutive = true;
            rules.ensure_alternation = true;
        }
        if id.contains("gemma") {
            rules.system_to_user = true;
            rules.ensure_alternation = true;
        }
        if id.contains("o1") {
            rules.system_to_user = true;
        }
        rules
    }

    /// Apply per-agent overrides on top.
    fn with_overrides(mut self, overrides: &FormatOverrides) -> Self {
        if let Some(v) = overrides.merge_system_head {
            self.merge_system_head = v;
        }
        if let Some(v) = overrides.merge_consecutive {
            self.merge_consecutive = v;
        }
        if let Some(v) = overrides.system_to_user {
            self.system_to_user = v;
        }
        if let Some(v) = overrides.ensure_alternation {
            self.ensure_alternation = v;
        }
        if let Some(v) = &overrides.merge_separator {
            self.merge_separator = v.clone();
        }
        if let Some(v) = &overrides.alternation_user_filler {
            self.user_filler = v.clone();
        }
        if let Some(v) = &overrides.alternation_assistant_filler {
            self.assistant_filler = v.clone();
        }
        self
    }
}

#[async_trait]
impl ContextProcessor for ShapeFormatter {
    fn id(&self) -> &'static str {
        ID
    }

    async fn process(&self, ctx: &mut ChatContext, _services: &PipelineServices) -> Result<()> {
        if ctx.messages.is_empty() {
            return Ok(());
        }
        let rules = match ctx.agent.as_ref() {
            Some(agent) => ShapeRules::for_model(&ctx.model_id).with_overrides(&agent.formatting),
            None => ShapeRules::for_model(&ctx.model_id),
        };
        debug!(?rules, "resolved shape rules");

        let mut delta = FormatDelta {
            messages_before: ctx.messages.len(),
            chars_before: char_total(&ctx.messages),
            tokens_before: token_total(&ctx.messages),
            ..FormatDelta::default()
        };

        let mut messages = std::mem::take(&mut ctx.messages);
        // Fixed relative order, regardless of configuration.
        if rules.merge_system_head {
            messages = merge_system_head(messages, &rules.merge_separator);
        }
        if rules.merge_consecutive {
            messages = merge_consecutive(messages, &rules.merge_separator);
        }
        if rules.system_to_user {
            for msg in &mut messages {
                if msg.role == Role::System {
                    msg.role = Role::User;
                }
            }
        }
        if rules.ensure_alternation {
            messages = ensure_alternation(
                messages,
                &rules.merge_separator,
                &rules.user_filler,
                &rules.assistant_filler,
            );
        }
        ctx.messages = messages;

        delta.messages_after = ctx.messages.len();
        delta.chars_after = char_total(&ctx.messages);
        delta.tokens_after = token_total(&ctx.messages);
        ctx.log_info(
            ID,
            format!(
                "shaped {} → {} message(s), {} → {} chars",
                delta.messages_before, delta.messages_after, delta.chars_before, delta.chars_after
            ),
        );
        ctx.extras.format_delta = Some(delta);
        Ok(())
    }
}

fn char_total(messages: &[ProcessableMessage]) -> usize {
    messages.iter().map(|m| m.plain_text().chars().count()).sum()
}

fn token_total(messages: &[ProcessableMessage]) -> usize {
    messages
        .iter()
        .map(|m| {
            m.token_count
                .unwrap_or_else(|| m.plain_text().chars().count() / 4)
        })
        .sum()
}

/// Collapse every system message into one at the head.
fn merge_system_head(
    messages: Vec<ProcessableMessage>,
    separator: &str,
) -> Vec<ProcessableMessage> {
    let system_count = messages.iter().filter(|m| m.role == Role::System).count();
    if system_count <= 1 {
        return messages;
    }
    let mut bodies: Vec<String> = Vec::with_capacity(system_count);
    let mut attachments = Vec::new();
    let mut rest: Vec<ProcessableMessage> = Vec::with_capacity(messages.len());
    let mut head_template: Option<ProcessableMessage> = None;
    for msg in messages {
        if msg.role == Role::System {
            bodies.push(msg.plain_text());
            attachments.extend(msg.attachments.clone());
            if head_template.is_none() {
                head_template = Some(msg);
            }
        } else {
            rest.push(msg);
        }
    }
    // `system_count > 1` guarantees a template exists.
    let mut head = match head_template {
        Some(head) => head,
        None => return rest,
    };
    head.content.set_text(bodies.join(separator));
    head.attachments = attachments;
    head.source = MessageSource::Merged;
    let mut out = Vec::with_capacity(rest.len() + 1);
    out.push(head);
    out.extend(rest);
    out
}

/// Collapse runs of consecutive same-role messages.
fn merge_consecutive(
    messages: Vec<ProcessableMessage>,
    separator: &str,
) -> Vec<ProcessableMessage> {
    let mut out: Vec<ProcessableMessage> = Vec::with_capacity(messages.len());
    for msg in messages {
        match out.last_mut() {
            Some(prev) if prev.role == msg.role => {
                let joined = format!("{}{}{}", prev.plain_text(), separator, msg.plain_text());
                prev.content.set_text(joined);
                prev.attachments.extend(msg.attachments);
                prev.source = MessageSource::Merged;
                prev.token_count = None;
            }
            _ => out.push(msg),
        }
    }
    out
}

/// Enforce that no two adjacent messages share a role. User/assistant
/// runs get a placeholder turn of the opposite role; adjacent system
/// messages fold into one instead of receiving a filler.
fn ensure_alternation(
    messages: Vec<ProcessableMessage>,
    separator: &str,
    user_filler: &str,
    assistant_filler: &str,
) -> Vec<ProcessableMessage> {
    let mut out: Vec<ProcessableMessage> = Vec::with_capacity(messages.len());
    for msg in messages {
        if let Some(prev) = out.last_mut() {
            if prev.role == msg.role {
                if msg.role == Role::System {
                    let joined = format!("{}{}{}", prev.plain_text(), separator, msg.plain_text());
                    prev.content.set_text(joined);
                    prev.attachments.extend(msg.attachments);
                    prev.source = MessageSource::Merged;
                    prev.token_count = None;
                    continue;
                }
                let (role, body) = match msg.role {
                    Role::User => (Role::Assistant, assistant_filler),
                    _ => (Role::User, user_filler),
                };
                out.push(ProcessableMessage::preset(role, body, "alternation-filler"));
            }
        }
        out.push(msg);
    }
    out
}
