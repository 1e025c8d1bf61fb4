//! History Linearizer — turns the session tree into a flat ordered list.
//!
//! Walks the active leaf to the root via parent pointers (cycle-guarded),
//! hides nodes superseded by enabled compression nodes, drops disabled
//! and empty nodes, excludes the root, and reverses to chronological
//! order. Optionally downgrades rich markup to plain text on all but the
//! most recent K messages to cut token cost on older turns; that
//! conversion is heuristic and never fails — a conversion that would
//! empty the body falls back to the original.

use std::collections::HashSet;

use async_trait::async_trait;
use tracing::debug;

use promptloom_core::message::ProcessableMessage;
use promptloom_core::Result;

use crate::context::ChatContext;
use crate::stage::{ContextProcessor, PipelineServices};

pub struct HistoryLinearizer;

const ID: &str = "history_linearizer";

#[async_trait]
impl ContextProcessor for HistoryLinearizer {
    fn id(&self) -> &'static str {
        ID
    }

    async fn process(&self, ctx: &mut ChatContext, _services: &PipelineServices) -> Result<()> {
        let Some(session) = ctx.session.as_ref() else {
            ctx.log_warn(ID, "no session supplied; history is empty");
            return Ok(());
        };

        let path = match session.active_path() {
            Ok(path) => path,
            Err(err) => {
                let msg = format!("session walk failed: {err}");
                ctx.log_warn(ID, msg);
                return Ok(());
            }
        };

        // First pass (leaf→root): union of ids hidden by enabled
        // compression nodes on the path.
        let mut hidden: HashSet<&str> = HashSet::new();
        for node in &path {
            if node.enabled && node.metadata.is_compression_node {
                hidden.extend(node.metadata.compressed_node_ids.iter().map(String::as_str));
            }
        }

        // Second pass: collect non-root, non-hidden, enabled, non-empty
        // nodes, then reverse to chronological order.
        let mut messages: Vec<ProcessableMessage> = Vec::new();
        for node in &path {
            if node.parent_id.is_none() {
                continue; // root is never part of history
            }
            if !node.enabled || hidden.contains(node.id.as_str()) {
                continue;
            }
            if node.content.trim().is_empty() && node.attachments.is_empty() {
                continue;
            }
            let mut msg = ProcessableMessage::history(node.role, node.content.clone(), &node.id);
            msg.attachments = node.attachments.clone();
            messages.push(msg);
        }
        messages.reverse();
        for (i, msg) in messages.iter_mut().enumerate() {
            msg.source_index = Some(i);
        }

        // Markup downgrade window.
        if let Some(agent) = ctx.agent.as_ref() {
            if let Some(keep_rich) = agent.context.plain_text_after {
                let cutoff = messages.len().saturating_sub(keep_rich);
                let mut converted = 0usize;
                for msg in messages.iter_mut().take(cutoff) {
                    let body = msg.plain_text();
                    if looks_marked_up(&body) {
                        let plain = strip_markup(&body);
                        if !plain.trim().is_empty() {
                            msg.content.set_text(plain);
                            converted += 1;
                        }
                    }
                }
                if converted > 0 {
                    debug!(converted, "downgraded markup on older history messages");
                }
            }
        }

        let total = path.len().saturating_sub(1);
        let kept = messages.len();
        ctx.messages = messages;
        ctx.log_info(
            ID,
            format!(
                "linearized {kept} of {total} nodes ({} hidden by compression)",
                hidden.len()
            ),
        );
        Ok(())
    }
}

/// Heuristic: does the body look structurally marked up?
fn looks_marked_up(text: &str) -> bool {
    if text.contains("```") || text.contains("**") || text.contains("](") {
        return true;
    }
    text.lines()
        .any(|line| line.starts_with('#') || line.starts_with("> ") || line.starts_with("- "))
}

/// Best-effort markup→plain conversion. Pure string surgery; it cannot
/// fail, only produce something shorter.
fn strip_markup(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_fence = false;
    for line in text.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("```") {
            in_fence = !in_fence;
            continue;
        }
        if in_fence {
            out.push_str(line);
            out.push('\n');
            continue;
        }
        let mut line = trimmed.trim_start_matches('#').trim_start().to_string();
        if let Some(rest) = line.strip_prefix("> ") {
            line = rest.to_string();
        }
        if let Some(rest) = line.strip_prefix("- ") {
            line = rest.to_string();
        }
        line = line.replace("**", "").replace("__", "");
        line = strip_links(&line);
        line = line.replace('`', "");
        out.push_str(&line);
        out.push('\n');
    }
    out.trim_end().to_string()
}

/// Rewrite `[label](target)` to `label`.
fn strip_links(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut rest = line;
    while let Some(open) = rest.find('[') {
        let Some(mid) = rest[open..].find("](") else {
            break;
        };
        let Some(close) = rest[open + mid..].find(')') else {
            break;
        };
        out.push_str(&rest[..open]);
        out.push_str(&rest[open + 1..open + mid]);
        rest = &rest[open + mid + close + 1..];
    }
    out.push_str(rest);
    out
}
