//! Token budget limiter.
//!
//! Costs every message through the external counting service (in
//! parallel, folded back by index), then fits history into whatever
//! budget remains after protected (preset/injected) content. History is
//! walked newest to oldest; the first message that would overflow is
//! dropped, or — when `retained_chars` is configured — truncated to a
//! leading substring with an ellipsis and re-costed, kept only if the
//! truncated cost fits. Everything older is dropped. Message order is
//! preserved, and a run that already fits changes nothing.

use std::collections::HashMap;

use async_trait::async_trait;
use futures::future::join_all;
use tracing::{debug, warn};

use promptloom_core::agent::ContextSettings;
use promptloom_core::Result;

use crate::context::{ChatContext, TruncationStats};
use crate::stage::{ContextProcessor, PipelineServices};

pub struct TokenBudgetLimiter;

const ID: &str = "token_budget_limiter";

const ELLIPSIS: &str = "…";

#[async_trait]
impl ContextProcessor for TokenBudgetLimiter {
    fn id(&self) -> &'static str {
        ID
    }

    async fn process(&self, ctx: &mut ChatContext, services: &PipelineServices) -> Result<()> {
        if ctx.messages.is_empty() {
            return Ok(());
        }
        let settings = ctx
            .agent
            .as_ref()
            .map(|a| a.context.clone())
            .unwrap_or_else(ContextSettings::default);
        let model_id = ctx.model_id.clone();

        // Parallel cost pass, folded back by index.
        let counts = join_all(ctx.messages.iter().map(|msg| {
            let text = msg.plain_text();
            let attachments = msg.attachments.clone();
            let model_id = model_id.clone();
            async move {
                services
                    .token_counter
                    .count_message(&text, &model_id, &attachments)
                    .await
            }
        }))
        .await;
        let mut fallbacks = 0usize;
        for (i, outcome) in counts.into_iter().enumerate() {
            let tokens = match outcome {
                Ok(n) => n,
                Err(err) => {
                    fallbacks += 1;
                    debug!(index = i, %err, "token count failed, estimating");
                    ctx.messages[i].plain_text().chars().count() / 4
                }
            };
            ctx.messages[i].token_count = Some(tokens);
        }
        if fallbacks > 0 {
            let msg = format!("{fallbacks} message(s) costed by character estimate");
            warn!("{msg}");
            ctx.log_warn(ID, msg);
        }

        let protected_tokens: usize = ctx
            .messages
            .iter()
            .filter(|m| m.is_protected())
            .filter_map(|m| m.token_count)
            .sum();
        let total_history: usize = ctx
            .messages
            .iter()
            .filter(|m| !m.is_protected())
            .filter_map(|m| m.token_count)
            .sum();
        let available = settings.max_tokens.saturating_sub(protected_tokens);

        // Newest-to-oldest accumulation over history positions.
        let mut kept: HashMap<usize, Option<(String, usize)>> = HashMap::new();
        let mut history_tokens = 0usize;
        let mut boundary_hit = false;
        for idx in (0..ctx.messages.len()).rev() {
            if ctx.messages[idx].is_protected() {
                continue;
            }
            if boundary_hit || available == 0 {
                continue;
            }
            let cost = ctx.messages[idx].token_count.unwrap_or(0);
            if history_tokens + cost <= available {
                kept.insert(idx, None);
                history_tokens += cost;
                continue;
            }
            // Boundary message: partial retention, if configured.
            if let Some(retain) = settings.retained_chars.filter(|r| *r > 0) {
                let text = ctx.messages[idx].plain_text();
                if text.chars().count() > retain {
                    let truncated: String =
                        text.chars().take(retain).collect::<String>() + ELLIPSIS;
                    let recost = match services.token_counter.count(&truncated, &model_id).await {
                        Ok(n) => n,
                        Err(_) => truncated.chars().count() / 4,
                    };
                    if history_tokens + recost <= available {
                        kept.insert(idx, Some((truncated, recost)));
                        history_tokens += recost;
                    }
                }
            }
            boundary_hit = true;
        }

        // Rebuild in original order.
        let before = ctx.messages.len();
        let mut partially_retained = 0usize;
        let messages = std::mem::take(&mut ctx.messages);
        let mut out = Vec::with_capacity(messages.len());
        for (idx, mut msg) in messages.into_iter().enumerate() {
            if msg.is_protected() {
                out.push(msg);
                continue;
            }
            match kept.remove(&idx) {
                Some(None) => out.push(msg),
                Some(Some((truncated, recost))) => {
                    msg.content.set_text(truncated);
                    msg.token_count = Some(recost);
                    msg.is_truncated = true;
                    partially_retained += 1;
                    out.push(msg);
                }
                None => {} // dropped
            }
        }
        let kept_count = out.iter().filter(|m| !m.is_protected()).count();
        let dropped = before - out.len();
        ctx.messages = out;

        let stats = TruncationStats {
            kept: kept_count,
            dropped,
            partially_retained,
            tokens_saved: total_history.saturating_sub(history_tokens),
            protected_tokens,
            history_tokens,
        };
        ctx.log_info(
            ID,
            format!(
                "history fits in {history_tokens}/{available} tokens ({} kept, {} dropped, {} truncated; protected {protected_tokens})",
                stats.kept, stats.dropped, stats.partially_retained
            ),
        );
        ctx.extras.truncation = Some(stats);
        Ok(())
    }
}
