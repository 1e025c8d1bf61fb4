//! Retrieval-augmented knowledge resolver.
//!
//! Scans message bodies for `{{kb[:source] key=value ...}}` placeholders
//! and replaces active ones with a templated block of ranked results.
//! Recognized keys: `limit`, `min`, `mode` (`always|gate|turn|static`),
//! `keys` (gate keyword list), `every` (turn interval), `ids` (static
//! entry ids). An inactive placeholder is deleted in place and no
//! retrieval runs.
//!
//! Active lookups go through a layered cache: embeddings are cached by
//! exact query text, and a similarity-threshold cache of recent
//! retrievals short-circuits the backend when the blended query vector
//! is near a recent one. Non-static retrievals are appended to a bounded
//! per-turn ring so later turns can blend vectors and carry results
//! over with decayed weight.

use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, warn};

use promptloom_core::agent::RetrievalSettings;
use promptloom_core::message::Role;
use promptloom_core::services::{SearchHit, SearchQuery};
use promptloom_core::{Result, RetrievalError};

use crate::context::{CachedRetrieval, ChatContext, TurnRetrieval};
use crate::stage::{ContextProcessor, PipelineServices};

pub struct RetrievalResolver;

const ID: &str = "retrieval_resolver";

#[derive(Debug, Clone, PartialEq)]
enum ActivationMode {
    Always,
    Gate(Vec<String>),
    Turn(usize),
    Static(Vec<String>),
}

#[derive(Debug, Clone)]
struct Placeholder {
    source: Option<String>,
    limit: usize,
    min_score: f32,
    mode: ActivationMode,
}

#[async_trait]
impl ContextProcessor for RetrievalResolver {
    fn id(&self) -> &'static str {
        ID
    }

    async fn process(&self, ctx: &mut ChatContext, services: &PipelineServices) -> Result<()> {
        let settings = ctx
            .agent
            .as_ref()
            .map(|a| a.retrieval.clone())
            .unwrap_or_default();
        let pattern = match Regex::new(r"\{\{kb(?::([A-Za-z0-9_-]+))?((?:\s+[^}\s]+)*)\s*\}\}") {
            Ok(re) => re,
            Err(err) => {
                ctx.log_warn(ID, format!("placeholder pattern failed to compile: {err}"));
                return Ok(());
            }
        };

        let query = query_window(ctx, settings.query_window);
        let user_turns = ctx.user_turns();
        let mut resolved = 0usize;
        let mut deleted = 0usize;

        for msg_index in 0..ctx.messages.len() {
            let text = ctx.messages[msg_index].plain_text();
            if !text.contains("{{kb") {
                continue;
            }

            // Collect placeholders first; substitution happens after the
            // async lookups so the borrow of `text` stays local.
            let mut pieces: Vec<(std::ops::Range<usize>, String)> = Vec::new();
            for caps in pattern.captures_iter(&text) {
                let whole = caps.get(0).map(|m| m.range()).unwrap_or(0..0);
                let source = caps.get(1).map(|m| m.as_str().to_string());
                let params = caps.get(2).map(|m| m.as_str()).unwrap_or("");
                let placeholder = match parse_placeholder(source, params, &settings) {
                    Ok(p) => p,
                    Err(reason) => {
                        ctx.log_warn(ID, RetrievalError::MalformedPlaceholder(reason).to_string());
                        deleted += 1;
                        pieces.push((whole, String::new()));
                        continue;
                    }
                };

                if !is_active(&placeholder.mode, &query, user_turns) {
                    debug!(mode = ?placeholder.mode, "placeholder inactive, deleted");
                    deleted += 1;
                    pieces.push((whole, String::new()));
                    continue;
                }

                let block = match resolve(ctx, services, &settings, &placeholder, &query).await {
                    Ok(block) => block,
                    Err(err) => {
                        ctx.log_warn(ID, format!("retrieval failed: {err}"));
                        deleted += 1;
                        String::new()
                    }
                };
                if !block.is_empty() {
                    resolved += 1;
                }
                pieces.push((whole, block));
            }

            if pieces.is_empty() {
                continue;
            }
            let mut rebuilt = String::with_capacity(text.len());
            let mut cursor = 0usize;
            for (range, replacement) in pieces {
                rebuilt.push_str(&text[cursor..range.start]);
                rebuilt.push_str(&replacement);
                cursor = range.end;
            }
            rebuilt.push_str(&text[cursor..]);
            ctx.messages[msg_index].content.set_text(rebuilt);
        }

        if resolved + deleted > 0 {
            ctx.log_info(
                ID,
                format!("{resolved} placeholder(s) resolved, {deleted} deleted"),
            );
        }
        Ok(())
    }
}

// ── Placeholder grammar ───────────────────────────────────────────────────

fn parse_placeholder(
    source: Option<String>,
    params: &str,
    settings: &RetrievalSettings,
) -> std::result::Result<Placeholder, String> {
    let mut limit = settings.default_limit;
    let mut min_score = settings.default_min_score;
    let mut mode_name: Option<String> = None;
    let mut keys: Vec<String> = Vec::new();
    let mut every: Option<usize> = None;
    let mut ids: Vec<String> = Vec::new();

    for token in params.split_whitespace() {
        let Some((key, value)) = token.split_once('=') else {
            return Err(format!("expected key=value, got '{token}'"));
        };
        match key {
            "limit" => {
                limit = value
                    .parse()
                    .map_err(|_| format!("limit '{value}' is not a number"))?
            }
            "min" => {
                min_score = value
                    .parse()
                    .map_err(|_| format!("min '{value}' is not a number"))?
            }
            "mode" => mode_name = Some(value.to_string()),
            "keys" => keys = value.split(',').map(str::to_string).collect(),
            "every" => {
                every = Some(
                    value
                        .parse()
                        .map_err(|_| format!("every '{value}' is not a number"))?,
                )
            }
            "ids" => ids = value.split(',').map(str::to_string).collect(),
            other => return Err(format!("unknown key '{other}'")),
        }
    }

    let mode = match mode_name.as_deref() {
        None | Some("always") => ActivationMode::Always,
        Some("gate") => {
            if keys.is_empty() {
                return Err("gate mode requires keys=".into());
            }
            ActivationMode::Gate(keys)
        }
        Some("turn") => {
            let every = every.ok_or("turn mode requires every=")?;
            if every == 0 {
                return Err("every must be positive".into());
            }
            ActivationMode::Turn(every)
        }
        Some("static") => {
            if ids.is_empty() {
                return Err("static mode requires ids=".into());
            }
            ActivationMode::Static(ids)
        }
        Some(other) => return Err(format!("unknown mode '{other}'")),
    };

    Ok(Placeholder {
        source,
        limit,
        min_score,
        mode,
    })
}

fn is_active(mode: &ActivationMode, query: &str, user_turns: usize) -> bool {
    match mode {
        ActivationMode::Always | ActivationMode::Static(_) => true,
        ActivationMode::Gate(keys) => {
            let haystack = query.to_lowercase();
            keys.iter().any(|k| haystack.contains(&k.to_lowercase()))
        }
        ActivationMode::Turn(every) => user_turns > 0 && user_turns % every == 0,
    }
}

// ── Lookup ────────────────────────────────────────────────────────────────

async fn resolve(
    ctx: &mut ChatContext,
    services: &PipelineServices,
    settings: &RetrievalSettings,
    placeholder: &Placeholder,
    query: &str,
) -> Result<String> {
    // Static mode bypasses scoring, gating, caching, and the ring.
    if let ActivationMode::Static(ids) = &placeholder.mode {
        let hits = services
            .search
            .fetch(ids, placeholder.source.as_deref())
            .await?;
        return Ok(format_block(&hits, settings));
    }

    if query.trim().is_empty() {
        return Ok(String::new());
    }

    // Embedding, cached by exact query text.
    let vector = match ctx.extras.embedding_cache.get(query) {
        Some(v) => v.clone(),
        None => {
            let v = services
                .embeddings
                .embed(query, &settings.embedding_model)
                .await?;
            ctx.extras
                .embedding_cache
                .insert(query.to_string(), v.clone());
            v
        }
    };

    // Blend with decayed prior-turn vectors for topical continuity.
    let blended = blend_vectors(
        &vector,
        &ctx.extras.retrieval_history,
        settings.blend_decay,
        settings.blend_window,
    );

    // Similarity-threshold cache of recent retrievals.
    let cached = ctx
        .extras
        .retrieval_cache
        .iter()
        .find(|c| cosine(&c.vector, &blended) >= settings.cache_similarity_threshold)
        .map(|c| c.hits.clone());
    let mut hits = match cached {
        Some(hits) => {
            debug!("retrieval served from similarity cache");
            hits
        }
        None => {
            let request = SearchQuery {
                query: query.to_string(),
                vector: Some(blended.clone()),
                limit: placeholder.limit,
                min_score: placeholder.min_score,
                source_id: placeholder.source.clone(),
                model_id: Some(settings.embedding_model.clone()),
            };
            let hits = services.search.search(&request).await?;
            ctx.extras.retrieval_cache.push(CachedRetrieval {
                vector: blended.clone(),
                hits: hits.clone(),
            });
            hits
        }
    };

    // Decayed result carryover: same id keeps the maximum weighted score.
    if settings.blend_window > 0 {
        for (i, turn) in ctx
            .extras
            .retrieval_history
            .iter()
            .rev()
            .take(settings.blend_window)
            .enumerate()
        {
            let weight = settings.blend_decay.powi(i as i32 + 1);
            for old in &turn.hits {
                let weighted = old.score * weight;
                match hits.iter_mut().find(|h| h.id == old.id) {
                    Some(existing) => existing.score = existing.score.max(weighted),
                    None => {
                        let mut carried = old.clone();
                        carried.score = weighted;
                        hits.push(carried);
                    }
                }
            }
        }
    }

    hits.retain(|h| h.score >= placeholder.min_score);
    hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    hits.truncate(placeholder.limit);

    // Ring append for future turns.
    ctx.extras.retrieval_history.push_back(TurnRetrieval {
        query: query.to_string(),
        vector: blended,
        hits: hits.clone(),
    });
    while ctx.extras.retrieval_history.len() > settings.history_capacity {
        ctx.extras.retrieval_history.pop_front();
    }

    Ok(format_block(&hits, settings))
}

/// Most recent user turns, oldest first, joined into one query string.
fn query_window(ctx: &ChatContext, window: usize) -> String {
    let mut turns: Vec<String> = ctx
        .messages
        .iter()
        .rev()
        .filter(|m| !m.is_protected() && m.role == Role::User)
        .take(window.max(1))
        .map(|m| m.plain_text())
        .collect();
    turns.reverse();
    turns.join("\n")
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na * nb)
}

/// Weighted average of the current vector and decayed prior-turn
/// vectors. Window 0 disables blending.
fn blend_vectors(
    current: &[f32],
    history: &std::collections::VecDeque<TurnRetrieval>,
    decay: f32,
    window: usize,
) -> Vec<f32> {
    if window == 0 || history.is_empty() {
        return current.to_vec();
    }
    let mut acc: Vec<f32> = current.to_vec();
    let mut total = 1.0f32;
    for (i, turn) in history.iter().rev().take(window).enumerate() {
        if turn.vector.len() != acc.len() {
            continue;
        }
        let weight = decay.powi(i as i32 + 1);
        for (a, v) in acc.iter_mut().zip(&turn.vector) {
            *a += v * weight;
        }
        total += weight;
    }
    for a in &mut acc {
        *a /= total;
    }
    acc
}

/// Render hits through the per-result and block templates, bounded by
/// the character budget.
fn format_block(hits: &[SearchHit], settings: &RetrievalSettings) -> String {
    if hits.is_empty() {
        return String::new();
    }
    let mut lines: Vec<String> = Vec::new();
    let mut chars = 0usize;
    for hit in hits {
        let line = settings
            .result_template
            .replace("{source}", &hit.source)
            .replace("{score}", &format!("{:.2}", hit.score))
            .replace("{content}", &hit.content);
        let cost = line.chars().count() + 1;
        if chars + cost > settings.char_budget && !lines.is_empty() {
            warn!("retrieval block hit the character budget");
            break;
        }
        chars += cost;
        lines.push(line);
    }
    settings
        .block_template
        .replace("{results}", &lines.join("\n"))
}
