//! Prompt-assembly pipeline.
//!
//! Turns a branching session tree plus per-agent configuration
//! (presets, worldbook, retrieval settings, token budget) into the
//! exact message sequence for a completion call. Eight stages run in a
//! fixed order over one shared [`ChatContext`]; a failing stage
//! degrades the run instead of aborting it, and every stage appends
//! human-readable log entries suitable for a prompt-preview UI.

pub mod attachments;
pub mod budget;
pub mod context;
pub mod linearize;
pub mod macros;
pub mod presets;
pub mod retrieval;
pub mod shape;
pub mod stage;
pub mod test_support;
pub mod worldbook;

use std::collections::VecDeque;

use tracing::{info, warn};

use promptloom_core::message::WireMessage;
use promptloom_core::services::DocumentTransport;
use promptloom_core::worldbook::WorldbookSource;
use promptloom_core::{AgentSnapshot, ProfileSnapshot, Session};

pub use context::{
    ActivatedEntry, ChatContext, FormatDelta, LogEntry, LogLevel, TruncationStats, TurnRetrieval,
};
pub use stage::{default_stages, ContextProcessor, PipelineServices};

/// Everything one run consumes. Snapshots only: the pipeline never
/// reaches back into any store.
pub struct PipelineInput {
    pub session: Option<Session>,
    pub agent: Option<AgentSnapshot>,
    pub profile: Option<ProfileSnapshot>,
    pub model_id: String,
    pub document_transport: DocumentTransport,
    /// Worldbook content preloaded by the caller.
    pub worldbook_sources: Vec<WorldbookSource>,
    /// Retrieval ring carried over from previous turns.
    pub retrieval_history: VecDeque<TurnRetrieval>,
    /// Fixed seed for reproducible activation rolls; `None` = entropy.
    pub rng_seed: Option<u64>,
}

impl PipelineInput {
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            session: None,
            agent: None,
            profile: None,
            model_id: model_id.into(),
            document_transport: DocumentTransport::default(),
            worldbook_sources: Vec::new(),
            retrieval_history: VecDeque::new(),
            rng_seed: None,
        }
    }
}

/// What a run produces: the wire-ready messages plus everything a
/// prompt-preview UI wants to show.
pub struct PipelineOutput {
    pub messages: Vec<WireMessage>,
    pub log: Vec<LogEntry>,
    pub truncation: Option<TruncationStats>,
    pub format_delta: Option<FormatDelta>,
    /// Updated retrieval ring, to be carried into the next turn.
    pub retrieval_history: VecDeque<TurnRetrieval>,
    /// Outlet-positioned worldbook entries, for downstream substitution.
    pub outlet_entries: Vec<ActivatedEntry>,
}

/// The assembly pipeline: a fixed stage chain over injected backends.
pub struct Pipeline {
    services: PipelineServices,
    stages: Vec<Box<dyn ContextProcessor>>,
}

impl Pipeline {
    pub fn new(services: PipelineServices) -> Self {
        Self {
            services,
            stages: default_stages(),
        }
    }

    /// Run every stage in order. Stage errors degrade the run; the
    /// worst case is a shorter, less-enriched message list.
    pub async fn run(&self, input: PipelineInput) -> PipelineOutput {
        let mut ctx = ChatContext::new(input.model_id, input.rng_seed);

        if input.session.is_none() {
            warn!("no session supplied, producing an empty prompt");
            ctx.log_warn("pipeline", "no session supplied; output is empty");
            return finish(ctx);
        }
        ctx.session = input.session;
        ctx.agent = input.agent;
        ctx.profile = input.profile;
        ctx.document_transport = input.document_transport;
        ctx.extras.worldbook_sources = input.worldbook_sources;
        ctx.extras.retrieval_history = input.retrieval_history;

        for stage in &self.stages {
            if let Err(err) = stage.process(&mut ctx, &self.services).await {
                warn!(stage = stage.id(), %err, "stage failed, continuing degraded");
                ctx.log_warn(stage.id(), format!("stage failed: {err}"));
            }
        }
        info!(
            messages = ctx.messages.len(),
            log_entries = ctx.log.len(),
            "prompt assembled"
        );
        finish(ctx)
    }
}

fn finish(ctx: ChatContext) -> PipelineOutput {
    PipelineOutput {
        messages: ctx.messages.into_iter().map(WireMessage::from).collect(),
        log: ctx.log,
        truncation: ctx.extras.truncation,
        format_delta: ctx.extras.format_delta,
        retrieval_history: ctx.extras.retrieval_history,
        outlet_entries: ctx.extras.outlet_entries,
    }
}
