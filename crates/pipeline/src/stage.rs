//! Stage trait and the explicit stage order.
//!
//! The pipeline is a sequential chain: each stage receives the same
//! [`ChatContext`], may replace `context.messages` wholesale, and appends
//! log entries describing what it did. The order of [`default_stages`]
//! is the single source of truth for execution order — there are no
//! numeric priorities. Ordering invariants:
//!
//! - budgeting must see preset content already injected
//! - binary attachment resolution is absolutely last

use std::sync::Arc;

use async_trait::async_trait;

use promptloom_core::services::{
    AttachmentServices, EmbeddingService, KnowledgeSearch, TokenCounter,
};
use promptloom_core::Result;

use crate::attachments::{BinaryAttachmentResolver, TextAttachmentResolver};
use crate::budget::TokenBudgetLimiter;
use crate::context::ChatContext;
use crate::linearize::HistoryLinearizer;
use crate::presets::PresetAssembler;
use crate::retrieval::RetrievalResolver;
use crate::shape::ShapeFormatter;
use crate::worldbook::WorldbookEngine;

/// The external backends a run consumes.
#[derive(Clone)]
pub struct PipelineServices {
    pub token_counter: Arc<dyn TokenCounter>,
    pub embeddings: Arc<dyn EmbeddingService>,
    pub search: Arc<dyn KnowledgeSearch>,
    pub attachments: Arc<dyn AttachmentServices>,
}

/// One stage of the assembly pipeline.
///
/// A stage returning `Err` degrades the run (the orchestrator logs it
/// and moves on); it never aborts later stages.
#[async_trait]
pub trait ContextProcessor: Send + Sync {
    /// Stable stage identifier, used in log entries.
    fn id(&self) -> &'static str;

    async fn process(&self, ctx: &mut ChatContext, services: &PipelineServices) -> Result<()>;
}

/// The fixed stage order.
pub fn default_stages() -> Vec<Box<dyn ContextProcessor>> {
    vec![
        Box::new(HistoryLinearizer),
        Box::new(TextAttachmentResolver),
        Box::new(WorldbookEngine),
        Box::new(PresetAssembler),
        Box::new(RetrievalResolver),
        Box::new(TokenBudgetLimiter),
        Box::new(ShapeFormatter),
        Box::new(BinaryAttachmentResolver),
    ]
}
