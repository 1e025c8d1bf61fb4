//! Scripted test doubles for the external services, plus small fixture
//! builders shared by unit and integration tests.
//!
//! Kept as a public module so the crate-level tests under `tests/` can
//! drive the full pipeline with the same mocks the unit tests use.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use promptloom_core::error::{Error, Result};
use promptloom_core::message::{Attachment, Role};
use promptloom_core::services::{
    AttachmentServices, EmbeddingService, KnowledgeSearch, SearchHit, SearchQuery, TokenCounter,
    TranscriptOutcome,
};
use promptloom_core::session::MessageNode;
use promptloom_core::{AgentSnapshot, Session};

use crate::context::ChatContext;
use crate::stage::{ContextProcessor, PipelineServices};

// ── Token counting ────────────────────────────────────────────────────────

/// Character-heuristic counter: 1 token ≈ `chars_per_token` characters,
/// rounded up, plus a flat per-attachment cost.
pub struct EstimateCounter {
    pub chars_per_token: usize,
    pub attachment_cost: usize,
}

impl Default for EstimateCounter {
    fn default() -> Self {
        Self {
            chars_per_token: 4,
            attachment_cost: 96,
        }
    }
}

#[async_trait]
impl TokenCounter for EstimateCounter {
    async fn count(&self, text: &str, _model_id: &str) -> Result<usize> {
        if text.is_empty() {
            return Ok(0);
        }
        Ok((text.chars().count() + self.chars_per_token - 1) / self.chars_per_token)
    }

    async fn count_message(
        &self,
        text: &str,
        model_id: &str,
        attachments: &[Attachment],
    ) -> Result<usize> {
        Ok(self.count(text, model_id).await? + attachments.len() * self.attachment_cost)
    }
}

/// A counter that always fails, for degraded-path tests.
pub struct FailingCounter;

#[async_trait]
impl TokenCounter for FailingCounter {
    async fn count(&self, _text: &str, _model_id: &str) -> Result<usize> {
        Err(Error::TokenCount("counting backend offline".into()))
    }

    async fn count_message(
        &self,
        _text: &str,
        _model_id: &str,
        _attachments: &[Attachment],
    ) -> Result<usize> {
        Err(Error::TokenCount("counting backend offline".into()))
    }
}

// ── Embeddings ────────────────────────────────────────────────────────────

/// Deterministic embedder: hashes bytes into a fixed 8-dim vector.
/// Exact-text overrides let tests steer similarity.
#[derive(Default)]
pub struct HashEmbedder {
    pub overrides: HashMap<String, Vec<f32>>,
}

#[async_trait]
impl EmbeddingService for HashEmbedder {
    async fn embed(&self, text: &str, _model_id: &str) -> Result<Vec<f32>> {
        if let Some(v) = self.overrides.get(text) {
            return Ok(v.clone());
        }
        let mut v = [0f32; 8];
        for (i, byte) in text.bytes().enumerate() {
            v[i % 8] += byte as f32 / 255.0;
        }
        Ok(v.to_vec())
    }
}

// ── Knowledge search ──────────────────────────────────────────────────────

/// Scripted search backend. `search` pops the next canned response (or
/// returns an empty list), `fetch` serves from an id map. All queries
/// are recorded for assertions.
#[derive(Default)]
pub struct CannedSearch {
    pub responses: Mutex<VecDeque<Vec<SearchHit>>>,
    pub by_id: HashMap<String, SearchHit>,
    pub queries: Mutex<Vec<SearchQuery>>,
}

impl CannedSearch {
    pub fn with_responses(responses: Vec<Vec<SearchHit>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            ..Self::default()
        }
    }

    pub fn recorded_queries(&self) -> Vec<SearchQuery> {
        self.queries.lock().unwrap().clone()
    }
}

/// Build a search hit with sensible defaults.
pub fn hit(id: &str, score: f32, content: &str) -> SearchHit {
    SearchHit {
        id: id.into(),
        score,
        source: "kb".into(),
        content: content.into(),
        tags: Vec::new(),
    }
}

#[async_trait]
impl KnowledgeSearch for CannedSearch {
    async fn search(&self, query: &SearchQuery) -> Result<Vec<SearchHit>> {
        self.queries.lock().unwrap().push(query.clone());
        Ok(self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_default())
    }

    async fn fetch(&self, ids: &[String], _source_id: Option<&str>) -> Result<Vec<SearchHit>> {
        Ok(ids
            .iter()
            .filter_map(|id| self.by_id.get(id).cloned())
            .collect())
    }
}

// ── Attachments ───────────────────────────────────────────────────────────

/// Stub attachment backend with preloaded transcripts and bytes.
#[derive(Default)]
pub struct StubAttachments {
    pub transcripts: HashMap<String, TranscriptOutcome>,
    pub bytes: HashMap<String, Vec<u8>>,
}

#[async_trait]
impl AttachmentServices for StubAttachments {
    async fn await_transcriptions(
        &self,
        attachment_ids: &[String],
        _timeout: Duration,
    ) -> Result<HashMap<String, TranscriptOutcome>> {
        Ok(attachment_ids
            .iter()
            .filter_map(|id| self.transcripts.get(id).map(|o| (id.clone(), o.clone())))
            .collect())
    }

    async fn fetch_bytes(&self, path: &str) -> Result<Vec<u8>> {
        self.bytes.get(path).cloned().ok_or_else(|| {
            Error::Attachment(promptloom_core::AttachmentError::FetchFailed {
                path: path.into(),
                reason: "not in stub".into(),
            })
        })
    }
}

// ── Service bundles and fixtures ──────────────────────────────────────────

/// All-default mock services.
pub fn mock_services() -> PipelineServices {
    PipelineServices {
        token_counter: Arc::new(EstimateCounter::default()),
        embeddings: Arc::new(HashEmbedder::default()),
        search: Arc::new(CannedSearch::default()),
        attachments: Arc::new(StubAttachments::default()),
    }
}

/// A linear session with node ids `n0`, `n1`, …
pub fn session_with_turns(turns: &[(Role, &str)]) -> Session {
    let mut session = Session::new("s1");
    let mut parent = session.active_leaf_id.clone().unwrap();
    for (i, (role, content)) in turns.iter().enumerate() {
        let id = format!("n{i}");
        session
            .append(MessageNode::new(&id, Some(parent.clone()), *role, *content))
            .unwrap();
        parent = id;
    }
    session
}

/// Run one stage in isolation against default mocks, seeded rng.
pub async fn run_single_stage(
    stage: impl ContextProcessor,
    session: Option<Session>,
    agent: Option<AgentSnapshot>,
) -> ChatContext {
    run_single_stage_with(stage, session, agent, mock_services()).await
}

/// Run one stage in isolation against specific services.
pub async fn run_single_stage_with(
    stage: impl ContextProcessor,
    session: Option<Session>,
    agent: Option<AgentSnapshot>,
    services: PipelineServices,
) -> ChatContext {
    let mut ctx = ChatContext::new("test/model-1", Some(7));
    ctx.session = session;
    ctx.agent = agent;
    if let Err(err) = stage.process(&mut ctx, &services).await {
        ctx.log_warn(stage.id(), format!("stage failed: {err}"));
    }
    ctx
}
