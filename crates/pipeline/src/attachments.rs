//! Attachment resolution — text phase and binary phase.
//!
//! The text phase runs before token accounting: it waits (best-effort,
//! bounded) for pending transcription/extraction jobs and inlines any
//! extracted text into the owning message, removing the attachment. The
//! binary phase is always the last pipeline stage: it converts whatever
//! is still attached into wire content parts (inline base64 or a
//! file-reference wrapper, per the model's document capability).
//! Per-attachment failures are logged and counted, never fatal.

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures::future::join_all;
use tracing::{debug, warn};

use promptloom_core::message::{AttachmentKind, ContentPart, TranscriptionStatus};
use promptloom_core::services::{DocumentTransport, TranscriptOutcome};
use promptloom_core::{AttachmentError, Result};

use crate::context::ChatContext;
use crate::stage::{ContextProcessor, PipelineServices};

// ── Text phase ────────────────────────────────────────────────────────────

pub struct TextAttachmentResolver;

const TEXT_ID: &str = "attachment_text_resolver";

#[async_trait]
impl ContextProcessor for TextAttachmentResolver {
    fn id(&self) -> &'static str {
        TEXT_ID
    }

    async fn process(&self, ctx: &mut ChatContext, services: &PipelineServices) -> Result<()> {
        let pending: Vec<String> = ctx
            .messages
            .iter()
            .flat_map(|m| m.attachments.iter())
            .filter(|a| a.status == TranscriptionStatus::Pending)
            .map(|a| a.id.clone())
            .collect();

        let wait_secs = ctx
            .agent
            .as_ref()
            .map(|a| a.context.transcription_wait_secs)
            .unwrap_or(30);

        let outcomes = if pending.is_empty() {
            Default::default()
        } else {
            match services
                .attachments
                .await_transcriptions(&pending, Duration::from_secs(wait_secs))
                .await
            {
                Ok(outcomes) => outcomes,
                Err(err) => {
                    // Best-effort: unresolved attachments simply remain.
                    warn!(%err, "transcription wait failed");
                    ctx.log_warn(TEXT_ID, format!("transcription wait failed: {err}"));
                    Default::default()
                }
            }
        };

        // Whatever the wait did not resolve within the window timed out
        // and stays attached for the binary phase.
        let unresolved = pending.iter().filter(|id| !outcomes.contains_key(*id)).count();
        if unresolved > 0 {
            let err = AttachmentError::TranscriptionTimeout(wait_secs);
            warn!(unresolved, %err, "transcriptions still pending");
            ctx.log_warn(TEXT_ID, format!("{unresolved} attachment(s): {err}"));
        }

        let mut inlined = 0usize;
        let mut failed = 0usize;
        for msg in &mut ctx.messages {
            let mut remaining = Vec::with_capacity(msg.attachments.len());
            for mut attachment in msg.attachments.drain(..) {
                // Text already extracted earlier stays usable.
                let transcript = match attachment.transcript.clone() {
                    Some(t) => Some(t),
                    None => match outcomes.get(&attachment.id) {
                        Some(TranscriptOutcome::Text(t)) => Some(t.clone()),
                        Some(TranscriptOutcome::Binary) => {
                            attachment.status = TranscriptionStatus::Ready;
                            None
                        }
                        Some(TranscriptOutcome::Failed(reason)) => {
                            attachment.status = TranscriptionStatus::Failed;
                            failed += 1;
                            debug!(id = %attachment.id, %reason, "transcription failed");
                            None
                        }
                        None => None,
                    },
                };
                match transcript {
                    Some(text) => {
                        msg.content
                            .push_text_part(format!("[Attachment: {}]\n{}", attachment.name, text));
                        inlined += 1;
                    }
                    None => remaining.push(attachment),
                }
            }
            msg.attachments = remaining;
        }

        if failed > 0 {
            ctx.log_warn(TEXT_ID, format!("{failed} transcription(s) failed"));
        }
        ctx.log_info(
            TEXT_ID,
            format!("inlined {inlined} transcript(s), {} awaited", pending.len()),
        );
        Ok(())
    }
}

// ── Binary phase ──────────────────────────────────────────────────────────

pub struct BinaryAttachmentResolver;

const BINARY_ID: &str = "attachment_binary_resolver";

#[async_trait]
impl ContextProcessor for BinaryAttachmentResolver {
    fn id(&self) -> &'static str {
        BINARY_ID
    }

    async fn process(&self, ctx: &mut ChatContext, services: &PipelineServices) -> Result<()> {
        // Collect fetch jobs first so the awaits can run in parallel and
        // fold back deterministically by (message, attachment) index.
        struct Job {
            msg_index: usize,
            kind: AttachmentKind,
            name: String,
            media_type: String,
            path: Option<String>,
        }

        let transport = ctx.document_transport;
        let mut jobs: Vec<Job> = Vec::new();
        for (msg_index, msg) in ctx.messages.iter_mut().enumerate() {
            for attachment in msg.attachments.drain(..) {
                jobs.push(Job {
                    msg_index,
                    kind: attachment.kind,
                    name: attachment.name,
                    media_type: attachment.media_type,
                    path: attachment.path,
                });
            }
        }
        if jobs.is_empty() {
            return Ok(());
        }

        let fetches = jobs.iter().map(|job| {
            let attachments = services.attachments.clone();
            async move {
                match (&job.path, needs_bytes(job.kind, transport)) {
                    (_, false) => Ok(None),
                    (Some(path), true) => attachments.fetch_bytes(path).await.map(Some),
                    (None, true) => Err(promptloom_core::Error::Attachment(
                        promptloom_core::AttachmentError::MissingPath {
                            id: job.name.clone(),
                        },
                    )),
                }
            }
        });
        let results = join_all(fetches).await;

        let mut converted = 0usize;
        let mut failed = 0usize;
        for (job, result) in jobs.iter().zip(results) {
            match result {
                Ok(bytes) => {
                    let part = wire_part(job.kind, &job.name, &job.media_type, transport, bytes, job.path.as_deref());
                    match part {
                        Some(part) => {
                            ctx.messages[job.msg_index].content.push_part(part);
                            converted += 1;
                        }
                        None => {
                            failed += 1;
                            ctx.log_warn(
                                BINARY_ID,
                                format!("attachment '{}' has no usable wire form", job.name),
                            );
                        }
                    }
                }
                Err(err) => {
                    // The message simply loses this attachment's content part.
                    failed += 1;
                    warn!(name = %job.name, %err, "attachment conversion failed");
                    ctx.log_warn(
                        BINARY_ID,
                        format!("attachment '{}' failed: {err}", job.name),
                    );
                }
            }
        }

        ctx.extras.attachment_failures += failed;
        ctx.log_info(
            BINARY_ID,
            format!("converted {converted} attachment(s), {failed} failed"),
        );
        Ok(())
    }
}

/// Whether this attachment kind needs raw bytes under the transport.
fn needs_bytes(kind: AttachmentKind, transport: DocumentTransport) -> bool {
    match (kind, transport) {
        (AttachmentKind::Image, _) => true,
        (_, DocumentTransport::InlineBase64) => true,
        (_, DocumentTransport::FileReference) => false,
    }
}

/// Build the wire content part for a converted attachment.
fn wire_part(
    kind: AttachmentKind,
    name: &str,
    media_type: &str,
    transport: DocumentTransport,
    bytes: Option<Vec<u8>>,
    path: Option<&str>,
) -> Option<ContentPart> {
    match kind {
        AttachmentKind::Image => Some(ContentPart::Image {
            media_type: media_type.to_string(),
            data: BASE64.encode(bytes?),
        }),
        AttachmentKind::Document | AttachmentKind::Audio | AttachmentKind::Video => match transport
        {
            DocumentTransport::InlineBase64 => Some(ContentPart::Document {
                media_type: media_type.to_string(),
                name: name.to_string(),
                data: BASE64.encode(bytes?),
            }),
            DocumentTransport::FileReference => Some(ContentPart::FileReference {
                media_type: media_type.to_string(),
                name: name.to_string(),
                path: path?.to_string(),
            }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{mock_services, StubAttachments};
    use promptloom_core::message::{Attachment, MessageContent, ProcessableMessage, Role};
    use std::collections::HashMap;
    use std::sync::Arc;

    fn message_with_attachment(attachment: Attachment) -> ProcessableMessage {
        let mut msg = ProcessableMessage::history(Role::User, "look at this", "n0");
        msg.attachments.push(attachment);
        msg
    }

    async fn run_text(
        msg: ProcessableMessage,
        transcripts: HashMap<String, TranscriptOutcome>,
    ) -> ChatContext {
        let mut services = mock_services();
        services.attachments = Arc::new(StubAttachments {
            transcripts,
            bytes: HashMap::new(),
        });
        let mut ctx = ChatContext::new("test/model-1", Some(7));
        ctx.messages.push(msg);
        TextAttachmentResolver
            .process(&mut ctx, &services)
            .await
            .unwrap();
        ctx
    }

    #[tokio::test]
    async fn ready_transcript_is_inlined_and_removed() {
        let attachment = Attachment::binary(
            AttachmentKind::Document,
            "notes.pdf",
            "application/pdf",
            "/store/notes.pdf",
        );
        let id = attachment.id.clone();
        let transcripts = HashMap::from([(id, TranscriptOutcome::Text("extracted text".into()))]);
        let ctx = run_text(message_with_attachment(attachment), transcripts).await;

        let msg = &ctx.messages[0];
        assert!(msg.attachments.is_empty());
        assert!(msg.plain_text().contains("[Attachment: notes.pdf]"));
        assert!(msg.plain_text().contains("extracted text"));
    }

    #[tokio::test]
    async fn binary_outcome_leaves_attachment_for_final_stage() {
        let attachment =
            Attachment::binary(AttachmentKind::Image, "cat.png", "image/png", "/store/cat.png");
        let id = attachment.id.clone();
        let transcripts = HashMap::from([(id, TranscriptOutcome::Binary)]);
        let ctx = run_text(message_with_attachment(attachment), transcripts).await;

        assert_eq!(ctx.messages[0].attachments.len(), 1);
        assert_eq!(
            ctx.messages[0].attachments[0].status,
            TranscriptionStatus::Ready
        );
    }

    #[tokio::test]
    async fn failed_transcription_is_logged_not_fatal() {
        let attachment = Attachment::binary(
            AttachmentKind::Audio,
            "memo.ogg",
            "audio/ogg",
            "/store/memo.ogg",
        );
        let id = attachment.id.clone();
        let transcripts = HashMap::from([(id, TranscriptOutcome::Failed("codec".into()))]);
        let ctx = run_text(message_with_attachment(attachment), transcripts).await;

        assert_eq!(ctx.messages[0].attachments.len(), 1);
        assert!(ctx
            .log
            .iter()
            .any(|e| e.message.contains("transcription(s) failed")));
    }

    #[tokio::test]
    async fn unresolved_transcription_wait_is_reported_as_timeout() {
        let attachment = Attachment::binary(
            AttachmentKind::Document,
            "slow.pdf",
            "application/pdf",
            "/store/slow.pdf",
        );
        let ctx = run_text(message_with_attachment(attachment), HashMap::new()).await;
        // Still attached for the binary phase, with a timeout on record.
        assert_eq!(ctx.messages[0].attachments.len(), 1);
        assert!(ctx.log.iter().any(|e| e.message.contains("timed out")));
    }

    #[tokio::test]
    async fn binary_phase_encodes_image_as_base64() {
        let mut services = mock_services();
        services.attachments = Arc::new(StubAttachments {
            transcripts: HashMap::new(),
            bytes: HashMap::from([("/store/cat.png".to_string(), vec![1u8, 2, 3])]),
        });
        let attachment =
            Attachment::binary(AttachmentKind::Image, "cat.png", "image/png", "/store/cat.png");
        let mut ctx = ChatContext::new("test/model-1", Some(7));
        ctx.messages.push(message_with_attachment(attachment));
        BinaryAttachmentResolver
            .process(&mut ctx, &services)
            .await
            .unwrap();

        match &ctx.messages[0].content {
            MessageContent::Parts(parts) => {
                assert!(parts.iter().any(|p| matches!(
                    p,
                    ContentPart::Image { media_type, data }
                        if media_type == "image/png" && data == &BASE64.encode([1u8, 2, 3])
                )));
            }
            _ => panic!("expected parts"),
        }
        assert!(ctx.messages[0].attachments.is_empty());
        assert_eq!(ctx.extras.attachment_failures, 0);
    }

    #[tokio::test]
    async fn file_reference_transport_skips_fetch() {
        let attachment = Attachment::binary(
            AttachmentKind::Document,
            "spec.pdf",
            "application/pdf",
            "/store/spec.pdf",
        );
        // No bytes in the stub: a fetch would fail.
        let mut ctx = ChatContext::new("test/model-1", Some(7));
        ctx.document_transport = DocumentTransport::FileReference;
        ctx.messages.push(message_with_attachment(attachment));
        BinaryAttachmentResolver
            .process(&mut ctx, &mock_services())
            .await
            .unwrap();

        match &ctx.messages[0].content {
            MessageContent::Parts(parts) => {
                assert!(parts.iter().any(|p| matches!(
                    p,
                    ContentPart::FileReference { path, .. } if path == "/store/spec.pdf"
                )));
            }
            _ => panic!("expected parts"),
        }
    }

    #[tokio::test]
    async fn fetch_failure_drops_attachment_and_counts_it() {
        let attachment =
            Attachment::binary(AttachmentKind::Image, "gone.png", "image/png", "/missing");
        let mut ctx = ChatContext::new("test/model-1", Some(7));
        ctx.messages.push(message_with_attachment(attachment));
        BinaryAttachmentResolver
            .process(&mut ctx, &mock_services())
            .await
            .unwrap();

        assert_eq!(ctx.extras.attachment_failures, 1);
        assert_eq!(ctx.messages[0].plain_text(), "look at this");
        assert!(ctx.log.iter().any(|e| e.message.contains("gone.png")));
    }

    #[tokio::test]
    async fn no_attachments_is_a_quiet_noop() {
        let mut ctx = ChatContext::new("test/model-1", Some(7));
        ctx.messages
            .push(ProcessableMessage::history(Role::User, "plain", "n0"));
        BinaryAttachmentResolver
            .process(&mut ctx, &mock_services())
            .await
            .unwrap();
        assert!(ctx.log.is_empty());
    }
}
