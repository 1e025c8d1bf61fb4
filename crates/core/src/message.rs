//! Message domain types.
//!
//! [`ProcessableMessage`] is the pipeline's working unit: created by the
//! history linearizer and the preset assembler, mutated in place by every
//! later stage, and finally flattened into [`WireMessage`] records ready
//! for a model-completion call. A `ProcessableMessage` is never shared
//! across pipeline runs.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The role of a message sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System instructions (presets, injected knowledge)
    System,
    /// The end user
    User,
    /// The model
    Assistant,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

/// A typed piece of message content in the wire format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    /// Plain text.
    Text { text: String },
    /// Inline base64 image.
    Image { media_type: String, data: String },
    /// Inline base64 document (PDF etc.).
    Document {
        media_type: String,
        name: String,
        data: String,
    },
    /// Reference to an externally uploaded file, for models that take
    /// file handles instead of inline bytes.
    FileReference {
        media_type: String,
        name: String,
        path: String,
    },
}

/// Message content: either a plain string or a list of typed parts.
///
/// Early stages work with plain text; attachment resolution upgrades a
/// message to parts when it gains non-text content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// Concatenated text of all text parts (or the plain string).
    pub fn as_plain_text(&self) -> String {
        match self {
            MessageContent::Text(s) => s.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    /// Replace the textual content, preserving non-text parts.
    pub fn set_text(&mut self, new_text: String) {
        match self {
            MessageContent::Text(s) => *s = new_text,
            MessageContent::Parts(parts) => {
                parts.retain(|p| !matches!(p, ContentPart::Text { .. }));
                parts.insert(0, ContentPart::Text { text: new_text });
            }
        }
    }

    /// Append a text part, upgrading plain text to parts if needed.
    pub fn push_text_part(&mut self, text: impl Into<String>) {
        let text = text.into();
        match self {
            MessageContent::Text(s) => {
                if s.is_empty() {
                    *s = text;
                } else {
                    let existing = std::mem::take(s);
                    *self = MessageContent::Parts(vec![
                        ContentPart::Text { text: existing },
                        ContentPart::Text { text },
                    ]);
                }
            }
            MessageContent::Parts(parts) => parts.push(ContentPart::Text { text }),
        }
    }

    /// Append a non-text part, upgrading plain text to parts if needed.
    pub fn push_part(&mut self, part: ContentPart) {
        match self {
            MessageContent::Text(s) => {
                let mut parts = Vec::new();
                if !s.is_empty() {
                    parts.push(ContentPart::Text {
                        text: std::mem::take(s),
                    });
                }
                parts.push(part);
                *self = MessageContent::Parts(parts);
            }
            MessageContent::Parts(parts) => parts.push(part),
        }
    }

    /// True if there is no text and no parts.
    pub fn is_empty(&self) -> bool {
        match self {
            MessageContent::Text(s) => s.trim().is_empty(),
            MessageContent::Parts(parts) => parts.is_empty(),
        }
    }
}

impl From<String> for MessageContent {
    fn from(s: String) -> Self {
        MessageContent::Text(s)
    }
}

impl From<&str> for MessageContent {
    fn from(s: &str) -> Self {
        MessageContent::Text(s.to_string())
    }
}

/// The kind of an attachment, before wire conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentKind {
    Image,
    Document,
    Audio,
    Video,
}

/// Transcription / extraction status of an attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TranscriptionStatus {
    /// A transcription/extraction job may still be running.
    Pending,
    /// Extractable text is available in `transcript`.
    Ready,
    /// The job failed; the attachment stays binary.
    Failed,
}

/// A file attached to a message node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    /// Unique attachment ID.
    pub id: String,

    /// Content kind.
    pub kind: AttachmentKind,

    /// Display name (filename).
    pub name: String,

    /// MIME type, e.g. "image/png".
    pub media_type: String,

    /// Storage path for binary fetch, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// Extracted text, once transcription completes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcript: Option<String>,

    /// Transcription status.
    pub status: TranscriptionStatus,
}

impl Attachment {
    /// A pending binary attachment with a storage path.
    pub fn binary(
        kind: AttachmentKind,
        name: impl Into<String>,
        media_type: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            name: name.into(),
            media_type: media_type.into(),
            path: Some(path.into()),
            transcript: None,
            status: TranscriptionStatus::Pending,
        }
    }
}

/// Where a [`ProcessableMessage`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageSource {
    /// A linearized session-tree node.
    History,
    /// A skeleton preset placed in document order.
    Preset,
    /// Injected N messages back from the end of history.
    DepthInjection,
    /// Injected relative to a named anchor.
    AnchorInjection,
    /// Produced by merging two or more messages (shape formatter).
    Merged,
}

/// The pipeline's working unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessableMessage {
    /// Sender role.
    pub role: Role,

    /// Text or typed parts.
    pub content: MessageContent,

    /// Which stage family produced this message.
    pub source: MessageSource,

    /// Originating node/preset/entry id.
    pub source_id: String,

    /// Original position in the source list, for index bookkeeping.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_index: Option<usize>,

    /// Attachments not yet resolved to content parts.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,

    /// Transient token cost, filled by the budget limiter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_count: Option<usize>,

    /// True if the budget limiter cut this message down.
    #[serde(default)]
    pub is_truncated: bool,
}

impl ProcessableMessage {
    /// Create a history message from a session node.
    pub fn history(role: Role, content: impl Into<MessageContent>, node_id: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            source: MessageSource::History,
            source_id: node_id.into(),
            source_index: None,
            attachments: Vec::new(),
            token_count: None,
            is_truncated: false,
        }
    }

    /// Create a skeleton preset message.
    pub fn preset(role: Role, content: impl Into<MessageContent>, preset_id: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            source: MessageSource::Preset,
            source_id: preset_id.into(),
            source_index: None,
            attachments: Vec::new(),
            token_count: None,
            is_truncated: false,
        }
    }

    /// Create a depth-injected message.
    pub fn depth_injection(
        role: Role,
        content: impl Into<MessageContent>,
        source_id: impl Into<String>,
    ) -> Self {
        Self {
            source: MessageSource::DepthInjection,
            ..Self::history(role, content, source_id)
        }
    }

    /// Create an anchor-injected message.
    pub fn anchor_injection(
        role: Role,
        content: impl Into<MessageContent>,
        source_id: impl Into<String>,
    ) -> Self {
        Self {
            source: MessageSource::AnchorInjection,
            ..Self::history(role, content, source_id)
        }
    }

    /// True if this message is protected from history truncation.
    pub fn is_protected(&self) -> bool {
        self.source != MessageSource::History
    }

    /// Plain-text view of the content.
    pub fn plain_text(&self) -> String {
        self.content.as_plain_text()
    }
}

/// A final `{role, content}` record, ready for a completion call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    pub role: Role,
    pub content: MessageContent,
}

impl From<ProcessableMessage> for WireMessage {
    fn from(msg: ProcessableMessage) -> Self {
        Self {
            role: msg.role,
            content: msg.content,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_of_parts_joins_text_only() {
        let content = MessageContent::Parts(vec![
            ContentPart::Text {
                text: "hello".into(),
            },
            ContentPart::Image {
                media_type: "image/png".into(),
                data: "QUJD".into(),
            },
            ContentPart::Text {
                text: "world".into(),
            },
        ]);
        assert_eq!(content.as_plain_text(), "hello\nworld");
    }

    #[test]
    fn push_text_part_upgrades_plain_text() {
        let mut content = MessageContent::Text("body".into());
        content.push_text_part("transcript");
        match &content {
            MessageContent::Parts(parts) => assert_eq!(parts.len(), 2),
            _ => panic!("expected parts"),
        }
        assert_eq!(content.as_plain_text(), "body\ntranscript");
    }

    #[test]
    fn push_part_skips_empty_leading_text() {
        let mut content = MessageContent::Text(String::new());
        content.push_part(ContentPart::Image {
            media_type: "image/png".into(),
            data: "QUJD".into(),
        });
        match &content {
            MessageContent::Parts(parts) => assert_eq!(parts.len(), 1),
            _ => panic!("expected parts"),
        }
    }

    #[test]
    fn set_text_preserves_binary_parts() {
        let mut content = MessageContent::Parts(vec![
            ContentPart::Text { text: "old".into() },
            ContentPart::Image {
                media_type: "image/png".into(),
                data: "QUJD".into(),
            },
        ]);
        content.set_text("new".into());
        assert_eq!(content.as_plain_text(), "new");
        match &content {
            MessageContent::Parts(parts) => assert_eq!(parts.len(), 2),
            _ => panic!("expected parts"),
        }
    }

    #[test]
    fn history_message_is_not_protected() {
        let msg = ProcessableMessage::history(Role::User, "hi", "node-1");
        assert!(!msg.is_protected());
        assert!(ProcessableMessage::preset(Role::System, "p", "pre-1").is_protected());
    }

    #[test]
    fn wire_message_serialization() {
        let wire = WireMessage {
            role: Role::Assistant,
            content: MessageContent::Text("answer".into()),
        };
        let json = serde_json::to_string(&wire).unwrap();
        assert!(json.contains("\"assistant\""));
        assert!(json.contains("\"answer\""));
    }

    #[test]
    fn empty_content_detection() {
        assert!(MessageContent::Text("   ".into()).is_empty());
        assert!(!MessageContent::Text("x".into()).is_empty());
        assert!(MessageContent::Parts(vec![]).is_empty());
    }
}
