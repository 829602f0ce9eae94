//! Message model: what the session hands us and what callers ask us to send.
//!
//! The underlying client library owns the real wire format. These types
//! are the narrow, already-decoded view of it that the relay needs.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::ProtocolError;

/// Largest file accepted by [`OutboundMessage::validate`] (100 MiB).
pub const MAX_OUTBOUND_FILE_BYTES: usize = 100 * 1024 * 1024;

// ---------------------------------------------------------------------------
// MediaKind
// ---------------------------------------------------------------------------

/// Broad media category, derived from a mimetype's top-level type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
    Audio,
    Document,
    Sticker,
}

impl MediaKind {
    /// `image/*` → Image, `video/*` → Video, `audio/*` → Audio,
    /// anything else → Document. Stickers are never inferred.
    pub fn from_mimetype(mimetype: &str) -> Self {
        match mimetype.split('/').next().unwrap_or_default() {
            "image" => Self::Image,
            "video" => Self::Video,
            "audio" => Self::Audio,
            _ => Self::Document,
        }
    }

    /// The message type name the network uses for this kind.
    pub fn message_type(self) -> &'static str {
        match self {
            Self::Image => "imageMessage",
            Self::Video => "videoMessage",
            Self::Audio => "audioMessage",
            Self::Document => "documentMessage",
            Self::Sticker => "stickerMessage",
        }
    }

    /// Short lowercase label, e.g. for `[image]` placeholders.
    pub fn label(self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Document => "document",
            Self::Sticker => "sticker",
        }
    }
}

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

/// Quoted-message context attached to a reply.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyContext {
    /// Id of the message being replied to.
    pub stanza_id: Option<String>,
    /// Text (or caption) of the quoted message, if it had any.
    pub quoted_text: Option<String>,
}

/// The decoded body of an inbound message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageContent {
    /// Plain text.
    Conversation { text: String },
    /// Text with formatting, links, or reply context.
    ExtendedText { text: String },
    /// An attachment. Binary content stays with the client library.
    Media {
        media: MediaKind,
        caption: Option<String>,
        mimetype: Option<String>,
        filename: Option<String>,
        size: Option<u64>,
    },
    /// An emoji reaction; `None` means the reaction was removed.
    Reaction { text: Option<String> },
    /// Anything else, kept by type name only.
    Other { message_type: String },
}

impl MessageContent {
    /// The network's type name for this content.
    pub fn message_type(&self) -> &str {
        match self {
            Self::Conversation { .. } => "conversation",
            Self::ExtendedText { .. } => "extendedTextMessage",
            Self::Media { media, .. } => media.message_type(),
            Self::Reaction { .. } => "reactionMessage",
            Self::Other { message_type } => message_type,
        }
    }
}

/// One message observed on the session (sent by someone else or by us
/// from another device).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub id: String,
    pub chat_id: String,
    pub from_me: bool,
    pub push_name: Option<String>,
    /// Seconds since the Unix epoch, as reported by the network.
    pub timestamp: Option<i64>,
    pub content: MessageContent,
    pub reply: Option<ReplyContext>,
}

impl InboundMessage {
    /// Protocol bookkeeping types that never represent user content.
    pub const BOOKKEEPING_TYPES: [&'static str; 3] = [
        "senderKeyDistributionMessage",
        "protocolMessage",
        "messageContextInfo",
    ];

    /// Returns `true` for protocol bookkeeping that should not be relayed.
    pub fn is_bookkeeping(&self) -> bool {
        Self::BOOKKEEPING_TYPES.contains(&self.content.message_type())
    }

    /// The network timestamp, or now when the network didn't send one.
    pub fn received_at(&self) -> DateTime<Utc> {
        self.timestamp
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
            .unwrap_or_else(Utc::now)
    }
}

/// Why the client delivered a batch of messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchKind {
    /// Live messages.
    Notify,
    /// Messages appended by another of our own devices.
    Append,
    /// History sync and similar bulk loads.
    Other,
}

impl BatchKind {
    /// Only live and appended batches are relayed.
    pub fn is_relayed(self) -> bool {
        matches!(self, Self::Notify | Self::Append)
    }
}

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

/// A send request from the boundary layer.
///
/// Exactly one of `text` or `file` must be set; `file` requires
/// `mimetype`. Use [`OutboundMessage::content`] to get the validated form.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutboundMessage {
    pub target: String,
    pub text: Option<String>,
    pub file: Option<Vec<u8>>,
    pub filename: Option<String>,
    pub mimetype: Option<String>,
}

/// Validated outbound content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundContent {
    Text(String),
    Media {
        media: MediaKind,
        bytes: Vec<u8>,
        mimetype: String,
        filename: Option<String>,
    },
}

impl OutboundMessage {
    /// A text message.
    pub fn text(target: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            text: Some(text.into()),
            ..Self::default()
        }
    }

    /// A file message.
    pub fn file(
        target: impl Into<String>,
        bytes: Vec<u8>,
        mimetype: impl Into<String>,
        filename: Option<String>,
    ) -> Self {
        Self {
            target: target.into(),
            file: Some(bytes),
            mimetype: Some(mimetype.into()),
            filename,
            ..Self::default()
        }
    }

    /// Checks the send contract without consuming the message.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        self.content().map(|_| ())
    }

    /// Validates and returns the content to hand to the session.
    ///
    /// # Errors
    /// [`ProtocolError::InvalidMessage`] when the target is empty, when
    /// both or neither of text/file are present, when a file has no
    /// mimetype, or when a file exceeds [`MAX_OUTBOUND_FILE_BYTES`].
    pub fn content(&self) -> Result<OutboundContent, ProtocolError> {
        if self.target.trim().is_empty() {
            return Err(ProtocolError::InvalidMessage("missing target".into()));
        }

        let text = self.text.as_deref().filter(|t| !t.is_empty());
        let file = self.file.as_deref().filter(|f| !f.is_empty());

        match (text, file) {
            (Some(text), None) => Ok(OutboundContent::Text(text.to_string())),
            (None, Some(bytes)) => {
                let mimetype = self.mimetype.as_deref().filter(|m| !m.is_empty()).ok_or_else(
                    || ProtocolError::InvalidMessage("mimetype required for file".into()),
                )?;
                if bytes.len() > MAX_OUTBOUND_FILE_BYTES {
                    return Err(ProtocolError::InvalidMessage(format!(
                        "file too large: {} bytes (max {MAX_OUTBOUND_FILE_BYTES})",
                        bytes.len()
                    )));
                }
                let media = MediaKind::from_mimetype(mimetype);
                let filename = match (&self.filename, media) {
                    (Some(name), _) => Some(name.clone()),
                    (None, MediaKind::Document) => Some("document".to_string()),
                    (None, _) => None,
                };
                Ok(OutboundContent::Media {
                    media,
                    bytes: bytes.to_vec(),
                    mimetype: mimetype.to_string(),
                    filename,
                })
            }
            (Some(_), Some(_)) => Err(ProtocolError::InvalidMessage(
                "exactly one of text or file is allowed".into(),
            )),
            (None, None) => Err(ProtocolError::InvalidMessage(
                "either text or file is required".into(),
            )),
        }
    }
}

/// Handle returned by the session after a successful send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentMessage {
    pub id: String,
    pub target: String,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(content: MessageContent) -> InboundMessage {
        InboundMessage {
            id: "m1".into(),
            chat_id: "1555@s.whatsapp.net".into(),
            from_me: false,
            push_name: None,
            timestamp: Some(1_700_000_000),
            content,
            reply: None,
        }
    }

    #[test]
    fn test_media_kind_from_mimetype_falls_back_to_document() {
        assert_eq!(MediaKind::from_mimetype("image/png"), MediaKind::Image);
        assert_eq!(MediaKind::from_mimetype("video/mp4"), MediaKind::Video);
        assert_eq!(MediaKind::from_mimetype("audio/ogg; codecs=opus"), MediaKind::Audio);
        assert_eq!(MediaKind::from_mimetype("application/pdf"), MediaKind::Document);
        assert_eq!(MediaKind::from_mimetype(""), MediaKind::Document);
    }

    #[test]
    fn test_is_bookkeeping_flags_protocol_messages() {
        let bookkeeping = msg(MessageContent::Other {
            message_type: "protocolMessage".into(),
        });
        let text = msg(MessageContent::Conversation { text: "hi".into() });

        assert!(bookkeeping.is_bookkeeping());
        assert!(!text.is_bookkeeping());
    }

    #[test]
    fn test_received_at_uses_network_timestamp() {
        let m = msg(MessageContent::Conversation { text: "hi".into() });
        assert_eq!(m.received_at().timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_batch_kind_relays_notify_and_append_only() {
        assert!(BatchKind::Notify.is_relayed());
        assert!(BatchKind::Append.is_relayed());
        assert!(!BatchKind::Other.is_relayed());
    }

    #[test]
    fn test_content_text_only_is_valid() {
        let out = OutboundMessage::text("1555@s.whatsapp.net", "hello");
        assert_eq!(out.content().unwrap(), OutboundContent::Text("hello".into()));
    }

    #[test]
    fn test_content_file_without_mimetype_is_rejected() {
        let out = OutboundMessage {
            target: "1555@s.whatsapp.net".into(),
            file: Some(vec![1, 2, 3]),
            ..OutboundMessage::default()
        };
        assert!(matches!(out.content(), Err(ProtocolError::InvalidMessage(_))));
    }

    #[test]
    fn test_content_text_and_file_together_is_rejected() {
        let mut out = OutboundMessage::file("t@s", vec![1], "image/png", None);
        out.text = Some("caption".into());
        assert!(out.validate().is_err());
    }

    #[test]
    fn test_content_neither_text_nor_file_is_rejected() {
        let out = OutboundMessage {
            target: "t@s".into(),
            text: Some(String::new()),
            ..OutboundMessage::default()
        };
        assert!(out.validate().is_err());
    }

    #[test]
    fn test_content_missing_target_is_rejected() {
        let out = OutboundMessage::text("  ", "hello");
        assert!(out.validate().is_err());
    }

    #[test]
    fn test_content_document_gets_default_filename() {
        let out = OutboundMessage::file("t@s", vec![1], "application/pdf", None);
        match out.content().unwrap() {
            OutboundContent::Media { media, filename, .. } => {
                assert_eq!(media, MediaKind::Document);
                assert_eq!(filename.as_deref(), Some("document"));
            }
            other => panic!("expected media, got {other:?}"),
        }
    }
}
