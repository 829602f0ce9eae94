//! Persisted and forwarded message shapes.
//!
//! A [`MessageRecord`] is one row in the `messages` relation: every message
//! we observe or send ends up as one. A [`WebhookPayload`] is the subset of
//! a record that downstream listeners receive for inbound messages.
//!
//! Field names are the column names of the relation, so both types
//! serialize straight into a JSON row.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{InboundMessage, MessageContent, OutboundContent, SentMessage};

/// Suffix that marks a one-to-one chat id.
const PERSONAL_SUFFIX: &str = "@s.whatsapp.net";

/// Extracts the digits of the user part of a chat id.
///
/// `"+1 555-0100@s.whatsapp.net"` → `Some("15550100")`. Returns `None`
/// when the user part has no digits.
pub fn plain_phone(chat_id: &str) -> Option<String> {
    let user = chat_id.split('@').next().unwrap_or_default();
    let digits: String = user.chars().filter(char::is_ascii_digit).collect();
    (!digits.is_empty()).then_some(digits)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn of(from_me: bool) -> Self {
        if from_me { Self::Outbound } else { Self::Inbound }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatKind {
    Personal,
    Group,
}

impl ChatKind {
    /// Personal when the chat id is a one-to-one user id, group otherwise.
    pub fn of(chat_id: &str) -> Self {
        if chat_id.ends_with(PERSONAL_SUFFIX) {
            Self::Personal
        } else {
            Self::Group
        }
    }
}

/// Where an attachment ended up, plus its metadata.
///
/// The archive ids are filled by a media archive collaborator; the rest can
/// come straight from the message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRef {
    pub media_unique_id: Option<String>,
    pub archive_message_id: Option<String>,
    pub archive_file_id: Option<String>,
    pub media_mimetype: Option<String>,
    pub media_filename: Option<String>,
    pub media_size: Option<u64>,
}

impl MediaRef {
    /// Metadata only, no archive location.
    fn from_content(content: &MessageContent) -> Self {
        match content {
            MessageContent::Media {
                mimetype,
                filename,
                size,
                ..
            } => Self {
                media_mimetype: mimetype.clone(),
                media_filename: filename.clone(),
                media_size: *size,
                ..Self::default()
            },
            _ => Self::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyInfo {
    pub is_reply: bool,
    pub reply_to_message_id: Option<String>,
    pub reply_to_text: Option<String>,
}

/// One row of the `messages` relation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub message_id: String,
    pub jid: String,
    pub from_plain_phone: Option<String>,
    pub display_name: String,
    #[serde(rename = "type")]
    pub message_type: String,
    pub text: Option<String>,
    #[serde(flatten)]
    pub media: MediaRef,
    pub reaction_text: Option<String>,
    #[serde(flatten)]
    pub reply: ReplyInfo,
    pub chat_type: ChatKind,
    pub from_me: bool,
    pub direction: Direction,
    pub received_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl MessageRecord {
    /// Builds the record for an observed message.
    ///
    /// `archived` overrides the metadata-only media reference when the
    /// attachment was archived.
    pub fn inbound(msg: &InboundMessage, archived: Option<MediaRef>) -> Self {
        let phone = plain_phone(&msg.chat_id);
        let display_name = if msg.from_me {
            "Me".to_string()
        } else {
            sender_name(msg, phone.as_deref())
        };

        let reply = msg
            .reply
            .as_ref()
            .map(|r| ReplyInfo {
                is_reply: true,
                reply_to_message_id: r.stanza_id.clone(),
                reply_to_text: r.quoted_text.clone(),
            })
            .unwrap_or_default();

        let reaction_text = match &msg.content {
            MessageContent::Reaction { text } => text.clone(),
            _ => None,
        };

        Self {
            message_id: msg.id.clone(),
            jid: msg.chat_id.clone(),
            from_plain_phone: phone,
            display_name,
            message_type: msg.content.message_type().to_string(),
            text: Some(display_text(&msg.content)),
            media: archived.unwrap_or_else(|| MediaRef::from_content(&msg.content)),
            reaction_text,
            reply,
            chat_type: ChatKind::of(&msg.chat_id),
            from_me: msg.from_me,
            direction: Direction::of(msg.from_me),
            received_at: msg.received_at(),
            created_at: Utc::now(),
        }
    }

    /// Builds the record for a message we sent. Outbound media is not
    /// archived, so only its metadata is kept.
    pub fn outbound(sent: &SentMessage, content: &OutboundContent) -> Self {
        let (message_type, text, media) = match content {
            OutboundContent::Text(text) => {
                ("conversation".to_string(), text.clone(), MediaRef::default())
            }
            OutboundContent::Media {
                media,
                bytes,
                mimetype,
                filename,
            } => (
                media.message_type().to_string(),
                "[Media]".to_string(),
                MediaRef {
                    media_mimetype: Some(mimetype.clone()),
                    media_filename: filename.clone(),
                    media_size: Some(bytes.len() as u64),
                    ..MediaRef::default()
                },
            ),
        };

        Self {
            message_id: sent.id.clone(),
            jid: sent.target.clone(),
            from_plain_phone: plain_phone(&sent.target),
            display_name: "Me (Bot)".to_string(),
            message_type,
            text: Some(text),
            media,
            reaction_text: None,
            reply: ReplyInfo::default(),
            chat_type: ChatKind::of(&sent.target),
            from_me: true,
            direction: Direction::Outbound,
            received_at: sent.timestamp,
            created_at: Utc::now(),
        }
    }
}

fn sender_name(msg: &InboundMessage, phone: Option<&str>) -> String {
    msg.push_name
        .as_deref()
        .filter(|n| !n.is_empty())
        .or(phone)
        .unwrap_or("Unknown")
        .to_string()
}

/// Human-readable text for a message body.
fn display_text(content: &MessageContent) -> String {
    match content {
        MessageContent::Conversation { text } | MessageContent::ExtendedText { text } => {
            text.clone()
        }
        MessageContent::Media { media, caption, .. } => caption
            .clone()
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| format!("[{}]", media.label())),
        MessageContent::Reaction { text: Some(emoji) } => format!("Reacted {emoji}"),
        MessageContent::Reaction { text: None } => "Removed reaction".to_string(),
        MessageContent::Other { message_type } => format!("[{message_type}]"),
    }
}

/// JSON body POSTed to webhook listeners.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub message_id: String,
    pub jid: String,
    pub phone_no: Option<String>,
    pub display_name: String,
    #[serde(rename = "type")]
    pub message_type: String,
    pub text: Option<String>,
    #[serde(flatten)]
    pub media: MediaRef,
    pub from_me: bool,
    pub received_at: DateTime<Utc>,
    #[serde(flatten)]
    pub reply: ReplyInfo,
    pub reaction_text: Option<String>,
}

impl From<&MessageRecord> for WebhookPayload {
    fn from(record: &MessageRecord) -> Self {
        Self {
            message_id: record.message_id.clone(),
            jid: record.jid.clone(),
            phone_no: record.from_plain_phone.clone(),
            display_name: record.display_name.clone(),
            message_type: record.message_type.clone(),
            text: record.text.clone(),
            media: record.media.clone(),
            from_me: record.from_me,
            received_at: record.received_at,
            reply: record.reply.clone(),
            reaction_text: record.reaction_text.clone(),
        }
    }
}
