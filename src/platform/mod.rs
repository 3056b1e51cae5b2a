//! Messaging platform abstraction.
//!
//! The relay core never talks HTTP directly. Everything it needs from the
//! chat platform, the translation service and the image comparator goes
//! through the traits in this module; `telegram` and `translate` provide the
//! production implementations.

pub mod media;
pub mod telegram;
pub mod translate;

use std::path::{Path, PathBuf};
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::error::{PlatformError, TranslateError};

pub use media::{DownloadedMedia, ExactMatchComparator};
pub use telegram::TelegramClient;
pub use translate::HttpTranslator;

pub type ChatId = i64;
pub type MessageId = i64;

// ── Messages ────────────────────────────────────────────────────────

/// The chat a message lives in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chat {
    pub id: ChatId,
    /// Title for groups and channels, full name for private chats.
    pub title: String,
    /// Chats with protected content refuse forwarding and file-id reuse.
    #[serde(default)]
    pub protected_content: bool,
}

/// Where the bytes of an attachment come from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MediaSource {
    /// Platform file id, reusable across chats.
    FileId(String),
    /// Locally downloaded copy.
    Local(PathBuf),
}

/// Attachment kinds that carry a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    Photo,
    Video,
    Audio,
    Voice,
    Document,
    Animation,
    Sticker,
    VideoNote,
}

impl FileKind {
    /// Stickers and video notes have no caption.
    pub fn accepts_caption(self) -> bool {
        !matches!(self, Self::Sticker | Self::VideoNote)
    }

    /// Kinds that may appear inside a media group.
    pub fn groupable(self) -> bool {
        matches!(
            self,
            Self::Photo | Self::Video | Self::Audio | Self::Document | Self::Animation
        )
    }
}

/// Closed set of relayable media kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    File(FileKind),
    Location,
    Venue,
    Contact,
    Dice,
    Poll,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollKind {
    Regular,
    Quiz,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Poll {
    pub question: String,
    pub options: Vec<String>,
    pub kind: PollKind,
    pub is_anonymous: bool,
    pub allows_multiple_answers: bool,
    /// Only known to the poll's creator; learned by voting otherwise.
    pub correct_option: Option<usize>,
    pub explanation: Option<String>,
}

/// Result of a synthetic vote against a quiz.
#[derive(Debug, Clone, PartialEq)]
pub struct QuizAnswer {
    pub correct_option: usize,
    pub explanation: Option<String>,
}

/// Message body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Content {
    Text {
        text: String,
        /// Text carries a link preview (edited as text, not as media).
        web_preview: bool,
    },
    File {
        kind: FileKind,
        source: MediaSource,
        caption: Option<String>,
    },
    Location {
        latitude: f64,
        longitude: f64,
    },
    Venue {
        latitude: f64,
        longitude: f64,
        title: String,
        address: String,
    },
    Contact {
        phone_number: String,
        first_name: String,
        last_name: Option<String>,
    },
    Dice {
        emoji: String,
    },
    Poll(Poll),
}

impl Content {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text {
            text: text.into(),
            web_preview: false,
        }
    }

    /// `None` for plain text.
    pub fn kind(&self) -> Option<MediaKind> {
        match self {
            Self::Text { .. } => None,
            Self::File { kind, .. } => Some(MediaKind::File(*kind)),
            Self::Location { .. } => Some(MediaKind::Location),
            Self::Venue { .. } => Some(MediaKind::Venue),
            Self::Contact { .. } => Some(MediaKind::Contact),
            Self::Dice { .. } => Some(MediaKind::Dice),
            Self::Poll(_) => Some(MediaKind::Poll),
        }
    }

    /// The text, or the caption of a file.
    pub fn text_or_caption(&self) -> Option<&str> {
        match self {
            Self::Text { text, .. } => Some(text),
            Self::File { caption, .. } => caption.as_deref(),
            _ => None,
        }
    }

    pub fn file_id(&self) -> Option<&str> {
        match self {
            Self::File {
                source: MediaSource::FileId(id),
                ..
            } => Some(id),
            _ => None,
        }
    }
}

/// An inbound message as seen by the relay.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: MessageId,
    pub chat: Chat,
    pub content: Content,
    /// Sent by the account the relay runs as.
    pub outgoing: bool,
    pub media_group_id: Option<String>,
    pub reply_to: Option<MessageId>,
}

/// Platform events the relay reacts to.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    New(Message),
    Edited(Message),
    Pinned {
        chat: Chat,
        pinned_id: MessageId,
        outgoing: bool,
    },
    /// `chat` is unknown for deletions in private chats.
    Deleted {
        chat: Option<ChatId>,
        message_ids: Vec<MessageId>,
    },
}

impl InboundEvent {
    pub fn source_chat(&self) -> Option<ChatId> {
        match self {
            Self::New(msg) | Self::Edited(msg) => Some(msg.chat.id),
            Self::Pinned { chat, .. } => Some(chat.id),
            Self::Deleted { chat, .. } => *chat,
        }
    }
}

/// Stream of inbound events.
pub type EventStream = Pin<Box<dyn Stream<Item = InboundEvent> + Send>>;

/// Resolved chat metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatInfo {
    pub id: ChatId,
    pub title: String,
    pub username: Option<String>,
}

// ── Collaborator traits ─────────────────────────────────────────────

/// Chat platform operations used by the relay.
#[async_trait]
pub trait PlatformClient: Send + Sync {
    /// Send one message, optionally as a reply. Returns the new message id.
    async fn send(
        &self,
        chat: ChatId,
        content: &Content,
        reply_to: Option<MessageId>,
    ) -> Result<MessageId, PlatformError>;

    /// Send attachments as one group. Ids come back in item order.
    async fn send_group(
        &self,
        chat: ChatId,
        items: &[Content],
        reply_to: Option<MessageId>,
    ) -> Result<Vec<MessageId>, PlatformError>;

    /// Forward messages as native platform forwards. Ids come back in input order.
    async fn forward(
        &self,
        chat: ChatId,
        from_chat: ChatId,
        ids: &[MessageId],
    ) -> Result<Vec<MessageId>, PlatformError>;

    async fn edit_text(&self, chat: ChatId, id: MessageId, text: &str)
    -> Result<(), PlatformError>;

    async fn edit_caption(
        &self,
        chat: ChatId,
        id: MessageId,
        caption: &str,
    ) -> Result<(), PlatformError>;

    /// Replace the attachment (and caption) of a file message.
    async fn edit_media(
        &self,
        chat: ChatId,
        id: MessageId,
        content: &Content,
    ) -> Result<(), PlatformError>;

    async fn delete(&self, chat: ChatId, ids: &[MessageId]) -> Result<(), PlatformError>;

    async fn pin(&self, chat: ChatId, id: MessageId) -> Result<(), PlatformError>;

    /// Text of the most recent message in a chat, if any.
    async fn last_message_text(&self, chat: ChatId) -> Result<Option<String>, PlatformError>;

    /// All items of the media group that `id` belongs to, in send order.
    async fn get_grouped_items(
        &self,
        chat: ChatId,
        id: MessageId,
    ) -> Result<Vec<Message>, PlatformError>;

    /// Resolve a numeric id or `@username` to a chat.
    async fn resolve_chat(&self, reference: &str) -> Result<ChatInfo, PlatformError>;

    /// Download an attachment to a local file.
    async fn download(&self, source: &MediaSource) -> Result<PathBuf, PlatformError>;

    /// Cast a vote on a quiz to learn its answer.
    async fn vote_poll(
        &self,
        chat: ChatId,
        id: MessageId,
        option: usize,
    ) -> Result<QuizAnswer, PlatformError>;
}

/// Text translation service.
#[async_trait]
pub trait Translator: Send + Sync {
    async fn translate(&self, text: &str, to: &str, from: &str) -> Result<String, TranslateError>;
}

/// Image similarity comparator. Scores are in `[0, 1]`.
#[async_trait]
pub trait ImageComparator: Send + Sync {
    async fn similarity(&self, a: &Path, b: &Path) -> Result<f64, PlatformError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_kind_dispatch() {
        assert_eq!(Content::text("hi").kind(), None);
        let photo = Content::File {
            kind: FileKind::Photo,
            source: MediaSource::FileId("f".into()),
            caption: Some("cap".into()),
        };
        assert_eq!(photo.kind(), Some(MediaKind::File(FileKind::Photo)));
        assert_eq!(photo.text_or_caption(), Some("cap"));
        assert_eq!(photo.file_id(), Some("f"));
        assert_eq!(
            Content::Dice { emoji: "🎲".into() }.kind(),
            Some(MediaKind::Dice)
        );
    }

    #[test]
    fn sticker_takes_no_caption() {
        assert!(!FileKind::Sticker.accepts_caption());
        assert!(!FileKind::VideoNote.accepts_caption());
        assert!(FileKind::Photo.accepts_caption());
        assert!(!FileKind::Voice.groupable());
    }

    #[test]
    fn deleted_event_may_lack_chat() {
        let event = InboundEvent::Deleted {
            chat: None,
            message_ids: vec![1],
        };
        assert_eq!(event.source_chat(), None);
    }
}
