use braid_wire::{ChannelKey, EventKind};

use super::ids::{ConversationId, MessageId};

/// Fallback title for conversations that have no user message yet.
pub const DEFAULT_CONVERSATION_TITLE: &str = "New Conversation";
/// Leading characters of the first user message used to derive a title.
pub const TITLE_DERIVATION_MAX_CHARS: usize = 50;

/// Transcript speaker role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    User,
    Assistant,
}

/// Where a message came from on the wire.
///
/// Captured at creation and carried to the renderer; `collapsible` marks
/// run-summary messages the UI may fold away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageOrigin {
    pub kind: EventKind,
    pub channel: Option<ChannelKey>,
    pub iteration: Option<u64>,
    pub collapsible: bool,
}

impl MessageOrigin {
    pub fn new(kind: EventKind, channel: Option<ChannelKey>, iteration: Option<u64>) -> Self {
        Self {
            kind,
            channel,
            iteration,
            collapsible: false,
        }
    }

    pub fn collapsible(mut self) -> Self {
        self.collapsible = true;
        self
    }
}

/// One transcript entry.
///
/// Mutable only while `is_open`; the open flag transitions to `false` at
/// most once and never back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    pub content: String,
    pub created_at_unix_ms: u64,
    pub is_open: bool,
    pub origin: Option<MessageOrigin>,
}

/// Input for creating a message; the store assigns id and timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageDraft {
    pub role: Role,
    pub content: String,
    pub is_open: bool,
    pub origin: Option<MessageOrigin>,
}

impl MessageDraft {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            is_open: false,
            origin: None,
        }
    }

    pub fn assistant_open(content: impl Into<String>, origin: MessageOrigin) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            is_open: true,
            origin: Some(origin),
        }
    }

    pub fn assistant_closed(content: impl Into<String>, origin: MessageOrigin) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            is_open: false,
            origin: Some(origin),
        }
    }
}

/// Partial update applied through the store's single-writer entry point.
///
/// `set_open` can only close; reopening a sealed message is rejected by the
/// store regardless of what the patch says.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MessagePatch {
    pub append_text: Option<String>,
    pub set_open: Option<bool>,
}

impl MessagePatch {
    pub fn append(text: impl Into<String>) -> Self {
        Self {
            append_text: Some(text.into()),
            set_open: None,
        }
    }

    pub fn close() -> Self {
        Self {
            append_text: None,
            set_open: Some(false),
        }
    }
}

/// Stream-facing lifecycle of one conversation, observed by the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConversationStatus {
    #[default]
    Idle,
    Streaming,
    Errored,
    Interrupted,
}

/// Conversation aggregate owned by the transcript store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversation {
    pub id: ConversationId,
    pub title: Option<String>,
    pub messages: Vec<Message>,
    pub status: ConversationStatus,
    pub created_at_unix_ms: u64,
    pub updated_at_unix_ms: u64,
}

impl Conversation {
    pub fn new(id: ConversationId, created_at_unix_ms: u64) -> Self {
        Self {
            id,
            title: None,
            messages: Vec::new(),
            status: ConversationStatus::Idle,
            created_at_unix_ms,
            updated_at_unix_ms: created_at_unix_ms,
        }
    }

    /// Display title: the derived/user-set title, or the shared default.
    pub fn display_title(&self) -> &str {
        self.title.as_deref().unwrap_or(DEFAULT_CONVERSATION_TITLE)
    }
}

/// Derives a conversation title from the first user-authored content.
pub(crate) fn derive_title(content: &str) -> Option<String> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.chars().take(TITLE_DERIVATION_MAX_CHARS).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn title_derivation_truncates_by_characters_not_bytes() {
        let content = "é".repeat(80);
        let title = derive_title(&content).unwrap();
        assert_eq!(title.chars().count(), TITLE_DERIVATION_MAX_CHARS);
    }

    #[test]
    fn blank_content_derives_no_title() {
        assert_eq!(derive_title("   \n"), None);
        assert_eq!(derive_title(""), None);
    }
}
