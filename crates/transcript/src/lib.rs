//! Conversation transcript state for streamed multi-agent chats.
//!
//! The [`TranscriptStore`] is the single writer of conversation state; the
//! [`EventRouter`] turns decoded wire events into store mutations, and the
//! [`HistoryReconciler`] seeds conversations from persisted server history.

pub mod error;
pub mod ids;
pub mod reconcile;
pub mod router;
pub mod store;
pub mod types;

pub use error::{TranscriptError, TranscriptResult};
pub use ids::{ConversationId, MessageId};
pub use reconcile::{
    BoxFuture, HistoryFetchError, HistoryQuery, HistoryReconciler, HistorySource,
    PersistedExchange,
};
pub use router::{EventRouter, RouterEffect};
pub use store::TranscriptStore;
pub use types::{
    Conversation, ConversationStatus, Message, MessageDraft, MessageOrigin, MessagePatch, Role,
};
