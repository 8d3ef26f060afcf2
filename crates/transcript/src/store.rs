use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use super::error::{ConversationNotFoundSnafu, TranscriptResult};
use super::ids::{ConversationId, MessageId};
use super::types::{
    Conversation, ConversationStatus, Message, MessageDraft, MessagePatch, Role, derive_title,
};

/// Single-writer owner of all conversation state.
///
/// Every mutation entry point serializes on one lock, so interleaved
/// asynchronous callers can never observe a half-applied mutation. Handles
/// are cheap clones of the same underlying state.
#[derive(Debug, Clone, Default)]
pub struct TranscriptStore {
    inner: Arc<Mutex<StoreState>>,
}

#[derive(Debug, Default)]
struct StoreState {
    conversations: HashMap<ConversationId, Conversation>,
    // Persisted-history record ids already seeded, keyed per conversation,
    // so repeated reconciliation stays idempotent.
    seeded_records: HashMap<ConversationId, HashSet<String>>,
}

impl TranscriptStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a fresh local conversation and returns a snapshot of it.
    pub fn create_conversation(&self) -> Conversation {
        let conversation = Conversation::new(ConversationId::new_v7(), now_unix_ms());
        let mut state = self.state();
        state
            .conversations
            .insert(conversation.id, conversation.clone());
        conversation
    }

    /// Materializes a conversation for a server-known session id, or returns
    /// the existing one. Used when reconciliation runs against sessions this
    /// process did not create.
    pub fn adopt_conversation(&self, conversation_id: ConversationId) -> Conversation {
        let mut state = self.state();
        state
            .conversations
            .entry(conversation_id)
            .or_insert_with(|| Conversation::new(conversation_id, now_unix_ms()))
            .clone()
    }

    pub fn get_conversation(&self, conversation_id: ConversationId) -> Option<Conversation> {
        self.state().conversations.get(&conversation_id).cloned()
    }

    /// Ordered message view for one conversation; empty when unknown.
    pub fn messages(&self, conversation_id: ConversationId) -> Vec<Message> {
        self.state()
            .conversations
            .get(&conversation_id)
            .map(|conversation| conversation.messages.clone())
            .unwrap_or_default()
    }

    /// Conversations ordered most-recently-updated first.
    pub fn list_conversations(&self) -> Vec<Conversation> {
        let state = self.state();
        let mut conversations = state.conversations.values().cloned().collect::<Vec<_>>();
        conversations.sort_by(|left, right| {
            right
                .updated_at_unix_ms
                .cmp(&left.updated_at_unix_ms)
                .then_with(|| right.id.cmp(&left.id))
        });
        conversations
    }

    /// Appends a message at the tail and returns its freshly assigned id.
    ///
    /// Derives the conversation title from the first user-authored message
    /// when no title is set yet. Assigned timestamps are strictly monotonic
    /// within a conversation.
    pub fn append_message(
        &self,
        conversation_id: ConversationId,
        draft: MessageDraft,
    ) -> TranscriptResult<MessageId> {
        let mut state = self.state();
        let Some(conversation) = state.conversations.get_mut(&conversation_id) else {
            return ConversationNotFoundSnafu {
                stage: "append-message",
                id: conversation_id.to_string(),
            }
            .fail();
        };

        let message_id = MessageId::new_v7();
        let created_at = next_created_at(conversation);

        if conversation.title.is_none() && draft.role == Role::User {
            conversation.title = derive_title(&draft.content);
        }

        conversation.messages.push(Message {
            id: message_id,
            role: draft.role,
            content: draft.content,
            created_at_unix_ms: created_at,
            is_open: draft.is_open,
            origin: draft.origin,
        });
        conversation.updated_at_unix_ms = now_unix_ms().max(conversation.updated_at_unix_ms);

        Ok(message_id)
    }

    /// Applies a partial update to one message.
    ///
    /// A missing conversation or message is a silent no-op: a late channel
    /// close may race a conversation eviction and must not fail. A sealed
    /// message can never reopen, whatever the patch says.
    pub fn mutate_message(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
        patch: MessagePatch,
    ) {
        let mut state = self.state();
        let Some(conversation) = state.conversations.get_mut(&conversation_id) else {
            tracing::debug!(%conversation_id, %message_id, "mutate on unknown conversation ignored");
            return;
        };
        let Some(message) = conversation
            .messages
            .iter_mut()
            .find(|message| message.id == message_id)
        else {
            tracing::debug!(%conversation_id, %message_id, "mutate on unknown message ignored");
            return;
        };

        if let Some(delta) = patch.append_text {
            message.content.push_str(&delta);
        }
        match patch.set_open {
            Some(false) => message.is_open = false,
            Some(true) if !message.is_open => {
                tracing::debug!(%message_id, "refusing to reopen a sealed message");
            }
            Some(true) | None => {}
        }

        conversation.updated_at_unix_ms = now_unix_ms().max(conversation.updated_at_unix_ms);
    }

    /// Replaces a whole conversation snapshot, keeping its id.
    pub fn replace_conversation(&self, conversation: Conversation) {
        let mut state = self.state();
        state.conversations.insert(conversation.id, conversation);
    }

    /// Updates the stream-facing status; unknown conversations are ignored.
    pub fn set_status(&self, conversation_id: ConversationId, status: ConversationStatus) {
        let mut state = self.state();
        let Some(conversation) = state.conversations.get_mut(&conversation_id) else {
            tracing::debug!(%conversation_id, ?status, "status change on unknown conversation ignored");
            return;
        };
        conversation.status = status;
        conversation.updated_at_unix_ms = now_unix_ms().max(conversation.updated_at_unix_ms);
    }

    pub fn delete_conversation(&self, conversation_id: ConversationId) -> TranscriptResult<()> {
        let mut state = self.state();
        if state.conversations.remove(&conversation_id).is_none() {
            return ConversationNotFoundSnafu {
                stage: "delete-conversation",
                id: conversation_id.to_string(),
            }
            .fail();
        }
        state.seeded_records.remove(&conversation_id);
        Ok(())
    }

    pub fn clear_conversations(&self) {
        let mut state = self.state();
        state.conversations.clear();
        state.seeded_records.clear();
    }

    /// Seeds one persisted request/response pair as two closed messages.
    ///
    /// Returns `false` without touching the transcript when this record id
    /// was seeded before. The assistant message is stamped one tick after
    /// the user message so ordering stays stable under equal timestamps.
    pub fn seed_history_exchange(
        &self,
        conversation_id: ConversationId,
        record_id: &str,
        user_text: &str,
        assistant_text: &str,
        created_at_hint_ms: Option<u64>,
    ) -> TranscriptResult<bool> {
        let mut state = self.state();
        if !state.conversations.contains_key(&conversation_id) {
            return ConversationNotFoundSnafu {
                stage: "seed-history-exchange",
                id: conversation_id.to_string(),
            }
            .fail();
        }

        let already_seeded = !state
            .seeded_records
            .entry(conversation_id)
            .or_default()
            .insert(record_id.to_string());
        if already_seeded {
            return Ok(false);
        }

        // contains_key above guarantees the entry; re-borrow for mutation.
        let Some(conversation) = state.conversations.get_mut(&conversation_id) else {
            return Ok(false);
        };

        // A historical hint is kept as-is; it is only floored against the
        // tail message so per-conversation ordering stays monotonic.
        let user_at = match created_at_hint_ms {
            Some(hint) => hint.max(tail_floor(conversation)),
            None => next_created_at(conversation),
        };
        let assistant_at = user_at + 1;

        if conversation.title.is_none() {
            conversation.title = derive_title(user_text);
        }

        conversation.messages.push(Message {
            id: MessageId::new_v7(),
            role: Role::User,
            content: user_text.to_string(),
            created_at_unix_ms: user_at,
            is_open: false,
            origin: None,
        });
        conversation.messages.push(Message {
            id: MessageId::new_v7(),
            role: Role::Assistant,
            content: assistant_text.to_string(),
            created_at_unix_ms: assistant_at,
            is_open: false,
            origin: None,
        });
        conversation.updated_at_unix_ms = now_unix_ms().max(conversation.updated_at_unix_ms);

        Ok(true)
    }

    fn state(&self) -> MutexGuard<'_, StoreState> {
        match self.inner.lock() {
            Ok(guard) => guard,
            // A poisoned lock still holds coherent data because every
            // mutation completes under one guard; recover the state.
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_millis() as u64)
}

/// Lowest creation timestamp that keeps the conversation monotonic.
fn tail_floor(conversation: &Conversation) -> u64 {
    conversation
        .messages
        .last()
        .map(|message| message.created_at_unix_ms + 1)
        .unwrap_or(0)
}

/// Next strictly-monotonic creation timestamp for one conversation.
fn next_created_at(conversation: &Conversation) -> u64 {
    now_unix_ms().max(tail_floor(conversation))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_conversation() -> (TranscriptStore, ConversationId) {
        let store = TranscriptStore::new();
        let conversation = store.create_conversation();
        (store, conversation.id)
    }

    #[test]
    fn append_assigns_fresh_ids_and_keeps_arrival_order() {
        let (store, conversation_id) = store_with_conversation();

        let first = store
            .append_message(conversation_id, MessageDraft::user("one"))
            .unwrap();
        let second = store
            .append_message(conversation_id, MessageDraft::user("two"))
            .unwrap();

        let messages = store.messages(conversation_id);
        assert_ne!(first, second);
        assert_eq!(
            messages.iter().map(|message| message.id).collect::<Vec<_>>(),
            vec![first, second]
        );
        assert!(messages[0].created_at_unix_ms < messages[1].created_at_unix_ms);
    }

    #[test]
    fn title_derives_from_first_user_message_only() {
        let (store, conversation_id) = store_with_conversation();
        let long_prompt = "x".repeat(80);

        store
            .append_message(conversation_id, MessageDraft::user(long_prompt))
            .unwrap();
        store
            .append_message(conversation_id, MessageDraft::user("second prompt"))
            .unwrap();

        let conversation = store.get_conversation(conversation_id).unwrap();
        let title = conversation.title.unwrap();
        assert_eq!(title.chars().count(), 50);
        assert!(title.starts_with('x'));
    }

    #[test]
    fn mutate_appends_preserving_existing_content() {
        let (store, conversation_id) = store_with_conversation();
        let message_id = store
            .append_message(
                conversation_id,
                MessageDraft {
                    role: Role::Assistant,
                    content: "Hel".to_string(),
                    is_open: true,
                    origin: None,
                },
            )
            .unwrap();

        store.mutate_message(conversation_id, message_id, MessagePatch::append("lo"));

        assert_eq!(store.messages(conversation_id)[0].content, "Hello");
    }

    #[test]
    fn mutate_on_missing_targets_is_a_silent_no_op() {
        let (store, conversation_id) = store_with_conversation();

        store.mutate_message(conversation_id, MessageId::new_v7(), MessagePatch::close());
        store.mutate_message(
            ConversationId::new_v7(),
            MessageId::new_v7(),
            MessagePatch::append("ghost"),
        );

        assert!(store.messages(conversation_id).is_empty());
    }

    #[test]
    fn sealed_messages_never_reopen() {
        let (store, conversation_id) = store_with_conversation();
        let message_id = store
            .append_message(
                conversation_id,
                MessageDraft {
                    role: Role::Assistant,
                    content: String::new(),
                    is_open: true,
                    origin: None,
                },
            )
            .unwrap();

        store.mutate_message(conversation_id, message_id, MessagePatch::close());
        store.mutate_message(
            conversation_id,
            message_id,
            MessagePatch {
                append_text: None,
                set_open: Some(true),
            },
        );

        assert!(!store.messages(conversation_id)[0].is_open);
    }

    #[test]
    fn seeding_the_same_record_twice_inserts_once() {
        let (store, conversation_id) = store_with_conversation();

        let first = store
            .seed_history_exchange(conversation_id, "rec-1", "hi", "yo", None)
            .unwrap();
        let second = store
            .seed_history_exchange(conversation_id, "rec-1", "hi", "yo", None)
            .unwrap();

        assert!(first);
        assert!(!second);
        assert_eq!(store.messages(conversation_id).len(), 2);
    }

    #[test]
    fn seeded_pair_orders_user_then_assistant_with_later_timestamp() {
        let (store, conversation_id) = store_with_conversation();

        store
            .seed_history_exchange(conversation_id, "rec-1", "hi", "yo", Some(1_000))
            .unwrap();

        let messages = store.messages(conversation_id);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[1].role, Role::Assistant);
        // The persisted timestamp is kept, not replaced with the wall clock.
        assert_eq!(messages[0].created_at_unix_ms, 1_000);
        assert_eq!(messages[1].created_at_unix_ms, 1_001);
        assert!(messages.iter().all(|message| !message.is_open));
    }

    #[test]
    fn seeded_hints_floor_against_the_tail_message_only() {
        let (store, conversation_id) = store_with_conversation();

        store
            .seed_history_exchange(conversation_id, "rec-1", "first", "a", Some(5_000))
            .unwrap();
        // An out-of-order hint older than the tail is bumped past it.
        store
            .seed_history_exchange(conversation_id, "rec-2", "second", "b", Some(2_000))
            .unwrap();

        let messages = store.messages(conversation_id);
        assert_eq!(messages[2].created_at_unix_ms, 5_002);
        assert_eq!(messages[3].created_at_unix_ms, 5_003);
    }

    #[test]
    fn list_orders_by_most_recent_update() {
        let store = TranscriptStore::new();
        let older = store.create_conversation();
        let newer = store.create_conversation();

        store
            .append_message(newer.id, MessageDraft::user("bump"))
            .unwrap();

        let listed = store.list_conversations();
        assert_eq!(listed[0].id, newer.id);
        assert!(listed.iter().any(|conversation| conversation.id == older.id));
    }

    #[test]
    fn adopt_is_idempotent_for_a_known_id() {
        let store = TranscriptStore::new();
        let conversation_id = ConversationId::new_v7();

        let first = store.adopt_conversation(conversation_id);
        store
            .append_message(conversation_id, MessageDraft::user("kept"))
            .unwrap();
        let second = store.adopt_conversation(conversation_id);

        assert_eq!(first.id, second.id);
        assert_eq!(second.messages.len(), 1);
    }

    #[test]
    fn replace_swaps_the_whole_snapshot() {
        let (store, conversation_id) = store_with_conversation();
        store
            .append_message(conversation_id, MessageDraft::user("before"))
            .unwrap();

        let mut snapshot = store.get_conversation(conversation_id).unwrap();
        snapshot.messages.clear();
        snapshot.title = Some("replaced".to_string());
        store.replace_conversation(snapshot);

        let conversation = store.get_conversation(conversation_id).unwrap();
        assert!(conversation.messages.is_empty());
        assert_eq!(conversation.display_title(), "replaced");
    }

    #[test]
    fn delete_and_clear_remove_state() {
        let (store, conversation_id) = store_with_conversation();
        store
            .seed_history_exchange(conversation_id, "rec-1", "hi", "yo", None)
            .unwrap();

        store.delete_conversation(conversation_id).unwrap();
        assert!(store.get_conversation(conversation_id).is_none());
        assert!(store.delete_conversation(conversation_id).is_err());

        let survivor = store.create_conversation();
        store.clear_conversations();
        assert!(store.get_conversation(survivor.id).is_none());
    }
}
