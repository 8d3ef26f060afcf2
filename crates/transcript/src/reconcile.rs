use std::future::Future;
use std::pin::Pin;

use snafu::Snafu;

use super::error::TranscriptResult;
use super::ids::ConversationId;
use super::store::TranscriptStore;
use super::types::Message;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// One persisted request/response pair, already closed on the server.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistedExchange {
    pub record_id: String,
    pub user_message: String,
    pub assistant_message: String,
    pub created_at_unix_ms: Option<u64>,
}

/// Paging window for a history fetch.
#[derive(Debug, Clone, Copy, Default)]
pub struct HistoryQuery {
    pub limit: Option<u32>,
    pub skip: Option<u32>,
}

#[derive(Debug, Snafu)]
#[snafu(display("[{stage}] history fetch failed: {detail}"))]
pub struct HistoryFetchError {
    pub stage: &'static str,
    pub detail: String,
}

/// Source of persisted conversation history, keyed by conversation id.
///
/// Implementations must treat "no history yet" (404 or an empty page) as
/// `Ok(vec![])`, not as an error.
pub trait HistorySource: Send + Sync {
    fn fetch_exchanges(
        &self,
        conversation_id: ConversationId,
        query: HistoryQuery,
    ) -> BoxFuture<'_, Result<Vec<PersistedExchange>, HistoryFetchError>>;
}

/// Merges persisted history into the live transcript.
///
/// The in-memory transcript is authoritative: when a conversation already
/// holds messages (possibly mid-stream), the persisted fetch is skipped so
/// stale server state can never clobber live content.
pub struct HistoryReconciler<S> {
    store: TranscriptStore,
    source: S,
    query: HistoryQuery,
}

impl<S: HistorySource> HistoryReconciler<S> {
    pub fn new(store: TranscriptStore, source: S) -> Self {
        Self {
            store,
            source,
            query: HistoryQuery::default(),
        }
    }

    pub fn with_query(mut self, query: HistoryQuery) -> Self {
        self.query = query;
        self
    }

    /// Returns the ordered message view for one conversation, seeding it
    /// from persisted history when the conversation is locally empty.
    ///
    /// Safe to call repeatedly; seeding is deduplicated on the persisted
    /// record id, so a second pass with unchanged inputs changes nothing.
    /// A fetch failure degrades to the in-memory view and is logged.
    pub async fn reconcile(
        &self,
        conversation_id: ConversationId,
    ) -> TranscriptResult<Vec<Message>> {
        self.store.adopt_conversation(conversation_id);

        let live = self.store.messages(conversation_id);
        if !live.is_empty() {
            return Ok(live);
        }

        let exchanges = match self.source.fetch_exchanges(conversation_id, self.query).await {
            Ok(exchanges) => exchanges,
            Err(error) => {
                tracing::warn!(%conversation_id, %error, "history fetch failed, using empty view");
                return Ok(self.store.messages(conversation_id));
            }
        };

        for exchange in &exchanges {
            self.store.seed_history_exchange(
                conversation_id,
                &exchange.record_id,
                &exchange.user_message,
                &exchange.assistant_message,
                exchange.created_at_unix_ms,
            )?;
        }

        Ok(self.store.messages(conversation_id))
    }
}
