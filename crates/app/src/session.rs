use braid_client::{
    ClientError, EventStream, HistoryClient, SessionClient, SessionPage, StreamClient, StreamItem,
    StreamRequest,
};
use braid_transcript::{
    Conversation, ConversationId, ConversationStatus, EventRouter, HistoryQuery,
    HistoryReconciler, Message, MessageDraft, RouterEffect, TranscriptError, TranscriptStore,
};
use braid_wire::{AgentEvent, StreamClose};
use snafu::{ResultExt, Snafu};

use super::settings::BackendSettings;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SessionError {
    #[snafu(display("failed to build http client on `{stage}`: {source}"))]
    BuildHttpClient {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("backend call failed on `{stage}`: {source}"))]
    Backend {
        stage: &'static str,
        source: ClientError,
    },
    #[snafu(display("transcript update failed on `{stage}`: {source}"))]
    Transcript {
        stage: &'static str,
        source: TranscriptError,
    },
}

pub type SessionResult<T> = Result<T, SessionError>;

/// Ties the transcript store, the streaming client, and history
/// reconciliation together for one backend.
pub struct ChatSession {
    store: TranscriptStore,
    stream_client: StreamClient,
    session_client: SessionClient,
    reconciler: HistoryReconciler<HistoryClient>,
}

impl ChatSession {
    pub fn new(settings: &BackendSettings) -> SessionResult<Self> {
        let http = reqwest::Client::builder()
            .build()
            .context(BuildHttpClientSnafu { stage: "build-http-client" })?;
        Ok(Self::with_http(http, settings))
    }

    pub fn with_http(http: reqwest::Client, settings: &BackendSettings) -> Self {
        let store = TranscriptStore::new();
        let history = HistoryClient::with_http(http.clone(), &settings.base_url);
        let reconciler = HistoryReconciler::new(store.clone(), history).with_query(HistoryQuery {
            limit: Some(settings.history_limit),
            skip: None,
        });
        Self {
            store,
            stream_client: StreamClient::with_http(http.clone(), &settings.base_url),
            session_client: SessionClient::with_http(http, &settings.base_url),
            reconciler,
        }
    }

    pub fn store(&self) -> &TranscriptStore {
        &self.store
    }

    pub fn new_conversation(&self) -> Conversation {
        self.store.create_conversation()
    }

    /// Loads a conversation for display, seeding it from persisted history
    /// when it is locally empty.
    pub async fn open_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> SessionResult<Vec<Message>> {
        self.reconciler
            .reconcile(conversation_id)
            .await
            .context(TranscriptSnafu { stage: "reconcile-history" })
    }

    pub async fn list_remote_sessions(&self, limit: Option<u32>) -> SessionResult<SessionPage> {
        self.session_client
            .list_sessions(limit, None)
            .await
            .context(BackendSnafu { stage: "list-sessions" })
    }

    /// Sends one user message and returns the turn driving its response
    /// stream. The stream is opened before any transcript mutation, so a
    /// rejected second submit leaves the conversation untouched.
    pub async fn submit(
        &self,
        conversation_id: ConversationId,
        message: impl Into<String>,
    ) -> SessionResult<ChatTurn> {
        let message = message.into();
        let handle = self
            .stream_client
            .open(StreamRequest::new(conversation_id, message.clone()))
            .await
            .context(BackendSnafu { stage: "open-stream" })?;

        self.store.adopt_conversation(conversation_id);
        self.store
            .append_message(conversation_id, MessageDraft::user(message))
            .context(TranscriptSnafu { stage: "append-user-message" })?;
        self.store
            .set_status(conversation_id, ConversationStatus::Streaming);

        tokio::spawn(handle.worker);
        Ok(ChatTurn {
            stream: handle.stream,
            router: EventRouter::new(self.store.clone(), conversation_id),
            store: self.store.clone(),
            finished: false,
        })
    }
}

/// One concrete step of a turn, surfaced to the caller for display.
#[derive(Debug)]
pub enum TurnStep {
    Event {
        event: AgentEvent,
        effect: RouterEffect,
    },
    Finished(ConversationStatus),
}

/// Drives one response stream into the transcript.
///
/// `next` must be polled to completion (or the turn cancelled); every
/// stream ending, including cancellation, seals the channels it left open
/// and settles the conversation status.
pub struct ChatTurn {
    stream: EventStream,
    router: EventRouter,
    store: TranscriptStore,
    finished: bool,
}

impl ChatTurn {
    pub fn conversation_id(&self) -> ConversationId {
        self.router.conversation_id()
    }

    /// Requests cooperative cancellation of the underlying stream; the
    /// interruption itself surfaces through the next `next` call.
    pub fn cancel(&mut self) -> bool {
        self.stream.cancel()
    }

    pub async fn next(&mut self) -> SessionResult<Option<TurnStep>> {
        if self.finished {
            return Ok(None);
        }

        match self.stream.recv().await {
            Some(StreamItem::Event(event)) => {
                let effect = self
                    .router
                    .apply(&event)
                    .context(TranscriptSnafu { stage: "route-event" })?;
                Ok(Some(TurnStep::Event { event, effect }))
            }
            Some(StreamItem::Closed(close)) => {
                let status = status_for_close(&close);
                self.settle(&close, status)?;
                Ok(Some(TurnStep::Finished(status)))
            }
            // The worker stopped without a close item: the turn was
            // cancelled on this side.
            None => {
                let close = StreamClose::Disconnected { detail: None };
                self.settle(&close, ConversationStatus::Interrupted)?;
                Ok(Some(TurnStep::Finished(ConversationStatus::Interrupted)))
            }
        }
    }

    fn settle(&mut self, close: &StreamClose, status: ConversationStatus) -> SessionResult<()> {
        self.finished = true;
        self.router
            .finish(close)
            .context(TranscriptSnafu { stage: "seal-open-channels" })?;
        self.store.set_status(self.router.conversation_id(), status);
        Ok(())
    }
}

fn status_for_close(close: &StreamClose) -> ConversationStatus {
    match close {
        StreamClose::Terminated => ConversationStatus::Idle,
        StreamClose::Disconnected { .. } => ConversationStatus::Errored,
    }
}
