use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use braid_transcript::ConversationId;
use braid_wire::{AgentEvent, DecoderStep, FrameDecoder, StreamClose};
use futures::Stream;
use serde::Serialize;
use snafu::ResultExt;
use tokio::sync::{mpsc, oneshot};

use super::error::{
    BuildClientSnafu, ClientResult, RequestSnafu, StatusSnafu, StreamAlreadyActiveSnafu,
};

/// One turn to stream: the user's text, scoped to a conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRequest {
    pub conversation_id: ConversationId,
    pub message: String,
}

impl StreamRequest {
    pub fn new(conversation_id: ConversationId, message: impl Into<String>) -> Self {
        Self {
            conversation_id,
            message: message.into(),
        }
    }
}

#[derive(Serialize)]
struct StreamRequestBody<'a> {
    message: &'a str,
    conversation_id: String,
}

/// What the stream consumer sees: decoded events, then exactly one close.
///
/// A cancelled stream ends with neither item; the receiver just drains to
/// `None` once the worker stops.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
    Event(AgentEvent),
    Closed(StreamClose),
}

pub type StreamWorker = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Receiver half of one in-flight stream.
///
/// Dropping it cancels the stream, which stops transport IO promptly.
pub struct EventStream {
    conversation_id: ConversationId,
    items: mpsc::UnboundedReceiver<StreamItem>,
    cancel_tx: Option<oneshot::Sender<()>>,
}

impl EventStream {
    fn new(
        conversation_id: ConversationId,
        items: mpsc::UnboundedReceiver<StreamItem>,
        cancel_tx: oneshot::Sender<()>,
    ) -> Self {
        Self {
            conversation_id,
            items,
            cancel_tx: Some(cancel_tx),
        }
    }

    pub fn conversation_id(&self) -> ConversationId {
        self.conversation_id
    }

    pub async fn recv(&mut self) -> Option<StreamItem> {
        self.items.recv().await
    }

    /// Requests cooperative cancellation; returns `false` when the worker
    /// already stopped.
    pub fn cancel(&mut self) -> bool {
        self.cancel_tx
            .take()
            .map(|tx| tx.send(()).is_ok())
            .unwrap_or(false)
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        if let Some(cancel_tx) = self.cancel_tx.take() {
            let _ = cancel_tx.send(());
        }
    }
}

/// An opened stream plus the worker future that feeds it. The caller must
/// drive `worker` (usually by spawning it) for items to arrive.
pub struct StreamHandle {
    pub stream: EventStream,
    pub worker: StreamWorker,
}

/// Tracking set enforcing one in-flight stream per conversation.
#[derive(Debug, Clone, Default)]
pub(crate) struct ActiveConversations {
    inner: Arc<Mutex<HashSet<ConversationId>>>,
}

impl ActiveConversations {
    pub(crate) fn acquire(&self, conversation_id: ConversationId) -> ClientResult<ActiveGuard> {
        let mut active = self.lock();
        if !active.insert(conversation_id) {
            return StreamAlreadyActiveSnafu {
                stage: "open-stream",
                conversation_id: conversation_id.to_string(),
            }
            .fail();
        }
        Ok(ActiveGuard {
            set: self.clone(),
            conversation_id,
        })
    }

    pub(crate) fn is_active(&self, conversation_id: ConversationId) -> bool {
        self.lock().contains(&conversation_id)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<ConversationId>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Releases the conversation's stream slot on drop, so a finished, failed,
/// or cancelled worker always frees it.
#[derive(Debug)]
pub(crate) struct ActiveGuard {
    set: ActiveConversations,
    conversation_id: ConversationId,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.set.lock().remove(&self.conversation_id);
    }
}

/// Opens SSE chat streams against the multi-agent backend.
#[derive(Debug, Clone)]
pub struct StreamClient {
    http: reqwest::Client,
    base_url: String,
    active: ActiveConversations,
}

impl StreamClient {
    pub fn new(base_url: impl Into<String>) -> ClientResult<Self> {
        let http = reqwest::Client::builder()
            .build()
            .context(BuildClientSnafu { stage: "build-stream-client" })?;
        Ok(Self::with_http(http, base_url))
    }

    pub fn with_http(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            active: ActiveConversations::default(),
        }
    }

    pub fn has_active_stream(&self, conversation_id: ConversationId) -> bool {
        self.active.is_active(conversation_id)
    }

    /// Opens one stream for the request's conversation.
    ///
    /// A second call while that conversation is still streaming is rejected
    /// rather than cancelling the first; silent cancellation could lose
    /// partial transcript content. A non-success response status fails here,
    /// before any handle is returned.
    pub async fn open(&self, request: StreamRequest) -> ClientResult<StreamHandle> {
        let guard = self.active.acquire(request.conversation_id)?;

        let body = StreamRequestBody {
            message: &request.message,
            conversation_id: request.conversation_id.to_string(),
        };
        let response = self
            .http
            .post(format!("{}/chat/stream", self.base_url))
            .json(&body)
            .send()
            .await
            .context(RequestSnafu { stage: "open-stream" })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return StatusSnafu {
                stage: "open-stream",
                status: status.as_u16(),
                body,
            }
            .fail();
        }

        tracing::debug!(conversation_id = %request.conversation_id, "stream opened");
        let decoder = FrameDecoder::new(Box::pin(response.bytes_stream()));
        Ok(make_stream_handle(request.conversation_id, decoder, guard))
    }
}

pub(crate) fn make_stream_handle<S, B, E>(
    conversation_id: ConversationId,
    decoder: FrameDecoder<S>,
    guard: ActiveGuard,
) -> StreamHandle
where
    S: Stream<Item = Result<B, E>> + Unpin + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let (item_tx, item_rx) = mpsc::unbounded_channel();
    let (cancel_tx, cancel_rx) = oneshot::channel();
    let stream = EventStream::new(conversation_id, item_rx, cancel_tx);
    let worker: StreamWorker = Box::pin(run_stream_worker(
        conversation_id,
        decoder,
        item_tx,
        cancel_rx,
        guard,
    ));
    StreamHandle { stream, worker }
}

async fn run_stream_worker<S, B, E>(
    conversation_id: ConversationId,
    mut decoder: FrameDecoder<S>,
    item_tx: mpsc::UnboundedSender<StreamItem>,
    mut cancel_rx: oneshot::Receiver<()>,
    guard: ActiveGuard,
) where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    // Holding the guard for the whole loop keeps the conversation's stream
    // slot taken until this worker actually stops.
    let _guard = guard;
    loop {
        tokio::select! {
            _ = &mut cancel_rx => {
                // Cancelled streams end without a close item; the receiver
                // observes the channel draining to `None`.
                tracing::debug!(%conversation_id, "stream cancelled");
                break;
            }
            step = decoder.next_step() => match step {
                DecoderStep::Event(event) => {
                    if item_tx.send(StreamItem::Event(event)).is_err() {
                        return;
                    }
                }
                DecoderStep::Closed(close) => {
                    tracing::debug!(%conversation_id, ?close, "stream closed");
                    let _ = item_tx.send(StreamItem::Closed(close));
                    break;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;

    fn handle_over(
        blocks: &[&str],
        active: &ActiveConversations,
        conversation_id: ConversationId,
    ) -> StreamHandle {
        let chunks = blocks
            .iter()
            .map(|block| Ok::<_, Infallible>(block.to_string().into_bytes()))
            .collect::<Vec<_>>();
        let decoder = FrameDecoder::new(futures::stream::iter(chunks));
        let guard = active.acquire(conversation_id).unwrap();
        make_stream_handle(conversation_id, decoder, guard)
    }

    #[tokio::test]
    async fn delivers_events_then_one_close() {
        let active = ActiveConversations::default();
        let conversation_id = ConversationId::new_v7();
        let mut handle = handle_over(
            &[
                "data: {\"event_type\": \"message_chunk\", \"node_name\": \"a\", \"data\": {\"text\": \"hi\"}}\n\n",
                "data: [DONE]\n\n",
            ],
            &active,
            conversation_id,
        );
        tokio::spawn(handle.worker);

        let first = handle.stream.recv().await.unwrap();
        assert!(matches!(first, StreamItem::Event(AgentEvent::MessageChunk { .. })));
        let second = handle.stream.recv().await.unwrap();
        assert_eq!(second, StreamItem::Closed(StreamClose::Terminated));
        assert!(handle.stream.recv().await.is_none());
    }

    #[tokio::test]
    async fn second_open_for_the_same_conversation_is_rejected() {
        let active = ActiveConversations::default();
        let conversation_id = ConversationId::new_v7();

        let _guard = active.acquire(conversation_id).unwrap();
        let error = active.acquire(conversation_id).unwrap_err();

        assert!(error.to_string().contains("already active"));
        assert!(active.is_active(conversation_id));
    }

    #[tokio::test]
    async fn guard_drop_frees_the_conversation_slot() {
        let active = ActiveConversations::default();
        let conversation_id = ConversationId::new_v7();

        drop(active.acquire(conversation_id).unwrap());

        assert!(!active.is_active(conversation_id));
        assert!(active.acquire(conversation_id).is_ok());
    }

    #[tokio::test]
    async fn cancel_ends_the_stream_without_a_close_item() {
        let active = ActiveConversations::default();
        let conversation_id = ConversationId::new_v7();
        // A source that never produces input, so the worker parks on read.
        let decoder = FrameDecoder::new(futures::stream::pending::<Result<Vec<u8>, Infallible>>());
        let guard = active.acquire(conversation_id).unwrap();
        let mut handle = make_stream_handle(conversation_id, decoder, guard);
        let worker = tokio::spawn(handle.worker);

        assert!(handle.stream.cancel());
        worker.await.unwrap();

        assert!(handle.stream.recv().await.is_none());
        assert!(!active.is_active(conversation_id));
        assert!(!handle.stream.cancel());
    }

    #[tokio::test]
    async fn worker_release_happens_after_normal_close_too() {
        let active = ActiveConversations::default();
        let conversation_id = ConversationId::new_v7();
        let mut handle = handle_over(&["data: [DONE]\n\n"], &active, conversation_id);
        tokio::spawn(handle.worker);

        assert_eq!(
            handle.stream.recv().await,
            Some(StreamItem::Closed(StreamClose::Terminated))
        );
        assert!(handle.stream.recv().await.is_none());
        assert!(!active.is_active(conversation_id));
    }
}
