use futures::{Stream, StreamExt};

use crate::event::AgentEvent;

/// Prefix every payload-bearing line starts with.
const DATA_PREFIX: &str = "data:";
/// Sentinel payload that ends the stream normally.
const TERMINATOR_PAYLOAD: &str = "[DONE]";

/// How one stream stopped yielding events.
///
/// Disconnection is deliberately not an [`AgentEvent::Error`]: a dropped
/// transport is a property of the whole stream, not one more transcript
/// entry, and the consumer decides what to do with in-flight messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamClose {
    /// The producer sent the `[DONE]` terminator.
    Terminated,
    /// The source ended or failed before the terminator arrived.
    Disconnected { detail: Option<String> },
}

/// One pull from the decoder.
#[derive(Debug, Clone, PartialEq)]
pub enum DecoderStep {
    Event(AgentEvent),
    Closed(StreamClose),
}

/// Incremental decoder for the blank-line-framed event stream.
///
/// Wraps any fallible chunk stream and yields typed events one at a time.
/// Single pass and non-restartable: once a [`DecoderStep::Closed`] is
/// returned, every further pull repeats it. Partial blocks are buffered
/// across reads and never surface; malformed payloads surface as synthetic
/// error events so one bad frame cannot abort the stream.
pub struct FrameDecoder<S> {
    source: S,
    buffer: Vec<u8>,
    close: Option<StreamClose>,
}

impl<S, B, E> FrameDecoder<S>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    pub fn new(source: S) -> Self {
        Self {
            source,
            buffer: Vec::new(),
            close: None,
        }
    }

    /// Pulls the next decoded step, suspending until a complete block is
    /// available or the source closes.
    pub async fn next_step(&mut self) -> DecoderStep {
        loop {
            if let Some(close) = &self.close {
                return DecoderStep::Closed(close.clone());
            }

            while let Some(block) = self.take_block() {
                match decode_block(&block) {
                    BlockOutcome::Event(event) => return DecoderStep::Event(event),
                    BlockOutcome::Terminator => {
                        return self.close_with(StreamClose::Terminated);
                    }
                    BlockOutcome::Empty => continue,
                }
            }

            match self.source.next().await {
                Some(Ok(chunk)) => self.buffer.extend_from_slice(chunk.as_ref()),
                Some(Err(source)) => {
                    tracing::warn!(error = %source, "event stream transport failed mid-stream");
                    return self.close_with(StreamClose::Disconnected {
                        detail: Some(source.to_string()),
                    });
                }
                None => {
                    // Anything still buffered is by definition a partial
                    // block; it is dropped rather than emitted.
                    if !self.buffer.is_empty() {
                        tracing::debug!(
                            buffered_bytes = self.buffer.len(),
                            "discarding partial block after source close"
                        );
                    }
                    return self.close_with(StreamClose::Disconnected { detail: None });
                }
            }
        }
    }

    fn close_with(&mut self, close: StreamClose) -> DecoderStep {
        self.close = Some(close.clone());
        DecoderStep::Closed(close)
    }

    /// Splits one complete block off the front of the buffer, if any.
    fn take_block(&mut self) -> Option<String> {
        let boundary = find_blank_line(&self.buffer)?;
        let remainder = self.buffer.split_off(boundary.next_block_offset);
        let block_bytes = &self.buffer[..boundary.block_len];
        let block = String::from_utf8_lossy(block_bytes).into_owned();
        self.buffer = remainder;
        Some(block)
    }
}

struct BlockBoundary {
    block_len: usize,
    next_block_offset: usize,
}

/// Locates the first blank-line separator, tolerating `\r\n` line endings.
fn find_blank_line(buffer: &[u8]) -> Option<BlockBoundary> {
    let mut offset = 0;
    while let Some(position) = buffer[offset..].iter().position(|byte| *byte == b'\n') {
        let newline_at = offset + position;
        let line = &buffer[offset..newline_at];
        let line_is_blank = line.is_empty() || line == b"\r";
        if line_is_blank && offset > 0 {
            return Some(BlockBoundary {
                block_len: offset,
                next_block_offset: newline_at + 1,
            });
        }
        if line_is_blank {
            // Leading separators before any payload are skipped in place.
            return Some(BlockBoundary {
                block_len: 0,
                next_block_offset: newline_at + 1,
            });
        }
        offset = newline_at + 1;
    }
    None
}

enum BlockOutcome {
    Event(AgentEvent),
    Terminator,
    Empty,
}

/// Decodes one complete block into an event, the terminator, or nothing.
fn decode_block(block: &str) -> BlockOutcome {
    let mut payload = String::new();
    let mut saw_data_line = false;

    for line in block.lines() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            continue;
        }
        let Some(rest) = line.strip_prefix(DATA_PREFIX) else {
            // A block that is not data-framed at all is malformed input,
            // reported in-band so the stream keeps going.
            return BlockOutcome::Event(AgentEvent::Error {
                channel: None,
                detail: format!("frame without data prefix: {line}"),
            });
        };
        if !payload.is_empty() {
            payload.push('\n');
        }
        payload.push_str(rest.strip_prefix(' ').unwrap_or(rest));
        saw_data_line = true;
    }

    if !saw_data_line {
        return BlockOutcome::Empty;
    }
    if payload == TERMINATOR_PAYLOAD {
        return BlockOutcome::Terminator;
    }

    match AgentEvent::from_payload(&payload) {
        Ok(event) => BlockOutcome::Event(event),
        Err(source) => {
            tracing::debug!(error = %source, "frame payload failed to parse");
            BlockOutcome::Event(AgentEvent::Error {
                channel: None,
                detail: format!("malformed frame payload ({source}): {payload}"),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::ChannelKey;
    use std::convert::Infallible;

    fn chunked(chunks: Vec<&str>) -> impl Stream<Item = Result<Vec<u8>, Infallible>> + Unpin {
        futures::stream::iter(
            chunks
                .into_iter()
                .map(|chunk| Ok(chunk.as_bytes().to_vec()))
                .collect::<Vec<_>>(),
        )
    }

    fn failing_after(
        chunks: Vec<&str>,
        error: &str,
    ) -> impl Stream<Item = Result<Vec<u8>, String>> + Unpin {
        let mut items = chunks
            .into_iter()
            .map(|chunk| Ok(chunk.as_bytes().to_vec()))
            .collect::<Vec<Result<Vec<u8>, String>>>();
        items.push(Err(error.to_string()));
        futures::stream::iter(items)
    }

    async fn drain<S, B, E>(decoder: &mut FrameDecoder<S>) -> (Vec<AgentEvent>, StreamClose)
    where
        S: Stream<Item = Result<B, E>> + Unpin,
        B: AsRef<[u8]>,
        E: std::fmt::Display,
    {
        let mut events = Vec::new();
        loop {
            match decoder.next_step().await {
                DecoderStep::Event(event) => events.push(event),
                DecoderStep::Closed(close) => return (events, close),
            }
        }
    }

    #[tokio::test]
    async fn single_node_lifecycle_round_trip() {
        let source = chunked(vec![
            "data: {\"event_type\":\"node_start\",\"node_name\":\"a\"}\n\n",
            "data: {\"event_type\":\"message_chunk\",\"node_name\":\"a\",\"data\":{\"text\":\"Hel\"}}\n\n",
            "data: {\"event_type\":\"message_chunk\",\"node_name\":\"a\",\"data\":{\"text\":\"lo\"}}\n\n",
            "data: {\"event_type\":\"node_end\",\"node_name\":\"a\"}\n\n",
            "data: [DONE]\n\n",
        ]);
        let mut decoder = FrameDecoder::new(source);

        let (events, close) = drain(&mut decoder).await;

        assert_eq!(events.len(), 4);
        assert!(matches!(&events[0], AgentEvent::NodeStart { channel, .. } if channel.name() == "a"));
        assert!(matches!(&events[1], AgentEvent::MessageChunk { text, .. } if text == "Hel"));
        assert!(matches!(&events[2], AgentEvent::MessageChunk { text, .. } if text == "lo"));
        assert!(matches!(&events[3], AgentEvent::NodeEnd { .. }));
        assert_eq!(close, StreamClose::Terminated);
    }

    #[tokio::test]
    async fn blocks_split_across_arbitrary_read_boundaries_reassemble() {
        let wire = "data: {\"event_type\":\"message_chunk\",\"node_name\":\"a\",\"data\":{\"text\":\"chunked\"}}\n\ndata: [DONE]\n\n";
        for split_at in 1..wire.len() {
            let (head, tail) = wire.split_at(split_at);
            let mut decoder = FrameDecoder::new(chunked(vec![head, tail]));

            let (events, close) = drain(&mut decoder).await;

            assert_eq!(events.len(), 1, "split at byte {split_at}");
            assert!(
                matches!(&events[0], AgentEvent::MessageChunk { text, .. } if text == "chunked")
            );
            assert_eq!(close, StreamClose::Terminated);
        }
    }

    #[tokio::test]
    async fn malformed_payload_becomes_one_error_event_then_clean_end() {
        let source = chunked(vec!["data: {not json}\n\n", "data: [DONE]\n\n"]);
        let mut decoder = FrameDecoder::new(source);

        let (events, close) = drain(&mut decoder).await;

        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            AgentEvent::Error { channel: None, detail } if detail.contains("{not json}")
        ));
        assert_eq!(close, StreamClose::Terminated);
    }

    #[tokio::test]
    async fn source_end_without_terminator_is_a_disconnect() {
        let source = chunked(vec![
            "data: {\"event_type\":\"node_start\",\"node_name\":\"a\"}\n\n",
            "data: {\"event_type\":\"message_chunk\",\"node_na",
        ]);
        let mut decoder = FrameDecoder::new(source);

        let (events, close) = drain(&mut decoder).await;

        // The trailing partial block never surfaces as an event.
        assert_eq!(events.len(), 1);
        assert_eq!(close, StreamClose::Disconnected { detail: None });
    }

    #[tokio::test]
    async fn transport_error_closes_with_detail() {
        let source = failing_after(
            vec!["data: {\"event_type\":\"node_start\",\"node_name\":\"a\"}\n\n"],
            "connection reset",
        );
        let mut decoder = FrameDecoder::new(source);

        let (events, close) = drain(&mut decoder).await;

        assert_eq!(events.len(), 1);
        assert_eq!(
            close,
            StreamClose::Disconnected {
                detail: Some("connection reset".to_string()),
            }
        );
    }

    #[tokio::test]
    async fn decoder_is_fused_after_close() {
        let mut decoder = FrameDecoder::new(chunked(vec!["data: [DONE]\n\n"]));

        assert_eq!(
            decoder.next_step().await,
            DecoderStep::Closed(StreamClose::Terminated)
        );
        assert_eq!(
            decoder.next_step().await,
            DecoderStep::Closed(StreamClose::Terminated)
        );
    }

    #[tokio::test]
    async fn events_after_an_error_event_still_decode() {
        let source = chunked(vec![
            "data: {\"event_type\":\"error\",\"node_name\":null,\"data\":{\"error\":\"ValueError: boom\"}}\n\n",
            "data: {\"event_type\":\"message_chunk\",\"node_name\":\"b\",\"data\":{\"text\":\"still here\"}}\n\n",
            "data: [DONE]\n\n",
        ]);
        let mut decoder = FrameDecoder::new(source);

        let (events, close) = drain(&mut decoder).await;

        assert_eq!(events.len(), 2);
        assert!(matches!(
            &events[0],
            AgentEvent::Error { detail, .. } if detail == "ValueError: boom"
        ));
        assert!(matches!(
            &events[1],
            AgentEvent::MessageChunk { channel, text } if channel == &ChannelKey::new("b") && text == "still here"
        ));
        assert_eq!(close, StreamClose::Terminated);
    }

    #[tokio::test]
    async fn crlf_framing_and_leading_separators_are_tolerated() {
        let source = chunked(vec![
            "\r\ndata: {\"event_type\":\"message_chunk\",\"node_name\":\"a\",\"data\":{\"text\":\"ok\"}}\r\n\r\ndata: [DONE]\r\n\r\n",
        ]);
        let mut decoder = FrameDecoder::new(source);

        let (events, close) = drain(&mut decoder).await;

        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], AgentEvent::MessageChunk { text, .. } if text == "ok"));
        assert_eq!(close, StreamClose::Terminated);
    }
}
