use std::collections::HashMap;

use braid_wire::{AgentEvent, ChannelKey, RunSummary, StreamClose, ToolOutcome};

use super::error::TranscriptResult;
use super::ids::{ConversationId, MessageId};
use super::store::TranscriptStore;
use super::types::{MessageDraft, MessageOrigin, MessagePatch};

/// What one routed event did to the transcript.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouterEffect {
    Created(MessageId),
    Appended(MessageId),
    Closed(MessageId),
    Ignored,
}

/// Per-conversation demultiplexer from wire events to store mutations.
///
/// Consumes events strictly in arrival order on one task; the slot map
/// tracks at most one open assistant message per channel. Channels from
/// different agents interleave freely on the wire, so a slot is resolved
/// per event rather than assumed from the previous one.
pub struct EventRouter {
    store: TranscriptStore,
    conversation_id: ConversationId,
    slots: HashMap<ChannelKey, MessageId>,
}

impl EventRouter {
    pub fn new(store: TranscriptStore, conversation_id: ConversationId) -> Self {
        Self {
            store,
            conversation_id,
            slots: HashMap::new(),
        }
    }

    pub fn conversation_id(&self) -> ConversationId {
        self.conversation_id
    }

    pub fn open_slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Applies one decoded event, called exactly once per event.
    pub fn apply(&mut self, event: &AgentEvent) -> TranscriptResult<RouterEffect> {
        match event {
            AgentEvent::NodeStart {
                channel, iteration, ..
            } => self.open_channel(channel, *iteration),
            AgentEvent::MessageChunk { channel, text } => self.append_delta(channel, text),
            AgentEvent::ToolStart {
                channel,
                iteration,
                tool_name,
                ..
            } => self.annotate(
                channel,
                *iteration,
                event,
                format!("Running tool `{tool_name}`"),
                false,
            ),
            AgentEvent::ToolResult {
                channel,
                iteration,
                tool_name,
                outcome,
            } => self.annotate(
                channel,
                *iteration,
                event,
                render_tool_outcome(tool_name, outcome),
                false,
            ),
            AgentEvent::NodeEnd { channel, .. } | AgentEvent::ReasonEnd { channel, .. } => {
                Ok(self.close_channel(channel))
            }
            AgentEvent::Final {
                channel,
                iteration,
                summary,
            } => self.annotate(channel, *iteration, event, render_run_summary(summary), true),
            AgentEvent::Error { channel, detail } => {
                let channel = channel.clone().unwrap_or_default();
                self.annotate(&channel, None, event, detail.clone(), false)
            }
        }
    }

    /// Seals every slot still open after the stream ended, whatever the
    /// reason. A source that never terminates its channels would otherwise
    /// leave messages open in the transcript forever.
    pub fn finish(&mut self, close: &StreamClose) -> TranscriptResult<Vec<RouterEffect>> {
        let mut effects = Vec::with_capacity(self.slots.len());
        for (channel, message_id) in self.slots.drain() {
            tracing::debug!(
                conversation_id = %self.conversation_id,
                channel = channel.name(),
                ?close,
                "force-closing channel left open at stream end"
            );
            self.store
                .mutate_message(self.conversation_id, message_id, MessagePatch::close());
            effects.push(RouterEffect::Closed(message_id));
        }
        Ok(effects)
    }

    fn open_channel(
        &mut self,
        channel: &ChannelKey,
        iteration: Option<u64>,
    ) -> TranscriptResult<RouterEffect> {
        if self.slots.contains_key(channel) {
            // Duplicate start while the channel is still open; the existing
            // slot keeps accumulating.
            return Ok(RouterEffect::Ignored);
        }
        let origin = MessageOrigin::new(
            braid_wire::EventKind::NodeStart,
            Some(channel.clone()),
            iteration,
        );
        let message_id = self.store.append_message(
            self.conversation_id,
            MessageDraft::assistant_open(String::new(), origin),
        )?;
        self.slots.insert(channel.clone(), message_id);
        Ok(RouterEffect::Created(message_id))
    }

    fn append_delta(&mut self, channel: &ChannelKey, text: &str) -> TranscriptResult<RouterEffect> {
        if let Some(message_id) = self.slots.get(channel) {
            self.store
                .mutate_message(self.conversation_id, *message_id, MessagePatch::append(text));
            return Ok(RouterEffect::Appended(*message_id));
        }
        // A delta may legitimately arrive without a preceding start; it
        // opens the channel with itself as the seed content.
        let origin = MessageOrigin::new(
            braid_wire::EventKind::MessageChunk,
            Some(channel.clone()),
            None,
        );
        let message_id = self
            .store
            .append_message(self.conversation_id, MessageDraft::assistant_open(text, origin))?;
        self.slots.insert(channel.clone(), message_id);
        Ok(RouterEffect::Created(message_id))
    }

    fn close_channel(&mut self, channel: &ChannelKey) -> RouterEffect {
        match self.slots.remove(channel) {
            Some(message_id) => {
                self.store
                    .mutate_message(self.conversation_id, message_id, MessagePatch::close());
                RouterEffect::Closed(message_id)
            }
            // Duplicate or late end; must stay idempotent.
            None => RouterEffect::Ignored,
        }
    }

    /// Point-in-time annotation: a new, already-closed message that never
    /// touches any open slot.
    fn annotate(
        &mut self,
        channel: &ChannelKey,
        iteration: Option<u64>,
        event: &AgentEvent,
        content: String,
        collapsible: bool,
    ) -> TranscriptResult<RouterEffect> {
        let mut origin = MessageOrigin::new(event.kind(), Some(channel.clone()), iteration);
        if collapsible {
            origin = origin.collapsible();
        }
        let message_id = self.store.append_message(
            self.conversation_id,
            MessageDraft::assistant_closed(content, origin),
        )?;
        Ok(RouterEffect::Created(message_id))
    }
}

fn render_tool_outcome(tool_name: &str, outcome: &ToolOutcome) -> String {
    if outcome.success {
        match &outcome.result {
            Some(result) if !result.is_empty() => {
                format!("Tool `{tool_name}` succeeded:\n{result}")
            }
            _ => format!("Tool `{tool_name}` succeeded"),
        }
    } else {
        match &outcome.error {
            Some(error) if !error.is_empty() => format!("Tool `{tool_name}` failed: {error}"),
            _ => format!("Tool `{tool_name}` failed"),
        }
    }
}

fn render_run_summary(summary: &RunSummary) -> String {
    let mut lines = Vec::new();
    if !summary.assistant_message.is_empty() {
        lines.push(summary.assistant_message.clone());
    }
    if !summary.node_sequence.is_empty() {
        lines.push(format!("Agents: {}", summary.node_sequence.join(" → ")));
    }
    if !summary.used_tools.is_empty() {
        lines.push(format!(
            "Tools: {} ({} call{})",
            summary.used_tools.join(", "),
            summary.tool_usage_count,
            if summary.tool_usage_count == 1 { "" } else { "s" }
        ));
    }
    if lines.is_empty() {
        lines.push("Run complete".to_string());
    }
    lines.join("\n")
}
