use serde::Deserialize;
use serde_json::Value;

/// Channel name used when the backend omits `node_name`.
///
/// The producer always speaks as *somebody*; when it does not say who, it is
/// the supervisor loop narrating, so unnamed events all share one slot.
pub const DEFAULT_CHANNEL_NAME: &str = "supervisor";

/// Logical speaker multiplexed onto the physical event stream.
///
/// A channel is an agent node or tool lane identified by name. Events that
/// arrive without a name collapse onto the default singleton channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelKey(String);

impl ChannelKey {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Resolves the wire-level `node_name` field, mapping null/blank names
    /// onto the default channel.
    pub fn from_wire(node_name: Option<&str>) -> Self {
        match node_name {
            Some(name) if !name.trim().is_empty() => Self(name.trim().to_string()),
            _ => Self::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl Default for ChannelKey {
    fn default() -> Self {
        Self(DEFAULT_CHANNEL_NAME.to_string())
    }
}

impl std::fmt::Display for ChannelKey {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "{}", self.0)
    }
}

/// Discriminant for one decoded event, kept alongside transcript messages so
/// renderers can tell where a message came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    NodeStart,
    MessageChunk,
    ToolStart,
    ToolResult,
    NodeEnd,
    ReasonEnd,
    Final,
    Error,
}

/// Tool invocation outcome carried by a `tool_result` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutcome {
    pub success: bool,
    pub result: Option<String>,
    pub error: Option<String>,
}

/// Run metadata carried by the terminal `final` event.
///
/// `final` narrates the whole run after the fact; it never closes in-flight
/// channels.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RunSummary {
    pub conversation_id: Option<String>,
    pub assistant_message: String,
    pub node_sequence: Vec<String>,
    pub used_tools: Vec<String>,
    pub tool_usage_count: u64,
}

/// One decoded wire event, resolved into a typed variant at decode time.
///
/// The payload is a loosely-typed JSON envelope on the wire; field probing
/// happens exactly once, here, so downstream routing can match on structure.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    NodeStart {
        channel: ChannelKey,
        iteration: Option<u64>,
        node_sequence: Vec<String>,
        emitted_at: Option<f64>,
    },
    MessageChunk {
        channel: ChannelKey,
        text: String,
    },
    ToolStart {
        channel: ChannelKey,
        iteration: Option<u64>,
        tool_name: String,
        args: Option<Value>,
    },
    ToolResult {
        channel: ChannelKey,
        iteration: Option<u64>,
        tool_name: String,
        outcome: ToolOutcome,
    },
    NodeEnd {
        channel: ChannelKey,
        iteration: Option<u64>,
    },
    ReasonEnd {
        channel: ChannelKey,
        is_final: bool,
    },
    Final {
        channel: ChannelKey,
        iteration: Option<u64>,
        summary: RunSummary,
    },
    Error {
        channel: Option<ChannelKey>,
        detail: String,
    },
}

impl AgentEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::NodeStart { .. } => EventKind::NodeStart,
            Self::MessageChunk { .. } => EventKind::MessageChunk,
            Self::ToolStart { .. } => EventKind::ToolStart,
            Self::ToolResult { .. } => EventKind::ToolResult,
            Self::NodeEnd { .. } => EventKind::NodeEnd,
            Self::ReasonEnd { .. } => EventKind::ReasonEnd,
            Self::Final { .. } => EventKind::Final,
            Self::Error { .. } => EventKind::Error,
        }
    }

    /// Returns the channel this event belongs to, if it names one.
    pub fn channel(&self) -> Option<&ChannelKey> {
        match self {
            Self::NodeStart { channel, .. }
            | Self::MessageChunk { channel, .. }
            | Self::ToolStart { channel, .. }
            | Self::ToolResult { channel, .. }
            | Self::NodeEnd { channel, .. }
            | Self::ReasonEnd { channel, .. }
            | Self::Final { channel, .. } => Some(channel),
            Self::Error { channel, .. } => channel.as_ref(),
        }
    }

    /// Parses one frame payload into a typed event.
    ///
    /// Returns `Err` only when the payload is not valid JSON for the envelope
    /// shape; unknown `event_type` values degrade into an `Error` event so a
    /// newer backend never aborts an older client's stream.
    pub fn from_payload(payload: &str) -> Result<Self, serde_json::Error> {
        let frame: RawFrame = serde_json::from_str(payload)?;
        Ok(Self::from_frame(frame))
    }

    fn from_frame(frame: RawFrame) -> Self {
        let channel = ChannelKey::from_wire(frame.node_name.as_deref());

        match frame.event_type.as_str() {
            "node_start" => Self::NodeStart {
                channel,
                iteration: frame.iteration,
                node_sequence: frame.node_sequence(),
                emitted_at: frame.timestamp,
            },
            "message_chunk" => Self::MessageChunk {
                channel,
                text: frame.text_delta().unwrap_or_default(),
            },
            "tool_start" => Self::ToolStart {
                channel,
                iteration: frame.iteration,
                tool_name: frame.tool_name().unwrap_or_default(),
                args: frame.data_field("args"),
            },
            "tool_result" => Self::ToolResult {
                channel,
                iteration: frame.iteration,
                tool_name: frame.tool_name().unwrap_or_default(),
                outcome: ToolOutcome {
                    success: frame.data_bool("success").unwrap_or(false),
                    result: frame.data_text("result"),
                    error: frame.data_text("error"),
                },
            },
            "node_end" => Self::NodeEnd {
                channel,
                iteration: frame.iteration,
            },
            // The producer emits this one discriminant in upper case.
            "REASON_END" => Self::ReasonEnd {
                channel,
                is_final: frame
                    .is_final
                    .or_else(|| frame.data_bool("is_final"))
                    .unwrap_or(false),
            },
            "final" => Self::Final {
                channel,
                iteration: frame.iteration,
                summary: frame.run_summary(),
            },
            "error" => Self::Error {
                channel: frame.node_name.as_deref().map(|name| ChannelKey::from_wire(Some(name))),
                detail: frame
                    .data_text("error")
                    .or(frame.content)
                    .unwrap_or_else(|| "unspecified stream error".to_string()),
            },
            other => Self::Error {
                channel: None,
                detail: format!("unknown event type '{other}'"),
            },
        }
    }
}

/// Wire envelope shape shared by every frame, before variant resolution.
#[derive(Debug, Deserialize)]
struct RawFrame {
    event_type: String,
    #[serde(default)]
    node_name: Option<String>,
    #[serde(default)]
    iteration: Option<u64>,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    timestamp: Option<f64>,
    #[serde(default)]
    is_final: Option<bool>,
}

impl RawFrame {
    fn data_field(&self, key: &str) -> Option<Value> {
        self.data.as_ref()?.get(key).cloned().filter(|value| !value.is_null())
    }

    fn data_text(&self, key: &str) -> Option<String> {
        self.data_field(key).map(|value| value_to_text(&value))
    }

    fn data_bool(&self, key: &str) -> Option<bool> {
        self.data_field(key)?.as_bool()
    }

    fn data_string_list(&self, key: &str) -> Vec<String> {
        self.data_field(key)
            .and_then(|value| value.as_array().cloned())
            .map(|items| items.iter().map(value_to_text).collect())
            .unwrap_or_default()
    }

    /// Token delta with the documented fallback chain:
    /// `data.text`, then top-level `content`, then `data.content`.
    fn text_delta(&self) -> Option<String> {
        self.data_text("text")
            .or_else(|| self.content.clone())
            .or_else(|| self.data_text("content"))
    }

    fn tool_name(&self) -> Option<String> {
        self.data_text("tool_name")
    }

    /// Visited-node list; older producers call this `agent_path`.
    fn node_sequence(&self) -> Vec<String> {
        let sequence = self.data_string_list("node_sequence");
        if sequence.is_empty() {
            self.data_string_list("agent_path")
        } else {
            sequence
        }
    }

    fn run_summary(&self) -> RunSummary {
        RunSummary {
            conversation_id: self.data_text("conversation_id"),
            assistant_message: self.data_text("assistant_message").unwrap_or_default(),
            node_sequence: self.node_sequence(),
            used_tools: self.data_string_list("used_tools"),
            tool_usage_count: self
                .data_field("tool_usage_count")
                .and_then(|value| value.as_u64())
                .unwrap_or(0),
        }
    }
}

fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_start_resolves_channel_and_sequence() {
        let event = AgentEvent::from_payload(
            r#"{"event_type":"node_start","node_name":"notion_agent","iteration":2,"data":{"agent_path":["supervisor","notion_agent"]},"timestamp":1712.5}"#,
        )
        .unwrap();

        assert_eq!(
            event,
            AgentEvent::NodeStart {
                channel: ChannelKey::new("notion_agent"),
                iteration: Some(2),
                node_sequence: vec!["supervisor".to_string(), "notion_agent".to_string()],
                emitted_at: Some(1712.5),
            }
        );
    }

    #[test]
    fn message_chunk_prefers_data_text_over_content() {
        let event = AgentEvent::from_payload(
            r#"{"event_type":"message_chunk","node_name":"reason","data":{"text":"from-data"},"content":"from-content"}"#,
        )
        .unwrap();

        assert_eq!(
            event,
            AgentEvent::MessageChunk {
                channel: ChannelKey::new("reason"),
                text: "from-data".to_string(),
            }
        );
    }

    #[test]
    fn message_chunk_falls_back_to_content_then_data_content() {
        let from_content = AgentEvent::from_payload(
            r#"{"event_type":"message_chunk","node_name":"reason","content":"hello"}"#,
        )
        .unwrap();
        let from_data_content = AgentEvent::from_payload(
            r#"{"event_type":"message_chunk","node_name":"reason","data":{"content":"nested"}}"#,
        )
        .unwrap();

        assert!(matches!(
            from_content,
            AgentEvent::MessageChunk { text, .. } if text == "hello"
        ));
        assert!(matches!(
            from_data_content,
            AgentEvent::MessageChunk { text, .. } if text == "nested"
        ));
    }

    #[test]
    fn null_node_name_routes_to_default_channel() {
        let event = AgentEvent::from_payload(
            r#"{"event_type":"message_chunk","node_name":null,"data":{"text":"hi"}}"#,
        )
        .unwrap();

        assert_eq!(
            event.channel().map(ChannelKey::name),
            Some(DEFAULT_CHANNEL_NAME)
        );
    }

    #[test]
    fn tool_result_keeps_outcome_fields() {
        let event = AgentEvent::from_payload(
            r#"{"event_type":"tool_result","node_name":"act","iteration":1,"data":{"tool_name":"search","success":false,"error":"rate limited"}}"#,
        )
        .unwrap();

        assert_eq!(
            event,
            AgentEvent::ToolResult {
                channel: ChannelKey::new("act"),
                iteration: Some(1),
                tool_name: "search".to_string(),
                outcome: ToolOutcome {
                    success: false,
                    result: None,
                    error: Some("rate limited".to_string()),
                },
            }
        );
    }

    #[test]
    fn reason_end_reads_upper_case_discriminant_and_top_level_flag() {
        let event = AgentEvent::from_payload(
            r#"{"event_type":"REASON_END","node_name":"reason","is_final":true}"#,
        )
        .unwrap();

        assert_eq!(
            event,
            AgentEvent::ReasonEnd {
                channel: ChannelKey::new("reason"),
                is_final: true,
            }
        );
    }

    #[test]
    fn final_event_collects_run_summary() {
        let event = AgentEvent::from_payload(
            r#"{"event_type":"final","node_name":"finalize","iteration":3,"data":{"conversation_id":"abc","assistant_message":"done","node_sequence":["reason","act"],"used_tools":["search"],"tool_usage_count":1,"tool_details":[]}}"#,
        )
        .unwrap();

        let AgentEvent::Final { summary, .. } = event else {
            panic!("expected final event");
        };
        assert_eq!(summary.assistant_message, "done");
        assert_eq!(summary.node_sequence, vec!["reason", "act"]);
        assert_eq!(summary.used_tools, vec!["search"]);
        assert_eq!(summary.tool_usage_count, 1);
    }

    #[test]
    fn unknown_event_type_degrades_to_error_event() {
        let event =
            AgentEvent::from_payload(r#"{"event_type":"telemetry","data":{}}"#).unwrap();

        assert!(matches!(
            event,
            AgentEvent::Error { channel: None, detail } if detail.contains("telemetry")
        ));
    }

    #[test]
    fn invalid_envelope_is_a_parse_error_not_a_panic() {
        assert!(AgentEvent::from_payload("{not json").is_err());
        assert!(AgentEvent::from_payload(r#"{"no_event_type":true}"#).is_err());
    }
}
