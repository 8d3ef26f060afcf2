//! Wire protocol for the multi-agent event stream: the blank-line-framed
//! frame decoder and the typed events it yields.

pub mod decoder;
pub mod event;

pub use decoder::{DecoderStep, FrameDecoder, StreamClose};
pub use event::{AgentEvent, ChannelKey, EventKind, RunSummary, ToolOutcome};
