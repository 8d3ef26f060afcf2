//! HTTP client surface for the multi-agent chat backend: stream opening
//! with per-conversation exclusivity, persisted-history fetches, and the
//! session list.

pub mod error;
pub mod history;
pub mod sessions;
pub mod stream;

pub use error::{ClientError, ClientResult};
pub use history::HistoryClient;
pub use sessions::{SessionClient, SessionPage, SessionSummary};
pub use stream::{EventStream, StreamClient, StreamHandle, StreamItem, StreamRequest, StreamWorker};
