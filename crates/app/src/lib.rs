//! Terminal front end for the multi-agent chat backend: settings, the
//! chat session wiring, and the turn loop used by the binary.

pub mod session;
pub mod settings;

pub use session::{ChatSession, ChatTurn, SessionError, TurnStep};
pub use settings::{BackendSettings, SettingsStore};
