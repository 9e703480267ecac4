//! Session registry and inbox engine: per-session FIFO of agent requests with
//! at-most-one-active semantics and one-shot rendezvous back to blocked
//! tool-call tasks.

pub mod engine;
pub mod item;
pub mod registry;
pub mod session;
pub mod speech;

pub use engine::InboxEngine;
pub use item::{CancelReason, InboxItem, ItemOutcome, ItemPayload, ItemStatus};
pub use registry::{RegistryConfig, SessionRegistry};
pub use session::{
    ActiveItemSnapshot, AgentMetadata, HistoryEntry, LifecycleState, Session, SessionSnapshot,
};
pub use speech::{SpeechOutcome, SpeechRequest, SpeechSink};
