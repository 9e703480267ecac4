use serde::{Deserialize, Serialize};

use parley_protocol::{BrokerEvent, SessionId};

/// One published event. `sequence` is monotonic across the whole bus so
/// subscribers can detect gaps; `session_id` is absent for broker-wide events
/// (audio health, heartbeats).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub session_id: Option<SessionId>,
    pub sequence: u64,
    pub received_at_monotonic_nanos: u64,
    #[serde(flatten)]
    pub event: BrokerEvent,
}
