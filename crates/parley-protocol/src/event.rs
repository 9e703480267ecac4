use serde::{Deserialize, Serialize};

use crate::tool::ChoiceOption;

/// Lifecycle events fanned out to frontend subscribers.
///
/// The serialized form is the SSE `data:` payload; `kind()` is the SSE
/// `event:` field name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BrokerEvent {
    ChoicesPresented {
        preamble: String,
        options: Vec<ChoiceOption>,
        multi: bool,
    },
    SpeechRequested {
        text: String,
        blocking: bool,
        urgent: bool,
    },
    SelectionMade {
        label: String,
        summary: String,
    },
    RecordingState {
        active: bool,
    },
    SessionCreated {
        name: String,
    },
    SessionRemoved {
        reason: String,
    },
    SpeechFailed {
        reason: String,
    },
    PulseDown,
    PulseRecovered,
    Lag {
        skipped: u64,
    },
    Heartbeat,
}

impl BrokerEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ChoicesPresented { .. } => "choices_presented",
            Self::SpeechRequested { .. } => "speech_requested",
            Self::SelectionMade { .. } => "selection_made",
            Self::RecordingState { .. } => "recording_state",
            Self::SessionCreated { .. } => "session_created",
            Self::SessionRemoved { .. } => "session_removed",
            Self::SpeechFailed { .. } => "speech_failed",
            Self::PulseDown => "pulse_down",
            Self::PulseRecovered => "pulse_recovered",
            Self::Lag { .. } => "lag",
            Self::Heartbeat => "heartbeat",
        }
    }
}
