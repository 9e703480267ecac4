use serde::{Deserialize, Serialize};

use crate::ids::SessionId;

/// One entry in a choice presentation. `silent` options are shown but skipped
/// during the spoken intro readout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChoiceOption {
    pub label: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub silent: bool,
}

impl ChoiceOption {
    pub fn new(label: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            summary: summary.into(),
            silent: false,
        }
    }
}

/// Per-session TTS overrides. Empty fields fall back to the configured
/// defaults; every populated field participates in the artifact cache key.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VoiceProfile {
    #[serde(default)]
    pub voice: Option<String>,
    #[serde(default)]
    pub style: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RegisterSessionArgs {
    #[serde(default)]
    pub cwd: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub tmux_session: Option<String>,
    #[serde(default)]
    pub tmux_pane: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub voice: Option<String>,
    #[serde(default)]
    pub style: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterSessionResult {
    pub session_id: SessionId,
    pub name: String,
}

pub type PendingMessages = Vec<String>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChoiceResult {
    pub selected: String,
    pub summary: String,
    pub pending_messages: PendingMessages,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiSelectResult {
    pub selected: Vec<String>,
    pub pending_messages: PendingMessages,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpeakResult {
    pub ok: bool,
    pub pending_messages: PendingMessages,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckInboxResult {
    pub pending_messages: PendingMessages,
}

/// Key presses frontends push upstream; delivered to the presenter as if
/// typed at the terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperatorKey {
    J,
    K,
    Enter,
    Space,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettingsSnapshot {
    pub voice: String,
    pub style: String,
    pub speed: f32,
    pub model: String,
}
