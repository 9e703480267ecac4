use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use parley_protocol::{
    BrokerError, BrokerResult, ChoiceOption, ItemId, RegisterSessionArgs, SessionId, VoiceProfile,
};
use serde::{Deserialize, Serialize};

use crate::item::{InboxItem, ItemOutcome, ItemPayload, ItemStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Live,
    Stale,
    Dead,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AgentMetadata {
    pub cwd: String,
    pub hostname: String,
    pub tmux_session: Option<String>,
    pub tmux_pane: Option<String>,
}

/// The active item as the presenter and frontends see it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveItemSnapshot {
    pub item_id: ItemId,
    pub preamble: String,
    pub options: Vec<ChoiceOption>,
    pub multi: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryEntry {
    pub kind: &'static str,
    pub label: String,
    pub summary: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub name: String,
    pub lifecycle: LifecycleState,
    pub registered: bool,
    pub has_active_item: bool,
    pub queued: usize,
    pub pending_messages: usize,
    pub scroll_index: usize,
    pub tool_call_count: u64,
    pub last_tool_name: String,
    pub active: Option<ActiveItemSnapshot>,
    pub history: Vec<HistoryEntry>,
}

#[derive(Debug)]
pub(crate) struct SessionState {
    pub(crate) display_name: String,
    pub(crate) registered: bool,
    pub(crate) agent: AgentMetadata,
    pub(crate) voice: VoiceProfile,
    pub(crate) inbox: VecDeque<Arc<InboxItem>>,
    pub(crate) history: VecDeque<Arc<InboxItem>>,
    pub(crate) history_cap: usize,
    pub(crate) pending_messages: Vec<String>,
    pub(crate) scroll_index: usize,
    pub(crate) last_activity_at: Instant,
    pub(crate) lifecycle: LifecycleState,
    pub(crate) tool_call_count: u64,
    pub(crate) last_tool_name: String,
    pub(crate) next_item_seq: u64,
}

impl SessionState {
    pub(crate) fn active_item(&self) -> Option<Arc<InboxItem>> {
        self.inbox
            .front()
            .filter(|item| item.status() == ItemStatus::Active)
            .cloned()
    }

    pub(crate) fn push_history(&mut self, item: Arc<InboxItem>) {
        self.history.push_front(item);
        self.history.truncate(self.history_cap);
    }

    pub(crate) fn next_item_id(&mut self, session_id: &SessionId) -> ItemId {
        self.next_item_seq += 1;
        ItemId::new(format!("{session_id}/item-{}", self.next_item_seq))
    }
}

/// One connected agent. All mutable state sits behind a single lock; long
/// work (event publication, rendezvous wakeups, TTS dispatch) happens after
/// the guard is dropped.
#[derive(Debug)]
pub struct Session {
    pub id: SessionId,
    pub created_at: Instant,
    state: Mutex<SessionState>,
}

impl Session {
    pub fn new(id: SessionId, display_name: impl Into<String>, history_cap: usize) -> Self {
        Self {
            id,
            created_at: Instant::now(),
            state: Mutex::new(SessionState {
                display_name: display_name.into(),
                registered: false,
                agent: AgentMetadata::default(),
                voice: VoiceProfile::default(),
                inbox: VecDeque::new(),
                history: VecDeque::new(),
                history_cap: history_cap.max(1),
                pending_messages: Vec::new(),
                scroll_index: 0,
                last_activity_at: Instant::now(),
                lifecycle: LifecycleState::Live,
                tool_call_count: 0,
                last_tool_name: String::new(),
                next_item_seq: 0,
            }),
        }
    }

    pub(crate) fn lock_state(&self) -> BrokerResult<MutexGuard<'_, SessionState>> {
        self.state
            .lock()
            .map_err(|_| BrokerError::Internal("session state lock poisoned".to_owned()))
    }

    pub fn touch(&self) -> BrokerResult<()> {
        let mut state = self.lock_state()?;
        state.last_activity_at = Instant::now();
        state.lifecycle = LifecycleState::Live;
        Ok(())
    }

    pub fn record_tool_call(&self, tool_name: &str) -> BrokerResult<()> {
        let mut state = self.lock_state()?;
        state.last_activity_at = Instant::now();
        state.lifecycle = LifecycleState::Live;
        state.tool_call_count += 1;
        state.last_tool_name = tool_name.to_owned();
        Ok(())
    }

    pub fn display_name(&self) -> BrokerResult<String> {
        Ok(self.lock_state()?.display_name.clone())
    }

    pub fn rename(&self, name: impl Into<String>) -> BrokerResult<()> {
        self.lock_state()?.display_name = name.into();
        Ok(())
    }

    pub fn voice_profile(&self) -> BrokerResult<VoiceProfile> {
        Ok(self.lock_state()?.voice.clone())
    }

    /// Apply registration hints. Identity never changes; empty hints leave
    /// existing metadata alone so re-registration is idempotent.
    pub fn register(&self, args: &RegisterSessionArgs) -> BrokerResult<()> {
        let mut state = self.lock_state()?;
        state.registered = true;
        if !args.cwd.is_empty() {
            state.agent.cwd = args.cwd.clone();
        }
        if !args.hostname.is_empty() {
            state.agent.hostname = args.hostname.clone();
        }
        if args.tmux_session.is_some() {
            state.agent.tmux_session = args.tmux_session.clone();
        }
        if args.tmux_pane.is_some() {
            state.agent.tmux_pane = args.tmux_pane.clone();
        }
        if let Some(name) = args.name.as_deref().filter(|name| !name.is_empty()) {
            state.display_name = name.to_owned();
        }
        if args.voice.is_some() {
            state.voice.voice = args.voice.clone();
        }
        if args.style.is_some() {
            state.voice.style = args.style.clone();
        }
        Ok(())
    }

    pub fn queue_message(&self, text: impl Into<String>) -> BrokerResult<()> {
        self.lock_state()?.pending_messages.push(text.into());
        Ok(())
    }

    /// Drain operator notes queued for the agent's next tool response.
    pub fn drain_messages(&self) -> BrokerResult<Vec<String>> {
        Ok(std::mem::take(&mut self.lock_state()?.pending_messages))
    }

    pub fn scroll_index(&self) -> BrokerResult<usize> {
        Ok(self.lock_state()?.scroll_index)
    }

    pub fn active_item(&self) -> BrokerResult<Option<Arc<InboxItem>>> {
        Ok(self.lock_state()?.active_item())
    }

    pub fn has_active_item(&self) -> BrokerResult<bool> {
        Ok(self.active_item()?.is_some())
    }

    pub fn inbox_is_empty(&self) -> BrokerResult<bool> {
        Ok(self.lock_state()?.inbox.is_empty())
    }

    pub fn queued_choice_count(&self) -> BrokerResult<usize> {
        Ok(self
            .lock_state()?
            .inbox
            .iter()
            .filter(|item| item.payload.is_choices() && !item.is_settled())
            .count())
    }

    pub fn idle_for(&self) -> BrokerResult<std::time::Duration> {
        Ok(self.lock_state()?.last_activity_at.elapsed())
    }

    pub fn lifecycle(&self) -> BrokerResult<LifecycleState> {
        Ok(self.lock_state()?.lifecycle)
    }

    pub(crate) fn set_lifecycle(&self, lifecycle: LifecycleState) -> BrokerResult<()> {
        self.lock_state()?.lifecycle = lifecycle;
        Ok(())
    }

    pub fn snapshot(&self) -> BrokerResult<SessionSnapshot> {
        let state = self.lock_state()?;
        let active = state.active_item().and_then(|item| match &item.payload {
            ItemPayload::Choices {
                preamble,
                options,
                multi,
            } => Some(ActiveItemSnapshot {
                item_id: item.id.clone(),
                preamble: preamble.clone(),
                options: options.clone(),
                multi: *multi,
            }),
            ItemPayload::Speech { .. } => None,
        });

        let history = state
            .history
            .iter()
            .map(|item| history_entry(item))
            .collect();

        Ok(SessionSnapshot {
            id: self.id.clone(),
            name: state.display_name.clone(),
            lifecycle: state.lifecycle,
            registered: state.registered,
            has_active_item: state.active_item().is_some(),
            queued: state.inbox.len(),
            pending_messages: state.pending_messages.len(),
            scroll_index: state.scroll_index,
            tool_call_count: state.tool_call_count,
            last_tool_name: state.last_tool_name.clone(),
            active,
            history,
        })
    }
}

fn history_entry(item: &InboxItem) -> HistoryEntry {
    match &item.payload {
        ItemPayload::Choices { preamble, .. } => {
            let (label, summary) = match item.outcome() {
                Some(ItemOutcome::Selected { label, summary }) => (label, summary),
                Some(ItemOutcome::MultiSelected { labels }) => {
                    (labels.join(", "), String::new())
                }
                Some(ItemOutcome::Freeform { text }) => (text, "(freeform input)".to_owned()),
                Some(ItemOutcome::Cancelled(reason)) => {
                    ("(cancelled)".to_owned(), reason.as_str().to_owned())
                }
                _ => (String::new(), preamble.clone()),
            };
            HistoryEntry {
                kind: "choices",
                label,
                summary,
            }
        }
        ItemPayload::Speech { text, .. } => HistoryEntry {
            kind: "speech",
            label: text.clone(),
            summary: String::new(),
        },
    }
}
