use std::sync::Mutex;
use std::time::Instant;

use parley_protocol::{CallId, ChoiceOption, ItemId};
use tokio::sync::oneshot;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemPayload {
    Choices {
        preamble: String,
        options: Vec<ChoiceOption>,
        multi: bool,
    },
    Speech {
        text: String,
        blocking: bool,
        urgent: bool,
    },
}

impl ItemPayload {
    pub fn is_choices(&self) -> bool {
        matches!(self, Self::Choices { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemStatus {
    Queued,
    Active,
    Resolved,
    Cancelled,
}

impl ItemStatus {
    pub fn is_settled(self) -> bool {
        matches!(self, Self::Resolved | Self::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    TransportAborted,
    OperatorDismissed,
    SessionClosed,
}

impl CancelReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TransportAborted => "transport_aborted",
            Self::OperatorDismissed => "operator_dismissed",
            Self::SessionClosed => "session_closed",
        }
    }
}

/// What an item settled with. The rendezvous delivers exactly one of these to
/// every watcher of the item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Selected { label: String, summary: String },
    MultiSelected { labels: Vec<String> },
    Freeform { text: String },
    SpeechDispatched,
    SpeechDone,
    Cancelled(CancelReason),
}

impl ItemOutcome {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }
}

#[derive(Debug)]
struct ItemState {
    status: ItemStatus,
    outcome: Option<ItemOutcome>,
    watchers: Vec<oneshot::Sender<ItemOutcome>>,
}

/// A single inbox entry. Created on the tool-call task, owned by the inbox
/// engine (which advances `status`), observed read-only elsewhere. Settling
/// fires every watcher exactly once.
#[derive(Debug)]
pub struct InboxItem {
    pub id: ItemId,
    pub call_id: Option<CallId>,
    pub payload: ItemPayload,
    pub created_at: Instant,
    state: Mutex<ItemState>,
}

impl InboxItem {
    pub fn new(
        id: ItemId,
        call_id: Option<CallId>,
        payload: ItemPayload,
    ) -> (std::sync::Arc<Self>, oneshot::Receiver<ItemOutcome>) {
        let (sender, receiver) = oneshot::channel();
        let item = std::sync::Arc::new(Self {
            id,
            call_id,
            payload,
            created_at: Instant::now(),
            state: Mutex::new(ItemState {
                status: ItemStatus::Queued,
                outcome: None,
                watchers: vec![sender],
            }),
        });
        (item, receiver)
    }

    pub fn status(&self) -> ItemStatus {
        self.state.lock().expect("inbox item lock poisoned").status
    }

    pub fn outcome(&self) -> Option<ItemOutcome> {
        self.state
            .lock()
            .expect("inbox item lock poisoned")
            .outcome
            .clone()
    }

    pub fn is_settled(&self) -> bool {
        self.status().is_settled()
    }

    /// Attach another waiter (transport retries piggyback on the original
    /// item). An already-settled item delivers its outcome immediately.
    pub fn watch(&self) -> oneshot::Receiver<ItemOutcome> {
        let (sender, receiver) = oneshot::channel();
        let mut state = self.state.lock().expect("inbox item lock poisoned");
        match &state.outcome {
            Some(outcome) => {
                let _ = sender.send(outcome.clone());
            }
            None => state.watchers.push(sender),
        }
        receiver
    }

    /// Promote `queued -> active`. Returns false if the item is not queued.
    pub(crate) fn promote(&self) -> bool {
        let mut state = self.state.lock().expect("inbox item lock poisoned");
        if state.status != ItemStatus::Queued {
            return false;
        }
        state.status = ItemStatus::Active;
        true
    }

    /// Settle the item and fire every watcher. Returns false if the item was
    /// already settled (the rendezvous never fires twice).
    pub(crate) fn settle(&self, outcome: ItemOutcome) -> bool {
        let watchers = {
            let mut state = self.state.lock().expect("inbox item lock poisoned");
            if state.status.is_settled() {
                return false;
            }
            state.status = if outcome.is_cancelled() {
                ItemStatus::Cancelled
            } else {
                ItemStatus::Resolved
            };
            state.outcome = Some(outcome.clone());
            std::mem::take(&mut state.watchers)
        };
        for watcher in watchers {
            let _ = watcher.send(outcome.clone());
        }
        true
    }

    /// Content identity used to piggyback duplicate enqueues.
    pub(crate) fn matches_choices(&self, preamble: &str, options: &[ChoiceOption]) -> bool {
        match &self.payload {
            ItemPayload::Choices {
                preamble: own_preamble,
                options: own_options,
                ..
            } => {
                own_preamble == preamble
                    && own_options.len() == options.len()
                    && own_options
                        .iter()
                        .zip(options)
                        .all(|(a, b)| a.label == b.label)
            }
            ItemPayload::Speech { .. } => false,
        }
    }
}
