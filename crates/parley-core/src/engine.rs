use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use parley_eventbus::BrokerEventBus;
use parley_protocol::{
    BrokerError, BrokerEvent, BrokerResult, CallId, ChoiceOption, ItemId, SessionId,
};
use tokio::sync::{oneshot, watch};
use tracing::{debug, warn};

use crate::item::{CancelReason, InboxItem, ItemOutcome, ItemPayload};
use crate::registry::SessionRegistry;
use crate::session::{LifecycleState, Session, SessionState};
use crate::speech::{SpeechRequest, SpeechSink};

/// Work to perform after the session lock is dropped. Event publication and
/// TTS dispatch never run under a lock.
enum Activation {
    Choices {
        preamble: String,
        options: Vec<ChoiceOption>,
        multi: bool,
    },
    Speech {
        item: Arc<InboxItem>,
    },
}

/// Turns concurrent tool calls into a deterministic per-session serial order.
///
/// Items are activated by the engine inside enqueue/resolve transitions;
/// tool-call tasks only await their rendezvous. The UI and frontends observe
/// state through snapshots plus the event bus, with a refresh watermark for
/// cheap redraw scheduling.
pub struct InboxEngine {
    registry: Arc<SessionRegistry>,
    bus: Arc<BrokerEventBus>,
    speech: Arc<dyn SpeechSink>,
    calls: Mutex<HashMap<CallId, (SessionId, ItemId)>>,
    refresh: watch::Sender<u64>,
}

impl InboxEngine {
    pub fn new(
        registry: Arc<SessionRegistry>,
        bus: Arc<BrokerEventBus>,
        speech: Arc<dyn SpeechSink>,
    ) -> Arc<Self> {
        let (refresh, _) = watch::channel(0);
        Arc::new(Self {
            registry,
            bus,
            speech,
            calls: Mutex::new(HashMap::new()),
            refresh,
        })
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn bus(&self) -> &Arc<BrokerEventBus> {
        &self.bus
    }

    /// Watermark bumped on every observable state change; the presenter and
    /// frontends redraw when it moves.
    pub fn subscribe_refresh(&self) -> watch::Receiver<u64> {
        self.refresh.subscribe()
    }

    fn bump_refresh(&self) {
        self.refresh.send_modify(|generation| *generation += 1);
    }

    /// Idempotent session lookup; publishes `session_created` on first
    /// contact.
    pub fn get_or_create_session(&self, id: &SessionId) -> BrokerResult<Arc<Session>> {
        let (session, created) = self.registry.get_or_create(id)?;
        if created {
            let name = session.display_name()?;
            debug!(session = %id, %name, "session created");
            self.bus
                .publish(Some(id.clone()), BrokerEvent::SessionCreated { name });
            self.bump_refresh();
        }
        Ok(session)
    }

    /// Enqueue a choices item. Returns the rendezvous the caller blocks on.
    ///
    /// A pending item with identical preamble and option labels absorbs the
    /// enqueue instead (transport retries must not clobber a presented
    /// prompt).
    pub fn enqueue_choices(
        self: &Arc<Self>,
        session_id: &SessionId,
        preamble: String,
        options: Vec<ChoiceOption>,
        multi: bool,
        call_id: Option<CallId>,
    ) -> BrokerResult<oneshot::Receiver<ItemOutcome>> {
        if options.is_empty() {
            return Err(BrokerError::InvalidRequest(
                "present_choices requires at least one option".to_owned(),
            ));
        }

        let session = self.registry.get(session_id)?;
        session.touch()?;

        let (receiver, item_id, activation) = {
            let mut state = session.lock_state()?;

            let duplicate = state
                .inbox
                .iter()
                .find(|item| !item.is_settled() && item.matches_choices(&preamble, &options))
                .cloned();
            if let Some(existing) = duplicate {
                debug!(session = %session_id, item = %existing.id, "piggybacking duplicate choices enqueue");
                let receiver = existing.watch();
                drop(state);
                self.register_call(call_id, session_id, &existing.id);
                return Ok(receiver);
            }

            let item_id = state.next_item_id(session_id);
            let (item, receiver) = InboxItem::new(
                item_id.clone(),
                call_id.clone(),
                ItemPayload::Choices {
                    preamble,
                    options,
                    multi,
                },
            );
            state.inbox.push_back(Arc::clone(&item));
            let activation = if state.active_item().is_none() {
                Self::activate_head_locked(&mut state)
            } else {
                None
            };
            (receiver, item_id, activation)
        };

        self.register_call(call_id, session_id, &item_id);
        self.handle_activation(&session, activation);
        self.bump_refresh();
        Ok(receiver)
    }

    /// Enqueue speech. Non-urgent speech shares the session FIFO with
    /// choices; urgent speech bypasses the queue, preempts current audio and
    /// resolves as soon as playback starts.
    pub fn enqueue_speech(
        self: &Arc<Self>,
        session_id: &SessionId,
        text: String,
        blocking: bool,
        urgent: bool,
        call_id: Option<CallId>,
    ) -> BrokerResult<oneshot::Receiver<ItemOutcome>> {
        let session = self.registry.get(session_id)?;
        session.touch()?;

        self.bus.publish(
            Some(session_id.clone()),
            BrokerEvent::SpeechRequested {
                text: text.clone(),
                blocking,
                urgent,
            },
        );

        if urgent {
            let item_id = {
                let mut state = session.lock_state()?;
                state.next_item_id(session_id)
            };
            let (item, receiver) = InboxItem::new(
                item_id,
                call_id,
                ItemPayload::Speech {
                    text,
                    blocking,
                    urgent,
                },
            );
            self.dispatch_urgent(Arc::clone(&session), item);
            self.bump_refresh();
            return Ok(receiver);
        }

        let (receiver, item_id, activation) = {
            let mut state = session.lock_state()?;
            let item_id = state.next_item_id(session_id);
            let (item, receiver) = InboxItem::new(
                item_id.clone(),
                call_id.clone(),
                ItemPayload::Speech {
                    text,
                    blocking,
                    urgent,
                },
            );
            state.inbox.push_back(Arc::clone(&item));
            let activation = if state.active_item().is_none() {
                Self::activate_head_locked(&mut state)
            } else {
                None
            };
            (receiver, item_id, activation)
        };

        self.register_call(call_id, session_id, &item_id);
        self.handle_activation(&session, activation);
        self.bump_refresh();
        Ok(receiver)
    }

    /// Resolve the focused session's active choices item from the UI or a
    /// frontend. A resolution that arrives after the item settled elsewhere
    /// is discarded silently (returns false).
    pub fn resolve_active(
        self: &Arc<Self>,
        session_id: &SessionId,
        outcome: ItemOutcome,
    ) -> BrokerResult<bool> {
        let session = self.registry.get(session_id)?;

        let (event, activation) = {
            let mut state = session.lock_state()?;
            let Some(item) = state.active_item() else {
                debug!(session = %session_id, "resolution for inactive session discarded");
                return Ok(false);
            };
            if !item.payload.is_choices() {
                return Ok(false);
            }
            if !item.settle(outcome.clone()) {
                return Ok(false);
            }
            state.inbox.pop_front();
            state.push_history(item);
            let activation = Self::activate_head_locked(&mut state);
            (selection_event(&outcome), activation)
        };

        if let Some(event) = event {
            self.bus.publish(Some(session_id.clone()), event);
        }
        self.handle_activation(&session, activation);
        self.bump_refresh();
        Ok(true)
    }

    /// Operator dismissal of the active item.
    pub fn dismiss_active(self: &Arc<Self>, session_id: &SessionId) -> BrokerResult<bool> {
        let session = self.registry.get(session_id)?;
        let Some(item) = session.active_item()? else {
            return Ok(false);
        };
        self.cancel_item(session_id, &item.id, CancelReason::OperatorDismissed)
    }

    /// Transport-level cancellation of a registered tool call.
    pub fn cancel_call(self: &Arc<Self>, call_id: &CallId) -> BrokerResult<bool> {
        let Some((session_id, item_id)) = self.take_call(call_id) else {
            return Ok(false);
        };
        self.cancel_item(&session_id, &item_id, CancelReason::TransportAborted)
    }

    /// Cancel an item wherever it sits in the queue. A cancel delivered
    /// before activation prevents the item from ever activating.
    pub fn cancel_item(
        self: &Arc<Self>,
        session_id: &SessionId,
        item_id: &ItemId,
        reason: CancelReason,
    ) -> BrokerResult<bool> {
        let Some(session) = self.registry.try_get(session_id) else {
            return Ok(false);
        };

        let activation = {
            let mut state = session.lock_state()?;
            let Some(position) = state.inbox.iter().position(|item| &item.id == item_id) else {
                return Ok(false);
            };
            let item = Arc::clone(&state.inbox[position]);
            if !item.settle(ItemOutcome::Cancelled(reason)) {
                return Ok(false);
            }
            state.inbox.remove(position);
            state.push_history(item);
            if position == 0 {
                Self::activate_head_locked(&mut state)
            } else {
                None
            }
        };

        debug!(session = %session_id, item = %item_id, reason = reason.as_str(), "inbox item cancelled");
        self.handle_activation(&session, activation);
        self.bump_refresh();
        Ok(true)
    }

    /// Remove a session; every queued or active item is cancelled with
    /// `session_closed` so blocked callers return.
    pub fn remove_session(self: &Arc<Self>, session_id: &SessionId, reason: &str) -> BrokerResult<bool> {
        let Some(session) = self.registry.remove(session_id)? else {
            return Ok(false);
        };

        {
            let mut state = session.lock_state()?;
            let items: Vec<Arc<InboxItem>> = state.inbox.drain(..).collect();
            for item in items {
                item.settle(ItemOutcome::Cancelled(CancelReason::SessionClosed));
                state.push_history(item);
            }
            state.lifecycle = LifecycleState::Dead;
        }
        self.forget_session_calls(session_id);

        self.bus.publish(
            Some(session_id.clone()),
            BrokerEvent::SessionRemoved {
                reason: reason.to_owned(),
            },
        );
        self.bump_refresh();
        Ok(true)
    }

    /// Periodic maintenance: mark idle sessions stale and prune the empty
    /// ones. Sessions holding items are never pruned (the operator may still
    /// be looking).
    pub fn prune_stale(self: &Arc<Self>, max_idle: Duration) -> Vec<SessionId> {
        let mut removed = Vec::new();
        for session_id in self.registry.stale_candidates(max_idle) {
            match self.remove_session(&session_id, "stale") {
                Ok(true) => removed.push(session_id),
                Ok(false) => {}
                Err(error) => warn!(session = %session_id, %error, "stale prune failed"),
            }
        }
        for session in self.registry.sessions() {
            let is_idle = session
                .idle_for()
                .map(|idle| idle > max_idle)
                .unwrap_or(false);
            if is_idle && session.lifecycle().ok() == Some(LifecycleState::Live) {
                let _ = session.set_lifecycle(LifecycleState::Stale);
            }
        }
        if !removed.is_empty() {
            self.bump_refresh();
        }
        removed
    }

    /// Move the operator highlight and read the newly highlighted option
    /// aloud. Stale readouts (the operator scrolled on) skip silently.
    pub fn highlight(self: &Arc<Self>, session_id: &SessionId, index: usize) -> BrokerResult<()> {
        let session = self.registry.get(session_id)?;
        let text = {
            let mut state = session.lock_state()?;
            let Some(item) = state.active_item() else {
                return Ok(());
            };
            let ItemPayload::Choices { options, .. } = &item.payload else {
                return Ok(());
            };
            let clamped = index.min(options.len().saturating_sub(1));
            state.scroll_index = clamped;
            let option = &options[clamped];
            if option.summary.is_empty() {
                format!("{}. {}", clamped + 1, option.label)
            } else {
                format!("{}. {}. {}", clamped + 1, option.label, option.summary)
            }
        };

        let voice = session.voice_profile()?;
        let token = self.speech.begin_readout();
        let speech = Arc::clone(&self.speech);
        tokio::spawn(async move {
            speech.readout(text, voice, token).await;
        });
        self.bump_refresh();
        Ok(())
    }

    pub fn queue_message(&self, session_id: &SessionId, text: impl Into<String>) -> BrokerResult<()> {
        let session = self.registry.get(session_id)?;
        session.queue_message(text)?;
        self.bump_refresh();
        Ok(())
    }

    fn register_call(&self, call_id: Option<CallId>, session_id: &SessionId, item_id: &ItemId) {
        if let Some(call_id) = call_id {
            if let Ok(mut calls) = self.calls.lock() {
                calls.insert(call_id, (session_id.clone(), item_id.clone()));
            }
        }
    }

    fn take_call(&self, call_id: &CallId) -> Option<(SessionId, ItemId)> {
        self.calls.lock().ok()?.remove(call_id)
    }

    fn forget_session_calls(&self, session_id: &SessionId) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.retain(|_, (owner, _)| owner != session_id);
        }
    }

    /// Promote the first unsettled item to active. Settled stragglers at the
    /// front are folded into history first.
    fn activate_head_locked(state: &mut SessionState) -> Option<Activation> {
        while let Some(front) = state.inbox.front().cloned() {
            if front.is_settled() {
                state.inbox.pop_front();
                state.push_history(front);
                continue;
            }
            if !front.promote() {
                return None;
            }
            state.scroll_index = 0;
            return Some(match &front.payload {
                ItemPayload::Choices {
                    preamble,
                    options,
                    multi,
                } => Activation::Choices {
                    preamble: preamble.clone(),
                    options: options.clone(),
                    multi: *multi,
                },
                ItemPayload::Speech { .. } => Activation::Speech { item: front },
            });
        }
        None
    }

    fn handle_activation(self: &Arc<Self>, session: &Arc<Session>, activation: Option<Activation>) {
        match activation {
            None => {}
            Some(Activation::Choices {
                preamble,
                options,
                multi,
            }) => {
                self.bus.publish(
                    Some(session.id.clone()),
                    BrokerEvent::ChoicesPresented {
                        preamble: preamble.clone(),
                        options: options.clone(),
                        multi,
                    },
                );
                self.pregenerate_choices(session, &preamble, &options);
            }
            Some(Activation::Speech { item }) => {
                self.dispatch_speech(Arc::clone(session), item);
            }
        }
    }

    /// Warm the cache with the intro line and per-option readout clips so
    /// scrolling is instant.
    fn pregenerate_choices(
        self: &Arc<Self>,
        session: &Arc<Session>,
        preamble: &str,
        options: &[ChoiceOption],
    ) {
        let mut texts = Vec::with_capacity(options.len() + 1);
        let spoken_labels: Vec<String> = options
            .iter()
            .enumerate()
            .filter(|(_, option)| !option.silent)
            .map(|(index, option)| format!("{}. {}", index + 1, option.label))
            .collect();
        texts.push(format!(
            "{preamble} Your options are: {}",
            spoken_labels.join(" ")
        ));
        for (index, option) in options.iter().enumerate() {
            if option.summary.is_empty() {
                texts.push(format!("{}. {}", index + 1, option.label));
            } else {
                texts.push(format!("{}. {}. {}", index + 1, option.label, option.summary));
            }
        }

        let voice = session.voice_profile().unwrap_or_default();
        let speech = Arc::clone(&self.speech);
        tokio::spawn(async move {
            speech.pregenerate(texts, voice).await;
        });
    }

    /// Drive an activated speech item through the audio channel, then advance
    /// the queue. Async speech settles when playback is dispatched, blocking
    /// speech when playback completes.
    fn dispatch_speech(self: &Arc<Self>, session: Arc<Session>, item: Arc<InboxItem>) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let ItemPayload::Speech { text, blocking, .. } = &item.payload else {
                return;
            };
            let voice = session.voice_profile().unwrap_or_default();
            let request = SpeechRequest {
                session_id: session.id.clone(),
                text: text.clone(),
                voice,
                blocking: *blocking,
                urgent: false,
            };
            if let Err(error) = engine.speech.speak(request).await {
                warn!(session = %session.id, %error, "speech dispatch failed");
            }
            let outcome = if *blocking {
                ItemOutcome::SpeechDone
            } else {
                ItemOutcome::SpeechDispatched
            };
            item.settle(outcome);
            engine.advance_after(&session, &item);
        });
    }

    /// Urgent speech: no queueing, immediate preemption, settles at playback
    /// start, recorded straight into history.
    fn dispatch_urgent(self: &Arc<Self>, session: Arc<Session>, item: Arc<InboxItem>) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let ItemPayload::Speech { text, .. } = &item.payload else {
                return;
            };
            let voice = session.voice_profile().unwrap_or_default();
            let request = SpeechRequest {
                session_id: session.id.clone(),
                text: text.clone(),
                voice,
                blocking: false,
                urgent: true,
            };
            if let Err(error) = engine.speech.speak(request).await {
                warn!(session = %session.id, %error, "urgent speech failed");
            }
            item.settle(ItemOutcome::SpeechDone);
            if let Ok(mut state) = session.lock_state() {
                state.push_history(Arc::clone(&item));
            }
            engine.bump_refresh();
        });
    }

    fn advance_after(self: &Arc<Self>, session: &Arc<Session>, item: &Arc<InboxItem>) {
        let activation = match session.lock_state() {
            Ok(mut state) => {
                let is_front = state
                    .inbox
                    .front()
                    .map(|front| front.id == item.id)
                    .unwrap_or(false);
                if is_front {
                    let front = state.inbox.pop_front();
                    if let Some(front) = front {
                        state.push_history(front);
                    }
                    Self::activate_head_locked(&mut state)
                } else {
                    None
                }
            }
            Err(error) => {
                warn!(session = %session.id, %error, "advance failed");
                None
            }
        };
        self.handle_activation(session, activation);
        self.bump_refresh();
    }
}

fn selection_event(outcome: &ItemOutcome) -> Option<BrokerEvent> {
    match outcome {
        ItemOutcome::Selected { label, summary } => Some(BrokerEvent::SelectionMade {
            label: label.clone(),
            summary: summary.clone(),
        }),
        ItemOutcome::MultiSelected { labels } => Some(BrokerEvent::SelectionMade {
            label: labels.join(", "),
            summary: String::new(),
        }),
        ItemOutcome::Freeform { text } => Some(BrokerEvent::SelectionMade {
            label: text.clone(),
            summary: "(freeform input)".to_owned(),
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use parley_eventbus::BrokerEventBus;
    use parley_protocol::{
        BrokerError, BrokerResult, CallId, ChoiceOption, SessionId, VoiceProfile,
    };
    use tokio::time::timeout;

    use crate::item::{CancelReason, ItemOutcome};
    use crate::registry::{RegistryConfig, SessionRegistry};
    use crate::speech::{SpeechOutcome, SpeechRequest, SpeechSink};

    use super::InboxEngine;

    const TEST_TIMEOUT: Duration = Duration::from_secs(2);

    #[derive(Default)]
    struct RecordingSink {
        spoken: Mutex<Vec<SpeechRequest>>,
        readouts: Mutex<Vec<(String, u64)>>,
        generation: std::sync::atomic::AtomicU64,
    }

    #[async_trait]
    impl SpeechSink for RecordingSink {
        async fn speak(&self, request: SpeechRequest) -> BrokerResult<SpeechOutcome> {
            let blocking = request.blocking;
            self.spoken
                .lock()
                .expect("recording sink lock poisoned")
                .push(request);
            Ok(if blocking {
                SpeechOutcome::Completed
            } else {
                SpeechOutcome::Started
            })
        }

        fn begin_readout(&self) -> u64 {
            self.generation
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
                + 1
        }

        async fn readout(&self, text: String, _voice: VoiceProfile, token: u64) {
            self.readouts
                .lock()
                .expect("recording sink lock poisoned")
                .push((text, token));
        }

        async fn pregenerate(&self, _texts: Vec<String>, _voice: VoiceProfile) {}

        fn stop(&self) {}
    }

    struct Harness {
        engine: Arc<InboxEngine>,
        sink: Arc<RecordingSink>,
    }

    fn harness() -> Harness {
        let registry = Arc::new(SessionRegistry::new(RegistryConfig::default()));
        let bus = Arc::new(BrokerEventBus::default());
        let sink = Arc::new(RecordingSink::default());
        let engine = InboxEngine::new(registry, bus, Arc::clone(&sink) as Arc<dyn SpeechSink>);
        Harness { engine, sink }
    }

    fn options(labels: &[&str]) -> Vec<ChoiceOption> {
        labels
            .iter()
            .map(|label| ChoiceOption::new(*label, format!("{label} summary")))
            .collect()
    }

    #[tokio::test]
    async fn concurrent_choices_resolve_in_enqueue_order() {
        let Harness { engine, .. } = harness();
        let session_id = SessionId::new("sess-a");
        engine
            .get_or_create_session(&session_id)
            .expect("create session");
        let mut events = engine.bus().subscribe();

        let first_rx = engine
            .enqueue_choices(
                &session_id,
                "fruit".to_owned(),
                options(&["Apple", "Pear"]),
                false,
                None,
            )
            .expect("enqueue first");
        let second_rx = engine
            .enqueue_choices(
                &session_id,
                "color".to_owned(),
                options(&["Red", "Blue"]),
                false,
                None,
            )
            .expect("enqueue second");

        engine
            .resolve_active(
                &session_id,
                ItemOutcome::Selected {
                    label: "Pear".to_owned(),
                    summary: "Pear summary".to_owned(),
                },
            )
            .expect("resolve first");

        let first = timeout(TEST_TIMEOUT, first_rx)
            .await
            .expect("first rendezvous timed out")
            .expect("first rendezvous fired");
        assert_eq!(
            first,
            ItemOutcome::Selected {
                label: "Pear".to_owned(),
                summary: "Pear summary".to_owned(),
            }
        );

        engine
            .resolve_active(
                &session_id,
                ItemOutcome::Selected {
                    label: "Blue".to_owned(),
                    summary: "Blue summary".to_owned(),
                },
            )
            .expect("resolve second");
        let second = timeout(TEST_TIMEOUT, second_rx)
            .await
            .expect("second rendezvous timed out")
            .expect("second rendezvous fired");
        assert!(matches!(second, ItemOutcome::Selected { label, .. } if label == "Blue"));

        // choices_presented and selection_made interleave with ascending
        // sequence numbers: fruit presented, Pear selected, color presented,
        // Blue selected.
        let mut kinds = Vec::new();
        let mut last_sequence = 0;
        while let Ok(Ok(envelope)) = timeout(Duration::from_millis(100), events.recv()).await {
            assert!(envelope.sequence > last_sequence);
            last_sequence = envelope.sequence;
            kinds.push(envelope.event.kind().to_owned());
        }
        let interactions: Vec<&str> = kinds
            .iter()
            .map(String::as_str)
            .filter(|kind| *kind == "choices_presented" || *kind == "selection_made")
            .collect();
        assert_eq!(
            interactions,
            vec![
                "choices_presented",
                "selection_made",
                "choices_presented",
                "selection_made",
            ]
        );
    }

    #[tokio::test]
    async fn cancel_before_activation_prevents_activation() {
        let Harness { engine, .. } = harness();
        let session_id = SessionId::new("sess-a");
        engine
            .get_or_create_session(&session_id)
            .expect("create session");

        let first_rx = engine
            .enqueue_choices(
                &session_id,
                "first".to_owned(),
                options(&["A"]),
                false,
                Some(CallId::new("call-1")),
            )
            .expect("enqueue first");
        let second_rx = engine
            .enqueue_choices(
                &session_id,
                "second".to_owned(),
                options(&["B"]),
                false,
                Some(CallId::new("call-2")),
            )
            .expect("enqueue second");

        assert!(engine
            .cancel_call(&CallId::new("call-2"))
            .expect("cancel second"));

        let cancelled = timeout(TEST_TIMEOUT, second_rx)
            .await
            .expect("cancel rendezvous timed out")
            .expect("cancel rendezvous fired");
        assert_eq!(
            cancelled,
            ItemOutcome::Cancelled(CancelReason::TransportAborted)
        );

        // First item is still active and resolves normally.
        let session = engine.registry().get(&session_id).expect("session");
        let active = session
            .active_item()
            .expect("active item query")
            .expect("first item still active");
        assert!(active.payload.is_choices());

        engine
            .resolve_active(
                &session_id,
                ItemOutcome::Selected {
                    label: "A".to_owned(),
                    summary: "A summary".to_owned(),
                },
            )
            .expect("resolve first");
        let first = timeout(TEST_TIMEOUT, first_rx)
            .await
            .expect("first rendezvous timed out")
            .expect("first rendezvous fired");
        assert!(matches!(first, ItemOutcome::Selected { .. }));
        assert!(session.inbox_is_empty().expect("inbox empty"));
    }

    #[tokio::test]
    async fn empty_options_are_rejected_without_touching_the_inbox() {
        let Harness { engine, .. } = harness();
        let session_id = SessionId::new("sess-a");
        engine
            .get_or_create_session(&session_id)
            .expect("create session");

        let error = engine
            .enqueue_choices(&session_id, "empty".to_owned(), Vec::new(), false, None)
            .expect_err("empty options should be rejected");
        assert!(matches!(error, BrokerError::InvalidRequest(_)));

        let session = engine.registry().get(&session_id).expect("session");
        assert!(session.inbox_is_empty().expect("inbox untouched"));
    }

    #[tokio::test]
    async fn duplicate_enqueue_piggybacks_on_the_pending_item() {
        let Harness { engine, .. } = harness();
        let session_id = SessionId::new("sess-a");
        engine
            .get_or_create_session(&session_id)
            .expect("create session");

        let first_rx = engine
            .enqueue_choices(
                &session_id,
                "pick".to_owned(),
                options(&["A", "B"]),
                false,
                None,
            )
            .expect("enqueue original");
        let retry_rx = engine
            .enqueue_choices(
                &session_id,
                "pick".to_owned(),
                options(&["A", "B"]),
                false,
                None,
            )
            .expect("enqueue retry");

        let session = engine.registry().get(&session_id).expect("session");
        assert_eq!(
            session.snapshot().expect("snapshot").queued,
            1,
            "retry should not create a second item"
        );

        engine
            .resolve_active(
                &session_id,
                ItemOutcome::Selected {
                    label: "B".to_owned(),
                    summary: "B summary".to_owned(),
                },
            )
            .expect("resolve");

        for receiver in [first_rx, retry_rx] {
            let outcome = timeout(TEST_TIMEOUT, receiver)
                .await
                .expect("rendezvous timed out")
                .expect("rendezvous fired");
            assert!(matches!(outcome, ItemOutcome::Selected { label, .. } if label == "B"));
        }
    }

    #[tokio::test]
    async fn removing_a_session_cancels_queued_items_with_session_closed() {
        let Harness { engine, .. } = harness();
        let session_id = SessionId::new("sess-a");
        engine
            .get_or_create_session(&session_id)
            .expect("create session");

        let receiver = engine
            .enqueue_choices(
                &session_id,
                "pick".to_owned(),
                options(&["A"]),
                false,
                None,
            )
            .expect("enqueue");

        assert!(engine
            .remove_session(&session_id, "agent disconnected")
            .expect("remove session"));

        let outcome = timeout(TEST_TIMEOUT, receiver)
            .await
            .expect("rendezvous timed out")
            .expect("rendezvous fired");
        assert_eq!(outcome, ItemOutcome::Cancelled(CancelReason::SessionClosed));
        assert!(engine.registry().try_get(&session_id).is_none());
    }

    #[tokio::test]
    async fn async_speech_resolves_at_dispatch_and_advances_the_queue() {
        let Harness { engine, sink } = harness();
        let session_id = SessionId::new("sess-a");
        engine
            .get_or_create_session(&session_id)
            .expect("create session");

        let speech_rx = engine
            .enqueue_speech(&session_id, "status update".to_owned(), false, false, None)
            .expect("enqueue speech");
        let choices_rx = engine
            .enqueue_choices(
                &session_id,
                "after speech".to_owned(),
                options(&["Go"]),
                false,
                None,
            )
            .expect("enqueue choices");

        let outcome = timeout(TEST_TIMEOUT, speech_rx)
            .await
            .expect("speech rendezvous timed out")
            .expect("speech rendezvous fired");
        assert_eq!(outcome, ItemOutcome::SpeechDispatched);

        // The speech item left the queue, so the choices item is now active.
        let session = engine.registry().get(&session_id).expect("session");
        timeout(TEST_TIMEOUT, async {
            loop {
                if session.has_active_item().expect("query active") {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("choices item should activate after speech dispatch");

        let spoken = sink.spoken.lock().expect("sink lock").clone();
        assert_eq!(spoken.len(), 1);
        assert_eq!(spoken[0].text, "status update");
        assert!(!spoken[0].blocking);

        engine
            .resolve_active(
                &session_id,
                ItemOutcome::Selected {
                    label: "Go".to_owned(),
                    summary: "Go summary".to_owned(),
                },
            )
            .expect("resolve choices");
        let resolved = timeout(TEST_TIMEOUT, choices_rx)
            .await
            .expect("choices rendezvous timed out")
            .expect("choices rendezvous fired");
        assert!(matches!(resolved, ItemOutcome::Selected { .. }));
    }

    #[tokio::test]
    async fn urgent_speech_bypasses_the_queue() {
        let Harness { engine, sink } = harness();
        let session_id = SessionId::new("sess-a");
        engine
            .get_or_create_session(&session_id)
            .expect("create session");

        // Block the queue with an unresolved choices item.
        let _choices_rx = engine
            .enqueue_choices(
                &session_id,
                "pick".to_owned(),
                options(&["A"]),
                false,
                None,
            )
            .expect("enqueue choices");

        let urgent_rx = engine
            .enqueue_speech(&session_id, "stop".to_owned(), true, true, None)
            .expect("enqueue urgent");

        let outcome = timeout(TEST_TIMEOUT, urgent_rx)
            .await
            .expect("urgent rendezvous timed out")
            .expect("urgent rendezvous fired");
        assert_eq!(outcome, ItemOutcome::SpeechDone);

        let spoken = sink.spoken.lock().expect("sink lock").clone();
        assert_eq!(spoken.len(), 1);
        assert!(spoken[0].urgent);

        // The choices item is untouched by the urgent bypass.
        let session = engine.registry().get(&session_id).expect("session");
        assert!(session.has_active_item().expect("still active"));
    }

    #[tokio::test]
    async fn session_with_pending_item_is_never_pruned() {
        let Harness { engine, .. } = harness();
        let busy_id = SessionId::new("sess-busy");
        let idle_id = SessionId::new("sess-idle");
        engine.get_or_create_session(&busy_id).expect("create busy");
        engine.get_or_create_session(&idle_id).expect("create idle");
        // Focus a third session so neither candidate is protected by focus.
        let focused_id = SessionId::new("sess-focused");
        engine
            .get_or_create_session(&focused_id)
            .expect("create focused");
        engine.registry().focus(&focused_id).expect("focus");

        let _rx = engine
            .enqueue_choices(
                &busy_id,
                "pick".to_owned(),
                options(&["A"]),
                false,
                None,
            )
            .expect("enqueue");

        let removed = engine.prune_stale(Duration::from_secs(0));
        assert_eq!(removed, vec![idle_id]);
        assert!(engine.registry().try_get(&busy_id).is_some());
    }

    #[tokio::test]
    async fn highlight_updates_scroll_index_and_dispatches_a_readout() {
        let Harness { engine, sink } = harness();
        let session_id = SessionId::new("sess-a");
        engine
            .get_or_create_session(&session_id)
            .expect("create session");

        let _rx = engine
            .enqueue_choices(
                &session_id,
                "pick".to_owned(),
                options(&["Apple", "Pear"]),
                false,
                None,
            )
            .expect("enqueue");

        engine.highlight(&session_id, 1).expect("highlight");
        let session = engine.registry().get(&session_id).expect("session");
        assert_eq!(session.scroll_index().expect("scroll index"), 1);

        timeout(TEST_TIMEOUT, async {
            loop {
                let readouts = sink.readouts.lock().expect("sink lock").clone();
                if !readouts.is_empty() {
                    assert!(readouts[0].0.contains("Pear"));
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("readout should be dispatched");
    }
}
