//! Tool dispatcher: glue between the agent RPC transport and the inbox
//! engine. Transport identity arrives as a [`SessionId`]; tool arguments are
//! already-deserialized protocol types. Every success response drains the
//! session's pending operator messages.

use std::sync::Arc;

use parley_core::{CancelReason, InboxEngine, ItemOutcome, Session};
use parley_protocol::{
    BrokerError, BrokerResult, CallId, CheckInboxResult, ChoiceOption, ChoiceResult,
    MultiSelectResult, RegisterSessionArgs, RegisterSessionResult, SessionId, SettingsSnapshot,
    SpeakResult,
};
use tokio::sync::oneshot;
use tracing::debug;

#[derive(Debug, Clone, Default)]
pub struct DispatcherConfig {
    /// Options appended to every choice presentation, deduplicated against
    /// the agent's own options by label (case-insensitive).
    pub extra_options: Vec<ChoiceOption>,
}

pub struct ToolDispatcher {
    engine: Arc<InboxEngine>,
    config: DispatcherConfig,
    settings: SettingsSnapshot,
}

impl ToolDispatcher {
    pub fn new(
        engine: Arc<InboxEngine>,
        config: DispatcherConfig,
        settings: SettingsSnapshot,
    ) -> Self {
        Self {
            engine,
            config,
            settings,
        }
    }

    pub fn engine(&self) -> &Arc<InboxEngine> {
        &self.engine
    }

    fn session_for_tool(&self, session_id: &SessionId, tool: &str) -> BrokerResult<Arc<Session>> {
        let session = self.engine.get_or_create_session(session_id)?;
        session.record_tool_call(tool)?;
        Ok(session)
    }

    pub async fn register_session(
        &self,
        session_id: &SessionId,
        args: RegisterSessionArgs,
    ) -> BrokerResult<RegisterSessionResult> {
        let session = self.session_for_tool(session_id, "register_session")?;
        session.register(&args)?;
        Ok(RegisterSessionResult {
            session_id: session_id.clone(),
            name: session.display_name()?,
        })
    }

    pub async fn present_choices(
        &self,
        session_id: &SessionId,
        call_id: Option<CallId>,
        preamble: String,
        choices: Vec<ChoiceOption>,
    ) -> BrokerResult<ChoiceResult> {
        if choices.is_empty() {
            return Err(BrokerError::InvalidRequest(
                "present_choices requires at least one option".to_owned(),
            ));
        }
        let session = self.session_for_tool(session_id, "present_choices")?;
        let augmented = self.augment(choices);

        let receiver =
            self.engine
                .enqueue_choices(session_id, preamble, augmented, false, call_id)?;
        let outcome = await_rendezvous(receiver).await?;
        match outcome {
            ItemOutcome::Selected { label, summary } => Ok(ChoiceResult {
                selected: label,
                summary,
                pending_messages: session.drain_messages()?,
            }),
            ItemOutcome::Freeform { text } => Ok(ChoiceResult {
                selected: text,
                summary: "(freeform input)".to_owned(),
                pending_messages: session.drain_messages()?,
            }),
            ItemOutcome::Cancelled(reason) => Err(cancellation_error(reason)),
            other => Err(BrokerError::Internal(format!(
                "present_choices resolved with unexpected outcome {other:?}"
            ))),
        }
    }

    pub async fn present_multi_select(
        &self,
        session_id: &SessionId,
        call_id: Option<CallId>,
        preamble: String,
        choices: Vec<ChoiceOption>,
    ) -> BrokerResult<MultiSelectResult> {
        if choices.is_empty() {
            return Err(BrokerError::InvalidRequest(
                "present_multi_select requires at least one option".to_owned(),
            ));
        }
        let session = self.session_for_tool(session_id, "present_multi_select")?;

        let receiver = self
            .engine
            .enqueue_choices(session_id, preamble, choices, true, call_id)?;
        let outcome = await_rendezvous(receiver).await?;
        match outcome {
            ItemOutcome::MultiSelected { labels } => Ok(MultiSelectResult {
                selected: labels,
                pending_messages: session.drain_messages()?,
            }),
            ItemOutcome::Selected { label, .. } => Ok(MultiSelectResult {
                selected: vec![label],
                pending_messages: session.drain_messages()?,
            }),
            ItemOutcome::Freeform { text } => Ok(MultiSelectResult {
                selected: vec![text],
                pending_messages: session.drain_messages()?,
            }),
            ItemOutcome::Cancelled(reason) => Err(cancellation_error(reason)),
            other => Err(BrokerError::Internal(format!(
                "present_multi_select resolved with unexpected outcome {other:?}"
            ))),
        }
    }

    /// Blocking speech: returns once playback completes.
    pub async fn speak(&self, session_id: &SessionId, text: String) -> BrokerResult<SpeakResult> {
        let session = self.session_for_tool(session_id, "speak")?;
        let receiver = self
            .engine
            .enqueue_speech(session_id, text, true, false, None)?;
        let outcome = await_rendezvous(receiver).await?;
        if let ItemOutcome::Cancelled(reason) = outcome {
            return Err(cancellation_error(reason));
        }
        Ok(SpeakResult {
            ok: true,
            pending_messages: session.drain_messages()?,
        })
    }

    /// Fire-and-forget speech: returns at enqueue.
    pub async fn speak_async(
        &self,
        session_id: &SessionId,
        text: String,
    ) -> BrokerResult<SpeakResult> {
        let session = self.session_for_tool(session_id, "speak_async")?;
        let _receiver = self
            .engine
            .enqueue_speech(session_id, text, false, false, None)?;
        Ok(SpeakResult {
            ok: true,
            pending_messages: session.drain_messages()?,
        })
    }

    /// Urgent speech: preempts current audio, returns once playback starts.
    pub async fn speak_urgent(
        &self,
        session_id: &SessionId,
        text: String,
    ) -> BrokerResult<SpeakResult> {
        let session = self.session_for_tool(session_id, "speak_urgent")?;
        let receiver = self
            .engine
            .enqueue_speech(session_id, text, false, true, None)?;
        let outcome = await_rendezvous(receiver).await?;
        if let ItemOutcome::Cancelled(reason) = outcome {
            return Err(cancellation_error(reason));
        }
        Ok(SpeakResult {
            ok: true,
            pending_messages: session.drain_messages()?,
        })
    }

    pub async fn rename_session(
        &self,
        session_id: &SessionId,
        name: String,
    ) -> BrokerResult<SpeakResult> {
        let session = self.session_for_tool(session_id, "rename_session")?;
        session.rename(name)?;
        Ok(SpeakResult {
            ok: true,
            pending_messages: session.drain_messages()?,
        })
    }

    pub async fn check_inbox(&self, session_id: &SessionId) -> BrokerResult<CheckInboxResult> {
        let session = self.session_for_tool(session_id, "check_inbox")?;
        Ok(CheckInboxResult {
            pending_messages: session.drain_messages()?,
        })
    }

    pub fn get_settings(&self) -> SettingsSnapshot {
        self.settings.clone()
    }

    /// Transport noticed the agent abandoned a call.
    pub fn cancel(&self, call_id: &CallId) -> BrokerResult<bool> {
        debug!(call = %call_id, "transport cancelled tool call");
        self.engine.cancel_call(call_id)
    }

    /// Transport noticed the agent connection is gone.
    pub fn session_disconnected(&self, session_id: &SessionId) -> BrokerResult<bool> {
        self.engine.remove_session(session_id, "agent disconnected")
    }

    fn augment(&self, mut choices: Vec<ChoiceOption>) -> Vec<ChoiceOption> {
        for extra in &self.config.extra_options {
            let duplicate = choices
                .iter()
                .any(|choice| choice.label.eq_ignore_ascii_case(&extra.label));
            if !duplicate {
                choices.push(extra.clone());
            }
        }
        choices
    }
}

async fn await_rendezvous(
    receiver: oneshot::Receiver<ItemOutcome>,
) -> BrokerResult<ItemOutcome> {
    receiver
        .await
        .map_err(|_| BrokerError::Internal("rendezvous dropped without firing".to_owned()))
}

fn cancellation_error(reason: CancelReason) -> BrokerError {
    match reason {
        CancelReason::SessionClosed => {
            BrokerError::SessionClosed("session closed while call pending".to_owned())
        }
        reason => BrokerError::Cancelled(reason.as_str().to_owned()),
    }
}
