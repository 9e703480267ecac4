//! Terminal presenter: renders the focused session's active item, translates
//! operator input into inbox resolutions, and keeps the UI thread free of
//! blocking work.

pub mod render;
pub mod state;

use std::io::Stdout;
use std::sync::Arc;

use crossterm::event::{Event, EventStream, KeyEventKind};
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use crossterm::ExecutableCommand;
use futures::StreamExt;
use parley_core::{InboxEngine, ItemOutcome, SessionSnapshot};
use parley_protocol::{BrokerError, BrokerResult, OperatorKey, SessionId};
use ratatui::backend::CrosstermBackend;
use ratatui::Terminal;
use tokio::sync::mpsc;
use tracing::warn;

pub use state::{UiAction, UiMode, ViewState};

enum Wakeup {
    Input(Event),
    OperatorKey(OperatorKey),
    Refresh,
    InputClosed,
}

pub struct Presenter {
    engine: Arc<InboxEngine>,
    keys: mpsc::UnboundedReceiver<OperatorKey>,
    view: ViewState,
}

impl Presenter {
    pub fn new(engine: Arc<InboxEngine>, keys: mpsc::UnboundedReceiver<OperatorKey>) -> Self {
        Self {
            engine,
            keys,
            view: ViewState::new(),
        }
    }

    /// Take over the terminal and run until the operator quits.
    pub async fn run(mut self) -> BrokerResult<()> {
        enable_raw_mode().map_err(terminal_error)?;
        let mut stdout = std::io::stdout();
        stdout
            .execute(EnterAlternateScreen)
            .map_err(terminal_error)?;
        let backend = CrosstermBackend::new(stdout);
        let mut terminal = Terminal::new(backend).map_err(terminal_error)?;

        let result = self.event_loop(&mut terminal).await;

        disable_raw_mode().map_err(terminal_error)?;
        let _ = std::io::stdout().execute(LeaveAlternateScreen);
        result
    }

    async fn event_loop(
        &mut self,
        terminal: &mut Terminal<CrosstermBackend<Stdout>>,
    ) -> BrokerResult<()> {
        let mut refresh = self.engine.subscribe_refresh();
        let mut input = EventStream::new();

        loop {
            let snapshots = self.snapshots();
            let focused_id = self.engine.registry().focused_id();
            let focused = focused_id
                .as_ref()
                .and_then(|id| snapshots.iter().find(|snapshot| &snapshot.id == id));
            self.view.sync_active_item(focused);

            terminal
                .draw(|frame| render::render(frame, &self.view, &snapshots, focused_id.as_ref()))
                .map_err(terminal_error)?;

            let focused_snapshot = focused.cloned();
            // Pick the next wakeup first, then act on it; acting mutates
            // view state, which the pending futures must not borrow.
            let wakeup = tokio::select! {
                maybe_event = input.next() => match maybe_event {
                    Some(Ok(event)) => Wakeup::Input(event),
                    Some(Err(error)) => return Err(terminal_error(error)),
                    None => Wakeup::InputClosed,
                },
                _ = refresh.changed() => Wakeup::Refresh,
                maybe_key = self.keys.recv() => match maybe_key {
                    Some(key) => Wakeup::OperatorKey(key),
                    None => Wakeup::Refresh,
                },
            };

            match wakeup {
                Wakeup::Input(Event::Key(key)) if key.kind == KeyEventKind::Press => {
                    let action =
                        state::action_for_key(&mut self.view, focused_snapshot.as_ref(), key);
                    self.apply(action, focused_id.as_ref());
                }
                Wakeup::Input(_) | Wakeup::Refresh => {}
                Wakeup::OperatorKey(key) => {
                    let action = state::action_for_operator_key(
                        &mut self.view,
                        focused_snapshot.as_ref(),
                        key,
                    );
                    self.apply(action, focused_id.as_ref());
                }
                Wakeup::InputClosed => break,
            }

            if self.view.should_quit {
                break;
            }
        }
        Ok(())
    }

    fn snapshots(&self) -> Vec<SessionSnapshot> {
        self.engine
            .registry()
            .sessions()
            .iter()
            .filter_map(|session| session.snapshot().ok())
            .collect()
    }

    /// Resolutions and readouts are dispatched on worker tasks; the UI
    /// thread only mutates view state and navigates focus.
    fn apply(&mut self, action: UiAction, focused: Option<&SessionId>) {
        let Some(session_id) = focused.cloned() else {
            if matches!(
                action,
                UiAction::NextTab | UiAction::PrevTab | UiAction::NextPending
            ) {
                self.navigate(&action);
            }
            return;
        };

        match action {
            UiAction::None | UiAction::Quit => {}
            UiAction::Highlight(index) => {
                self.spawn_engine_op(move |engine| engine.highlight(&session_id, index).map(|_| ()));
            }
            UiAction::Select { label, summary } => {
                self.spawn_engine_op(move |engine| {
                    engine
                        .resolve_active(&session_id, ItemOutcome::Selected { label, summary })
                        .map(|_| ())
                });
            }
            UiAction::SubmitMulti(labels) => {
                self.spawn_engine_op(move |engine| {
                    engine
                        .resolve_active(&session_id, ItemOutcome::MultiSelected { labels })
                        .map(|_| ())
                });
            }
            UiAction::SubmitFreeform(text) => {
                self.spawn_engine_op(move |engine| {
                    engine
                        .resolve_active(&session_id, ItemOutcome::Freeform { text })
                        .map(|_| ())
                });
            }
            UiAction::Dismiss => {
                self.spawn_engine_op(move |engine| engine.dismiss_active(&session_id).map(|_| ()));
            }
            UiAction::QueueMessage(text) => {
                self.spawn_engine_op(move |engine| engine.queue_message(&session_id, text));
            }
            UiAction::NextTab | UiAction::PrevTab | UiAction::NextPending => {
                self.navigate(&action);
            }
        }
    }

    fn navigate(&self, action: &UiAction) {
        match action {
            UiAction::NextTab => {
                let _ = self.engine.registry().next_tab();
            }
            UiAction::PrevTab => {
                let _ = self.engine.registry().prev_tab();
            }
            UiAction::NextPending => {
                let _ = self.engine.registry().next_with_pending();
            }
            _ => {}
        }
    }

    fn spawn_engine_op<F>(&self, op: F)
    where
        F: FnOnce(&Arc<InboxEngine>) -> BrokerResult<()> + Send + 'static,
    {
        let engine = Arc::clone(&self.engine);
        tokio::spawn(async move {
            if let Err(error) = op(&engine) {
                warn!(%error, "presenter action failed");
            }
        });
    }
}

fn terminal_error(error: std::io::Error) -> BrokerError {
    BrokerError::Internal(format!("terminal error: {error}"))
}
