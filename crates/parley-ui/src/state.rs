use std::collections::BTreeSet;

use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};
use parley_core::SessionSnapshot;
use parley_protocol::{ItemId, OperatorKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UiMode {
    #[default]
    Normal,
    Freeform,
    Message,
}

/// Presenter-local state: input buffers, multi-select checkboxes, quit flag.
/// Everything session-shaped lives in the registry and is read via
/// snapshots.
#[derive(Debug, Default)]
pub struct ViewState {
    pub mode: UiMode,
    pub input: String,
    pub checked: BTreeSet<usize>,
    pub tracked_item: Option<ItemId>,
    pub should_quit: bool,
}

impl ViewState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset per-item state (checkboxes) when the focused session's active
    /// item changes under us.
    pub fn sync_active_item(&mut self, snapshot: Option<&SessionSnapshot>) {
        let current = snapshot
            .and_then(|snapshot| snapshot.active.as_ref())
            .map(|active| active.item_id.clone());
        if current != self.tracked_item {
            self.tracked_item = current;
            self.checked.clear();
        }
    }
}

/// What a key press asks the presenter to do. Pure data so key handling is
/// testable without a terminal or an engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiAction {
    None,
    Quit,
    Highlight(usize),
    Select { label: String, summary: String },
    SubmitMulti(Vec<String>),
    Dismiss,
    SubmitFreeform(String),
    QueueMessage(String),
    NextTab,
    PrevTab,
    NextPending,
}

pub fn action_for_key(
    view: &mut ViewState,
    snapshot: Option<&SessionSnapshot>,
    key: KeyEvent,
) -> UiAction {
    if key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char('c') {
        view.should_quit = true;
        return UiAction::Quit;
    }

    match view.mode {
        UiMode::Normal => normal_mode_action(view, snapshot, key),
        UiMode::Freeform | UiMode::Message => input_mode_action(view, key),
    }
}

pub fn action_for_operator_key(
    view: &mut ViewState,
    snapshot: Option<&SessionSnapshot>,
    key: OperatorKey,
) -> UiAction {
    let code = match key {
        OperatorKey::J => KeyCode::Char('j'),
        OperatorKey::K => KeyCode::Char('k'),
        OperatorKey::Enter => KeyCode::Enter,
        OperatorKey::Space => KeyCode::Char(' '),
    };
    normal_mode_action(view, snapshot, KeyEvent::new(code, KeyModifiers::NONE))
}

fn normal_mode_action(
    view: &mut ViewState,
    snapshot: Option<&SessionSnapshot>,
    key: KeyEvent,
) -> UiAction {
    let active = snapshot.and_then(|snapshot| snapshot.active.as_ref());
    let scroll = snapshot.map(|snapshot| snapshot.scroll_index).unwrap_or(0);
    let option_count = active.map(|active| active.options.len()).unwrap_or(0);

    match key.code {
        KeyCode::Char('q') => {
            view.should_quit = true;
            UiAction::Quit
        }
        KeyCode::Char('j') | KeyCode::Down if option_count > 0 => {
            UiAction::Highlight((scroll + 1).min(option_count - 1))
        }
        KeyCode::Char('k') | KeyCode::Up if option_count > 0 => {
            UiAction::Highlight(scroll.saturating_sub(1))
        }
        KeyCode::Enter => match active {
            Some(active) if active.multi => {
                let labels = view
                    .checked
                    .iter()
                    .filter_map(|index| active.options.get(*index))
                    .map(|option| option.label.clone())
                    .collect();
                UiAction::SubmitMulti(labels)
            }
            Some(active) => select_highlighted(active, scroll),
            None => UiAction::None,
        },
        KeyCode::Char(' ') => match active {
            Some(active) if active.multi => {
                if !view.checked.remove(&scroll) {
                    view.checked.insert(scroll);
                }
                UiAction::None
            }
            Some(active) => select_highlighted(active, scroll),
            None => UiAction::None,
        },
        KeyCode::Char('d') if active.is_some() => UiAction::Dismiss,
        KeyCode::Char('i') if active.is_some() => {
            view.mode = UiMode::Freeform;
            view.input.clear();
            UiAction::None
        }
        KeyCode::Char('m') => {
            view.mode = UiMode::Message;
            view.input.clear();
            UiAction::None
        }
        KeyCode::Tab => UiAction::NextTab,
        KeyCode::BackTab => UiAction::PrevTab,
        KeyCode::Char('n') => UiAction::NextPending,
        _ => UiAction::None,
    }
}

fn select_highlighted(
    active: &parley_core::ActiveItemSnapshot,
    scroll: usize,
) -> UiAction {
    match active.options.get(scroll) {
        Some(option) => UiAction::Select {
            label: option.label.clone(),
            summary: option.summary.clone(),
        },
        None => UiAction::None,
    }
}

fn input_mode_action(view: &mut ViewState, key: KeyEvent) -> UiAction {
    match key.code {
        KeyCode::Esc => {
            view.mode = UiMode::Normal;
            view.input.clear();
            UiAction::None
        }
        KeyCode::Backspace => {
            view.input.pop();
            UiAction::None
        }
        KeyCode::Enter => {
            let text = std::mem::take(&mut view.input);
            let mode = std::mem::replace(&mut view.mode, UiMode::Normal);
            if text.is_empty() {
                return UiAction::None;
            }
            match mode {
                UiMode::Freeform => UiAction::SubmitFreeform(text),
                UiMode::Message => UiAction::QueueMessage(text),
                UiMode::Normal => UiAction::None,
            }
        }
        KeyCode::Char(c) => {
            view.input.push(c);
            UiAction::None
        }
        _ => UiAction::None,
    }
}

#[cfg(test)]
mod tests {
    use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};
    use parley_core::{ActiveItemSnapshot, LifecycleState, SessionSnapshot};
    use parley_protocol::{ChoiceOption, ItemId, OperatorKey, SessionId};

    use super::{action_for_key, action_for_operator_key, UiAction, UiMode, ViewState};

    fn snapshot(options: &[&str], multi: bool, scroll: usize) -> SessionSnapshot {
        SessionSnapshot {
            id: SessionId::new("sess-a"),
            name: "Agent 1".to_owned(),
            lifecycle: LifecycleState::Live,
            registered: true,
            has_active_item: !options.is_empty(),
            queued: usize::from(!options.is_empty()),
            pending_messages: 0,
            scroll_index: scroll,
            tool_call_count: 1,
            last_tool_name: "present_choices".to_owned(),
            active: (!options.is_empty()).then(|| ActiveItemSnapshot {
                item_id: ItemId::new("sess-a/item-1"),
                preamble: "pick one".to_owned(),
                options: options
                    .iter()
                    .map(|label| ChoiceOption::new(*label, format!("{label} summary")))
                    .collect(),
                multi,
            }),
            history: Vec::new(),
        }
    }

    fn press(code: KeyCode) -> KeyEvent {
        KeyEvent::new(code, KeyModifiers::NONE)
    }

    #[test]
    fn scroll_keys_clamp_to_option_bounds() {
        let mut view = ViewState::new();
        let snapshot = snapshot(&["A", "B"], false, 1);

        assert_eq!(
            action_for_key(&mut view, Some(&snapshot), press(KeyCode::Char('j'))),
            UiAction::Highlight(1),
            "scrolling past the last option stays on it"
        );
        assert_eq!(
            action_for_key(&mut view, Some(&snapshot), press(KeyCode::Char('k'))),
            UiAction::Highlight(0)
        );
    }

    #[test]
    fn enter_selects_the_highlighted_option() {
        let mut view = ViewState::new();
        let snapshot = snapshot(&["Apple", "Pear"], false, 1);

        assert_eq!(
            action_for_key(&mut view, Some(&snapshot), press(KeyCode::Enter)),
            UiAction::Select {
                label: "Pear".to_owned(),
                summary: "Pear summary".to_owned(),
            }
        );
    }

    #[test]
    fn space_toggles_and_enter_submits_in_multi_mode() {
        let mut view = ViewState::new();
        let first = snapshot(&["A", "B", "C"], true, 0);
        view.sync_active_item(Some(&first));

        action_for_key(&mut view, Some(&first), press(KeyCode::Char(' ')));
        let third = snapshot(&["A", "B", "C"], true, 2);
        action_for_key(&mut view, Some(&third), press(KeyCode::Char(' ')));

        assert_eq!(
            action_for_key(&mut view, Some(&third), press(KeyCode::Enter)),
            UiAction::SubmitMulti(vec!["A".to_owned(), "C".to_owned()])
        );

        // Toggling again unchecks.
        action_for_key(&mut view, Some(&third), press(KeyCode::Char(' ')));
        assert_eq!(
            action_for_key(&mut view, Some(&third), press(KeyCode::Enter)),
            UiAction::SubmitMulti(vec!["A".to_owned()])
        );
    }

    #[test]
    fn checkboxes_reset_when_the_active_item_changes() {
        let mut view = ViewState::new();
        let first = snapshot(&["A", "B"], true, 0);
        view.sync_active_item(Some(&first));
        action_for_key(&mut view, Some(&first), press(KeyCode::Char(' ')));
        assert!(!view.checked.is_empty());

        let mut second = snapshot(&["X", "Y"], true, 0);
        if let Some(active) = second.active.as_mut() {
            active.item_id = ItemId::new("sess-a/item-2");
        }
        view.sync_active_item(Some(&second));
        assert!(view.checked.is_empty());
    }

    #[test]
    fn freeform_input_collects_text_and_submits_on_enter() {
        let mut view = ViewState::new();
        let snapshot = snapshot(&["A"], false, 0);

        action_for_key(&mut view, Some(&snapshot), press(KeyCode::Char('i')));
        assert_eq!(view.mode, UiMode::Freeform);

        for c in "ok".chars() {
            action_for_key(&mut view, Some(&snapshot), press(KeyCode::Char(c)));
        }
        assert_eq!(
            action_for_key(&mut view, Some(&snapshot), press(KeyCode::Enter)),
            UiAction::SubmitFreeform("ok".to_owned())
        );
        assert_eq!(view.mode, UiMode::Normal);
    }

    #[test]
    fn message_mode_queues_without_resolving() {
        let mut view = ViewState::new();
        let snapshot = snapshot(&["A"], false, 0);

        action_for_key(&mut view, Some(&snapshot), press(KeyCode::Char('m')));
        for c in "hi".chars() {
            action_for_key(&mut view, Some(&snapshot), press(KeyCode::Char(c)));
        }
        assert_eq!(
            action_for_key(&mut view, Some(&snapshot), press(KeyCode::Enter)),
            UiAction::QueueMessage("hi".to_owned())
        );
    }

    #[test]
    fn escape_cancels_input_mode() {
        let mut view = ViewState::new();
        let snapshot = snapshot(&["A"], false, 0);

        action_for_key(&mut view, Some(&snapshot), press(KeyCode::Char('i')));
        action_for_key(&mut view, Some(&snapshot), press(KeyCode::Char('x')));
        action_for_key(&mut view, Some(&snapshot), press(KeyCode::Esc));

        assert_eq!(view.mode, UiMode::Normal);
        assert!(view.input.is_empty());
    }

    #[test]
    fn operator_keys_map_onto_normal_mode_bindings() {
        let mut view = ViewState::new();
        let snapshot = snapshot(&["A", "B"], false, 0);

        assert_eq!(
            action_for_operator_key(&mut view, Some(&snapshot), OperatorKey::J),
            UiAction::Highlight(1)
        );
        assert_eq!(
            action_for_operator_key(&mut view, Some(&snapshot), OperatorKey::Enter),
            UiAction::Select {
                label: "A".to_owned(),
                summary: "A summary".to_owned(),
            }
        );
    }

    #[test]
    fn tab_keys_cycle_sessions() {
        let mut view = ViewState::new();
        assert_eq!(
            action_for_key(&mut view, None, press(KeyCode::Tab)),
            UiAction::NextTab
        );
        assert_eq!(
            action_for_key(&mut view, None, press(KeyCode::BackTab)),
            UiAction::PrevTab
        );
        assert_eq!(
            action_for_key(&mut view, None, press(KeyCode::Char('n'))),
            UiAction::NextPending
        );
    }
}
