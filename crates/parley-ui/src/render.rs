use parley_core::SessionSnapshot;
use parley_protocol::SessionId;
use ratatui::layout::{Constraint, Layout, Rect};
use ratatui::style::{Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, List, ListItem, ListState, Paragraph};
use ratatui::Frame;

use crate::state::{UiMode, ViewState};

pub fn render(
    frame: &mut Frame,
    view: &ViewState,
    snapshots: &[SessionSnapshot],
    focused_id: Option<&SessionId>,
) {
    let [tabs_area, preamble_area, list_area, history_area, status_area] = Layout::vertical([
        Constraint::Length(1),
        Constraint::Length(2),
        Constraint::Min(3),
        Constraint::Length(6),
        Constraint::Length(1),
    ])
    .areas(frame.area());

    let focused = focused_id.and_then(|id| snapshots.iter().find(|snapshot| &snapshot.id == id));

    render_tab_bar(frame, tabs_area, snapshots, focused_id);
    render_preamble(frame, preamble_area, focused);
    render_choices(frame, list_area, view, focused);
    render_history(frame, history_area, focused);
    render_status(frame, status_area, view, focused);
}

/// One entry per session: focused marker, name, and a pending-choices badge
/// so unfocused sessions still surface their waiting prompts.
fn render_tab_bar(
    frame: &mut Frame,
    area: Rect,
    snapshots: &[SessionSnapshot],
    focused_id: Option<&SessionId>,
) {
    let mut spans = Vec::new();
    for snapshot in snapshots {
        let is_focused = focused_id == Some(&snapshot.id);
        let marker = if is_focused { "> " } else { "  " };
        let style = if is_focused {
            Style::default().add_modifier(Modifier::BOLD)
        } else {
            Style::default().add_modifier(Modifier::DIM)
        };
        spans.push(Span::styled(format!("{marker}{}", snapshot.name), style));
        if snapshot.has_active_item {
            let badge = if snapshot.queued > 1 {
                format!(" o+{}", snapshot.queued - 1)
            } else {
                " o".to_owned()
            };
            spans.push(Span::styled(badge, Style::default().add_modifier(Modifier::BOLD)));
        } else if snapshot.queued > 0 {
            spans.push(Span::styled(
                format!(" +{}", snapshot.queued),
                Style::default().add_modifier(Modifier::BOLD),
            ));
        }
        spans.push(Span::raw("  "));
    }
    frame.render_widget(Paragraph::new(Line::from(spans)), area);
}

fn render_preamble(frame: &mut Frame, area: Rect, focused: Option<&SessionSnapshot>) {
    let text = match focused.and_then(|snapshot| snapshot.active.as_ref()) {
        Some(active) => active.preamble.clone(),
        None => match focused {
            Some(snapshot) if snapshot.queued > 0 => "speaking...".to_owned(),
            Some(_) => "waiting for agent...".to_owned(),
            None => "no sessions connected".to_owned(),
        },
    };
    frame.render_widget(Paragraph::new(text), area);
}

fn render_choices(
    frame: &mut Frame,
    area: Rect,
    view: &ViewState,
    focused: Option<&SessionSnapshot>,
) {
    let Some(snapshot) = focused else {
        frame.render_widget(Block::default().borders(Borders::ALL), area);
        return;
    };
    let Some(active) = snapshot.active.as_ref() else {
        frame.render_widget(Block::default().borders(Borders::ALL), area);
        return;
    };

    let items: Vec<ListItem> = active
        .options
        .iter()
        .enumerate()
        .map(|(index, option)| {
            let prefix = if active.multi {
                if view.checked.contains(&index) {
                    "[x] "
                } else {
                    "[ ] "
                }
            } else {
                ""
            };
            let line = if option.summary.is_empty() {
                format!("{prefix}{}. {}", index + 1, option.label)
            } else {
                format!("{prefix}{}. {} - {}", index + 1, option.label, option.summary)
            };
            ListItem::new(line)
        })
        .collect();

    let list = List::new(items)
        .block(Block::default().borders(Borders::ALL))
        .highlight_style(Style::default().add_modifier(Modifier::REVERSED))
        .highlight_symbol("> ");
    let mut state = ListState::default();
    state.select(Some(snapshot.scroll_index.min(active.options.len().saturating_sub(1))));
    frame.render_stateful_widget(list, area, &mut state);
}

fn render_history(frame: &mut Frame, area: Rect, focused: Option<&SessionSnapshot>) {
    let lines: Vec<Line> = focused
        .map(|snapshot| {
            snapshot
                .history
                .iter()
                .take(area.height.saturating_sub(2) as usize)
                .map(|entry| {
                    let line = if entry.summary.is_empty() {
                        format!("[{}] {}", entry.kind, entry.label)
                    } else {
                        format!("[{}] {} - {}", entry.kind, entry.label, entry.summary)
                    };
                    Line::from(line)
                })
                .collect()
        })
        .unwrap_or_default();
    frame.render_widget(
        Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title("history")),
        area,
    );
}

fn render_status(frame: &mut Frame, area: Rect, view: &ViewState, focused: Option<&SessionSnapshot>) {
    let text = match view.mode {
        UiMode::Freeform => format!("reply: {}", view.input),
        UiMode::Message => format!("message: {}", view.input),
        UiMode::Normal => {
            let pending = focused.map(|snapshot| snapshot.pending_messages).unwrap_or(0);
            if pending > 0 {
                format!("j/k scroll  enter select  i reply  m message  d dismiss  q quit  [{pending} queued]")
            } else {
                "j/k scroll  enter select  i reply  m message  d dismiss  q quit".to_owned()
            }
        }
    };
    frame.render_widget(
        Paragraph::new(text).style(Style::default().add_modifier(Modifier::DIM)),
        area,
    );
}
