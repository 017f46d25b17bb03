use crate::{
    client::{
        AppSnapshot,
        BetRow,
    },
    types::{
        BetId,
        MatchRef,
        PickId,
        TransactionKind,
    },
};
use color_eyre::eyre::{
    Result,
    eyre,
};
use crossterm::{
    event::{
        Event,
        EventStream,
        KeyCode,
        KeyEvent,
        KeyEventKind,
    },
    terminal::{
        disable_raw_mode,
        enable_raw_mode,
    },
};
use futures::StreamExt;
use itertools::Itertools;
use ratatui::{
    prelude::*,
    widgets::*,
};
use std::io::stdout;
use unicode_width::UnicodeWidthChar;

pub type InputEventReceiver = EventStream;

pub enum UserEvent {
    Quit,
    Redraw,
    Refresh,
    OpenHistory,
    CreateBet {
        match_id: String,
        pick_id: String,
        amount: u64,
        note: Option<String>,
    },
    AcceptBet(BetId),
    CancelBet(BetId),
}

#[derive(Debug, Default)]
pub struct UiState {
    mode: Mode,
    focus: Focus,
    open_idx: usize,
    mine_idx: usize,
    open_ids: Vec<BetId>,
    mine_ids: Vec<(BetId, bool)>,
    matches: Vec<MatchRef>,
    terminal: Option<Terminal<CrosstermBackend<std::io::Stdout>>>,
}

#[derive(Clone, Debug, Default)]
enum Mode {
    #[default]
    Normal,
    CreateModal(CreateState),
    ConfirmModal(PendingAction),
    HistoryModal,
    QuitModal,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
enum Focus {
    #[default]
    Open,
    Mine,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum PendingAction {
    Accept(BetId),
    Cancel(BetId),
}

#[derive(Clone, Debug, Default)]
struct CreateState {
    match_idx: usize,
    side_b: bool,
    amount: u64,
    note: String,
    field: CreateField,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
enum CreateField {
    #[default]
    Match,
    Pick,
    Amount,
    Note,
}

impl CreateField {
    fn next(self) -> Self {
        match self {
            CreateField::Match => CreateField::Pick,
            CreateField::Pick => CreateField::Amount,
            CreateField::Amount => CreateField::Note,
            CreateField::Note => CreateField::Match,
        }
    }

    fn prev(self) -> Self {
        match self {
            CreateField::Match => CreateField::Note,
            CreateField::Pick => CreateField::Match,
            CreateField::Amount => CreateField::Pick,
            CreateField::Note => CreateField::Amount,
        }
    }
}

pub fn terminal_enter(state: &mut UiState) -> Result<()> {
    enable_raw_mode()?;
    crossterm::execute!(std::io::stdout(), crossterm::terminal::EnterAlternateScreen)?;
    // one persistent terminal keeps the diffing buffers across draws
    let backend = CrosstermBackend::new(stdout());
    let terminal = Terminal::new(backend)?;
    state.terminal = Some(terminal);
    Ok(())
}

pub fn terminal_exit() -> Result<()> {
    disable_raw_mode()?;
    crossterm::execute!(std::io::stdout(), crossterm::terminal::LeaveAlternateScreen)?;
    Ok(())
}

pub fn input_event_stream() -> InputEventReceiver {
    EventStream::new()
}

pub async fn next_raw_event(events: &mut InputEventReceiver) -> Result<Event> {
    match events.next().await {
        Some(event) => Ok(event?),
        None => Err(eyre!("terminal input stream closed")),
    }
}

pub fn draw(state: &mut UiState, snap: &AppSnapshot) -> Result<()> {
    state.open_ids = snap.open_bets.iter().map(|row| row.id.clone()).collect();
    state.mine_ids = snap
        .my_bets
        .iter()
        .map(|row| (row.id.clone(), row.cancellable))
        .collect();
    state.matches = snap.matches.clone();
    state.open_idx = state.open_idx.min(state.open_ids.len().saturating_sub(1));
    state.mine_idx = state.mine_idx.min(state.mine_ids.len().saturating_sub(1));
    if let Some(mut term) = state.terminal.take() {
        term.draw(|f| ui(f, state, snap))?;
        state.terminal = Some(term);
    }
    Ok(())
}

/// Maps a terminal event to an app event, updating modal state on the way.
pub fn interpret_event(state: &mut UiState, event: Event) -> Option<UserEvent> {
    let key = match event {
        Event::Key(key) if key.kind == KeyEventKind::Press => key,
        Event::Resize(_, _) => return Some(UserEvent::Redraw),
        _ => return None,
    };
    let mode = std::mem::take(&mut state.mode);
    let (mode, event) = match mode {
        Mode::Normal => normal_key(state, key),
        Mode::CreateModal(create) => create_key(state, create, key),
        Mode::ConfirmModal(action) => match key.code {
            KeyCode::Char('y') | KeyCode::Char('Y') | KeyCode::Enter => {
                let event = match action {
                    PendingAction::Accept(id) => UserEvent::AcceptBet(id),
                    PendingAction::Cancel(id) => UserEvent::CancelBet(id),
                };
                (Mode::Normal, Some(event))
            }
            KeyCode::Char('n') | KeyCode::Char('N') | KeyCode::Esc => {
                (Mode::Normal, Some(UserEvent::Redraw))
            }
            _ => (Mode::ConfirmModal(action), None),
        },
        Mode::HistoryModal => match key.code {
            KeyCode::Esc | KeyCode::Char('h') | KeyCode::Char('q') => {
                (Mode::Normal, Some(UserEvent::Redraw))
            }
            _ => (Mode::HistoryModal, None),
        },
        Mode::QuitModal => match key.code {
            KeyCode::Char('y') | KeyCode::Char('Y') => (Mode::QuitModal, Some(UserEvent::Quit)),
            KeyCode::Char('n') | KeyCode::Char('N') | KeyCode::Esc => {
                (Mode::Normal, Some(UserEvent::Redraw))
            }
            _ => (Mode::QuitModal, None),
        },
    };
    state.mode = mode;
    event
}

fn normal_key(state: &mut UiState, key: KeyEvent) -> (Mode, Option<UserEvent>) {
    match key.code {
        KeyCode::Char('q') | KeyCode::Esc => (Mode::QuitModal, Some(UserEvent::Redraw)),
        KeyCode::Tab => {
            state.focus = match state.focus {
                Focus::Open => Focus::Mine,
                Focus::Mine => Focus::Open,
            };
            (Mode::Normal, Some(UserEvent::Redraw))
        }
        KeyCode::Up | KeyCode::Char('k') => {
            match state.focus {
                Focus::Open => state.open_idx = state.open_idx.saturating_sub(1),
                Focus::Mine => state.mine_idx = state.mine_idx.saturating_sub(1),
            }
            (Mode::Normal, Some(UserEvent::Redraw))
        }
        KeyCode::Down | KeyCode::Char('j') => {
            match state.focus {
                Focus::Open => {
                    if state.open_idx + 1 < state.open_ids.len() {
                        state.open_idx += 1;
                    }
                }
                Focus::Mine => {
                    if state.mine_idx + 1 < state.mine_ids.len() {
                        state.mine_idx += 1;
                    }
                }
            }
            (Mode::Normal, Some(UserEvent::Redraw))
        }
        KeyCode::Char('n') => (
            Mode::CreateModal(CreateState::default()),
            Some(UserEvent::Redraw),
        ),
        KeyCode::Char('a') => match state.open_ids.get(state.open_idx) {
            Some(id) if state.focus == Focus::Open => (
                Mode::ConfirmModal(PendingAction::Accept(id.clone())),
                Some(UserEvent::Redraw),
            ),
            _ => (Mode::Normal, None),
        },
        KeyCode::Char('x') => match state.mine_ids.get(state.mine_idx) {
            Some((id, true)) if state.focus == Focus::Mine => (
                Mode::ConfirmModal(PendingAction::Cancel(id.clone())),
                Some(UserEvent::Redraw),
            ),
            _ => (Mode::Normal, None),
        },
        KeyCode::Char('h') => (Mode::HistoryModal, Some(UserEvent::OpenHistory)),
        KeyCode::Char('r') => (Mode::Normal, Some(UserEvent::Refresh)),
        _ => (Mode::Normal, None),
    }
}

fn create_key(
    state: &UiState,
    mut cs: CreateState,
    key: KeyEvent,
) -> (Mode, Option<UserEvent>) {
    match key.code {
        KeyCode::Esc => return (Mode::Normal, Some(UserEvent::Redraw)),
        KeyCode::Enter => {
            let Some(match_ref) = state.matches.get(cs.match_idx) else {
                return (Mode::CreateModal(cs), None);
            };
            let pick = pick_for(match_ref, cs.side_b);
            let note = cs.note.trim();
            let event = UserEvent::CreateBet {
                match_id: match_ref.id.to_string(),
                pick_id: pick.to_string(),
                amount: cs.amount,
                note: (!note.is_empty()).then(|| note.to_string()),
            };
            return (Mode::Normal, Some(event));
        }
        KeyCode::Tab | KeyCode::Down => cs.field = cs.field.next(),
        KeyCode::BackTab | KeyCode::Up => cs.field = cs.field.prev(),
        KeyCode::Left | KeyCode::Right => {
            let forward = key.code == KeyCode::Right;
            match cs.field {
                CreateField::Match if !state.matches.is_empty() => {
                    let len = state.matches.len();
                    cs.match_idx = if forward {
                        (cs.match_idx + 1) % len
                    } else {
                        (cs.match_idx + len - 1) % len
                    };
                }
                CreateField::Pick => cs.side_b = !cs.side_b,
                CreateField::Amount if forward => cs.amount = cs.amount.saturating_add(10),
                CreateField::Amount => cs.amount = cs.amount.saturating_sub(10),
                _ => return (Mode::CreateModal(cs), None),
            }
        }
        KeyCode::Backspace => match cs.field {
            CreateField::Amount => cs.amount /= 10,
            CreateField::Note => {
                cs.note.pop();
            }
            _ => return (Mode::CreateModal(cs), None),
        },
        KeyCode::Char(c) => match cs.field {
            CreateField::Amount => match c.to_digit(10) {
                Some(d) => {
                    cs.amount = cs
                        .amount
                        .saturating_mul(10)
                        .saturating_add(u64::from(d))
                }
                None => return (Mode::CreateModal(cs), None),
            },
            CreateField::Note => cs.note.push(c),
            _ => return (Mode::CreateModal(cs), None),
        },
        _ => return (Mode::CreateModal(cs), None),
    }
    (Mode::CreateModal(cs), Some(UserEvent::Redraw))
}

fn ui(f: &mut Frame, state: &UiState, snap: &AppSnapshot) {
    f.render_widget(Clear, f.area());
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3), // account
            Constraint::Min(8),    // bet lists
            Constraint::Length(8), // status/errors + help
        ])
        .split(f.area());

    draw_account_panel(f, chunks[0], snap);
    draw_bet_lists(f, state, chunks[1], snap);
    draw_bottom(f, chunks[2], snap);
    draw_modals(f, state, snap);
}

fn draw_account_panel(f: &mut Frame, area: Rect, snap: &AppSnapshot) {
    let mut parts = vec![format!("User: {}", snap.username)];
    match &snap.ledger {
        Some(ledger) => {
            parts.push(format!("Free: {}", ledger.balances.free));
            parts.push(format!("Reserved: {}", ledger.balances.reserved));
            parts.push(format!("Total: {}", ledger.balances.total()));
            parts.push(format!(
                "Updated: {}",
                ledger.fetched_at.format("%H:%M:%S")
            ));
        }
        None => parts.push("Points: loading...".to_string()),
    }
    if snap.creating {
        parts.push("Creating bet...".to_string());
    }
    let stale = snap.ledger.as_ref().is_some_and(|ledger| ledger.is_stale());
    let style = if stale {
        Style::default().fg(Color::Yellow)
    } else {
        Style::default()
    };
    let title = if stale { "Points (offline)" } else { "Points" };
    let widget = Paragraph::new(parts.iter().join(" | "))
        .style(style)
        .block(Block::default().borders(Borders::ALL).title(title));
    f.render_widget(widget, area);
}

fn draw_bet_lists(f: &mut Frame, state: &UiState, area: Rect, snap: &AppSnapshot) {
    let halves = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(55), Constraint::Percentage(45)])
        .split(area);

    let open = bet_table(
        &snap.open_bets,
        "Open Bets",
        state.focus == Focus::Open,
        |row| row.creator.clone(),
    );
    let mut open_state =
        TableState::default().with_selected((!snap.open_bets.is_empty()).then_some(state.open_idx));
    f.render_stateful_widget(open, halves[0], &mut open_state);

    let mine = bet_table(
        &snap.my_bets,
        "My Bets",
        state.focus == Focus::Mine,
        |row| row.status.to_string(),
    );
    let mut mine_state =
        TableState::default().with_selected((!snap.my_bets.is_empty()).then_some(state.mine_idx));
    f.render_stateful_widget(mine, halves[1], &mut mine_state);
}

fn bet_table<'a>(
    rows: &'a [BetRow],
    title: &'a str,
    focused: bool,
    last_column: impl Fn(&BetRow) -> String,
) -> Table<'a> {
    let body: Vec<Row> = rows
        .iter()
        .map(|row| {
            let (last, style) = if row.busy {
                ("working...".to_string(), Style::default().fg(Color::Yellow))
            } else {
                (last_column(row), Style::default())
            };
            Row::new(vec![
                Cell::from(fit(&row.match_title, 22)),
                Cell::from(fit(&row.pick, 14)),
                Cell::from(row.amount.to_string()),
                Cell::from(fit(&last, 14)),
                Cell::from(fit(row.note.as_deref().unwrap_or(""), 20)),
            ])
            .style(style)
        })
        .collect();
    let header = Row::new(vec!["Match", "Pick", "Amount", "", "Note"])
        .style(Style::default().add_modifier(Modifier::BOLD));
    let border = if focused {
        Style::default().fg(Color::Cyan)
    } else {
        Style::default()
    };
    Table::new(
        body,
        [
            Constraint::Length(22),
            Constraint::Length(14),
            Constraint::Length(7),
            Constraint::Length(14),
            Constraint::Min(8),
        ],
    )
    .header(header)
    .row_highlight_style(Style::default().add_modifier(Modifier::REVERSED))
    .block(
        Block::default()
            .borders(Borders::ALL)
            .border_style(border)
            .title(title),
    )
}

fn draw_bottom(f: &mut Frame, area: Rect, snap: &AppSnapshot) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Min(3), Constraint::Length(3)])
        .split(area);

    let status_widget = if snap.errors.is_empty() {
        let mut lines: Vec<Line> = Vec::new();
        if snap.status.trim().is_empty() {
            lines.push(Line::from("Ready"));
        } else {
            for line in snap.status.lines() {
                lines.push(Line::from(line.to_string()));
            }
        }
        Paragraph::new(lines)
            .wrap(Wrap { trim: false })
            .block(Block::default().borders(Borders::ALL).title("Status"))
            .style(Style::default().fg(Color::Green))
    } else {
        let lines: Vec<Line> = snap.errors.iter().map(|e| Line::from(e.clone())).collect();
        Paragraph::new(lines)
            .wrap(Wrap { trim: false })
            .block(Block::default().borders(Borders::ALL).title("Errors"))
            .style(Style::default().fg(Color::Red))
    };
    f.render_widget(status_widget, chunks[0]);

    let help = Paragraph::new(
        "↑/↓ select | Tab switch list | n new bet | a accept | x cancel | h history | r refresh | q/Esc quit",
    )
    .block(Block::default().borders(Borders::ALL).title("Help"));
    f.render_widget(help, chunks[1]);
}

fn draw_modals(f: &mut Frame, state: &UiState, snap: &AppSnapshot) {
    match &state.mode {
        Mode::CreateModal(cs) => {
            let area = centered_rect(60, 50, f.area());
            let block = Block::default().borders(Borders::ALL).title("New Bet");
            let cursor = |field: CreateField| if cs.field == field { ">" } else { " " };
            let mut lines = Vec::new();
            match state.matches.get(cs.match_idx) {
                Some(m) => {
                    let pick = if cs.side_b { &m.side_b } else { &m.side_a };
                    lines.push(Line::from(format!(
                        "{} Match:  ◀ {} ▶",
                        cursor(CreateField::Match),
                        m.title()
                    )));
                    lines.push(Line::from(format!(
                        "{} Pick:   ◀ {} ▶",
                        cursor(CreateField::Pick),
                        pick.name
                    )));
                }
                None => lines.push(Line::from("  No upcoming matches")),
            }
            lines.push(Line::from(format!(
                "{} Amount: {}",
                cursor(CreateField::Amount),
                cs.amount
            )));
            lines.push(Line::from(format!(
                "{} Note:   {}",
                cursor(CreateField::Note),
                cs.note
            )));
            if let Some(ledger) = &snap.ledger {
                lines.push(Line::from(format!("  Free points: {}", ledger.balances.free)));
            }
            lines.push(Line::from(""));
            lines.push(Line::from(
                "Enter=create Esc=cancel Tab/↑/↓ field ←/→ change digits amount",
            ));
            f.render_widget(Clear, area);
            f.render_widget(block.clone(), area);
            f.render_widget(Paragraph::new(lines), block.inner(area));
        }
        Mode::ConfirmModal(action) => {
            let area = centered_rect(50, 20, f.area());
            let (title, verb, id) = match action {
                PendingAction::Accept(id) => ("Accept Bet", "Accept", id),
                PendingAction::Cancel(id) => ("Cancel Bet", "Cancel", id),
            };
            let summary = snap
                .open_bets
                .iter()
                .chain(snap.my_bets.iter())
                .find(|row| &row.id == id)
                .map(|row| format!("{} on {} for {} points", row.pick, row.match_title, row.amount))
                .unwrap_or_else(|| id.to_string());
            let block = Block::default().borders(Borders::ALL).title(title);
            let p = Paragraph::new(format!("{verb} {summary}? (Y/N)")).wrap(Wrap { trim: true });
            f.render_widget(Clear, area);
            f.render_widget(block.clone(), area);
            f.render_widget(p, block.inner(area));
        }
        Mode::HistoryModal => {
            let area = centered_rect(70, 60, f.area());
            let block = Block::default()
                .borders(Borders::ALL)
                .title("Points History");
            let lines: Vec<Line> = if snap.history.is_empty() {
                vec![Line::from("No transactions")]
            } else {
                snap.history
                    .iter()
                    .map(|tx| {
                        let cells = [
                            tx.created_at.format("%Y-%m-%d %H:%M").to_string(),
                            format!("{:+}", tx.amount),
                            transaction_label(tx.kind).to_string(),
                            tx.bet_id.as_ref().map(ToString::to_string).unwrap_or_default(),
                        ];
                        Line::from(cells.iter().join("  "))
                    })
                    .collect()
            };
            f.render_widget(Clear, area);
            f.render_widget(block.clone(), area);
            f.render_widget(Paragraph::new(lines), block.inner(area));
        }
        Mode::QuitModal => {
            let area = centered_rect(40, 20, f.area());
            let block = Block::default().borders(Borders::ALL).title("Confirm Quit");
            let p = Paragraph::new("Quit? (Y/N)");
            f.render_widget(Clear, area);
            f.render_widget(block.clone(), area);
            f.render_widget(p, block.inner(area));
        }
        Mode::Normal => {}
    }
}

fn transaction_label(kind: TransactionKind) -> &'static str {
    match kind {
        TransactionKind::Grant => "grant",
        TransactionKind::Reserve => "reserved",
        TransactionKind::Release => "released",
        TransactionKind::Payout => "payout",
        TransactionKind::Forfeit => "forfeit",
    }
}

fn centered_rect(w_percent: u16, h_percent: u16, r: Rect) -> Rect {
    let popup_layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage((100 - h_percent) / 2),
            Constraint::Percentage(h_percent),
            Constraint::Percentage((100 - h_percent) / 2),
        ])
        .split(r);

    let horizontal = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100 - w_percent) / 2),
            Constraint::Percentage(w_percent),
            Constraint::Percentage((100 - w_percent) / 2),
        ])
        .split(popup_layout[1]);

    horizontal[1]
}

/// Cuts `text` to `width` display columns, marking the cut with an ellipsis.
fn fit(text: &str, width: usize) -> String {
    let total: usize = text.chars().map(|c| c.width().unwrap_or(0)).sum();
    if total <= width {
        return text.to_string();
    }
    let mut out = String::new();
    let mut used = 0;
    for c in text.chars() {
        let w = c.width().unwrap_or(0);
        if used + w + 1 > width {
            break;
        }
        used += w;
        out.push(c);
    }
    out.push('…');
    out
}

fn pick_for(match_ref: &MatchRef, side_b: bool) -> &PickId {
    if side_b {
        &match_ref.side_b.id
    } else {
        &match_ref.side_a.id
    }
}
