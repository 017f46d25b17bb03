use crate::{
    backend::{
        BetApi,
        LedgerApi,
        MatchApi,
    },
    cache::CacheKey,
    controller::{
        ActionKey,
        BetController,
        CreateBetRequest,
        NotificationKind,
    },
    ledger::{
        LedgerSnapshot,
        LedgerSupervisor,
    },
    types::{
        BetId,
        BetStatus,
        MatchId,
        MatchRef,
        PickId,
        PointsTransaction,
        StraightBet,
        UserId,
    },
    ui,
};
use color_eyre::eyre::{
    Result,
    WrapErr,
};
use std::time::Duration;
use tokio::{
    task::JoinSet,
    time,
};
use tracing::{
    debug,
    error,
    info,
    warn,
};

const HISTORY_LIMIT: usize = 50;
const MAX_ERRORS: usize = 50;

/// One rendered line of a bet list.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BetRow {
    pub id: BetId,
    pub match_title: String,
    pub pick: String,
    pub creator: String,
    pub amount: u64,
    pub status: BetStatus,
    pub note: Option<String>,
    pub cancellable: bool,
    /// An accept or cancel of this bet is in flight.
    pub busy: bool,
}

/// Everything the UI draws in one frame.
#[derive(Clone, Debug, Default)]
pub struct AppSnapshot {
    pub username: String,
    pub ledger: Option<LedgerSnapshot>,
    pub open_bets: Vec<BetRow>,
    pub my_bets: Vec<BetRow>,
    pub matches: Vec<MatchRef>,
    pub history: Vec<PointsTransaction>,
    pub status: String,
    pub errors: Vec<String>,
    pub creating: bool,
}

/// Outcome of work run off the UI loop.
enum Completion {
    Action(ActionKey),
    Lists {
        matches: Option<Vec<MatchRef>>,
        failures: Vec<String>,
        requested: bool,
    },
    History(std::result::Result<Vec<PointsTransaction>, String>),
}

pub struct AppController<B, L, M> {
    bets: BetController<B, L, M>,
    poll_interval: Duration,
    status: String,
    errors: Vec<String>,
    matches: Vec<MatchRef>,
    history: Vec<PointsTransaction>,
    lists_pending: bool,
}

impl<B, L, M> AppController<B, L, M>
where
    B: BetApi,
    L: LedgerApi,
    M: MatchApi,
{
    pub fn new(bets: BetController<B, L, M>, poll_interval: Duration) -> Self {
        Self {
            bets,
            poll_interval,
            status: String::new(),
            errors: Vec::new(),
            matches: Vec::new(),
            history: Vec::new(),
            lists_pending: false,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    fn set_status(&mut self, message: impl Into<String>) {
        self.status = message.into();
        self.errors.clear();
    }

    fn push_errors(&mut self, mut items: Vec<String>) {
        if items.is_empty() {
            return;
        }
        for item in &items {
            error!("{}", item);
        }
        self.errors.append(&mut items);
        if self.errors.len() > MAX_ERRORS {
            let drain = self.errors.len() - MAX_ERRORS;
            self.errors.drain(0..drain);
        }
    }

    /// Re-reads both bet lists and the upcoming matches in place.
    pub async fn refresh_lists(&mut self) {
        let done = fetch_lists(self.bets.clone(), false).await;
        self.apply(done);
    }

    /// Starts a list refresh unless one is still running.
    fn spawn_lists(&mut self, requested: bool, tasks: &mut JoinSet<Completion>) {
        if self.lists_pending {
            debug!("list refresh still in flight, skipping");
            return;
        }
        self.lists_pending = true;
        tasks.spawn(fetch_lists(self.bets.clone(), requested));
    }

    /// Starts a bet action. Only its own control shows as busy meanwhile.
    fn spawn_action(&self, action: BetAction, tasks: &mut JoinSet<Completion>) {
        let bets = self.bets.clone();
        tasks.spawn(async move {
            let key = action.key();
            let result = match action {
                BetAction::Create(request) => bets.create_bet(request).await.map(|_| ()),
                BetAction::Accept(id) => bets.accept_bet(&id).await,
                BetAction::Cancel(id) => bets.cancel_bet(&id).await,
            };
            if let Err(err) = result {
                debug!(action = %key, %err, "bet action ended with an error");
            }
            Completion::Action(key)
        });
    }

    fn apply(&mut self, done: Completion) {
        match done {
            Completion::Action(key) => debug!(action = %key, "bet action finished"),
            Completion::Lists {
                matches,
                failures,
                requested,
            } => {
                self.lists_pending = false;
                if let Some(matches) = matches {
                    self.matches = matches;
                }
                if requested && failures.is_empty() {
                    self.set_status("Refreshed");
                }
                self.push_errors(failures);
            }
            Completion::History(Ok(history)) => self.history = history,
            Completion::History(Err(err)) => self.push_errors(vec![format!("History: {err}")]),
        }
        self.sync_notifications();
    }

    /// Mirrors the controller's latest notification into the status panel.
    fn sync_notifications(&mut self) {
        let Some(latest) = self.bets.notifications().pop() else {
            return;
        };
        match latest.kind {
            NotificationKind::Success => self.set_status(latest.message),
            NotificationKind::Error => self.push_errors(vec![latest.message]),
        }
        self.bets.clear_notifications();
    }

    pub async fn build_snapshot(&self) -> AppSnapshot {
        let session = self.bets.sessions().current();
        let me = session.as_ref().map(|s| s.user_id.clone());
        let open = self
            .bets
            .bets()
            .cached(&CacheKey::open())
            .await
            .unwrap_or_default();
        let mine = match &me {
            Some(user) => self
                .bets
                .bets()
                .cached(&CacheKey::User(user.clone(), None))
                .await
                .unwrap_or_default(),
            None => Vec::new(),
        };

        let mut open_bets = Vec::with_capacity(open.len());
        for bet in &open {
            open_bets.push(self.bet_row(bet, None).await);
        }
        let mut my_bets = Vec::with_capacity(mine.len());
        for bet in &mine {
            my_bets.push(self.bet_row(bet, me.as_ref()).await);
        }

        AppSnapshot {
            username: session.map(|s| s.username).unwrap_or_default(),
            ledger: self.bets.ledger().current(),
            open_bets,
            my_bets,
            matches: self.matches.clone(),
            history: self.history.clone(),
            status: self.status.clone(),
            errors: self.errors.clone(),
            creating: self.bets.phase(&ActionKey::Create).is_busy(),
        }
    }

    /// `viewer` picks whose side is shown; `None` shows the creator's.
    async fn bet_row(&self, bet: &StraightBet, viewer: Option<&UserId>) -> BetRow {
        let lookup = self.bets.matches();
        let pick = match viewer {
            Some(user) if !bet.is_created_by(user) => bet
                .acceptors_pick_id
                .as_ref()
                .unwrap_or(&bet.creators_pick_id),
            _ => &bet.creators_pick_id,
        };
        let match_title = lookup
            .sides(&bet.match_id)
            .await
            .map(|m| m.title())
            .unwrap_or_else(|| bet.match_id.to_string());
        let busy = self.bets.phase(&ActionKey::Accept(bet.id.clone())).is_busy()
            || self.bets.phase(&ActionKey::Cancel(bet.id.clone())).is_busy();
        BetRow {
            id: bet.id.clone(),
            match_title,
            pick: lookup.resolve_pick_name(&bet.match_id, pick).await,
            creator: bet.creator_username.clone(),
            amount: bet.amount,
            status: bet.status,
            note: bet.note.clone(),
            cancellable: viewer.is_some_and(|user| bet.is_created_by(user)) && bet.is_open(),
            busy,
        }
    }

    /// Dispatches `event`; anything touching the backend runs on `tasks`.
    fn handle(&mut self, event: ui::UserEvent, tasks: &mut JoinSet<Completion>) {
        match event {
            ui::UserEvent::CreateBet {
                match_id,
                pick_id,
                amount,
                note,
            } => {
                let request = CreateBetRequest {
                    match_id: MatchId::new(match_id),
                    pick_id: PickId::new(pick_id),
                    amount: Some(i64::try_from(amount).unwrap_or(i64::MAX)),
                    note,
                };
                self.spawn_action(BetAction::Create(request), tasks);
            }
            ui::UserEvent::AcceptBet(id) => self.spawn_action(BetAction::Accept(id), tasks),
            ui::UserEvent::CancelBet(id) => self.spawn_action(BetAction::Cancel(id), tasks),
            ui::UserEvent::OpenHistory => {
                let ledger = self.bets.ledger().clone();
                tasks.spawn(async move {
                    Completion::History(
                        ledger
                            .history(HISTORY_LIMIT)
                            .await
                            .map_err(|err| err.to_string()),
                    )
                });
            }
            ui::UserEvent::Refresh => self.spawn_lists(true, tasks),
            ui::UserEvent::Quit | ui::UserEvent::Redraw => {}
        }
    }
}

enum BetAction {
    Create(CreateBetRequest),
    Accept(BetId),
    Cancel(BetId),
}

impl BetAction {
    fn key(&self) -> ActionKey {
        match self {
            BetAction::Create(_) => ActionKey::Create,
            BetAction::Accept(id) => ActionKey::Accept(id.clone()),
            BetAction::Cancel(id) => ActionKey::Cancel(id.clone()),
        }
    }
}

/// `requested` marks a refresh the user asked for; it also re-reads points.
async fn fetch_lists<B, L, M>(bets: BetController<B, L, M>, requested: bool) -> Completion
where
    B: BetApi,
    L: LedgerApi,
    M: MatchApi,
{
    let limit = bets.list_limit();
    let mut failures = Vec::new();
    if requested {
        if let Err(err) = bets.ledger().refresh().await {
            failures.push(format!("Points: {err}"));
        }
    }
    if let Err(err) = bets.bets().list_open(limit).await {
        failures.push(format!("Open bets: {err}"));
    }
    if let Some(session) = bets.sessions().current() {
        if let Err(err) = bets
            .bets()
            .list_by_user(&session.user_id, None, limit)
            .await
        {
            failures.push(format!("My bets: {err}"));
        }
    }
    let matches = match bets.matches().upcoming(limit).await {
        Ok(matches) => Some(matches),
        Err(err) => {
            failures.push(format!("Matches: {err}"));
            None
        }
    };
    Completion::Lists {
        matches,
        failures,
        requested,
    }
}

fn busy_message(event: &ui::UserEvent) -> Option<&'static str> {
    match event {
        ui::UserEvent::CreateBet { .. } => Some("Creating bet..."),
        ui::UserEvent::AcceptBet(_) => Some("Accepting bet..."),
        ui::UserEvent::CancelBet(_) => Some("Cancelling bet..."),
        ui::UserEvent::Refresh => Some("Refreshing..."),
        _ => None,
    }
}

pub async fn run_app<B, L, M>(controller: AppController<B, L, M>) -> Result<()>
where
    B: BetApi,
    L: LedgerApi,
    M: MatchApi,
{
    let mut ui_state = ui::UiState::default();
    let mut input_events = ui::input_event_stream();

    info!("Starting UI");
    ui::terminal_enter(&mut ui_state)?;
    let res = run_loop(controller, &mut ui_state, &mut input_events).await;
    ui::terminal_exit()?;
    res
}

async fn run_loop<B, L, M>(
    mut controller: AppController<B, L, M>,
    ui_state: &mut ui::UiState,
    input_events: &mut ui::InputEventReceiver,
) -> Result<()>
where
    B: BetApi,
    L: LedgerApi,
    M: MatchApi,
{
    info!("Running app loop");
    let ledger = controller.bets.ledger().clone();
    let supervisor = LedgerSupervisor::spawn(ledger.clone(), controller.poll_interval());
    let mut ledger_rx = ledger.subscribe();
    let mut session_rx = controller.bets.sessions().subscribe();
    let mut phases_rx = controller.bets.subscribe_phases();
    let mut list_ticker = time::interval(controller.poll_interval());
    let mut tasks: JoinSet<Completion> = JoinSet::new();

    loop {
        tokio::select! {
            changed = ledger_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = controller.build_snapshot().await;
                ui::draw(ui_state, &snapshot).wrap_err("draw after balance update failed")?;
            }
            changed = session_rx.changed() => {
                if changed.is_err() || session_rx.borrow_and_update().is_none() {
                    info!("session ended, leaving UI");
                    break;
                }
                // balances for the new user come from the supervisor
                controller.spawn_lists(false, &mut tasks);
                let snapshot = controller.build_snapshot().await;
                ui::draw(ui_state, &snapshot).wrap_err("draw after session change failed")?;
            }
            changed = phases_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = controller.build_snapshot().await;
                ui::draw(ui_state, &snapshot).wrap_err("draw after phase change failed")?;
            }
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                match joined {
                    Ok(done) => controller.apply(done),
                    Err(err) => {
                        warn!(%err, "background task failed");
                        controller.lists_pending = false;
                    }
                }
                let snapshot = controller.build_snapshot().await;
                ui::draw(ui_state, &snapshot).wrap_err("draw after background work failed")?;
            }
            _ = list_ticker.tick() => controller.spawn_lists(false, &mut tasks),
            _ = tokio::signal::ctrl_c() => break,
            raw_ev = ui::next_raw_event(input_events) => {
                let event = raw_ev?;
                let Some(ev) = ui::interpret_event(ui_state, event) else {
                    continue;
                };
                if matches!(ev, ui::UserEvent::Quit) {
                    break;
                }
                if let Some(message) = busy_message(&ev) {
                    controller.set_status(message);
                }
                controller.handle(ev, &mut tasks);
                let snapshot = controller.build_snapshot().await;
                ui::draw(ui_state, &snapshot).wrap_err("draw after input failed")?;
            }
        }
    }

    if !tasks.is_empty() {
        info!(pending = tasks.len(), "abandoning unfinished backend calls");
    }
    tasks.abort_all();
    supervisor.shutdown();
    supervisor.stopped().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;
    use crate::{
        backend::in_memory::InMemoryBackend,
        controller::Phase,
        session::SessionStore,
    };

    type DemoApp = AppController<InMemoryBackend, InMemoryBackend, InMemoryBackend>;

    async fn demo_app() -> (InMemoryBackend, DemoApp) {
        let (backend, session) = InMemoryBackend::demo().await;
        let sessions = SessionStore::with_session(session);
        let bets = BetController::new(
            sessions,
            backend.clone(),
            backend.clone(),
            backend.clone(),
            50,
        );
        (backend, AppController::new(bets, Duration::from_secs(10)))
    }

    async fn finish_all(app: &mut DemoApp, tasks: &mut JoinSet<Completion>) {
        while let Some(joined) = tasks.join_next().await {
            app.apply(joined.unwrap());
        }
    }

    fn create_event(amount: u64) -> ui::UserEvent {
        ui::UserEvent::CreateBet {
            match_id: "m-2".to_string(),
            pick_id: "t-storm".to_string(),
            amount,
            note: None,
        }
    }

    #[tokio::test]
    async fn build_snapshot__resolves_pick_names_for_open_bets() {
        // given
        let (_backend, mut app) = demo_app().await;

        // when
        app.refresh_lists().await;
        let snapshot = app.build_snapshot().await;

        // then
        assert_eq!(snapshot.open_bets.len(), 2);
        let picks: Vec<_> = snapshot.open_bets.iter().map(|r| r.pick.as_str()).collect();
        assert!(picks.contains(&"Lions"));
        assert!(picks.contains(&"Nyra"));
        assert!(snapshot.open_bets.iter().all(|r| !r.cancellable && !r.busy));
        assert_eq!(snapshot.matches.len(), 3);
    }

    #[tokio::test]
    async fn handle__accepting_own_bet_shows_error_and_no_status_change() {
        // given
        let (_backend, mut app) = demo_app().await;
        let mut tasks = JoinSet::new();
        app.handle(create_event(50), &mut tasks);
        finish_all(&mut app, &mut tasks).await;
        let snapshot = app.build_snapshot().await;
        let own = snapshot.my_bets.first().unwrap().clone();
        assert!(own.cancellable);

        // when
        app.handle(ui::UserEvent::AcceptBet(own.id), &mut tasks);
        finish_all(&mut app, &mut tasks).await;

        // then
        let snapshot = app.build_snapshot().await;
        assert_eq!(snapshot.errors, vec!["You cannot accept your own bet".to_string()]);
        assert_eq!(snapshot.status, "Bet of 50 points created");
    }

    #[tokio::test]
    async fn handle__stalled_submission_only_marks_its_own_control_busy() {
        // given
        let (backend, mut app) = demo_app().await;
        app.refresh_lists().await;
        backend.hold_mutations(true).await;
        let mut tasks = JoinSet::new();

        // when
        app.handle(create_event(50), &mut tasks);
        time::timeout(Duration::from_secs(2), async {
            while app.bets.phase(&ActionKey::Create) != Phase::Submitting {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("create should reach the backend");

        // then
        let snapshot = app.build_snapshot().await;
        assert!(snapshot.creating);
        assert!(snapshot.open_bets.iter().all(|row| !row.busy));
        assert_eq!(tasks.len(), 1);

        app.handle(ui::UserEvent::Refresh, &mut tasks);
        let refreshed = time::timeout(Duration::from_secs(2), tasks.join_next())
            .await
            .expect("reads keep flowing while a submission is stalled")
            .unwrap()
            .unwrap();
        assert!(matches!(refreshed, Completion::Lists { .. }));
        app.apply(refreshed);

        backend.hold_mutations(false).await;
        finish_all(&mut app, &mut tasks).await;
        let snapshot = app.build_snapshot().await;
        assert!(!snapshot.creating);
        assert_eq!(snapshot.status, "Bet of 50 points created");
    }

    #[tokio::test]
    async fn handle__refresh_is_not_started_twice() {
        // given
        let (_backend, mut app) = demo_app().await;
        let mut tasks = JoinSet::new();

        // when
        app.handle(ui::UserEvent::Refresh, &mut tasks);
        app.handle(ui::UserEvent::Refresh, &mut tasks);

        // then
        assert_eq!(tasks.len(), 1);
        finish_all(&mut app, &mut tasks).await;
        assert_eq!(app.build_snapshot().await.status, "Refreshed");
    }
}
