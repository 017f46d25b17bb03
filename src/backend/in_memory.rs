//! Process-local stand-in for the hosted backend.
//!
//! Reproduces the contract of the remote atomic procedures: free/reserved
//! escrow moves, status transitions, and correlation-id idempotency. Used by
//! offline mode and by tests.

use crate::{
    backend::{
        AcceptBetCall,
        BetApi,
        CreateBetCall,
        DeleteBetCall,
        LedgerApi,
        MatchApi,
    },
    error::{
        Error,
        Result,
    },
    session::Session,
    types::{
        Balances,
        BetId,
        BetStatus,
        Competitors,
        CorrelationId,
        MatchId,
        MatchRef,
        PickId,
        PointsTransaction,
        Side,
        StraightBet,
        TransactionKind,
        UserId,
    },
};
use chrono::{
    Duration,
    Utc,
};
use std::{
    collections::HashMap,
    sync::Arc,
};
use tokio::sync::{
    Mutex,
    Notify,
};

/// A mutating call as the backend received it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecordedCall {
    Create(CreateBetCall),
    Accept(AcceptBetCall),
    Delete(DeleteBetCall),
}

impl RecordedCall {
    pub fn event_id(&self) -> CorrelationId {
        match self {
            RecordedCall::Create(call) => call.event_id,
            RecordedCall::Accept(call) => call.event_id,
            RecordedCall::Delete(call) => call.event_id,
        }
    }
}

#[derive(Default)]
struct State {
    balances: HashMap<UserId, Balances>,
    usernames: HashMap<UserId, String>,
    bets: Vec<StraightBet>,
    matches: Vec<MatchRef>,
    transactions: Vec<PointsTransaction>,
    completed_events: HashMap<CorrelationId, BetId>,
    calls: Vec<RecordedCall>,
    offline: bool,
    held: bool,
    reads: usize,
}

#[derive(Clone, Default)]
pub struct InMemoryBackend {
    state: Arc<Mutex<State>>,
    released: Arc<Notify>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Two users, three matches and a few open bets from the rival.
    pub async fn demo() -> (Self, Session) {
        let backend = Self::new();
        let me = UserId::new("demo-user");
        let rival = UserId::new("demo-rival");
        for (user, name) in [(&me, "you"), (&rival, "rival")] {
            if let Err(err) = backend.add_user(user.clone(), name, 1_000).await {
                tracing::warn!(%err, "failed to seed demo user");
            }
        }

        let fixtures = [
            ("m-1", Competitors::Teams, ("t-lions", "Lions"), ("t-bears", "Bears")),
            ("m-2", Competitors::Teams, ("t-storm", "Storm"), ("t-comets", "Comets")),
            ("m-3", Competitors::Players, ("p-vex", "Vex"), ("p-nyra", "Nyra")),
        ];
        for (offset, (id, competitors, a, b)) in fixtures.into_iter().enumerate() {
            backend
                .add_match(MatchRef {
                    id: MatchId::new(id),
                    competitors,
                    side_a: Side {
                        id: PickId::new(a.0),
                        name: a.1.to_string(),
                    },
                    side_b: Side {
                        id: PickId::new(b.0),
                        name: b.1.to_string(),
                    },
                    starts_at: Some(Utc::now() + Duration::hours(offset as i64 + 1)),
                })
                .await;
        }

        for (match_id, pick, amount) in
            [("m-1", "t-lions", 100), ("m-3", "p-nyra", 250)]
        {
            let call = CreateBetCall {
                user_id: rival.clone(),
                bet_id: BetId::new(uuid::Uuid::new_v4().to_string()),
                match_id: MatchId::new(match_id),
                picks_id: PickId::new(pick),
                amount,
                note: Some("come at me".to_string()),
                event_id: CorrelationId::fresh(),
            };
            if let Err(err) = backend.create_straight_bet(call).await {
                tracing::warn!(%err, "failed to seed demo bet");
            }
        }
        backend.state.lock().await.calls.clear();

        let session = Session::new(me, "you", "offline");
        (backend, session)
    }

    pub async fn add_user(&self, id: UserId, username: &str, free_points: u64) -> Result<()> {
        let grant = signed(free_points)?;
        let mut state = self.state.lock().await;
        state.usernames.insert(id.clone(), username.to_string());
        state.balances.insert(id.clone(), Balances::new(free_points, 0));
        record_transaction(&mut state, &id, grant, TransactionKind::Grant, None, None);
        Ok(())
    }

    pub async fn add_match(&self, match_ref: MatchRef) {
        self.state.lock().await.matches.push(match_ref);
    }

    /// Simulates the backend becoming unreachable (or reachable again).
    pub async fn set_offline(&self, offline: bool) {
        self.state.lock().await.offline = offline;
    }

    /// While held, mutating calls wait before touching state, like a stalled
    /// request.
    pub async fn hold_mutations(&self, held: bool) {
        self.state.lock().await.held = held;
        if !held {
            self.released.notify_waiters();
        }
    }

    async fn wait_until_released(&self) {
        loop {
            let released = self.released.notified();
            if !self.state.lock().await.held {
                return;
            }
            released.await;
        }
    }

    /// Mutating calls received so far, in order.
    pub async fn calls(&self) -> Vec<RecordedCall> {
        self.state.lock().await.calls.clone()
    }

    /// Number of read queries served.
    pub async fn read_count(&self) -> usize {
        self.state.lock().await.reads
    }

    pub async fn balances_of(&self, user: &UserId) -> Option<Balances> {
        self.state.lock().await.balances.get(user).copied()
    }

    /// Settles an accepted bet the way the external result feed does.
    pub async fn settle(&self, bet_id: &BetId, winner: &UserId) -> Result<()> {
        let mut state = self.state.lock().await;
        let bet = find_bet(&state, bet_id)?.clone();
        if !bet.status.can_transition_to(BetStatus::Completed) {
            return Err(reject(format!("Bet is {} and cannot be settled", bet.status)));
        }
        let acceptor = bet
            .acceptor_id
            .clone()
            .ok_or_else(|| reject("Bet has no acceptor"))?;
        let loser = if winner == &bet.creator_id {
            acceptor
        } else if winner == &acceptor {
            bet.creator_id.clone()
        } else {
            return Err(reject("Winner is not part of this bet"));
        };

        let stake = signed(bet.amount)?;
        let payout = bet
            .amount
            .checked_mul(2)
            .ok_or_else(|| reject("Payout is out of range"))
            .and_then(signed)?;
        let winner_after = balance_of(&state, winner)?
            .payout(bet.amount)
            .ok_or_else(|| reject("Winner reservation is inconsistent"))?;
        let loser_after = balance_of(&state, &loser)?
            .forfeit(bet.amount)
            .ok_or_else(|| reject("Loser reservation is inconsistent"))?;
        state.balances.insert(winner.clone(), winner_after);
        state.balances.insert(loser.clone(), loser_after);
        record_transaction(&mut state, winner, payout, TransactionKind::Payout, Some(bet_id), None);
        record_transaction(
            &mut state,
            &loser,
            -stake,
            TransactionKind::Forfeit,
            Some(bet_id),
            None,
        );

        let now = Utc::now();
        let row = find_bet_mut(&mut state, bet_id)?;
        row.status = BetStatus::Completed;
        row.winner_user_id = Some(winner.clone());
        row.completed_at = Some(now);
        row.updated_at = Some(now);
        Ok(())
    }

    async fn read<T>(&self, f: impl FnOnce(&State) -> T) -> Result<T> {
        let mut state = self.state.lock().await;
        if state.offline {
            return Err(Error::transport("in-memory backend is offline"));
        }
        state.reads += 1;
        Ok(f(&*state))
    }
}

fn reject(message: impl Into<String>) -> Error {
    Error::RemoteRejected(message.into())
}

/// Ledger entries are signed; amounts past `i64::MAX` cannot be recorded.
fn signed(amount: u64) -> Result<i64> {
    i64::try_from(amount).map_err(|_| reject(format!("Amount {amount} is out of range")))
}

fn find_bet<'a>(state: &'a State, id: &BetId) -> Result<&'a StraightBet> {
    state
        .bets
        .iter()
        .find(|bet| &bet.id == id)
        .ok_or_else(|| reject("Bet not found"))
}

fn find_bet_mut<'a>(state: &'a mut State, id: &BetId) -> Result<&'a mut StraightBet> {
    state
        .bets
        .iter_mut()
        .find(|bet| &bet.id == id)
        .ok_or_else(|| reject("Bet not found"))
}

fn balance_of(state: &State, user: &UserId) -> Result<Balances> {
    state
        .balances
        .get(user)
        .copied()
        .ok_or_else(|| reject("User has no points account"))
}

fn record_transaction(
    state: &mut State,
    user: &UserId,
    amount: i64,
    kind: TransactionKind,
    bet_id: Option<&BetId>,
    event_id: Option<CorrelationId>,
) {
    let id = format!("tx-{}", state.transactions.len() + 1);
    state.transactions.push(PointsTransaction {
        id,
        user_id: user.clone(),
        amount,
        kind,
        bet_id: bet_id.cloned(),
        event_id,
        created_at: Utc::now(),
    });
}

/// Newest first; insertion order breaks timestamp ties.
fn newest_first<'a>(bets: impl DoubleEndedIterator<Item = &'a StraightBet>) -> Vec<StraightBet> {
    let mut rows: Vec<StraightBet> = bets.rev().cloned().collect();
    rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    rows
}

impl LedgerApi for InMemoryBackend {
    async fn balances(&self, user: &UserId) -> Result<Balances> {
        self.read(|state| state.balances.get(user).copied())
            .await?
            .ok_or_else(|| reject("User has no points account"))
    }

    async fn transactions(
        &self,
        user: &UserId,
        limit: usize,
    ) -> Result<Vec<PointsTransaction>> {
        self.read(|state| {
            state
                .transactions
                .iter()
                .rev()
                .filter(|tx| &tx.user_id == user)
                .take(limit)
                .cloned()
                .collect()
        })
        .await
    }
}

impl BetApi for InMemoryBackend {
    async fn bets_by_status(
        &self,
        status: BetStatus,
        limit: usize,
    ) -> Result<Vec<StraightBet>> {
        self.read(|state| {
            let mut rows = newest_first(state.bets.iter().filter(|b| b.status == status));
            rows.truncate(limit);
            rows
        })
        .await
    }

    async fn bets_by_match(
        &self,
        match_id: &MatchId,
        limit: usize,
    ) -> Result<Vec<StraightBet>> {
        self.read(|state| {
            let mut rows =
                newest_first(state.bets.iter().filter(|b| &b.match_id == match_id));
            rows.truncate(limit);
            rows
        })
        .await
    }

    async fn bets_by_user(
        &self,
        user: &UserId,
        status: Option<BetStatus>,
        limit: usize,
    ) -> Result<Vec<StraightBet>> {
        self.read(|state| {
            let mut rows = newest_first(state.bets.iter().filter(|b| {
                b.involves(user) && status.is_none_or(|s| b.status == s)
            }));
            rows.truncate(limit);
            rows
        })
        .await
    }

    async fn bet(&self, id: &BetId) -> Result<Option<StraightBet>> {
        self.read(|state| state.bets.iter().find(|b| &b.id == id).cloned())
            .await
    }

    async fn create_straight_bet(&self, call: CreateBetCall) -> Result<StraightBet> {
        self.wait_until_released().await;
        let mut state = self.state.lock().await;
        if state.offline {
            return Err(Error::transport("in-memory backend is offline"));
        }
        state.calls.push(RecordedCall::Create(call.clone()));
        if let Some(existing) = state.completed_events.get(&call.event_id).cloned() {
            return find_bet(&state, &existing).cloned();
        }
        if call.amount == 0 {
            return Err(reject("Amount must be positive"));
        }
        let stake = signed(call.amount)?;
        let match_ref = state
            .matches
            .iter()
            .find(|m| m.id == call.match_id)
            .ok_or_else(|| reject("Match not found"))?;
        if match_ref.side(&call.picks_id).is_none() {
            return Err(reject("Pick does not belong to this match"));
        }
        if state.bets.iter().any(|b| b.id == call.bet_id) {
            return Err(reject("Bet id already exists"));
        }
        let reserved = balance_of(&state, &call.user_id)?
            .reserve(call.amount)
            .ok_or_else(|| reject("Insufficient points"))?;

        let now = Utc::now();
        let bet = StraightBet {
            id: call.bet_id.clone(),
            creator_id: call.user_id.clone(),
            creator_username: state
                .usernames
                .get(&call.user_id)
                .cloned()
                .unwrap_or_default(),
            match_id: call.match_id.clone(),
            creators_pick_id: call.picks_id.clone(),
            amount: call.amount,
            note: call.note.clone(),
            status: BetStatus::Open,
            acceptor_id: None,
            acceptor_username: None,
            acceptors_pick_id: None,
            winner_user_id: None,
            created_at: now,
            updated_at: Some(now),
            accepted_at: None,
            completed_at: None,
        };
        state.balances.insert(call.user_id.clone(), reserved);
        record_transaction(
            &mut state,
            &call.user_id,
            -stake,
            TransactionKind::Reserve,
            Some(&call.bet_id),
            Some(call.event_id),
        );
        state.bets.push(bet.clone());
        state
            .completed_events
            .insert(call.event_id, call.bet_id.clone());
        Ok(bet)
    }

    async fn accept_straight_bet(&self, call: AcceptBetCall) -> Result<()> {
        self.wait_until_released().await;
        let mut state = self.state.lock().await;
        if state.offline {
            return Err(Error::transport("in-memory backend is offline"));
        }
        state.calls.push(RecordedCall::Accept(call.clone()));
        if state.completed_events.contains_key(&call.event_id) {
            return Ok(());
        }
        let bet = find_bet(&state, &call.bet_id)?.clone();
        if bet.status != BetStatus::Open {
            return Err(reject("Bet is not open"));
        }
        if bet.creator_id == call.user_id {
            return Err(reject("Cannot accept your own bet"));
        }
        let opposite_ok = state
            .matches
            .iter()
            .find(|m| m.id == bet.match_id)
            .map(|m| {
                m.side(&call.acceptors_pick_id).is_some()
                    && call.acceptors_pick_id != bet.creators_pick_id
            })
            .unwrap_or(false);
        if !opposite_ok {
            return Err(reject("Acceptor must take the opposing side"));
        }
        let stake = signed(bet.amount)?;
        let reserved = balance_of(&state, &call.user_id)?
            .reserve(bet.amount)
            .ok_or_else(|| reject("Insufficient points"))?;
        state.balances.insert(call.user_id.clone(), reserved);
        record_transaction(
            &mut state,
            &call.user_id,
            -stake,
            TransactionKind::Reserve,
            Some(&call.bet_id),
            Some(call.event_id),
        );

        let username = state.usernames.get(&call.user_id).cloned();
        let now = Utc::now();
        let row = find_bet_mut(&mut state, &call.bet_id)?;
        row.status = BetStatus::WaitingResult;
        row.acceptor_id = Some(call.user_id.clone());
        row.acceptor_username = username;
        row.acceptors_pick_id = Some(call.acceptors_pick_id.clone());
        row.accepted_at = Some(now);
        row.updated_at = Some(now);
        state
            .completed_events
            .insert(call.event_id, call.bet_id.clone());
        Ok(())
    }

    async fn delete_straight_bet(&self, call: DeleteBetCall) -> Result<()> {
        self.wait_until_released().await;
        let mut state = self.state.lock().await;
        if state.offline {
            return Err(Error::transport("in-memory backend is offline"));
        }
        state.calls.push(RecordedCall::Delete(call.clone()));
        if state.completed_events.contains_key(&call.event_id) {
            return Ok(());
        }
        let bet = find_bet(&state, &call.bet_id)?.clone();
        if !bet.status.can_transition_to(BetStatus::Cancelled) {
            return Err(reject(format!(
                "Bet cannot be cancelled while {}",
                bet.status
            )));
        }
        let stake = signed(bet.amount)?;
        let released = balance_of(&state, &bet.creator_id)?
            .release(bet.amount)
            .ok_or_else(|| reject("Creator reservation is inconsistent"))?;
        state.balances.insert(bet.creator_id.clone(), released);
        record_transaction(
            &mut state,
            &bet.creator_id,
            stake,
            TransactionKind::Release,
            Some(&call.bet_id),
            Some(call.event_id),
        );

        let now = Utc::now();
        let row = find_bet_mut(&mut state, &call.bet_id)?;
        row.status = BetStatus::Cancelled;
        row.updated_at = Some(now);
        state
            .completed_events
            .insert(call.event_id, call.bet_id.clone());
        Ok(())
    }
}

impl MatchApi for InMemoryBackend {
    async fn match_ref(&self, id: &MatchId) -> Result<Option<MatchRef>> {
        self.read(|state| state.matches.iter().find(|m| &m.id == id).cloned())
            .await
    }

    async fn upcoming_matches(&self, limit: usize) -> Result<Vec<MatchRef>> {
        self.read(|state| state.matches.iter().take(limit).cloned().collect())
            .await
    }
}
