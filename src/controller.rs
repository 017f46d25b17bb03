use crate::{
    backend::{
        AcceptBetCall,
        BetApi,
        CreateBetCall,
        DeleteBetCall,
        LedgerApi,
        MatchApi,
    },
    cache::BetCache,
    error::{
        Error,
        Result,
        ValidationError,
    },
    ledger::LedgerView,
    matches::{
        MatchLookup,
        derive_acceptor_pick,
    },
    session::{
        Session,
        SessionStore,
    },
    types::{
        Balances,
        BetId,
        CorrelationId,
        MatchId,
        PickId,
        StraightBet,
    },
};
use chrono::{
    DateTime,
    Utc,
};
use std::{
    collections::HashMap,
    fmt,
};
use tokio::sync::watch;
use tracing::{
    error,
    info,
    warn,
};
use uuid::Uuid;

const MAX_NOTIFICATIONS: usize = 50;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ActionKey {
    Create,
    Accept(BetId),
    Cancel(BetId),
}

impl fmt::Display for ActionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionKey::Create => f.write_str("create"),
            ActionKey::Accept(id) => write!(f, "accept {id}"),
            ActionKey::Cancel(id) => write!(f, "cancel {id}"),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Phase {
    #[default]
    Idle,
    Validating,
    Submitting,
    Succeeded,
    Failed,
}

impl Phase {
    pub fn is_busy(self) -> bool {
        matches!(self, Phase::Validating | Phase::Submitting)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NotificationKind {
    Success,
    Error,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Notification {
    pub kind: NotificationKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// User input for a new bet. Blank ids and a missing amount count as absent.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CreateBetRequest {
    pub match_id: MatchId,
    pub pick_id: PickId,
    pub amount: Option<i64>,
    pub note: Option<String>,
}

/// Orchestrates create, accept and cancel against the backend.
///
/// Local checks run first and never reach the backend when they fail. A
/// successful call is followed by a re-read of the ledger and bet lists;
/// nothing is computed locally.
#[derive(Clone)]
pub struct BetController<B, L, M> {
    sessions: SessionStore,
    api: B,
    bets: BetCache<B>,
    ledger: LedgerView<L>,
    matches: MatchLookup<M>,
    list_limit: usize,
    phases: watch::Sender<HashMap<ActionKey, Phase>>,
    notifications: watch::Sender<Vec<Notification>>,
}

impl<B, L, M> BetController<B, L, M>
where
    B: BetApi,
    L: LedgerApi,
    M: MatchApi,
{
    pub fn new(
        sessions: SessionStore,
        bet_api: B,
        ledger_api: L,
        match_api: M,
        list_limit: usize,
    ) -> Self {
        let (phases, _) = watch::channel(HashMap::new());
        let (notifications, _) = watch::channel(Vec::new());
        Self {
            bets: BetCache::new(bet_api.clone()),
            api: bet_api,
            ledger: LedgerView::new(ledger_api, sessions.clone()),
            matches: MatchLookup::new(match_api),
            sessions,
            list_limit,
            phases,
            notifications,
        }
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn ledger(&self) -> &LedgerView<L> {
        &self.ledger
    }

    pub fn bets(&self) -> &BetCache<B> {
        &self.bets
    }

    pub fn matches(&self) -> &MatchLookup<M> {
        &self.matches
    }

    pub fn list_limit(&self) -> usize {
        self.list_limit
    }

    pub fn phase(&self, key: &ActionKey) -> Phase {
        self.phases.borrow().get(key).copied().unwrap_or_default()
    }

    pub fn subscribe_phases(&self) -> watch::Receiver<HashMap<ActionKey, Phase>> {
        self.phases.subscribe()
    }

    /// Oldest first.
    pub fn notifications(&self) -> Vec<Notification> {
        self.notifications.borrow().clone()
    }

    pub fn subscribe_notifications(&self) -> watch::Receiver<Vec<Notification>> {
        self.notifications.subscribe()
    }

    pub fn clear_notifications(&self) {
        self.notifications
            .send_if_modified(|list| !std::mem::take(list).is_empty());
    }

    pub async fn create_bet(&self, request: CreateBetRequest) -> Result<StraightBet> {
        let key = ActionKey::Create;
        let (session, call) = self
            .validate(&key, async {
                let session = self.sessions.require()?;
                if request.match_id.is_blank() {
                    return Err(Error::from(ValidationError::MissingField("match")));
                }
                if request.pick_id.is_blank() {
                    return Err(Error::from(ValidationError::MissingField("pick")));
                }
                let amount = request
                    .amount
                    .ok_or(ValidationError::MissingField("amount"))?;
                let amount = u64::try_from(amount)
                    .ok()
                    .filter(|amount| *amount > 0)
                    .ok_or(ValidationError::NonPositiveAmount)?;
                self.ensure_points(&session, amount).await?;
                let call = CreateBetCall {
                    user_id: session.user_id.clone(),
                    bet_id: BetId::new(Uuid::new_v4().to_string()),
                    match_id: request.match_id.clone(),
                    picks_id: request.pick_id.clone(),
                    amount,
                    note: request
                        .note
                        .as_deref()
                        .map(str::trim)
                        .filter(|note| !note.is_empty())
                        .map(str::to_string),
                    event_id: CorrelationId::fresh(),
                };
                Ok::<_, Error>((session, call))
            })
            .await?;

        info!(bet_id = %call.bet_id, event_id = %call.event_id, amount = call.amount, "submitting bet creation");
        let bet_id = call.bet_id.clone();
        let amount = call.amount;
        let outcome = self.api.create_straight_bet(call).await;
        let bet = self.finish(&key, &session, None, outcome).await?;
        self.refresh_after(&session, Some(&bet_id)).await;
        self.notify(
            NotificationKind::Success,
            format!("Bet of {amount} points created"),
        );
        Ok(bet)
    }

    pub async fn accept_bet(&self, bet_id: &BetId) -> Result<()> {
        let key = ActionKey::Accept(bet_id.clone());
        let (session, call) = self
            .validate(&key, async {
                let session = self.sessions.require()?;
                let bet = self
                    .bets
                    .get(bet_id)
                    .await?
                    .ok_or(ValidationError::BetNotFound)?;
                if bet.is_created_by(&session.user_id) {
                    return Err(Error::from(ValidationError::CannotAcceptOwnBet));
                }
                if !bet.is_open() {
                    return Err(Error::from(ValidationError::BetNotOpen(bet.status)));
                }
                self.ensure_points(&session, bet.amount).await?;
                let match_ref = self
                    .matches
                    .sides(&bet.match_id)
                    .await
                    .ok_or_else(|| ValidationError::UnknownMatch(bet.match_id.clone()))?;
                let call = AcceptBetCall {
                    user_id: session.user_id.clone(),
                    bet_id: bet.id.clone(),
                    acceptors_pick_id: derive_acceptor_pick(
                        &match_ref,
                        &bet.creators_pick_id,
                    ),
                    event_id: CorrelationId::fresh(),
                };
                Ok::<_, Error>((session, call))
            })
            .await?;

        info!(%bet_id, event_id = %call.event_id, pick = %call.acceptors_pick_id, "submitting bet acceptance");
        let outcome = self.api.accept_straight_bet(call).await;
        self.finish(&key, &session, Some(bet_id), outcome).await?;
        self.refresh_after(&session, Some(bet_id)).await;
        self.notify(NotificationKind::Success, "Bet accepted".to_string());
        Ok(())
    }

    /// Cancels an open bet. Status is enforced by the backend.
    pub async fn cancel_bet(&self, bet_id: &BetId) -> Result<()> {
        let key = ActionKey::Cancel(bet_id.clone());
        let (session, call) = self
            .validate(&key, async {
                let session = self.sessions.require()?;
                let bet = match self.bets.cached_bet(bet_id).await {
                    Some(bet) => bet,
                    None => self
                        .bets
                        .get(bet_id)
                        .await?
                        .ok_or(ValidationError::BetNotFound)?,
                };
                if !bet.is_created_by(&session.user_id) {
                    return Err(Error::from(ValidationError::NotBetCreator));
                }
                let call = DeleteBetCall {
                    bet_id: bet.id.clone(),
                    event_id: CorrelationId::fresh(),
                };
                Ok::<_, Error>((session, call))
            })
            .await?;

        info!(%bet_id, event_id = %call.event_id, "submitting bet cancellation");
        let outcome = self.api.delete_straight_bet(call).await;
        self.finish(&key, &session, Some(bet_id), outcome).await?;
        self.refresh_after(&session, Some(bet_id)).await;
        self.notify(NotificationKind::Success, "Bet cancelled".to_string());
        Ok(())
    }

    /// Runs the local checks for `key`. A failure puts the action back to idle.
    async fn validate<T>(
        &self,
        key: &ActionKey,
        checks: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        self.begin(key)?;
        match checks.await {
            Ok(value) => {
                self.set_phase(key, Phase::Submitting);
                Ok(value)
            }
            Err(err) => {
                info!(action = %key, %err, "action refused before submission");
                self.set_phase(key, Phase::Idle);
                self.notify(NotificationKind::Error, err.to_string());
                Err(err)
            }
        }
    }

    /// Moves `key` to validating unless it is already in flight.
    fn begin(&self, key: &ActionKey) -> Result<()> {
        let mut claimed = false;
        self.phases.send_if_modified(|phases| {
            let phase = phases.entry(key.clone()).or_default();
            if phase.is_busy() {
                return false;
            }
            *phase = Phase::Validating;
            claimed = true;
            true
        });
        if claimed {
            Ok(())
        } else {
            Err(ValidationError::ActionInProgress.into())
        }
    }

    async fn finish<T>(
        &self,
        key: &ActionKey,
        session: &Session,
        affected: Option<&BetId>,
        outcome: Result<T>,
    ) -> Result<T> {
        match outcome {
            Ok(value) => {
                self.set_phase(key, Phase::Succeeded);
                Ok(value)
            }
            Err(err) => {
                error!(action = %key, user_id = %session.user_id, %err, "backend call failed");
                self.set_phase(key, Phase::Failed);
                self.notify(NotificationKind::Error, err.to_string());
                if let (Error::RemoteRejected(_), Some(bet_id)) = (&err, affected) {
                    if let Err(refetch) = self.bets.get(bet_id).await {
                        warn!(%bet_id, err = %refetch, "re-fetch after rejection failed");
                    }
                }
                Err(err)
            }
        }
    }

    /// Free points must cover `amount`, judged on the last successful read.
    async fn ensure_points(&self, session: &Session, amount: u64) -> Result<()> {
        let balances = match self.ledger.get_balances().await {
            Ok(balances) => balances,
            Err(err) if err.is_retryable() => self
                .ledger
                .cached_balances(&session.user_id)
                .ok_or(err)?,
            Err(err) => return Err(err),
        };
        check_points(balances, amount)
    }

    async fn refresh_after(&self, session: &Session, bet_id: Option<&BetId>) {
        if let Err(err) = self.ledger.refresh().await {
            warn!(%err, "balance refresh after action failed");
        }
        if let Err(err) = self.bets.list_open(self.list_limit).await {
            warn!(%err, "open bets refresh after action failed");
        }
        if let Err(err) = self
            .bets
            .list_by_user(&session.user_id, None, self.list_limit)
            .await
        {
            warn!(%err, "user bets refresh after action failed");
        }
        if let Some(bet_id) = bet_id {
            if let Err(err) = self.bets.get(bet_id).await {
                warn!(%bet_id, %err, "bet refresh after action failed");
            }
        }
    }

    fn set_phase(&self, key: &ActionKey, phase: Phase) {
        self.phases.send_modify(|phases| {
            phases.insert(key.clone(), phase);
        });
    }

    fn notify(&self, kind: NotificationKind, message: String) {
        self.notifications.send_modify(|list| {
            list.push(Notification {
                kind,
                message,
                at: Utc::now(),
            });
            if list.len() > MAX_NOTIFICATIONS {
                let excess = list.len() - MAX_NOTIFICATIONS;
                list.drain(..excess);
            }
        });
    }
}

fn check_points(balances: Balances, amount: u64) -> Result<()> {
    if balances.can_reserve(amount) {
        Ok(())
    } else {
        Err(ValidationError::InsufficientPoints {
            needed: amount,
            available: balances.free,
        }
        .into())
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;
    use crate::{
        backend::in_memory::{
            InMemoryBackend,
            RecordedCall,
        },
        types::{
            BetStatus,
            Competitors,
            MatchRef,
            Side,
            UserId,
        },
    };
    use proptest::prelude::*;

    type Controller = BetController<InMemoryBackend, InMemoryBackend, InMemoryBackend>;

    async fn setup(free: u64) -> (InMemoryBackend, Controller) {
        let backend = InMemoryBackend::new();
        backend.add_user(UserId::new("alice"), "alice", free).await.unwrap();
        backend.add_user(UserId::new("bob"), "bob", 1_000).await.unwrap();
        backend
            .add_match(MatchRef {
                id: MatchId::new("m"),
                competitors: Competitors::Teams,
                side_a: Side {
                    id: PickId::new("a"),
                    name: "Alpha".to_string(),
                },
                side_b: Side {
                    id: PickId::new("b"),
                    name: "Beta".to_string(),
                },
                starts_at: None,
            })
            .await;
        let sessions = SessionStore::with_session(Session::new("alice", "alice", "t"));
        let controller = BetController::new(
            sessions,
            backend.clone(),
            backend.clone(),
            backend.clone(),
            50,
        );
        (backend, controller)
    }

    fn request(amount: Option<i64>) -> CreateBetRequest {
        CreateBetRequest {
            match_id: MatchId::new("m"),
            pick_id: PickId::new("a"),
            amount,
            note: None,
        }
    }

    #[tokio::test]
    async fn create_bet__missing_fields_fail_in_order() {
        // given
        let (backend, controller) = setup(500).await;
        let mut blank = request(None);
        blank.match_id = MatchId::new(" ");
        blank.pick_id = PickId::new("");

        // when
        let err = controller.create_bet(blank.clone()).await.unwrap_err();
        blank.match_id = MatchId::new("m");
        let err_pick = controller.create_bet(blank.clone()).await.unwrap_err();
        blank.pick_id = PickId::new("a");
        let err_amount = controller.create_bet(blank).await.unwrap_err();

        // then
        assert_eq!(err, ValidationError::MissingField("match").into());
        assert_eq!(err_pick, ValidationError::MissingField("pick").into());
        assert_eq!(err_amount, ValidationError::MissingField("amount").into());
        assert!(backend.calls().await.is_empty());
        assert_eq!(controller.phase(&ActionKey::Create), Phase::Idle);
    }

    #[tokio::test]
    async fn create_bet__signed_out_fails_with_auth_before_field_checks() {
        let (backend, controller) = setup(500).await;
        controller.sessions().sign_out();

        let err = controller.create_bet(request(None)).await.unwrap_err();

        assert_eq!(err, Error::Auth);
        assert!(backend.calls().await.is_empty());
    }

    #[tokio::test]
    async fn create_bet__success_records_phase_and_notification() {
        // given
        let (_backend, controller) = setup(500).await;

        // when
        let bet = controller.create_bet(request(Some(100))).await.unwrap();

        // then
        assert_eq!(bet.status, BetStatus::Open);
        assert_eq!(controller.phase(&ActionKey::Create), Phase::Succeeded);
        let last = controller.notifications().pop().unwrap();
        assert_eq!(last.kind, NotificationKind::Success);
        let open = controller
            .bets()
            .cached(&crate::cache::CacheKey::open())
            .await
            .unwrap();
        assert!(open.iter().any(|b| b.id == bet.id));
    }

    #[tokio::test]
    async fn create_bet__remote_rejection_marks_failed_without_retry() {
        // given
        let (backend, controller) = setup(500).await;
        let mut bad_pick = request(Some(10));
        bad_pick.pick_id = PickId::new("zzz");

        // when
        let err = controller.create_bet(bad_pick).await.unwrap_err();

        // then
        assert!(matches!(err, Error::RemoteRejected(_)));
        assert_eq!(backend.calls().await.len(), 1);
        assert_eq!(controller.phase(&ActionKey::Create), Phase::Failed);
        assert_eq!(
            controller.notifications().pop().unwrap().message,
            err.to_string()
        );
    }

    #[tokio::test]
    async fn create_bet__each_attempt_gets_a_fresh_correlation_id() {
        let (backend, controller) = setup(500).await;

        controller.create_bet(request(Some(10))).await.unwrap();
        controller.create_bet(request(Some(10))).await.unwrap();

        let calls = backend.calls().await;
        assert_eq!(calls.len(), 2);
        assert_ne!(calls[0].event_id(), calls[1].event_id());
    }

    #[tokio::test]
    async fn accept_bet__unknown_match_is_refused_locally() {
        // given
        let (backend, controller) = setup(500).await;
        controller.create_bet(request(Some(10))).await.unwrap();
        let bet_id = match &backend.calls().await[0] {
            RecordedCall::Create(call) => call.bet_id.clone(),
            other => panic!("unexpected call {other:?}"),
        };
        controller
            .sessions()
            .sign_in(Session::new("bob", "bob", "t"));
        let lookup_cold = Controller::new(
            controller.sessions().clone(),
            backend.clone(),
            backend.clone(),
            InMemoryBackend::new(),
            50,
        );

        // when
        let err = lookup_cold.accept_bet(&bet_id).await.unwrap_err();

        // then
        assert_eq!(
            err,
            ValidationError::UnknownMatch(MatchId::new("m")).into()
        );
        assert_eq!(backend.calls().await.len(), 1);
    }

    #[tokio::test]
    async fn create_bet__in_flight_action_refuses_second_submission() {
        // given
        let (backend, controller) = setup(500).await;
        controller.begin(&ActionKey::Create).unwrap();

        // when
        let err = controller.create_bet(request(Some(100))).await.unwrap_err();

        // then
        assert_eq!(err, ValidationError::ActionInProgress.into());
        assert!(backend.calls().await.is_empty());
        assert_eq!(controller.phase(&ActionKey::Create), Phase::Validating);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn begin__only_one_of_concurrent_claims_wins() {
        // given
        let (_backend, controller) = setup(500).await;
        let key = ActionKey::Accept(BetId::new("b-1"));

        // when
        let claims = (0..16).map(|_| {
            let controller = controller.clone();
            let key = key.clone();
            tokio::spawn(async move { controller.begin(&key).is_ok() })
        });
        let results = futures::future::join_all(claims).await;

        // then
        let won = results
            .into_iter()
            .map(|joined| joined.unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(won, 1);
        assert_eq!(controller.phase(&key), Phase::Validating);
    }

    proptest! {
        #[test]
        fn check_points__refuses_amounts_above_free(free in 0u64..10_000, amount in 1u64..20_000) {
            let result = check_points(Balances::new(free, 0), amount);
            prop_assert_eq!(result.is_ok(), amount <= free);
        }
    }
}
