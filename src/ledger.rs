use crate::{
    backend::LedgerApi,
    error::{
        Error,
        Result,
    },
    session::{
        Session,
        SessionStore,
    },
    types::{
        Balances,
        PointsTransaction,
        UserId,
    },
};
use chrono::{
    DateTime,
    Utc,
};
use std::time::Duration;
use tokio::{
    sync::{
        mpsc,
        watch,
    },
    task::JoinHandle,
    time::{
        self,
        MissedTickBehavior,
    },
};
use tracing::{
    debug,
    info,
    warn,
};

/// Last known balances of one user.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LedgerSnapshot {
    pub user_id: UserId,
    pub balances: Balances,
    pub fetched_at: DateTime<Utc>,
    /// Set when the most recent refresh failed; `balances` are then stale.
    pub last_error: Option<Error>,
}

impl LedgerSnapshot {
    pub fn is_stale(&self) -> bool {
        self.last_error.is_some()
    }
}

/// Read-only view of the signed-in user's points.
#[derive(Clone)]
pub struct LedgerView<L> {
    api: L,
    sessions: SessionStore,
    snapshot: watch::Sender<Option<LedgerSnapshot>>,
}

impl<L: LedgerApi> LedgerView<L> {
    pub fn new(api: L, sessions: SessionStore) -> Self {
        let (snapshot, _) = watch::channel(None);
        Self {
            api,
            sessions,
            snapshot,
        }
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    /// Fetches the active user's balances and caches them.
    ///
    /// On a transport failure the previous balances of the same user stay
    /// visible with the error recorded. Any other failure is returned as is.
    pub async fn get_balances(&self) -> Result<Balances> {
        let session = self.sessions.require().inspect_err(|_| self.clear())?;
        self.fetch_for(&session).await
    }

    /// Alias of [`Self::get_balances`] used by the refresh paths.
    pub async fn refresh(&self) -> Result<Balances> {
        self.get_balances().await
    }

    async fn fetch_for(&self, session: &Session) -> Result<Balances> {
        match self.api.balances(&session.user_id).await {
            Ok(balances) => {
                debug!(user_id = %session.user_id, free = balances.free, reserved = balances.reserved, "balances fetched");
                self.snapshot.send_replace(Some(LedgerSnapshot {
                    user_id: session.user_id.clone(),
                    balances,
                    fetched_at: Utc::now(),
                    last_error: None,
                }));
                Ok(balances)
            }
            Err(err) => {
                warn!(user_id = %session.user_id, %err, "balance fetch failed");
                let keep = err.is_retryable();
                self.snapshot.send_if_modified(|current| {
                    let same_user = current
                        .as_ref()
                        .is_some_and(|snapshot| snapshot.user_id == session.user_id);
                    match current.as_mut() {
                        Some(snapshot) if keep && same_user => {
                            snapshot.last_error = Some(err.clone());
                            true
                        }
                        _ => current.take().is_some(),
                    }
                });
                Err(err)
            }
        }
    }

    /// Cached snapshot, only if it belongs to the signed-in user.
    pub fn current(&self) -> Option<LedgerSnapshot> {
        let user = self.sessions.current()?.user_id;
        self.snapshot
            .borrow()
            .as_ref()
            .filter(|snapshot| snapshot.user_id == user)
            .cloned()
    }

    /// Cached balances of `user` from the last successful read.
    pub fn cached_balances(&self, user: &UserId) -> Option<Balances> {
        self.snapshot
            .borrow()
            .as_ref()
            .filter(|snapshot| &snapshot.user_id == user)
            .map(|snapshot| snapshot.balances)
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<LedgerSnapshot>> {
        self.snapshot.subscribe()
    }

    pub fn clear(&self) {
        self.snapshot.send_if_modified(|current| current.take().is_some());
    }

    /// Clears the snapshot only if it still belongs to `user`.
    pub fn clear_for(&self, user: &UserId) {
        self.snapshot.send_if_modified(|current| {
            let owned = current
                .as_ref()
                .is_some_and(|snapshot| &snapshot.user_id == user);
            owned && current.take().is_some()
        });
    }

    /// Transaction history of the signed-in user, newest first.
    pub async fn history(&self, limit: usize) -> Result<Vec<PointsTransaction>> {
        let session = self.sessions.require()?;
        self.api.transactions(&session.user_id, limit).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerCommand {
    RefreshNow,
    Shutdown,
}

/// Background refresh of one user's balances. Aborted when dropped.
pub struct LedgerPoller {
    user_id: UserId,
    cmd_tx: mpsc::UnboundedSender<PollerCommand>,
    handle: Option<JoinHandle<()>>,
}

impl LedgerPoller {
    /// Starts polling for the signed-in user. The first refresh runs immediately.
    pub fn spawn<L: LedgerApi>(ledger: LedgerView<L>, interval: Duration) -> Result<Self> {
        let session = ledger.sessions().require()?;
        let session_rx = ledger.sessions().subscribe();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(poll_worker(
            ledger,
            session.user_id.clone(),
            interval,
            cmd_rx,
            session_rx,
        ));
        info!(user_id = %session.user_id, ?interval, "ledger poller started");
        Ok(Self {
            user_id: session.user_id,
            cmd_tx,
            handle: Some(handle),
        })
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn refresh_now(&self) {
        let _ = self.cmd_tx.send(PollerCommand::RefreshNow);
    }

    pub fn shutdown(&self) {
        let _ = self.cmd_tx.send(PollerCommand::Shutdown);
    }

    pub fn is_finished(&self) -> bool {
        self.handle
            .as_ref()
            .is_none_or(|handle| handle.is_finished())
    }

    /// Waits for the task to exit on its own.
    pub async fn stopped(mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(err) = handle.await {
                if !err.is_cancelled() {
                    warn!(%err, "ledger poller panicked");
                }
            }
        }
    }
}

impl Drop for LedgerPoller {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

async fn poll_worker<L: LedgerApi>(
    ledger: LedgerView<L>,
    user_id: UserId,
    interval: Duration,
    mut cmd_rx: mpsc::UnboundedReceiver<PollerCommand>,
    mut session_rx: watch::Receiver<Option<Session>>,
) {
    async fn refresh<L: LedgerApi>(ledger: &LedgerView<L>) {
        if let Err(err) = ledger.refresh().await {
            warn!(%err, "scheduled balance refresh failed");
        }
    }

    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    session_rx.mark_unchanged();

    loop {
        tokio::select! {
            _ = ticker.tick() => refresh(&ledger).await,
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(PollerCommand::RefreshNow) => {
                        refresh(&ledger).await;
                        ticker.reset();
                    }
                    Some(PollerCommand::Shutdown) | None => break,
                }
            }
            changed = session_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let same_user = session_rx
                    .borrow_and_update()
                    .as_ref()
                    .is_some_and(|session| session.user_id == user_id);
                if !same_user {
                    ledger.clear_for(&user_id);
                    break;
                }
            }
        }
    }
    info!(%user_id, "ledger poller stopped");
}

/// Keeps one [`LedgerPoller`] running for whoever is signed in.
///
/// Every sign-in restarts polling for that user, which refreshes at once;
/// sign-out stops it and clears the snapshot.
pub struct LedgerSupervisor {
    cmd_tx: mpsc::UnboundedSender<PollerCommand>,
    handle: Option<JoinHandle<()>>,
}

impl LedgerSupervisor {
    pub fn spawn<L: LedgerApi>(ledger: LedgerView<L>, interval: Duration) -> Self {
        let session_rx = ledger.sessions().subscribe();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(supervise(ledger, interval, cmd_rx, session_rx));
        Self {
            cmd_tx,
            handle: Some(handle),
        }
    }

    pub fn shutdown(&self) {
        let _ = self.cmd_tx.send(PollerCommand::Shutdown);
    }

    pub async fn stopped(mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(err) = handle.await {
                if !err.is_cancelled() {
                    warn!(%err, "ledger supervisor panicked");
                }
            }
        }
    }
}

impl Drop for LedgerSupervisor {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

async fn supervise<L: LedgerApi>(
    ledger: LedgerView<L>,
    interval: Duration,
    mut cmd_rx: mpsc::UnboundedReceiver<PollerCommand>,
    mut session_rx: watch::Receiver<Option<Session>>,
) {
    let mut poller: Option<LedgerPoller> = None;
    loop {
        // dropping the previous poller aborts it
        drop(poller.take());
        if session_rx.borrow_and_update().is_some() {
            match LedgerPoller::spawn(ledger.clone(), interval) {
                Ok(started) => poller = Some(started),
                Err(err) => debug!(%err, "session ended before polling started"),
            }
        } else {
            ledger.clear();
        }

        tokio::select! {
            changed = session_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = cmd_rx.recv() => break,
        }
    }
    if let Some(poller) = poller {
        poller.shutdown();
        poller.stopped().await;
    }
    info!("ledger supervisor stopped");
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;
    use crate::backend::in_memory::InMemoryBackend;

    async fn signed_in(free: u64) -> (InMemoryBackend, LedgerView<InMemoryBackend>) {
        let backend = InMemoryBackend::new();
        backend.add_user(UserId::new("u1"), "alice", free).await.unwrap();
        let sessions = SessionStore::with_session(Session::new("u1", "alice", "t"));
        let ledger = LedgerView::new(backend.clone(), sessions);
        (backend, ledger)
    }

    #[tokio::test]
    async fn get_balances__fails_with_auth_when_signed_out() {
        // given
        let backend = InMemoryBackend::new();
        let ledger = LedgerView::new(backend.clone(), SessionStore::new());

        // when
        let result = ledger.get_balances().await;

        // then
        assert_eq!(result, Err(Error::Auth));
        assert_eq!(backend.read_count().await, 0);
    }

    #[tokio::test]
    async fn get_balances__keeps_last_known_balances_when_unreachable() {
        // given
        let (backend, ledger) = signed_in(1_000).await;
        ledger.get_balances().await.unwrap();
        backend.set_offline(true).await;

        // when
        let result = ledger.get_balances().await;

        // then
        assert!(matches!(result, Err(Error::Transport(_))));
        let snapshot = ledger.current().unwrap();
        assert_eq!(snapshot.balances, Balances::new(1_000, 0));
        assert!(snapshot.is_stale());
    }

    #[tokio::test]
    async fn current__hides_snapshot_of_previous_user() {
        // given
        let (backend, ledger) = signed_in(1_000).await;
        backend.add_user(UserId::new("u2"), "bob", 300).await.unwrap();
        ledger.get_balances().await.unwrap();

        // when
        ledger.sessions().sign_in(Session::new("u2", "bob", "t2"));

        // then
        assert_eq!(ledger.current(), None);
        let balances = ledger.get_balances().await.unwrap();
        assert_eq!(balances, Balances::new(300, 0));
        assert_eq!(ledger.current().unwrap().user_id, UserId::new("u2"));
    }

    #[tokio::test]
    async fn poller__stops_when_session_ends() {
        // given
        let (_backend, ledger) = signed_in(1_000).await;
        let poller = LedgerPoller::spawn(ledger.clone(), Duration::from_millis(20)).unwrap();

        // when
        ledger.sessions().sign_out();

        // then
        time::timeout(Duration::from_secs(2), poller.stopped())
            .await
            .expect("poller should exit after sign-out");
        assert_eq!(ledger.subscribe().borrow().clone(), None);
    }

    #[tokio::test]
    async fn poller__refreshes_on_interval() {
        // given
        let (backend, ledger) = signed_in(1_000).await;

        // when
        let poller = LedgerPoller::spawn(ledger.clone(), Duration::from_millis(10)).unwrap();
        time::sleep(Duration::from_millis(80)).await;

        // then
        assert!(backend.read_count().await >= 2);
        assert_eq!(ledger.current().unwrap().balances.free, 1_000);
        poller.shutdown();
        time::timeout(Duration::from_secs(2), poller.stopped())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn poller__requires_a_session() {
        let ledger = LedgerView::new(InMemoryBackend::new(), SessionStore::new());

        let result = LedgerPoller::spawn(ledger, Duration::from_secs(1));

        assert!(matches!(result, Err(Error::Auth)));
    }

    async fn wait_for_user<L: LedgerApi>(ledger: &LedgerView<L>, user: &UserId) -> LedgerSnapshot {
        let mut updates = ledger.subscribe();
        time::timeout(Duration::from_secs(2), async {
            loop {
                let found = updates
                    .borrow_and_update()
                    .clone()
                    .filter(|snapshot| &snapshot.user_id == user);
                if let Some(snapshot) = found {
                    return snapshot;
                }
                updates.changed().await.unwrap();
            }
        })
        .await
        .expect("balances should be fetched for the signed-in user")
    }

    #[tokio::test]
    async fn supervisor__re_fetches_balances_when_user_changes() {
        // given
        let (backend, ledger) = signed_in(1_000).await;
        backend.add_user(UserId::new("u2"), "bob", 300).await.unwrap();
        let supervisor = LedgerSupervisor::spawn(ledger.clone(), Duration::from_secs(3600));
        wait_for_user(&ledger, &UserId::new("u1")).await;

        // when
        ledger.sessions().sign_in(Session::new("u2", "bob", "t2"));

        // then
        let snapshot = wait_for_user(&ledger, &UserId::new("u2")).await;
        assert_eq!(snapshot.balances, Balances::new(300, 0));
        assert_eq!(ledger.current(), Some(snapshot));
        supervisor.shutdown();
        time::timeout(Duration::from_secs(2), supervisor.stopped())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn supervisor__resumes_polling_after_sign_out_and_back_in() {
        // given
        let (_backend, ledger) = signed_in(1_000).await;
        let _supervisor = LedgerSupervisor::spawn(ledger.clone(), Duration::from_secs(3600));
        wait_for_user(&ledger, &UserId::new("u1")).await;

        // when
        ledger.sessions().sign_out();
        let mut updates = ledger.subscribe();
        time::timeout(Duration::from_secs(2), async {
            while updates.borrow_and_update().is_some() {
                updates.changed().await.unwrap();
            }
        })
        .await
        .unwrap();
        ledger.sessions().sign_in(Session::new("u1", "alice", "t3"));

        // then
        let snapshot = wait_for_user(&ledger, &UserId::new("u1")).await;
        assert_eq!(snapshot.balances, Balances::new(1_000, 0));
    }

    #[tokio::test]
    async fn clear_for__leaves_other_users_snapshot() {
        // given
        let (_backend, ledger) = signed_in(1_000).await;
        ledger.get_balances().await.unwrap();

        // when
        ledger.clear_for(&UserId::new("someone-else"));

        // then
        assert!(ledger.current().is_some());
        ledger.clear_for(&UserId::new("u1"));
        assert_eq!(ledger.current(), None);
    }
}
