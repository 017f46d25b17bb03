use crate::{
    error::{
        Error,
        Result,
    },
    types::UserId,
};
use tokio::sync::watch;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Session {
    pub user_id: UserId,
    pub username: String,
    pub access_token: String,
}

impl Session {
    pub fn new(
        user_id: impl Into<UserId>,
        username: impl Into<String>,
        access_token: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            username: username.into(),
            access_token: access_token.into(),
        }
    }
}

/// Holder of the active session. Clones share state; subscribers see sign-in/out.
#[derive(Clone, Debug)]
pub struct SessionStore {
    current: watch::Sender<Option<Session>>,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore {
    pub fn new() -> Self {
        let (current, _) = watch::channel(None);
        Self { current }
    }

    pub fn with_session(session: Session) -> Self {
        let store = Self::new();
        store.sign_in(session);
        store
    }

    pub fn sign_in(&self, session: Session) {
        tracing::info!(user_id = %session.user_id, "session started");
        self.current.send_replace(Some(session));
    }

    pub fn sign_out(&self) {
        if let Some(previous) = self.current.send_replace(None) {
            tracing::info!(user_id = %previous.user_id, "session ended");
        }
    }

    pub fn current(&self) -> Option<Session> {
        self.current.borrow().clone()
    }

    /// The active session or `Error::Auth`.
    pub fn require(&self) -> Result<Session> {
        self.current().ok_or(Error::Auth)
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Session>> {
        self.current.subscribe()
    }
}
