use crate::{
    backend::in_memory::InMemoryBackend,
    controller::{
        BetController,
        CreateBetRequest,
    },
    error::Result,
    session::{
        Session,
        SessionStore,
    },
    types::{
        BetId,
        Competitors,
        MatchId,
        MatchRef,
        PickId,
        Side,
        UserId,
    },
};

pub type TestController = BetController<InMemoryBackend, InMemoryBackend, InMemoryBackend>;

pub const LIST_LIMIT: usize = 50;

/// In-memory backend seeded with one team match, plus helpers to act as
/// different users against it.
pub struct TestContext {
    backend: InMemoryBackend,
    match_ref: MatchRef,
}

impl TestContext {
    pub async fn new() -> Self {
        let backend = InMemoryBackend::new();
        let match_ref = MatchRef {
            id: MatchId::new("match-1"),
            competitors: Competitors::Teams,
            side_a: Side {
                id: PickId::new("team-a"),
                name: "Lions".to_string(),
            },
            side_b: Side {
                id: PickId::new("team-b"),
                name: "Bears".to_string(),
            },
            starts_at: None,
        };
        backend.add_match(match_ref.clone()).await;
        Self { backend, match_ref }
    }

    pub fn backend(&self) -> InMemoryBackend {
        self.backend.clone()
    }

    pub fn match_ref(&self) -> &MatchRef {
        &self.match_ref
    }

    pub fn pick_a(&self) -> PickId {
        self.match_ref.side_a.id.clone()
    }

    pub fn pick_b(&self) -> PickId {
        self.match_ref.side_b.id.clone()
    }

    pub async fn with_user(&self, id: &str, free_points: u64) -> UserId {
        let user = UserId::new(id);
        self.backend.add_user(user.clone(), id, free_points).await.unwrap();
        user
    }

    /// A controller signed in as `user`, with its own session store.
    pub fn controller_for(&self, user: &UserId) -> TestController {
        let sessions = SessionStore::with_session(Session::new(
            user.clone(),
            user.as_str(),
            format!("token-{user}"),
        ));
        BetController::new(
            sessions,
            self.backend.clone(),
            self.backend.clone(),
            self.backend.clone(),
            LIST_LIMIT,
        )
    }

    pub fn request(&self, pick: PickId, amount: i64) -> CreateBetRequest {
        CreateBetRequest {
            match_id: self.match_ref.id.clone(),
            pick_id: pick,
            amount: Some(amount),
            note: None,
        }
    }

    /// Creates an open bet on side A as `creator`.
    pub async fn open_bet(&self, creator: &UserId, amount: i64) -> Result<BetId> {
        let bet = self
            .controller_for(creator)
            .create_bet(self.request(self.pick_a(), amount))
            .await?;
        Ok(bet.id)
    }
}
