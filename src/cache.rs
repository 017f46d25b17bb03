use crate::{
    backend::BetApi,
    error::Result,
    types::{
        BetId,
        BetStatus,
        MatchId,
        StraightBet,
        UserId,
    },
};
use std::{
    collections::{
        HashMap,
        HashSet,
    },
    sync::Arc,
};
use tokio::sync::RwLock;

/// Identifies one cached list.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum CacheKey {
    Status(BetStatus),
    User(UserId, Option<BetStatus>),
    Match(MatchId),
    Bet(BetId),
}

impl CacheKey {
    pub fn open() -> Self {
        CacheKey::Status(BetStatus::Open)
    }
}

/// Read-through cache of bet lists. Every list call hits the backend and
/// replaces its slice; nothing is ever patched locally.
#[derive(Clone)]
pub struct BetCache<B> {
    api: B,
    slices: Arc<RwLock<HashMap<CacheKey, Vec<StraightBet>>>>,
}

impl<B: BetApi> BetCache<B> {
    pub fn new(api: B) -> Self {
        Self {
            api,
            slices: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn list_open(&self, limit: usize) -> Result<Vec<StraightBet>> {
        self.list_by_status(BetStatus::Open, limit).await
    }

    pub async fn list_by_status(
        &self,
        status: BetStatus,
        limit: usize,
    ) -> Result<Vec<StraightBet>> {
        let rows = self.api.bets_by_status(status, limit).await?;
        Ok(self.store(CacheKey::Status(status), rows, Some(status), limit).await)
    }

    pub async fn list_by_user(
        &self,
        user: &UserId,
        status: Option<BetStatus>,
        limit: usize,
    ) -> Result<Vec<StraightBet>> {
        let rows = self.api.bets_by_user(user, status, limit).await?;
        let rows = rows.into_iter().filter(|bet| bet.involves(user)).collect();
        Ok(self
            .store(CacheKey::User(user.clone(), status), rows, status, limit)
            .await)
    }

    pub async fn list_by_match(
        &self,
        match_id: &MatchId,
        limit: usize,
    ) -> Result<Vec<StraightBet>> {
        let rows = self.api.bets_by_match(match_id, limit).await?;
        let rows = rows
            .into_iter()
            .filter(|bet| &bet.match_id == match_id)
            .collect();
        Ok(self
            .store(CacheKey::Match(match_id.clone()), rows, None, limit)
            .await)
    }

    /// Re-fetches one bet. A bet that no longer exists drops its entry; the
    /// entry also goes once no list refresh returns the bet anymore.
    pub async fn get(&self, id: &BetId) -> Result<Option<StraightBet>> {
        let bet = self.api.bet(id).await?;
        let key = CacheKey::Bet(id.clone());
        let mut slices = self.slices.write().await;
        match &bet {
            Some(bet) => {
                slices.insert(key, vec![bet.clone()]);
            }
            None => {
                slices.remove(&key);
            }
        }
        Ok(bet)
    }

    /// Last fetched contents of a slice.
    pub async fn cached(&self, key: &CacheKey) -> Option<Vec<StraightBet>> {
        self.slices.read().await.get(key).cloned()
    }

    /// Newest cached copy of a bet across all slices.
    pub async fn cached_bet(&self, id: &BetId) -> Option<StraightBet> {
        let slices = self.slices.read().await;
        if let Some(bet) = slices.get(&CacheKey::Bet(id.clone())).and_then(|s| s.first()) {
            return Some(bet.clone());
        }
        slices
            .values()
            .flatten()
            .filter(|bet| &bet.id == id)
            .max_by_key(|bet| bet.updated_at.unwrap_or(bet.created_at))
            .cloned()
    }

    pub async fn clear(&self) {
        self.slices.write().await.clear();
    }

    async fn store(
        &self,
        key: CacheKey,
        rows: Vec<StraightBet>,
        status: Option<BetStatus>,
        limit: usize,
    ) -> Vec<StraightBet> {
        let rows = normalize(rows, status, limit);
        let mut slices = self.slices.write().await;
        slices.insert(key, rows.clone());
        prune_single_bets(&mut slices);
        rows
    }
}

fn prune_single_bets(slices: &mut HashMap<CacheKey, Vec<StraightBet>>) {
    let listed: HashSet<BetId> = slices
        .iter()
        .filter(|(key, _)| !matches!(key, CacheKey::Bet(_)))
        .flat_map(|(_, rows)| rows.iter().map(|bet| bet.id.clone()))
        .collect();
    slices.retain(|key, _| match key {
        CacheKey::Bet(id) => listed.contains(id),
        _ => true,
    });
}

/// Newest first, restricted to `status` when given, at most `limit` rows.
pub fn normalize(
    mut rows: Vec<StraightBet>,
    status: Option<BetStatus>,
    limit: usize,
) -> Vec<StraightBet> {
    if let Some(status) = status {
        rows.retain(|bet| bet.status == status);
    }
    rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    rows.truncate(limit);
    rows
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;
    use crate::types::PickId;
    use chrono::{
        Duration,
        TimeZone,
        Utc,
    };
    use proptest::prelude::*;

    fn bet(n: i64, status: BetStatus) -> StraightBet {
        StraightBet {
            id: BetId::new(format!("b{n}")),
            creator_id: UserId::new("u1"),
            creator_username: "alice".to_string(),
            match_id: MatchId::new("m1"),
            creators_pick_id: PickId::new("a"),
            amount: 10,
            note: None,
            status,
            acceptor_id: None,
            acceptor_username: None,
            acceptors_pick_id: None,
            winner_user_id: None,
            created_at: Utc.timestamp_opt(1_700_000_000, 0).unwrap() + Duration::seconds(n),
            updated_at: None,
            accepted_at: None,
            completed_at: None,
        }
    }

    fn status_strategy() -> impl Strategy<Value = BetStatus> {
        prop::sample::select(BetStatus::ALL.to_vec())
    }

    proptest! {
        #[test]
        fn normalize__only_keeps_requested_status_newest_first(
            statuses in prop::collection::vec(status_strategy(), 0..40),
            wanted in status_strategy(),
            limit in 0usize..50,
        ) {
            // given
            let rows: Vec<_> = statuses
                .iter()
                .enumerate()
                .map(|(i, status)| bet(i as i64, *status))
                .collect();

            // when
            let out = normalize(rows, Some(wanted), limit);

            // then
            prop_assert!(out.len() <= limit);
            prop_assert!(out.iter().all(|b| b.status == wanted));
            prop_assert!(out.windows(2).all(|w| w[0].created_at >= w[1].created_at));
        }
    }

    #[test]
    fn normalize__without_status_keeps_everything() {
        let rows = vec![bet(1, BetStatus::Open), bet(2, BetStatus::Completed)];

        let out = normalize(rows, None, 10);

        assert_eq!(out.len(), 2);
        assert_eq!(out[0].id, BetId::new("b2"));
    }
}
