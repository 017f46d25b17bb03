use crate::{
    backend::MatchApi,
    error::Result,
    types::{
        MatchId,
        MatchRef,
        PickId,
    },
};
use std::{
    collections::HashMap,
    sync::Arc,
};
use tokio::sync::RwLock;
use tracing::warn;

/// Label resolver for match sides. Lookups are memoised; misses are not.
#[derive(Clone)]
pub struct MatchLookup<M> {
    api: M,
    known: Arc<RwLock<HashMap<MatchId, MatchRef>>>,
}

impl<M: MatchApi> MatchLookup<M> {
    pub fn new(api: M) -> Self {
        Self {
            api,
            known: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Both sides of a match, or `None` when it cannot be resolved.
    pub async fn sides(&self, match_id: &MatchId) -> Option<MatchRef> {
        if let Some(found) = self.known.read().await.get(match_id) {
            return Some(found.clone());
        }
        match self.api.match_ref(match_id).await {
            Ok(Some(match_ref)) => {
                self.known
                    .write()
                    .await
                    .insert(match_id.clone(), match_ref.clone());
                Some(match_ref)
            }
            Ok(None) => None,
            Err(err) => {
                warn!(%match_id, %err, "match lookup failed");
                None
            }
        }
    }

    /// Display name of a pick, falling back to the raw id.
    pub async fn resolve_pick_name(&self, match_id: &MatchId, pick: &PickId) -> String {
        self.sides(match_id)
            .await
            .and_then(|match_ref| match_ref.side(pick).map(|side| side.name.clone()))
            .unwrap_or_else(|| pick.to_string())
    }

    pub async fn upcoming(&self, limit: usize) -> Result<Vec<MatchRef>> {
        let matches = self.api.upcoming_matches(limit).await?;
        let mut known = self.known.write().await;
        for match_ref in &matches {
            known.insert(match_ref.id.clone(), match_ref.clone());
        }
        Ok(matches)
    }
}

/// The side opposing `creator_pick`. Unknown picks fall back to side B.
pub fn derive_acceptor_pick(match_ref: &MatchRef, creator_pick: &PickId) -> PickId {
    if creator_pick == &match_ref.side_a.id {
        match_ref.side_b.id.clone()
    } else if creator_pick == &match_ref.side_b.id {
        match_ref.side_a.id.clone()
    } else {
        warn!(
            match_id = %match_ref.id,
            %creator_pick,
            "creator pick matches neither side, defaulting to side B"
        );
        match_ref.side_b.id.clone()
    }
}
