use crate::{
    error::Result,
    types::{
        Balances,
        BetId,
        BetStatus,
        CorrelationId,
        MatchId,
        MatchRef,
        PickId,
        PointsTransaction,
        StraightBet,
        UserId,
    },
};
use serde::Serialize;

pub mod in_memory;
pub mod rest;

/// Arguments of `create_straight_bet_atomic`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CreateBetCall {
    pub user_id: UserId,
    pub bet_id: BetId,
    pub match_id: MatchId,
    pub picks_id: PickId,
    pub amount: u64,
    pub note: Option<String>,
    pub event_id: CorrelationId,
}

/// Arguments of `accept_straight_bet_atomic`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AcceptBetCall {
    pub user_id: UserId,
    pub bet_id: BetId,
    pub acceptors_pick_id: PickId,
    pub event_id: CorrelationId,
}

/// Arguments of `delete_straight_bet_atomic`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DeleteBetCall {
    pub bet_id: BetId,
    pub event_id: CorrelationId,
}

pub trait LedgerApi: Clone + Send + Sync + 'static {
    /// current free and reserved points of `user`
    fn balances(&self, user: &UserId) -> impl Future<Output = Result<Balances>> + Send;

    /// points transactions of `user`, newest first
    fn transactions(
        &self,
        user: &UserId,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<PointsTransaction>>> + Send;
}

pub trait BetApi: Clone + Send + Sync + 'static {
    fn bets_by_status(
        &self,
        status: BetStatus,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<StraightBet>>> + Send;

    fn bets_by_match(
        &self,
        match_id: &MatchId,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<StraightBet>>> + Send;

    /// bets the user created or accepted, optionally restricted to one status
    fn bets_by_user(
        &self,
        user: &UserId,
        status: Option<BetStatus>,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<StraightBet>>> + Send;

    fn bet(&self, id: &BetId) -> impl Future<Output = Result<Option<StraightBet>>> + Send;

    /// Inserts the bet row and reserves the creator's points in one remote transaction.
    fn create_straight_bet(
        &self,
        call: CreateBetCall,
    ) -> impl Future<Output = Result<StraightBet>> + Send;

    /// Marks the bet accepted and reserves the acceptor's points in one remote transaction.
    fn accept_straight_bet(
        &self,
        call: AcceptBetCall,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Cancels an open bet and releases the creator's reservation.
    fn delete_straight_bet(
        &self,
        call: DeleteBetCall,
    ) -> impl Future<Output = Result<()>> + Send;
}

pub trait MatchApi: Clone + Send + Sync + 'static {
    fn match_ref(
        &self,
        id: &MatchId,
    ) -> impl Future<Output = Result<Option<MatchRef>>> + Send;

    fn upcoming_matches(
        &self,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<MatchRef>>> + Send;
}
