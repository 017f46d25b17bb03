use chrono::{
    DateTime,
    Utc,
};
use serde::{
    Deserialize,
    Serialize,
};
use std::fmt;
use uuid::Uuid;

macro_rules! string_id {
    ($name:ident) => {
        #[derive(
            Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(raw: impl Into<String>) -> Self {
                Self(raw.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn is_blank(&self) -> bool {
                self.0.trim().is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(raw: &str) -> Self {
                Self(raw.to_string())
            }
        }

        impl From<String> for $name {
            fn from(raw: String) -> Self {
                Self(raw)
            }
        }
    };
}

string_id!(UserId);
string_id!(BetId);
string_id!(MatchId);
string_id!(PickId);

/// Idempotency token sent with every mutating call. One per attempt, never reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(pub Uuid);

impl CorrelationId {
    pub fn fresh() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A user's points split into spendable and escrowed parts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balances {
    pub free: u64,
    pub reserved: u64,
}

impl Balances {
    pub fn new(free: u64, reserved: u64) -> Self {
        Self { free, reserved }
    }

    pub fn total(&self) -> u64 {
        self.free.saturating_add(self.reserved)
    }

    pub fn can_reserve(&self, amount: u64) -> bool {
        self.free >= amount
    }

    /// Moves `amount` from free to reserved.
    pub fn reserve(self, amount: u64) -> Option<Self> {
        Some(Self {
            free: self.free.checked_sub(amount)?,
            reserved: self.reserved.checked_add(amount)?,
        })
    }

    /// Moves `amount` from reserved back to free.
    pub fn release(self, amount: u64) -> Option<Self> {
        Some(Self {
            free: self.free.checked_add(amount)?,
            reserved: self.reserved.checked_sub(amount)?,
        })
    }

    /// Drops `amount` from reserved without returning it.
    pub fn forfeit(self, amount: u64) -> Option<Self> {
        Some(Self {
            free: self.free,
            reserved: self.reserved.checked_sub(amount)?,
        })
    }

    /// Winner side of a settlement: own stake leaves escrow and both stakes land in free.
    pub fn payout(self, stake: u64) -> Option<Self> {
        Some(Self {
            free: self.free.checked_add(stake.checked_mul(2)?)?,
            reserved: self.reserved.checked_sub(stake)?,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BetStatus {
    Open,
    WaitingResult,
    Completed,
    Cancelled,
}

impl BetStatus {
    pub const ALL: [BetStatus; 4] = [
        BetStatus::Open,
        BetStatus::WaitingResult,
        BetStatus::Completed,
        BetStatus::Cancelled,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            BetStatus::Open => "open",
            BetStatus::WaitingResult => "waiting_result",
            BetStatus::Completed => "completed",
            BetStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, BetStatus::Completed | BetStatus::Cancelled)
    }

    pub fn can_transition_to(self, next: BetStatus) -> bool {
        matches!(
            (self, next),
            (BetStatus::Open, BetStatus::WaitingResult)
                | (BetStatus::Open, BetStatus::Cancelled)
                | (BetStatus::WaitingResult, BetStatus::Completed)
        )
    }
}

impl fmt::Display for BetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BetStatus {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        BetStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == raw)
            .ok_or_else(|| format!("unknown bet status '{raw}'"))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StraightBet {
    pub id: BetId,
    pub creator_id: UserId,
    pub creator_username: String,
    pub match_id: MatchId,
    pub creators_pick_id: PickId,
    pub amount: u64,
    #[serde(default)]
    pub note: Option<String>,
    pub status: BetStatus,
    #[serde(default)]
    pub acceptor_id: Option<UserId>,
    #[serde(default)]
    pub acceptor_username: Option<String>,
    #[serde(default)]
    pub acceptors_pick_id: Option<PickId>,
    #[serde(default)]
    pub winner_user_id: Option<UserId>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub accepted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl StraightBet {
    pub fn is_open(&self) -> bool {
        self.status == BetStatus::Open
    }

    pub fn is_created_by(&self, user: &UserId) -> bool {
        &self.creator_id == user
    }

    pub fn involves(&self, user: &UserId) -> bool {
        self.is_created_by(user) || self.acceptor_id.as_ref() == Some(user)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Competitors {
    Teams,
    Players,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Side {
    pub id: PickId,
    pub name: String,
}

/// Read-only view of a match: always exactly two sides.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchRef {
    pub id: MatchId,
    pub competitors: Competitors,
    pub side_a: Side,
    pub side_b: Side,
    #[serde(default)]
    pub starts_at: Option<DateTime<Utc>>,
}

impl MatchRef {
    pub fn side(&self, pick: &PickId) -> Option<&Side> {
        [&self.side_a, &self.side_b]
            .into_iter()
            .find(|side| &side.id == pick)
    }

    pub fn title(&self) -> String {
        format!("{} vs {}", self.side_a.name, self.side_b.name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Grant,
    Reserve,
    Release,
    Payout,
    Forfeit,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointsTransaction {
    pub id: String,
    pub user_id: UserId,
    pub amount: i64,
    pub kind: TransactionKind,
    #[serde(default)]
    pub bet_id: Option<BetId>,
    #[serde(default)]
    pub event_id: Option<CorrelationId>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;

    #[test]
    fn reserve__moves_amount_from_free_to_reserved() {
        // given
        let balances = Balances::new(500, 0);

        // when
        let after = balances.reserve(100).unwrap();

        // then
        assert_eq!(after, Balances::new(400, 100));
        assert_eq!(after.total(), balances.total());
    }

    #[test]
    fn reserve__refuses_more_than_free() {
        // given
        let balances = Balances::new(50, 20);

        // when
        let after = balances.reserve(100);

        // then
        assert_eq!(after, None);
    }

    #[test]
    fn payout__returns_both_stakes_to_free() {
        // given
        let winner = Balances::new(400, 100);

        // when
        let after = winner.payout(100).unwrap();

        // then
        assert_eq!(after, Balances::new(600, 0));
    }

    #[test]
    fn forfeit__removes_reserved_without_touching_free() {
        // given
        let loser = Balances::new(200, 100);

        // when
        let after = loser.forfeit(100).unwrap();

        // then
        assert_eq!(after, Balances::new(200, 0));
    }

    #[test]
    fn can_transition_to__only_allows_forward_moves() {
        use BetStatus::*;
        let allowed: Vec<_> = BetStatus::ALL
            .into_iter()
            .flat_map(|from| BetStatus::ALL.into_iter().map(move |to| (from, to)))
            .filter(|(from, to)| from.can_transition_to(*to))
            .collect();

        assert_eq!(
            allowed,
            vec![
                (Open, WaitingResult),
                (Open, Cancelled),
                (WaitingResult, Completed)
            ]
        );
        assert!(Completed.is_terminal());
        assert!(Cancelled.is_terminal());
    }

    #[test]
    fn bet_status__parses_wire_names() {
        assert_eq!(
            "waiting_result".parse::<BetStatus>().unwrap(),
            BetStatus::WaitingResult
        );
        assert!("settled".parse::<BetStatus>().is_err());
        let json = serde_json::to_string(&BetStatus::WaitingResult).unwrap();
        assert_eq!(json, "\"waiting_result\"");
    }
}
