use crate::types::{
    BetStatus,
    MatchId,
};
use std::fmt;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Failures surfaced by the client. `Display` is the user-facing text.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// A local precondition failed; nothing was sent to the backend.
    Validation(ValidationError),
    /// No active session, or the backend refused the credentials.
    Auth,
    /// The backend executed the call and refused it. Carries its message verbatim.
    RemoteRejected(String),
    /// The backend could not be reached or answered with something unreadable.
    Transport(String),
}

impl Error {
    pub fn transport(detail: impl fmt::Display) -> Self {
        Error::Transport(detail.to_string())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transport(_))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Validation(inner) => write!(f, "{inner}"),
            Error::Auth => f.write_str("Please sign in to continue"),
            Error::RemoteRejected(message) => f.write_str(message),
            Error::Transport(_) => {
                f.write_str("Could not reach the server, please try again")
            }
        }
    }
}

impl std::error::Error for Error {}

impl From<ValidationError> for Error {
    fn from(inner: ValidationError) -> Self {
        Error::Validation(inner)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ValidationError {
    MissingField(&'static str),
    NonPositiveAmount,
    InsufficientPoints { needed: u64, available: u64 },
    CannotAcceptOwnBet,
    BetNotOpen(BetStatus),
    NotBetCreator,
    UnknownMatch(MatchId),
    BetNotFound,
    ActionInProgress,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::MissingField(field) => write!(f, "Please provide a {field}"),
            ValidationError::NonPositiveAmount => {
                f.write_str("Bet amount must be greater than zero")
            }
            ValidationError::InsufficientPoints { needed, available } => write!(
                f,
                "Insufficient Points (need {needed}, have {available})"
            ),
            ValidationError::CannotAcceptOwnBet => {
                f.write_str("You cannot accept your own bet")
            }
            ValidationError::BetNotOpen(status) => {
                write!(f, "This bet is no longer open (status: {status})")
            }
            ValidationError::NotBetCreator => {
                f.write_str("Only the creator can cancel this bet")
            }
            ValidationError::UnknownMatch(id) => write!(f, "Match {id} could not be found"),
            ValidationError::BetNotFound => f.write_str("This bet no longer exists"),
            ValidationError::ActionInProgress => {
                f.write_str("This action is already in progress")
            }
        }
    }
}

impl std::error::Error for ValidationError {}
