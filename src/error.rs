//! Error taxonomy for the escrow lifecycle engine
use super::auth::Capability;
use super::ledger::LedgerError;
use super::state::{DealEvent, InvalidTransition};

/// Validation failures for a deal draft before anything is persisted.
#[derive(thiserror::Error, Debug)]
pub enum DraftError {
    #[error("draft is missing the {0} identity")]
    MissingParty(&'static str),
    #[error("payer and payee must be distinct identities")]
    SameParty,
    #[error("draft is missing an amount")]
    MissingAmount,
    #[error("amount {0:?} is not a positive decimal string")]
    InvalidAmount(String),
}

/// Every failure an orchestrator operation can surface. Local failures
/// (`NotFound`, `AlreadyExists`, `Unauthorized`, `InvalidTransition`,
/// `Draft`) are deterministic and never retried. `Ledger` leaves no local
/// state behind, so the caller may retry the whole operation. `Contention`
/// is surfaced only after the bounded in-process retry is exhausted.
#[derive(thiserror::Error, Debug)]
pub enum EscrowError {
    #[error("deal {0} was not found")]
    NotFound(String),
    #[error("deal {0} already exists")]
    AlreadyExists(String),
    #[error("actor {actor} lacks the {capability} capability on deal {deal_id}")]
    Unauthorized {
        deal_id: String,
        actor: String,
        capability: Capability,
    },
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),
    #[error(transparent)]
    Draft(#[from] DraftError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("deal {0} was concurrently modified, retries exhausted")]
    Contention(String),
    #[error("audit query failed: {0:#}")]
    QueryFailed(anyhow::Error),
    #[error("record store failure: {0:#}")]
    Storage(anyhow::Error),
}

impl EscrowError {
    /// The allowed-events set of a rejected transition, for building
    /// corrective error responses.
    pub fn allowed_events(&self) -> Option<&'static [DealEvent]> {
        match self {
            EscrowError::InvalidTransition(err) => Some(err.allowed),
            _ => None,
        }
    }
}
