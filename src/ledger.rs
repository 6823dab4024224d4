//! Ledger-confirmation adapter contract
//!
//! The orchestrator never talks to the chain directly. It hands a
//! [`LedgerOperation`] to a [`LedgerAdapter`], which blocks until the backing
//! transaction is confirmed or failed, and only then does any local state
//! change. Confirmation can take seconds to minutes, so the call happens
//! strictly between record-store transactions, never inside one.
pub use super::deal::{LedgerRef, TimeStamp};
use super::state::DealEvent;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// The mutating chain operation backing one deal transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerOperation {
    Create {
        deal_id: String,
        payer: String,
        payee: String,
        token: Option<String>,
        amount: String,
    },
    Fund {
        deal_id: String,
        amount: String,
    },
    Approve {
        deal_id: String,
    },
    Release {
        deal_id: String,
    },
    Dispute {
        deal_id: String,
    },
    Cancel {
        deal_id: String,
    },
}

impl LedgerOperation {
    pub fn deal_id(&self) -> &str {
        match self {
            LedgerOperation::Create { deal_id, .. }
            | LedgerOperation::Fund { deal_id, .. }
            | LedgerOperation::Approve { deal_id }
            | LedgerOperation::Release { deal_id }
            | LedgerOperation::Dispute { deal_id }
            | LedgerOperation::Cancel { deal_id } => deal_id,
        }
    }

    pub fn event(&self) -> DealEvent {
        match self {
            LedgerOperation::Create { .. } => DealEvent::Create,
            LedgerOperation::Fund { .. } => DealEvent::Fund,
            LedgerOperation::Approve { .. } => DealEvent::Approve,
            LedgerOperation::Release { .. } => DealEvent::Release,
            LedgerOperation::Dispute { .. } => DealEvent::Dispute,
            LedgerOperation::Cancel { .. } => DealEvent::Cancel,
        }
    }
}

impl fmt::Display for LedgerOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LedgerOperation::Fund { deal_id, amount } => {
                write!(f, "fund {deal_id} {amount}")
            }
            LedgerOperation::Create {
                deal_id, amount, ..
            } => write!(f, "create {deal_id} {amount}"),
            other => write!(f, "{} {}", other.event(), other.deal_id()),
        }
    }
}

/// Submission or confirmation failure. The adapter preserves its own cause;
/// the orchestrator mutates nothing when one of these comes back.
#[derive(thiserror::Error, Debug)]
pub enum LedgerError {
    #[error("ledger rejected the operation: {0}")]
    Rejected(String),
    #[error("timed out waiting for confirmation")]
    Timeout,
    #[error("ledger unavailable: {0}")]
    Unavailable(String),
}

/// Submits a mutating operation to the external ledger and blocks until a
/// confirmed transaction descriptor or a failure comes back. Implementations
/// must be safe to call once per orchestrator attempt; the orchestrator does
/// not retry submission on its own.
pub trait LedgerAdapter: Send + Sync {
    fn submit(&self, operation: &LedgerOperation) -> Result<LedgerRef, LedgerError>;
}

/// In-process adapter that confirms every operation immediately with a
/// synthetic transaction hash. Stand-in for local development and tests.
#[derive(Debug)]
pub struct InstantLedger {
    next_block: AtomicU64,
}

impl InstantLedger {
    pub fn new() -> Self {
        Self {
            next_block: AtomicU64::new(1),
        }
    }
}

impl Default for InstantLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl LedgerAdapter for InstantLedger {
    fn submit(&self, operation: &LedgerOperation) -> Result<LedgerRef, LedgerError> {
        let block_number = self.next_block.fetch_add(1, Ordering::SeqCst);
        let tx_hash = format!("0x{}", sha256::digest(format!("{block_number}:{operation}")));

        Ok(LedgerRef {
            tx_hash,
            block_number,
            confirmed_at: TimeStamp::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instant_ledger_confirms_with_unique_references() {
        let ledger = InstantLedger::new();
        let op = LedgerOperation::Approve {
            deal_id: "deal_a".into(),
        };

        let first = ledger.submit(&op).unwrap();
        let second = ledger.submit(&op).unwrap();

        assert_ne!(first.tx_hash, second.tx_hash);
        assert!(second.block_number > first.block_number);
        assert!(first.tx_hash.starts_with("0x"));
    }

    #[test]
    fn operation_reports_its_event_and_deal() {
        let op = LedgerOperation::Fund {
            deal_id: "deal_b".into(),
            amount: "50.25".into(),
        };

        assert_eq!(op.event(), DealEvent::Fund);
        assert_eq!(op.deal_id(), "deal_b");
    }
}
