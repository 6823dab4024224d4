//! Service layer API for escrow deal lifecycle operations
//!
//! The orchestrator. Every mutating operation runs the same sequence: load
//! the record, authorize the actor, validate the transition, submit to the
//! ledger and wait for confirmation, then commit the new state together with
//! the ledger reference under a compare-and-swap on the previous record
//! bytes. The ledger call happens strictly between store operations, never
//! inside one, and a failed swap retries the whole sequence from a fresh
//! read a bounded number of times before surfacing contention.
use super::audit::{AuditEntry, AuditLog};
use super::auth::{AuthorizationProvider, DealParties, required_capability};
use super::deal::{Deal, DealDraft, LedgerRef, cmp_decimal, is_decimal_amount};
use super::error::{DraftError, EscrowError};
use super::ledger::{LedgerAdapter, LedgerOperation};
use super::state::{DealEvent, DealState};
use sled::{Db, Tree};
use std::sync::Arc;

const DEALS_TREE: &str = "deals";

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// How many times a conflicted commit is retried from a fresh read
    /// before the operation surfaces `Contention`.
    pub max_commit_retries: u32,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            max_commit_retries: 3,
        }
    }
}

/// What a successful operation hands back to the caller.
#[derive(Debug, Clone)]
pub struct TransitionReceipt {
    pub deal_id: String,
    pub new_state: DealState,
    pub ledger_ref: LedgerRef,
}

pub struct EscrowService {
    deals: Tree,
    audit: AuditLog,
    ledger: Arc<dyn LedgerAdapter>,
    authorizer: Arc<dyn AuthorizationProvider>,
    config: ServiceConfig,
}

impl EscrowService {
    pub fn new(
        db: Arc<Db>,
        ledger: Arc<dyn LedgerAdapter>,
        authorizer: Arc<dyn AuthorizationProvider>,
    ) -> anyhow::Result<Self> {
        Self::with_config(db, ledger, authorizer, ServiceConfig::default())
    }

    pub fn with_config(
        db: Arc<Db>,
        ledger: Arc<dyn LedgerAdapter>,
        authorizer: Arc<dyn AuthorizationProvider>,
        config: ServiceConfig,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            deals: db.open_tree(DEALS_TREE)?,
            audit: AuditLog::open(&db)?,
            ledger,
            authorizer,
            config,
        })
    }

    /// The audit trail the service records into.
    pub fn audit_log(&self) -> &AuditLog {
        &self.audit
    }

    /// Create a new deal. The record is inserted only if the id is free;
    /// a lost creation race reports `AlreadyExists` like a plain duplicate.
    pub fn create_deal(
        &self,
        deal_id: String,
        actor: String,
        draft: DealDraft,
    ) -> Result<TransitionReceipt, EscrowError> {
        if self
            .deals
            .contains_key(deal_id.as_bytes())
            .map_err(storage)?
        {
            return Err(EscrowError::AlreadyExists(deal_id));
        }

        draft.validate()?;

        let capability = required_capability(DealEvent::Create);
        let authorized = {
            let parties = DealParties {
                payer: draft.payer().unwrap_or_default(),
                payee: draft.payee().unwrap_or_default(),
            };
            self.authorizer.has_capability(&actor, capability, &parties)
        };
        if !authorized {
            let err = EscrowError::Unauthorized {
                deal_id: deal_id.clone(),
                actor: actor.clone(),
                capability,
            };
            self.audit.record(AuditEntry::rejected(
                deal_id,
                actor,
                DealState::Created,
                DealEvent::Create,
                err.to_string(),
            ));
            return Err(err);
        }

        let operation = LedgerOperation::Create {
            deal_id: deal_id.clone(),
            payer: draft.payer().unwrap_or_default().to_string(),
            payee: draft.payee().unwrap_or_default().to_string(),
            token: draft.token().map(str::to_string),
            amount: draft.amount().unwrap_or_default().to_string(),
        };
        let ledger_ref = match self.ledger.submit(&operation) {
            Ok(ledger_ref) => ledger_ref,
            Err(err) => {
                self.audit.record(AuditEntry::rejected(
                    deal_id,
                    actor,
                    DealState::Created,
                    DealEvent::Create,
                    err.to_string(),
                ));
                return Err(err.into());
            }
        };

        let deal = Deal::from_draft(deal_id.clone(), draft, actor.clone(), ledger_ref.clone())?;
        let bytes = deal.to_cbor().map_err(EscrowError::Storage)?;

        let swap = self
            .deals
            .compare_and_swap(deal_id.as_bytes(), None::<&[u8]>, Some(bytes))
            .map_err(storage)?;
        if swap.is_err() {
            return Err(EscrowError::AlreadyExists(deal_id));
        }

        self.audit.record(
            AuditEntry::committed(
                deal_id.clone(),
                actor,
                DealState::Created,
                DealEvent::Create,
                DealState::Created,
            )
            .with_ledger_ref(ledger_ref.clone()),
        );
        tracing::info!(%deal_id, tx = %ledger_ref.tx_hash, "deal created");

        Ok(TransitionReceipt {
            deal_id,
            new_state: DealState::Created,
            ledger_ref,
        })
    }

    /// Fund the deal. Funding an already-funded deal is additional funding
    /// and leaves the state where it is.
    pub fn fund_deal(
        &self,
        deal_id: &str,
        actor: &str,
        amount: &str,
    ) -> Result<TransitionReceipt, EscrowError> {
        if !is_decimal_amount(amount) {
            return Err(DraftError::InvalidAmount(amount.to_string()).into());
        }

        let amount = amount.to_string();
        self.apply_event(
            deal_id,
            actor,
            DealEvent::Fund,
            |deal| LedgerOperation::Fund {
                deal_id: deal.deal_id.clone(),
                amount: amount.clone(),
            },
            Some(format!("funded {amount}")),
        )
    }

    pub fn approve_deal(
        &self,
        deal_id: &str,
        actor: &str,
    ) -> Result<TransitionReceipt, EscrowError> {
        self.apply_event(
            deal_id,
            actor,
            DealEvent::Approve,
            |deal| LedgerOperation::Approve {
                deal_id: deal.deal_id.clone(),
            },
            None,
        )
    }

    pub fn release_deal(
        &self,
        deal_id: &str,
        actor: &str,
    ) -> Result<TransitionReceipt, EscrowError> {
        self.apply_event(
            deal_id,
            actor,
            DealEvent::Release,
            |deal| LedgerOperation::Release {
                deal_id: deal.deal_id.clone(),
            },
            None,
        )
    }

    pub fn dispute_deal(
        &self,
        deal_id: &str,
        actor: &str,
        reason: &str,
    ) -> Result<TransitionReceipt, EscrowError> {
        self.apply_event(
            deal_id,
            actor,
            DealEvent::Dispute,
            |deal| LedgerOperation::Dispute {
                deal_id: deal.deal_id.clone(),
            },
            Some(reason.to_string()),
        )
    }

    pub fn cancel_deal(
        &self,
        deal_id: &str,
        actor: &str,
        reason: &str,
    ) -> Result<TransitionReceipt, EscrowError> {
        self.apply_event(
            deal_id,
            actor,
            DealEvent::Cancel,
            |deal| LedgerOperation::Cancel {
                deal_id: deal.deal_id.clone(),
            },
            Some(reason.to_string()),
        )
    }

    /// Load one deal record.
    pub fn get_deal(&self, deal_id: &str) -> Result<Deal, EscrowError> {
        let bytes = self
            .deals
            .get(deal_id.as_bytes())
            .map_err(storage)?
            .ok_or_else(|| EscrowError::NotFound(deal_id.to_string()))?;

        Deal::from_cbor(&bytes).map_err(EscrowError::Storage)
    }

    /// Read-only projection over the deal records. Carries no transition
    /// semantics.
    pub fn list_deals(
        &self,
        filter: &DealFilter,
        sort: DealSort,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Deal>, EscrowError> {
        let mut deals = Vec::new();
        for item in self.deals.iter() {
            let (_, value) = item.map_err(storage)?;
            let deal = Deal::from_cbor(&value).map_err(EscrowError::Storage)?;
            if filter.matches(&deal) {
                deals.push(deal);
            }
        }

        match sort {
            DealSort::CreatedAt => deals.sort_by(|a, b| {
                a.created_at
                    .cmp(&b.created_at)
                    .then_with(|| a.deal_id.cmp(&b.deal_id))
            }),
            DealSort::Amount => deals.sort_by(|a, b| {
                cmp_decimal(&a.amount, &b.amount).then_with(|| a.deal_id.cmp(&b.deal_id))
            }),
        }

        Ok(deals.into_iter().skip(offset).take(limit).collect())
    }

    /// The shared path of every mutating operation except create.
    fn apply_event<F>(
        &self,
        deal_id: &str,
        actor: &str,
        event: DealEvent,
        build_operation: F,
        reason: Option<String>,
    ) -> Result<TransitionReceipt, EscrowError>
    where
        F: Fn(&Deal) -> LedgerOperation,
    {
        let mut attempt = 0u32;

        loop {
            let old_bytes = self
                .deals
                .get(deal_id.as_bytes())
                .map_err(storage)?
                .ok_or_else(|| EscrowError::NotFound(deal_id.to_string()))?;
            let deal = Deal::from_cbor(&old_bytes).map_err(EscrowError::Storage)?;

            // authorization comes before any external call
            let capability = required_capability(event);
            if !self
                .authorizer
                .has_capability(actor, capability, &DealParties::from(&deal))
            {
                let err = EscrowError::Unauthorized {
                    deal_id: deal_id.to_string(),
                    actor: actor.to_string(),
                    capability,
                };
                self.audit.record(AuditEntry::rejected(
                    deal_id.to_string(),
                    actor.to_string(),
                    deal.state,
                    event,
                    err.to_string(),
                ));
                return Err(err);
            }

            // an already-invalid request never reaches the ledger
            let expected = match deal.state.transition(event) {
                Ok(next) => next,
                Err(err) => {
                    self.audit.record(AuditEntry::rejected(
                        deal_id.to_string(),
                        actor.to_string(),
                        deal.state,
                        event,
                        err.to_string(),
                    ));
                    return Err(err.into());
                }
            };

            let operation = build_operation(&deal);
            let ledger_ref = match self.ledger.submit(&operation) {
                Ok(ledger_ref) => ledger_ref,
                Err(err) => {
                    // no local state was touched, the caller may retry
                    self.audit.record(AuditEntry::rejected(
                        deal_id.to_string(),
                        actor.to_string(),
                        deal.state,
                        event,
                        err.to_string(),
                    ));
                    return Err(err.into());
                }
            };

            // re-derive and commit against the bytes read in this attempt
            let mut updated = deal.clone();
            let new_state = updated.apply(event, actor, ledger_ref.clone())?;
            debug_assert_eq!(new_state, expected);

            let new_bytes = updated.to_cbor().map_err(EscrowError::Storage)?;
            let swap = self
                .deals
                .compare_and_swap(deal_id.as_bytes(), Some(&old_bytes), Some(new_bytes))
                .map_err(storage)?;

            match swap {
                Ok(()) => {
                    let mut entry = AuditEntry::committed(
                        deal_id.to_string(),
                        actor.to_string(),
                        deal.state,
                        event,
                        new_state,
                    )
                    .with_ledger_ref(ledger_ref.clone());
                    if let Some(reason) = &reason {
                        entry = entry.with_reason(reason.clone());
                    }
                    self.audit.record(entry);

                    tracing::info!(
                        %deal_id, %event, state = %new_state, tx = %ledger_ref.tx_hash,
                        "deal transition committed"
                    );

                    return Ok(TransitionReceipt {
                        deal_id: deal_id.to_string(),
                        new_state,
                        ledger_ref,
                    });
                }
                Err(_conflict) => {
                    attempt += 1;
                    if attempt > self.config.max_commit_retries {
                        tracing::warn!(%deal_id, %event, attempt, "commit contention, retries exhausted");
                        return Err(EscrowError::Contention(deal_id.to_string()));
                    }
                    tracing::debug!(%deal_id, %event, attempt, "commit conflict, retrying from a fresh read");
                }
            }
        }
    }
}

/// Criteria for [`EscrowService::list_deals`]. Unset fields match everything.
#[derive(Debug, Default, Clone)]
pub struct DealFilter {
    pub state: Option<DealState>,
    pub payer: Option<String>,
    pub payee: Option<String>,
    pub token: Option<String>,
}

impl DealFilter {
    fn matches(&self, deal: &Deal) -> bool {
        if let Some(state) = self.state {
            if deal.state != state {
                return false;
            }
        }
        if let Some(payer) = &self.payer {
            if deal.payer != *payer {
                return false;
            }
        }
        if let Some(payee) = &self.payee {
            if deal.payee != *payee {
                return false;
            }
        }
        if let Some(token) = &self.token {
            if deal.token.as_deref() != Some(token.as_str()) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum DealSort {
    #[default]
    CreatedAt,
    Amount,
}

fn storage(err: sled::Error) -> EscrowError {
    EscrowError::Storage(err.into())
}
