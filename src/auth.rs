//! Authorization provider contract and the party/role implementation
use super::deal::Deal;
use super::state::DealEvent;
use std::collections::BTreeSet;
use std::fmt;

/// The capability an actor must hold before the orchestrator makes any
/// external call on their behalf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Capability {
    Create,
    Fund,
    Approve,
    Release,
    Dispute,
    Cancel,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Capability::Create => "create",
            Capability::Fund => "fund",
            Capability::Approve => "approve",
            Capability::Release => "release",
            Capability::Dispute => "dispute",
            Capability::Cancel => "cancel",
        };
        f.write_str(name)
    }
}

/// The capability gating each event.
pub fn required_capability(event: DealEvent) -> Capability {
    match event {
        DealEvent::Create => Capability::Create,
        DealEvent::Fund => Capability::Fund,
        DealEvent::Approve => Capability::Approve,
        DealEvent::Release => Capability::Release,
        DealEvent::Dispute => Capability::Dispute,
        DealEvent::Cancel => Capability::Cancel,
    }
}

/// The deal context an authorization decision is made against. For `create`
/// the deal does not exist yet, so the parties come from the draft.
#[derive(Debug, Clone, Copy)]
pub struct DealParties<'a> {
    pub payer: &'a str,
    pub payee: &'a str,
}

impl<'a> From<&'a Deal> for DealParties<'a> {
    fn from(deal: &'a Deal) -> Self {
        Self {
            payer: &deal.payer,
            payee: &deal.payee,
        }
    }
}

pub trait AuthorizationProvider: Send + Sync {
    fn has_capability(&self, actor: &str, capability: Capability, parties: &DealParties) -> bool;
}

/// Role provider derived from the deal's own parties plus configured arbiter
/// and admin identity sets: the payer funds, either party may create or
/// dispute, arbiters approve and release, admins cancel.
#[derive(Debug, Default, Clone)]
pub struct PartyAuthorizer {
    arbiters: BTreeSet<String>,
    admins: BTreeSet<String>,
}

impl PartyAuthorizer {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn with_arbiter(mut self, arbiter: impl Into<String>) -> Self {
        self.arbiters.insert(arbiter.into());
        self
    }
    pub fn with_admin(mut self, admin: impl Into<String>) -> Self {
        self.admins.insert(admin.into());
        self
    }
}

impl AuthorizationProvider for PartyAuthorizer {
    fn has_capability(&self, actor: &str, capability: Capability, parties: &DealParties) -> bool {
        match capability {
            Capability::Create => actor == parties.payer || actor == parties.payee,
            Capability::Fund => actor == parties.payer,
            Capability::Approve | Capability::Release => self.arbiters.contains(actor),
            Capability::Dispute => actor == parties.payer || actor == parties.payee,
            Capability::Cancel => self.admins.contains(actor),
        }
    }
}
