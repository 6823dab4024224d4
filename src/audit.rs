//! Append-only audit trail for transition attempts
//!
//! Every attempt the orchestrator decides on lands here, successful or not.
//! Entries live in two sled trees: a time-ordered primary tree keyed by the
//! sequence marker `[nanos BE][seq BE]`, and a per-deal index keyed by
//! `deal_id ++ 0x00 ++ marker`. Entries are never updated; the retention
//! purge is the only deletion path.
//!
//! The log stores whatever it is given. It has no knowledge of the
//! transition table; validity is the orchestrator's responsibility.
use super::deal::{LedgerRef, TimeStamp};
use super::error::EscrowError;
use super::state::{DealEvent, DealState};
use anyhow::Context;
use chrono::{Duration, Utc};
use sled::{Batch, Db, Tree};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

const ENTRIES_TREE: &str = "audit_log";
const BY_DEAL_TREE: &str = "audit_by_deal";

/// How many actors `aggregate_stats` reports.
const TOP_ACTORS: usize = 10;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditOutcome {
    /// The transition was confirmed and committed to the deal record.
    #[n(0)]
    Committed,
    /// The attempt was rejected before any local mutation.
    #[n(1)]
    Rejected,
}

/// Immutable record of one transition attempt.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct AuditEntry {
    /// Store-assigned insertion order, filled in at record time.
    #[n(0)]
    pub seq: u64,
    #[n(1)]
    pub deal_id: String,
    #[n(2)]
    pub actor: String,
    #[n(3)]
    pub prev_state: DealState,
    #[n(4)]
    pub event: DealEvent,
    #[n(5)]
    pub resulting_state: DealState,
    #[n(6)]
    pub outcome: AuditOutcome,
    #[n(7)]
    pub recorded_at: TimeStamp<Utc>,
    #[n(8)]
    pub reason: Option<String>,
    #[n(9)]
    pub ledger_ref: Option<LedgerRef>,
}

impl AuditEntry {
    pub fn committed(
        deal_id: String,
        actor: String,
        prev_state: DealState,
        event: DealEvent,
        resulting_state: DealState,
    ) -> Self {
        Self {
            seq: 0,
            deal_id,
            actor,
            prev_state,
            event,
            resulting_state,
            outcome: AuditOutcome::Committed,
            recorded_at: TimeStamp::new(),
            reason: None,
            ledger_ref: None,
        }
    }

    /// A rejected attempt leaves the state where it was.
    pub fn rejected(
        deal_id: String,
        actor: String,
        prev_state: DealState,
        event: DealEvent,
        reason: String,
    ) -> Self {
        Self {
            seq: 0,
            deal_id,
            actor,
            prev_state,
            event,
            resulting_state: prev_state,
            outcome: AuditOutcome::Rejected,
            recorded_at: TimeStamp::new(),
            reason: Some(reason),
            ledger_ref: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_ledger_ref(mut self, ledger_ref: LedgerRef) -> Self {
        self.ledger_ref = Some(ledger_ref);
        self
    }

    pub fn with_recorded_at(mut self, recorded_at: TimeStamp<Utc>) -> Self {
        self.recorded_at = recorded_at;
        self
    }
}

/// Optional criteria for [`AuditLog::query_global`]. Unset fields match
/// everything; the time range is half-open `[from, to)`.
#[derive(Debug, Default, Clone)]
pub struct AuditFilter {
    pub deal_id: Option<String>,
    pub actor: Option<String>,
    pub event: Option<DealEvent>,
    pub resulting_state: Option<DealState>,
    pub from: Option<TimeStamp<Utc>>,
    pub to: Option<TimeStamp<Utc>>,
}

impl AuditFilter {
    fn matches(&self, entry: &AuditEntry) -> bool {
        if let Some(deal_id) = &self.deal_id {
            if entry.deal_id != *deal_id {
                return false;
            }
        }
        if let Some(actor) = &self.actor {
            if entry.actor != *actor {
                return false;
            }
        }
        if let Some(event) = self.event {
            if entry.event != event {
                return false;
            }
        }
        if let Some(state) = self.resulting_state {
            if entry.resulting_state != state {
                return false;
            }
        }
        true
    }
}

/// One page of a descending per-deal query. `cursor` restarts the query
/// strictly after the last returned entry.
#[derive(Debug)]
pub struct AuditPage {
    pub entries: Vec<AuditEntry>,
    pub cursor: Option<String>,
}

/// Aggregate view over the entries of a time range, computed in one scan.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct AuditStats {
    pub total_events: u64,
    pub events_by_type: BTreeMap<DealEvent, u64>,
    pub states_by_type: BTreeMap<DealState, u64>,
    /// Descending by entry count, capped.
    pub top_actors: Vec<(String, u64)>,
    /// Committed entries per distinct deal seen in the range.
    pub avg_transitions_per_deal: f64,
}

pub struct AuditLog {
    db: Arc<Db>,
    entries: Tree,
    by_deal: Tree,
}

impl AuditLog {
    pub fn open(db: &Arc<Db>) -> anyhow::Result<Self> {
        Ok(Self {
            db: Arc::clone(db),
            entries: db.open_tree(ENTRIES_TREE)?,
            by_deal: db.open_tree(BY_DEAL_TREE)?,
        })
    }

    /// Best-effort durable write. Failures are reported to the observability
    /// sink and swallowed: by the time an entry is recorded the financial
    /// transition has already been decided, and audit persistence must never
    /// roll it back.
    pub fn record(&self, entry: AuditEntry) {
        let deal_id = entry.deal_id.clone();
        let event = entry.event;

        if let Err(error) = self.try_record(entry) {
            tracing::error!(%deal_id, %event, error = ?error, "audit write failed, entry dropped");
        }
    }

    /// The fallible write underneath [`record`](Self::record). Not retried
    /// at this layer. Returns the assigned sequence number.
    pub fn try_record(&self, mut entry: AuditEntry) -> anyhow::Result<u64> {
        let seq = self.db.generate_id()?;
        entry.seq = seq;

        let nanos = entry
            .recorded_at
            .nanos()
            .context("audit timestamp outside the encodable range")?;
        let marker = sequence_key(nanos, seq);
        let payload = minicbor::to_vec(&entry)?;

        self.entries.insert(marker, payload.clone())?;
        self.by_deal.insert(index_key(&entry.deal_id, &marker), payload)?;

        Ok(seq)
    }

    /// The entries of one deal, newest first. A full page carries a cursor
    /// that restarts the query at the next older entry.
    pub fn query_by_deal(
        &self,
        deal_id: &str,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<AuditPage, EscrowError> {
        let prefix = deal_prefix(deal_id);

        let upper = match cursor {
            Some(cursor) => {
                let marker = hex::decode(cursor)
                    .context("malformed continuation cursor")
                    .map_err(EscrowError::QueryFailed)?;
                let mut key = prefix.clone();
                key.extend_from_slice(&marker);
                key
            }
            None => {
                // longer than any real index key with this prefix
                let mut key = prefix.clone();
                key.extend_from_slice(&[0xff; MARKER_LEN + 1]);
                key
            }
        };

        let mut entries = Vec::new();
        let mut last_marker = None;

        for item in self.by_deal.range(prefix.clone()..upper).rev() {
            if entries.len() >= limit {
                break;
            }

            let (key, value) = item
                .context("audit index scan failed")
                .map_err(EscrowError::QueryFailed)?;
            let entry: AuditEntry = minicbor::decode(&value)
                .context("audit entry decode failed")
                .map_err(EscrowError::QueryFailed)?;

            last_marker = Some(key[prefix.len()..].to_vec());
            entries.push(entry);
        }

        let cursor = match last_marker {
            Some(marker) if entries.len() == limit => Some(hex::encode(marker)),
            _ => None,
        };

        Ok(AuditPage { entries, cursor })
    }

    /// Filtered scan over all deals, newest first.
    pub fn query_global(
        &self,
        filter: &AuditFilter,
        limit: usize,
    ) -> Result<Vec<AuditEntry>, EscrowError> {
        let lower = filter
            .from
            .as_ref()
            .and_then(|ts| ts.nanos())
            .map(|nanos| sequence_key(nanos, 0))
            .unwrap_or([0; MARKER_LEN]);
        let upper = filter
            .to
            .as_ref()
            .and_then(|ts| ts.nanos())
            .map(|nanos| sequence_key(nanos, 0))
            .unwrap_or([0xff; MARKER_LEN]);

        let mut entries = Vec::new();
        for item in self.entries.range(lower..upper).rev() {
            if entries.len() >= limit {
                break;
            }

            let (_, value) = item
                .context("audit scan failed")
                .map_err(EscrowError::QueryFailed)?;
            let entry: AuditEntry = minicbor::decode(&value)
                .context("audit entry decode failed")
                .map_err(EscrowError::QueryFailed)?;

            if filter.matches(&entry) {
                entries.push(entry);
            }
        }

        Ok(entries)
    }

    /// Aggregate statistics over `[from, to)`, computed in a single scan.
    pub fn aggregate_stats(
        &self,
        from: &TimeStamp<Utc>,
        to: &TimeStamp<Utc>,
    ) -> Result<AuditStats, EscrowError> {
        let lower = from.nanos().map(|n| sequence_key(n, 0)).unwrap_or([0; MARKER_LEN]);
        let upper = to
            .nanos()
            .map(|n| sequence_key(n, 0))
            .unwrap_or([0xff; MARKER_LEN]);

        let mut stats = AuditStats::default();
        let mut actors: BTreeMap<String, u64> = BTreeMap::new();
        let mut deals: BTreeSet<String> = BTreeSet::new();
        let mut committed: u64 = 0;

        for item in self.entries.range(lower..upper) {
            let (_, value) = item
                .context("audit scan failed")
                .map_err(EscrowError::QueryFailed)?;
            let entry: AuditEntry = minicbor::decode(&value)
                .context("audit entry decode failed")
                .map_err(EscrowError::QueryFailed)?;

            stats.total_events += 1;
            *stats.events_by_type.entry(entry.event).or_default() += 1;
            *stats.states_by_type.entry(entry.resulting_state).or_default() += 1;
            *actors.entry(entry.actor.clone()).or_default() += 1;

            deals.insert(entry.deal_id.clone());
            if entry.outcome == AuditOutcome::Committed {
                committed += 1;
            }
        }

        let mut top: Vec<(String, u64)> = actors.into_iter().collect();
        top.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        top.truncate(TOP_ACTORS);
        stats.top_actors = top;

        if !deals.is_empty() {
            stats.avg_transitions_per_deal = committed as f64 / deals.len() as f64;
        }

        Ok(stats)
    }

    /// The retention purge: removes entries strictly older than the horizon
    /// from both trees and reports what it did to the observability sink.
    /// This is the only permitted deletion path.
    pub fn purge_older_than(&self, days: u64) -> Result<usize, EscrowError> {
        let horizon = Utc::now() - Duration::days(days as i64);
        let horizon_nanos = horizon
            .timestamp_nanos_opt()
            .context("retention horizon outside the encodable range")
            .map_err(EscrowError::Storage)?;
        let upper = sequence_key(horizon_nanos, 0);

        let mut primary = Batch::default();
        let mut index = Batch::default();
        let mut count = 0usize;

        for item in self.entries.range(..upper) {
            let (key, value) = item
                .context("audit scan failed")
                .map_err(EscrowError::Storage)?;
            let entry: AuditEntry = minicbor::decode(&value)
                .context("audit entry decode failed")
                .map_err(EscrowError::Storage)?;

            index.remove(index_key(&entry.deal_id, &key));
            primary.remove(key);
            count += 1;
        }

        self.entries
            .apply_batch(primary)
            .context("audit purge failed")
            .map_err(EscrowError::Storage)?;
        self.by_deal
            .apply_batch(index)
            .context("audit index purge failed")
            .map_err(EscrowError::Storage)?;

        tracing::info!(count, days, "purged audit entries past the retention horizon");

        Ok(count)
    }
}

const MARKER_LEN: usize = 16;

/// `[nanos BE][seq BE]`: chronological first, insertion order as tiebreaker.
fn sequence_key(nanos: i64, seq: u64) -> [u8; MARKER_LEN] {
    let mut key = [0u8; MARKER_LEN];
    key[..8].copy_from_slice(&(nanos as u64).to_be_bytes());
    key[8..].copy_from_slice(&seq.to_be_bytes());
    key
}

fn deal_prefix(deal_id: &str) -> Vec<u8> {
    let mut prefix = deal_id.as_bytes().to_vec();
    prefix.push(0);
    prefix
}

fn index_key(deal_id: &str, marker: &[u8]) -> Vec<u8> {
    let mut key = deal_prefix(deal_id);
    key.extend_from_slice(marker);
    key
}
