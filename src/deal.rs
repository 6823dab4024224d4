//! Core deal record, draft builder and persisted-value codecs
use super::error::DraftError;
use super::state::{DealEvent, DealState, InvalidTransition};
use chrono::{DateTime, TimeZone, Utc};

#[derive(Debug, Clone)]
pub struct TimeStamp<T: TimeZone>(DateTime<T>);

impl<T: TimeZone> PartialEq for TimeStamp<T> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl<T: TimeZone> Eq for TimeStamp<T> {}

impl<T: TimeZone> PartialOrd for TimeStamp<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: TimeZone> Ord for TimeStamp<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

impl TimeStamp<Utc> {
    pub fn new() -> Self {
        Self(Utc::now())
    }
    pub fn new_with(year: i32, month: u32, day: u32, hour: u32, min: u32, sec: u32) -> Self {
        Utc.with_ymd_and_hms(year, month, day, hour, min, sec)
            .unwrap()
            .into()
    }
    pub fn to_datetime_utc(&self) -> DateTime<Utc> {
        self.0
    }
    /// Nanoseconds since the epoch, `None` for dates outside the encodable
    /// i64 range (same bound the CBOR codec enforces).
    pub fn nanos(&self) -> Option<i64> {
        self.0.timestamp_nanos_opt()
    }
}

impl Default for TimeStamp<Utc> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: TimeZone> From<DateTime<T>> for TimeStamp<T> {
    fn from(value: DateTime<T>) -> Self {
        TimeStamp(value)
    }
}

impl<C> minicbor::Encode<C> for TimeStamp<Utc> {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        if let Some(nsec) = self.0.timestamp_nanos_opt() {
            return e.i64(nsec)?.ok();
        }

        Err(minicbor::encode::Error::message(
            "failed to encode timestamp. timestamp_nanos_opt returned None",
        ))
    }
}

impl<'b, C> minicbor::Decode<'b, C> for TimeStamp<Utc> {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let nsecs = d.i64()?;

        Ok(TimeStamp(DateTime::from_timestamp_nanos(nsecs)))
    }
}

/// Reference to the confirmed external ledger transaction backing one
/// transition.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct LedgerRef {
    #[n(0)]
    pub tx_hash: String,
    #[n(1)]
    pub block_number: u64,
    #[n(2)]
    pub confirmed_at: TimeStamp<Utc>,
}

/// One confirmed event together with the ledger transaction that produced it.
/// The ordered list of these on a [`Deal`] is the source of truth the cached
/// `state` field is folded from.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct ConfirmedEvent {
    #[n(0)]
    pub event: DealEvent,
    #[n(1)]
    pub ledger_ref: LedgerRef,
}

// Used for constructing new deals before anything is persisted
#[derive(Debug, Default, Clone)]
pub struct DealDraft {
    payer: Option<String>,
    payee: Option<String>,
    token: Option<String>,
    amount: Option<String>,
    metadata_uri: Option<String>,
}

impl DealDraft {
    /// Construct a new draft, the basis for a `create` operation
    pub fn new() -> Self {
        Self::default()
    }
    pub fn set_payer(mut self, payer: impl Into<String>) -> Self {
        self.payer = Some(payer.into());
        self
    }
    pub fn set_payee(mut self, payee: impl Into<String>) -> Self {
        self.payee = Some(payee.into());
        self
    }
    pub fn set_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }
    /// Amounts are decimal strings, never floats
    pub fn set_amount(mut self, amount: impl Into<String>) -> Self {
        self.amount = Some(amount.into());
        self
    }
    pub fn set_metadata_uri(mut self, uri: impl Into<String>) -> Self {
        self.metadata_uri = Some(uri.into());
        self
    }

    pub fn payer(&self) -> Option<&str> {
        self.payer.as_deref()
    }
    pub fn payee(&self) -> Option<&str> {
        self.payee.as_deref()
    }
    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }
    pub fn amount(&self) -> Option<&str> {
        self.amount.as_deref()
    }

    /// Checks fields and performs validation without consuming the draft.
    pub fn validate(&self) -> Result<(), DraftError> {
        let payer = self.payer.as_deref().unwrap_or_default();
        let payee = self.payee.as_deref().unwrap_or_default();

        if payer.is_empty() {
            return Err(DraftError::MissingParty("payer"));
        }
        if payee.is_empty() {
            return Err(DraftError::MissingParty("payee"));
        }
        if payer == payee {
            return Err(DraftError::SameParty);
        }

        match self.amount.as_deref() {
            None => return Err(DraftError::MissingAmount),
            Some(amount) if !is_decimal_amount(amount) => {
                return Err(DraftError::InvalidAmount(amount.to_string()));
            }
            Some(_) => {}
        }

        Ok(())
    }
}

/// The persisted escrow deal record. Keyed by `deal_id` in the deals tree;
/// mutated only by the orchestrator, one mutation per confirmed event, and
/// never deleted.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Deal {
    #[n(0)]
    pub deal_id: String,
    #[n(1)]
    pub payer: String,
    #[n(2)]
    pub payee: String,
    #[n(3)]
    pub token: Option<String>,
    #[n(4)]
    pub amount: String, // decimal string
    #[n(5)]
    pub metadata_uri: Option<String>,
    #[n(6)]
    pub state: DealState, // cache of replay_state(), never independent truth
    #[n(7)]
    pub confirmed: Vec<ConfirmedEvent>,
    #[n(8)]
    pub created_by: String,
    #[n(9)]
    pub approved_by: Option<String>,
    #[n(10)]
    pub disputed_by: Option<String>,
    #[n(11)]
    pub cancelled_by: Option<String>,
    #[n(12)]
    pub created_at: TimeStamp<Utc>,
    #[n(13)]
    pub updated_at: TimeStamp<Utc>,
}

impl Deal {
    /// Build the initial record from a validated draft and the confirmed
    /// `Create` transaction.
    pub fn from_draft(
        deal_id: String,
        draft: DealDraft,
        creator: String,
        ledger_ref: LedgerRef,
    ) -> Result<Self, DraftError> {
        draft.validate()?;

        let now = TimeStamp::new();
        Ok(Self {
            deal_id,
            payer: draft.payer.unwrap_or_default(),
            payee: draft.payee.unwrap_or_default(),
            token: draft.token,
            amount: draft.amount.unwrap_or_default(),
            metadata_uri: draft.metadata_uri,
            state: DealState::Created,
            confirmed: vec![ConfirmedEvent {
                event: DealEvent::Create,
                ledger_ref,
            }],
            created_by: creator,
            approved_by: None,
            disputed_by: None,
            cancelled_by: None,
            created_at: now.clone(),
            updated_at: now,
        })
    }

    /// Apply one confirmed event: advance the cached state, stamp the
    /// actor field the event owns and append the ledger reference.
    pub fn apply(
        &mut self,
        event: DealEvent,
        actor: &str,
        ledger_ref: LedgerRef,
    ) -> Result<DealState, InvalidTransition> {
        let next = self.state.transition(event)?;

        match event {
            DealEvent::Approve => self.approved_by = Some(actor.to_string()),
            DealEvent::Dispute => self.disputed_by = Some(actor.to_string()),
            DealEvent::Cancel => self.cancelled_by = Some(actor.to_string()),
            DealEvent::Create | DealEvent::Fund | DealEvent::Release => {}
        }

        self.confirmed.push(ConfirmedEvent { event, ledger_ref });
        self.state = next;
        self.updated_at = TimeStamp::new();

        Ok(next)
    }

    /// Fold the confirmed event sequence through the transition table from
    /// `Created`. The persisted `state` must always equal this.
    pub fn replay_state(&self) -> Result<DealState, InvalidTransition> {
        self.confirmed
            .iter()
            .try_fold(DealState::Created, |state, confirmed| {
                state.transition(confirmed.event)
            })
    }

    /// The ledger reference of the most recent confirmation of `event`.
    pub fn ledger_ref_for(&self, event: DealEvent) -> Option<&LedgerRef> {
        self.confirmed
            .iter()
            .rev()
            .find(|confirmed| confirmed.event == event)
            .map(|confirmed| &confirmed.ledger_ref)
    }

    pub fn to_cbor(&self) -> anyhow::Result<Vec<u8>> {
        Ok(minicbor::to_vec(self)?)
    }

    pub fn from_cbor(bytes: &[u8]) -> anyhow::Result<Self> {
        Ok(minicbor::decode(bytes)?)
    }
}

/// Validates the `digits[.digits]` decimal-string shape with a nonzero value.
pub fn is_decimal_amount(s: &str) -> bool {
    let (int_part, frac_part) = match s.split_once('.') {
        Some((i, f)) => (i, Some(f)),
        None => (s, None),
    };

    if int_part.is_empty() || !int_part.bytes().all(|b| b.is_ascii_digit()) {
        return false;
    }
    if let Some(frac) = frac_part {
        if frac.is_empty() || !frac.bytes().all(|b| b.is_ascii_digit()) {
            return false;
        }
    }

    s.bytes().any(|b| (b'1'..=b'9').contains(&b))
}

/// Numeric ordering of two valid decimal strings, used for amount-sorted
/// listings so that "9.5" < "10".
pub fn cmp_decimal(a: &str, b: &str) -> std::cmp::Ordering {
    use std::cmp::Ordering;

    let (ai, af) = a.split_once('.').map_or((a, ""), |(i, f)| (i, f));
    let (bi, bf) = b.split_once('.').map_or((b, ""), |(i, f)| (i, f));

    let ai = ai.trim_start_matches('0');
    let bi = bi.trim_start_matches('0');

    match ai.len().cmp(&bi.len()).then_with(|| ai.cmp(bi)) {
        Ordering::Equal => {}
        other => return other,
    }

    // integer parts equal, compare fractions digit by digit with implicit
    // zero padding on the shorter side
    let width = af.len().max(bf.len());
    for idx in 0..width {
        let da = af.as_bytes().get(idx).copied().unwrap_or(b'0');
        let db = bf.as_bytes().get(idx).copied().unwrap_or(b'0');
        match da.cmp(&db) {
            Ordering::Equal => {}
            other => return other,
        }
    }

    Ordering::Equal
}
