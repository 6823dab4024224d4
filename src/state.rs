//! Deal lifecycle states, events and the transition table
use std::fmt;

/// Lifecycle state of an escrow deal.
#[derive(
    minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, Eq, Ord, PartialEq, PartialOrd, Hash,
)]
pub enum DealState {
    #[n(0)]
    Created,
    #[n(1)]
    Funded,
    #[n(2)]
    Approved,
    #[n(3)]
    Released,
    #[n(4)]
    Disputed,
    #[n(5)]
    Cancelled,
}

/// An action attempted against a deal. Each confirmed event moves the deal
/// through the transition table exactly once.
#[derive(
    minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, Eq, Ord, PartialEq, PartialOrd, Hash,
)]
pub enum DealEvent {
    #[n(0)]
    Create,
    #[n(1)]
    Fund,
    #[n(2)]
    Approve,
    #[n(3)]
    Release,
    #[n(4)]
    Dispute,
    #[n(5)]
    Cancel,
}

/// A rejected `(state, event)` pair, carrying the full allowed-events set so
/// callers can present a corrective action instead of a generic failure.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("event {event} is not allowed in state {state}, allowed events: {allowed:?}")]
pub struct InvalidTransition {
    pub state: DealState,
    pub event: DealEvent,
    pub allowed: &'static [DealEvent],
}

impl DealState {
    /// The set of events the transition table accepts in this state, in
    /// table order. Self-loop events are included.
    pub fn allowed_events(self) -> &'static [DealEvent] {
        use DealEvent::*;
        match self {
            DealState::Created => &[Create, Fund, Cancel],
            DealState::Funded => &[Fund, Approve, Dispute, Cancel],
            DealState::Approved => &[Approve, Release, Dispute, Cancel],
            DealState::Released => &[Release],
            DealState::Disputed => &[Dispute, Cancel],
            DealState::Cancelled => &[Cancel],
        }
    }

    /// Whether the table has an entry for `(self, event)`.
    pub fn accepts(self, event: DealEvent) -> bool {
        self.allowed_events().contains(&event)
    }

    /// Apply `event` to this state. Pure and referentially transparent, so it
    /// is safe to call repeatedly for replay and re-validation.
    pub fn transition(self, event: DealEvent) -> Result<DealState, InvalidTransition> {
        use DealEvent::*;
        use DealState::*;
        let next = match (self, event) {
            (Created, Create) => Created, // initialization no-op
            (Created, Fund) => Funded,
            (Created, Cancel) => Cancelled,

            (Funded, Fund) => Funded, // additional funding
            (Funded, Approve) => Approved,
            (Funded, Dispute) => Disputed,
            (Funded, Cancel) => Cancelled,

            (Approved, Approve) => Approved,
            (Approved, Release) => Released,
            (Approved, Dispute) => Disputed,
            (Approved, Cancel) => Cancelled,

            (Released, Release) => Released, // terminal

            (Disputed, Dispute) => Disputed,
            (Disputed, Cancel) => Cancelled,

            (Cancelled, Cancel) => Cancelled, // terminal

            (state, event) => {
                return Err(InvalidTransition {
                    state,
                    event,
                    allowed: state.allowed_events(),
                });
            }
        };

        Ok(next)
    }

    /// A state is terminal when every allowed event maps back to itself, so
    /// no further state change is possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, DealState::Released | DealState::Cancelled)
    }
}

impl fmt::Display for DealState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DealState::Created => "created",
            DealState::Funded => "funded",
            DealState::Approved => "approved",
            DealState::Released => "released",
            DealState::Disputed => "disputed",
            DealState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

impl fmt::Display for DealEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DealEvent::Create => "create",
            DealEvent::Fund => "fund",
            DealEvent::Approve => "approve",
            DealEvent::Release => "release",
            DealEvent::Dispute => "dispute",
            DealEvent::Cancel => "cancel",
        };
        f.write_str(name)
    }
}

impl DealEvent {
    pub const ALL: [DealEvent; 6] = [
        DealEvent::Create,
        DealEvent::Fund,
        DealEvent::Approve,
        DealEvent::Release,
        DealEvent::Dispute,
        DealEvent::Cancel,
    ];
}

impl DealState {
    pub const ALL: [DealState; 6] = [
        DealState::Created,
        DealState::Funded,
        DealState::Approved,
        DealState::Released,
        DealState::Disputed,
        DealState::Cancelled,
    ];
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_transitions() {
        let state = DealState::Created;
        let state = state.transition(DealEvent::Fund).unwrap();
        assert_eq!(state, DealState::Funded);
        let state = state.transition(DealEvent::Approve).unwrap();
        assert_eq!(state, DealState::Approved);
        let state = state.transition(DealEvent::Release).unwrap();
        assert_eq!(state, DealState::Released);
        assert!(state.is_terminal());
    }

    #[test]
    fn rejection_carries_allowed_events() {
        let err = DealState::Created.transition(DealEvent::Approve).unwrap_err();

        assert_eq!(err.state, DealState::Created);
        assert_eq!(err.event, DealEvent::Approve);
        assert_eq!(
            err.allowed,
            &[DealEvent::Create, DealEvent::Fund, DealEvent::Cancel]
        );
    }

    #[test]
    fn terminal_states_only_self_loop() {
        for state in [DealState::Released, DealState::Cancelled] {
            for event in DealEvent::ALL {
                match state.transition(event) {
                    Ok(next) => assert_eq!(next, state),
                    Err(err) => assert_eq!(err.state, state),
                }
            }
        }
    }

    #[test]
    fn state_cbor_roundtrip() {
        for state in DealState::ALL {
            let encoded = minicbor::to_vec(state).unwrap();
            let decoded: DealState = minicbor::decode(&encoded).unwrap();
            assert_eq!(state, decoded);
        }
    }

    #[test]
    fn event_cbor_roundtrip() {
        for event in DealEvent::ALL {
            let encoded = minicbor::to_vec(event).unwrap();
            let decoded: DealEvent = minicbor::decode(&encoded).unwrap();
            assert_eq!(event, decoded);
        }
    }
}
