//! Property-based tests for the deal transition table
//!
//! These tests use proptest to verify that the transition engine behaves
//! correctly across every `(state, event)` pair and across arbitrary event
//! sequences. The engine is the root of the whole lifecycle - bugs here
//! corrupt every deal record downstream.
//!
//! The properties target invariants that must hold regardless of the
//! specific inputs, catching edge cases that manual case selection would
//! miss.

use escrow_lifecycle::{
    deal::{Deal, DealDraft, LedgerRef, TimeStamp},
    state::{DealEvent, DealState},
};
use proptest::prelude::*;

// These property tests cover:
//
// 1. Totality - every pair either transitions or rejects, never both
// 2. Determinism - identical inputs always yield identical outputs
// 3. Self-loop idempotency - repeating a self-loop never moves the state
// 4. Terminal-state definition - terminal iff only self-loops remain
// 5. Fold reproduction - replaying confirmed events rebuilds the state
//
// What these tests DON'T cover (deliberately):
//
// - Persistence and concurrency (exercised in the sled-backed integration
//   tests, where a real store is available)
// - Authorization (a service-layer concern, not state derivation)

fn state_strategy() -> impl Strategy<Value = DealState> {
    prop_oneof![
        Just(DealState::Created),
        Just(DealState::Funded),
        Just(DealState::Approved),
        Just(DealState::Released),
        Just(DealState::Disputed),
        Just(DealState::Cancelled),
    ]
}

fn event_strategy() -> impl Strategy<Value = DealEvent> {
    prop_oneof![
        Just(DealEvent::Create),
        Just(DealEvent::Fund),
        Just(DealEvent::Approve),
        Just(DealEvent::Release),
        Just(DealEvent::Dispute),
        Just(DealEvent::Cancel),
    ]
}

fn test_ref(block: u64) -> LedgerRef {
    LedgerRef {
        tx_hash: format!("0x{block:064x}"),
        block_number: block,
        confirmed_at: TimeStamp::new(),
    }
}

fn test_deal() -> Deal {
    let draft = DealDraft::new()
        .set_payer("user_payer")
        .set_payee("user_payee")
        .set_amount("1000");
    Deal::from_draft("deal_prop".into(), draft, "user_payer".into(), test_ref(0)).unwrap()
}

// PROPERTY TESTS
proptest! {
    /// Property: the table is total - every pair either maps to a state or
    /// rejects with the full allowed-events set for that state. There is no
    /// silent third outcome.
    #[test]
    fn prop_transition_is_total(
        state in state_strategy(),
        event in event_strategy(),
    ) {
        match state.transition(event) {
            Ok(_) => {
                prop_assert!(state.accepts(event), "accepted event must be in allowed_events");
            }
            Err(err) => {
                prop_assert!(!state.accepts(event), "rejected event must not be in allowed_events");
                prop_assert_eq!(err.state, state);
                prop_assert_eq!(err.event, event);
                prop_assert_eq!(err.allowed, state.allowed_events());
            }
        }
    }

    /// Property: the engine is a pure function - the same pair always yields
    /// the same answer, independent of call order or repetition.
    #[test]
    fn prop_transition_is_deterministic(
        state in state_strategy(),
        event in event_strategy(),
    ) {
        let first = state.transition(event);
        let second = state.transition(event);
        let third = state.transition(event);

        prop_assert_eq!(&first, &second);
        prop_assert_eq!(&second, &third);
    }

    /// Property: applying a self-loop event repeatedly never changes the
    /// state. Covers the Create/Created and Fund/Funded no-ops among others.
    #[test]
    fn prop_self_loops_are_idempotent(
        state in state_strategy(),
        event in event_strategy(),
        repeats in 1usize..10,
    ) {
        if state.transition(event) != Ok(state) {
            // not a self-loop pair
            return Ok(());
        }

        let mut current = state;
        for _ in 0..repeats {
            current = current.transition(event).unwrap();
        }

        prop_assert_eq!(current, state);
    }

    /// Property: `is_terminal` means exactly "every allowed event maps back
    /// to the same state". The flag and the table can never drift apart.
    #[test]
    fn prop_terminal_iff_only_self_loops(state in state_strategy()) {
        let only_self_loops = state
            .allowed_events()
            .iter()
            .all(|&event| state.transition(event) == Ok(state));

        prop_assert_eq!(state.is_terminal(), only_self_loops);
    }

    /// Property: folding the confirmed event sequence through the engine,
    /// starting from Created, reproduces the cached state exactly - for any
    /// sequence of randomly chosen valid events.
    #[test]
    fn prop_replay_reproduces_state(
        picks in prop::collection::vec(any::<prop::sample::Index>(), 0..20),
    ) {
        let mut deal = test_deal();

        for (step, pick) in picks.into_iter().enumerate() {
            let allowed = deal.state.allowed_events();
            let event = allowed[pick.index(allowed.len())];
            deal.apply(event, "user_payer", test_ref(step as u64 + 1)).unwrap();
        }

        prop_assert_eq!(deal.replay_state().unwrap(), deal.state);
    }

    /// Property: terminal states never move again, whatever is thrown at
    /// them - every accepted event self-loops and everything else rejects.
    #[test]
    fn prop_terminal_states_are_stable(
        state in prop_oneof![Just(DealState::Released), Just(DealState::Cancelled)],
        events in prop::collection::vec(event_strategy(), 1..10),
    ) {
        let mut current = state;
        for event in events {
            if let Ok(next) = current.transition(event) {
                current = next;
            }
        }

        prop_assert_eq!(current, state);
    }
}

// TARGETED TESTS FOR SPECIFIC TABLE ENTRIES

#[test]
fn terminal_flags_match_the_table() {
    assert!(DealState::Released.is_terminal());
    assert!(DealState::Cancelled.is_terminal());

    assert!(!DealState::Created.is_terminal());
    assert!(!DealState::Funded.is_terminal());
    assert!(!DealState::Approved.is_terminal());
    assert!(!DealState::Disputed.is_terminal());
}

#[test]
fn initialization_and_funding_self_loops() {
    assert_eq!(
        DealState::Created.transition(DealEvent::Create),
        Ok(DealState::Created)
    );
    assert_eq!(
        DealState::Funded.transition(DealEvent::Fund),
        Ok(DealState::Funded)
    );
}

#[test]
fn dispute_paths_lead_to_cancellation_only() {
    let disputed = DealState::Funded.transition(DealEvent::Dispute).unwrap();
    assert_eq!(disputed, DealState::Disputed);

    assert_eq!(
        disputed.allowed_events(),
        &[DealEvent::Dispute, DealEvent::Cancel]
    );
    assert!(disputed.transition(DealEvent::Release).is_err());
    assert_eq!(
        disputed.transition(DealEvent::Cancel),
        Ok(DealState::Cancelled)
    );
}
