//! Property-based tests for tank slot writes and load session derivation
//!
//! Whatever sequence of manual, supply and load writes reaches a slot, its
//! level must stay within `[0, capacity]`, and a load session's status must
//! always agree with its ledger-derived remaining balance.

use proptest::prelude::*;
use tanker_ledger::{
    branch::{BranchTankSlot, TankRef},
    concurrency::{AuditReason, LevelChange, LevelWrite, apply_to_slot},
    session::{LoadSession, SessionStatus},
    types::{OilType, TimeStamp},
    utils,
};

fn tank() -> TankRef {
    TankRef::new("b1", "diesel")
}

/// Strategy to generate any of the three kinds of slot write
fn change_strategy() -> impl Strategy<Value = LevelChange> {
    prop_oneof![
        (-2_000i64..=12_000).prop_map(LevelChange::Absolute),
        (0u64..=6_000).prop_map(LevelChange::Increase),
        (0u64..=6_000).prop_map(LevelChange::Decrease),
    ]
}

fn write_for(slot: &BranchTankSlot, change: LevelChange) -> LevelWrite {
    match change {
        LevelChange::Absolute(level) => LevelWrite::manual(
            tank(),
            level,
            Some(slot.current_level_liters),
            slot.staleness_token(utils::new_session_id()),
            "staff",
        ),
        delta => LevelWrite::delta(tank(), delta, "driver", AuditReason::SupplyDestination),
    }
}

proptest! {
    /// Property: every successful write leaves 0 <= level <= capacity, and
    /// every rejected write leaves the slot untouched
    #[test]
    fn prop_slot_level_stays_within_capacity(
        capacity in 1u64..=10_000,
        changes in prop::collection::vec(change_strategy(), 1..=30)
    ) {
        let mut slot = BranchTankSlot::new(&OilType::new("diesel", "Diesel"), capacity);

        for change in changes {
            let before = slot.clone();
            let write = write_for(&slot, change);
            match apply_to_slot(&mut slot, &tank(), &write) {
                Ok(update) => {
                    prop_assert!(slot.current_level_liters <= slot.capacity_liters);
                    prop_assert_eq!(update.new_level, slot.current_level_liters);
                    prop_assert_eq!(update.update_version, before.update_version + 1);
                }
                Err(_) => {
                    prop_assert_eq!(&slot, &before);
                }
            }
        }
    }

    /// Property: increases never lose track of liters except what overflowed
    #[test]
    fn prop_increase_accounts_for_every_liter(
        capacity in 1u64..=10_000,
        start in 0u64..=10_000,
        amount in 0u64..=20_000
    ) {
        let start = start.min(capacity);
        let mut slot = BranchTankSlot::new(&OilType::new("diesel", "Diesel"), capacity);
        slot.current_level_liters = start;

        let write = LevelWrite::delta(tank(), LevelChange::Increase(amount), "driver", AuditReason::SupplyDestination);
        let update = apply_to_slot(&mut slot, &tank(), &write).unwrap();

        prop_assert_eq!(update.new_level - update.previous_level + update.clamped_liters, amount);
        prop_assert_eq!(update.new_level, (start + amount).min(capacity));
    }

    /// Property: status is completed exactly when loaded - supplied <= 0
    #[test]
    fn prop_session_status_matches_remaining(
        loaded in 1u64..=20_000,
        supplies in prop::collection::vec(0u64..=5_000, 0..=10)
    ) {
        let mut session = LoadSession::new(
            "2026-00001".into(),
            "d1".into(),
            "diesel".into(),
            None,
            loaded,
            TimeStamp::new(),
        );

        let mut supplied = 0;
        for quantity in supplies {
            supplied += quantity;
            session.apply_supplied_total(supplied);

            prop_assert_eq!(session.remaining_liters, loaded as i64 - supplied as i64);
            prop_assert_eq!(
                session.status == SessionStatus::Completed,
                loaded as i64 - supplied as i64 <= 0
            );
        }
    }
}
