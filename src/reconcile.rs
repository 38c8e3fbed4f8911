//! Read-only ledger consistency scan
//!
//! A load or supply touches the tanker and the branch tank in two separate
//! transactions, so a failure between them leaves a half-applied event.
//! This scan surfaces the traces such failures leave in the ledger. It
//! never repairs anything.
use super::ledger::{EntryKind, LedgerEntry, SupplyMethod};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscrepancyKind {
    /// Tanker before/after do not differ by the entry quantity.
    TankerArithmetic,
    /// Branch tank before/after do not fit the entry quantity.
    BranchArithmetic,
    /// A drum supply carries tanker readings.
    DrumTouchedTanker,
    /// An entry's tanker-before does not join the driver's previous tanker-after.
    TankerChainGap { previous_entry_id: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Discrepancy {
    pub entry_id: String,
    pub driver_id: String,
    pub kind: DiscrepancyKind,
    pub detail: String,
}

fn check_entry(entry: &LedgerEntry, found: &mut Vec<Discrepancy>) {
    let q = i128::from(entry.quantity_liters);
    let mut flag = |kind: DiscrepancyKind, detail: String| {
        found.push(Discrepancy {
            entry_id: entry.id.clone(),
            driver_id: entry.driver_id.clone(),
            kind,
            detail,
        })
    };

    match (entry.kind, entry.supply_method) {
        (EntryKind::Supply, Some(SupplyMethod::Drum)) => {
            if entry.tanker_before.is_some() || entry.tanker_after.is_some() {
                flag(
                    DiscrepancyKind::DrumTouchedTanker,
                    format!("tanker {:?} -> {:?}", entry.tanker_before, entry.tanker_after),
                );
            }
        }
        (kind, _) => {
            if let (Some(before), Some(after)) = (entry.tanker_before, entry.tanker_after) {
                let moved = match kind {
                    EntryKind::Loading => i128::from(after) - i128::from(before),
                    EntryKind::Supply => i128::from(before) - i128::from(after),
                };
                if moved != q {
                    flag(
                        DiscrepancyKind::TankerArithmetic,
                        format!("tanker {before} -> {after} for {q} L"),
                    );
                }
            }
        }
    }

    if let (Some(before), Some(after)) = (entry.branch_tank_before, entry.branch_tank_after) {
        let ok = match entry.kind {
            EntryKind::Loading => i128::from(before) - i128::from(after) == q,
            // supplies may be capped at capacity
            EntryKind::Supply => after >= before && i128::from(after - before) <= q,
        };
        if !ok {
            flag(
                DiscrepancyKind::BranchArithmetic,
                format!("branch tank {before} -> {after} for {q} L"),
            );
        }
    }
}

/// Scan entries for inconsistent before/after pairs.
///
/// A driver's tanker chain is walked in tanker version order, which is the
/// order the tanker writes committed in. Entries without a version fall
/// back to timestamp order.
pub fn scan(entries: &[LedgerEntry]) -> Vec<Discrepancy> {
    let mut ordered: Vec<&LedgerEntry> = entries.iter().collect();
    ordered.sort_by(|a, b| {
        a.tanker_version
            .cmp(&b.tanker_version)
            .then_with(|| a.timestamp.cmp(&b.timestamp))
            .then_with(|| a.id.cmp(&b.id))
    });

    let mut found = Vec::new();
    let mut last_tanker: HashMap<&str, (&str, i64)> = HashMap::new();
    for entry in ordered {
        check_entry(entry, &mut found);

        let (Some(before), Some(after)) = (entry.tanker_before, entry.tanker_after) else {
            continue;
        };
        if let Some((previous_id, previous_after)) = last_tanker.get(entry.driver_id.as_str())
            && *previous_after != before
        {
            found.push(Discrepancy {
                entry_id: entry.id.clone(),
                driver_id: entry.driver_id.clone(),
                kind: DiscrepancyKind::TankerChainGap {
                    previous_entry_id: previous_id.to_string(),
                },
                detail: format!("previous entry left {previous_after} L, this one starts at {before} L"),
            });
        }
        last_tanker.insert(entry.driver_id.as_str(), (entry.id.as_str(), after));
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::PhotoRefs;
    use crate::types::TimeStamp;

    fn entry(id: &str, kind: EntryKind, q: u64, tanker: Option<(i64, i64)>, branch: Option<(u64, u64)>) -> LedgerEntry {
        LedgerEntry {
            id: id.into(),
            kind,
            supply_method: (kind == EntryKind::Supply).then_some(SupplyMethod::Loose),
            quantity_liters: q,
            driver_id: "d1".into(),
            branch_id: branch.map(|_| "b1".into()),
            oil_type_id: "diesel".into(),
            load_session_id: None,
            tanker_before: tanker.map(|t| t.0),
            tanker_after: tanker.map(|t| t.1),
            branch_tank_before: branch.map(|b| b.0),
            branch_tank_after: branch.map(|b| b.1),
            photos: PhotoRefs::new(),
            timestamp: TimeStamp::new(),
            tanker_version: None,
        }
    }

    #[test]
    fn consistent_history_is_clean() {
        let entries = vec![
            entry("2026-00001", EntryKind::Loading, 5_000, Some((0, 5_000)), None),
            entry("2026-00002", EntryKind::Supply, 3_000, Some((5_000, 2_000)), Some((0, 3_000))),
            // capped supply
            entry("2026-00003", EntryKind::Supply, 2_000, Some((2_000, 0)), Some((7_000, 8_000))),
        ];

        assert!(scan(&entries).is_empty());
    }

    #[test]
    fn chain_follows_commit_order_not_timestamps() {
        // stamped in one order, committed to the tanker in the other
        let mut load = entry("2026-00001", EntryKind::Loading, 1_000, Some((0, 1_000)), None);
        let mut late_stamp = entry("2026-00002", EntryKind::Supply, 100, Some((1_000, 900)), Some((0, 100)));
        let mut early_stamp = entry("2026-00003", EntryKind::Supply, 300, Some((900, 600)), Some((100, 400)));
        load.tanker_version = Some(1);
        late_stamp.tanker_version = Some(2);
        early_stamp.tanker_version = Some(3);
        load.timestamp = TimeStamp::new_with(2026, 3, 1, 8, 0, 0).unwrap();
        late_stamp.timestamp = TimeStamp::new_with(2026, 3, 1, 9, 0, 1).unwrap();
        early_stamp.timestamp = TimeStamp::new_with(2026, 3, 1, 9, 0, 0).unwrap();

        assert!(scan(&[early_stamp, load, late_stamp]).is_empty());
    }

    #[test]
    fn missing_tanker_write_breaks_the_chain() {
        let entries = vec![
            entry("2026-00001", EntryKind::Loading, 5_000, Some((0, 5_000)), None),
            entry("2026-00002", EntryKind::Loading, 1_000, Some((6_000, 7_000)), None),
        ];

        let found = scan(&entries);
        assert_eq!(found.len(), 1);
        assert_eq!(
            found[0].kind,
            DiscrepancyKind::TankerChainGap {
                previous_entry_id: "2026-00001".into()
            }
        );
    }

    #[test]
    fn arithmetic_mismatches_are_reported() {
        let mut drum = entry("2026-00003", EntryKind::Supply, 100, Some((10, 10)), Some((0, 100)));
        drum.supply_method = Some(SupplyMethod::Drum);
        let entries = vec![
            entry("2026-00001", EntryKind::Loading, 5_000, Some((0, 4_000)), Some((9_000, 3_000))),
            drum,
        ];

        let kinds: Vec<_> = scan(&entries).into_iter().map(|d| d.kind).collect();
        assert!(kinds.contains(&DiscrepancyKind::TankerArithmetic));
        assert!(kinds.contains(&DiscrepancyKind::BranchArithmetic));
        assert!(kinds.contains(&DiscrepancyKind::DrumTouchedTanker));
    }
}
