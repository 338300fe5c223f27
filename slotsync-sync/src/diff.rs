//! Change-set computation.
//!
//! Compares one file's extraction against the remote snapshot for the same
//! coverage window. Keyed by (partition, year, month):
//!
//! | extracted | snapshot | result |
//! |---|---|---|
//! | present | absent | Insert |
//! | present | present, slots differ | Update (whole-record replace) |
//! | absent | present, inside window | Delete |
//!
//! Partition-0 records on either side are dropped. Output order is
//! Insert, Update, Delete, each ascending by key, regardless of input order.

use std::collections::BTreeMap;

use slotsync_core::{Change, ChangeSet, CoverageWindow, RecordKey, SourceRecord};

/// Diff `extracted` against `snapshot`, limiting deletes to the window the
/// extraction itself covers.
pub fn diff(extracted: &[SourceRecord], snapshot: &[SourceRecord]) -> ChangeSet {
    diff_within(extracted, snapshot, &CoverageWindow::from_records(extracted))
}

/// Diff with an explicit coverage window.
pub fn diff_within(
    extracted: &[SourceRecord],
    snapshot: &[SourceRecord],
    window: &CoverageWindow,
) -> ChangeSet {
    let fresh = index(extracted);
    let mut remote = index(snapshot);

    let mut changes = Vec::new();
    for (key, record) in fresh {
        match remote.remove(&key) {
            None => changes.push(Change::insert(record.clone())),
            Some(old) if old.slots != record.slots => {
                changes.push(Change::update(key, old.slots.clone(), record.slots.clone()));
            }
            Some(_) => {}
        }
    }
    for (key, record) in remote {
        if window.contains(&key) {
            changes.push(Change::delete(record.clone()));
        }
    }
    ChangeSet::from_changes(changes)
}

/// Key the resolved records; for duplicate keys the last one wins.
fn index(records: &[SourceRecord]) -> BTreeMap<RecordKey, &SourceRecord> {
    records
        .iter()
        .filter(|r| r.partition.is_resolved())
        .map(|r| (r.key(), r))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use slotsync_core::{ChangeKind, PartitionKey, Period, SlotCounts};

    fn rec(partition: u32, year: i32, month: u32, slots: &[(&str, u32)]) -> SourceRecord {
        SourceRecord {
            partition: PartitionKey(partition),
            period: Period::new(year, month).unwrap(),
            slots: slots
                .iter()
                .map(|(label, count)| (label.to_string(), *count))
                .collect(),
        }
    }

    #[test]
    fn insert_update_delete() {
        let extracted = vec![
            rec(1, 2024, 1, &[("09:00", 3)]),
            rec(1, 2024, 2, &[("09:00", 5)]),
            rec(1, 2024, 4, &[("09:00", 1)]),
        ];
        let snapshot = vec![
            rec(1, 2024, 2, &[("09:00", 4)]),
            rec(1, 2024, 3, &[("09:00", 2)]),
            rec(1, 2024, 4, &[("09:00", 1)]),
        ];
        let set = diff(&extracted, &snapshot);
        let kinds: Vec<_> = set.iter().map(|c| (c.kind, c.key.period.month)).collect();
        assert_eq!(
            kinds,
            vec![
                (ChangeKind::Insert, 1),
                (ChangeKind::Update, 2),
                (ChangeKind::Delete, 3),
            ]
        );
        let update = set.iter().nth(1).unwrap();
        assert_eq!(update.before.as_ref().unwrap().get("09:00"), Some(&4));
        assert_eq!(update.after.as_ref().unwrap().get("09:00"), Some(&5));
    }

    #[test]
    fn snapshot_outside_window_is_never_deleted() {
        let extracted = vec![rec(1, 2024, 5, &[]), rec(1, 2024, 6, &[])];
        let snapshot = vec![
            rec(1, 2024, 4, &[]),
            rec(1, 2024, 7, &[]),
            rec(2, 2024, 5, &[]),
        ];
        assert!(diff(&extracted, &snapshot).is_empty());
    }

    #[test]
    fn empty_extraction_deletes_nothing() {
        let snapshot = vec![rec(1, 2024, 1, &[("09:00", 1)])];
        assert!(diff(&[], &snapshot).is_empty());
    }

    #[test]
    fn slot_label_removed_is_an_update() {
        let extracted = vec![rec(1, 2024, 1, &[("09:00", 1)])];
        let snapshot = vec![rec(1, 2024, 1, &[("09:00", 1), ("10:00", 2)])];
        let set = diff(&extracted, &snapshot);
        assert_eq!(set.counts().updates, 1);
        assert_eq!(
            set.iter().next().unwrap().after.as_ref().unwrap(),
            &SlotCounts::from([("09:00".to_string(), 1)])
        );
    }

    // -----------------------------------------------------------------------
    // Properties
    // -----------------------------------------------------------------------

    fn arb_record() -> impl Strategy<Value = SourceRecord> {
        (
            0u32..4,
            2023i32..2025,
            1u32..=12,
            proptest::collection::btree_map("[0-9]{2}:00", 0u32..20, 0..4),
        )
            .prop_map(|(partition, year, month, slots)| SourceRecord {
                partition: PartitionKey(partition),
                period: Period::new(year, month).unwrap(),
                slots,
            })
    }

    fn arb_records() -> impl Strategy<Value = Vec<SourceRecord>> {
        proptest::collection::vec(arb_record(), 0..24)
    }

    /// Last-wins dedup, matching what `index` does.
    fn dedup(records: &[SourceRecord]) -> Vec<SourceRecord> {
        index(records).into_values().cloned().collect()
    }

    proptest! {
        #[test]
        fn partition_zero_never_reaches_change_set(
            extracted in arb_records(),
            snapshot in arb_records(),
        ) {
            let set = diff(&extracted, &snapshot);
            prop_assert!(set.iter().all(|c| c.key.partition.is_resolved()));
        }

        #[test]
        fn diff_of_identical_sets_is_empty(records in arb_records()) {
            prop_assert!(diff(&records, &records).is_empty());
        }

        #[test]
        fn order_is_independent_of_input_order(
            extracted in arb_records(),
            snapshot in arb_records(),
        ) {
            let extracted = dedup(&extracted);
            let snapshot = dedup(&snapshot);
            let forward = diff(&extracted, &snapshot);

            let mut rev_extracted = extracted.clone();
            rev_extracted.reverse();
            let mut rev_snapshot = snapshot.clone();
            rev_snapshot.reverse();
            let backward = diff(&rev_extracted, &rev_snapshot);

            prop_assert_eq!(forward.clone(), backward);
            let keys: Vec<_> = forward.iter().map(|c| (c.kind, c.key)).collect();
            let mut sorted = keys.clone();
            sorted.sort();
            prop_assert_eq!(keys, sorted);
        }

        #[test]
        fn applying_changes_reaches_extracted_state(
            extracted in arb_records(),
            snapshot in arb_records(),
        ) {
            let set = diff(&extracted, &snapshot);
            let mut state: BTreeMap<RecordKey, SlotCounts> = index(&snapshot)
                .into_iter()
                .map(|(k, r)| (k, r.slots.clone()))
                .collect();
            for change in &set {
                match change.kind {
                    ChangeKind::Delete => { state.remove(&change.key); }
                    _ => { state.insert(change.key, change.after.clone().unwrap()); }
                }
            }
            let resolved: Vec<_> = dedup(&extracted);
            let replay: Vec<_> = resolved
                .iter()
                .map(|r| SourceRecord {
                    partition: r.partition,
                    period: r.period,
                    slots: state[&r.key()].clone(),
                })
                .collect();
            prop_assert!(diff(&resolved, &replay).is_empty());
        }
    }
}
