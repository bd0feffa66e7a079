//! Normalization and dedup: turns raw, possibly malformed, on-disk records
//! into the strict, deduped maps the rest of the engine works with.
//!
//! Mirrors `spec.md §4.2` step by step: drop anything missing identity,
//! adopt an override's `eventStartsAt` when the record itself lacks one,
//! reset an invalid status to `scheduled`, convert `cancelled` to a drop
//! and `deleted` to the deleted pool regardless of which on-disk list a
//! record was found in, recompute `slotKey` when the id isn't already of
//! the deterministic form, and finally dedup by slot key.

use std::collections::BTreeMap;

use tracing::warn;

use crate::model::{PendingRecord, PendingStatus, RawPendingRecord};
use crate::slot::SlotKey;
use crate::LOG_TARGET;

#[derive(Clone, Copy, PartialEq)]
enum Pool {
    Pending,
    Deleted,
}

/// Validates and dedups raw records loaded from disk into the `(pending,
/// deleted)` maps the store works with, plus whether anything about the
/// input needed fixing up — the caller saves back only when this is `true`.
///
/// When the same slot key turns up more than once — across pools or within
/// one — the record with the higher [`PendingRecord::dedup_rank`] wins
/// (`published > manualOverrides > queued > scheduled > missed > others`);
/// ties prefer whichever copy was seen first, which means a pending record
/// always beats an equal-priority deleted one.
pub fn normalize(raw_pending: Vec<RawPendingRecord>, raw_deleted: Vec<RawPendingRecord>) -> (BTreeMap<SlotKey, PendingRecord>, BTreeMap<SlotKey, PendingRecord>, bool) {
    let mut winners: BTreeMap<SlotKey, (Pool, PendingRecord)> = BTreeMap::new();
    let mut changed = false;

    for raw in raw_pending {
        changed |= consider(&mut winners, raw, Pool::Pending);
    }
    for raw in raw_deleted {
        changed |= consider(&mut winners, raw, Pool::Deleted);
    }

    let mut pending = BTreeMap::new();
    let mut deleted = BTreeMap::new();
    for (key, (pool, record)) in winners {
        match pool {
            Pool::Pending => pending.insert(key, record),
            Pool::Deleted => deleted.insert(key, record),
        };
    }
    (pending, deleted, changed)
}

/// Returns whether the document needs a rewrite: either this record was
/// dropped/deduped away, or `repair` had to fix something about it.
fn consider(winners: &mut BTreeMap<SlotKey, (Pool, PendingRecord)>, raw: RawPendingRecord, origin: Pool) -> bool {
    let Some((pool, record, record_was_repaired)) = repair(raw, origin) else {
        warn!(target: LOG_TARGET, "Dropping pending record missing required identity fields");
        return true;
    };

    match winners.get(&record.slot_key) {
        Some((_, existing)) if existing.dedup_rank() >= record.dedup_rank() => true,
        // Replacing a lower-priority duplicate is itself a change, even if
        // this particular copy needed no repair of its own.
        Some(_) => {
            winners.insert(record.slot_key.clone(), (pool, record));
            true
        }
        None => {
            winners.insert(record.slot_key.clone(), (pool, record));
            record_was_repaired
        }
    }
}

fn repair(raw: RawPendingRecord, origin: Pool) -> Option<(Pool, PendingRecord, bool)> {
    let target_id = raw.target_id?;
    let profile_key = raw.profile_key?;
    let mut changed = raw.event_starts_at.is_none();
    let event_starts_at = raw
        .event_starts_at
        .or_else(|| raw.manual_overrides.as_ref().and_then(|o| o.event_starts_at))?;

    changed |= raw.status.is_none();
    let raw_status = raw.status.unwrap_or(PendingStatus::Scheduled);
    // Step 4: cancelled is dropped outright; it must never persist across a
    // restart's normalization (spec.md §3 invariant 6).
    if raw_status == PendingStatus::Cancelled {
        return None;
    }
    // A `deleted` status always lands in the deleted pool regardless of
    // which on-disk list it was found under; anything else keeps whichever
    // pool it was loaded from.
    let pool = if raw_status == PendingStatus::Deleted { Pool::Deleted } else { origin };
    changed |= pool != origin;
    // `deleted` pool membership is tracked by which map a record lands in,
    // not by the status field; a record whose status says `deleted` still
    // needs a concrete status of its own once it's there.
    let status = if raw_status == PendingStatus::Deleted { PendingStatus::Scheduled } else { raw_status };

    let slot_key = match raw.slot_key.map(SlotKey::from) {
        Some(key) if key.looks_deterministic() => key,
        _ => {
            changed = true;
            SlotKey::new(&target_id, &profile_key, event_starts_at)
        }
    };
    let id = match raw.id.map(SlotKey::from) {
        Some(id) if id.looks_deterministic() => id,
        _ => {
            changed = true;
            slot_key.clone()
        }
    };

    Some((
        pool,
        PendingRecord {
            id,
            slot_key,
            target_id,
            profile_key,
            event_starts_at,
            scheduled_publish_time: raw.scheduled_publish_time.unwrap_or(event_starts_at),
            status,
            missed_at: raw.missed_at,
            queued_at: raw.queued_at,
            deleted_at: raw.deleted_at,
            event_id: raw.event_id,
            attempt_count: raw.attempt_count,
            last_error: raw.last_error,
            manual_overrides: raw.manual_overrides,
        },
        changed,
    ))
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;

    fn raw(target_id: &str, profile_key: &str, status: Option<PendingStatus>) -> RawPendingRecord {
        RawPendingRecord {
            target_id: Some(target_id.into()),
            profile_key: Some(profile_key.into()),
            event_starts_at: Some(datetime!(2026-03-06 19:00 UTC)),
            status,
            ..Default::default()
        }
    }

    #[test]
    fn record_missing_identity_is_dropped() {
        let broken = RawPendingRecord {
            target_id: Some("t".into()),
            ..Default::default()
        };
        let (pending, deleted, changed) = normalize(vec![broken], vec![]);
        assert!(pending.is_empty());
        assert!(deleted.is_empty());
        assert!(changed);
    }

    #[test]
    fn missing_slot_key_is_regenerated_deterministically() {
        let (pending, _, changed) = normalize(vec![raw("t", "p", None)], vec![]);
        let record = pending.values().next().unwrap();
        assert!(record.slot_key.looks_deterministic());
        assert_eq!(record.scheduled_publish_time, record.event_starts_at);
        assert_eq!(record.status, PendingStatus::Scheduled);
        assert!(changed);
    }

    #[test]
    fn cancelled_status_is_dropped_entirely() {
        let (pending, deleted, changed) = normalize(vec![raw("t", "p", Some(PendingStatus::Cancelled))], vec![]);
        assert!(pending.is_empty());
        assert!(deleted.is_empty());
        assert!(changed);
    }

    #[test]
    fn deleted_status_lands_in_the_deleted_pool_even_from_the_pending_list() {
        let (pending, deleted, changed) = normalize(vec![raw("t", "p", Some(PendingStatus::Deleted))], vec![]);
        assert!(pending.is_empty());
        assert_eq!(deleted.len(), 1);
        assert!(changed);
    }

    #[test]
    fn higher_priority_status_wins_dedup_across_pools() {
        let pending_copy = raw("t", "p", Some(PendingStatus::Scheduled));
        let published_copy = raw("t", "p", Some(PendingStatus::Published));

        let (pending, deleted, changed) = normalize(vec![pending_copy], vec![published_copy]);
        assert!(pending.is_empty());
        assert_eq!(deleted.values().next().unwrap().status, PendingStatus::Published);
        assert!(changed);
    }

    #[test]
    fn equal_priority_tie_prefers_pending_pool() {
        let a = raw("t", "p", Some(PendingStatus::Scheduled));
        let b = raw("t", "p", Some(PendingStatus::Scheduled));

        let (pending, deleted, changed) = normalize(vec![a], vec![b]);
        assert_eq!(pending.len(), 1);
        assert!(deleted.is_empty());
        assert!(changed);
    }

    #[test]
    fn a_manual_overrides_bag_wins_dedup_over_a_plain_scheduled_duplicate() {
        let overridden = RawPendingRecord {
            manual_overrides: Some(crate::model::ManualOverrides {
                title: Some("Renamed".into()),
                ..Default::default()
            }),
            ..raw("t", "p", Some(PendingStatus::Missed))
        };
        let plain = raw("t", "p", Some(PendingStatus::Scheduled));

        let (pending, deleted, changed) = normalize(vec![plain, overridden], vec![]);
        assert!(deleted.is_empty());
        let winner = pending.values().next().unwrap();
        assert_eq!(winner.status, PendingStatus::Missed);
        assert!(winner.is_modified());
        assert!(changed);
    }

    #[test]
    fn already_clean_input_reports_no_change() {
        let clean = RawPendingRecord {
            slot_key: Some("pending_t_p_1741287600000".into()),
            scheduled_publish_time: Some(datetime!(2026-03-03 19:00 UTC)),
            ..raw("t", "p", Some(PendingStatus::Scheduled))
        };
        let (pending, _, changed) = normalize(vec![clean], vec![]);
        assert_eq!(pending.len(), 1);
        assert!(!changed);
    }

    fn arb_status() -> impl proptest::strategy::Strategy<Value = PendingStatus> {
        proptest::prop_oneof![
            proptest::strategy::Just(PendingStatus::Scheduled),
            proptest::strategy::Just(PendingStatus::Queued),
            proptest::strategy::Just(PendingStatus::Missed),
            proptest::strategy::Just(PendingStatus::Published),
        ]
    }

    proptest::proptest! {
        /// Normalizing the output of a normalize pass is always a no-op: a
        /// document that's already been through `normalize` once should never
        /// report `changed` a second time, and its records must survive
        /// unchanged (no further dedup, no slot-key/id regeneration).
        #[test]
        fn normalizing_already_normalized_output_is_idempotent(
            target_id in "[a-z]{1,8}",
            profile_key in "[a-z]{1,8}",
            unix_seconds in 0i64..4_102_444_800,
            status in arb_status(),
        ) {
            let starts_at = time::OffsetDateTime::from_unix_timestamp(unix_seconds).unwrap();
            let input = RawPendingRecord {
                target_id: Some(target_id),
                profile_key: Some(profile_key),
                event_starts_at: Some(starts_at),
                scheduled_publish_time: Some(starts_at),
                status: Some(status),
                ..Default::default()
            };
            let (pending, deleted, _) = normalize(vec![input], vec![]);

            let reraw: Vec<RawPendingRecord> = pending
                .values()
                .chain(deleted.values())
                .map(|r| RawPendingRecord {
                    id: Some(r.id.as_str().to_owned()),
                    slot_key: Some(r.slot_key.as_str().to_owned()),
                    target_id: Some(r.target_id.clone()),
                    profile_key: Some(r.profile_key.clone()),
                    event_starts_at: Some(r.event_starts_at),
                    scheduled_publish_time: Some(r.scheduled_publish_time),
                    status: Some(r.status),
                    missed_at: r.missed_at,
                    queued_at: r.queued_at,
                    deleted_at: r.deleted_at,
                    event_id: r.event_id.clone(),
                    attempt_count: r.attempt_count,
                    last_error: r.last_error.clone(),
                    manual_overrides: r.manual_overrides.clone(),
                })
                .collect();

            let (pending_again, deleted_again, changed_again) = normalize(reraw, vec![]);
            prop_assert!(!changed_again);
            prop_assert_eq!(pending_again.len() + deleted_again.len(), pending.len() + deleted.len());
        }
    }
}
