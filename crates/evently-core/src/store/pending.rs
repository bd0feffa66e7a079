//! In-memory pending-event store, persisted as a single JSON document.

use std::collections::BTreeMap;
use std::path::PathBuf;

use itertools::Itertools as _;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::model::{PendingRecord, PendingStatus, RawPendingRecord};
use crate::slot::SlotKey;
use crate::store::normalize::normalize;
use crate::{atomic_file, CoreResult, LOG_TARGET};

/// How many soft-deleted records the store keeps around for display/restore
/// before purging the oldest. Without a limit, deleted records would
/// accumulate forever since nothing else ever removes them. Overridden by
/// the on-disk document's `settings.displayLimit` once one has been saved.
pub const DEFAULT_DELETED_DISPLAY_LIMIT: usize = 200;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Settings {
    display_limit: usize,
}

#[derive(Debug, Serialize)]
struct PendingDocument<'r> {
    events: Vec<&'r PendingRecord>,
    deleted_events: Vec<&'r PendingRecord>,
    settings: Settings,
}

#[derive(Debug, Default, Deserialize)]
struct RawPendingDocument {
    #[serde(default)]
    events: Vec<RawPendingRecord>,
    #[serde(default)]
    deleted_events: Vec<RawPendingRecord>,
    #[serde(default)]
    settings: Option<Settings>,
}

/// Owns both the live `pending` pool and the soft-deleted `deleted` pool
/// backing a single on-disk document (`events`/`deletedEvents`/`settings`
/// per `spec.md §6`).
pub struct PendingStore {
    path: PathBuf,
    pending: BTreeMap<SlotKey, PendingRecord>,
    deleted: BTreeMap<SlotKey, PendingRecord>,
    deleted_display_limit: usize,
}

impl PendingStore {
    /// Loads the on-disk document, drops past-dated soft-deletes, and runs
    /// normalization (`spec.md §4.2`). When either step actually changed
    /// something — a malformed record repaired, a duplicate dropped, a
    /// stale deleted entry garbage-collected — the repaired result is saved
    /// back immediately (`spec.md §4.1`: "save back only if normalization
    /// changed anything"), so a malformed document gets durably fixed once
    /// instead of being silently re-repaired on every boot.
    pub async fn load(path: PathBuf, default_deleted_display_limit: usize) -> CoreResult<Self> {
        let raw: RawPendingDocument = atomic_file::read_or_default(&path).await?;
        let deleted_display_limit = raw.settings.map_or(default_deleted_display_limit, |s| s.display_limit);

        let now = time::OffsetDateTime::now_utc();
        let events_before = raw.events.len();
        let deleted_events_before = raw.deleted_events.len();
        let events = drop_past_deleted(raw.events, now);
        let deleted_events = drop_past_deleted(raw.deleted_events, now);
        let dropped_past_deleted = events.len() != events_before || deleted_events.len() != deleted_events_before;
        let (pending, deleted, normalize_changed) = normalize(events, deleted_events);

        info!(
            target: LOG_TARGET,
            path = %path.display(),
            pending = pending.len(),
            deleted = deleted.len(),
            "Loaded pending-event store",
        );

        let store = Self {
            path,
            pending,
            deleted,
            deleted_display_limit,
        };
        if dropped_past_deleted || normalize_changed {
            info!(target: LOG_TARGET, path = %store.path.display(), "Normalization changed the document; saving the repaired copy back");
            store.save().await?;
        }
        Ok(store)
    }

    pub async fn save(&self) -> CoreResult<()> {
        let doc = PendingDocument {
            events: self.pending.values().collect(),
            deleted_events: self.deleted.values().collect(),
            settings: Settings {
                display_limit: self.deleted_display_limit,
            },
        };
        atomic_file::write_atomic(&self.path, &doc).await
    }

    pub fn display_limit(&self) -> usize {
        self.deleted_display_limit
    }

    pub fn set_display_limit(&mut self, limit: usize) {
        self.deleted_display_limit = limit;
        self.enforce_deleted_limit();
    }

    pub fn get(&self, key: &SlotKey) -> Option<&PendingRecord> {
        self.pending.get(key)
    }

    pub fn get_mut(&mut self, key: &SlotKey) -> Option<&mut PendingRecord> {
        self.pending.get_mut(key)
    }

    pub fn get_deleted(&self, key: &SlotKey) -> Option<&PendingRecord> {
        self.deleted.get(key)
    }

    /// `GetPending(targetId?)`: excludes `cancelled`/`published`, per
    /// `spec.md §4.1`.
    pub fn iter_visible_pending(&self, target_id: Option<&str>) -> impl Iterator<Item = &PendingRecord> {
        self.pending
            .values()
            .filter(move |r| target_id.is_none_or(|t| r.target_id == t))
            .filter(|r| !matches!(r.status, PendingStatus::Cancelled | PendingStatus::Published))
    }

    pub fn iter_pending(&self) -> impl Iterator<Item = &PendingRecord> {
        self.pending.values()
    }

    pub fn iter_pending_for_profile<'s>(&'s self, target_id: &'s str, profile_key: &'s str) -> impl Iterator<Item = &'s PendingRecord> {
        self.pending.values().filter(move |r| r.target_id == target_id && r.profile_key == profile_key)
    }

    pub fn iter_deleted_for_profile<'s>(&'s self, target_id: &'s str, profile_key: &'s str) -> impl Iterator<Item = &'s PendingRecord> {
        self.deleted.values().filter(move |r| r.target_id == target_id && r.profile_key == profile_key)
    }

    pub fn iter_deleted(&self) -> impl Iterator<Item = &PendingRecord> {
        self.deleted.values()
    }

    pub fn missed_count(&self, target_id: Option<&str>) -> usize {
        self.pending
            .values()
            .filter(|r| target_id.is_none_or(|t| r.target_id == t))
            .filter(|r| r.status == PendingStatus::Missed)
            .count()
    }

    pub fn queued_count(&self, target_id: Option<&str>) -> usize {
        self.pending
            .values()
            .filter(|r| target_id.is_none_or(|t| r.target_id == t))
            .filter(|r| r.status == PendingStatus::Queued)
            .count()
    }

    /// Inserts or overwrites a pending record by its slot key.
    pub fn upsert(&mut self, record: PendingRecord) {
        self.pending.insert(record.slot_key.clone(), record);
    }

    /// Hard-removes a pending record (used when reconciliation finds a
    /// `published` record no longer exists remotely — dropping frees the
    /// slot key for a future expansion to regenerate).
    pub fn remove(&mut self, key: &SlotKey) -> Option<PendingRecord> {
        self.pending.remove(key)
    }

    /// Moves a pending record into the soft-deleted pool, enforcing the
    /// display limit by dropping the oldest deleted entry once it's
    /// exceeded.
    pub fn soft_delete(&mut self, key: &SlotKey) -> Option<PendingRecord> {
        let mut record = self.pending.remove(key)?;
        record.status = PendingStatus::Deleted;
        record.deleted_at = Some(time::OffsetDateTime::now_utc());
        record.queued_at = None;
        self.deleted.insert(record.slot_key.clone(), record.clone());
        self.enforce_deleted_limit();
        Some(record)
    }

    /// Moves a record back out of the soft-deleted pool into `pending`.
    /// Recomputing the publish time (the after-mode restore rule substitutes
    /// before-mode timing, since there's no previous slot to anchor against)
    /// is the caller's responsibility before calling this.
    pub fn restore(&mut self, key: &SlotKey) -> Option<PendingRecord> {
        let mut record = self.deleted.remove(key)?;
        record.status = PendingStatus::Scheduled;
        record.deleted_at = None;
        record.queued_at = None;
        self.pending.insert(record.slot_key.clone(), record.clone());
        Some(record)
    }

    /// Hard-removes every pending and deleted record belonging to a profile.
    pub fn purge_profile(&mut self, target_id: &str, profile_key: &str) {
        self.pending.retain(|_, r| !(r.target_id == target_id && r.profile_key == profile_key));
        self.deleted.retain(|_, r| !(r.target_id == target_id && r.profile_key == profile_key));
    }

    /// Intersects both pools against a known set of target ids, per
    /// `SetKnownTargets`. Returns how many records were dropped.
    pub fn prune_to_known_targets(&mut self, known: &std::collections::BTreeSet<String>) -> usize {
        let before = self.pending.len() + self.deleted.len();
        self.pending.retain(|_, r| known.contains(&r.target_id));
        self.deleted.retain(|_, r| known.contains(&r.target_id));
        before - (self.pending.len() + self.deleted.len())
    }

    fn enforce_deleted_limit(&mut self) {
        let Some(overflow) = self.deleted.len().checked_sub(self.deleted_display_limit) else {
            return;
        };
        let oldest_keys: Vec<SlotKey> = self
            .deleted
            .values()
            .sorted_by_key(|r| r.event_starts_at)
            .take(overflow)
            .map(|r| r.slot_key.clone())
            .collect();
        for key in oldest_keys {
            debug!(target: LOG_TARGET, slot_key = %key, "Purging oldest soft-deleted record past display limit");
            self.deleted.remove(&key);
        }
    }
}

/// Raw deleted entries whose `eventStartsAt` is already in the past are
/// garbage (`spec.md §3` "DeletedPool"): nothing can restore them to a
/// future slot, so they're dropped before normalization even sees them.
/// Non-deleted-status records pass through untouched here; normalization
/// decides their final pool.
fn drop_past_deleted(records: Vec<RawPendingRecord>, now: time::OffsetDateTime) -> Vec<RawPendingRecord> {
    records
        .into_iter()
        .filter(|r| {
            if r.status != Some(PendingStatus::Deleted) {
                return true;
            }
            r.event_starts_at.is_none_or(|starts_at| starts_at > now)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;

    fn record(slot_key: &str, target_id: &str, profile_key: &str, starts_at: time::OffsetDateTime) -> PendingRecord {
        PendingRecord {
            id: SlotKey::from(slot_key),
            slot_key: SlotKey::from(slot_key),
            target_id: target_id.into(),
            profile_key: profile_key.into(),
            event_starts_at: starts_at,
            scheduled_publish_time: starts_at,
            status: PendingStatus::Scheduled,
            missed_at: None,
            queued_at: None,
            deleted_at: None,
            event_id: None,
            attempt_count: 0,
            last_error: None,
            manual_overrides: None,
        }
    }

    #[test_log::test(tokio::test)]
    async fn round_trips_through_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pending.json");

        let mut store = PendingStore::load(path.clone(), DEFAULT_DELETED_DISPLAY_LIMIT).await.unwrap();
        store.upsert(record("pending_t_p_1", "t", "p", datetime!(2026-03-06 19:00 UTC)));
        store.save().await.unwrap();

        let reloaded = PendingStore::load(path, DEFAULT_DELETED_DISPLAY_LIMIT).await.unwrap();
        assert_eq!(reloaded.iter_pending().count(), 1);
    }

    #[test_log::test(tokio::test)]
    async fn load_saves_the_repaired_document_back_when_normalization_changed_something() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pending.json");

        // Two on-disk copies of the same slot, one `scheduled` and one
        // `published`; normalization must dedup them down to one record,
        // which is a change that needs persisting without an explicit save.
        let malformed = serde_json::json!({
            "events": [
                {
                    "slotKey": "pending_t_p_1741287600000",
                    "targetId": "t",
                    "profileKey": "p",
                    "eventStartsAt": "2026-03-06T19:00:00Z",
                    "scheduledPublishTime": "2026-03-03T19:00:00Z",
                    "status": "scheduled",
                },
                {
                    "slotKey": "pending_t_p_1741287600000",
                    "targetId": "t",
                    "profileKey": "p",
                    "eventStartsAt": "2026-03-06T19:00:00Z",
                    "scheduledPublishTime": "2026-03-03T19:00:00Z",
                    "status": "published",
                },
            ],
            "deletedEvents": [],
        });
        tokio::fs::write(&path, serde_json::to_vec(&malformed).unwrap()).await.unwrap();

        let store = PendingStore::load(path.clone(), DEFAULT_DELETED_DISPLAY_LIMIT).await.unwrap();
        assert_eq!(store.iter_pending().count(), 1);

        let on_disk: RawPendingDocument = atomic_file::read_or_default(&path).await.unwrap();
        assert_eq!(on_disk.events.len(), 1, "the deduped document should already be persisted, not just held in memory");
        assert_eq!(on_disk.events[0].status, Some(PendingStatus::Published));
    }

    #[test_log::test(tokio::test)]
    async fn load_does_not_rewrite_an_already_normalized_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pending.json");

        let mut store = PendingStore::load(path.clone(), DEFAULT_DELETED_DISPLAY_LIMIT).await.unwrap();
        store.upsert(record("pending_t_p_1741287600000", "t", "p", datetime!(2026-03-06 19:00 UTC)));
        store.save().await.unwrap();
        let saved_at = tokio::fs::metadata(&path).await.unwrap().modified().unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        PendingStore::load(path.clone(), DEFAULT_DELETED_DISPLAY_LIMIT).await.unwrap();
        let reloaded_mtime = tokio::fs::metadata(&path).await.unwrap().modified().unwrap();
        assert_eq!(saved_at, reloaded_mtime, "a clean document must not be rewritten on load");
    }

    #[test_log::test(tokio::test)]
    async fn soft_delete_then_restore_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pending.json");
        let mut store = PendingStore::load(path, DEFAULT_DELETED_DISPLAY_LIMIT).await.unwrap();

        let key = SlotKey::from("pending_t_p_1");
        store.upsert(record(key.as_str(), "t", "p", datetime!(2026-03-06 19:00 UTC)));

        store.soft_delete(&key).unwrap();
        assert!(store.get(&key).is_none());
        assert!(store.get_deleted(&key).is_some());

        store.restore(&key).unwrap();
        assert!(store.get(&key).is_some());
        assert!(store.get_deleted(&key).is_none());
    }

    #[test_log::test(tokio::test)]
    async fn purge_profile_removes_from_both_pools() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pending.json");
        let mut store = PendingStore::load(path, DEFAULT_DELETED_DISPLAY_LIMIT).await.unwrap();

        let key_a = SlotKey::from("pending_t_p_1");
        let key_b = SlotKey::from("pending_t_p_2");
        store.upsert(record(key_a.as_str(), "t", "p", datetime!(2026-03-06 19:00 UTC)));
        store.upsert(record(key_b.as_str(), "t", "p", datetime!(2026-03-13 19:00 UTC)));
        store.soft_delete(&key_b).unwrap();

        store.purge_profile("t", "p");
        assert_eq!(store.iter_pending().count(), 0);
        assert_eq!(store.iter_deleted().count(), 0);
    }

    #[test_log::test(tokio::test)]
    async fn past_dated_deleted_entries_are_garbage_collected_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pending.json");

        let mut store = PendingStore::load(path.clone(), DEFAULT_DELETED_DISPLAY_LIMIT).await.unwrap();
        let key = SlotKey::from("pending_t_p_1");
        store.upsert(record(key.as_str(), "t", "p", datetime!(2020-01-01 00:00 UTC)));
        store.soft_delete(&key).unwrap();
        store.save().await.unwrap();

        let reloaded = PendingStore::load(path, DEFAULT_DELETED_DISPLAY_LIMIT).await.unwrap();
        assert_eq!(reloaded.iter_deleted().count(), 0);
    }

    #[test_log::test(tokio::test)]
    async fn prune_to_known_targets_drops_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pending.json");
        let mut store = PendingStore::load(path, DEFAULT_DELETED_DISPLAY_LIMIT).await.unwrap();

        store.upsert(record("pending_keep_p_1", "keep", "p", datetime!(2026-03-06 19:00 UTC)));
        store.upsert(record("pending_drop_p_1", "drop", "p", datetime!(2026-03-06 19:00 UTC)));

        let known = std::collections::BTreeSet::from(["keep".to_owned()]);
        let dropped = store.prune_to_known_targets(&known);
        assert_eq!(dropped, 1);
        assert_eq!(store.iter_pending().count(), 1);
    }
}
