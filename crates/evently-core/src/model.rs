//! Pending-event domain types.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::slot::SlotKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingStatus {
    Scheduled,
    Queued,
    Processing,
    Published,
    Missed,
    Cancelled,
    /// Only ever observed transiently while held in the deleted pool; a
    /// raw record loaded with this status is moved there by normalization
    /// regardless of which on-disk list it was found in.
    Deleted,
}

impl PendingStatus {
    /// Rank used to break ties when two records would otherwise collide at
    /// the same slot key during normalization. Higher wins. Does not account
    /// for a manual-overrides bag, which outranks everything but `published`
    /// regardless of status — see [`PendingRecord::dedup_rank`].
    pub fn dedup_priority(self) -> u8 {
        match self {
            // 6 is reserved for a record carrying a manual-overrides bag,
            // one tier below `published` regardless of its own status.
            PendingStatus::Published => 7,
            PendingStatus::Queued | PendingStatus::Processing => 5,
            PendingStatus::Scheduled => 4,
            PendingStatus::Missed => 3,
            PendingStatus::Deleted => 2,
            PendingStatus::Cancelled => 1,
        }
    }
}

/// Operator-supplied corrections to a record that expansion or the
/// calculator would otherwise have produced on its own. Every field is
/// optional and defers to the computed value when absent; recognized keys
/// match `spec.md §9`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManualOverrides {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub access_type: Option<String>,
    #[serde(default)]
    pub languages: Option<Vec<String>>,
    #[serde(default)]
    pub platforms: Option<Vec<String>>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub image_id: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub role_ids: Option<Vec<String>>,
    #[serde(default)]
    pub duration_minutes: Option<i64>,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub event_starts_at: Option<OffsetDateTime>,
}

impl ManualOverrides {
    pub fn is_empty(&self) -> bool {
        self == &ManualOverrides::default()
    }

    /// Whether this bag moves the slot's start away from what expansion
    /// originally produced; callers use this to decide whether a pending
    /// record counts as "modified" (and so exempt from the usual
    /// drop-and-recreate during `UpdatePendingForProfile`).
    pub fn moves_start(&self) -> bool {
        self.event_starts_at.is_some()
    }
}

/// One expanded, schedulable occurrence of a profile's pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingRecord {
    /// The on-disk id. Equal to `slot_key` unless an override has since
    /// moved `eventStartsAt`, in which case `slot_key` tracks the new
    /// identity while `id` is left as the original, per `spec.md §3`.
    pub id: SlotKey,
    pub slot_key: SlotKey,
    pub target_id: String,
    pub profile_key: String,
    #[serde(with = "time::serde::rfc3339")]
    pub event_starts_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub scheduled_publish_time: OffsetDateTime,
    pub status: PendingStatus,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub missed_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub queued_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub deleted_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub event_id: Option<String>,
    #[serde(default)]
    pub attempt_count: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub manual_overrides: Option<ManualOverrides>,
}

impl PendingRecord {
    pub fn overrides(&self) -> ManualOverrides {
        self.manual_overrides.clone().unwrap_or_default()
    }

    /// An override never touches `scheduledPublishTime` directly: it's
    /// recomputed into that field whenever `eventStartsAt` changes, so this
    /// is just the field itself (`ApplyOverrides`, `spec.md §4.7`).
    pub fn effective_publish_time(&self) -> OffsetDateTime {
        self.scheduled_publish_time
    }

    /// The slot's effective start, accounting for an override that moved
    /// it (`spec.md §3`: `manualOverrides` may redefine `eventStartsAt`).
    pub fn effective_event_starts_at(&self) -> OffsetDateTime {
        self.manual_overrides.as_ref().and_then(|o| o.event_starts_at).unwrap_or(self.event_starts_at)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, PendingStatus::Published | PendingStatus::Cancelled)
    }

    pub fn is_modified(&self) -> bool {
        self.manual_overrides.as_ref().is_some_and(|o| !o.is_empty())
    }

    /// Rank used to break ties when two records collide at the same slot key
    /// during normalization: `published > manualOverrides > queued >
    /// scheduled > missed > others`. A manual-overrides bag outranks every
    /// status but `published`, since an operator's correction shouldn't be
    /// silently discarded in favor of a plain `scheduled`/`missed` duplicate.
    pub fn dedup_rank(&self) -> u8 {
        if self.status == PendingStatus::Published {
            return self.status.dedup_priority();
        }
        if self.is_modified() {
            return 6;
        }
        self.status.dedup_priority()
    }
}

/// Permissive on-disk counterpart to [`PendingRecord`] consumed only by
/// normalization. Everything parse-fragile is optional so a malformed or
/// partially-written document can still be loaded and repaired rather than
/// refusing to start.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawPendingRecord {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub slot_key: Option<String>,
    #[serde(default)]
    pub target_id: Option<String>,
    #[serde(default)]
    pub profile_key: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub event_starts_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub scheduled_publish_time: Option<OffsetDateTime>,
    #[serde(default)]
    pub status: Option<PendingStatus>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub missed_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub queued_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub deleted_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub event_id: Option<String>,
    #[serde(default)]
    pub attempt_count: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub manual_overrides: Option<ManualOverrides>,
}

/// `(targetId, profileKey) -> [ManualOverrides keyed by slot key]`, as read
/// from the operator-maintained overrides document.
pub type OverridesByProfile = BTreeMap<(String, String), BTreeMap<SlotKey, ManualOverrides>>;
