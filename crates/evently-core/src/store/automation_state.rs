//! Per-profile automation state that survives restarts: the activation
//! anchor no slot may ever be materialized at or before, the `after`-mode
//! chaining anchor, and the counters/last-success bookkeeping `spec.md §3`
//! assigns to `AutomationState`.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::slot::Millis;
use crate::{atomic_file, CoreResult};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileAutomationState {
    /// `activationStartsAt`: no pending record may have `eventStartsAt` at
    /// or before this instant (`spec.md §3` invariant 3).
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub activation_starts_at: Option<OffsetDateTime>,
    /// Count of records that have reached `published` for this profile.
    #[serde(default)]
    pub events_created: u32,
    /// Instant of the last successful publish, used as the `after`-mode
    /// anchor when there's no in-memory previous slot.
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_success: Option<OffsetDateTime>,
    #[serde(default)]
    pub last_event_id: Option<String>,
    /// Event start of the most recently expanded slot, the other half of
    /// the `after`-mode anchor.
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_slot_start: Option<OffsetDateTime>,
    /// How far ahead expansion has already run for this profile.
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub expanded_through: Option<OffsetDateTime>,
    /// Every slot start millis that has ever been successfully published
    /// for this profile. Outlives the pending record itself: reconciliation
    /// may drop a stale `published` record from the pending pool, but the
    /// millis stays here so expansion never regenerates that exact slot
    /// (`spec.md §3` invariant 4).
    #[serde(default)]
    pub published_event_times: BTreeSet<i64>,
}

fn profile_id_key(target_id: &str, profile_key: &str) -> String {
    format!("{target_id}::{profile_key}")
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct AutomationStateDocument {
    #[serde(default)]
    profiles: BTreeMap<String, ProfileAutomationState>,
}

/// Holds every profile's automation state, persisted as one JSON document.
pub struct AutomationState {
    path: PathBuf,
    profiles: BTreeMap<String, ProfileAutomationState>,
}

impl AutomationState {
    pub async fn load(path: PathBuf) -> CoreResult<Self> {
        let doc: AutomationStateDocument = atomic_file::read_or_default(&path).await?;
        Ok(Self {
            path,
            profiles: doc.profiles,
        })
    }

    pub async fn save(&self) -> CoreResult<()> {
        let doc = AutomationStateDocument {
            profiles: self.profiles.clone(),
        };
        atomic_file::write_atomic(&self.path, &doc).await
    }

    pub fn get(&self, target_id: &str, profile_key: &str) -> ProfileAutomationState {
        self.profiles.get(&profile_id_key(target_id, profile_key)).cloned().unwrap_or_default()
    }

    pub fn record_success(&mut self, target_id: &str, profile_key: &str, at: OffsetDateTime, slot_start: OffsetDateTime, event_id: String) {
        let entry = self.profiles.entry(profile_id_key(target_id, profile_key)).or_default();
        entry.last_success = Some(at);
        entry.last_slot_start = Some(slot_start);
        entry.last_event_id = Some(event_id);
        entry.events_created = entry.events_created.saturating_add(1);
        entry.published_event_times.insert(Millis::from(slot_start).0);
        // The first ever publish seeds the anchor when a profile was never
        // activated through a manual event (spec.md §4.6 step 5).
        if entry.activation_starts_at.is_none() {
            entry.activation_starts_at = Some(slot_start);
        }
    }

    /// A slot key already seen as published never gets materialized again
    /// by expansion, even after its pending record has been reconciled away
    /// (`spec.md §3` invariant 4).
    pub fn is_published(&self, target_id: &str, profile_key: &str, slot_start: OffsetDateTime) -> bool {
        self.profiles
            .get(&profile_id_key(target_id, profile_key))
            .is_some_and(|entry| entry.published_event_times.contains(&Millis::from(slot_start).0))
    }

    /// One publish being dropped by reconciliation reverses the counter it
    /// incremented, so `eventsCreated == |published records|` in steady
    /// state (`spec.md §8` invariant 5), and frees the slot key so a future
    /// expansion can regenerate it (`spec.md §4.7` `ReconcilePublished`).
    pub fn revert_published(&mut self, target_id: &str, profile_key: &str, slot_start: OffsetDateTime) {
        let entry = self.profiles.entry(profile_id_key(target_id, profile_key)).or_default();
        entry.events_created = entry.events_created.saturating_sub(1);
        entry.published_event_times.remove(&Millis::from(slot_start).0);
    }

    pub fn record_expansion_horizon(&mut self, target_id: &str, profile_key: &str, through: OffsetDateTime) {
        let entry = self.profiles.entry(profile_id_key(target_id, profile_key)).or_default();
        entry.expanded_through = Some(entry.expanded_through.map_or(through, |prev| prev.max(through)));
    }

    /// Advances the `after`-mode chaining anchor to the most recently
    /// expanded slot, independent of whether it has published yet.
    pub fn record_slot_progress(&mut self, target_id: &str, profile_key: &str, slot_start: OffsetDateTime) {
        let entry = self.profiles.entry(profile_id_key(target_id, profile_key)).or_default();
        entry.last_slot_start = Some(entry.last_slot_start.map_or(slot_start, |prev| prev.max(slot_start)));
    }

    /// `UpdatePendingForProfile`'s anchor-fixing step: adopt `derived` as
    /// the activation anchor only if one isn't already recorded.
    pub fn ensure_activation_anchor(&mut self, target_id: &str, profile_key: &str, derived: OffsetDateTime) -> OffsetDateTime {
        let entry = self.profiles.entry(profile_id_key(target_id, profile_key)).or_default();
        *entry.activation_starts_at.get_or_insert(derived)
    }

    /// `RecordManualEvent`: the anchor only ever moves earlier, never
    /// forward (`spec.md §8` "Anchor monotonicity").
    pub fn record_manual_event(&mut self, target_id: &str, profile_key: &str, starts_at: OffsetDateTime) {
        let entry = self.profiles.entry(profile_id_key(target_id, profile_key)).or_default();
        match entry.activation_starts_at {
            Some(existing) if starts_at < existing => entry.activation_starts_at = Some(starts_at),
            None => entry.activation_starts_at = Some(starts_at),
            Some(_) => {}
        }
    }

    pub fn remove_profile(&mut self, target_id: &str, profile_key: &str) {
        self.profiles.remove(&profile_id_key(target_id, profile_key));
    }
}
