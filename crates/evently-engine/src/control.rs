//! Control API (C8): the operations callers use to keep the engine's view
//! of targets and profiles in sync, react to missed slots, and reconcile
//! against reality. Every operation here is one serialized call against the
//! actor's state — no suspension points except the explicit `postNow` publish
//! attempt (`spec.md §4.7`/`§5`).

use std::collections::BTreeSet;
use std::sync::Arc;

use evently_core::calc::{apply_hard_cap, before_publish_time, compute_publish_time, RecomputeContext};
use evently_core::{ManualOverrides, PendingRecord, PendingStatus, Profile, SlotKey, TimingMode};
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::engine::Engine;
use crate::error::{AlreadyInFlightSnafu, EngineResult, InvalidInputSnafu, RecordNotFoundSnafu};
use crate::task::publish_worker::{execute, ExecuteOutcome};
use crate::task::rate_limit::QueueEntry;
use crate::LOG_TARGET;

/// What to do with a `missed` record, per `spec.md §4.7`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissedAction {
    PostNow,
    Reschedule,
    Cancel,
}

/// Outcome of `ActOnMissed::postNow`, reported back to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostNowOutcome {
    Published,
    Queued,
    Error(String),
}

/// One remote event as seen by the real calendar/target, used by
/// `ReconcilePublished` to decide which `published` records still exist.
#[derive(Debug, Clone)]
pub struct RemoteEvent {
    pub event_id: Option<String>,
    pub starts_at: OffsetDateTime,
    pub title: Option<String>,
}

impl Engine {
    /// `SetKnownTargets(ids)`: intersects both pools against `ids`. `None`
    /// performs no pruning at all.
    pub async fn set_known_targets(self: &Arc<Self>, ids: Option<BTreeSet<String>>) -> EngineResult<usize> {
        let Some(ids) = ids else { return Ok(0) };
        let mut state = self.state.write().await;
        let dropped = state.pending.prune_to_known_targets(&ids);
        state.known_targets = ids;
        state.pending.save().await?;
        info!(target: LOG_TARGET, dropped, "Pruned pending/deleted pools to known targets");
        Ok(dropped)
    }

    /// Sets the deleted pool's advisory `settings.displayLimit` (`spec.md
    /// §3`/`§6`). Purely advisory metadata — C2 doesn't enforce it against
    /// reads — but a limit of zero would make every soft-delete immediately
    /// unrestorable, which is never what a caller means, so it's rejected as
    /// invalid input (`spec.md §7`).
    pub async fn set_display_limit(&self, limit: usize) -> EngineResult<()> {
        if limit == 0 {
            return InvalidInputSnafu {
                message: "displayLimit must be at least 1".to_owned(),
            }
            .fail();
        }
        let mut state = self.state.write().await;
        state.pending.set_display_limit(limit);
        state.pending.save().await
    }

    /// `UpdatePendingForProfile(target, key, profile)`: re-registers the
    /// profile, drops its non-overridden timer-bound records, and (if
    /// automation is enabled) expands fresh slots past the activation
    /// anchor.
    pub async fn update_pending_for_profile(self: &Arc<Self>, target_id: &str, profile_key: &str, profile: Profile) -> EngineResult<()> {
        let now = OffsetDateTime::now_utc();
        let mut state = self.state.write().await;

        state.profiles.insert((target_id.to_owned(), profile_key.to_owned()), profile.clone());

        let droppable: Vec<SlotKey> = state
            .pending
            .iter_pending_for_profile(target_id, profile_key)
            .filter(|r| !r.is_modified() && !r.is_terminal())
            .map(|r| r.slot_key.clone())
            .collect();

        {
            let mut queue = self.queue.lock().await;
            for key in &droppable {
                queue.remove_slot(key);
                state.pending.remove(key);
            }
        }

        if !profile.automation.enabled {
            state.pending.save().await?;
            return Ok(());
        }

        let existing_anchor = state.automation.get(target_id, profile_key).activation_starts_at;
        let derived = existing_anchor.unwrap_or_else(|| {
            state
                .pending
                .iter_pending_for_profile(target_id, profile_key)
                .map(|r| r.effective_event_starts_at())
                .min()
                .unwrap_or(now)
        });
        let anchor = state.automation.ensure_activation_anchor(target_id, profile_key, derived);

        let horizon = now + time::Duration::try_from(self.config.expansion_horizon).unwrap_or(time::Duration::ZERO);
        let mut slots = self
            .expander
            .expand(&profile, horizon)
            .await
            .map_err(|source| {
                crate::error::ExpandSnafu {
                    target_id: target_id.to_owned(),
                    profile_key: profile_key.to_owned(),
                    source,
                }
                .build()
            })?;
        slots.sort_by_key(|s| s.starts_at);

        let automation_state = state.automation.get(target_id, profile_key);
        let mut previous_slot_start = automation_state.last_slot_start;
        let last_success = automation_state.last_success;
        let duration = profile.duration();

        for slot in slots {
            if slot.starts_at <= anchor {
                continue;
            }

            let slot_key = SlotKey::new(target_id, profile_key, slot.starts_at);
            let collides = state.pending.get(&slot_key).is_some()
                || state.pending.get_deleted(&slot_key).is_some()
                || state.automation.is_published(target_id, profile_key, slot.starts_at);
            if collides {
                if profile.automation.timing_mode == TimingMode::After {
                    previous_slot_start = Some(slot.starts_at);
                }
                continue;
            }

            let publish_time = compute_publish_time(
                slot.starts_at,
                &profile.automation,
                duration,
                RecomputeContext::Expansion {
                    previous_slot_start,
                    last_success,
                    now,
                    anchor: self.config.after_mode_anchor,
                },
            );
            let status = if publish_time <= now { PendingStatus::Missed } else { PendingStatus::Scheduled };

            state.pending.upsert(PendingRecord {
                id: slot_key.clone(),
                slot_key,
                target_id: target_id.to_owned(),
                profile_key: profile_key.to_owned(),
                event_starts_at: slot.starts_at,
                scheduled_publish_time: publish_time,
                status,
                missed_at: if status == PendingStatus::Missed { Some(now) } else { None },
                queued_at: None,
                deleted_at: None,
                event_id: None,
                attempt_count: 0,
                last_error: None,
                manual_overrides: None,
            });
            state.automation.record_slot_progress(target_id, profile_key, slot.starts_at);
            previous_slot_start = Some(slot.starts_at);
        }

        state.pending.save().await?;
        state.automation.save().await?;
        drop(state);
        self.notify();
        Ok(())
    }

    /// `RecordManualEvent(target, key, startsAt)`: only ever pulls the
    /// activation anchor earlier, never forward.
    pub async fn record_manual_event(&self, target_id: &str, profile_key: &str, starts_at: OffsetDateTime) -> EngineResult<()> {
        let mut state = self.state.write().await;
        state.automation.record_manual_event(target_id, profile_key, starts_at);
        state.automation.save().await
    }

    /// `ReconcilePublished(target, upcomingRealEvents)`: drops `published`
    /// records that no longer correspond to a real remote event, freeing
    /// their slot key for a future re-expansion.
    pub async fn reconcile_published(&self, target_id: &str, remote: &[RemoteEvent]) -> EngineResult<usize> {
        let mut state = self.state.write().await;

        let published: Vec<SlotKey> = state
            .pending
            .iter_pending()
            .filter(|r| r.target_id == target_id && r.status == PendingStatus::Published)
            .map(|r| r.slot_key.clone())
            .collect();

        let mut dropped = 0usize;
        for key in published {
            let Some(record) = state.pending.get(&key) else { continue };
            let still_live = remote_matches(record, remote);
            if still_live {
                continue;
            }
            let profile_key = record.profile_key.clone();
            let slot_start = record.effective_event_starts_at();
            state.pending.remove(&key);
            state.automation.revert_published(target_id, &profile_key, slot_start);
            dropped += 1;
        }

        if dropped > 0 {
            state.pending.save().await?;
            state.automation.save().await?;
            info!(target: LOG_TARGET, target_id, dropped, "Reconciliation dropped stale published records");
        }
        Ok(dropped)
    }

    /// `ApplyOverrides(id, overrides)`: stores the bag; if `eventStartsAt`
    /// moved, recomputes the publish time and re-classifies `missed`
    /// vs `scheduled`.
    pub async fn apply_overrides(&self, id: &SlotKey, overrides: ManualOverrides) -> EngineResult<()> {
        let now = OffsetDateTime::now_utc();
        let mut state = self.state.write().await;

        let Some(record) = state.pending.get(id).cloned() else {
            return RecordNotFoundSnafu { slot_key: id.to_string() }.fail();
        };

        let profile = state.profiles.get(&(record.target_id.clone(), record.profile_key.clone())).cloned();
        let new_start = overrides.event_starts_at;
        let starts_changed = new_start.is_some_and(|s| s != record.event_starts_at);

        let new_publish = if starts_changed {
            let new_start = new_start.expect("starts_changed implies Some");
            match &profile {
                Some(profile) if profile.automation.timing_mode == TimingMode::Before => {
                    apply_hard_cap(before_publish_time(new_start, &profile.automation), new_start)
                }
                _ => {
                    let delta = new_start - record.event_starts_at;
                    apply_hard_cap(record.scheduled_publish_time + delta, new_start)
                }
            }
        } else {
            record.scheduled_publish_time
        };

        if let Some(r) = state.pending.get_mut(id) {
            r.manual_overrides = Some(overrides);
            if starts_changed {
                r.scheduled_publish_time = new_publish;
                if matches!(r.status, PendingStatus::Scheduled | PendingStatus::Missed) {
                    if new_publish <= now {
                        r.status = PendingStatus::Missed;
                        r.missed_at = Some(now);
                    } else {
                        r.status = PendingStatus::Scheduled;
                        r.missed_at = None;
                    }
                }
            }
        }

        state.pending.save().await
    }

    /// `ActOnMissed(id, action)`.
    pub async fn act_on_missed(self: &Arc<Self>, id: &SlotKey, action: MissedAction) -> EngineResult<Option<PostNowOutcome>> {
        match action {
            MissedAction::PostNow => self.post_now(id).await.map(Some),
            MissedAction::Reschedule => {
                self.reschedule_missed(id).await?;
                Ok(None)
            }
            MissedAction::Cancel => {
                self.cancel_missed(id).await?;
                Ok(None)
            }
        }
    }

    async fn post_now(self: &Arc<Self>, id: &SlotKey) -> EngineResult<PostNowOutcome> {
        let entry = {
            let state = self.state.read().await;
            let record = state.pending.get(id).cloned().ok_or_else(|| RecordNotFoundSnafu { slot_key: id.to_string() }.build())?;
            if matches!(record.status, PendingStatus::Queued | PendingStatus::Published) {
                return AlreadyInFlightSnafu {
                    slot_key: id.to_string(),
                    status: format!("{:?}", record.status),
                }
                .fail();
            }
            QueueEntry {
                publish_at: record.effective_publish_time(),
                target_id: record.target_id.clone(),
                profile_key: record.profile_key.clone(),
                slot_key: record.slot_key.clone(),
            }
        };

        match execute(self, entry).await? {
            ExecuteOutcome::Published => Ok(PostNowOutcome::Published),
            ExecuteOutcome::Queued => Ok(PostNowOutcome::Queued),
            ExecuteOutcome::Error(message) => Ok(PostNowOutcome::Error(message)),
            ExecuteOutcome::Cancelled | ExecuteOutcome::NoOp => {
                Ok(PostNowOutcome::Error("record was no longer eligible for publish".to_owned()))
            }
        }
    }

    async fn reschedule_missed(&self, id: &SlotKey) -> EngineResult<()> {
        let now = OffsetDateTime::now_utc();
        let mut state = self.state.write().await;

        let record = state.pending.get(id).cloned().ok_or_else(|| RecordNotFoundSnafu { slot_key: id.to_string() }.build())?;
        let profile = state.profiles.get(&(record.target_id.clone(), record.profile_key.clone())).cloned();

        let before_mode = profile.as_ref().is_some_and(|p| p.automation.timing_mode == TimingMode::Before);
        let recomputed = before_mode.then(|| {
            let automation = &profile.as_ref().expect("checked above").automation;
            apply_hard_cap(before_publish_time(record.effective_event_starts_at(), automation), record.effective_event_starts_at())
        });

        let new_publish = match recomputed {
            Some(candidate) if candidate > now => candidate,
            _ => now + self.config.reschedule_delay,
        };

        if let Some(r) = state.pending.get_mut(id) {
            r.scheduled_publish_time = new_publish;
            r.status = PendingStatus::Scheduled;
            r.missed_at = None;
        }
        state.pending.save().await?;
        drop(state);
        self.notify();
        Ok(())
    }

    async fn cancel_missed(&self, id: &SlotKey) -> EngineResult<()> {
        let mut state = self.state.write().await;
        let Some(record) = state.pending.get(id).cloned() else {
            return RecordNotFoundSnafu { slot_key: id.to_string() }.fail();
        };

        {
            let mut queue = self.queue.lock().await;
            queue.remove_slot(id);
        }
        state.pending.soft_delete(id);

        let remaining = state.pending.iter_pending_for_profile(&record.target_id, &record.profile_key).count();
        if remaining == 0 {
            let deleted_keys: Vec<SlotKey> = state
                .pending
                .iter_deleted_for_profile(&record.target_id, &record.profile_key)
                .map(|r| r.slot_key.clone())
                .collect();
            for key in deleted_keys {
                state.pending.remove(&key);
            }
            state.automation.remove_profile(&record.target_id, &record.profile_key);
            warn!(
                target: LOG_TARGET,
                target_id = %record.target_id,
                profile_key = %record.profile_key,
                "No active pending remains after cancel; auto-disabling profile",
            );
        }

        state.pending.save().await?;
        state.automation.save().await
    }

    /// `RestoreDeleted(target, key)`: restores every deleted entry for the
    /// profile whose recomputed publish time still lands in the future,
    /// strictly past the anchor, and whose slot key is free.
    pub async fn restore_deleted(&self, target_id: &str, profile_key: &str) -> EngineResult<usize> {
        let now = OffsetDateTime::now_utc();
        let mut state = self.state.write().await;

        let profile = state.profiles.get(&(target_id.to_owned(), profile_key.to_owned())).cloned();
        let anchor = state.automation.get(target_id, profile_key).activation_starts_at;

        let candidates: Vec<SlotKey> = state.pending.iter_deleted_for_profile(target_id, profile_key).map(|r| r.slot_key.clone()).collect();

        let mut restored = 0usize;
        for key in candidates {
            let Some(record) = state.pending.get_deleted(&key).cloned() else { continue };
            let restore_start = record.effective_event_starts_at();

            if restore_start <= now {
                continue;
            }
            if anchor.is_some_and(|a| restore_start <= a) {
                continue;
            }
            if state.pending.get(&key).is_some() {
                continue;
            }
            if state.automation.is_published(target_id, profile_key, restore_start) {
                continue;
            }

            let Some(profile) = &profile else { continue };
            let publish_time = compute_publish_time(restore_start, &profile.automation, profile.duration(), RecomputeContext::Restore);
            if publish_time <= now {
                continue;
            }

            if let Some(restored_record) = state.pending.restore(&key) {
                if let Some(r) = state.pending.get_mut(&restored_record.slot_key) {
                    r.scheduled_publish_time = publish_time;
                }
                restored += 1;
            }
        }

        if restored > 0 {
            state.pending.save().await?;
        }
        Ok(restored)
    }

    /// `PurgeProfile(target, key)`: hard-removes every trace of a profile.
    pub async fn purge_profile(&self, target_id: &str, profile_key: &str) -> EngineResult<()> {
        let mut state = self.state.write().await;

        let keys: Vec<SlotKey> = state
            .pending
            .iter_pending_for_profile(target_id, profile_key)
            .map(|r| r.slot_key.clone())
            .collect();
        {
            let mut queue = self.queue.lock().await;
            for key in &keys {
                queue.remove_slot(key);
            }
        }

        state.pending.purge_profile(target_id, profile_key);
        state.automation.remove_profile(target_id, profile_key);
        state.profiles.remove(&(target_id.to_owned(), profile_key.to_owned()));

        state.pending.save().await?;
        state.automation.save().await
    }
}

fn remote_matches(record: &PendingRecord, remote: &[RemoteEvent]) -> bool {
    if let Some(event_id) = &record.event_id {
        if remote.iter().any(|r| r.event_id.as_deref() == Some(event_id.as_str())) {
            return true;
        }
        // Fall through to a start-time match: the remote list may not carry
        // ids for events this engine didn't itself just publish.
    }

    let by_start: Vec<&RemoteEvent> = remote.iter().filter(|r| r.starts_at == record.effective_event_starts_at()).collect();
    match by_start.as_slice() {
        [] => false,
        [_one] => true,
        many => {
            let title = record.overrides().title;
            title.is_some() && many.iter().any(|r| r.title == title)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use evently_core::{AutomationSettings, RepeatMode};
    use evently_util_error::BoxedError;
    use time::macros::datetime;

    use super::*;
    use crate::config::EngineConfig;
    use crate::publisher::{EventPublisher, PublishDetails, PublishFailure, PublishedEvent};

    struct AlwaysOk;

    #[async_trait]
    impl EventPublisher for AlwaysOk {
        async fn publish_event(&self, _details: &PublishDetails) -> Result<PublishedEvent, PublishFailure> {
            Ok(PublishedEvent { event_id: "evt-1".into() })
        }
    }

    struct NoSlots;

    #[async_trait]
    impl evently_core::SlotExpander for NoSlots {
        async fn expand(&self, _profile: &Profile, _horizon: OffsetDateTime) -> Result<Vec<evently_core::Slot>, BoxedError> {
            Ok(Vec::new())
        }
    }

    async fn engine() -> Arc<Engine> {
        let dir = tempfile::tempdir().unwrap();
        Engine::spawn(
            EngineConfig::default(),
            Arc::new(AlwaysOk),
            Arc::new(NoSlots),
            dir.path().join("pending.json"),
            dir.path().join("automation.json"),
        )
        .await
        .unwrap()
    }

    fn profile() -> Profile {
        Profile {
            target_id: "t".into(),
            profile_key: "p".into(),
            patterns: serde_json::json!({}),
            timezone: "UTC".into(),
            duration_minutes: 60,
            automation: AutomationSettings {
                enabled: true,
                timing_mode: TimingMode::Before,
                days_offset: 3,
                hours_offset: 0,
                minutes_offset: 0,
                monthly_day: 1,
                monthly_hour: 0,
                monthly_minute: 0,
                repeat_mode: RepeatMode::Indefinite,
                repeat_count: None,
            },
        }
    }

    #[test_log::test(tokio::test)]
    async fn set_known_targets_prunes_pending_to_the_given_set() {
        let engine = engine().await;
        {
            let mut state = engine.state.write().await;
            state.pending.upsert(PendingRecord {
                id: SlotKey::from("pending_gone_p_1"),
                slot_key: SlotKey::from("pending_gone_p_1"),
                target_id: "gone".into(),
                profile_key: "p".into(),
                event_starts_at: datetime!(2026-03-06 19:00 UTC),
                scheduled_publish_time: datetime!(2026-03-03 19:00 UTC),
                status: PendingStatus::Scheduled,
                missed_at: None,
                queued_at: None,
                deleted_at: None,
                event_id: None,
                attempt_count: 0,
                last_error: None,
                manual_overrides: None,
            });
        }

        let dropped = engine.set_known_targets(Some(BTreeSet::from(["keep".to_owned()]))).await.unwrap();
        assert_eq!(dropped, 1);
    }

    #[test_log::test(tokio::test)]
    async fn record_manual_event_seeds_the_anchor() {
        let engine = engine().await;
        engine.record_manual_event("t", "p", datetime!(2026-03-01 00:00 UTC)).await.unwrap();
        let state = engine.state.read().await;
        assert_eq!(state.automation.get("t", "p").activation_starts_at, Some(datetime!(2026-03-01 00:00 UTC)));
    }

    #[test_log::test(tokio::test)]
    async fn apply_overrides_moving_start_into_the_past_marks_missed() {
        let engine = engine().await;
        let key = SlotKey::from("pending_t_p_1");
        {
            let mut state = engine.state.write().await;
            state.profiles.insert(("t".into(), "p".into()), profile());
            state.pending.upsert(PendingRecord {
                id: key.clone(),
                slot_key: key.clone(),
                target_id: "t".into(),
                profile_key: "p".into(),
                event_starts_at: datetime!(2026-03-06 19:00 UTC),
                scheduled_publish_time: datetime!(2026-03-03 19:00 UTC),
                status: PendingStatus::Scheduled,
                missed_at: None,
                queued_at: None,
                deleted_at: None,
                event_id: None,
                attempt_count: 0,
                last_error: None,
                manual_overrides: None,
            });
        }

        let overrides = ManualOverrides {
            event_starts_at: Some(OffsetDateTime::now_utc() - time::Duration::minutes(1)),
            ..Default::default()
        };
        engine.apply_overrides(&key, overrides).await.unwrap();

        let state = engine.state.read().await;
        assert_eq!(state.pending.get(&key).unwrap().status, PendingStatus::Missed);
    }

    #[test_log::test(tokio::test)]
    async fn cancel_missed_auto_disables_when_nothing_remains() {
        let engine = engine().await;
        let key = SlotKey::from("pending_t_p_1");
        {
            let mut state = engine.state.write().await;
            state.pending.upsert(PendingRecord {
                id: key.clone(),
                slot_key: key.clone(),
                target_id: "t".into(),
                profile_key: "p".into(),
                event_starts_at: datetime!(2026-03-06 19:00 UTC),
                scheduled_publish_time: datetime!(2023-01-01 00:00 UTC),
                status: PendingStatus::Missed,
                missed_at: Some(datetime!(2023-01-01 00:00 UTC)),
                queued_at: None,
                deleted_at: None,
                event_id: None,
                attempt_count: 0,
                last_error: None,
                manual_overrides: None,
            });
            state.automation.record_manual_event("t", "p", datetime!(2020-01-01 00:00 UTC));
        }

        engine.act_on_missed(&key, MissedAction::Cancel).await.unwrap();

        let state = engine.state.read().await;
        assert!(state.pending.get(&key).is_none());
        assert!(state.pending.get_deleted(&key).is_none(), "deleted pool should be cleared too once nothing remains");
        assert_eq!(state.automation.get("t", "p").activation_starts_at, None);
    }

    #[test_log::test(tokio::test)]
    async fn purge_profile_removes_registration_and_storage() {
        let engine = engine().await;
        {
            let mut state = engine.state.write().await;
            state.profiles.insert(("t".into(), "p".into()), profile());
        }
        engine.purge_profile("t", "p").await.unwrap();
        let state = engine.state.read().await;
        assert!(!state.profiles.contains_key(&("t".to_owned(), "p".to_owned())));
    }

    #[test_log::test(tokio::test)]
    async fn set_display_limit_rejects_zero() {
        let engine = engine().await;
        let err = engine.set_display_limit(0).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_INPUT");
    }

    #[test_log::test(tokio::test)]
    async fn set_display_limit_persists_the_new_limit() {
        let engine = engine().await;
        engine.set_display_limit(5).await.unwrap();
        let state = engine.state.read().await;
        assert_eq!(state.pending.display_limit(), 5);
    }

    fn record_at(key: &str, target_id: &str, profile_key: &str, starts_at: OffsetDateTime, status: PendingStatus, event_id: Option<String>) -> PendingRecord {
        PendingRecord {
            id: SlotKey::from(key),
            slot_key: SlotKey::from(key),
            target_id: target_id.into(),
            profile_key: profile_key.into(),
            event_starts_at: starts_at,
            scheduled_publish_time: starts_at - time::Duration::days(3),
            status,
            missed_at: None,
            queued_at: None,
            deleted_at: None,
            event_id,
            attempt_count: 0,
            last_error: None,
            manual_overrides: None,
        }
    }

    #[test_log::test(tokio::test)]
    async fn reconcile_published_drops_records_with_no_matching_remote_event() {
        let engine = engine().await;
        let still_live = SlotKey::from("pending_t_p_1");
        let gone = SlotKey::from("pending_t_p_2");
        let starts_at = datetime!(2026-03-06 19:00 UTC);
        {
            let mut state = engine.state.write().await;
            state
                .pending
                .upsert(record_at(still_live.as_str(), "t", "p", starts_at, PendingStatus::Published, Some("evt-1".into())));
            state.pending.upsert(record_at(
                gone.as_str(),
                "t",
                "p",
                datetime!(2026-03-07 19:00 UTC),
                PendingStatus::Published,
                Some("evt-2".into()),
            ));
        }

        let remote = [RemoteEvent {
            event_id: Some("evt-1".into()),
            starts_at,
            title: None,
        }];
        let dropped = engine.reconcile_published("t", &remote).await.unwrap();

        assert_eq!(dropped, 1);
        let state = engine.state.read().await;
        assert!(state.pending.get(&still_live).is_some());
        assert!(state.pending.get(&gone).is_none());
    }

    #[test_log::test(tokio::test)]
    async fn reconcile_published_ignores_other_targets() {
        let engine = engine().await;
        let key = SlotKey::from("pending_other_p_1");
        {
            let mut state = engine.state.write().await;
            state
                .pending
                .upsert(record_at(key.as_str(), "other", "p", datetime!(2026-03-06 19:00 UTC), PendingStatus::Published, None));
        }

        let dropped = engine.reconcile_published("t", &[]).await.unwrap();

        assert_eq!(dropped, 0);
        let state = engine.state.read().await;
        assert!(state.pending.get(&key).is_some());
    }

    #[test_log::test(tokio::test)]
    async fn post_now_publishes_a_scheduled_record_immediately() {
        let engine = engine().await;
        let key = SlotKey::from("pending_t_p_1");
        {
            let mut state = engine.state.write().await;
            state.profiles.insert(("t".into(), "p".into()), profile());
            state
                .pending
                .upsert(record_at(key.as_str(), "t", "p", datetime!(2026-03-06 19:00 UTC), PendingStatus::Missed, None));
        }

        let outcome = engine.act_on_missed(&key, MissedAction::PostNow).await.unwrap();

        assert_eq!(outcome, Some(PostNowOutcome::Published));
        let state = engine.state.read().await;
        assert_eq!(state.pending.get(&key).unwrap().status, PendingStatus::Published);
    }

    #[test_log::test(tokio::test)]
    async fn post_now_rejects_a_record_already_in_flight() {
        let engine = engine().await;
        let key = SlotKey::from("pending_t_p_1");
        {
            let mut state = engine.state.write().await;
            state
                .pending
                .upsert(record_at(key.as_str(), "t", "p", datetime!(2026-03-06 19:00 UTC), PendingStatus::Queued, None));
        }

        let err = engine.act_on_missed(&key, MissedAction::PostNow).await.unwrap_err();
        assert_eq!(err.code(), "ALREADY_IN_FLIGHT");
    }

    #[test_log::test(tokio::test)]
    async fn reschedule_missed_uses_the_configured_delay_when_no_profile_is_registered() {
        let engine = engine().await;
        let key = SlotKey::from("pending_t_p_1");
        let now = OffsetDateTime::now_utc();
        {
            let mut state = engine.state.write().await;
            let mut record = record_at(key.as_str(), "t", "p", datetime!(2026-03-06 19:00 UTC), PendingStatus::Missed, None);
            record.missed_at = Some(now - time::Duration::minutes(5));
            state.pending.upsert(record);
        }

        engine.act_on_missed(&key, MissedAction::Reschedule).await.unwrap();

        let state = engine.state.read().await;
        let record = state.pending.get(&key).unwrap();
        assert_eq!(record.status, PendingStatus::Scheduled);
        assert!(record.missed_at.is_none());
        assert!(record.scheduled_publish_time >= now + engine.config.reschedule_delay - time::Duration::seconds(2));
    }

    #[test_log::test(tokio::test)]
    async fn restore_deleted_brings_back_only_still_future_non_colliding_slots() {
        let engine = engine().await;
        let future_key = SlotKey::from("pending_t_p_future");
        let past_key = SlotKey::from("pending_t_p_past");
        let now = OffsetDateTime::now_utc();
        {
            let mut state = engine.state.write().await;
            state.profiles.insert(("t".into(), "p".into()), profile());

            let future_record = record_at(future_key.as_str(), "t", "p", now + time::Duration::days(10), PendingStatus::Scheduled, None);
            let past_record = record_at(past_key.as_str(), "t", "p", now - time::Duration::days(1), PendingStatus::Scheduled, None);
            state.pending.upsert(future_record);
            state.pending.upsert(past_record);
            state.pending.soft_delete(&future_key);
            state.pending.soft_delete(&past_key);
        }

        let restored = engine.restore_deleted("t", "p").await.unwrap();

        assert_eq!(restored, 1);
        let state = engine.state.read().await;
        assert!(state.pending.get(&future_key).is_some());
        assert!(state.pending.get_deleted(&future_key).is_none());
        assert!(state.pending.get_deleted(&past_key).is_some(), "past-dated entry must stay in the deleted pool");
    }
}
