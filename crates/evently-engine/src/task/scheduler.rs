//! Wall-clock scheduler: expands each known profile's patterns into pending
//! records, detects events whose publish time was missed (whether the
//! process wasn't running, or it was but slept through a long suspend or
//! clock jump mid-run), and moves due records into the publish queue.
//! Sleeps an adaptive amount between passes — as long as it can get away
//! with given the next known due time, growing along an idle ladder when
//! there's nothing to do at all.

use std::sync::Arc;

use evently_core::calc::{compute_publish_time, RecomputeContext};
use evently_core::{PendingRecord, PendingStatus, SlotKey, TimingMode};
use evently_util_error::FmtCompact as _;
use time::OffsetDateTime;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::engine::{Engine, EngineHandle, EngineState};
use crate::error::EngineResult;
use crate::task::rate_limit::QueueEntry;
use crate::LOG_TARGET;

/// Runs once, synchronously, before the scheduler's steady-state loop
/// begins: every loaded `scheduled` record whose publish time already
/// passed while the engine was down is flipped to `missed` up front
/// (`spec.md §4.4`, "Missed-on-start"). After this point, `detect_missed`
/// itself is never called again — a record becoming due within the
/// scheduler's normal cadence always takes the ordinary timer-fire path
/// (`queue_due_records`). A record that becomes overdue by more than that
/// cadence mid-run (a suspend or clock jump, not initialization) is still
/// caught — `queue_due_records` routes those to `missed` itself, bounded by
/// `due_grace` rather than `detect_missed`'s unconditional sweep, so the two
/// never race the same freshly-due record.
pub(crate) async fn missed_on_start(engine: &Arc<Engine>) -> EngineResult<()> {
    let now = OffsetDateTime::now_utc();
    let mut state = engine.state.write().await;
    detect_missed(&mut state, now, &engine.missed_tx);
    state.pending.save().await
}

/// Floor under `due_grace` (see [`tick`]) so a pass that wakes up almost
/// immediately after the last one (e.g. via `notify()`) doesn't treat
/// ordinary scheduling jitter as a missed long sleep.
const MIN_DUE_GRACE: std::time::Duration = std::time::Duration::from_secs(60);

pub async fn run(handle: EngineHandle) {
    let Some(engine) = handle.upgrade() else { return };
    let mut wake_rx = engine.wake.subscribe();
    let mut shutdown_rx = engine.shutdown.subscribe();
    drop(engine);

    let mut consecutive_idle_passes: u32 = 0;
    let mut due_grace = MIN_DUE_GRACE;

    loop {
        let Some(engine) = handle.upgrade() else {
            debug!(target: LOG_TARGET, "Scheduler stopping: engine dropped");
            return;
        };

        if *shutdown_rx.borrow() {
            return;
        }

        let next_due = match tick(&engine, due_grace).await {
            Ok(next_due) => next_due,
            Err(err) => {
                warn!(target: LOG_TARGET, err = %err.fmt_compact(), "Scheduler tick failed");
                None
            }
        };

        let sleep_for = match next_due {
            Some(due) => {
                consecutive_idle_passes = 0;
                tiered_sleep(due - OffsetDateTime::now_utc())
            }
            None => {
                let sleep_for = engine.config.idle_recheck_duration(consecutive_idle_passes);
                consecutive_idle_passes = consecutive_idle_passes.saturating_add(1);
                sleep_for
            }
        };
        // A record overdue by more than the sleep this pass is about to take
        // could not have become due through ordinary operation — it signals
        // a long suspend or clock jump (`spec.md §5`, "Timer fires"), so the
        // next pass treats that much drift as the missed-detection boundary.
        due_grace = sleep_for.max(MIN_DUE_GRACE);

        drop(engine);

        tokio::select! {
            () = tokio::time::sleep(sleep_for) => {}
            _ = wake_rx.changed() => {}
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    return;
                }
            }
        }
    }
}

/// The adaptive recheck ladder from `spec.md §4.4`: a wall-clock deadline
/// far in the future is re-evaluated periodically rather than slept
/// through in one shot, so a long system suspend or clock jump is bounded
/// by the outermost tier rather than causing an arbitrarily stale wake-up.
fn tiered_sleep(delay: time::Duration) -> std::time::Duration {
    const SEVEN_DAYS: time::Duration = time::Duration::days(7);
    const TWO_DAYS: time::Duration = time::Duration::days(2);
    const ONE_DAY: time::Duration = time::Duration::days(1);

    let tier = if delay > SEVEN_DAYS {
        time::Duration::hours(24)
    } else if delay > TWO_DAYS {
        time::Duration::hours(8)
    } else if delay > ONE_DAY {
        time::Duration::hours(2)
    } else {
        delay
    };

    to_std_duration(tier)
}

fn to_std_duration(d: time::Duration) -> std::time::Duration {
    if d.is_negative() {
        std::time::Duration::ZERO
    } else {
        d.try_into().unwrap_or(std::time::Duration::ZERO)
    }
}

/// One scheduler pass. Returns the earliest still-future publish time
/// across every pending record, used to size the next sleep.
///
/// `due_grace` is how overdue a `scheduled` record is allowed to be before
/// `queue_due_records` treats it as missed instead of queuing it normally —
/// sized off the sleep duration the *previous* pass took, so it tracks how
/// long this loop could plausibly have gone without checking.
async fn tick(engine: &Arc<Engine>, due_grace: std::time::Duration) -> EngineResult<Option<OffsetDateTime>> {
    let now = OffsetDateTime::now_utc();
    let mut state = engine.state.write().await;

    let profile_ids: Vec<(String, String)> = state.profiles.keys().cloned().collect();
    for (target_id, profile_key) in profile_ids {
        if let Err(err) = expand_profile(engine, &mut state, &target_id, &profile_key, now).await {
            warn!(
                target: LOG_TARGET,
                target_id,
                profile_key,
                err = %err.fmt_compact(),
                "Slot expansion failed for profile",
            );
        }
    }

    let next_due = queue_due_records(&mut state, &engine.queue, now, due_grace, &engine.missed_tx).await;

    state.pending.save().await?;
    state.automation.save().await?;
    drop(state);

    engine.notify();
    Ok(next_due)
}

async fn expand_profile(
    engine: &Arc<Engine>,
    state: &mut EngineState,
    target_id: &str,
    profile_key: &str,
    now: OffsetDateTime,
) -> EngineResult<()> {
    use crate::error::{ExpandSnafu, UnknownProfileSnafu};

    let profile = state
        .profiles
        .get(&(target_id.to_owned(), profile_key.to_owned()))
        .cloned()
        .ok_or_else(|| {
            UnknownProfileSnafu {
                target_id: target_id.to_owned(),
                profile_key: profile_key.to_owned(),
            }
            .build()
        })?;

    if !profile.automation.enabled {
        return Ok(());
    }

    let horizon_span = time::Duration::try_from(engine.config.expansion_horizon).unwrap_or(time::Duration::ZERO);
    let horizon = now + horizon_span;

    let mut slots = engine.expander.expand(&profile, horizon).await.map_err(|source| {
        ExpandSnafu {
            target_id: target_id.to_owned(),
            profile_key: profile_key.to_owned(),
            source,
        }
        .build()
    })?;
    slots.sort_by_key(|s| s.starts_at);

    // spec.md §3 invariant 3: no record may ever be materialized at or
    // before the activation anchor.
    let anchor = state.automation.get(target_id, profile_key).activation_starts_at;

    let automation_state = state.automation.get(target_id, profile_key);
    let mut previous_slot_start = automation_state.last_slot_start;
    let last_success = automation_state.last_success;
    let duration = profile.duration();

    for slot in slots {
        if anchor.is_some_and(|a| slot.starts_at <= a) {
            continue;
        }

        let slot_key = SlotKey::new(target_id, profile_key, slot.starts_at);
        let already_known = state.pending.get(&slot_key).is_some()
            || state.pending.get_deleted(&slot_key).is_some()
            || state.automation.is_published(target_id, profile_key, slot.starts_at);

        if already_known {
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
                anchor: engine.config.after_mode_anchor,
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

    state.automation.record_expansion_horizon(target_id, profile_key, horizon);
    Ok(())
}

/// Flips a still-`scheduled` record to `missed` and broadcasts it. Shared by
/// [`detect_missed`] (init-time, unbounded) and [`queue_due_records`]
/// (steady-state, only for records overdue beyond `due_grace`).
fn mark_missed(state: &mut EngineState, key: &SlotKey, now: OffsetDateTime, missed_tx: &broadcast::Sender<PendingRecord>) -> bool {
    let Some(record) = state.pending.get_mut(key) else { return false };
    record.status = PendingStatus::Missed;
    record.missed_at = Some(now);
    let _ = missed_tx.send(record.clone());
    true
}

/// Flips every still-`scheduled` record whose publish instant already
/// passed to `missed`. Only ever called once, from [`missed_on_start`] —
/// `spec.md §4.4`: checked against `scheduledPublishTime`, not
/// `eventStartsAt` — a record can still be validly due (and get queued)
/// right up to the moment its event starts.
fn detect_missed(state: &mut EngineState, now: OffsetDateTime, missed_tx: &broadcast::Sender<PendingRecord>) {
    let overdue: Vec<SlotKey> = state
        .pending
        .iter_pending()
        .filter(|r| matches!(r.status, PendingStatus::Scheduled))
        .filter(|r| r.effective_publish_time() <= now)
        .map(|r| r.slot_key.clone())
        .collect();

    for key in overdue {
        if mark_missed(state, &key, now, missed_tx) {
            warn!(target: LOG_TARGET, slot_key = %key, "Publish time passed with no attempt recorded; marking missed");
        }
    }
}

/// Flips due `scheduled` records to `queued` and pushes them onto the
/// publish queue. A record overdue by more than `due_grace` — more than this
/// loop could plausibly have slept without checking — is flipped to `missed`
/// instead (`spec.md §5`: a long system sleep or clock jump must resolve the
/// next fire as past, bounded by the adaptive recheck ladder rather than
/// silently queuing something stale).
async fn queue_due_records(
    state: &mut EngineState,
    queue: &tokio::sync::Mutex<crate::task::rate_limit::PublishQueue>,
    now: OffsetDateTime,
    due_grace: std::time::Duration,
    missed_tx: &broadcast::Sender<PendingRecord>,
) -> Option<OffsetDateTime> {
    let grace = time::Duration::try_from(due_grace).unwrap_or(time::Duration::ZERO);
    let mut next_due = None;
    let mut due_keys = Vec::new();
    let mut overdue_keys = Vec::new();

    for record in state.pending.iter_pending() {
        if record.status != PendingStatus::Scheduled {
            continue;
        }
        let publish_at = record.effective_publish_time();
        if publish_at <= now {
            if now - publish_at > grace {
                overdue_keys.push(record.slot_key.clone());
            } else {
                due_keys.push(record.slot_key.clone());
            }
        } else {
            next_due = Some(next_due.map_or(publish_at, |cur: OffsetDateTime| cur.min(publish_at)));
        }
    }

    for key in overdue_keys {
        if mark_missed(state, &key, now, missed_tx) {
            warn!(
                target: LOG_TARGET,
                slot_key = %key,
                "Publish time passed well beyond the scheduler's normal cadence; marking missed instead of queuing (long suspend or clock jump)",
            );
        }
    }

    if due_keys.is_empty() {
        return next_due;
    }

    let mut queue = queue.lock().await;
    for key in due_keys {
        let Some(record) = state.pending.get_mut(&key) else { continue };
        record.status = PendingStatus::Queued;
        record.queued_at = Some(now);
        queue.push(QueueEntry {
            publish_at: record.effective_publish_time(),
            target_id: record.target_id.clone(),
            profile_key: record.profile_key.clone(),
            slot_key: record.slot_key.clone(),
        });
    }
    next_due
}
