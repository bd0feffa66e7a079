//! Publish worker: the single per-engine processor draining the priority
//! queue C6 feeds it. Resolves dynamic details, calls out to the external
//! publisher, and folds the outcome back into the store and automation
//! state (`spec.md §4.6`).

use std::sync::Arc;
use std::time::{Duration, Instant};

use evently_core::{PendingRecord, PendingStatus};
use evently_util_error::FmtCompact as _;
use evently_util_fmt::AsFmtOption as _;
use serde_json::Value;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::error::EngineResult;
use crate::publisher::PublishDetails;
use crate::task::rate_limit::QueueEntry;
use crate::LOG_TARGET;

pub async fn run(handle: crate::engine::EngineHandle) {
    let Some(engine) = handle.upgrade() else { return };
    let mut wake_rx = engine.wake.subscribe();
    let mut shutdown_rx = engine.shutdown.subscribe();
    drop(engine);

    loop {
        let Some(engine) = handle.upgrade() else {
            debug!(target: LOG_TARGET, "Publish worker stopping: engine dropped");
            return;
        };

        if *shutdown_rx.borrow() {
            return;
        }

        let sleep_for = match tick(&engine).await {
            Ok(Some(wait)) => wait,
            Ok(None) => {
                drop(engine);
                // Queue is empty; wait for the scheduler (or a control
                // call) to notify rather than busy-polling.
                tokio::select! {
                    _ = wake_rx.changed() => {}
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() { return; }
                    }
                }
                continue;
            }
            Err(err) => {
                warn!(target: LOG_TARGET, err = %err.fmt_compact(), "Publish worker tick failed");
                Duration::from_secs(5)
            }
        };

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

/// One processor step: admit the head of the queue if its target isn't
/// rate-limited, otherwise report how long to wait before checking again.
/// `spec.md §4.5`: "at most one execution runs at a time across the whole
/// engine" — enforced by only ever popping/processing one entry per tick.
async fn tick(engine: &Arc<Engine>) -> EngineResult<Option<Duration>> {
    let head = {
        let queue = engine.queue.lock().await;
        queue.peek().cloned()
    };
    let Some(head) = head else { return Ok(None) };

    let now = Instant::now();
    let wait = {
        let mut rate_limits = engine.rate_limits.lock().await;
        let state = rate_limits.entry(head.target_id.clone()).or_default();
        if state.is_available(now, &engine.config) {
            None
        } else {
            Some(state.backoff_remaining(now).unwrap_or(Duration::from_millis(100)) + Duration::from_millis(100))
        }
    };

    if let Some(wait) = wait {
        return Ok(Some(wait));
    }

    let entry = {
        let mut queue = engine.queue.lock().await;
        queue.pop()
    };
    let Some(entry) = entry else { return Ok(None) };

    let _ = execute(engine, entry).await?;
    Ok(Some(engine.config.inter_publish_spacing))
}

/// What a single [`execute`] attempt resolved to. `control::act_on_missed`'s
/// `postNow` reports this back to the caller verbatim; the regular queue
/// drain in [`tick`] only logs it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ExecuteOutcome {
    Published,
    Queued,
    Cancelled,
    Error(String),
    /// Record was already gone or terminal by the time this ran.
    NoOp,
}

/// Runs one publish attempt for `entry` against whatever state the record
/// currently holds, and folds the outcome back into the store. Used both by
/// the queue-draining loop above and directly by `ActOnMissed::postNow`,
/// which bypasses the rate-limit gate per `spec.md §4.7`.
pub(crate) async fn execute(engine: &Arc<Engine>, entry: QueueEntry) -> EngineResult<ExecuteOutcome> {
    let now = OffsetDateTime::now_utc();

    let record = {
        let mut state = engine.state.write().await;
        let Some(record) = state.pending.get(&entry.slot_key).cloned() else {
            return Ok(ExecuteOutcome::NoOp);
        };
        if record.is_terminal() {
            return Ok(ExecuteOutcome::NoOp);
        }
        if let Some(r) = state.pending.get_mut(&entry.slot_key) {
            r.status = PendingStatus::Processing;
        }
        state.pending.get(&entry.slot_key).cloned().unwrap_or(record)
    };

    let profile = {
        let state = engine.state.read().await;
        state.profiles.get(&(record.target_id.clone(), record.profile_key.clone())).cloned()
    };

    let Some(profile) = profile else {
        let mut state = engine.state.write().await;
        if let Some(r) = state.pending.get_mut(&entry.slot_key) {
            r.status = PendingStatus::Cancelled;
        }
        state.pending.save().await?;
        warn!(target: LOG_TARGET, slot_key = %entry.slot_key, "Profile gone at publish time; cancelling");
        return Ok(ExecuteOutcome::Cancelled);
    };

    let details = resolve_details(&profile, &record);

    // Suspension point (spec.md §5): no lock held across the external call.
    let outcome = engine.publisher.publish_event(&details).await;

    let mut state = engine.state.write().await;
    let result = match outcome {
        Ok(published) => {
            {
                let mut rate_limits = engine.rate_limits.lock().await;
                rate_limits.entry(record.target_id.clone()).or_default().record_success(Instant::now(), &engine.config);
            }

            if let Some(r) = state.pending.get_mut(&entry.slot_key) {
                r.status = PendingStatus::Published;
                r.event_id = Some(published.event_id.clone());
            }
            state.automation.record_success(&record.target_id, &record.profile_key, now, record.effective_event_starts_at(), published.event_id);
            state.pending.save().await?;
            state.automation.save().await?;

            if let Some(r) = state.pending.get(&entry.slot_key) {
                let _ = engine.published_tx.send(r.clone());
            }
            info!(target: LOG_TARGET, slot_key = %entry.slot_key, "Published");
            ExecuteOutcome::Published
        }
        Err(failure) if failure.is_rate_limited() => {
            {
                let mut rate_limits = engine.rate_limits.lock().await;
                rate_limits.entry(record.target_id.clone()).or_default().record_rate_limited(Instant::now(), &engine.config);
            }

            if let Some(r) = state.pending.get_mut(&entry.slot_key) {
                r.status = PendingStatus::Queued;
                r.queued_at = Some(now);
            }
            state.pending.save().await?;
            drop(state);

            let mut queue = engine.queue.lock().await;
            queue.push(entry.clone());
            debug!(target: LOG_TARGET, slot_key = %entry.slot_key, "Rate limited; re-queued");
            ExecuteOutcome::Queued
        }
        Err(failure) => {
            if let Some(r) = state.pending.get_mut(&entry.slot_key) {
                r.status = PendingStatus::Scheduled;
                r.attempt_count = r.attempt_count.saturating_add(1);
                r.last_error = Some(failure.message.clone());
            }
            state.pending.save().await?;
            drop(state);

            warn!(
                target: LOG_TARGET,
                slot_key = %entry.slot_key,
                err = %failure.message,
                status = %failure.status.as_ref().fmt_option(),
                code = %failure.code.as_ref().fmt_option(),
                "Publish failed; scheduling a single retry",
            );
            schedule_retry(engine, entry);
            ExecuteOutcome::Error(failure.message)
        }
    };

    Ok(result)
}

/// `spec.md §4.6` step 7: "schedule a single retry after 15 min (a direct
/// C7 call, not going through C5's recheck ladder)". Implemented as
/// re-enqueuing at the same priority once the delay elapses, rather than
/// waiting for the scheduler's next expansion/detection pass — C6's gate
/// still applies when it's picked back up.
fn schedule_retry(engine: &Arc<Engine>, entry: QueueEntry) {
    let handle = engine.handle();
    let delay = engine.config.publish_retry_delay;
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let Some(engine) = handle.upgrade() else { return };
        {
            let state = engine.state.read().await;
            match state.pending.get(&entry.slot_key) {
                Some(r) if r.status == PendingStatus::Scheduled => {}
                _ => return,
            }
        }
        let mut queue = engine.queue.lock().await;
        queue.push(entry);
        drop(queue);
        engine.notify();
    });
}

/// Merges the profile's opaque pattern fields with any override keys
/// present (overrides win), per `spec.md §4.6` step 3.
fn resolve_details(profile: &evently_core::Profile, record: &PendingRecord) -> PublishDetails {
    let overrides = record.overrides();
    let starts_at = record.effective_event_starts_at();
    let duration = overrides
        .duration_minutes
        .map(time::Duration::minutes)
        .unwrap_or_else(|| profile.duration());
    let ends_at = starts_at + duration;

    let mut fields = match &profile.patterns {
        Value::Object(map) => Value::Object(map.clone()),
        _ => Value::Object(serde_json::Map::new()),
    };
    if let Value::Object(map) = &mut fields {
        insert_if_some(map, "title", overrides.title);
        insert_if_some(map, "description", overrides.description);
        insert_if_some(map, "category", overrides.category);
        insert_if_some(map, "accessType", overrides.access_type);
        insert_if_some(map, "languages", overrides.languages);
        insert_if_some(map, "platforms", overrides.platforms);
        insert_if_some(map, "tags", overrides.tags);
        insert_if_some(map, "imageId", overrides.image_id);
        insert_if_some(map, "imageUrl", overrides.image_url);
        insert_if_some(map, "roleIds", overrides.role_ids);
        insert_if_some(map, "timezone", overrides.timezone.or_else(|| Some(profile.timezone.clone())));
    }

    PublishDetails {
        target_id: record.target_id.clone(),
        slot_key: record.slot_key.to_string(),
        fields,
        starts_at,
        ends_at,
    }
}

fn insert_if_some<T: Into<Value>>(map: &mut serde_json::Map<String, Value>, key: &str, value: Option<T>) {
    if let Some(value) = value {
        map.insert(key.to_owned(), value.into());
    }
}
