//! Stand-ins for the two external collaborators the engine depends on
//! (`evently_engine::EventPublisher`, `evently_core::SlotExpander`), so the
//! `demo` subcommand can drive a real [`evently_engine::Engine`] end to end
//! without a network call or a pattern-expansion implementation.

use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use evently_core::{Profile, Slot, SlotExpander};
use evently_util_error::BoxedError;
use evently_engine::{EventPublisher, PublishDetails, PublishFailure, PublishedEvent};
use time::OffsetDateTime;
use tracing::info;

use crate::LOG_TARGET;

/// Always succeeds for the first `fail_after` publishes to a target, then
/// answers every further attempt with a rate-limit failure forever — enough
/// to exercise the gate's backoff ladder and window-full branch without a
/// real downstream service.
pub struct MockPublisher {
    fail_after: u32,
    published: AtomicU32,
}

impl MockPublisher {
    pub fn new(fail_after: u32) -> Self {
        Self {
            fail_after,
            published: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl EventPublisher for MockPublisher {
    async fn publish_event(&self, details: &PublishDetails) -> Result<PublishedEvent, PublishFailure> {
        let attempt = self.published.fetch_add(1, Ordering::SeqCst);
        if attempt >= self.fail_after {
            info!(target: LOG_TARGET, target_id = %details.target_id, slot_key = %details.slot_key, "Mock publisher simulating a rate limit");
            return Err(PublishFailure::new("simulated rate limit").with_code("UPCOMING_LIMIT").with_status(429));
        }

        let event_id = format!("demo-{}-{attempt}", details.target_id);
        info!(target: LOG_TARGET, target_id = %details.target_id, slot_key = %details.slot_key, event_id, "Mock publisher accepted");
        Ok(PublishedEvent { event_id })
    }
}

/// Expands a profile into slots on a fixed cadence starting from `first`,
/// standing in for the pattern-driven expander the spec leaves external to
/// the engine (weekly/monthly recurrence is the caller's concern, not
/// this crate's).
pub struct FixedIntervalSlotExpander {
    first: OffsetDateTime,
    interval: time::Duration,
}

impl FixedIntervalSlotExpander {
    pub fn new(first: OffsetDateTime, interval: time::Duration) -> Self {
        Self { first, interval }
    }
}

#[async_trait]
impl SlotExpander for FixedIntervalSlotExpander {
    async fn expand(&self, _profile: &Profile, horizon: OffsetDateTime) -> Result<Vec<Slot>, BoxedError> {
        let mut slots = Vec::new();
        let mut starts_at = self.first;
        while starts_at <= horizon {
            slots.push(Slot {
                starts_at,
                weekday: None,
                occurrence: None,
                is_last: false,
                is_annual: false,
            });
            starts_at += self.interval;
        }
        Ok(slots)
    }
}
