//! Per-target rate-limit gate: a sliding publish-count window plus
//! exponential backoff on explicit rate-limit signals from the publisher,
//! and a priority queue ordering due records across every target.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::time::{Duration, Instant};

use evently_core::SlotKey;
use evently_util_fmt::format_duration_relative;
use time::OffsetDateTime;
use tracing::debug;

use crate::config::EngineConfig;
use crate::LOG_TARGET;

/// Sliding-window + backoff state tracked independently per target.
#[derive(Debug, Clone)]
pub struct RateLimitState {
    window: VecDeque<Instant>,
    consecutive_failures: u32,
    backoff_until: Option<Instant>,
}

impl Default for RateLimitState {
    fn default() -> Self {
        Self {
            window: VecDeque::new(),
            consecutive_failures: 0,
            backoff_until: None,
        }
    }
}

impl RateLimitState {
    /// Whether this target currently accepts another publish attempt: not
    /// serving a backoff sentence, and under the sliding-window cap.
    pub fn is_available(&mut self, now: Instant, config: &EngineConfig) -> bool {
        if let Some(until) = self.backoff_until {
            if now < until {
                return false;
            }
            // Lock expiry resets the ladder too (spec.md §4.5).
            self.backoff_until = None;
            self.consecutive_failures = 0;
        }
        self.evict_expired(now, config.rate_window);
        self.window.len() < config.rate_limit_max_per_window as usize
    }

    pub fn backoff_remaining(&self, now: Instant) -> Option<Duration> {
        self.backoff_until.filter(|until| *until > now).map(|until| until - now)
    }

    /// Records a successful publish: resets backoff and marks the slot used
    /// in the sliding window.
    pub fn record_success(&mut self, now: Instant, config: &EngineConfig) {
        self.consecutive_failures = 0;
        self.backoff_until = None;
        self.window.push_back(now);
        self.evict_expired(now, config.rate_window);
    }

    /// Records an explicit rate-limit signal. `spec.md §4.5`: if the
    /// sliding window is already full, lock until its oldest entry ages out
    /// rather than walking the backoff ladder (the remote is telling us
    /// exactly when it'll accept another attempt); otherwise lock for
    /// `backoff_ladder[consecutive_failures]` and advance the ladder.
    pub fn record_rate_limited(&mut self, now: Instant, config: &EngineConfig) {
        self.evict_expired(now, config.rate_window);

        let duration = if self.window.len() >= config.rate_limit_max_per_window as usize {
            let oldest = *self.window.front().expect("window full implies non-empty");
            (oldest + config.rate_window).saturating_duration_since(now)
        } else {
            let duration = config.backoff_duration(self.consecutive_failures);
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
            duration
        };

        debug!(
            target: LOG_TARGET,
            lock_for = format_duration_relative(duration.as_secs()).as_deref().unwrap_or("?"),
            window_full = self.window.len() >= config.rate_limit_max_per_window as usize,
            "Rate limited; locking target",
        );
        self.backoff_until = Some(now + duration);
    }

    fn evict_expired(&mut self, now: Instant, window: Duration) {
        while let Some(oldest) = self.window.front() {
            if now.saturating_duration_since(*oldest) > window {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }
}

/// One record waiting to be published, ordered by due time and then by
/// `(targetId, profileKey, slotKey)` for a deterministic tie-break when two
/// records share the same `eventStartsAt`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub publish_at: OffsetDateTime,
    pub target_id: String,
    pub profile_key: String,
    pub slot_key: SlotKey,
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.publish_at
            .cmp(&other.publish_at)
            .then_with(|| self.target_id.cmp(&other.target_id))
            .then_with(|| self.profile_key.cmp(&other.profile_key))
            .then_with(|| self.slot_key.cmp(&other.slot_key))
    }
}

/// Min-heap over [`QueueEntry`] keyed by due time: `peek`/`pop` always
/// return the earliest-due record first.
#[derive(Debug, Default)]
pub struct PublishQueue {
    heap: BinaryHeap<Reverse<QueueEntry>>,
}

impl PublishQueue {
    pub fn push(&mut self, entry: QueueEntry) {
        self.heap.push(Reverse(entry));
    }

    pub fn peek(&self) -> Option<&QueueEntry> {
        self.heap.peek().map(|Reverse(entry)| entry)
    }

    pub fn pop(&mut self) -> Option<QueueEntry> {
        self.heap.pop().map(|Reverse(entry)| entry)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Removes every queued entry for a slot key, used when a record is
    /// overridden, reconciled, or soft-deleted out from under the queue.
    pub fn remove_slot(&mut self, slot_key: &SlotKey) {
        self.heap = self.heap.drain().filter(|Reverse(entry)| &entry.slot_key != slot_key).collect();
    }
}
