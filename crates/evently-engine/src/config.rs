//! Tunable constants governing scheduling, rate limiting, and backoff.
//! Defaults match steady-state operation; tests and unusual deployments can
//! override any field through the builder.

use std::time::Duration;

use evently_core::calc::AfterModeAnchor;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Width of the sliding window a target's publish count is measured
    /// against.
    pub rate_window: Duration,
    /// Maximum publishes permitted to one target within `rate_window`.
    pub rate_limit_max_per_window: u32,
    /// Backoff durations tried in order after consecutive rate-limit
    /// signals from the same target; the last entry repeats once reached.
    pub backoff_ladder: Vec<Duration>,
    /// Minimum spacing enforced between any two publish attempts, across
    /// all targets, to avoid bursting a downstream service.
    pub inter_publish_spacing: Duration,
    /// Delay before retrying a record after a non-rate-limit publish
    /// failure.
    pub publish_retry_delay: Duration,
    /// How long the scheduler sleeps when nothing is due, growing along
    /// this ladder the longer it keeps finding nothing; the last entry
    /// repeats once reached.
    pub idle_recheck_ladder: Vec<Duration>,
    /// Soft-deleted records kept per store before the oldest is purged.
    pub deleted_display_limit: usize,
    /// Which instant an `after`-mode profile's first slot anchors against.
    pub after_mode_anchor: AfterModeAnchor,
    /// How far ahead of now the scheduler asks the slot expander to expand.
    pub expansion_horizon: Duration,
    /// `ActOnMissed::reschedule`'s fallback delay when before-mode timing
    /// still recomputes into the past.
    pub reschedule_delay: Duration,
}

#[bon::bon]
impl EngineConfig {
    #[builder(finish_fn(name = "build"))]
    pub fn new(
        #[builder(default = Duration::from_secs(3600))] rate_window: Duration,
        #[builder(default = 10)] rate_limit_max_per_window: u32,
        #[builder(default = default_backoff_ladder())] backoff_ladder: Vec<Duration>,
        #[builder(default = Duration::from_millis(100))] inter_publish_spacing: Duration,
        #[builder(default = Duration::from_secs(15 * 60))] publish_retry_delay: Duration,
        #[builder(default = default_idle_recheck_ladder())] idle_recheck_ladder: Vec<Duration>,
        #[builder(default = evently_core::store::pending::DEFAULT_DELETED_DISPLAY_LIMIT)] deleted_display_limit: usize,
        #[builder(default)] after_mode_anchor: AfterModeAnchor,
        #[builder(default = Duration::from_secs(30 * 24 * 60 * 60))] expansion_horizon: Duration,
        #[builder(default = Duration::from_secs(5 * 60))] reschedule_delay: Duration,
    ) -> Self {
        Self {
            rate_window,
            rate_limit_max_per_window,
            backoff_ladder,
            inter_publish_spacing,
            publish_retry_delay,
            idle_recheck_ladder,
            deleted_display_limit,
            after_mode_anchor,
            expansion_horizon,
            reschedule_delay,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig::builder().build()
    }
}

impl EngineConfig {
    /// Backoff duration for the `n`th consecutive rate-limit signal (0
    /// indexed): walks `backoff_ladder`, clamping at the last entry.
    pub fn backoff_duration(&self, consecutive_failures: u32) -> Duration {
        let index = (consecutive_failures as usize).min(self.backoff_ladder.len().saturating_sub(1));
        self.backoff_ladder.get(index).copied().unwrap_or(Duration::from_secs(60))
    }

    /// Idle-recheck sleep for the `n`th consecutive empty scheduler pass.
    pub fn idle_recheck_duration(&self, consecutive_idle_passes: u32) -> Duration {
        let index = (consecutive_idle_passes as usize).min(self.idle_recheck_ladder.len().saturating_sub(1));
        self.idle_recheck_ladder.get(index).copied().unwrap_or(Duration::from_secs(300))
    }
}

/// `spec.md §4.5`: 2, 4, 8, 16, 32, 60 minutes.
fn default_backoff_ladder() -> Vec<Duration> {
    [2, 4, 8, 16, 32, 60].into_iter().map(|m| Duration::from_secs(m * 60)).collect()
}

fn default_idle_recheck_ladder() -> Vec<Duration> {
    [5, 15, 60, 300].into_iter().map(Duration::from_secs).collect()
}
