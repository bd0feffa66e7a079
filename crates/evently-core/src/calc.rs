//! Publish-time calculator.
//!
//! Pure functions: given a slot's `eventStartsAt` and the profile's
//! automation settings, derive the instant at which the pending record
//! should be published. The scheduler (`evently-engine`) is the only thing
//! that decides whether a given publish time has already slipped into the
//! past (`missed`).

use time::{Duration, Month, OffsetDateTime};

use crate::profile::{AutomationSettings, TimingMode};

/// A publish time may never be later than 30 minutes before the event
/// starts.
pub const HARD_CAP: Duration = Duration::minutes(30);

/// What anchor the first `after`-mode slot of a profile uses when there is
/// no previous slot yet to anchor against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AfterModeAnchor {
    /// `lastSuccess` if the profile has published before, else wall-clock
    /// now. The default.
    #[default]
    PreviousSuccessOrNow,
    /// Always wall-clock now, ignoring `lastSuccess`.
    WallClockNow,
}

/// Which call site is asking for a publish time. `after`-mode needs a
/// previous slot to anchor against; call sites with no such context
/// (restoring a soft-deleted record, recomputing on load, applying an
/// override) substitute `before`-mode timing instead.
#[derive(Debug, Clone, Copy)]
pub enum RecomputeContext {
    Expansion {
        previous_slot_start: Option<OffsetDateTime>,
        last_success: Option<OffsetDateTime>,
        now: OffsetDateTime,
        anchor: AfterModeAnchor,
    },
    Restore,
}

/// `before`-mode: `publish = start − (d·24h + h·1h + m·1min)`.
pub fn before_publish_time(starts_at: OffsetDateTime, automation: &AutomationSettings) -> OffsetDateTime {
    starts_at - Duration::minutes(automation.before_offset_minutes())
}

/// `monthly`-mode: the calendar `(year, monthOfStart, min(monthlyDay,
/// lastDayOfMonth), monthlyHour, monthlyMinute)`, stepping one month
/// earlier (re-clamping) until strictly before `starts_at`.
pub fn monthly_publish_time(starts_at: OffsetDateTime, automation: &AutomationSettings) -> OffsetDateTime {
    let mut year = starts_at.year();
    let mut month = starts_at.month();

    loop {
        let candidate = monthly_candidate(year, month, automation);
        if candidate < starts_at {
            return candidate;
        }
        (year, month) = previous_month(year, month);
    }
}

fn monthly_candidate(year: i32, month: Month, automation: &AutomationSettings) -> OffsetDateTime {
    let last_day = time::util::days_in_year_month(year, month);
    let day = automation.monthly_day.min(last_day);
    time::Date::from_calendar_date(year, month, day)
        .expect("day clamped to days_in_year_month")
        .with_hms(automation.monthly_hour, automation.monthly_minute, 0)
        .expect("hour/minute are profile-validated 0..=23 / 0..=59")
        .assume_utc()
}

fn previous_month(year: i32, month: Month) -> (i32, Month) {
    if month == Month::January {
        (year - 1, Month::December)
    } else {
        (year, month.previous())
    }
}

/// `after`-mode: `publish = (previousSlot.eventStart + duration) + offset`,
/// with the "smart switch" fallback to `before`-mode timing against
/// `slot_start` when the candidate would land past the midpoint between
/// the previous slot and this one.
#[allow(clippy::too_many_arguments)]
pub fn after_publish_time(
    slot_start: OffsetDateTime,
    previous_slot_start: Option<OffsetDateTime>,
    duration: Duration,
    automation: &AutomationSettings,
    anchor: AfterModeAnchor,
    last_success: Option<OffsetDateTime>,
    now: OffsetDateTime,
) -> OffsetDateTime {
    let offset = Duration::minutes(automation.before_offset_minutes());
    let previous_anchor = previous_slot_start.unwrap_or_else(|| match anchor {
        AfterModeAnchor::PreviousSuccessOrNow => last_success.unwrap_or(now),
        AfterModeAnchor::WallClockNow => now,
    });

    let candidate = previous_anchor + duration + offset;
    let midpoint = previous_anchor + (slot_start - previous_anchor) / 2;

    if candidate > midpoint {
        before_publish_time(slot_start, automation)
    } else {
        candidate
    }
}

/// `scheduledPublishTime = min(publish, start − 30 min)`. Note a result
/// earlier than `now` is still valid here — the scheduler, not the
/// calculator, decides that's a `missed` record.
pub fn apply_hard_cap(publish: OffsetDateTime, starts_at: OffsetDateTime) -> OffsetDateTime {
    let cap = starts_at - HARD_CAP;
    if publish > cap { cap } else { publish }
}

/// Dispatches on `automation.timing_mode` and applies the hard cap. This is
/// the one entry point the rest of the engine should call.
pub fn compute_publish_time(
    slot_start: OffsetDateTime,
    automation: &AutomationSettings,
    duration: Duration,
    ctx: RecomputeContext,
) -> OffsetDateTime {
    let raw = match automation.timing_mode {
        TimingMode::Before => before_publish_time(slot_start, automation),
        TimingMode::Monthly => monthly_publish_time(slot_start, automation),
        TimingMode::After => match ctx {
            RecomputeContext::Expansion {
                previous_slot_start,
                last_success,
                now,
                anchor,
            } => after_publish_time(
                slot_start,
                previous_slot_start,
                duration,
                automation,
                anchor,
                last_success,
                now,
            ),
            RecomputeContext::Restore => before_publish_time(slot_start, automation),
        },
    };
    apply_hard_cap(raw, slot_start)
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;
    use crate::profile::RepeatMode;

    fn automation(timing_mode: TimingMode) -> AutomationSettings {
        AutomationSettings {
            enabled: true,
            timing_mode,
            days_offset: 3,
            hours_offset: 0,
            minutes_offset: 0,
            monthly_day: 31,
            monthly_hour: 19,
            monthly_minute: 30,
            repeat_mode: RepeatMode::Indefinite,
            repeat_count: None,
        }
    }

    #[test]
    fn before_mode_subtracts_offset() {
        let starts_at = datetime!(2026-03-06 19:00 UTC);
        let publish = before_publish_time(starts_at, &automation(TimingMode::Before));
        assert_eq!(publish, datetime!(2026-03-03 19:00 UTC));
    }

    #[test]
    fn monthly_day_31_clamps_in_a_30_day_month() {
        // April has 30 days; monthlyDay=31 must clamp to day 30.
        let starts_at = datetime!(2026-04-25 18:00 UTC);
        let publish = monthly_publish_time(starts_at, &automation(TimingMode::Monthly));
        assert_eq!(publish, datetime!(2026-04-30 19:30 UTC));
    }

    #[test]
    fn monthly_steps_back_a_month_when_candidate_not_before_start() {
        // Event starts before the monthly publish-day-of-month would occur
        // within the same month, so the candidate must come from the prior
        // month instead.
        let starts_at = datetime!(2026-04-05 18:00 UTC);
        let publish = monthly_publish_time(starts_at, &automation(TimingMode::Monthly));
        assert_eq!(publish, datetime!(2026-03-31 19:30 UTC));
    }

    #[test]
    fn hard_cap_permits_exactly_thirty_minutes() {
        let starts_at = datetime!(2026-03-06 19:00 UTC);
        let publish = starts_at - Duration::minutes(30);
        assert_eq!(apply_hard_cap(publish, starts_at), publish);
    }

    #[test]
    fn hard_cap_clamps_twenty_nine_minutes_down() {
        let starts_at = datetime!(2026-03-06 19:00 UTC);
        let publish = starts_at - Duration::minutes(29);
        assert_eq!(apply_hard_cap(publish, starts_at), starts_at - Duration::minutes(30));
    }

    #[test]
    fn after_mode_first_slot_uses_last_success_anchor() {
        let last_success = datetime!(2026-03-01 12:00 UTC);
        let slot_start = datetime!(2026-03-08 12:00 UTC);
        let publish = after_publish_time(
            slot_start,
            None,
            Duration::hours(1),
            &automation(TimingMode::After),
            AfterModeAnchor::PreviousSuccessOrNow,
            Some(last_success),
            datetime!(2026-03-05 00:00 UTC),
        );
        // previous_anchor + duration + offset(3d) = 2026-03-01 13:00 + 3d
        assert_eq!(publish, datetime!(2026-03-04 13:00 UTC));
    }

    #[test]
    fn after_mode_smart_switch_falls_back_to_before_mode() {
        // Previous slot is close to this slot, so previous+duration+offset
        // would land past the midpoint; expect a before-mode fallback.
        let previous = datetime!(2026-03-06 12:00 UTC);
        let slot_start = datetime!(2026-03-06 18:00 UTC);
        let publish = after_publish_time(
            slot_start,
            Some(previous),
            Duration::hours(1),
            &automation(TimingMode::After),
            AfterModeAnchor::PreviousSuccessOrNow,
            None,
            datetime!(2026-03-01 00:00 UTC),
        );
        assert_eq!(publish, before_publish_time(slot_start, &automation(TimingMode::After)));
    }

    #[test]
    fn restore_context_substitutes_before_mode_for_after() {
        let slot_start = datetime!(2026-03-06 19:00 UTC);
        let publish = compute_publish_time(
            slot_start,
            &automation(TimingMode::After),
            Duration::hours(1),
            RecomputeContext::Restore,
        );
        assert_eq!(publish, before_publish_time(slot_start, &automation(TimingMode::After)));
    }

    proptest::proptest! {
        /// Whatever candidate publish time comes in, `apply_hard_cap` never
        /// returns something later than 30 minutes before the event, and
        /// never moves a candidate that already respects the cap.
        #[test]
        fn hard_cap_never_exceeds_thirty_minutes_before_start(
            starts_at_unix in 0i64..4_102_444_800,
            candidate_offset_minutes in -120i64..120,
        ) {
            let starts_at = OffsetDateTime::from_unix_timestamp(starts_at_unix).unwrap();
            let publish = starts_at + Duration::minutes(candidate_offset_minutes);
            let result = apply_hard_cap(publish, starts_at);

            prop_assert!(result <= starts_at - HARD_CAP);
            if publish <= starts_at - HARD_CAP {
                prop_assert_eq!(result, publish);
            }
        }
    }
}
