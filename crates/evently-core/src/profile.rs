//! Profile data is owned by the caller; the engine only ever reads it, keyed
//! by `(targetId, profileKey)`, and never caches a pointer to it inside a
//! pending record — pending records hold copies of the fields they need.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimingMode {
    Before,
    After,
    Monthly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepeatMode {
    Indefinite,
    Count,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutomationSettings {
    pub enabled: bool,
    pub timing_mode: TimingMode,
    #[serde(default)]
    pub days_offset: u32,
    #[serde(default)]
    pub hours_offset: u32,
    #[serde(default)]
    pub minutes_offset: u32,
    /// 1..=31; clamped to the month's actual last day by the calculator.
    pub monthly_day: u8,
    pub monthly_hour: u8,
    pub monthly_minute: u8,
    pub repeat_mode: RepeatMode,
    #[serde(default)]
    pub repeat_count: Option<u32>,
}

impl AutomationSettings {
    /// Total `before`-mode offset collapsed to minutes.
    pub fn before_offset_minutes(&self) -> i64 {
        i64::from(self.days_offset) * 24 * 60
            + i64::from(self.hours_offset) * 60
            + i64::from(self.minutes_offset)
    }
}

/// A publishing template, read-only to the engine. `patterns` and `timezone`
/// are only consumed by the external [`crate::expand::SlotExpander`] — the
/// engine itself works entirely in UTC instants derived from expansion.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub target_id: String,
    pub profile_key: String,
    /// Opaque to the engine; handed verbatim to the slot expander.
    pub patterns: serde_json::Value,
    pub timezone: String,
    pub duration_minutes: i64,
    pub automation: AutomationSettings,
}

impl Profile {
    pub fn id(&self) -> (String, String) {
        (self.target_id.clone(), self.profile_key.clone())
    }

    pub fn duration(&self) -> time::Duration {
        time::Duration::minutes(self.duration_minutes)
    }
}
