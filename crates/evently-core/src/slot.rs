//! Slot identity: deterministic keys for `(targetId, profileKey,
//! eventStartsAt)` triples produced by pattern expansion.

use std::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// A UTC instant truncated to millisecond precision, as carried in slot
/// keys and `publishedEventTimes`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Millis(pub i64);

impl From<OffsetDateTime> for Millis {
    fn from(t: OffsetDateTime) -> Self {
        Millis((t.unix_timestamp_nanos() / 1_000_000) as i64)
    }
}

impl Millis {
    pub fn to_offset_date_time(self) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp_nanos(i128::from(self.0) * 1_000_000)
            .unwrap_or(OffsetDateTime::UNIX_EPOCH)
    }
}

/// A future event instant produced by pattern expansion. Produced by the
/// external [`crate::expand::SlotExpander`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Slot {
    #[serde(with = "time::serde::rfc3339")]
    pub starts_at: OffsetDateTime,
    #[serde(default)]
    pub weekday: Option<String>,
    #[serde(default)]
    pub occurrence: Option<u32>,
    #[serde(default)]
    pub is_last: bool,
    #[serde(default)]
    pub is_annual: bool,
}

/// Canonical string id of a slot: `pending_{targetId}_{profileKey}_{eventStartMillis}`.
///
/// Identity of a slot is the `(targetId, profileKey, eventStartsAt)` triple;
/// this string is only the on-disk/wire encoding of it. Only the trailing
/// `_`-separated token is ever parsed back out (via `rsplit('_', 1)`) —
/// everything before it is opaque, since `targetId`/`profileKey` may
/// themselves contain underscores.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SlotKey(String);

impl SlotKey {
    pub fn new(target_id: &str, profile_key: &str, starts_at: OffsetDateTime) -> Self {
        let millis = Millis::from(starts_at);
        Self(format!("pending_{target_id}_{profile_key}_{}", millis.0))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Extracts the trailing `eventStartMillis` token. `None` if that token
    /// doesn't parse as a signed integer.
    pub fn start_millis(&self) -> Option<Millis> {
        let (_, millis_str) = self.0.rsplit_once('_')?;
        millis_str.parse::<i64>().ok().map(Millis)
    }

    /// Whether the string is of the deterministic `pending_{t}_{p}_{ms}`
    /// form normalization expects ids to take.
    pub fn looks_deterministic(&self) -> bool {
        self.0.starts_with("pending_") && self.start_millis().is_some()
    }
}

impl fmt::Display for SlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for SlotKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SlotKey {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;

    #[test]
    fn round_trips_start_millis() {
        let starts_at = datetime!(2026-03-06 19:00 UTC);
        let key = SlotKey::new("guild_1", "weekly_show", starts_at);

        assert_eq!(key.as_str(), format!("pending_guild_1_weekly_show_{}", Millis::from(starts_at).0));
        assert_eq!(key.start_millis(), Some(Millis::from(starts_at)));
        assert!(key.looks_deterministic());
    }

    #[test]
    fn only_trailing_token_is_parsed() {
        // target/profile containing underscores must not confuse parsing:
        // only the LAST token is ever interpreted.
        let key = SlotKey::from("pending_my_weird_target_my_weird_profile_1700000000000");
        assert_eq!(key.start_millis(), Some(Millis(1_700_000_000_000)));
    }

    #[test]
    fn non_numeric_trailing_token_is_not_deterministic() {
        let key = SlotKey::from("pending_abc_def_not-a-number");
        assert_eq!(key.start_millis(), None);
        assert!(!key.looks_deterministic());
    }

    proptest::proptest! {
        /// No matter what `targetId`/`profileKey` text or instant goes in,
        /// a key built by `SlotKey::new` always parses back out to the same
        /// millisecond instant and is recognized as deterministic. Covers
        /// the "opaque prefix" assumption above: ids/profiles may contain
        /// any characters `proptest` throws at them, including `_`.
        #[test]
        fn new_always_round_trips_through_start_millis(
            target_id in "[a-zA-Z0-9_]{1,20}",
            profile_key in "[a-zA-Z0-9_]{1,20}",
            unix_seconds in 0i64..4_102_444_800,
        ) {
            let starts_at = OffsetDateTime::from_unix_timestamp(unix_seconds).unwrap();
            let key = SlotKey::new(&target_id, &profile_key, starts_at);

            prop_assert!(key.looks_deterministic());
            prop_assert_eq!(key.start_millis(), Some(Millis::from(starts_at)));
        }
    }
}
