//! The pattern→slot boundary. Pattern syntax and timezone math live entirely
//! outside this crate; the engine only ever consumes already-expanded
//! [`Slot`] values.

use async_trait::async_trait;
use evently_util_error::BoxedError;

use crate::profile::Profile;
use crate::slot::Slot;

/// Turns a profile's opaque `patterns` into concrete future [`Slot`]s.
///
/// Implementations decide how far ahead to expand and whether results are
/// cached; the engine calls this whenever it needs fresh slots for a
/// profile and trusts whatever comes back.
#[async_trait]
pub trait SlotExpander: Send + Sync {
    async fn expand(&self, profile: &Profile, horizon: time::OffsetDateTime) -> Result<Vec<Slot>, BoxedError>;
}
