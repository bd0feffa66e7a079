//! Pure domain types and durable storage for the event-publication engine.
//!
//! This crate owns everything that doesn't need a clock-driven actor: slot
//! identity, the publish-time calculator, the pending-event store with its
//! soft-delete pool, and per-profile automation state. The scheduler,
//! rate-limit gate, publish worker, and control surface that drive these
//! types over time live in `evently-engine`.

pub mod atomic_file;
pub mod calc;
pub mod error;
pub mod expand;
pub mod model;
pub mod profile;
pub mod slot;
pub mod store;

pub use error::{CoreError, CoreResult};
pub use expand::SlotExpander;
pub use model::{ManualOverrides, PendingRecord, PendingStatus};
pub use profile::{AutomationSettings, Profile, RepeatMode, TimingMode};
pub use slot::{Millis, Slot, SlotKey};
pub use store::automation_state::AutomationState;
pub use store::pending::PendingStore;

const LOG_TARGET: &str = "evently::core";
