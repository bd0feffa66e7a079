use snafu::{Location, Snafu};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum EngineError {
    #[snafu(transparent)]
    Store { source: evently_core::CoreError },
    #[snafu(display("No profile registered for target {target_id:?} / profile {profile_key:?}"))]
    UnknownProfile {
        target_id: String,
        profile_key: String,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("Slot expansion failed for target {target_id:?} / profile {profile_key:?}: {source}"))]
    Expand {
        target_id: String,
        profile_key: String,
        source: evently_util_error::BoxedError,
        #[snafu(implicit)]
        location: Location,
    },
    /// Control API surface: `spec.md §7` "Invalid control input" — missing
    /// id, unknown action, bad `displayLimit`, etc. Never escalates; always
    /// returned as `{ok:false, error}`.
    #[snafu(display("{message}"))]
    InvalidInput {
        message: String,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("No pending record for slot key {slot_key}"))]
    RecordNotFound {
        slot_key: String,
        #[snafu(implicit)]
        location: Location,
    },
    /// `ActOnMissed::postNow` forbidden while the record is already
    /// `queued` or `published` (`spec.md §4.7`).
    #[snafu(display("Cannot post slot key {slot_key}: status is already {status}"))]
    AlreadyInFlight {
        slot_key: String,
        status: String,
        #[snafu(implicit)]
        location: Location,
    },
}

impl EngineError {
    /// Stable machine-readable code for the Control API's `{ok:false,
    /// error:{message, code?}}` shape (`spec.md §6`).
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Store { .. } => "STORE_ERROR",
            EngineError::UnknownProfile { .. } => "UNKNOWN_PROFILE",
            EngineError::Expand { .. } => "EXPAND_FAILED",
            EngineError::InvalidInput { .. } => "INVALID_INPUT",
            EngineError::RecordNotFound { .. } => "NOT_FOUND",
            EngineError::AlreadyInFlight { .. } => "ALREADY_IN_FLIGHT",
        }
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
