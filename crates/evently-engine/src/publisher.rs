//! The only way the engine talks to the outside world. Pattern syntax,
//! HTTP, and credentials all live behind this boundary — the engine only
//! ever sees resolved details and an outcome (`spec.md §1`/`§6`).

use async_trait::async_trait;
use serde_json::Value;
use time::OffsetDateTime;

/// What the publish worker hands the external collaborator: a target, the
/// merged event fields (opaque to the engine beyond the recognized
/// override keys it inserted), and the resolved start/end instants.
#[derive(Debug, Clone)]
pub struct PublishDetails {
    pub target_id: String,
    pub slot_key: String,
    pub fields: Value,
    pub starts_at: OffsetDateTime,
    pub ends_at: OffsetDateTime,
}

/// The remote id handed back by a successful publish, stored on the
/// pending record and the profile's automation state.
#[derive(Debug, Clone)]
pub struct PublishedEvent {
    pub event_id: String,
}

/// `spec.md §6`: `{ok:false, error:{code?, status?, message}}`.
#[derive(Debug, Clone)]
pub struct PublishFailure {
    pub code: Option<String>,
    pub status: Option<u16>,
    pub message: String,
}

impl PublishFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            status: None,
            message: message.into(),
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    /// `spec.md §6`: rate-limit signal is `code = "UPCOMING_LIMIT"` OR
    /// `status = 429` OR `message` contains "rate limit" case-insensitively.
    pub fn is_rate_limited(&self) -> bool {
        self.code.as_deref() == Some("UPCOMING_LIMIT") || self.status == Some(429) || self.message.to_lowercase().contains("rate limit")
    }
}

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish_event(&self, details: &PublishDetails) -> Result<PublishedEvent, PublishFailure>;
}
