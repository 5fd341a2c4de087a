use async_trait::async_trait;
use bytes::Bytes;

use crate::error::CaptureError;

/// What a provider gets to see of a pooled session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHandle {
    pub id: String,
    /// Opaque profile reference (fingerprint / identity) assigned by the pool.
    pub profile: String,
    /// Checkouts completed before the current one.
    pub request_count: u32,
}

/// Boundary to the browsing/automation mechanics. The engine only knows
/// that a session can capture the raw payload for an entity.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    async fn capture(&self, session: &SessionHandle, entity_key: &str)
        -> Result<Bytes, CaptureError>;

    /// Called once a session has been retired so its resources can be freed.
    async fn discard(&self, _session: &SessionHandle) {}
}
