// Failure taxonomy shared by the pool, cache and orchestrator.

use std::time::Duration;

use thiserror::Error;

/// Failure reported by a [`SessionProvider`](crate::source::traits::SessionProvider) capture.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CaptureError {
    /// Network trouble or a timeout. Worth retrying on the same session.
    #[error("transient upstream error: {0}")]
    Transient(String),
    /// Anomalous response shape or status; the session may be flagged.
    #[error("detection suspected: {0}")]
    DetectionSuspected(String),
    /// The upstream definitively has no such entity.
    #[error("not found upstream: {0}")]
    NotFound(String),
    /// The session itself is unusable.
    #[error("fatal session error: {0}")]
    Fatal(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("no session became available within {0:?}")]
    Timeout(Duration),
}

/// Per-entity fetch failure. `Clone` so a single-flight winner can hand the
/// same error to every waiter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("resource exhausted: no session available within {0:?}")]
    ResourceExhausted(Duration),
    #[error("transient upstream error after {attempts} attempt(s): {message}")]
    TransientUpstream { attempts: u32, message: String },
    #[error("detection suspected: {0}")]
    DetectionSuspected(String),
    #[error("fatal session error: {0}")]
    FatalSession(String),
    #[error("not found upstream: {0}")]
    NotFound(String),
    #[error("shared fetch failed: {0}")]
    CacheFetchFailed(Box<FetchError>),
    #[error("deadline exceeded")]
    DeadlineExceeded,
    #[error("orchestrator is shutting down")]
    ShuttingDown,
}

impl FetchError {
    /// Stable label used for failure counters and log fields.
    pub fn class(&self) -> &'static str {
        match self {
            FetchError::ResourceExhausted(_) => "resource_exhausted",
            FetchError::TransientUpstream { .. } => "transient_upstream",
            FetchError::DetectionSuspected(_) => "detection_suspected",
            FetchError::FatalSession(_) => "fatal_session",
            FetchError::NotFound(_) => "not_found",
            FetchError::CacheFetchFailed(_) => "cache_fetch_failed",
            FetchError::DeadlineExceeded => "deadline_exceeded",
            FetchError::ShuttingDown => "shutting_down",
        }
    }

    /// The error behind any `CacheFetchFailed` wrapping.
    pub fn root(&self) -> &FetchError {
        match self {
            FetchError::CacheFetchFailed(inner) => inner.root(),
            other => other,
        }
    }

    pub fn is_resource_exhausted(&self) -> bool {
        matches!(self.root(), FetchError::ResourceExhausted(_))
    }
}
