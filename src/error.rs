//! Domain error taxonomy.
//!
//! Services return these variants; only the transport adapter maps them to
//! HTTP statuses. `Error` is `Clone` so that single-flight barriers can hand
//! the same failure to every waiting caller.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("missing or invalid access token")]
    Unauthorized,

    #[error("access to this resource is not permitted")]
    Forbidden,

    #[error("{0} not found")]
    NotFound(String),

    /// Upstream refused the call rate. Carries a hint for `Retry-After`.
    #[error("upstream rate limited, retry in {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// Error budget exhausted, or 5xx persisted through all retries.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Transient network failure that survived the retry loop.
    #[error("upstream transport failure: {0}")]
    UpstreamTransport(String),

    /// Any other 4xx from the upstream that is not our caller's fault.
    #[error("upstream rejected the request: {0}")]
    UpstreamClient(String),

    #[error(transparent)]
    Business(#[from] BusinessError),

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Wrap an unexpected failure with context. Raw messages never leave the
    /// process; the transport adapter logs `self` and answers with a generic
    /// body.
    pub fn internal(context: &str, err: impl std::fmt::Display) -> Self {
        Error::Internal(format!("{context}: {err}"))
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Internal(format!("{err:#}"))
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Internal(format!("database: {err}"))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Internal(format!("serialization: {err}"))
    }
}

/// Business rule violations carry a stable code and a suggested transport
/// status so the adapter never has to pattern-match on message text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusinessError {
    #[error("character is not docked at a station or structure")]
    NotDocked,

    #[error("no route exists between the given systems")]
    NoRoute,

    #[error("location could not be resolved to a solar system")]
    InvalidLocation,

    #[error("not enough market data to answer this request")]
    InsufficientData,
}

impl BusinessError {
    pub fn code(&self) -> &'static str {
        match self {
            BusinessError::NotDocked => "not-docked",
            BusinessError::NoRoute => "no-route",
            BusinessError::InvalidLocation => "invalid-location",
            BusinessError::InsufficientData => "insufficient-data",
        }
    }

    /// Suggested HTTP status. The transport adapter is free to override.
    pub fn suggested_status(&self) -> u16 {
        match self {
            BusinessError::NotDocked => 400,
            BusinessError::NoRoute => 404,
            BusinessError::InvalidLocation => 400,
            BusinessError::InsufficientData => 422,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn business_codes_are_stable() {
        assert_eq!(BusinessError::NotDocked.code(), "not-docked");
        assert_eq!(BusinessError::NoRoute.code(), "no-route");
        assert_eq!(BusinessError::InvalidLocation.code(), "invalid-location");
        assert_eq!(BusinessError::InsufficientData.code(), "insufficient-data");
    }

    #[test]
    fn business_statuses() {
        assert_eq!(BusinessError::NotDocked.suggested_status(), 400);
        assert_eq!(BusinessError::NoRoute.suggested_status(), 404);
    }

    #[test]
    fn errors_clone_for_flight_sharing() {
        let err = Error::RateLimited { retry_after_secs: 3 };
        let copy = err.clone();
        match copy {
            Error::RateLimited { retry_after_secs } => assert_eq!(retry_after_secs, 3),
            other => panic!("unexpected variant: {other:?}"),
        }
    }
}
