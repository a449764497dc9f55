use thiserror::Error;

/// Errors returned by load balancer operations.
///
/// Every variant except `Cancelled` carries the failing operation or key.
#[derive(Debug, Error)]
pub enum LbError {
    /// Missing or invalid settings, fatal at startup
    #[error("invalid configuration: {0}")]
    Config(String),

    /// No origin is alive
    #[error("no available backend for {stream_url}")]
    NoAvailableBackend { stream_url: String },

    /// Session absent or expired
    #[error("{op}: no live record for {key}")]
    NotFound { op: &'static str, key: String },

    /// The shared store could not be reached or failed the request
    #[error("{op}: store unavailable for {key}: {reason}")]
    BackendUnavailable {
        op: &'static str,
        key: String,
        reason: String,
    },

    /// The caller's context ended first
    #[error("operation cancelled")]
    Cancelled,

    /// A record in the shared store did not decode
    #[error("{op}: malformed record at {key}")]
    Codec {
        op: &'static str,
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

impl LbError {
    pub(crate) fn not_found(op: &'static str, key: impl Into<String>) -> Self {
        LbError::NotFound { op, key: key.into() }
    }

    pub(crate) fn unavailable(op: &'static str, key: impl Into<String>, reason: impl ToString) -> Self {
        LbError::BackendUnavailable {
            op,
            key: key.into(),
            reason: reason.to_string(),
        }
    }

    /// Infrastructure failures, as opposed to absence or staleness.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, LbError::BackendUnavailable { .. })
    }
}
