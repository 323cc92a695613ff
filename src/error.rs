// =============================================================================
// Error taxonomy shared by every component
// =============================================================================
//
// Components return `CoreError` so callers can match on kind rather than
// parse strings. `main.rs` and other wiring code collapses these into
// `anyhow::Error` at the boundary.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    /// Input failed a structural or business-rule check. Never retried.
    #[error("validation failed: {0}")]
    Validation(String),

    /// An indicator or rule needed more history than was available.
    #[error("insufficient data: {0}")]
    InsufficientData(String),

    /// Network/exchange hiccup expected to clear on its own. Caller should
    /// back off and retry.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Exchange rejected the call for being over budget. Carries the
    /// suggested wait before retrying, when the exchange provides one.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Exchange rejected the call for a reason that will not clear on
    /// retry (bad symbol, insufficient balance, invalid order).
    #[error("permanent failure: {0}")]
    Permanent(String),

    /// Invariant violated badly enough that the caller should stop rather
    /// than continue in a possibly-corrupt state.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl CoreError {
    /// Whether a caller should retry after backing off.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::RateLimited(_))
    }
}
