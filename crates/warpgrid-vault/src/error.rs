//! Error types for Vault lease renewal.

use thiserror::Error;

/// Result type alias for renewal operations.
pub type VaultResult<T> = Result<T, VaultError>;

/// Errors that can occur while tracking or renewing leases.
///
/// `NotRenewable` and `LeaseNotFound` are terminal: the lease is dropped from
/// tracking once either is observed. `Connection` is transient and retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VaultError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("lease already tracked: {0}")]
    DuplicateId(String),

    #[error("lease not tracked: {0}")]
    NotTracked(String),

    #[error("vault client is disabled or not running")]
    ClientDisabled,

    /// Carries Vault's own message, which already names the failure.
    #[error("{0}")]
    NotRenewable(String),

    #[error("{0}")]
    LeaseNotFound(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl VaultError {
    /// Whether this error ends tracking of the lease it was reported for.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::NotRenewable(_) | Self::LeaseNotFound(_))
    }

    /// Whether the renewal should be retried after the backoff interval.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}
