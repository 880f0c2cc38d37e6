//! The credential-service boundary.
//!
//! The renewer only needs one operation from Vault: extend a token or lease
//! and report how long the extension is good for. Everything about how that
//! request reaches Vault lives behind [`RenewalBackend`].

use std::time::Duration;

use async_trait::async_trait;

use crate::error::{VaultError, VaultResult};
use crate::request::LeaseKind;

/// Outcome of a successful renewal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenewedLease {
    /// Validity granted from now.
    pub lease_duration: Duration,
    /// Whether Vault will accept a further renewal.
    pub renewable: bool,
}

/// Performs renewals against the secret-management service.
///
/// Vault's answers map onto [`VaultError::NotRenewable`],
/// [`VaultError::LeaseNotFound`] or [`VaultError::Connection`];
/// [`classify_response_error`] does this for Vault's error messages. Only
/// `Connection` is retried. Any other error, such as a backend missing the
/// credentials a request needs, ends tracking of the lease.
#[async_trait]
pub trait RenewalBackend: Send + Sync {
    /// Extend `id` by `increment` seconds.
    async fn renew(&self, kind: LeaseKind, id: &str, increment: u64) -> VaultResult<RenewedLease>;
}

/// Message fragments Vault uses for leases that exist but cannot be renewed.
const NOT_RENEWABLE: &[&str] = &["lease is not renewable"];

/// Message fragments Vault uses for leases or tokens that no longer exist.
/// An unknown token cannot authenticate its own renew-self call, so Vault
/// answers with a permission error for it.
const NOT_FOUND: &[&str] = &[
    "lease not found",
    "token not found",
    "invalid lease",
    "permission denied",
    "bad token",
];

/// Map a Vault error response onto the renewal error taxonomy.
///
/// Anything not recognised as terminal is treated as transient, so an
/// unexpected answer costs a retry rather than the lease.
pub fn classify_response_error(status: u16, messages: &[String]) -> VaultError {
    let joined = messages.join("; ");
    let lower = joined.to_lowercase();

    if NOT_RENEWABLE.iter().any(|m| lower.contains(m)) {
        return VaultError::NotRenewable(joined);
    }
    if NOT_FOUND.iter().any(|m| lower.contains(m)) {
        return VaultError::LeaseNotFound(joined);
    }
    if joined.is_empty() {
        VaultError::Connection(format!("vault returned status {status}"))
    } else {
        VaultError::Connection(format!("vault returned status {status}: {joined}"))
    }
}
