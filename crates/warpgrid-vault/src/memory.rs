//! In-memory Vault stand-in.
//!
//! Holds tokens and leases in a map and answers renewals the way Vault does:
//! unknown ids are "lease not found", leases issued as non-renewable are
//! rejected, everything else is granted up to its TTL. Transient failures
//! can be injected to exercise the retry path. Used by tests and for running
//! the agent without a Vault server.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::backend::{RenewalBackend, RenewedLease};
use crate::error::{VaultError, VaultResult};
use crate::request::LeaseKind;

#[derive(Debug, Clone)]
struct StoredLease {
    ttl: Duration,
    renewable: bool,
    renewals: u32,
}

#[derive(Debug, Default)]
struct VaultState {
    leases: HashMap<String, StoredLease>,
    /// Renewals still to fail with a connection error.
    failures_pending: u32,
    /// Every renewal attempt, including failed ones, in order.
    attempts: Vec<String>,
}

/// Thread-safe in-memory implementation of [`RenewalBackend`].
#[derive(Debug, Default)]
pub struct InMemoryVault {
    state: Mutex<VaultState>,
    next_id: AtomicU64,
}

impl InMemoryVault {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue a new token and return its id.
    pub fn create_token(&self, ttl: Duration, renewable: bool) -> String {
        let id = format!("s.{:08}", self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.insert(&id, ttl, renewable);
        id
    }

    /// Register a token or lease under a caller-chosen id.
    pub fn insert(&self, id: &str, ttl: Duration, renewable: bool) {
        let mut state = self.state.lock().unwrap();
        state.leases.insert(
            id.to_string(),
            StoredLease {
                ttl,
                renewable,
                renewals: 0,
            },
        );
    }

    /// Revoke a token or lease; later renewals report it as not found.
    pub fn revoke(&self, id: &str) -> bool {
        self.state.lock().unwrap().leases.remove(id).is_some()
    }

    /// Fail the next `count` renewals with a connection error.
    pub fn fail_next(&self, count: u32) {
        self.state.lock().unwrap().failures_pending = count;
    }

    /// Successful renewals of `id`.
    pub fn renewals(&self, id: &str) -> u32 {
        let state = self.state.lock().unwrap();
        state.leases.get(id).map(|l| l.renewals).unwrap_or(0)
    }

    /// Renewal attempts of `id`, successful or not.
    pub fn attempts(&self, id: &str) -> usize {
        let state = self.state.lock().unwrap();
        state.attempts.iter().filter(|a| a.as_str() == id).count()
    }

    /// All renewal attempts in the order they arrived.
    pub fn attempt_log(&self) -> Vec<String> {
        self.state.lock().unwrap().attempts.clone()
    }
}

#[async_trait]
impl RenewalBackend for InMemoryVault {
    async fn renew(&self, _kind: LeaseKind, id: &str, increment: u64) -> VaultResult<RenewedLease> {
        let mut state = self.state.lock().unwrap();
        state.attempts.push(id.to_string());

        if state.failures_pending > 0 {
            state.failures_pending -= 1;
            return Err(VaultError::Connection("connection refused".to_string()));
        }

        let lease = state
            .leases
            .get_mut(id)
            .ok_or_else(|| VaultError::LeaseNotFound("lease not found".to_string()))?;
        if !lease.renewable {
            return Err(VaultError::NotRenewable("lease is not renewable".to_string()));
        }

        lease.renewals += 1;
        let granted = if increment == 0 {
            lease.ttl
        } else {
            Duration::from_secs(increment).min(lease.ttl)
        };
        Ok(RenewedLease {
            lease_duration: granted,
            renewable: true,
        })
    }
}
