//! Renewal requests tracked by the renewer.

use std::fmt;

use tokio::sync::oneshot;

use crate::error::VaultError;

/// How a tracked credential is renewed against Vault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LeaseKind {
    /// A Vault token, renewed as itself (`renew-self`).
    Token,
    /// A secret lease, renewed by lease ID with the agent's token.
    Lease,
}

impl fmt::Display for LeaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Token => f.write_str("token"),
            Self::Lease => f.write_str("lease"),
        }
    }
}

/// Receiving half of a lease's error channel.
///
/// Resolves with `Ok(err)` when renewal failed terminally, or with
/// `Err(RecvError)` once tracking ended for any other reason (cancel, stop).
pub type RenewalErrors = oneshot::Receiver<VaultError>;

/// One tracked lease.
///
/// Owns the sending half of the caller's error channel. Dropping the request
/// closes the channel, so a request leaving tracking without a terminal
/// error is observed by the caller as a closed channel.
pub struct RenewalRequest {
    id: String,
    kind: LeaseKind,
    /// Requested increment in seconds.
    increment: u64,
    /// Registration number, distinguishes re-registrations of the same id.
    generation: u64,
    errors: Option<oneshot::Sender<VaultError>>,
}

impl RenewalRequest {
    /// Create a request and the receiver the caller listens on.
    pub fn new(
        kind: LeaseKind,
        id: impl Into<String>,
        increment: u64,
        generation: u64,
    ) -> (Self, RenewalErrors) {
        let (tx, rx) = oneshot::channel();
        let request = Self {
            id: id.into(),
            kind,
            increment,
            generation,
            errors: Some(tx),
        };
        (request, rx)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> LeaseKind {
        self.kind
    }

    pub fn increment(&self) -> u64 {
        self.increment
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Deliver a terminal error and close the channel.
    ///
    /// Never blocks. Returns `false` if the caller already dropped its
    /// receiver.
    pub fn fail(mut self, error: VaultError) -> bool {
        match self.errors.take() {
            Some(tx) => tx.send(error).is_ok(),
            None => false,
        }
    }
}

impl fmt::Debug for RenewalRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenewalRequest")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("increment", &self.increment)
            .field("generation", &self.generation)
            .finish()
    }
}
