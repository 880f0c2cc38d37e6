//! Vault renewer: tracks tokens and leases and keeps them alive.
//!
//! One background task owns all timing. It sleeps until the earliest
//! deadline in the [`RenewalHeap`], renews that entry through the
//! [`RenewalBackend`], and either reschedules it, retries it after the
//! connection backoff, or drops it and reports the terminal error on the
//! caller's channel. Callers register and cancel concurrently; all of them
//! share one mutex over the heap, which is never held across an `.await`.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::backend::{RenewalBackend, RenewedLease};
use crate::config::{RenewalPolicy, VaultConfig};
use crate::error::{VaultError, VaultResult};
use crate::heap::RenewalHeap;
use crate::http::VaultHttpClient;
use crate::request::{LeaseKind, RenewalErrors, RenewalRequest};

/// Callback invoked for every renewal event.
///
/// Runs inline on the renewal task, so it should return quickly.
pub type RenewalCallback = Arc<dyn Fn(&RenewalEvent) + Send + Sync>;

/// Something the renewer did with a lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenewalEvent {
    /// A renewal request is about to be sent.
    Attempt { id: String, kind: LeaseKind },
    /// Vault extended the lease; the next attempt is `next_in` from now.
    Renewed {
        id: String,
        lease_duration: Duration,
        next_in: Duration,
    },
    /// A transient failure; the lease stays tracked.
    Retrying {
        id: String,
        error: VaultError,
        retry_in: Duration,
    },
    /// A terminal failure; the lease is no longer tracked.
    Failed { id: String, error: VaultError },
}

/// Lifecycle of the renewal loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewerState {
    NotStarted,
    Running,
    Stopping,
    Stopped,
}

/// Heap plus lifecycle state, guarded together so that registration can
/// never race with shutdown draining the heap.
struct Tracked {
    heap: RenewalHeap,
    state: RenewerState,
    generation: u64,
}

struct Shared {
    enabled: bool,
    policy: RenewalPolicy,
    backend: Arc<dyn RenewalBackend>,
    tracked: Mutex<Tracked>,
    /// Signalled when a registration may have moved the earliest deadline.
    wake: Notify,
    callback: Option<RenewalCallback>,
}

/// Handle to the spawned renewal task.
struct RenewalLoop {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Keeps Vault tokens and leases renewed on behalf of workloads.
pub struct VaultRenewer {
    shared: Arc<Shared>,
    /// Serializes `start` and `stop`.
    renewal_loop: tokio::sync::Mutex<Option<RenewalLoop>>,
}

impl VaultRenewer {
    /// Build a renewer from config, talking to Vault over HTTP.
    pub fn from_config(config: &VaultConfig) -> VaultResult<Self> {
        let client = VaultHttpClient::from_config(config)?;
        Self::new(config, Arc::new(client))
    }

    /// Build a renewer from config with an explicit backend.
    pub fn new(config: &VaultConfig, backend: Arc<dyn RenewalBackend>) -> VaultResult<Self> {
        Ok(Self::with_policy(config.enabled, config.policy()?, backend))
    }

    pub fn with_policy(
        enabled: bool,
        policy: RenewalPolicy,
        backend: Arc<dyn RenewalBackend>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                enabled,
                policy,
                backend,
                tracked: Mutex::new(Tracked {
                    heap: RenewalHeap::new(),
                    state: RenewerState::NotStarted,
                    generation: 0,
                }),
                wake: Notify::new(),
                callback: None,
            }),
            renewal_loop: tokio::sync::Mutex::new(None),
        }
    }

    /// Set a callback for renewal events. Must be called before `start`.
    pub fn with_callback(mut self, callback: RenewalCallback) -> Self {
        match Arc::get_mut(&mut self.shared) {
            Some(shared) => shared.callback = Some(callback),
            None => warn!("renewal callback set after start, ignoring"),
        }
        self
    }

    /// Spawn the renewal loop. No-op when disabled or already running.
    pub async fn start(&self) {
        if !self.shared.enabled {
            debug!("vault renewal disabled, not starting");
            return;
        }

        let mut renewal_loop = self.renewal_loop.lock().await;
        if renewal_loop.is_some() {
            return;
        }

        self.shared.lock().state = RenewerState::Running;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shared = self.shared.clone();
        let handle = tokio::spawn(async move {
            run_renewal_loop(shared, shutdown_rx).await;
        });
        *renewal_loop = Some(RenewalLoop {
            shutdown_tx,
            handle,
        });

        info!(
            retry_interval = ?self.shared.policy.connection_retry_interval,
            renewal_fraction = self.shared.policy.renewal_fraction,
            "vault renewal loop started"
        );
    }

    /// Stop the renewal loop and release every tracked lease.
    ///
    /// Waits for an in-flight renewal to finish (up to the stop timeout),
    /// then closes every remaining error channel without sending on it.
    /// Safe to call repeatedly and concurrently.
    pub async fn stop(&self) {
        let mut renewal_loop = self.renewal_loop.lock().await;
        let Some(running) = renewal_loop.take() else {
            return;
        };

        self.shared.lock().state = RenewerState::Stopping;
        let _ = running.shutdown_tx.send(true);
        self.shared.wake.notify_one();

        let mut handle = running.handle;
        let timeout = self.shared.policy.stop_timeout;
        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "vault renewal loop failed"),
            Err(_) => {
                warn!(?timeout, "vault renewal loop did not exit in time, aborting");
                handle.abort();
                let _ = handle.await;
            }
        }

        let released = {
            let mut tracked = self.shared.lock();
            tracked.state = RenewerState::Stopped;
            tracked.heap.drain()
        };
        let count = released.len();
        drop(released);

        info!(released = count, "vault renewal loop stopped");
    }

    /// Start tracking a lease whose first renewal is due at `first_deadline`.
    ///
    /// An `increment` of zero requests the configured task token TTL.
    /// Re-registering a tracked id fails; cancel it first.
    pub fn register(
        &self,
        kind: LeaseKind,
        id: &str,
        increment: u64,
        first_deadline: Instant,
    ) -> VaultResult<RenewalErrors> {
        validate_id(id)?;
        if !self.shared.enabled {
            return Err(VaultError::ClientDisabled);
        }
        let increment = self.shared.policy.increment_secs(increment);

        let (earlier, errors) = {
            let mut tracked = self.shared.lock();
            if tracked.state != RenewerState::Running {
                return Err(VaultError::ClientDisabled);
            }
            if tracked.heap.contains(id) {
                return Err(VaultError::DuplicateId(id.to_string()));
            }

            tracked.generation += 1;
            let (request, errors) = RenewalRequest::new(kind, id, increment, tracked.generation);
            let earlier = tracked
                .heap
                .peek()
                .is_none_or(|(_, deadline)| first_deadline < deadline);
            tracked.heap.push(request, first_deadline)?;
            (earlier, errors)
        };

        if earlier {
            self.shared.wake.notify_one();
        }
        debug!(%id, %kind, increment, "lease tracked for renewal");
        Ok(errors)
    }

    /// Renew a token now and keep it renewed.
    ///
    /// A token Vault refuses to renew is reported here and never tracked.
    /// If Vault is unreachable the token is tracked and retried.
    pub async fn renew_token(&self, token: &str, increment: u64) -> VaultResult<RenewalErrors> {
        self.track_checked(LeaseKind::Token, token, increment).await
    }

    /// Renew a secret lease now and keep it renewed.
    pub async fn renew_lease(&self, lease_id: &str, increment: u64) -> VaultResult<RenewalErrors> {
        self.track_checked(LeaseKind::Lease, lease_id, increment).await
    }

    async fn track_checked(
        &self,
        kind: LeaseKind,
        id: &str,
        increment: u64,
    ) -> VaultResult<RenewalErrors> {
        validate_id(id)?;
        if !self.is_running() {
            return Err(VaultError::ClientDisabled);
        }
        if self.is_tracked(id) {
            return Err(VaultError::DuplicateId(id.to_string()));
        }
        let increment = self.shared.policy.increment_secs(increment);

        self.shared.record(RenewalEvent::Attempt {
            id: id.to_string(),
            kind,
        });
        let outcome = self.shared.backend.renew(kind, id, increment).await;
        let (verdict, event) = self.shared.judge(id, outcome);
        self.shared.record(event);

        match verdict {
            Verdict::Reschedule(first_deadline) => self.register(kind, id, increment, first_deadline),
            Verdict::Untrack(e) => {
                warn!(%id, %kind, error = %e, "vault refused renewal, not tracking");
                Err(e)
            }
        }
    }

    /// Stop renewing a lease. Unknown ids are not an error.
    pub fn cancel(&self, id: &str) -> VaultResult<()> {
        validate_id(id)?;
        let removed = self.shared.lock().heap.remove(id).ok();
        if let Some(request) = removed {
            debug!(%id, kind = %request.kind(), "lease renewal cancelled");
        }
        Ok(())
    }

    pub fn is_tracked(&self, id: &str) -> bool {
        self.shared.lock().heap.contains(id)
    }

    pub fn tracked_count(&self) -> usize {
        self.shared.lock().heap.len()
    }

    /// The lease due soonest and when it is due.
    pub fn next_renewal(&self) -> Option<(String, Instant)> {
        let tracked = self.shared.lock();
        tracked
            .heap
            .peek()
            .map(|(request, deadline)| (request.id().to_string(), deadline))
    }

    pub fn state(&self) -> RenewerState {
        self.shared.lock().state
    }

    pub fn is_running(&self) -> bool {
        self.state() == RenewerState::Running
    }

    pub fn policy(&self) -> &RenewalPolicy {
        &self.shared.policy
    }
}

fn validate_id(id: &str) -> VaultResult<()> {
    if id.is_empty() {
        return Err(VaultError::InvalidInput("lease id must not be empty".to_string()));
    }
    Ok(())
}

/// What a renewal attempt means for the lease.
enum Verdict {
    /// Keep tracking; try again at this deadline.
    Reschedule(Instant),
    /// Stop tracking and hand the error to the lease's owner.
    Untrack(VaultError),
}

/// Upper bound on any computed deadline offset.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// `now + delay`, clamped instead of overflowing `Instant`.
fn deadline_after(delay: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(delay.min(FAR_FUTURE))
        .unwrap_or_else(|| now + Duration::from_secs(86400))
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Tracked> {
        self.tracked.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Log a renewal event and pass it to the callback.
    fn record(&self, event: RenewalEvent) {
        match &event {
            RenewalEvent::Attempt { id, kind } => debug!(%id, %kind, "renewing"),
            RenewalEvent::Renewed {
                id,
                lease_duration,
                next_in,
            } => debug!(%id, ?lease_duration, ?next_in, "lease renewed"),
            RenewalEvent::Retrying {
                id,
                error,
                retry_in,
            } => warn!(%id, error = %error, ?retry_in, "lease renewal failed, will retry"),
            RenewalEvent::Failed { id, error } => {
                warn!(%id, error = %error, "lease renewal failed permanently")
            }
        }
        if let Some(callback) = &self.callback {
            callback(&event);
        }
    }

    /// Decide what a renewal outcome means for the lease.
    ///
    /// Only transient errors are retried. Any other error ends tracking,
    /// including ones a backend raises for its own misconfiguration.
    fn judge(&self, id: &str, outcome: VaultResult<RenewedLease>) -> (Verdict, RenewalEvent) {
        match outcome {
            Ok(renewed) => {
                let next_in = self.policy.renewal_delay(renewed.lease_duration);
                let event = RenewalEvent::Renewed {
                    id: id.to_string(),
                    lease_duration: renewed.lease_duration,
                    next_in,
                };
                (Verdict::Reschedule(deadline_after(next_in)), event)
            }
            Err(error) if error.is_transient() => {
                let retry_in = self.policy.connection_retry_interval;
                let event = RenewalEvent::Retrying {
                    id: id.to_string(),
                    error,
                    retry_in,
                };
                (Verdict::Reschedule(deadline_after(retry_in)), event)
            }
            Err(error) => {
                let event = RenewalEvent::Failed {
                    id: id.to_string(),
                    error: error.clone(),
                };
                (Verdict::Untrack(error), event)
            }
        }
    }

    /// Renew the earliest lease if it is due.
    async fn renew_due(&self) {
        let due = {
            let tracked = self.lock();
            match tracked.heap.peek() {
                Some((request, deadline)) if deadline <= Instant::now() => (
                    request.id().to_string(),
                    request.kind(),
                    request.increment(),
                    request.generation(),
                ),
                _ => return,
            }
        };
        let (id, kind, increment, generation) = due;

        self.record(RenewalEvent::Attempt {
            id: id.clone(),
            kind,
        });
        let outcome = self.backend.renew(kind, &id, increment).await;
        let (verdict, event) = self.judge(&id, outcome);

        let mut tracked = self.lock();
        // Cancelled, or cancelled and registered again, while in flight.
        if tracked.heap.get(&id).map(|(r, _)| r.generation()) != Some(generation) {
            debug!(%id, "lease untracked during renewal, discarding result");
            return;
        }

        let failed = match verdict {
            Verdict::Reschedule(deadline) => {
                // Present: the generation check above ran under this lock.
                let updated = tracked.heap.update(&id, deadline);
                debug_assert!(updated.is_ok());
                None
            }
            Verdict::Untrack(error) => tracked.heap.remove(&id).ok().map(|request| (request, error)),
        };
        drop(tracked);

        self.record(event);
        if let Some((request, error)) = failed {
            if !request.fail(error) {
                debug!(%id, "no receiver for renewal error");
            }
        }
    }
}

/// The renewal loop. Exits when shutdown is signalled or its sender drops.
async fn run_renewal_loop(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    debug!("renewal loop running");

    loop {
        if *shutdown.borrow() {
            break;
        }

        let next_deadline = shared.lock().heap.peek().map(|(_, deadline)| deadline);

        match next_deadline {
            None => {
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => break,
                    _ = shared.wake.notified() => continue,
                }
            }
            Some(deadline) => {
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => break,
                    _ = shared.wake.notified() => continue,
                    _ = tokio::time::sleep_until(deadline) => shared.renew_due().await,
                }
            }
        }
    }

    debug!("renewal loop shutting down");
}
