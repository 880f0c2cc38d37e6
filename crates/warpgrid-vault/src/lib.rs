//! warpgrid-vault: automatic Vault token and lease renewal for WarpGrid.
//!
//! Workloads receive Vault tokens and dynamic-secret leases that expire
//! unless renewed. The [`VaultRenewer`] tracks them, renews each one before
//! it runs out, and tells the owner on a one-shot channel when Vault refuses
//! a renewal for good.
//!
//! # Architecture
//!
//! ```text
//! VaultRenewer
//!   ├── register / renew_token / renew_lease / cancel
//!   ├── Mutex<RenewalHeap> (deadline-ordered, indexed by lease id)
//!   ├── Background renewal loop
//!   │   ├── sleep until earliest deadline, or wake on earlier registration
//!   │   ├── RenewalBackend::renew() → RenewedLease | VaultError
//!   │   ├── success   → reschedule at renewal_fraction of the grant
//!   │   ├── transient → reschedule after connection_retry_interval
//!   │   └── terminal  → untrack, send error on the lease's channel
//!   └── Optional RenewalCallback for event observers
//! ```
//!
//! # Backends
//!
//! [`VaultHttpClient`] speaks Vault's HTTP API. [`InMemoryVault`] answers
//! the same way from a local map and can inject outages.

pub mod backend;
pub mod config;
pub mod error;
pub mod heap;
pub mod http;
pub mod memory;
pub mod renewer;
pub mod request;

pub use backend::{RenewalBackend, RenewedLease, classify_response_error};
pub use config::{RenewalPolicy, VaultConfig};
pub use error::{VaultError, VaultResult};
pub use heap::RenewalHeap;
pub use http::VaultHttpClient;
pub use memory::InMemoryVault;
pub use renewer::{RenewalCallback, RenewalEvent, RenewerState, VaultRenewer};
pub use request::{LeaseKind, RenewalErrors, RenewalRequest};
