//! Access-control sync engine for the cidc data portal.
//!
//! The permission ledger ([`cidc_storage::Ledger`]) is authoritative. This crate projects it
//! onto read grants in the data bucket ([`cidc_acl::BucketAcl`]) and keeps the two eventually
//! consistent:
//!
//! - [`GrantEngine`] applies single grants and revokes and converges whole users.
//! - [`RoleTransitionHandler`] turns account lifecycle events into permission deltas.
//! - [`ListingService`] answers "what can this user see" from the ledger alone.
//! - [`Reconciler`] expires rows and retries whatever the store has not accepted yet.
//!
//! [`AccessService`] wires them together behind per-user locks that also hold across
//! processes sharing one ledger.

mod audit;
mod clock;
mod config;
mod engine;
mod error;
mod listing;
mod locks;
pub mod metrics;
mod paths;
mod reconcile;
mod roles;
mod service;
mod transitions;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    AccessConfig, DEFAULT_INACTIVE_USER_DAYS, DEFAULT_PENDING_BATCH_LIMIT, DEFAULT_USER_LEASE,
};
pub use engine::{Convergence, GrantEngine};
pub use error::AccessError;
pub use listing::ListingService;
pub use locks::{UserGuard, UserLocks};
pub use paths::{prefixes_for_key, principal_for};
pub use reconcile::{ReconcileMode, ReconcileReport, Reconciler};
pub use roles::{RoleEntry, RolePolicy};
pub use service::{
    AccessService, AccessServiceBuilder, GrantOutcome, GrantRequest, RegisterOutcome,
    RevokeOutcome,
};
pub use transitions::{RoleTransitionHandler, TransitionOutcome};
