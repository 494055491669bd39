//! Control loops for wanguard.
//!
//! - **autorate** — the per-WAN shaper rate controller (GREEN / YELLOW /
//!   SOFT_RED / RED state machine)
//! - **steering** — the primary-WAN watcher that toggles a routing-mark
//!   rule when latency-sensitive traffic should move to the alternate link
//! - the shared plumbing both loops stand on: fixed-cadence clock, RTT
//!   probe, atomic state store, PID lock, write rate limiter, and the
//!   observability hook record

use thiserror::Error;

/// Startup-time controller failure. Once a controller is running, errors are
/// absorbed into degraded behavior instead of propagating.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("configuration rejected: {0}")]
    Config(#[from] wanguard_common::config::ConfigError),
    #[error(transparent)]
    Store(#[from] store::StoreError),
    #[error(transparent)]
    Lock(#[from] lockfile::LockError),
}

pub mod assessor;
pub mod autorate;
pub mod clock;
pub mod lockfile;
pub mod observe;
pub mod probe;
pub mod ratelimit;
pub mod state;
pub mod steering;
pub mod store;

#[cfg(test)]
pub(crate) mod testutil;
