//! Shared types for the wanguard controllers.
//!
//! This crate contains:
//! - **Configuration** — typed config objects with invariant validation
//! - **EWMA** — guarded exponential smoothing used by every control loop
//! - **Identifiers** — validated queue names and rule comments that are
//!   safe to pass verbatim to the router transport

pub mod config;
pub mod ewma;
pub mod names;
