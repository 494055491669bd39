//! Failover composite.
//!
//! Wraps a primary backend (REST) and an optional fallback (SSH) behind the
//! same [`RouterBackend`] interface, adding the retry schedule from
//! [`RetryPolicy`]. Transient errors are retried in place with backoff and
//! jitter; a non-transient primary failure latches the wrapper onto the
//! fallback for the remainder of the cycle. `begin_cycle` releases the latch
//! so the primary gets another chance on the next tick.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use wanguard_common::names::{QueueName, RuleComment};

use crate::backend::{QueueStats, RouterBackend, RuleStatus};
use crate::error::RouterError;
use crate::retry::RetryPolicy;

pub struct Failover<P, F> {
    primary: P,
    fallback: Option<F>,
    on_fallback: AtomicBool,
    policy: RetryPolicy,
}

impl<P: RouterBackend, F: RouterBackend> Failover<P, F> {
    pub fn new(primary: P, fallback: F, policy: RetryPolicy) -> Self {
        Failover {
            primary,
            fallback: Some(fallback),
            on_fallback: AtomicBool::new(false),
            policy,
        }
    }

    /// A wrapper with no fallback: retry/backoff only.
    pub fn single(primary: P, policy: RetryPolicy) -> Self {
        Failover {
            primary,
            fallback: None,
            on_fallback: AtomicBool::new(false),
            policy,
        }
    }

    /// Whether the current cycle is being served by the fallback transport.
    pub fn is_on_fallback(&self) -> bool {
        self.on_fallback.load(Ordering::Relaxed)
    }
}

/// Shared call skeleton: retry transients with backoff, latch onto the
/// fallback on a permanent primary failure, give the fallback the same
/// retry budget.
macro_rules! dispatch {
    ($self:ident, $method:ident ( $($arg:expr),* )) => {{
        let mut attempt: u32 = 1;
        loop {
            let on_fallback = $self.on_fallback.load(Ordering::Relaxed);
            let result = match (&$self.fallback, on_fallback) {
                (Some(fb), true) => {
                    tokio::time::timeout($self.policy.call_deadline, fb.$method($($arg),*))
                        .await
                        .unwrap_or(Err(RouterError::Timeout($self.policy.call_deadline)))
                }
                _ => {
                    tokio::time::timeout($self.policy.call_deadline, $self.primary.$method($($arg),*))
                        .await
                        .unwrap_or(Err(RouterError::Timeout($self.policy.call_deadline)))
                }
            };
            match result {
                Ok(value) => break Ok(value),
                Err(e) if e.is_retryable() && attempt < $self.policy.max_attempts => {
                    tracing::debug!(
                        op = stringify!($method),
                        attempt,
                        error = %e,
                        "transient router error, backing off"
                    );
                    tokio::time::sleep($self.policy.delay_for(attempt)).await;
                    attempt += 1;
                }
                Err(e) if !e.is_retryable() && !on_fallback && $self.fallback.is_some() => {
                    tracing::warn!(
                        op = stringify!($method),
                        error = %e,
                        "primary transport failed, switching to fallback for this cycle"
                    );
                    $self.on_fallback.store(true, Ordering::Relaxed);
                    attempt = 1;
                }
                Err(e) => break Err(e),
            }
        }
    }};
}

impl<P: RouterBackend, F: RouterBackend> RouterBackend for Failover<P, F> {
    async fn get_queue_stats(&self, queue: &QueueName) -> Result<QueueStats, RouterError> {
        dispatch!(self, get_queue_stats(queue))
    }

    async fn set_queue_rates(
        &self,
        queue: &QueueName,
        download_bps: u64,
        upload_bps: u64,
    ) -> Result<(), RouterError> {
        dispatch!(self, set_queue_rates(queue, download_bps, upload_bps))
    }

    async fn rule_status(&self, comment: &RuleComment) -> Result<RuleStatus, RouterError> {
        dispatch!(self, rule_status(comment))
    }

    async fn enable_rule(&self, comment: &RuleComment) -> Result<(), RouterError> {
        dispatch!(self, enable_rule(comment))
    }

    async fn disable_rule(&self, comment: &RuleComment) -> Result<(), RouterError> {
        dispatch!(self, disable_rule(comment))
    }

    async fn ping(
        &self,
        host: &str,
        count: u32,
        per_probe_timeout: Duration,
    ) -> Result<Vec<f64>, RouterError> {
        dispatch!(self, ping(host, count, per_probe_timeout))
    }

    fn begin_cycle(&self) {
        if self.on_fallback.swap(false, Ordering::Relaxed) {
            tracing::debug!("retrying primary transport this cycle");
        }
    }

    async fn close(&self) {
        self.primary.close().await;
        if let Some(fallback) = &self.fallback {
            fallback.close().await;
        }
    }
}
