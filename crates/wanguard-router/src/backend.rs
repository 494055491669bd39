//! The router backend contract.
//!
//! Both controllers talk to the router exclusively through this trait, which
//! keeps them testable against an in-memory mock and keeps the REST/SSH
//! split an implementation detail. Methods take `&self`: implementations use
//! interior mutability for their id caches so the median-of-three probe can
//! issue concurrent pings over one shared backend.

use std::time::Duration;

use chrono::{DateTime, Utc};

use wanguard_common::names::{QueueName, RuleComment};

use crate::error::RouterError;

/// One sample of a shaper queue's counters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QueueStats {
    pub packets: u64,
    pub bytes: u64,
    /// Cumulative drop counter. Monotonic except across router restarts;
    /// consumers must treat a decrease as a reset.
    pub dropped: u64,
    pub queued_packets: u64,
    pub queued_bytes: u64,
    pub timestamp: DateTime<Utc>,
}

/// Observed status of a mangle rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuleStatus {
    pub exists: bool,
    pub enabled: bool,
}

#[allow(async_fn_in_trait)]
pub trait RouterBackend {
    async fn get_queue_stats(&self, queue: &QueueName) -> Result<QueueStats, RouterError>;

    /// Set the shaper's download/upload rate pair on a named queue.
    /// Idempotent; callers are responsible for suppressing unchanged writes.
    async fn set_queue_rates(
        &self,
        queue: &QueueName,
        download_bps: u64,
        upload_bps: u64,
    ) -> Result<(), RouterError>;

    async fn rule_status(&self, comment: &RuleComment) -> Result<RuleStatus, RouterError>;

    async fn enable_rule(&self, comment: &RuleComment) -> Result<(), RouterError>;

    async fn disable_rule(&self, comment: &RuleComment) -> Result<(), RouterError>;

    /// Ping `host` from the router, returning one RTT per received reply.
    async fn ping(
        &self,
        host: &str,
        count: u32,
        per_probe_timeout: Duration,
    ) -> Result<Vec<f64>, RouterError>;

    /// Called once at the top of every controller cycle. Backends that latch
    /// state across calls (the failover wrapper) reset here.
    fn begin_cycle(&self) {}

    /// Tear down any persistent connection. Called once at shutdown.
    async fn close(&self) {}
}

/// A shared backend is still a backend; the probe fans out over one.
impl<T: RouterBackend> RouterBackend for std::sync::Arc<T> {
    async fn get_queue_stats(&self, queue: &QueueName) -> Result<QueueStats, RouterError> {
        T::get_queue_stats(self, queue).await
    }

    async fn set_queue_rates(
        &self,
        queue: &QueueName,
        download_bps: u64,
        upload_bps: u64,
    ) -> Result<(), RouterError> {
        T::set_queue_rates(self, queue, download_bps, upload_bps).await
    }

    async fn rule_status(&self, comment: &RuleComment) -> Result<RuleStatus, RouterError> {
        T::rule_status(self, comment).await
    }

    async fn enable_rule(&self, comment: &RuleComment) -> Result<(), RouterError> {
        T::enable_rule(self, comment).await
    }

    async fn disable_rule(&self, comment: &RuleComment) -> Result<(), RouterError> {
        T::disable_rule(self, comment).await
    }

    async fn ping(
        &self,
        host: &str,
        count: u32,
        per_probe_timeout: Duration,
    ) -> Result<Vec<f64>, RouterError> {
        T::ping(self, host, count, per_probe_timeout).await
    }

    fn begin_cycle(&self) {
        T::begin_cycle(self)
    }

    async fn close(&self) {
        T::close(self).await
    }
}
