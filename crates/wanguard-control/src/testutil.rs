//! In-memory router backend for controller tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use chrono::Utc;
use wanguard_common::names::{QueueName, RuleComment};
use wanguard_router::{QueueStats, RouterBackend, RouterError, RuleStatus};

/// Scriptable backend. Everything is interior-mutable so tests can steer
/// behavior between cycles while the controller holds a shared reference.
pub struct MockRouter {
    /// Per-host ping samples; hosts without an entry fall back to
    /// `ping_default`, and an empty default means the ping errors.
    ping_by_host: Mutex<HashMap<String, Vec<f64>>>,
    ping_default: Mutex<Option<Vec<f64>>>,
    pub ping_calls: AtomicU32,

    /// Recorded `set_queue_rates` calls.
    rate_calls: Mutex<Vec<(String, u64, u64)>>,
    pub fail_set_rates: AtomicBool,

    stats: Mutex<Option<QueueStats>>,
    pub fail_stats: AtomicBool,

    pub rule_exists: AtomicBool,
    rule_enabled: AtomicBool,
    pub fail_toggle: AtomicBool,
    /// When set, `rule_status` reports the opposite of the actual flag,
    /// simulating a router that accepted the toggle but did not apply it.
    pub misreport_status: AtomicBool,
    pub toggle_calls: AtomicU32,
}

impl MockRouter {
    pub fn new() -> Self {
        MockRouter {
            ping_by_host: Mutex::new(HashMap::new()),
            ping_default: Mutex::new(None),
            ping_calls: AtomicU32::new(0),
            rate_calls: Mutex::new(Vec::new()),
            fail_set_rates: AtomicBool::new(false),
            stats: Mutex::new(None),
            fail_stats: AtomicBool::new(false),
            rule_exists: AtomicBool::new(true),
            rule_enabled: AtomicBool::new(false),
            fail_toggle: AtomicBool::new(false),
            misreport_status: AtomicBool::new(false),
            toggle_calls: AtomicU32::new(0),
        }
    }

    /// All pings (any host) return `rtt` three times.
    pub fn set_ping(&self, rtt: f64) {
        *self.ping_default.lock().unwrap() = Some(vec![rtt, rtt, rtt]);
    }

    pub fn set_ping_samples(&self, host: &str, samples: Vec<f64>) {
        self.ping_by_host
            .lock()
            .unwrap()
            .insert(host.to_string(), samples);
    }

    pub fn clear_ping(&self) {
        *self.ping_default.lock().unwrap() = None;
        self.ping_by_host.lock().unwrap().clear();
    }

    pub fn set_stats(&self, dropped: u64, queued_packets: u64) {
        *self.stats.lock().unwrap() = Some(QueueStats {
            packets: 1_000_000,
            bytes: 800_000_000,
            dropped,
            queued_packets,
            queued_bytes: queued_packets * 1400,
            timestamp: Utc::now(),
        });
    }

    pub fn rate_calls(&self) -> Vec<(String, u64, u64)> {
        self.rate_calls.lock().unwrap().clone()
    }

    pub fn write_count(&self) -> usize {
        self.rate_calls.lock().unwrap().len()
    }

    pub fn last_rates(&self) -> Option<(u64, u64)> {
        self.rate_calls
            .lock()
            .unwrap()
            .last()
            .map(|(_, d, u)| (*d, *u))
    }

    pub fn rule_enabled(&self) -> bool {
        self.rule_enabled.load(Ordering::Relaxed)
    }

    pub fn set_rule_enabled(&self, enabled: bool) {
        self.rule_enabled.store(enabled, Ordering::Relaxed);
    }
}

impl RouterBackend for MockRouter {
    async fn get_queue_stats(&self, queue: &QueueName) -> Result<QueueStats, RouterError> {
        if self.fail_stats.load(Ordering::Relaxed) {
            return Err(RouterError::Connection("stats unavailable".into()));
        }
        self.stats
            .lock()
            .unwrap()
            .ok_or_else(|| RouterError::NotFound(queue.as_str().to_string()))
    }

    async fn set_queue_rates(
        &self,
        queue: &QueueName,
        download_bps: u64,
        upload_bps: u64,
    ) -> Result<(), RouterError> {
        if self.fail_set_rates.load(Ordering::Relaxed) {
            return Err(RouterError::Server("write failed".into()));
        }
        self.rate_calls
            .lock()
            .unwrap()
            .push((queue.as_str().to_string(), download_bps, upload_bps));
        Ok(())
    }

    async fn rule_status(&self, _comment: &RuleComment) -> Result<RuleStatus, RouterError> {
        let actual = self.rule_enabled.load(Ordering::Relaxed);
        let reported = if self.misreport_status.load(Ordering::Relaxed) {
            !actual
        } else {
            actual
        };
        Ok(RuleStatus {
            exists: self.rule_exists.load(Ordering::Relaxed),
            enabled: reported,
        })
    }

    async fn enable_rule(&self, _comment: &RuleComment) -> Result<(), RouterError> {
        self.toggle_calls.fetch_add(1, Ordering::Relaxed);
        if self.fail_toggle.load(Ordering::Relaxed) {
            return Err(RouterError::Rejected("toggle refused".into()));
        }
        self.rule_enabled.store(true, Ordering::Relaxed);
        Ok(())
    }

    async fn disable_rule(&self, _comment: &RuleComment) -> Result<(), RouterError> {
        self.toggle_calls.fetch_add(1, Ordering::Relaxed);
        if self.fail_toggle.load(Ordering::Relaxed) {
            return Err(RouterError::Rejected("toggle refused".into()));
        }
        self.rule_enabled.store(false, Ordering::Relaxed);
        Ok(())
    }

    async fn ping(
        &self,
        host: &str,
        _count: u32,
        per_probe_timeout: Duration,
    ) -> Result<Vec<f64>, RouterError> {
        self.ping_calls.fetch_add(1, Ordering::Relaxed);
        if let Some(samples) = self.ping_by_host.lock().unwrap().get(host) {
            return Ok(samples.clone());
        }
        match &*self.ping_default.lock().unwrap() {
            Some(samples) => Ok(samples.clone()),
            None => Err(RouterError::Timeout(per_probe_timeout)),
        }
    }
}
