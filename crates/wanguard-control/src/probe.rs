//! RTT probing.
//!
//! Wraps the transport's `ping` operation into the two aggregation
//! strategies, enforces per-probe timeouts so a stuck probe can never stall
//! the control loop, and keeps the consecutive-failure counter that arms the
//! TCP-connect fallback for ICMP-hostile paths.

use std::time::Duration;

use wanguard_common::config::{ProbeConfig, ProbeStrategy, TcpFallbackConfig};
use wanguard_router::RouterBackend;

/// Samples per host; the per-host RTT is the minimum of these.
const SAMPLES_PER_HOST: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProbeOutcome {
    Rtt(f64),
    Unavailable,
}

pub struct RttProbe {
    hosts: Vec<String>,
    strategy: ProbeStrategy,
    timeout: Duration,
    tcp_fallback: Option<TcpFallbackConfig>,
    consecutive_unavailable: u32,
}

impl RttProbe {
    pub fn from_config(cfg: &ProbeConfig) -> Self {
        RttProbe {
            hosts: cfg.hosts.clone(),
            strategy: cfg.strategy,
            timeout: Duration::from_millis(cfg.timeout_ms),
            tcp_fallback: cfg.tcp_fallback.clone(),
            consecutive_unavailable: 0,
        }
    }

    /// A single-host variant regardless of configured strategy, used where a
    /// cheap signal beats a robust aggregate.
    pub fn lightweight(cfg: &ProbeConfig) -> Self {
        let mut probe = Self::from_config(cfg);
        probe.strategy = ProbeStrategy::Single;
        probe
    }

    /// ICMP cycles the probe has failed in a row.
    pub fn consecutive_unavailable(&self) -> u32 {
        self.consecutive_unavailable
    }

    /// Run one measurement. Never takes longer than twice the per-probe
    /// timeout; probes still in flight at that point are dropped, not
    /// awaited.
    pub async fn measure<B: RouterBackend>(&mut self, backend: &B) -> ProbeOutcome {
        let icmp = match self.strategy {
            ProbeStrategy::Single => self.probe_host(backend, &self.hosts[0]).await,
            ProbeStrategy::MedianOfThree => self.median_of_three(backend).await,
        };

        match icmp {
            Some(rtt) => {
                self.consecutive_unavailable = 0;
                ProbeOutcome::Rtt(rtt)
            }
            None => {
                self.consecutive_unavailable = self.consecutive_unavailable.saturating_add(1);
                if let Some(fallback) = &self.tcp_fallback {
                    if self.consecutive_unavailable >= fallback.after_failures {
                        if let Some(rtt) = self.tcp_connect_rtt(fallback.port).await {
                            tracing::debug!(rtt_ms = rtt, "tcp-connect fallback RTT");
                            return ProbeOutcome::Rtt(rtt);
                        }
                    }
                }
                ProbeOutcome::Unavailable
            }
        }
    }

    /// Minimum RTT across `SAMPLES_PER_HOST` echoes to one host.
    async fn probe_host<B: RouterBackend>(&self, backend: &B, host: &str) -> Option<f64> {
        let attempt = backend.ping(host, SAMPLES_PER_HOST, self.timeout);
        match tokio::time::timeout(self.timeout * 2, attempt).await {
            Ok(Ok(samples)) => samples.into_iter().filter(|r| r.is_finite()).fold(
                None,
                |best: Option<f64>, r| match best {
                    Some(b) if b <= r => Some(b),
                    _ => Some(r),
                },
            ),
            Ok(Err(e)) => {
                tracing::debug!(host, error = %e, "probe failed");
                None
            }
            Err(_) => {
                tracing::debug!(host, "probe timed out");
                None
            }
        }
    }

    /// Three concurrent probes to three hosts, aggregated by the median of
    /// the per-host minima. Each probe carries its own timeout, so the join
    /// is bounded without an extra deadline.
    async fn median_of_three<B: RouterBackend>(&self, backend: &B) -> Option<f64> {
        let probes = self
            .hosts
            .iter()
            .take(3)
            .map(|host| self.probe_host(backend, host));
        let minima: Vec<f64> = futures::future::join_all(probes)
            .await
            .into_iter()
            .flatten()
            .collect();
        median(minima)
    }

    /// First-success TCP handshake time across the configured hosts.
    async fn tcp_connect_rtt(&self, port: u16) -> Option<f64> {
        for host in &self.hosts {
            let start = tokio::time::Instant::now();
            let connect = tokio::net::TcpStream::connect((host.as_str(), port));
            if let Ok(Ok(_stream)) = tokio::time::timeout(self.timeout, connect).await {
                return Some(start.elapsed().as_secs_f64() * 1000.0);
            }
        }
        None
    }
}

fn median(mut values: Vec<f64>) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    if values.len() % 2 == 1 {
        Some(values[mid])
    } else {
        Some((values[mid - 1] + values[mid]) / 2.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MockRouter;
    use wanguard_common::config::ProbeConfig;

    fn config(hosts: &[&str], strategy: ProbeStrategy) -> ProbeConfig {
        ProbeConfig {
            hosts: hosts.iter().map(|s| s.to_string()).collect(),
            strategy,
            timeout_ms: 500,
            tcp_fallback: None,
        }
    }

    // ─── Single Strategy ────────────────────────────────────────────────

    #[tokio::test]
    async fn single_returns_minimum_sample() {
        let router = MockRouter::new();
        router.set_ping_samples("1.1.1.1", vec![12.0, 9.5, 15.0]);
        let mut probe = RttProbe::from_config(&config(&["1.1.1.1"], ProbeStrategy::Single));
        assert_eq!(probe.measure(&router).await, ProbeOutcome::Rtt(9.5));
    }

    #[tokio::test]
    async fn single_failure_is_unavailable() {
        let router = MockRouter::new(); // no ping data → error
        let mut probe = RttProbe::from_config(&config(&["1.1.1.1"], ProbeStrategy::Single));
        assert_eq!(probe.measure(&router).await, ProbeOutcome::Unavailable);
        assert_eq!(probe.consecutive_unavailable(), 1);
    }

    // ─── Median of Three ────────────────────────────────────────────────

    #[tokio::test]
    async fn median_of_three_takes_middle_minimum() {
        let router = MockRouter::new();
        router.set_ping_samples("a", vec![10.0, 11.0, 12.0]);
        router.set_ping_samples("b", vec![30.0, 31.0, 32.0]);
        router.set_ping_samples("c", vec![20.0, 21.0, 22.0]);
        let mut probe =
            RttProbe::from_config(&config(&["a", "b", "c"], ProbeStrategy::MedianOfThree));
        assert_eq!(probe.measure(&router).await, ProbeOutcome::Rtt(20.0));
    }

    #[tokio::test]
    async fn median_tolerates_one_failed_host() {
        let router = MockRouter::new();
        router.set_ping_samples("a", vec![10.0]);
        router.set_ping_samples("c", vec![20.0]);
        // "b" has no data → its probe fails.
        let mut probe =
            RttProbe::from_config(&config(&["a", "b", "c"], ProbeStrategy::MedianOfThree));
        assert_eq!(probe.measure(&router).await, ProbeOutcome::Rtt(15.0));
    }

    #[tokio::test]
    async fn median_all_failed_is_unavailable() {
        let router = MockRouter::new();
        let mut probe =
            RttProbe::from_config(&config(&["a", "b", "c"], ProbeStrategy::MedianOfThree));
        assert_eq!(probe.measure(&router).await, ProbeOutcome::Unavailable);
    }

    // ─── Failure Counter ────────────────────────────────────────────────

    #[tokio::test]
    async fn success_resets_failure_counter() {
        let router = MockRouter::new();
        let mut probe = RttProbe::from_config(&config(&["1.1.1.1"], ProbeStrategy::Single));
        probe.measure(&router).await;
        probe.measure(&router).await;
        assert_eq!(probe.consecutive_unavailable(), 2);

        router.set_ping_samples("1.1.1.1", vec![12.0]);
        assert_eq!(probe.measure(&router).await, ProbeOutcome::Rtt(12.0));
        assert_eq!(probe.consecutive_unavailable(), 0);
    }

    // ─── TCP Fallback ───────────────────────────────────────────────────

    #[tokio::test]
    async fn tcp_fallback_engages_after_threshold() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let router = MockRouter::new(); // ping always fails
        let mut cfg = config(&["127.0.0.1"], ProbeStrategy::Single);
        cfg.tcp_fallback = Some(TcpFallbackConfig {
            after_failures: 2,
            port,
        });
        let mut probe = RttProbe::from_config(&cfg);

        // First failure: below the threshold, no fallback yet.
        assert_eq!(probe.measure(&router).await, ProbeOutcome::Unavailable);

        // Second failure: fallback engages and yields a handshake RTT.
        match probe.measure(&router).await {
            ProbeOutcome::Rtt(rtt) => assert!(rtt >= 0.0 && rtt < 500.0, "rtt {rtt}"),
            other => panic!("expected fallback RTT, got {other:?}"),
        }
        assert_eq!(
            probe.consecutive_unavailable(),
            2,
            "fallback success does not clear the ICMP failure streak"
        );
    }

    // ─── Median Helper ──────────────────────────────────────────────────

    #[test]
    fn median_helper() {
        assert_eq!(median(vec![]), None);
        assert_eq!(median(vec![5.0]), Some(5.0));
        assert_eq!(median(vec![30.0, 10.0, 20.0]), Some(20.0));
        assert_eq!(median(vec![10.0, 20.0]), Some(15.0));
    }
}
