//! The per-WAN autorate control loop.
//!
//! Twenty times a second: probe RTT, update the baseline and load EWMAs,
//! classify bufferbloat into GREEN / YELLOW / SOFT_RED / RED, compute the
//! next shaper rates, and push them to the router — but only when they
//! changed, and only within the rate limiter's budget. The baseline EWMA is
//! frozen while the link is loaded so sustained congestion can never teach
//! the controller that high latency is normal.

use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::watch;

use wanguard_common::config::{AutorateConfig, DownloadShaping, UploadShaping};
use wanguard_common::ewma::{self, MAX_ABS_RTT_MS};
use wanguard_router::RouterBackend;

use crate::clock::TickClock;
use crate::observe::{CycleSample, ObserverHooks, TransitionEvent};
use crate::probe::{ProbeOutcome, RttProbe};
use crate::ratelimit::ChangeRateLimiter;
use crate::state::{AutorateState, CongestionState};
use crate::store::StateStore;
use crate::ControllerError;

/// Probe-failure ladder: rates freeze from the second consecutive failure.
const FREEZE_AFTER_FAILURES: u32 = 2;
/// Degraded health is signalled past this many consecutive failures.
const DEGRADED_AFTER_FAILURES: u32 = 3;

/// What one cycle did; returned for tests and the daemon's logging.
#[derive(Debug, Clone, Copy)]
pub struct CycleReport {
    pub state: CongestionState,
    pub rtt_delta_ms: f64,
    pub computed_download_bps: u64,
    pub computed_upload_bps: u64,
    pub wrote: bool,
    pub rate_limited: bool,
    pub frozen: bool,
}

pub struct AutorateController<B> {
    cfg: AutorateConfig,
    backend: B,
    probe: RttProbe,
    store: StateStore,
    limiter: ChangeRateLimiter,
    hooks: ObserverHooks,
    state: AutorateState,
    /// Intended rates. Track the controller's decision even when a write is
    /// rate-limited or fails; `last_applied_*` tracks router truth.
    pending_download_bps: u64,
    pending_upload_bps: u64,
    /// Consecutive-green requirement for leaving SOFT_RED/RED, derived once
    /// from `recovery.red_recovery_s` at the configured cadence.
    red_recovery_cycles: u32,
    degraded: bool,
}

impl<B: RouterBackend> AutorateController<B> {
    pub fn new(cfg: AutorateConfig, backend: B, hooks: ObserverHooks) -> Result<Self, ControllerError> {
        cfg.validate()?;

        let mut store = StateStore::new(&cfg.paths.state);
        let loaded = store.load::<AutorateState>()?;
        let mut state = loaded.state;

        if state.baseline_rtt_ms == 0.0 {
            state.baseline_rtt_ms = cfg.baseline.initial_ms;
        }
        state.baseline_rtt_ms = state
            .baseline_rtt_ms
            .clamp(cfg.baseline.min_ms, cfg.baseline.max_ms);

        // A fresh link starts wide open; backoff finds the true rate faster
        // than ramping up from a floor does.
        let pending_download_bps = if state.last_applied_download_bps == 0 {
            cfg.download.ceiling_bps
        } else {
            state.last_applied_download_bps
        };
        let pending_upload_bps = if state.last_applied_upload_bps == 0 {
            cfg.upload.ceiling_bps
        } else {
            state.last_applied_upload_bps
        };

        let interval_ms = cfg.cycle.interval_ms.max(1);
        let red_recovery_cycles =
            ((cfg.recovery.red_recovery_s * 1000.0 / interval_ms as f64).ceil() as u32).max(1);

        let limiter = ChangeRateLimiter::new(
            cfg.rate_limiter.max_changes,
            Duration::from_secs(cfg.rate_limiter.window_s),
        );
        let probe = RttProbe::from_config(&cfg.probe);

        Ok(AutorateController {
            probe,
            store,
            limiter,
            hooks,
            state,
            pending_download_bps,
            pending_upload_bps,
            red_recovery_cycles,
            degraded: false,
            cfg,
            backend,
        })
    }

    pub fn state(&self) -> &AutorateState {
        &self.state
    }

    /// Degraded health: probe dark for several cycles, or router writes
    /// failing.
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// Drive the loop until shutdown. The final state is persisted on the
    /// way out.
    pub async fn run(&mut self, shutdown: watch::Receiver<bool>) -> Result<(), ControllerError> {
        let interval = Duration::from_millis(self.cfg.cycle.interval_ms);
        let mut clock = TickClock::new(interval, shutdown);
        tracing::info!(
            wan = %self.cfg.wan_name,
            interval_ms = self.cfg.cycle.interval_ms,
            "autorate controller started"
        );
        while clock.next_tick().await.is_some() {
            self.run_cycle().await;
        }
        self.store.save(&self.state)?;
        self.backend.close().await;
        tracing::info!(wan = %self.cfg.wan_name, "autorate controller stopped");
        Ok(())
    }

    /// One full control cycle: measure → smooth → classify → compute →
    /// apply → persist → observe. Never fails; every error is absorbed into
    /// degraded behavior.
    pub async fn run_cycle(&mut self) -> CycleReport {
        self.backend.begin_cycle();
        self.state.cycle_counter += 1;

        let mut frozen = false;
        match self.probe.measure(&self.backend).await {
            ProbeOutcome::Rtt(rtt) => {
                self.state.consecutive_probe_failures = 0;
                self.state.last_measured_rtt_ms = rtt;
                self.update_baseline(rtt);
                self.update_load(rtt);
            }
            ProbeOutcome::Unavailable => {
                self.state.consecutive_probe_failures =
                    self.state.consecutive_probe_failures.saturating_add(1);
                let failures = self.state.consecutive_probe_failures;
                if failures >= FREEZE_AFTER_FAILURES {
                    frozen = true;
                }
                if failures > DEGRADED_AFTER_FAILURES {
                    self.degraded = true;
                    tracing::warn!(
                        wan = %self.cfg.wan_name,
                        failures,
                        "RTT probe dark, rates frozen"
                    );
                }
                // A single miss just reuses the previous load EWMA.
            }
        }

        let delta = self.state.load_rtt_ms - self.state.baseline_rtt_ms;
        let mut wrote = false;
        let mut rate_limited = false;

        if !frozen {
            let raw = self.classify(delta);
            self.advance_state(raw);

            let (download, upload) = self.compute_rates();
            self.pending_download_bps = download;
            self.pending_upload_bps = upload;

            let applied = (
                self.state.last_applied_download_bps,
                self.state.last_applied_upload_bps,
            );
            if (download, upload) != applied {
                if self.limiter.allow(Instant::now()) {
                    match self
                        .backend
                        .set_queue_rates(&self.cfg.queues.download, download, upload)
                        .await
                    {
                        Ok(()) => {
                            self.state.last_applied_download_bps = download;
                            self.state.last_applied_upload_bps = upload;
                            self.degraded = false;
                            wrote = true;
                        }
                        Err(e) => {
                            // last_applied stays put so the next cycle retries.
                            self.degraded = true;
                            tracing::warn!(
                                wan = %self.cfg.wan_name,
                                error = %e,
                                "shaper update failed"
                            );
                        }
                    }
                } else {
                    rate_limited = true;
                    self.hooks.emit_rate_limit(&self.cfg.wan_name, Utc::now());
                    tracing::info!(
                        wan = %self.cfg.wan_name,
                        download,
                        upload,
                        "shaper update deferred by rate limiter"
                    );
                }
            }
        }

        if let Err(e) = self.store.save(&self.state) {
            tracing::warn!(wan = %self.cfg.wan_name, error = %e, "state persist failed");
        }

        self.hooks.emit_cycle(&CycleSample {
            wan_name: &self.cfg.wan_name,
            state: self.state.current_state.as_str(),
            rtt_delta_ms: delta,
            applied_download_bps: self.state.last_applied_download_bps,
            applied_upload_bps: self.state.last_applied_upload_bps,
            timestamp: Utc::now(),
        });

        CycleReport {
            state: self.state.current_state,
            rtt_delta_ms: delta,
            computed_download_bps: self.pending_download_bps,
            computed_upload_bps: self.pending_upload_bps,
            wrote,
            rate_limited,
            frozen,
        }
    }

    // ─── Measurement ────────────────────────────────────────────────────

    /// Baseline-freeze rule: the baseline only learns from samples close to
    /// it, so load-induced latency can never drag it upward.
    fn update_baseline(&mut self, sample: f64) {
        let baseline = self.state.baseline_rtt_ms;
        if sample - baseline >= self.cfg.baseline.update_threshold_ms {
            return;
        }
        match ewma::ewma(baseline, sample, self.cfg.ewma.alpha_baseline, MAX_ABS_RTT_MS) {
            Ok(next) => {
                if next < self.cfg.baseline.min_ms || next > self.cfg.baseline.max_ms {
                    tracing::warn!(
                        wan = %self.cfg.wan_name,
                        rejected = next,
                        "baseline update outside configured bounds"
                    );
                } else {
                    self.state.baseline_rtt_ms = next;
                }
            }
            Err(e) => {
                tracing::warn!(wan = %self.cfg.wan_name, error = %e, "baseline EWMA skipped");
            }
        }
    }

    fn update_load(&mut self, sample: f64) {
        match ewma::ewma(
            self.state.load_rtt_ms,
            sample,
            self.cfg.ewma.alpha_load,
            MAX_ABS_RTT_MS,
        ) {
            Ok(next) => self.state.load_rtt_ms = next,
            Err(e) => {
                tracing::warn!(wan = %self.cfg.wan_name, error = %e, "load EWMA skipped");
            }
        }
    }

    // ─── State Machine ──────────────────────────────────────────────────

    fn classify(&self, delta: f64) -> CongestionState {
        let t = &self.cfg.thresholds;
        if delta <= t.target_bloat_ms {
            CongestionState::Green
        } else if delta <= t.warn_bloat_ms {
            CongestionState::Yellow
        } else if delta <= t.hard_red_bloat_ms {
            CongestionState::SoftRed
        } else {
            CongestionState::Red
        }
    }

    /// Apply hysteresis: escalation is fast (RED immediate, YELLOW on one
    /// bad sample, SOFT_RED after a short sustain), recovery is slow
    /// (consecutive greens).
    fn advance_state(&mut self, raw: CongestionState) {
        use CongestionState::*;

        if raw == Green {
            self.state.consecutive_good_cycles =
                self.state.consecutive_good_cycles.saturating_add(1);
        } else {
            self.state.consecutive_good_cycles = 0;
        }
        if matches!(raw, SoftRed | Red) {
            self.state.consecutive_bad_cycles =
                self.state.consecutive_bad_cycles.saturating_add(1);
        } else {
            self.state.consecutive_bad_cycles = 0;
        }

        let current = self.state.current_state;
        let good = self.state.consecutive_good_cycles;
        let bad = self.state.consecutive_bad_cycles;

        let next = match (current, raw) {
            (_, Red) => Red,
            (Green | Yellow, SoftRed) => {
                if bad >= self.cfg.recovery.soft_red_sustain_cycles {
                    SoftRed
                } else {
                    Yellow
                }
            }
            (Green | Yellow, Yellow) => Yellow,
            (SoftRed | Red, SoftRed | Yellow) => current,
            (Green, Green) => Green,
            (Yellow, Green) => {
                if good >= self.cfg.recovery.yellow_recovery_cycles {
                    Green
                } else {
                    Yellow
                }
            }
            (SoftRed | Red, Green) => {
                if good >= self.red_recovery_cycles {
                    Green
                } else {
                    current
                }
            }
        };

        if next != current {
            self.state.current_state = next;
            self.state.last_transition_timestamp = Some(Utc::now());
            let cause = if next == Green { "sustained-green" } else { "rtt-bloat" };
            self.hooks.emit_transition(&TransitionEvent {
                wan_name: &self.cfg.wan_name,
                from_state: current.as_str(),
                to_state: next.as_str(),
                cause_tag: cause,
                timestamp: Utc::now(),
            });
            tracing::info!(
                wan = %self.cfg.wan_name,
                from = current.as_str(),
                to = next.as_str(),
                "congestion state changed"
            );
        }
    }

    // ─── Rate Computation ───────────────────────────────────────────────

    fn compute_rates(&self) -> (u64, u64) {
        let state = self.state.current_state;
        let download = next_rate(
            self.pending_download_bps,
            state,
            download_floor(&self.cfg.download, state),
            self.cfg.download.ceiling_bps,
            self.cfg.download.step_up_bps,
            self.cfg.download.factor_down,
        );
        let upload = next_rate(
            self.pending_upload_bps,
            state,
            upload_floor(&self.cfg.upload),
            self.cfg.upload.ceiling_bps,
            self.cfg.upload.step_up_bps,
            self.cfg.upload.factor_down,
        );
        (download, upload)
    }
}

fn download_floor(shape: &DownloadShaping, state: CongestionState) -> u64 {
    match state {
        CongestionState::Green => shape.floor_green_bps,
        CongestionState::Yellow => shape.floor_yellow_bps,
        CongestionState::SoftRed => shape.floor_soft_red_bps,
        CongestionState::Red => shape.floor_red_bps,
    }
}

fn upload_floor(shape: &UploadShaping) -> u64 {
    shape.floor_bps
}

fn next_rate(
    prev: u64,
    state: CongestionState,
    floor: u64,
    ceiling: u64,
    step_up: u64,
    factor_down: f64,
) -> u64 {
    let rate = match state {
        CongestionState::Green => prev.saturating_add(step_up).min(ceiling),
        CongestionState::Yellow => prev,
        CongestionState::SoftRed => prev.max(floor),
        CongestionState::Red => ((prev as f64 * factor_down).round() as u64).max(floor),
    };
    rate.clamp(floor, ceiling)
}
