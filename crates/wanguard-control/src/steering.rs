//! The steering control loop.
//!
//! Watches the primary WAN through two channels — its autorate state file
//! (baseline, read-only) and the router's queue counters — and flips a
//! mangle-rule when sustained RED congestion says latency-sensitive traffic
//! should ride the alternate link. Transitions only commit after the rule's
//! new status is verified back from the router; an unverified toggle keeps
//! the counters and tries again next cycle.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::Instant;

use wanguard_common::config::{ConfidenceConfig, ConfidenceMode, SteeringConfig};
use wanguard_common::ewma::{self, MAX_ABS_COUNT, MAX_ABS_RTT_MS};
use wanguard_router::RouterBackend;

use crate::ControllerError;
use crate::assessor::{self, Assessment, CongestionLevel, Signals};
use crate::clock::TickClock;
use crate::observe::{ObserverHooks, TransitionEvent};
use crate::probe::{ProbeOutcome, RttProbe};
use crate::state::{AutorateState, SteeringPhase, SteeringState, TransitionRecord};
use crate::store::{self, StateStore};

/// Largest accepted step change in the ingested primary baseline.
const MAX_BASELINE_JUMP_MS: f64 = 10.0;
/// Queue-stat read failures in a row before degraded health is flagged.
const CAKE_READ_DEGRADED: u32 = 5;
/// Verification delays after a rule toggle.
const VERIFY_DELAYS_MS: [u64; 3] = [100, 200, 400];

#[derive(Debug, Clone, Copy)]
pub struct SteeringReport {
    pub phase: SteeringPhase,
    pub assessment: Assessment,
    pub drops_delta: u64,
    pub toggled: bool,
}

pub struct SteeringController<B> {
    cfg: SteeringConfig,
    backend: B,
    probe: RttProbe,
    store: StateStore,
    state: SteeringState,
    hooks: ObserverHooks,
    overlay: Option<ConfidenceOverlay>,
    dry_run: bool,
    degraded: bool,
}

impl<B: RouterBackend> SteeringController<B> {
    pub fn new(cfg: SteeringConfig, backend: B, hooks: ObserverHooks) -> Result<Self, ControllerError> {
        cfg.validate()?;

        let mut store = StateStore::new(&cfg.paths.state);
        let state = store.load::<SteeringState>()?.state;
        let probe = RttProbe::lightweight(&cfg.probe);
        let overlay = cfg.confidence.clone().map(ConfidenceOverlay::new);

        Ok(SteeringController {
            probe,
            store,
            state,
            hooks,
            overlay,
            dry_run: false,
            degraded: false,
            cfg,
            backend,
        })
    }

    /// Log intended rule toggles without performing them.
    pub fn set_dry_run(&mut self, dry_run: bool) {
        self.dry_run = dry_run;
    }

    pub fn state(&self) -> &SteeringState {
        &self.state
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    pub async fn run(&mut self, shutdown: watch::Receiver<bool>) -> Result<(), ControllerError> {
        let interval = Duration::from_millis(self.cfg.cycle.interval_ms);
        let mut clock = TickClock::new(interval, shutdown);
        tracing::info!(
            primary = %self.cfg.wan_name,
            rule = %self.cfg.mangle_rule_comment,
            dry_run = self.dry_run,
            "steering controller started"
        );
        while clock.next_tick().await.is_some() {
            self.run_cycle().await;
        }
        self.store.save(&self.state)?;
        self.backend.close().await;
        tracing::info!(primary = %self.cfg.wan_name, "steering controller stopped");
        Ok(())
    }

    pub async fn run_cycle(&mut self) -> SteeringReport {
        self.backend.begin_cycle();

        // 1. Ingest the primary WAN's baseline (read-only, validated).
        let primary = match store::load_readonly::<AutorateState>(&self.cfg.primary_state_file) {
            Ok(primary) => Some(primary),
            Err(e) => {
                tracing::debug!(error = %e, "primary state file unreadable this cycle");
                None
            }
        };
        if let Some(primary) = &primary {
            self.ingest_baseline(primary.baseline_rtt_ms);
        }

        // 2. Queue signals from the router.
        let drops_delta = self.read_queue_signals().await;

        // 3. Load RTT: a lightweight probe, with the primary's own load
        //    measurement as a stand-in when the probe comes up empty.
        let load_rtt = match self.probe.measure(&self.backend).await {
            ProbeOutcome::Rtt(rtt) => Some(rtt),
            ProbeOutcome::Unavailable => primary
                .as_ref()
                .filter(|p| p.load_rtt_ms > 0.0)
                .map(|p| p.load_rtt_ms),
        };
        if let (Some(rtt), true) = (load_rtt, self.state.baseline_rtt_ms > 0.0) {
            let sample = rtt - self.state.baseline_rtt_ms;
            match ewma::ewma(
                self.state.rtt_delta_ewma_ms,
                sample,
                self.cfg.assessor.alpha_rtt_delta,
                MAX_ABS_RTT_MS,
            ) {
                Ok(next) => self.state.rtt_delta_ewma_ms = next,
                Err(e) => {
                    tracing::warn!(error = %e, "rtt delta EWMA skipped");
                }
            }
        }

        // 4. Assess.
        let assessment = assessor::assess(
            &Signals {
                rtt_delta_ewma_ms: self.state.rtt_delta_ewma_ms,
                cake_drops_delta: drops_delta,
                queued_packets: self.state.queue_ewma,
            },
            &self.cfg.assessor,
        );

        // 5. Advance the state machine (streaks, or the confidence overlay
        //    when it is active).
        let wanted = self.decide(assessment);

        // 6. Toggle + verify + commit.
        let mut toggled = false;
        if let Some(to) = wanted {
            toggled = self.attempt_transition(to, assessment).await;
        }

        // 7. Persist (even when the toggle failed, so streaks survive a
        //    restart).
        if let Err(e) = self.store.save(&self.state) {
            tracing::warn!(error = %e, "steering state persist failed");
        }

        SteeringReport {
            phase: self.state.current_state,
            assessment,
            drops_delta,
            toggled,
        }
    }

    // ─── Ingest ─────────────────────────────────────────────────────────

    fn ingest_baseline(&mut self, candidate: f64) {
        let bounds = &self.cfg.baseline;
        if !candidate.is_finite() || candidate < bounds.min_ms || candidate > bounds.max_ms {
            tracing::warn!(
                candidate,
                "primary baseline outside configured bounds, keeping current"
            );
            return;
        }
        let held = self.state.baseline_rtt_ms;
        if held > 0.0 && (candidate - held).abs() > MAX_BASELINE_JUMP_MS {
            tracing::warn!(
                candidate,
                held,
                "primary baseline jumped more than {MAX_BASELINE_JUMP_MS} ms, keeping current"
            );
            return;
        }
        self.state.baseline_rtt_ms = candidate;
    }

    async fn read_queue_signals(&mut self) -> u64 {
        match self.backend.get_queue_stats(&self.cfg.queues.download).await {
            Ok(stats) => {
                self.state.cake_read_failure_streak = 0;
                self.degraded = false;
                let delta = match self.state.last_dropped_counter {
                    // A decreasing counter means the router reset it.
                    Some(previous) if stats.dropped >= previous => stats.dropped - previous,
                    Some(_) | None => 0,
                };
                self.state.last_dropped_counter = Some(stats.dropped);
                match ewma::ewma(
                    self.state.queue_ewma,
                    stats.queued_packets as f64,
                    self.cfg.assessor.alpha_queue,
                    MAX_ABS_COUNT,
                ) {
                    Ok(next) => self.state.queue_ewma = next,
                    Err(e) => {
                        tracing::warn!(error = %e, "queue EWMA skipped");
                    }
                }
                delta
            }
            Err(e) => {
                self.state.cake_read_failure_streak =
                    self.state.cake_read_failure_streak.saturating_add(1);
                if self.state.cake_read_failure_streak == CAKE_READ_DEGRADED {
                    self.degraded = true;
                    tracing::warn!(
                        error = %e,
                        streak = self.state.cake_read_failure_streak,
                        "queue stats repeatedly unavailable"
                    );
                } else {
                    tracing::debug!(error = %e, "queue stats unavailable this cycle");
                }
                0
            }
        }
    }

    // ─── Decision ───────────────────────────────────────────────────────

    fn decide(&mut self, assessment: Assessment) -> Option<SteeringPhase> {
        let enabled = self.state.current_state == SteeringPhase::PrimaryDegraded;

        if let Some(overlay) = &mut self.overlay {
            let decision = overlay.evaluate(Instant::now(), assessment.confidence, enabled);
            match overlay.mode() {
                ConfidenceMode::DryRun => {
                    if decision != OverlayDecision::Hold {
                        tracing::info!(
                            ?decision,
                            confidence = assessment.confidence,
                            "confidence overlay recommendation (dry-run)"
                        );
                    }
                    // Fall through to the streak machine.
                }
                ConfidenceMode::Active => {
                    return match decision {
                        OverlayDecision::Enable if !enabled => {
                            Some(SteeringPhase::PrimaryDegraded)
                        }
                        OverlayDecision::Disable if enabled => Some(SteeringPhase::PrimaryGood),
                        _ => None,
                    };
                }
            }
        }

        match self.state.current_state {
            SteeringPhase::PrimaryGood => {
                if assessment.level == CongestionLevel::Red {
                    self.state.red_streak = self
                        .state
                        .red_streak
                        .saturating_add(1)
                        .min(self.cfg.hysteresis.red_samples_required);
                } else {
                    self.state.red_streak = 0;
                }
                (self.state.red_streak >= self.cfg.hysteresis.red_samples_required)
                    .then_some(SteeringPhase::PrimaryDegraded)
            }
            SteeringPhase::PrimaryDegraded => {
                if assessment.level == CongestionLevel::Green {
                    self.state.good_streak = self
                        .state
                        .good_streak
                        .saturating_add(1)
                        .min(self.cfg.hysteresis.green_samples_required);
                } else {
                    self.state.good_streak = 0;
                }
                (self.state.good_streak >= self.cfg.hysteresis.green_samples_required)
                    .then_some(SteeringPhase::PrimaryGood)
            }
        }
    }

    // ─── Rule Toggle ────────────────────────────────────────────────────

    /// Toggle the rule and verify the router applied it. The transition is
    /// committed only on verified success; otherwise streaks stay put and
    /// the next cycle retries.
    async fn attempt_transition(&mut self, to: SteeringPhase, assessment: Assessment) -> bool {
        let enable = to == SteeringPhase::PrimaryDegraded;
        let comment = self.cfg.mangle_rule_comment.clone();
        let comment = &comment;

        if self.dry_run {
            tracing::info!(
                rule = %comment,
                enable,
                confidence = assessment.confidence,
                "dry-run: rule toggle suppressed"
            );
            return false;
        }

        let toggle = if enable {
            self.backend.enable_rule(comment).await
        } else {
            self.backend.disable_rule(comment).await
        };
        if let Err(e) = toggle {
            tracing::warn!(rule = %comment, enable, error = %e, "rule toggle failed");
            return false;
        }

        for delay_ms in VERIFY_DELAYS_MS {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            match self.backend.rule_status(comment).await {
                Ok(status) if status.exists && status.enabled == enable => {
                    self.commit_transition(to, assessment);
                    return true;
                }
                Ok(status) => {
                    tracing::debug!(
                        rule = %comment,
                        exists = status.exists,
                        enabled = status.enabled,
                        "rule status not yet as requested"
                    );
                }
                Err(e) => {
                    tracing::debug!(rule = %comment, error = %e, "rule status read failed");
                }
            }
        }

        tracing::warn!(
            rule = %comment,
            enable,
            "rule toggle could not be verified, transition not committed"
        );
        false
    }

    fn commit_transition(&mut self, to: SteeringPhase, assessment: Assessment) {
        let from = self.state.current_state;
        let now = Utc::now();
        let cause = if to == SteeringPhase::PrimaryDegraded {
            "sustained-red"
        } else {
            "sustained-green"
        };

        self.state.current_state = to;
        self.state.red_streak = 0;
        self.state.good_streak = 0;
        self.state.last_transition_timestamp = Some(now);
        self.state.record_transition(TransitionRecord {
            from,
            to,
            cause: cause.to_string(),
            timestamp: now,
        });
        if let Some(overlay) = &mut self.overlay {
            overlay.note_toggle(Instant::now(), to == SteeringPhase::PrimaryDegraded);
        }

        self.hooks.emit_transition(&TransitionEvent {
            wan_name: &self.cfg.wan_name,
            from_state: from.as_str(),
            to_state: to.as_str(),
            cause_tag: cause,
            timestamp: now,
        });
        tracing::info!(
            primary = %self.cfg.wan_name,
            from = from.as_str(),
            to = to.as_str(),
            confidence = assessment.confidence,
            "steering transition committed"
        );
    }
}

// ── Confidence overlay ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlayDecision {
    Enable,
    Disable,
    Hold,
}

/// Flap penalty added to the enable threshold while toggles are frequent.
const FLAP_THRESHOLD_BOOST: u8 = 15;

/// Confidence-scored second opinion on steering.
///
/// Enable when confidence stays above the (possibly flap-boosted) threshold
/// for the sustain interval; refuse to disable until the hold-down elapses.
pub struct ConfidenceOverlay {
    cfg: ConfidenceConfig,
    above_since: Option<Instant>,
    enabled_at: Option<Instant>,
    toggles: VecDeque<Instant>,
}

impl ConfidenceOverlay {
    pub fn new(cfg: ConfidenceConfig) -> Self {
        ConfidenceOverlay {
            cfg,
            above_since: None,
            enabled_at: None,
            toggles: VecDeque::new(),
        }
    }

    pub fn mode(&self) -> ConfidenceMode {
        self.cfg.mode
    }

    /// Current enable threshold, raised while the rule has been flapping.
    pub fn effective_threshold(&mut self, now: Instant) -> u8 {
        let window = Duration::from_secs(self.cfg.flap_window_s);
        while let Some(&oldest) = self.toggles.front() {
            if now.duration_since(oldest) >= window {
                self.toggles.pop_front();
            } else {
                break;
            }
        }
        if self.toggles.len() >= self.cfg.flap_max_toggles {
            self.cfg
                .enable_threshold
                .saturating_add(FLAP_THRESHOLD_BOOST)
                .min(100)
        } else {
            self.cfg.enable_threshold
        }
    }

    pub fn evaluate(&mut self, now: Instant, confidence: u8, rule_enabled: bool) -> OverlayDecision {
        let threshold = self.effective_threshold(now);

        if confidence >= threshold {
            let since = *self.above_since.get_or_insert(now);
            if !rule_enabled
                && now.duration_since(since) >= Duration::from_millis(self.cfg.sustain_interval_ms)
            {
                return OverlayDecision::Enable;
            }
        } else {
            self.above_since = None;
        }

        if rule_enabled {
            if let Some(at) = self.enabled_at {
                if now.duration_since(at) < Duration::from_millis(self.cfg.hold_down_ms) {
                    return OverlayDecision::Hold;
                }
            }
            if confidence == 0 {
                return OverlayDecision::Disable;
            }
        }

        OverlayDecision::Hold
    }

    /// Record a committed toggle for hold-down and flap accounting.
    pub fn note_toggle(&mut self, now: Instant, enabled: bool) {
        self.toggles.push_back(now);
        if enabled {
            self.enabled_at = Some(now);
        } else {
            self.enabled_at = None;
            self.above_since = None;
        }
    }
}
