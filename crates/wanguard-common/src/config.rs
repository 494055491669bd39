//! Typed configuration for the autorate and steering controllers.
//!
//! The hosting binary deserializes these from TOML and calls `validate()`
//! before handing them to a controller. Validation failures are fatal at
//! startup; after that the config is immutable for the life of the process.
//! Defaults match the documented operating point: 50 ms cadence, 24 ms
//! initial baseline bounded to [10, 60] ms, 3/15/40 ms bloat thresholds.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::names::{QueueName, RuleComment};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{key}: {reason}")]
    Invalid { key: &'static str, reason: String },
    #[error("{key}: references environment variable {var}, which is not set")]
    PasswordRef { key: &'static str, var: String },
}

impl ConfigError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

// ── Router transport ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Rest,
    Ssh,
}

/// Credentials and endpoint for the router transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    pub transport: TransportKind,
    pub host: String,
    pub user: String,
    /// Name of the environment variable holding the password. Resolved once
    /// at startup; the resolved value is never logged or persisted.
    #[serde(default)]
    pub password_ref: Option<String>,
    /// Defaults to 443 for REST, 22 for SSH.
    #[serde(default)]
    pub port: Option<u16>,
    /// Default off: home routers ship self-signed certificates.
    #[serde(default)]
    pub verify_tls: bool,
    #[serde(default)]
    pub ssh_key_path: Option<PathBuf>,
}

impl RouterConfig {
    pub fn port(&self) -> u16 {
        self.port.unwrap_or(match self.transport {
            TransportKind::Rest => 443,
            TransportKind::Ssh => 22,
        })
    }

    /// Resolve `password_ref` through the environment.
    pub fn resolve_password(&self) -> Result<Option<String>, ConfigError> {
        match &self.password_ref {
            None => Ok(None),
            Some(var) => match std::env::var(var) {
                Ok(v) => Ok(Some(v)),
                Err(_) => Err(ConfigError::PasswordRef {
                    key: "router.password_ref",
                    var: var.clone(),
                }),
            },
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.host.is_empty() {
            return Err(ConfigError::invalid("router.host", "must not be empty"));
        }
        if self.user.is_empty() {
            return Err(ConfigError::invalid("router.user", "must not be empty"));
        }
        Ok(())
    }
}

// ── Queues ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueNames {
    pub download: QueueName,
    pub upload: QueueName,
}

// ── Shaping envelopes ───────────────────────────────────────────────

/// Download shaping: one floor per congestion state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadShaping {
    pub floor_green_bps: u64,
    pub floor_yellow_bps: u64,
    pub floor_soft_red_bps: u64,
    pub floor_red_bps: u64,
    pub ceiling_bps: u64,
    pub step_up_bps: u64,
    pub factor_down: f64,
}

impl DownloadShaping {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.ceiling_bps == 0 {
            return Err(ConfigError::invalid("download.ceiling_bps", "must be > 0"));
        }
        let ordered = self.floor_red_bps <= self.floor_soft_red_bps
            && self.floor_soft_red_bps <= self.floor_yellow_bps
            && self.floor_yellow_bps <= self.floor_green_bps
            && self.floor_green_bps <= self.ceiling_bps;
        if !ordered {
            return Err(ConfigError::invalid(
                "download",
                format!(
                    "floors must satisfy red <= soft_red <= yellow <= green <= ceiling, got {}/{}/{}/{}/{}",
                    self.floor_red_bps,
                    self.floor_soft_red_bps,
                    self.floor_yellow_bps,
                    self.floor_green_bps,
                    self.ceiling_bps
                ),
            ));
        }
        validate_factor("download.factor_down", self.factor_down)
    }
}

/// Upload shaping: a single floor for all states.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadShaping {
    pub floor_bps: u64,
    pub ceiling_bps: u64,
    pub step_up_bps: u64,
    pub factor_down: f64,
}

impl UploadShaping {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.ceiling_bps == 0 {
            return Err(ConfigError::invalid("upload.ceiling_bps", "must be > 0"));
        }
        if self.floor_bps > self.ceiling_bps {
            return Err(ConfigError::invalid(
                "upload",
                format!(
                    "floor {} exceeds ceiling {}",
                    self.floor_bps, self.ceiling_bps
                ),
            ));
        }
        validate_factor("upload.factor_down", self.factor_down)
    }
}

fn validate_factor(key: &'static str, factor: f64) -> Result<(), ConfigError> {
    if !factor.is_finite() || factor <= 0.0 || factor >= 1.0 {
        return Err(ConfigError::invalid(
            key,
            format!("must be in (0, 1), got {factor}"),
        ));
    }
    Ok(())
}

// ── Bufferbloat thresholds ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BloatThresholds {
    pub target_bloat_ms: f64,
    pub warn_bloat_ms: f64,
    pub hard_red_bloat_ms: f64,
}

impl Default for BloatThresholds {
    fn default() -> Self {
        BloatThresholds {
            target_bloat_ms: 15.0,
            warn_bloat_ms: 25.0,
            hard_red_bloat_ms: 40.0,
        }
    }
}

impl BloatThresholds {
    fn validate(&self) -> Result<(), ConfigError> {
        let ordered = self.target_bloat_ms < self.warn_bloat_ms
            && self.warn_bloat_ms < self.hard_red_bloat_ms;
        if !ordered || self.target_bloat_ms <= 0.0 {
            return Err(ConfigError::invalid(
                "thresholds",
                format!(
                    "must satisfy 0 < target < warn < hard, got {}/{}/{}",
                    self.target_bloat_ms, self.warn_bloat_ms, self.hard_red_bloat_ms
                ),
            ));
        }
        Ok(())
    }
}

// ── EWMA alphas ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EwmaAlphas {
    pub alpha_baseline: f64,
    pub alpha_load: f64,
}

impl Default for EwmaAlphas {
    fn default() -> Self {
        EwmaAlphas {
            alpha_baseline: 0.05,
            alpha_load: 0.25,
        }
    }
}

impl EwmaAlphas {
    fn validate(&self) -> Result<(), ConfigError> {
        for (key, alpha) in [
            ("ewma.alpha_baseline", self.alpha_baseline),
            ("ewma.alpha_load", self.alpha_load),
        ] {
            if !(0.0..=1.0).contains(&alpha) || !alpha.is_finite() {
                return Err(ConfigError::invalid(
                    key,
                    format!("must be in [0, 1], got {alpha}"),
                ));
            }
        }
        Ok(())
    }
}

// ── Baseline bounds ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaselineConfig {
    pub initial_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    /// Baseline only updates when `sample - baseline` is below this.
    pub update_threshold_ms: f64,
}

impl Default for BaselineConfig {
    fn default() -> Self {
        BaselineConfig {
            initial_ms: 24.0,
            min_ms: 10.0,
            max_ms: 60.0,
            update_threshold_ms: 3.0,
        }
    }
}

impl BaselineConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.min_ms <= 0.0 || self.min_ms >= self.max_ms {
            return Err(ConfigError::invalid(
                "baseline",
                format!("need 0 < min_ms < max_ms, got {}/{}", self.min_ms, self.max_ms),
            ));
        }
        if self.initial_ms < self.min_ms || self.initial_ms > self.max_ms {
            return Err(ConfigError::invalid(
                "baseline.initial_ms",
                format!(
                    "{} is outside [{}, {}]",
                    self.initial_ms, self.min_ms, self.max_ms
                ),
            ));
        }
        if self.update_threshold_ms <= 0.0 {
            return Err(ConfigError::invalid(
                "baseline.update_threshold_ms",
                "must be > 0",
            ));
        }
        Ok(())
    }
}

// ── RTT probe ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeStrategy {
    Single,
    MedianOfThree,
}

/// TCP-connect fallback for ICMP-hostile ISPs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpFallbackConfig {
    /// Consecutive unavailable cycles before the fallback engages.
    #[serde(default = "default_tcp_after_failures")]
    pub after_failures: u32,
    #[serde(default = "default_tcp_port")]
    pub port: u16,
}

fn default_tcp_after_failures() -> u32 {
    10
}

fn default_tcp_port() -> u16 {
    443
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    pub hosts: Vec<String>,
    pub strategy: ProbeStrategy,
    #[serde(default = "default_probe_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub tcp_fallback: Option<TcpFallbackConfig>,
}

fn default_probe_timeout_ms() -> u64 {
    500
}

impl ProbeConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.hosts.is_empty() {
            return Err(ConfigError::invalid("probe.hosts", "must not be empty"));
        }
        if self.strategy == ProbeStrategy::MedianOfThree && self.hosts.len() < 3 {
            return Err(ConfigError::invalid(
                "probe.hosts",
                format!(
                    "median_of_three needs at least 3 hosts, got {}",
                    self.hosts.len()
                ),
            ));
        }
        if self.timeout_ms == 0 {
            return Err(ConfigError::invalid("probe.timeout_ms", "must be > 0"));
        }
        Ok(())
    }
}

// ── Cycle cadence ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleConfig {
    /// Fixed at startup; runtime changes are not supported.
    pub interval_ms: u64,
}

impl Default for CycleConfig {
    fn default() -> Self {
        CycleConfig { interval_ms: 50 }
    }
}

impl CycleConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.interval_ms == 0 {
            return Err(ConfigError::invalid("cycle.interval_ms", "must be > 0"));
        }
        Ok(())
    }
}

// ── Hysteresis ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Consecutive SOFT_RED-grade cycles before SOFT_RED is entered.
    pub soft_red_sustain_cycles: u32,
    /// Consecutive green cycles to leave YELLOW.
    pub yellow_recovery_cycles: u32,
    /// Seconds of sustained green to leave SOFT_RED or RED. Converted to a
    /// cycle count at the configured cadence when the controller starts.
    pub red_recovery_s: f64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        RecoveryConfig {
            soft_red_sustain_cycles: 3,
            yellow_recovery_cycles: 5,
            red_recovery_s: 3.0,
        }
    }
}

impl RecoveryConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.soft_red_sustain_cycles == 0 || self.yellow_recovery_cycles == 0 {
            return Err(ConfigError::invalid(
                "recovery",
                "sustain/recovery cycle counts must be > 0",
            ));
        }
        if self.red_recovery_s <= 0.0 {
            return Err(ConfigError::invalid("recovery.red_recovery_s", "must be > 0"));
        }
        Ok(())
    }
}

// ── Rate limiter ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimiterConfig {
    pub max_changes: usize,
    pub window_s: u64,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        RateLimiterConfig {
            max_changes: 10,
            window_s: 60,
        }
    }
}

impl RateLimiterConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_changes == 0 || self.window_s == 0 {
            return Err(ConfigError::invalid(
                "rate_limiter",
                "max_changes and window_s must be > 0",
            ));
        }
        Ok(())
    }
}

// ── Paths ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    pub state: PathBuf,
    pub lock: PathBuf,
    pub log: PathBuf,
}

// ── Autorate ────────────────────────────────────────────────────────

/// Full configuration for one autorate controller (one WAN).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutorateConfig {
    pub wan_name: String,
    pub schema_version: String,
    pub router: RouterConfig,
    pub queues: QueueNames,
    pub download: DownloadShaping,
    pub upload: UploadShaping,
    #[serde(default)]
    pub thresholds: BloatThresholds,
    #[serde(default)]
    pub ewma: EwmaAlphas,
    #[serde(default)]
    pub baseline: BaselineConfig,
    pub probe: ProbeConfig,
    #[serde(default)]
    pub cycle: CycleConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub rate_limiter: RateLimiterConfig,
    pub paths: PathsConfig,
}

impl AutorateConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.wan_name.is_empty() {
            return Err(ConfigError::invalid("wan_name", "must not be empty"));
        }
        self.router.validate()?;
        self.download.validate()?;
        self.upload.validate()?;
        self.thresholds.validate()?;
        self.ewma.validate()?;
        self.baseline.validate()?;
        self.probe.validate()?;
        self.cycle.validate()?;
        self.recovery.validate()?;
        self.rate_limiter.validate()?;
        Ok(())
    }
}

// ── Steering ────────────────────────────────────────────────────────

/// Signal thresholds for the multi-signal congestion assessor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssessorConfig {
    pub green_rtt_ms: f64,
    pub yellow_rtt_ms: f64,
    pub red_rtt_ms: f64,
    pub min_drops_red: u64,
    pub min_queue_yellow: u64,
    pub min_queue_red: u64,
    #[serde(default = "default_alpha_rtt_delta")]
    pub alpha_rtt_delta: f64,
    #[serde(default = "default_alpha_queue")]
    pub alpha_queue: f64,
}

fn default_alpha_rtt_delta() -> f64 {
    0.3
}

fn default_alpha_queue() -> f64 {
    0.2
}

impl Default for AssessorConfig {
    fn default() -> Self {
        AssessorConfig {
            green_rtt_ms: 8.0,
            yellow_rtt_ms: 15.0,
            red_rtt_ms: 20.0,
            min_drops_red: 5,
            min_queue_yellow: 50,
            min_queue_red: 100,
            alpha_rtt_delta: default_alpha_rtt_delta(),
            alpha_queue: default_alpha_queue(),
        }
    }
}

impl AssessorConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        let ordered = self.green_rtt_ms < self.yellow_rtt_ms && self.yellow_rtt_ms <= self.red_rtt_ms;
        if !ordered {
            return Err(ConfigError::invalid(
                "assessor",
                format!(
                    "must satisfy green < yellow <= red, got {}/{}/{}",
                    self.green_rtt_ms, self.yellow_rtt_ms, self.red_rtt_ms
                ),
            ));
        }
        for (key, alpha) in [
            ("assessor.alpha_rtt_delta", self.alpha_rtt_delta),
            ("assessor.alpha_queue", self.alpha_queue),
        ] {
            if !(0.0..=1.0).contains(&alpha) || !alpha.is_finite() {
                return Err(ConfigError::invalid(
                    key,
                    format!("must be in [0, 1], got {alpha}"),
                ));
            }
        }
        Ok(())
    }
}

/// Streak lengths for the steering state machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HysteresisConfig {
    pub red_samples_required: u32,
    pub green_samples_required: u32,
}

impl Default for HysteresisConfig {
    fn default() -> Self {
        // ~400 ms of sustained RED and ~3 s of sustained GREEN at 50 ms.
        HysteresisConfig {
            red_samples_required: 8,
            green_samples_required: 60,
        }
    }
}

impl HysteresisConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.red_samples_required == 0 || self.green_samples_required == 0 {
            return Err(ConfigError::invalid(
                "hysteresis",
                "sample requirements must be > 0",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceMode {
    DryRun,
    Active,
}

/// Optional confidence-scored overlay on top of the streak state machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfidenceConfig {
    pub mode: ConfidenceMode,
    /// Confidence (0-100) that must be sustained to recommend an enable.
    pub enable_threshold: u8,
    pub sustain_interval_ms: u64,
    /// Minimum time the rule stays enabled once toggled.
    pub hold_down_ms: u64,
    /// Toggles within the flap window before the threshold is raised.
    #[serde(default = "default_flap_max_toggles")]
    pub flap_max_toggles: usize,
    #[serde(default = "default_flap_window_s")]
    pub flap_window_s: u64,
}

fn default_flap_max_toggles() -> usize {
    4
}

fn default_flap_window_s() -> u64 {
    600
}

impl ConfidenceConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.enable_threshold > 100 {
            return Err(ConfigError::invalid(
                "confidence.enable_threshold",
                "must be <= 100",
            ));
        }
        if self.sustain_interval_ms == 0 || self.hold_down_ms == 0 {
            return Err(ConfigError::invalid(
                "confidence",
                "sustain_interval_ms and hold_down_ms must be > 0",
            ));
        }
        if self.flap_max_toggles == 0 || self.flap_window_s == 0 {
            return Err(ConfigError::invalid(
                "confidence",
                "flap_max_toggles and flap_window_s must be > 0",
            ));
        }
        Ok(())
    }
}

/// Full configuration for the steering controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SteeringConfig {
    /// Name of the primary WAN being watched.
    pub wan_name: String,
    pub schema_version: String,
    pub router: RouterConfig,
    /// Queues of the primary WAN; steering reads the download queue's stats.
    pub queues: QueueNames,
    /// The primary WAN's autorate state file (read-only ingest).
    pub primary_state_file: PathBuf,
    pub mangle_rule_comment: RuleComment,
    #[serde(default)]
    pub assessor: AssessorConfig,
    #[serde(default)]
    pub hysteresis: HysteresisConfig,
    #[serde(default)]
    pub confidence: Option<ConfidenceConfig>,
    pub probe: ProbeConfig,
    #[serde(default)]
    pub cycle: CycleConfig,
    #[serde(default)]
    pub baseline: BaselineConfig,
    pub paths: PathsConfig,
}

impl SteeringConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.wan_name.is_empty() {
            return Err(ConfigError::invalid("wan_name", "must not be empty"));
        }
        self.router.validate()?;
        self.assessor.validate()?;
        self.hysteresis.validate()?;
        if let Some(confidence) = &self.confidence {
            confidence.validate()?;
        }
        self.probe.validate()?;
        self.cycle.validate()?;
        self.baseline.validate()?;
        Ok(())
    }
}
