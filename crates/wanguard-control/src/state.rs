//! Persisted controller state.
//!
//! These structs are the on-disk schema: every field is optional on read
//! (missing keys take defaults, unknown keys are ignored) so state files
//! survive version skew in both directions within one `schema_version`.
//! The content hash used for dirty-write suppression excludes
//! `last_transition_timestamp` — a transition alone must not force a flash
//! write if nothing else changed.

use std::collections::VecDeque;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

/// Capacity of the steering transition history ring.
pub const TRANSITION_HISTORY_CAP: usize = 50;

/// Congestion state of one WAN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CongestionState {
    #[default]
    #[serde(rename = "GREEN")]
    Green,
    #[serde(rename = "YELLOW")]
    Yellow,
    #[serde(rename = "SOFT_RED")]
    SoftRed,
    #[serde(rename = "RED")]
    Red,
}

impl CongestionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CongestionState::Green => "GREEN",
            CongestionState::Yellow => "YELLOW",
            CongestionState::SoftRed => "SOFT_RED",
            CongestionState::Red => "RED",
        }
    }
}

impl fmt::Display for CongestionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Steering state machine phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SteeringPhase {
    #[default]
    #[serde(rename = "PRIMARY_GOOD")]
    PrimaryGood,
    #[serde(rename = "PRIMARY_DEGRADED")]
    PrimaryDegraded,
}

impl SteeringPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SteeringPhase::PrimaryGood => "PRIMARY_GOOD",
            SteeringPhase::PrimaryDegraded => "PRIMARY_DEGRADED",
        }
    }
}

impl fmt::Display for SteeringPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Contract the state store needs from a persisted value.
pub trait PersistedState: Serialize + DeserializeOwned + Default + Clone {
    const SCHEMA_VERSION: &'static str;

    fn schema_version(&self) -> &str;

    /// A copy with volatile fields cleared, used for dirty-hash comparison.
    fn hashable(&self) -> Self;

    /// Clamp structurally invalid fields back into range after a load.
    fn sanitize(&mut self);

    /// Hook invoked when the on-disk `schema_version` differs. The default
    /// keeps the raw document as-is and lets lenient field decoding cope.
    fn migrate(raw: serde_json::Value, from_version: &str) -> serde_json::Value {
        let _ = from_version;
        raw
    }
}

// ── Autorate ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutorateState {
    pub schema_version: String,
    pub baseline_rtt_ms: f64,
    pub load_rtt_ms: f64,
    pub last_measured_rtt_ms: f64,
    pub current_state: CongestionState,
    pub consecutive_good_cycles: u32,
    pub consecutive_bad_cycles: u32,
    pub last_applied_download_bps: u64,
    pub last_applied_upload_bps: u64,
    pub cycle_counter: u64,
    pub last_transition_timestamp: Option<DateTime<Utc>>,
    pub consecutive_probe_failures: u32,
}

impl Default for AutorateState {
    fn default() -> Self {
        AutorateState {
            schema_version: Self::SCHEMA_VERSION.to_string(),
            baseline_rtt_ms: 0.0,
            load_rtt_ms: 0.0,
            last_measured_rtt_ms: 0.0,
            current_state: CongestionState::Green,
            consecutive_good_cycles: 0,
            consecutive_bad_cycles: 0,
            last_applied_download_bps: 0,
            last_applied_upload_bps: 0,
            cycle_counter: 0,
            last_transition_timestamp: None,
            consecutive_probe_failures: 0,
        }
    }
}

impl PersistedState for AutorateState {
    const SCHEMA_VERSION: &'static str = "1.0";

    fn schema_version(&self) -> &str {
        &self.schema_version
    }

    fn hashable(&self) -> Self {
        let mut copy = self.clone();
        copy.last_transition_timestamp = None;
        copy
    }

    fn sanitize(&mut self) {
        for value in [
            &mut self.baseline_rtt_ms,
            &mut self.load_rtt_ms,
            &mut self.last_measured_rtt_ms,
        ] {
            if !value.is_finite() || *value < 0.0 {
                *value = 0.0;
            }
        }
    }
}

// ── Steering ────────────────────────────────────────────────────────

/// One committed steering transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: SteeringPhase,
    pub to: SteeringPhase,
    pub cause: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SteeringState {
    pub schema_version: String,
    pub current_state: SteeringPhase,
    pub red_streak: u32,
    pub good_streak: u32,
    /// Mirror of the primary WAN's baseline, validated at ingest.
    pub baseline_rtt_ms: f64,
    pub rtt_delta_ewma_ms: f64,
    pub queue_ewma: f64,
    pub last_dropped_counter: Option<u64>,
    pub cake_read_failure_streak: u32,
    pub last_transition_timestamp: Option<DateTime<Utc>>,
    pub transition_history: VecDeque<TransitionRecord>,
}

impl Default for SteeringState {
    fn default() -> Self {
        SteeringState {
            schema_version: Self::SCHEMA_VERSION.to_string(),
            current_state: SteeringPhase::PrimaryGood,
            red_streak: 0,
            good_streak: 0,
            baseline_rtt_ms: 0.0,
            rtt_delta_ewma_ms: 0.0,
            queue_ewma: 0.0,
            last_dropped_counter: None,
            cake_read_failure_streak: 0,
            last_transition_timestamp: None,
            transition_history: VecDeque::new(),
        }
    }
}

impl SteeringState {
    /// Append to the bounded transition ring, evicting the oldest entry.
    pub fn record_transition(&mut self, record: TransitionRecord) {
        if self.transition_history.len() >= TRANSITION_HISTORY_CAP {
            self.transition_history.pop_front();
        }
        self.transition_history.push_back(record);
    }
}

impl PersistedState for SteeringState {
    const SCHEMA_VERSION: &'static str = "1.0";

    fn schema_version(&self) -> &str {
        &self.schema_version
    }

    fn hashable(&self) -> Self {
        let mut copy = self.clone();
        copy.last_transition_timestamp = None;
        copy
    }

    fn sanitize(&mut self) {
        for value in [&mut self.baseline_rtt_ms, &mut self.queue_ewma] {
            if !value.is_finite() || *value < 0.0 {
                *value = 0.0;
            }
        }
        if !self.rtt_delta_ewma_ms.is_finite() {
            self.rtt_delta_ewma_ms = 0.0;
        }
        while self.transition_history.len() > TRANSITION_HISTORY_CAP {
            self.transition_history.pop_front();
        }
    }
}
