//! Observability hooks.
//!
//! The hosting application injects these callbacks; the controllers never
//! touch a metrics registry directly. Every hook is optional — a missing
//! callback costs nothing.

use chrono::{DateTime, Utc};

/// One control-cycle sample.
#[derive(Debug, Clone)]
pub struct CycleSample<'a> {
    pub wan_name: &'a str,
    pub state: &'static str,
    pub rtt_delta_ms: f64,
    pub applied_download_bps: u64,
    pub applied_upload_bps: u64,
    pub timestamp: DateTime<Utc>,
}

/// A committed state-machine transition.
#[derive(Debug, Clone)]
pub struct TransitionEvent<'a> {
    pub wan_name: &'a str,
    pub from_state: &'static str,
    pub to_state: &'static str,
    pub cause_tag: &'a str,
    pub timestamp: DateTime<Utc>,
}

type CycleFn = Box<dyn Fn(&CycleSample<'_>) + Send + Sync>;
type TransitionFn = Box<dyn Fn(&TransitionEvent<'_>) + Send + Sync>;
type RateLimitFn = Box<dyn Fn(&str, DateTime<Utc>) + Send + Sync>;

/// Callback record handed to a controller at construction.
#[derive(Default)]
pub struct ObserverHooks {
    pub on_cycle: Option<CycleFn>,
    pub on_transition: Option<TransitionFn>,
    pub on_rate_limit_event: Option<RateLimitFn>,
}

impl ObserverHooks {
    /// No-op hooks.
    pub fn none() -> Self {
        Self::default()
    }

    /// Hooks that forward everything to `tracing`: cycles at debug,
    /// transitions at info, rate-limit events at warn.
    pub fn tracing() -> Self {
        ObserverHooks {
            on_cycle: Some(Box::new(|sample| {
                tracing::debug!(
                    wan = sample.wan_name,
                    state = sample.state,
                    rtt_delta_ms = sample.rtt_delta_ms,
                    download_bps = sample.applied_download_bps,
                    upload_bps = sample.applied_upload_bps,
                    "cycle"
                );
            })),
            on_transition: Some(Box::new(|event| {
                tracing::info!(
                    wan = event.wan_name,
                    from = event.from_state,
                    to = event.to_state,
                    cause = event.cause_tag,
                    "state transition"
                );
            })),
            on_rate_limit_event: Some(Box::new(|wan, _ts| {
                tracing::warn!(wan, "router write skipped by rate limiter");
            })),
        }
    }

    pub fn emit_cycle(&self, sample: &CycleSample<'_>) {
        if let Some(hook) = &self.on_cycle {
            hook(sample);
        }
    }

    pub fn emit_transition(&self, event: &TransitionEvent<'_>) {
        if let Some(hook) = &self.on_transition {
            hook(event);
        }
    }

    pub fn emit_rate_limit(&self, wan_name: &str, timestamp: DateTime<Utc>) {
        if let Some(hook) = &self.on_rate_limit_event {
            hook(wan_name, timestamp);
        }
    }
}
