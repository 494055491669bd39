//! Multi-signal congestion assessor for steering decisions.
//!
//! RED demands agreement from all three signals — RTT delta, queue drops,
//! and queue occupancy. A speed test saturates the link and spikes RTT, but
//! a well-tuned shaper absorbs it without drops, so RTT alone must never
//! divert traffic.

use wanguard_common::config::AssessorConfig;

/// Inputs for one assessment, already smoothed where appropriate.
#[derive(Debug, Clone, Copy)]
pub struct Signals {
    pub rtt_delta_ewma_ms: f64,
    pub cake_drops_delta: u64,
    pub queued_packets: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CongestionLevel {
    Green,
    Yellow,
    Red,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Assessment {
    pub level: CongestionLevel,
    /// 0-100. RED scales with RTT severity, YELLOW sits in [25, 50].
    pub confidence: u8,
}

/// Classify one cycle's signals. Rules are evaluated in order; first match
/// wins.
pub fn assess(signals: &Signals, thresholds: &AssessorConfig) -> Assessment {
    let rtt = signals.rtt_delta_ewma_ms;

    let red = rtt > thresholds.red_rtt_ms
        && signals.cake_drops_delta >= thresholds.min_drops_red
        && signals.queued_packets >= thresholds.min_queue_red as f64;
    if red {
        let confidence = (50.0 + rtt.floor()).min(100.0) as u8;
        return Assessment {
            level: CongestionLevel::Red,
            confidence,
        };
    }

    let yellow = rtt > thresholds.yellow_rtt_ms
        || signals.queued_packets >= thresholds.min_queue_yellow as f64;
    if yellow {
        // Scale within [25, 50] by how far the RTT sits between the yellow
        // and red thresholds; queue-only YELLOW stays at the low end.
        let span = (thresholds.red_rtt_ms - thresholds.yellow_rtt_ms).max(f64::EPSILON);
        let severity = ((rtt - thresholds.yellow_rtt_ms) / span).clamp(0.0, 1.0);
        let confidence = (25.0 + severity * 25.0).round() as u8;
        return Assessment {
            level: CongestionLevel::Yellow,
            confidence,
        };
    }

    Assessment {
        level: CongestionLevel::Green,
        confidence: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thresholds() -> AssessorConfig {
        AssessorConfig {
            green_rtt_ms: 8.0,
            yellow_rtt_ms: 15.0,
            red_rtt_ms: 20.0,
            min_drops_red: 5,
            min_queue_yellow: 50,
            min_queue_red: 100,
            ..Default::default()
        }
    }

    // ─── RED ────────────────────────────────────────────────────────────

    #[test]
    fn red_requires_all_three_signals() {
        let assessment = assess(
            &Signals {
                rtt_delta_ewma_ms: 25.0,
                cake_drops_delta: 10,
                queued_packets: 200.0,
            },
            &thresholds(),
        );
        assert_eq!(assessment.level, CongestionLevel::Red);
        assert_eq!(assessment.confidence, 75); // 50 + 25
    }

    #[test]
    fn red_confidence_caps_at_100() {
        let assessment = assess(
            &Signals {
                rtt_delta_ewma_ms: 90.0,
                cake_drops_delta: 50,
                queued_packets: 500.0,
            },
            &thresholds(),
        );
        assert_eq!(assessment.level, CongestionLevel::Red);
        assert_eq!(assessment.confidence, 100);
    }

    // ─── False-Positive Shield ──────────────────────────────────────────

    #[test]
    fn speed_test_profile_is_yellow_not_red() {
        // High RTT delta and deep queue, zero drops: a speed test.
        let assessment = assess(
            &Signals {
                rtt_delta_ewma_ms: 60.0,
                cake_drops_delta: 0,
                queued_packets: 2258.0,
            },
            &thresholds(),
        );
        assert_eq!(assessment.level, CongestionLevel::Yellow);
    }

    #[test]
    fn rtt_alone_never_reds() {
        let assessment = assess(
            &Signals {
                rtt_delta_ewma_ms: 80.0,
                cake_drops_delta: 0,
                queued_packets: 0.0,
            },
            &thresholds(),
        );
        assert_eq!(assessment.level, CongestionLevel::Yellow);
    }

    #[test]
    fn drops_without_queue_depth_never_reds() {
        let assessment = assess(
            &Signals {
                rtt_delta_ewma_ms: 30.0,
                cake_drops_delta: 50,
                queued_packets: 10.0,
            },
            &thresholds(),
        );
        assert_eq!(assessment.level, CongestionLevel::Yellow);
    }

    // ─── YELLOW ─────────────────────────────────────────────────────────

    #[test]
    fn queue_depth_alone_is_yellow() {
        let assessment = assess(
            &Signals {
                rtt_delta_ewma_ms: 2.0,
                cake_drops_delta: 0,
                queued_packets: 60.0,
            },
            &thresholds(),
        );
        assert_eq!(assessment.level, CongestionLevel::Yellow);
        assert_eq!(assessment.confidence, 25, "queue-only YELLOW is low confidence");
    }

    #[test]
    fn yellow_confidence_stays_within_band() {
        for rtt in [15.5, 17.0, 19.0, 40.0] {
            let assessment = assess(
                &Signals {
                    rtt_delta_ewma_ms: rtt,
                    cake_drops_delta: 0,
                    queued_packets: 0.0,
                },
                &thresholds(),
            );
            assert_eq!(assessment.level, CongestionLevel::Yellow);
            assert!(
                (25..=50).contains(&assessment.confidence),
                "rtt {rtt}: confidence {}",
                assessment.confidence
            );
        }
    }

    // ─── GREEN ──────────────────────────────────────────────────────────

    #[test]
    fn quiet_link_is_green() {
        let assessment = assess(
            &Signals {
                rtt_delta_ewma_ms: 1.5,
                cake_drops_delta: 0,
                queued_packets: 3.0,
            },
            &thresholds(),
        );
        assert_eq!(assessment.level, CongestionLevel::Green);
        assert_eq!(assessment.confidence, 0);
    }

    #[test]
    fn boundary_rtt_is_not_yellow() {
        // Exactly at the yellow threshold: strictly-greater comparison.
        let assessment = assess(
            &Signals {
                rtt_delta_ewma_ms: 15.0,
                cake_drops_delta: 0,
                queued_packets: 0.0,
            },
            &thresholds(),
        );
        assert_eq!(assessment.level, CongestionLevel::Green);
    }
}
