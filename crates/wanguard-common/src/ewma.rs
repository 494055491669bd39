//! Guarded exponential smoothing.
//!
//! Every smoothed signal in the controllers (baseline RTT, load RTT, RTT
//! delta, queue occupancy) flows through [`ewma`]. The guards are strict on
//! purpose: a single NaN or absurd sample leaking into a persisted EWMA
//! would poison the control loop for hours, so out-of-range inputs are errors
//! and the caller keeps the previous value for that cycle.

use thiserror::Error;

/// Bound for RTT-derived signals, in milliseconds.
pub const MAX_ABS_RTT_MS: f64 = 1000.0;

/// Bound for count-derived signals (queue depths, drop deltas).
pub const MAX_ABS_COUNT: f64 = 1.0e9;

#[derive(Debug, Error, PartialEq)]
pub enum EwmaError {
    #[error("alpha {0} is outside [0, 1]")]
    AlphaOutOfRange(f64),
    #[error("sample {0} is not finite")]
    SampleNotFinite(f64),
    #[error("sample {sample} exceeds bound {bound}")]
    SampleOutOfBounds { sample: f64, bound: f64 },
    #[error("smoothed result is not finite")]
    ResultNotFinite,
}

/// One step of `(1 - alpha) * previous + alpha * sample`.
///
/// `previous == 0.0` is the uninitialized sentinel: the sample is adopted
/// directly so a cold EWMA does not spend its first minutes climbing from
/// zero.
pub fn ewma(previous: f64, sample: f64, alpha: f64, max_abs: f64) -> Result<f64, EwmaError> {
    if !(0.0..=1.0).contains(&alpha) || !alpha.is_finite() {
        return Err(EwmaError::AlphaOutOfRange(alpha));
    }
    if !sample.is_finite() {
        return Err(EwmaError::SampleNotFinite(sample));
    }
    if sample.abs() > max_abs {
        return Err(EwmaError::SampleOutOfBounds {
            sample,
            bound: max_abs,
        });
    }
    if previous == 0.0 {
        return Ok(sample);
    }
    let next = (1.0 - alpha) * previous + alpha * sample;
    if !next.is_finite() {
        return Err(EwmaError::ResultNotFinite);
    }
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;

    // ─── Guards ─────────────────────────────────────────────────────────

    #[test]
    fn rejects_alpha_outside_unit_interval() {
        assert_eq!(
            ewma(10.0, 12.0, -0.1, MAX_ABS_RTT_MS),
            Err(EwmaError::AlphaOutOfRange(-0.1))
        );
        assert_eq!(
            ewma(10.0, 12.0, 1.5, MAX_ABS_RTT_MS),
            Err(EwmaError::AlphaOutOfRange(1.5))
        );
        assert!(ewma(10.0, 12.0, f64::NAN, MAX_ABS_RTT_MS).is_err());
    }

    #[test]
    fn rejects_non_finite_sample() {
        assert!(ewma(10.0, f64::NAN, 0.5, MAX_ABS_RTT_MS).is_err());
        assert!(ewma(10.0, f64::INFINITY, 0.5, MAX_ABS_RTT_MS).is_err());
    }

    #[test]
    fn rejects_sample_beyond_bound() {
        assert_eq!(
            ewma(10.0, 1200.0, 0.5, MAX_ABS_RTT_MS),
            Err(EwmaError::SampleOutOfBounds {
                sample: 1200.0,
                bound: MAX_ABS_RTT_MS
            })
        );
        // The same magnitude is fine under the count bound.
        assert!(ewma(10.0, 1200.0, 0.5, MAX_ABS_COUNT).is_ok());
    }

    // ─── Smoothing Behavior ─────────────────────────────────────────────

    #[test]
    fn alpha_zero_keeps_previous() {
        assert_eq!(ewma(24.0, 80.0, 0.0, MAX_ABS_RTT_MS), Ok(24.0));
    }

    #[test]
    fn alpha_one_adopts_sample() {
        assert_eq!(ewma(24.0, 80.0, 1.0, MAX_ABS_RTT_MS), Ok(80.0));
    }

    #[test]
    fn uninitialized_previous_adopts_sample() {
        assert_eq!(ewma(0.0, 31.5, 0.1, MAX_ABS_RTT_MS), Ok(31.5));
    }

    #[test]
    fn output_stays_between_previous_and_sample() {
        let prev = 20.0;
        let sample = 50.0;
        for alpha in [0.05, 0.25, 0.5, 0.9] {
            let out = ewma(prev, sample, alpha, MAX_ABS_RTT_MS).unwrap();
            assert!(out >= prev && out <= sample, "alpha={alpha} out={out}");
        }
    }

    #[test]
    fn converges_to_constant_input() {
        let mut value = 24.0;
        for _ in 0..500 {
            value = ewma(value, 54.0, 0.1, MAX_ABS_RTT_MS).unwrap();
        }
        assert!((value - 54.0).abs() < 0.01, "converged to {value}");
    }

    #[test]
    fn fixed_point_is_stable() {
        let value = ewma(42.0, 42.0, 0.3, MAX_ABS_RTT_MS).unwrap();
        assert!((value - 42.0).abs() < f64::EPSILON);
    }
}
