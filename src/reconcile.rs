//! Commanded-vs-measured level reconciliation.
//!
//! When a source instrument hits its compliance limit it silently clips the
//! level it actually drives, and the measured source values stop tracking
//! the commanded ladder. For plotting and export consistency the record
//! should then carry the *commanded* intention, while the measured values
//! stay untouched everywhere else.
//!
//! The substitution is sticky: once the first deviating point is found, the
//! commanded value is used for the entire remaining tail, even if later
//! points individually fall back inside tolerance. A clipped instrument
//! often alternates between clamped and correct-looking readings; treating
//! the whole divergent tail uniformly keeps adjacent runs comparable.

use serde::{Deserialize, Serialize};

use crate::config::Tuning;

/// Result of one reconciliation pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reconciliation {
    /// Measured levels with the divergent tail replaced by commanded ones.
    pub corrected: Vec<f64>,
    /// True when any point deviated beyond tolerance.
    pub adjusted: bool,
    /// Index of the first deviating point, when one was found.
    pub stuck_index: Option<usize>,
}

/// Reconcile a measured level sequence against its commanded ladder.
///
/// The tolerance scales with the sweep's nominal granularity: `base_step` is
/// the minimum non-zero spacing between consecutive commanded levels, which
/// stays meaningful even across a non-uniform ladder (e.g. a clamped final
/// step). Measured points beyond the commanded length pass through
/// unmodified.
pub fn reconcile(commanded: &[f64], measured: &[f64], tuning: &Tuning) -> Reconciliation {
    if commanded.is_empty() || measured.is_empty() {
        return Reconciliation {
            corrected: measured.to_vec(),
            adjusted: false,
            stuck_index: None,
        };
    }

    let length = commanded.len().min(measured.len());
    let base_step = commanded[..length]
        .windows(2)
        .map(|pair| (pair[1] - pair[0]).abs())
        .filter(|delta| *delta > 1e-12)
        .fold(f64::INFINITY, f64::min);
    let base_step = if base_step.is_finite() { base_step } else { 0.0 };
    let tolerance = tuning.clip_tolerance(base_step);

    let mut corrected = Vec::with_capacity(measured.len());
    let mut stuck_index: Option<usize> = None;
    for idx in 0..length {
        if stuck_index.is_none() && (commanded[idx] - measured[idx]).abs() > tolerance {
            stuck_index = Some(idx);
        }
        corrected.push(if stuck_index.is_none() {
            measured[idx]
        } else {
            commanded[idx]
        });
    }
    corrected.extend_from_slice(&measured[length..]);

    Reconciliation {
        corrected,
        adjusted: stuck_index.is_some(),
        stuck_index,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_sequences_pass_through() {
        let commanded = vec![0.0, 1.0, 2.0, 3.0, 4.0];
        let result = reconcile(&commanded, &commanded, &Tuning::default());
        assert_eq!(result.corrected, commanded);
        assert!(!result.adjusted);
        assert_eq!(result.stuck_index, None);
    }

    #[test]
    fn clipped_tail_is_replaced_stickily() {
        let commanded = vec![0.0, 1.0, 2.0, 3.0, 4.0];
        let measured = vec![0.0, 1.0, 2.0, 2.0, 2.0];
        let result = reconcile(&commanded, &measured, &Tuning::default());
        // First deviation at index 3; commanded substituted from there on.
        assert_eq!(result.corrected, vec![0.0, 1.0, 2.0, 3.0, 4.0]);
        assert!(result.adjusted);
        assert_eq!(result.stuck_index, Some(3));
    }

    #[test]
    fn recovery_after_first_deviation_is_ignored() {
        let commanded = vec![0.0, 1.0, 2.0, 3.0, 4.0];
        // Point 3 looks fine again, but the tail stays commanded.
        let measured = vec![0.0, 1.0, 2.5, 3.0, 2.5];
        let result = reconcile(&commanded, &measured, &Tuning::default());
        assert_eq!(result.stuck_index, Some(2));
        assert_eq!(result.corrected, vec![0.0, 1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn sub_tolerance_noise_is_kept_as_measured() {
        let commanded = vec![0.0, 0.1, 0.2, 0.3];
        let measured = vec![0.0001, 0.1001, 0.1999, 0.3001];
        let result = reconcile(&commanded, &measured, &Tuning::default());
        assert_eq!(result.corrected, measured);
        assert!(!result.adjusted);
    }

    #[test]
    fn extra_measured_points_pass_through() {
        let commanded = vec![0.0, 1.0];
        let measured = vec![0.0, 1.0, 7.7, 8.8];
        let result = reconcile(&commanded, &measured, &Tuning::default());
        assert_eq!(result.corrected, vec![0.0, 1.0, 7.7, 8.8]);
        assert!(!result.adjusted);
    }

    #[test]
    fn tolerance_floor_applies_for_flat_ladders() {
        // A single-level ladder has no non-zero spacing; the absolute floor
        // keeps the comparison meaningful.
        let commanded = vec![0.5, 0.5, 0.5];
        let measured = vec![0.5, 0.5000005, 0.6];
        let result = reconcile(&commanded, &measured, &Tuning::default());
        assert_eq!(result.stuck_index, Some(2));
        assert_eq!(result.corrected, vec![0.5, 0.5000005, 0.5]);
    }

    #[test]
    fn empty_inputs_yield_empty_output() {
        let result = reconcile(&[], &[1.0], &Tuning::default());
        assert_eq!(result.corrected, vec![1.0]);
        let result = reconcile(&[1.0], &[], &Tuning::default());
        assert!(result.corrected.is_empty());
    }
}
