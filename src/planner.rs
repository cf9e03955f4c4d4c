//! Sweep-path planning.
//!
//! A sweep from `start` to `stop` is not executed as one pass. The planner
//! splits it into monotonic [`Segment`]s that each begin or end at zero:
//! first the positive excursion out and back (`0 → P → 0`), then the
//! negative one (`0 → N → 0`). Zero crossings are always segment
//! boundaries, never interior points, which keeps every segment monotonic —
//! the property the reconciliation pass relies on to tell compliance
//! clipping apart from measurement noise.
//!
//! Ladder generation clamps the final step so a segment lands exactly on its
//! stop level, and terminates on an epsilon proportional to the step so
//! floating-point drift can never produce an unbounded loop.

use serde::{Deserialize, Serialize};

use crate::config::Tuning;
use crate::error::{SweepError, SweepResult};

/// Sense wiring selection for the measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WiringMode {
    /// Two-wire (local) sense.
    TwoWire,
    /// Four-wire (remote) sense.
    FourWire,
}

impl Default for WiringMode {
    fn default() -> Self {
        WiringMode::FourWire
    }
}

/// User-facing sweep request.
///
/// Create one, then call [`SweepParameters::normalized`] before handing it to
/// the planner; normalization is where the hard input errors surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepParameters {
    /// First commanded level of the sweep range.
    pub start_level: f64,
    /// Last commanded level of the sweep range.
    pub stop_level: f64,
    /// Magnitude of one step. Sign is derived per segment, not stored.
    pub step_magnitude: f64,
    /// Compliance limit handed to the instrument.
    pub compliance_limit: f64,
    /// Integration time per point, in power-line cycles.
    pub integration_time: f64,
    /// Settling delay after each source change, in seconds.
    pub settle_time: f64,
    /// Number of complete repetitions of the planned path.
    pub total_runs: u32,
    /// Sense wiring applied before the first run.
    pub wiring_mode: WiringMode,
}

impl SweepParameters {
    /// Validate and normalize the request.
    ///
    /// A zero step magnitude is a hard error — it can never be stepped to a
    /// target and must fail before any channel I/O. The remaining fields are
    /// clamped the way the instrument would accept them: compliance as a
    /// magnitude, integration time to a usable minimum, settle time to
    /// non-negative.
    pub fn normalized(&self) -> SweepResult<SweepParameters> {
        if self.step_magnitude == 0.0 || !self.step_magnitude.is_finite() {
            return Err(SweepError::PlannerInput(
                "step magnitude must be non-zero and finite".into(),
            ));
        }
        if !self.start_level.is_finite() || !self.stop_level.is_finite() {
            return Err(SweepError::PlannerInput(
                "start and stop levels must be finite".into(),
            ));
        }
        if self.total_runs < 1 {
            return Err(SweepError::PlannerInput(
                "total runs must be at least 1".into(),
            ));
        }
        Ok(SweepParameters {
            step_magnitude: self.step_magnitude.abs(),
            compliance_limit: self.compliance_limit.abs(),
            integration_time: self.integration_time.max(0.001),
            settle_time: self.settle_time.max(0.0),
            ..self.clone()
        })
    }
}

/// One monotonic leg of the planned path.
///
/// Invariant: the sign of `step_signed` matches `stop_level - start_level`,
/// and the segment never crosses zero internally.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    /// Level the segment starts from.
    pub start_level: f64,
    /// Level the segment ends on.
    pub stop_level: f64,
    /// Signed step applied per point.
    pub step_signed: f64,
}

impl Segment {
    /// Generate the commanded level ladder for this segment.
    ///
    /// The running level advances by `step_signed` until it reaches
    /// `stop_level`; an overshooting final step is clamped onto the stop so
    /// the ladder lands there exactly. Iteration ends once the level is
    /// within `epsilon` of the target.
    pub fn levels(&self, epsilon: f64) -> Vec<f64> {
        let mut levels = vec![self.start_level];
        if self.step_signed.abs() <= epsilon {
            return levels;
        }
        let ascending = self.step_signed > 0.0;
        let mut current = self.start_level;
        loop {
            let mut next = current + self.step_signed;
            if ascending && next > self.stop_level + epsilon {
                next = self.stop_level;
            } else if !ascending && next < self.stop_level - epsilon {
                next = self.stop_level;
            }
            if (next - current).abs() <= epsilon {
                break;
            }
            levels.push(next);
            current = next;
            if (current - self.stop_level).abs() <= epsilon {
                break;
            }
        }
        levels
    }
}

/// Planner output: the ordered segments and the full commanded path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepPlan {
    /// Segments in execution order.
    pub segments: Vec<Segment>,
    /// Concatenation of every segment's level ladder, in order. Its length
    /// matches the number of source-level commands the sweep will issue.
    pub commanded_path: Vec<f64>,
    /// Ladder length per segment; sums to `commanded_path.len()`.
    pub points_per_segment: Vec<usize>,
}

impl SweepPlan {
    /// Number of commanded points over the whole path.
    pub fn point_count(&self) -> usize {
        self.commanded_path.len()
    }

    /// The commanded ladder slice belonging to segment `index`.
    pub fn commanded_slice(&self, index: usize) -> &[f64] {
        let start: usize = self.points_per_segment[..index].iter().sum();
        let end = start + self.points_per_segment[index];
        &self.commanded_path[start..end]
    }
}

/// Plan the segment sequence for `params`.
///
/// `params` must already be normalized; a zero step is rejected here as well
/// so the invariant cannot be bypassed.
pub fn plan(params: &SweepParameters, tuning: &Tuning) -> SweepResult<SweepPlan> {
    let params = params.normalized()?;
    let step = params.step_magnitude;
    let epsilon = tuning.level_epsilon(step);

    let mut segments: Vec<Segment> = Vec::new();
    let mut commanded_path: Vec<f64> = Vec::new();
    let mut points_per_segment: Vec<usize> = Vec::new();

    let append_segment = |from: f64,
                              to: f64,
                              segments: &mut Vec<Segment>,
                              path: &mut Vec<f64>,
                              points: &mut Vec<usize>| {
        if (from - to).abs() <= epsilon {
            return;
        }
        let step_signed = if to >= from { step } else { -step };
        let segment = Segment {
            start_level: from,
            stop_level: to,
            step_signed,
        };
        let ladder = segment.levels(epsilon);
        points.push(ladder.len());
        path.extend(ladder);
        segments.push(segment);
    };

    let positive_target = params.start_level.max(params.stop_level).max(0.0);
    let negative_target = params.start_level.min(params.stop_level).min(0.0);

    if positive_target > epsilon {
        append_segment(
            0.0,
            positive_target,
            &mut segments,
            &mut commanded_path,
            &mut points_per_segment,
        );
        append_segment(
            positive_target,
            0.0,
            &mut segments,
            &mut commanded_path,
            &mut points_per_segment,
        );
    }
    if negative_target < -epsilon {
        append_segment(
            0.0,
            negative_target,
            &mut segments,
            &mut commanded_path,
            &mut points_per_segment,
        );
        append_segment(
            negative_target,
            0.0,
            &mut segments,
            &mut commanded_path,
            &mut points_per_segment,
        );
    }

    // Degenerate range (start and stop both at zero): one direct segment.
    if segments.is_empty() {
        let step_signed = if params.stop_level >= params.start_level {
            step
        } else {
            -step
        };
        let segment = Segment {
            start_level: params.start_level,
            stop_level: params.stop_level,
            step_signed,
        };
        commanded_path = segment.levels(epsilon);
        points_per_segment.push(commanded_path.len());
        segments.push(segment);
    }

    if commanded_path.is_empty() {
        commanded_path.push(0.0);
        if let Some(last) = points_per_segment.last_mut() {
            *last += 1;
        } else {
            points_per_segment.push(1);
        }
    }

    Ok(SweepPlan {
        segments,
        commanded_path,
        points_per_segment,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(start: f64, stop: f64, step: f64) -> SweepParameters {
        SweepParameters {
            start_level: start,
            stop_level: stop,
            step_magnitude: step,
            compliance_limit: 0.5,
            integration_time: 1.0,
            settle_time: 0.01,
            total_runs: 1,
            wiring_mode: WiringMode::FourWire,
        }
    }

    #[test]
    fn zero_step_is_rejected_fast() {
        let result = plan(&params(-1.0, 1.0, 0.0), &Tuning::default());
        assert!(matches!(result, Err(SweepError::PlannerInput(_))));
    }

    #[test]
    fn bipolar_sweep_emits_four_segments() {
        let plan = plan(&params(-4.0, 4.0, 0.1), &Tuning::default()).expect("plan");
        assert_eq!(plan.segments.len(), 4);
        assert_eq!(plan.segments[0].start_level, 0.0);
        assert_eq!(plan.segments[0].stop_level, 4.0);
        assert_eq!(plan.segments[1].stop_level, 0.0);
        assert_eq!(plan.segments[2].stop_level, -4.0);
        assert_eq!(plan.segments[3].stop_level, 0.0);
        // 41 points per leg, four legs.
        assert_eq!(plan.point_count(), 164);
    }

    #[test]
    fn path_returns_to_zero() {
        let tuning = Tuning::default();
        for (start, stop, step) in [(-4.0, 4.0, 0.1), (1.0, 2.0, 0.25), (-3.0, -1.0, 0.7)] {
            let plan = plan(&params(start, stop, step), &tuning).expect("plan");
            let eps = tuning.level_epsilon(step);
            let first = plan.commanded_path.first().copied().unwrap_or(f64::NAN);
            let last = plan.commanded_path.last().copied().unwrap_or(f64::NAN);
            assert!(first.abs() <= eps, "path starts at {first}");
            assert!(last.abs() <= eps, "path ends at {last}");
        }
    }

    #[test]
    fn ladders_are_monotonic_and_never_overshoot() {
        let tuning = Tuning::default();
        let plan = plan(&params(-4.0, 4.0, 0.3), &tuning).expect("plan");
        for segment in &plan.segments {
            let ladder = segment.levels(tuning.level_epsilon(segment.step_signed.abs()));
            let direction = segment.step_signed.signum();
            for pair in ladder.windows(2) {
                let delta = (pair[1] - pair[0]) * direction;
                assert!(delta > 0.0, "ladder not monotonic: {pair:?}");
                assert!(
                    delta <= segment.step_signed.abs() + 1e-9,
                    "ladder skipped more than one step: {pair:?}"
                );
            }
            let last = ladder.last().copied().unwrap_or(f64::NAN);
            assert!((last - segment.stop_level).abs() < 1e-9);
        }
    }

    #[test]
    fn final_step_clamps_onto_stop() {
        let segment = Segment {
            start_level: 0.0,
            stop_level: 1.0,
            step_signed: 0.3,
        };
        let ladder = segment.levels(Tuning::default().level_epsilon(0.3));
        assert_eq!(ladder.len(), 5);
        assert_eq!(ladder[4], 1.0);
    }

    #[test]
    fn one_sided_sweep_still_round_trips_through_zero() {
        let plan = plan(&params(1.0, 2.0, 0.5), &Tuning::default()).expect("plan");
        assert_eq!(plan.segments.len(), 2);
        assert_eq!(plan.segments[0].stop_level, 2.0);
        assert_eq!(plan.segments[1].start_level, 2.0);
        assert_eq!(plan.segments[1].stop_level, 0.0);
    }

    #[test]
    fn degenerate_zero_range_yields_single_point() {
        let plan = plan(&params(0.0, 0.0, 0.1), &Tuning::default()).expect("plan");
        assert_eq!(plan.segments.len(), 1);
        assert_eq!(plan.commanded_path, vec![0.0]);
    }

    #[test]
    fn negative_step_input_is_normalized() {
        let normalized = params(0.0, 1.0, -0.25).normalized().expect("normalize");
        assert_eq!(normalized.step_magnitude, 0.25);
    }
}
