//! Progress reporting from the sweep worker to the presentation layer.
//!
//! The worker thread owns the live [`RunRecord`]s and keeps mutating them
//! after every dispatch, so nothing mutable ever crosses the thread
//! boundary: each update is a deep-copied [`SweepSnapshot`] pushed onto a
//! bounded single-producer/single-consumer queue.
//!
//! Per-point events are cosmetic and lossy under backpressure (the drop
//! count is logged). Segment snapshots and the terminal
//! `Completed`/`Failed`/`Cancelled` events are delivered losslessly on the
//! same queue, so a consumer polling for progress can never miss a failure.

use std::sync::mpsc::{Receiver, SyncSender, TrySendError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::executor::MeasurementPair;

/// Plot color cycle for successive runs.
pub const RUN_COLORS: [&str; 10] = [
    "tab:blue",
    "tab:orange",
    "tab:green",
    "tab:red",
    "tab:purple",
    "tab:brown",
    "tab:pink",
    "tab:gray",
    "tab:olive",
    "tab:cyan",
];

/// Color tag for a 1-based run index.
pub fn color_for_run(run_index: u32) -> &'static str {
    RUN_COLORS[((run_index as usize).saturating_sub(1)) % RUN_COLORS.len()]
}

/// Where the sweep currently is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SweepState {
    /// No sweep in progress.
    Idle,
    /// Parameters are being validated and planned.
    Planning,
    /// Plan accepted; wiring mode being applied.
    Armed,
    /// A segment is executing (0-based indices).
    RunningSegment {
        /// Current run.
        run: u32,
        /// Current segment within the run.
        segment: usize,
    },
    /// A finished segment is being reconciled.
    ReconcilingSegment {
        /// Current run.
        run: u32,
        /// Current segment within the run.
        segment: usize,
    },
    /// All runs finished.
    Complete,
    /// Terminated by the cancellation token.
    Cancelled,
    /// Terminated by a failure.
    Failed,
}

/// The accumulated record of one run.
///
/// Owned exclusively by the worker thread while the run executes; frozen at
/// run end (or failure) and only ever handed out as part of a deep-copied
/// snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    /// 1-based run number.
    pub run_index: u32,
    /// Levels as the instrument measured them.
    pub measured_levels: Vec<f64>,
    /// Responses paired with `measured_levels`.
    pub measured_responses: Vec<f64>,
    /// Levels after reconciliation against the commanded ladder.
    pub corrected_levels: Vec<f64>,
    /// Non-numeric instrument output, verbatim.
    pub raw_output_lines: Vec<String>,
    /// Number of points collected so far.
    pub point_count: usize,
    /// Plot color for this run.
    pub color_tag: String,
    /// True when reconciliation replaced any measured level.
    pub adjusted: bool,
    /// True when any segment's buffer readback disagreed with live data.
    pub buffer_mismatch: bool,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the run finished (or was finalized early).
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunRecord {
    /// Open a fresh record for a 1-based run index.
    pub fn begin(run_index: u32) -> Self {
        Self {
            run_index,
            measured_levels: Vec::new(),
            measured_responses: Vec::new(),
            corrected_levels: Vec::new(),
            raw_output_lines: Vec::new(),
            point_count: 0,
            color_tag: color_for_run(run_index).to_string(),
            adjusted: false,
            buffer_mismatch: false,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Freeze the record. Idempotent.
    pub fn finish(&mut self) {
        if self.finished_at.is_none() {
            self.finished_at = Some(Utc::now());
        }
    }
}

/// Immutable view of every run so far.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepSnapshot {
    /// Lifecycle position at snapshot time.
    pub state: SweepState,
    /// Deep copies of all run records, finished and in-flight.
    pub runs: Vec<RunRecord>,
}

/// Events emitted by the sweep worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SweepEvent {
    /// The worker thread accepted the plan and is starting.
    Started {
        /// Number of runs that will execute.
        total_runs: u32,
        /// Commanded points per run.
        points_per_run: usize,
    },
    /// One live-parsed measurement point (lossy under backpressure).
    Point {
        /// 1-based run the point belongs to.
        run_index: u32,
        /// The measured pair.
        pair: MeasurementPair,
    },
    /// Deep-copied state after a segment completed.
    Snapshot(SweepSnapshot),
    /// The sweep finished every run.
    Completed(SweepSnapshot),
    /// The sweep was cancelled; partial results attached.
    Cancelled(SweepSnapshot),
    /// The sweep failed; partial results attached.
    Failed {
        /// Human-readable failure description.
        error: String,
        /// Records finalized up to the failure.
        partial: SweepSnapshot,
    },
}

impl SweepEvent {
    /// True for `Completed`, `Cancelled` and `Failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SweepEvent::Completed(_) | SweepEvent::Cancelled(_) | SweepEvent::Failed { .. }
        )
    }
}

/// Worker-side handle of the progress queue.
pub struct ProgressReporter {
    tx: SyncSender<SweepEvent>,
    dropped_points: u64,
}

impl ProgressReporter {
    /// Create a bounded progress queue; returns the worker-side reporter and
    /// the consumer-side receiver.
    pub fn channel(capacity: usize) -> (Self, Receiver<SweepEvent>) {
        let (tx, rx) = std::sync::mpsc::sync_channel(capacity.max(1));
        (
            Self {
                tx,
                dropped_points: 0,
            },
            rx,
        )
    }

    /// Emit a per-point event. Dropped silently when the queue is full.
    pub fn point(&mut self, run_index: u32, pair: MeasurementPair) {
        match self.tx.try_send(SweepEvent::Point { run_index, pair }) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                if self.dropped_points == 0 {
                    warn!("progress queue full; dropping per-point events");
                }
                self.dropped_points += 1;
            }
            Err(TrySendError::Disconnected(_)) => {
                debug!("progress consumer gone; dropping per-point event");
            }
        }
    }

    /// Emit a must-deliver event, blocking while the queue is full. A
    /// disconnected consumer is logged, not an error — the sweep itself
    /// keeps going.
    pub fn send(&self, event: SweepEvent) {
        if self.tx.send(event).is_err() {
            debug!("progress consumer gone; event discarded");
        }
    }

    /// Per-point events dropped so far because the queue was full.
    pub fn dropped_points(&self) -> u64 {
        self.dropped_points
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn colors_cycle_per_run() {
        assert_eq!(color_for_run(1), "tab:blue");
        assert_eq!(color_for_run(10), "tab:cyan");
        assert_eq!(color_for_run(11), "tab:blue");
    }

    #[test]
    fn points_are_lossy_but_counted() {
        let (mut reporter, rx) = ProgressReporter::channel(1);
        let pair = MeasurementPair {
            level: 1.0,
            response: 0.001,
        };
        reporter.point(1, pair);
        reporter.point(1, pair); // queue full, dropped
        assert_eq!(reporter.dropped_points(), 1);
        assert!(matches!(rx.recv(), Ok(SweepEvent::Point { .. })));
    }

    #[test]
    fn terminal_events_are_identified() {
        let snapshot = SweepSnapshot {
            state: SweepState::Complete,
            runs: vec![],
        };
        assert!(SweepEvent::Completed(snapshot.clone()).is_terminal());
        assert!(!SweepEvent::Snapshot(snapshot).is_terminal());
    }

    #[test]
    fn run_record_freeze_is_idempotent() {
        let mut record = RunRecord::begin(1);
        assert!(record.finished_at.is_none());
        record.finish();
        let first = record.finished_at;
        record.finish();
        assert_eq!(record.finished_at, first);
    }
}
