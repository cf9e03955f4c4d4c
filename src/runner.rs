//! Sweep orchestration.
//!
//! [`SweepRunner::start`] validates and plans synchronously — planner input
//! errors surface to the caller before any thread exists or any channel I/O
//! happens — then moves the channel grant onto a dedicated worker thread.
//! The worker executes runs and segments strictly in planner order: a
//! segment fully completes, buffer readback included, before the next one
//! starts, and run *n+1* never begins before run *n* has finished.
//!
//! Every exit path — completion, failure, cancellation — finalizes whatever
//! [`RunRecord`]s exist, writes the best-effort output-off sequence, and
//! returns the channel to the arbiter. The safe-off and release steps must
//! not crash the failure path themselves: their errors are logged and
//! swallowed.

use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::{error, info, warn};

use crate::cancel::CancelToken;
use crate::channel::Channel;
use crate::config::Tuning;
use crate::error::{SweepError, SweepResult};
use crate::executor::{run_segment, CommandSet, SegmentRequest};
use crate::planner::{plan, SweepParameters, SweepPlan};
use crate::progress::{ProgressReporter, RunRecord, SweepEvent, SweepSnapshot, SweepState};
use crate::reconcile::reconcile;
use crate::session::{SessionArbiter, SweepGrant};

/// Control handle for an in-flight sweep.
pub struct SweepHandle {
    cancel: CancelToken,
    join: Option<JoinHandle<()>>,
}

impl SweepHandle {
    /// Request cooperative cancellation. Idempotent; the worker reacts
    /// within one poll timeout.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// A clone of the sweep's cancellation token.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Block until the worker thread exits.
    pub fn join(mut self) {
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                error!("sweep worker panicked");
            }
        }
    }

    /// True once the worker thread has exited.
    pub fn is_finished(&self) -> bool {
        self.join.as_ref().map_or(true, JoinHandle::is_finished)
    }
}

/// Entry point for running sweeps.
pub struct SweepRunner;

impl SweepRunner {
    /// Validate `params`, plan the path, and start the worker thread.
    ///
    /// Returns the control handle and the consumer end of the progress
    /// queue. [`SweepError::PlannerInput`] and configuration problems are
    /// returned synchronously — and the channel grant goes straight back to
    /// the arbiter in that case. From then on all outcomes arrive as
    /// [`SweepEvent`]s.
    pub fn start(
        params: &SweepParameters,
        grant: SweepGrant,
        arbiter: Arc<SessionArbiter>,
        commands: Arc<CommandSet>,
        tuning: Tuning,
    ) -> SweepResult<(SweepHandle, Receiver<SweepEvent>)> {
        let planned = tuning
            .validate()
            .and_then(|()| params.normalized())
            .and_then(|params| plan(&params, &tuning).map(|plan| (params, plan)));
        let (params, plan) = match planned {
            Ok(planned) => planned,
            Err(err) => {
                // No I/O has happened; hand the untouched channel back so a
                // bad parameter set does not cost the listener its session.
                if let Err(release_err) = arbiter.release_from_sweep(grant, &commands, &tuning) {
                    error!(%release_err, "failed to return channel after rejected start");
                }
                return Err(err);
            }
        };
        info!(
            runs = params.total_runs,
            segments = plan.segments.len(),
            points = plan.point_count(),
            "sweep planned"
        );

        let (reporter, receiver) = ProgressReporter::channel(tuning.progress_queue_capacity);
        let cancel = CancelToken::new();
        let worker = Worker {
            params,
            plan,
            commands,
            tuning,
            cancel: cancel.clone(),
            reporter,
            records: Vec::new(),
        };
        let join = std::thread::Builder::new()
            .name("sweep-worker".to_string())
            .spawn(move || worker.run(grant, arbiter))
            .map_err(|err| SweepError::Worker(err.to_string()))?;

        Ok((
            SweepHandle {
                cancel,
                join: Some(join),
            },
            receiver,
        ))
    }
}

struct Worker {
    params: SweepParameters,
    plan: SweepPlan,
    commands: Arc<CommandSet>,
    tuning: Tuning,
    cancel: CancelToken,
    reporter: ProgressReporter,
    records: Vec<RunRecord>,
}

impl Worker {
    fn run(mut self, mut grant: SweepGrant, arbiter: Arc<SessionArbiter>) {
        self.reporter.send(SweepEvent::Started {
            total_runs: self.params.total_runs,
            points_per_run: self.plan.point_count(),
        });

        let outcome = self.execute(grant.channel());

        for record in &mut self.records {
            record.finish();
        }
        if self.reporter.dropped_points() > 0 {
            warn!(
                dropped = self.reporter.dropped_points(),
                "per-point progress events were dropped under backpressure"
            );
        }

        // Leave the source in a safe state no matter how the sweep ended.
        // Failures here are logged, never re-raised.
        safe_off(grant.channel(), &self.commands);

        if let Err(err) = arbiter.release_from_sweep(grant, &self.commands, &self.tuning) {
            error!(%err, "failed to return channel to listener");
        }

        let event = match outcome {
            Ok(()) => {
                info!("sweep complete");
                SweepEvent::Completed(self.snapshot(SweepState::Complete))
            }
            Err(SweepError::Cancelled) => {
                info!("sweep cancelled");
                SweepEvent::Cancelled(self.snapshot(SweepState::Cancelled))
            }
            Err(err) => {
                error!(%err, "sweep failed");
                SweepEvent::Failed {
                    error: err.to_string(),
                    partial: self.snapshot(SweepState::Failed),
                }
            }
        };
        self.reporter.send(event);
    }

    fn execute(&mut self, channel: &mut dyn Channel) -> SweepResult<()> {
        for command in self.commands.wiring(self.params.wiring_mode) {
            channel.write_line(command)?;
        }

        for run in 1..=self.params.total_runs {
            self.cancel.check()?;
            let mut record = RunRecord::begin(run);
            let result = self.run_single(channel, run, &mut record);
            self.records.push(record);
            result?;
            if let Some(record) = self.records.last_mut() {
                record.finish();
            }
        }
        Ok(())
    }

    fn run_single(
        &mut self,
        channel: &mut dyn Channel,
        run: u32,
        record: &mut RunRecord,
    ) -> SweepResult<()> {
        let commands = Arc::clone(&self.commands);
        let tuning = self.tuning.clone();
        let cancel = self.cancel.clone();
        let segments = self.plan.segments.clone();

        for (segment_index, segment) in segments.iter().enumerate() {
            cancel.check()?;
            let request = SegmentRequest {
                command: commands.render_segment(segment, &self.params)?,
                marker: commands.render_marker(run as usize - 1, segment_index)?,
            };
            record.raw_output_lines.push(format!(
                "# run {} segment {}: {} -> {}",
                run,
                segment_index + 1,
                segment.start_level,
                segment.stop_level
            ));

            let output = run_segment(channel, &commands, &tuning, &cancel, &request, |pair| {
                self.reporter.point(run, *pair);
            })?;

            let commanded = self.plan.commanded_slice(segment_index);
            let measured_levels: Vec<f64> = output.pairs.iter().map(|p| p.level).collect();
            let measured_responses: Vec<f64> = output.pairs.iter().map(|p| p.response).collect();
            let reconciliation = reconcile(commanded, &measured_levels, &tuning);

            record.measured_levels.extend(&measured_levels);
            record.measured_responses.extend(&measured_responses);
            record.corrected_levels.extend(&reconciliation.corrected);
            record.raw_output_lines.extend(output.printed_lines);
            record.point_count = record.measured_levels.len();
            record.adjusted |= reconciliation.adjusted;
            record.buffer_mismatch |= output.buffer_mismatch;

            let snapshot = snapshot_with(
                &self.records,
                record,
                SweepState::ReconcilingSegment {
                    run,
                    segment: segment_index,
                },
            );
            self.reporter.send(SweepEvent::Snapshot(snapshot));
        }
        Ok(())
    }

    fn snapshot(&self, state: SweepState) -> SweepSnapshot {
        SweepSnapshot {
            state,
            runs: self.records.clone(),
        }
    }
}

/// Deep-copied snapshot of the finished records plus the run in flight.
fn snapshot_with(records: &[RunRecord], current: &RunRecord, state: SweepState) -> SweepSnapshot {
    let mut runs = records.to_vec();
    runs.push(current.clone());
    SweepSnapshot { state, runs }
}

/// Write the output-off sequence, swallowing (but logging) failures.
fn safe_off(channel: &mut dyn Channel, commands: &CommandSet) {
    for command in &commands.output_off {
        if let Err(err) = channel.write_line(command) {
            warn!(%err, %command, "best-effort output-off write failed");
            return;
        }
    }
}
