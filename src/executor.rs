//! Per-segment execution protocol.
//!
//! Executing one [`Segment`](crate::planner::Segment) against the channel is
//! a fixed little dance:
//!
//! 1. write the segment command, then a sentinel echo of the marker token;
//! 2. drain response lines under a shortened poll timeout until the marker
//!    comes back — numeric triplets become live measurement pairs, anything
//!    else is kept verbatim for the log, and a bare timeout just means the
//!    instrument is still sweeping;
//! 3. read the instrument's own buffer back (point count, then the level and
//!    response buffers) and prefer it over the live-parsed data, falling
//!    back to the live pairs when the readback comes up short.
//!
//! The marker embeds run and segment indices so it can never collide with
//! numeric output. Cancellation is checked at the top of every read-loop
//! iteration, which bounds cancellation latency by one poll timeout rather
//! than by segment duration.
//!
//! Instrument vocabulary is data, not code: [`CommandSet`] holds the command
//! templates with named placeholders, and the defaults reproduce the TSP
//! dialect of the source-measure unit this core was built against.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::cancel::CancelToken;
use crate::channel::{parse_float_list, Channel, TimeoutGuard};
use crate::config::Tuning;
use crate::error::{ChannelError, SweepError, SweepResult};
use crate::planner::{Segment, SweepParameters, WiringMode};

/// One live-parsed measurement point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MeasurementPair {
    /// Measured source level.
    pub level: f64,
    /// Measured response (e.g. current for a voltage sweep).
    pub response: f64,
}

/// Everything a single segment execution produced.
#[derive(Debug, Clone, Default)]
pub struct SegmentOutput {
    /// Non-numeric response lines, verbatim, for the log.
    pub printed_lines: Vec<String>,
    /// Measurement pairs, preferring the instrument's buffer readback.
    pub pairs: Vec<MeasurementPair>,
    /// Set when the buffer readback disagreed with (or fell short of) the
    /// live-parsed data. Non-fatal.
    pub buffer_mismatch: bool,
}

/// Command templates for the instrument dialect.
///
/// Templates use `strfmt`-style named placeholders. Overriding individual
/// fields adapts the core to a different instrument family without touching
/// the protocol logic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandSet {
    /// Segment sweep call: `{start} {stop} {step} {ilimit} {nplc} {settle}`.
    pub segment_command: String,
    /// Marker echo: `{marker}`.
    pub marker_echo: String,
    /// Marker token: `{run} {segment}` (1-based).
    pub marker_template: String,
    /// Query for the number of buffered points.
    pub buffer_count_query: String,
    /// Buffer fetch: `{count} {buffer}`.
    pub buffer_fetch: String,
    /// Buffer holding measured source levels.
    pub levels_buffer: String,
    /// Buffer holding measured responses.
    pub responses_buffer: String,
    /// Command sequence selecting two-wire sense.
    pub wiring_two_wire: Vec<String>,
    /// Command sequence selecting four-wire sense.
    pub wiring_four_wire: Vec<String>,
    /// Trigger setup: `{edge} {line} {mode}`.
    pub trigger_setup: String,
    /// Trigger wait: `{timeout} {edge} {line} {mode}`.
    pub trigger_wait: String,
    /// Instrument-side cancellation of a pending trigger wait.
    pub trigger_cancel: String,
    /// Best-effort safe-off sequence written on every sweep exit path.
    pub output_off: Vec<String>,
    /// Cheap exchange used to validate a returned channel.
    pub health_probe: String,
}

impl Default for CommandSet {
    fn default() -> Self {
        Self {
            segment_command: "SweepRun({start}, {stop}, {step}, {ilimit}, {nplc}, {settle})"
                .to_string(),
            marker_echo: "print(\"{marker}\")".to_string(),
            marker_template: "SWEEP_DONE_{run}_{segment}".to_string(),
            buffer_count_query: "print(defbuffer1.n)".to_string(),
            buffer_fetch: "printbuffer(1, {count}, {buffer})".to_string(),
            levels_buffer: "defbuffer1.sourcevalues".to_string(),
            responses_buffer: "defbuffer1.readings".to_string(),
            wiring_two_wire: vec![
                "pcall(function() smu.measure.terminals = smu.TERMINALS_FRONT end)".to_string(),
                "pcall(function() smu.source.terminals = smu.TERMINALS_FRONT end)".to_string(),
                "pcall(function() smu.measure.sense = smu.SENSE_2WIRE end)".to_string(),
            ],
            wiring_four_wire: vec![
                "pcall(function() smu.measure.terminals = smu.TERMINALS_FRONT end)".to_string(),
                "pcall(function() smu.source.terminals = smu.TERMINALS_FRONT end)".to_string(),
                "pcall(function() smu.measure.sense = smu.SENSE_4WIRE end)".to_string(),
            ],
            trigger_setup: "trigger_arm(\"{edge}\", {line}, \"{mode}\")".to_string(),
            trigger_wait: "trigger_wait({timeout}, \"{edge}\", {line}, \"{mode}\")".to_string(),
            trigger_cancel: "trigger_cancel()".to_string(),
            output_off: vec!["smu.source.output = smu.OFF".to_string()],
            health_probe: "print(1)".to_string(),
        }
    }
}

impl CommandSet {
    /// Render the sweep call for one segment.
    pub fn render_segment(
        &self,
        segment: &Segment,
        params: &SweepParameters,
    ) -> SweepResult<String> {
        let vars = HashMap::from([
            ("start".to_string(), segment.start_level.to_string()),
            ("stop".to_string(), segment.stop_level.to_string()),
            ("step".to_string(), segment.step_signed.to_string()),
            ("ilimit".to_string(), params.compliance_limit.to_string()),
            ("nplc".to_string(), params.integration_time.to_string()),
            ("settle".to_string(), params.settle_time.to_string()),
        ]);
        Ok(strfmt::strfmt(&self.segment_command, &vars)?)
    }

    /// Render the marker token for a run/segment pair (1-based indices).
    pub fn render_marker(&self, run_index: usize, segment_index: usize) -> SweepResult<String> {
        let vars = HashMap::from([
            ("run".to_string(), (run_index + 1).to_string()),
            ("segment".to_string(), (segment_index + 1).to_string()),
        ]);
        Ok(strfmt::strfmt(&self.marker_template, &vars)?)
    }

    /// Render the echo command that prints the marker.
    pub fn render_marker_echo(&self, marker: &str) -> SweepResult<String> {
        let vars = HashMap::from([("marker".to_string(), marker.to_string())]);
        Ok(strfmt::strfmt(&self.marker_echo, &vars)?)
    }

    /// Render a buffer fetch for `count` points of `buffer`.
    pub fn render_fetch(&self, count: usize, buffer: &str) -> SweepResult<String> {
        let vars = HashMap::from([
            ("count".to_string(), count.to_string()),
            ("buffer".to_string(), buffer.to_string()),
        ]);
        Ok(strfmt::strfmt(&self.buffer_fetch, &vars)?)
    }

    /// Render the trigger setup command.
    pub fn render_trigger_setup(
        &self,
        edge: &str,
        line: u8,
        mode: &str,
    ) -> SweepResult<String> {
        let vars = HashMap::from([
            ("edge".to_string(), edge.to_string()),
            ("line".to_string(), line.to_string()),
            ("mode".to_string(), mode.to_string()),
        ]);
        Ok(strfmt::strfmt(&self.trigger_setup, &vars)?)
    }

    /// Render the trigger wait command. `timeout` is in seconds; `None`
    /// waits indefinitely.
    pub fn render_trigger_wait(
        &self,
        timeout: Option<f64>,
        edge: &str,
        line: u8,
        mode: &str,
    ) -> SweepResult<String> {
        let timeout = match timeout {
            Some(seconds) => seconds.to_string(),
            None => "nil".to_string(),
        };
        let vars = HashMap::from([
            ("timeout".to_string(), timeout),
            ("edge".to_string(), edge.to_string()),
            ("line".to_string(), line.to_string()),
            ("mode".to_string(), mode.to_string()),
        ]);
        Ok(strfmt::strfmt(&self.trigger_wait, &vars)?)
    }

    /// Wiring sequence for a sense mode.
    pub fn wiring(&self, mode: WiringMode) -> &[String] {
        match mode {
            WiringMode::TwoWire => &self.wiring_two_wire,
            WiringMode::FourWire => &self.wiring_four_wire,
        }
    }
}

/// One segment execution request: the rendered command plus its marker.
#[derive(Debug, Clone)]
pub struct SegmentRequest {
    /// Rendered segment command line.
    pub command: String,
    /// Marker token ending this segment's output.
    pub marker: String,
}

/// Execute one segment against `channel`.
///
/// `on_point` fires for every live-parsed pair, before the next read, so a
/// presentation layer can plot while the instrument is still sweeping.
///
/// # Errors
/// - [`SweepError::Cancelled`] when the token is set mid-drain.
/// - [`SweepError::Channel`] with an I/O failure; timeouts never surface
///   from the drain loop (they mean "still waiting") and during readback
///   they degrade to the live-parse fallback instead.
pub fn run_segment<C, F>(
    channel: &mut C,
    commands: &CommandSet,
    tuning: &Tuning,
    cancel: &CancelToken,
    request: &SegmentRequest,
    mut on_point: F,
) -> SweepResult<SegmentOutput>
where
    C: Channel + ?Sized,
    F: FnMut(&MeasurementPair),
{
    debug!(command = %request.command, marker = %request.marker, "starting segment");
    channel.write_line(&request.command)?;
    channel.write_line(&commands.render_marker_echo(&request.marker)?)?;

    let mut output = SegmentOutput::default();
    {
        let mut guard = TimeoutGuard::new(channel, tuning.poll_timeout);
        loop {
            cancel.check()?;
            let line = match guard.channel().read_line() {
                Ok(line) => line,
                Err(ChannelError::Timeout(_)) => continue, // still sweeping
                Err(err) => return Err(err.into()),
            };
            let line = line.trim().to_string();
            if line == request.marker {
                break;
            }
            if line.is_empty() {
                continue;
            }
            match parse_triplet(&line) {
                Some(pair) => {
                    on_point(&pair);
                    output.pairs.push(pair);
                }
                None => {
                    trace!(%line, "non-numeric segment output");
                    output.printed_lines.push(line);
                }
            }
        }
    }

    read_back_buffer(channel, commands, tuning, &mut output)?;
    debug!(
        points = output.pairs.len(),
        mismatch = output.buffer_mismatch,
        "segment complete"
    );
    Ok(output)
}

/// Replace the live-parsed pairs with the instrument's persisted buffer when
/// the readback is complete; otherwise keep the live pairs and flag the
/// mismatch.
fn read_back_buffer<C: Channel + ?Sized>(
    channel: &mut C,
    commands: &CommandSet,
    tuning: &Tuning,
    output: &mut SegmentOutput,
) -> SweepResult<()> {
    let mut guard = TimeoutGuard::new(channel, tuning.command_timeout);
    let channel = guard.channel();

    let count = match query_soft(channel, &commands.buffer_count_query)? {
        Some(line) => line.trim().parse::<f64>().ok().map(|n| n as usize),
        None => None,
    };
    let Some(count) = count else {
        warn!("buffer count query unanswered; keeping live-parsed data");
        output.buffer_mismatch = true;
        return Ok(());
    };

    let levels = fetch_values(channel, commands, count, &commands.levels_buffer)?;
    let responses = fetch_values(channel, commands, count, &commands.responses_buffer)?;

    if count > 0 && levels.len() >= count && responses.len() >= count {
        if output.pairs.len() != count {
            warn!(
                live = output.pairs.len(),
                buffered = count,
                "live point count disagrees with buffer readback"
            );
            output.buffer_mismatch = true;
        }
        output.pairs = levels
            .into_iter()
            .zip(responses)
            .take(count)
            .map(|(level, response)| MeasurementPair { level, response })
            .collect();
    } else {
        warn!(
            expected = count,
            levels = levels.len(),
            responses = responses.len(),
            "buffer readback short or empty; keeping live-parsed data"
        );
        output.buffer_mismatch = true;
    }
    Ok(())
}

/// Query that treats a timeout as "no answer" instead of an error.
fn query_soft<C: Channel + ?Sized>(
    channel: &mut C,
    command: &str,
) -> SweepResult<Option<String>> {
    channel.write_line(command)?;
    match channel.read_line() {
        Ok(line) => Ok(Some(line)),
        Err(ChannelError::Timeout(_)) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// Fetch up to `count` floats from a buffer, tolerating payloads split
/// across several lines. Stops early on a timeout and returns what arrived.
fn fetch_values<C: Channel + ?Sized>(
    channel: &mut C,
    commands: &CommandSet,
    count: usize,
    buffer: &str,
) -> SweepResult<Vec<f64>> {
    if count == 0 {
        return Ok(Vec::new());
    }
    channel.write_line(&commands.render_fetch(count, buffer)?)?;
    let mut values = Vec::with_capacity(count);
    while values.len() < count {
        match channel.read_line() {
            Ok(line) => values.extend(parse_float_list(&line)),
            Err(ChannelError::Timeout(_)) => break,
            Err(err) => return Err(err.into()),
        }
    }
    Ok(values)
}

/// Permissive index/level/response parse.
///
/// Commas and whitespace are equivalent separators; the leading token is the
/// instrument's point index and is required to be numeric but otherwise
/// ignored.
fn parse_triplet(line: &str) -> Option<MeasurementPair> {
    let sanitized = line.replace(',', " ");
    let mut parts = sanitized.split_whitespace();
    let _index: f64 = parts.next()?.parse().ok()?;
    let level: f64 = parts.next()?.parse().ok()?;
    let response: f64 = parts.next()?.parse().ok()?;
    Some(MeasurementPair { level, response })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::mock::{MockChannel, SmuSimulator};
    use std::time::Duration;

    fn test_tuning() -> Tuning {
        Tuning {
            poll_timeout: Duration::from_millis(10),
            command_timeout: Duration::from_millis(20),
            ..Tuning::default()
        }
    }

    fn request(commands: &CommandSet, start: f64, stop: f64, step: f64) -> SegmentRequest {
        let segment = Segment {
            start_level: start,
            stop_level: stop,
            step_signed: step,
        };
        let params = SweepParameters {
            start_level: start,
            stop_level: stop,
            step_magnitude: step.abs(),
            compliance_limit: 0.5,
            integration_time: 1.0,
            settle_time: 0.01,
            total_runs: 1,
            wiring_mode: WiringMode::FourWire,
        };
        SegmentRequest {
            command: commands.render_segment(&segment, &params).expect("render"),
            marker: commands.render_marker(0, 0).expect("marker"),
        }
    }

    #[test]
    fn marker_embeds_run_and_segment() {
        let commands = CommandSet::default();
        assert_eq!(commands.render_marker(0, 2).expect("marker"), "SWEEP_DONE_1_3");
    }

    #[test]
    fn happy_path_prefers_buffer_readback() {
        let commands = CommandSet::default();
        let mut channel = MockChannel::simulated(SmuSimulator::new());
        let mut live_points = 0;
        let output = run_segment(
            &mut channel,
            &commands,
            &test_tuning(),
            &CancelToken::new(),
            &request(&commands, 0.0, 0.4, 0.1),
            |_| live_points += 1,
        )
        .expect("segment");

        assert_eq!(output.pairs.len(), 5);
        assert_eq!(live_points, 5);
        assert!(!output.buffer_mismatch);
        assert!(output.printed_lines.is_empty());
    }

    #[test]
    fn informational_lines_are_kept_verbatim() {
        let commands = CommandSet::default();
        let mut channel = MockChannel::scripted(|line| {
            use crate::channel::mock::Reply;
            if line.starts_with("SweepRun(") {
                Reply::Lines(vec![
                    "instrument warming up".to_string(),
                    "1\t1.0e-1\t1.0e-4".to_string(),
                ])
            } else if line == "print(\"SWEEP_DONE_1_1\")" {
                Reply::Lines(vec!["SWEEP_DONE_1_1".to_string()])
            } else if line == "print(defbuffer1.n)" {
                Reply::Lines(vec!["1".to_string()])
            } else if line.starts_with("printbuffer(") {
                Reply::Lines(vec!["1.0e-1".to_string()])
            } else {
                Reply::None
            }
        });
        let output = run_segment(
            &mut channel,
            &commands,
            &test_tuning(),
            &CancelToken::new(),
            &request(&commands, 0.0, 0.1, 0.1),
            |_| {},
        )
        .expect("segment");

        assert_eq!(output.printed_lines, vec!["instrument warming up".to_string()]);
        assert_eq!(output.pairs.len(), 1);
    }

    #[test]
    fn short_readback_falls_back_to_live_pairs() {
        let commands = CommandSet::default();
        let mut simulator = SmuSimulator::new();
        simulator.truncate_readback = Some(2);
        let mut channel = MockChannel::simulated(simulator);
        let output = run_segment(
            &mut channel,
            &commands,
            &test_tuning(),
            &CancelToken::new(),
            &request(&commands, 0.0, 0.4, 0.1),
            |_| {},
        )
        .expect("segment");

        assert!(output.buffer_mismatch);
        assert_eq!(output.pairs.len(), 5); // live-parsed pairs survive
    }

    #[test]
    fn timeout_is_restored_after_segment() {
        let commands = CommandSet::default();
        let mut channel = MockChannel::simulated(SmuSimulator::new());
        channel.set_timeout(Duration::from_secs(7));
        run_segment(
            &mut channel,
            &commands,
            &test_tuning(),
            &CancelToken::new(),
            &request(&commands, 0.0, 0.2, 0.1),
            |_| {},
        )
        .expect("segment");
        assert_eq!(channel.timeout(), Duration::from_secs(7));
    }

    #[test]
    fn timeout_is_restored_on_io_error_too() {
        let commands = CommandSet::default();
        let mut channel = MockChannel::new();
        channel.set_timeout(Duration::from_secs(7));
        // Both protocol writes succeed, then the connection drops.
        channel.fail_after_writes(2);
        let result = run_segment(
            &mut channel,
            &commands,
            &test_tuning(),
            &CancelToken::new(),
            &request(&commands, 0.0, 0.2, 0.1),
            |_| {},
        );
        assert!(matches!(result, Err(SweepError::Channel(ChannelError::Io(_)))));
        assert_eq!(channel.timeout(), Duration::from_secs(7));
    }

    #[test]
    fn pre_set_cancellation_aborts_before_reading() {
        let commands = CommandSet::default();
        let mut channel = MockChannel::simulated(SmuSimulator::new());
        let cancel = CancelToken::new();
        cancel.cancel();
        let result = run_segment(
            &mut channel,
            &commands,
            &test_tuning(),
            &cancel,
            &request(&commands, 0.0, 0.2, 0.1),
            |_| {},
        );
        assert!(matches!(result, Err(SweepError::Cancelled)));
    }

    #[test]
    fn triplet_parse_is_permissive_about_separators() {
        assert_eq!(
            parse_triplet("3, 1.5e0, 2.5e-3"),
            Some(MeasurementPair {
                level: 1.5,
                response: 2.5e-3
            })
        );
        assert!(parse_triplet("reading complete").is_none());
        assert!(parse_triplet("1.0 2.0").is_none());
    }
}
