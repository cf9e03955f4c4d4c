//! Scripted mock channel for tests and offline development.
//!
//! [`MockChannel`] plays the instrument side of the wire: every write is
//! recorded, and an optional script decides which response lines to queue.
//! [`SmuSimulator`] is the standard script — it emulates a source-measure
//! unit running the sweep dialect: segment commands produce a printed
//! triplet per ladder level (with optional compliance clamping and
//! sub-tolerance noise), marker echoes come back verbatim, and buffer
//! readback queries replay the segment from the simulated buffer.

use std::collections::VecDeque;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::channel::Channel;
use crate::config::Tuning;
use crate::error::ChannelError;
use crate::planner::Segment;

/// Script decision for one written line.
pub enum Reply {
    /// Queue these lines for subsequent reads.
    Lines(Vec<String>),
    /// Consume the write silently.
    None,
    /// Fail the write with an I/O error.
    IoError(String),
}

type Script = Box<dyn FnMut(&str) -> Reply + Send>;

/// A scripted, in-memory [`Channel`].
pub struct MockChannel {
    timeout: Duration,
    pending: VecDeque<String>,
    writes: Vec<String>,
    script: Option<Script>,
    fail_after_writes: Option<usize>,
}

impl MockChannel {
    /// Channel with no script: reads only return what was pushed manually.
    pub fn new() -> Self {
        Self {
            timeout: Duration::from_secs(1),
            pending: VecDeque::new(),
            writes: Vec::new(),
            script: None,
            fail_after_writes: None,
        }
    }

    /// Channel answering through `script`.
    pub fn scripted<F>(script: F) -> Self
    where
        F: FnMut(&str) -> Reply + Send + 'static,
    {
        let mut channel = Self::new();
        channel.script = Some(Box::new(script));
        channel
    }

    /// Channel backed by an [`SmuSimulator`].
    pub fn simulated(simulator: SmuSimulator) -> Self {
        let mut sim = simulator;
        Self::scripted(move |line| sim.respond(line))
    }

    /// Queue a response line directly.
    pub fn push_line(&mut self, line: impl Into<String>) {
        self.pending.push_back(line.into());
    }

    /// Every command line written so far, in order.
    pub fn writes(&self) -> &[String] {
        &self.writes
    }

    /// Fail every operation after `count` successful writes, emulating a
    /// connection dropped mid-segment.
    pub fn fail_after_writes(&mut self, count: usize) {
        self.fail_after_writes = Some(count);
    }

    fn connection_down(&self) -> bool {
        matches!(self.fail_after_writes, Some(limit) if self.writes.len() >= limit)
    }
}

impl Default for MockChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl Channel for MockChannel {
    fn write_line(&mut self, line: &str) -> Result<(), ChannelError> {
        if self.connection_down() {
            return Err(ChannelError::Io("mock connection dropped".into()));
        }
        self.writes.push(line.to_string());
        if let Some(script) = self.script.as_mut() {
            match script(line) {
                Reply::Lines(lines) => self.pending.extend(lines),
                Reply::None => {}
                Reply::IoError(message) => return Err(ChannelError::Io(message)),
            }
        }
        Ok(())
    }

    fn read_line(&mut self) -> Result<String, ChannelError> {
        if self.connection_down() {
            return Err(ChannelError::Io("mock connection dropped".into()));
        }
        match self.pending.pop_front() {
            Some(line) => Ok(line),
            None => {
                // Emulate a blocking read that waits out its timeout.
                std::thread::sleep(self.timeout);
                Err(ChannelError::Timeout(self.timeout))
            }
        }
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// Emulated source-measure unit speaking the default sweep dialect.
pub struct SmuSimulator {
    /// Ohmic device under test; responses are `level / resistance`.
    pub resistance: f64,
    /// Compliance clamp applied to the measured source level, as an
    /// absolute magnitude. `None` sources every level faithfully.
    pub clamp_level: Option<f64>,
    /// Uniform noise amplitude added to measured levels. Keep well below
    /// the reconciliation tolerance for clean-sweep scenarios.
    pub noise: f64,
    /// Truncate buffer readback to this many points, emulating a short
    /// instrument buffer.
    pub truncate_readback: Option<usize>,
    /// Line returned by the trigger wait command. `None` keeps the waiter
    /// polling until it is cancelled.
    pub trigger_outcome: Option<String>,
    /// When set, the health probe goes unanswered.
    pub ignore_probe: bool,
    tuning: Tuning,
    rng: StdRng,
    buffer_levels: Vec<f64>,
    buffer_responses: Vec<f64>,
}

impl SmuSimulator {
    /// Well-behaved 1 kΩ device, no clamping, deterministic noise.
    pub fn new() -> Self {
        Self {
            resistance: 1_000.0,
            clamp_level: None,
            noise: 1e-6,
            truncate_readback: None,
            trigger_outcome: Some("TRIGGER".to_string()),
            ignore_probe: false,
            tuning: Tuning::default(),
            rng: StdRng::seed_from_u64(0x5eed),
            buffer_levels: Vec::new(),
            buffer_responses: Vec::new(),
        }
    }

    /// Clamp measured source levels at `magnitude`, as a compliance limit
    /// would.
    pub fn with_clamp(mut self, magnitude: f64) -> Self {
        self.clamp_level = Some(magnitude);
        self
    }

    fn respond(&mut self, line: &str) -> Reply {
        if let Some(args) = line.strip_prefix("SweepRun(").and_then(|s| s.strip_suffix(')')) {
            return self.run_segment(args);
        }
        if line == "print(defbuffer1.n)" {
            return Reply::Lines(vec![format!("{}", self.buffer_levels.len())]);
        }
        if let Some(rest) = line.strip_prefix("printbuffer(") {
            return self.print_buffer(rest);
        }
        if line == "print(1)" {
            return if self.ignore_probe {
                Reply::None
            } else {
                Reply::Lines(vec!["1.000000e+00".to_string()])
            };
        }
        if let Some(text) = quoted_argument(line, "print(") {
            return Reply::Lines(vec![text]);
        }
        if line.starts_with("trigger_wait(") {
            return match &self.trigger_outcome {
                Some(outcome) => Reply::Lines(vec![outcome.clone()]),
                None => Reply::None,
            };
        }
        // Setup, wiring and output commands have no response.
        Reply::None
    }

    fn run_segment(&mut self, args: &str) -> Reply {
        let values: Vec<f64> = args
            .split(',')
            .filter_map(|token| token.trim().parse::<f64>().ok())
            .collect();
        if values.len() < 3 {
            return Reply::IoError(format!("malformed segment command args: {args}"));
        }
        let (start, stop, step) = (values[0], values[1], values[2]);
        let segment = Segment {
            start_level: start,
            stop_level: stop,
            step_signed: step,
        };
        let epsilon = self.tuning.level_epsilon(step);

        let mut lines = Vec::new();
        self.buffer_levels.clear();
        self.buffer_responses.clear();
        for (index, level) in segment.levels(epsilon).into_iter().enumerate() {
            let clamped = match self.clamp_level {
                Some(magnitude) => level.clamp(-magnitude, magnitude),
                None => level,
            };
            let measured = clamped + self.rng.gen_range(-self.noise..=self.noise);
            let response = measured / self.resistance;
            self.buffer_levels.push(measured);
            self.buffer_responses.push(response);
            lines.push(format!("{}\t{:.6e}\t{:.6e}", index + 1, measured, response));
        }
        Reply::Lines(lines)
    }

    fn print_buffer(&mut self, rest: &str) -> Reply {
        let source = if rest.contains("sourcevalues") {
            &self.buffer_levels
        } else {
            &self.buffer_responses
        };
        let limit = self.truncate_readback.unwrap_or(source.len());
        let payload = source
            .iter()
            .take(limit)
            .map(|value| format!("{value:.6e}"))
            .collect::<Vec<_>>()
            .join(", ");
        Reply::Lines(vec![payload])
    }
}

impl Default for SmuSimulator {
    fn default() -> Self {
        Self::new()
    }
}

/// Extract the single- or double-quoted argument of `prefix(...)` calls.
fn quoted_argument(line: &str, prefix: &str) -> Option<String> {
    let inner = line.strip_prefix(prefix)?.strip_suffix(')')?;
    let inner = inner.trim();
    for quote in ['"', '\''] {
        if inner.len() >= 2 && inner.starts_with(quote) && inner.ends_with(quote) {
            return Some(inner[1..inner.len() - 1].to_string());
        }
    }
    None
}
