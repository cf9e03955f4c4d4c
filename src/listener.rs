//! Trigger listening and channel handoff.
//!
//! The [`TriggerListener`] owns the channel between sweeps. It arms the
//! instrument's external trigger input, then issues a blocking wait and
//! drains response lines until one of the sentinel outcomes arrives. On a
//! successful trigger it offers the channel to the
//! [`SessionArbiter`](crate::session::SessionArbiter) for the sweep side and
//! reclaims it when the sweep is over.
//!
//! While a sweep owns the channel the listener is *locked*: every
//! listener-initiated operation is rejected with `InstrumentBusy` instead of
//! being queued behind the sweep.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::channel::{Channel, TimeoutGuard};
use crate::config::Tuning;
use crate::error::{ChannelError, SweepError, SweepResult};
use crate::executor::CommandSet;
use crate::session::{ListenerGrant, SessionArbiter, SweepGrant};

/// Trigger edge selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerEdge {
    /// Falling edge.
    Falling,
    /// Rising edge.
    Rising,
    /// Either edge.
    Either,
}

impl TriggerEdge {
    fn as_key(self) -> &'static str {
        match self {
            TriggerEdge::Falling => "falling",
            TriggerEdge::Rising => "rising",
            TriggerEdge::Either => "either",
        }
    }
}

/// Digital line mode for the trigger input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LineMode {
    /// Trigger control, input.
    TriggerIn,
    /// Trigger control, open-drain.
    TriggerOpenDrain,
    /// Trigger control, output.
    TriggerOut,
    /// Digital control, input.
    DigitalIn,
    /// Digital control, output.
    DigitalOut,
    /// Digital control, open-drain.
    DigitalOpenDrain,
    /// Synchronous master.
    SynchronousMaster,
    /// Synchronous acceptor.
    SynchronousAcceptor,
}

impl LineMode {
    fn as_key(self) -> &'static str {
        match self {
            LineMode::TriggerIn => "trigger_in",
            LineMode::TriggerOpenDrain => "trigger_open_drain",
            LineMode::TriggerOut => "trigger_out",
            LineMode::DigitalIn => "digital_in",
            LineMode::DigitalOut => "digital_out",
            LineMode::DigitalOpenDrain => "digital_open_drain",
            LineMode::SynchronousMaster => "synchronous_master",
            LineMode::SynchronousAcceptor => "synchronous_acceptor",
        }
    }
}

/// Trigger input configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerConfig {
    /// Edge to detect.
    pub edge: TriggerEdge,
    /// Digital I/O line number (1-6; out-of-range values are clamped).
    pub line: u8,
    /// Line mode. Waiting requires a trigger-input mode.
    pub mode: LineMode,
    /// Give up after this long. `None` waits indefinitely.
    #[serde(default, with = "humantime_serde::option")]
    pub timeout: Option<Duration>,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            edge: TriggerEdge::Falling,
            line: 1,
            mode: LineMode::TriggerIn,
            timeout: None,
        }
    }
}

impl TriggerConfig {
    fn clamped_line(&self) -> u8 {
        self.line.clamp(1, 6)
    }
}

/// How a trigger wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerOutcome {
    /// The external trigger fired.
    Triggered,
    /// The configured timeout elapsed without a trigger.
    TimedOut,
    /// The wait was cancelled (token or instrument side).
    Cancelled,
    /// The configured line mode cannot detect triggers.
    InvalidMode,
}

/// Listener side of the shared instrument session.
pub struct TriggerListener {
    arbiter: Arc<SessionArbiter>,
    commands: Arc<CommandSet>,
    tuning: Tuning,
    grant: Option<ListenerGrant>,
    locked: Arc<AtomicBool>,
}

impl TriggerListener {
    /// Create a listener bound to `arbiter` and register its lock state as
    /// the arbiter's lock observer.
    pub fn new(arbiter: Arc<SessionArbiter>, commands: Arc<CommandSet>, tuning: Tuning) -> Self {
        let locked = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&locked);
        arbiter.set_lock_observer(move |is_locked| {
            flag.store(is_locked, Ordering::SeqCst);
        });
        Self {
            arbiter,
            commands,
            tuning,
            grant: None,
            locked,
        }
    }

    /// True while a sweep owns the channel.
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::SeqCst)
    }

    /// True while this listener holds the channel grant.
    pub fn is_connected(&self) -> bool {
        self.grant.is_some()
    }

    fn guard_unlocked(&self, action: &str) -> SweepResult<()> {
        if self.is_locked() {
            return Err(SweepError::InstrumentBusy(format!(
                "cannot {action} while a sweep is running"
            )));
        }
        Ok(())
    }

    fn channel(&mut self) -> SweepResult<&mut dyn Channel> {
        match self.grant.as_mut() {
            Some(grant) => Ok(grant.channel()),
            None => Err(SweepError::SessionLost(
                "listener does not hold the instrument session".into(),
            )),
        }
    }

    /// Adopt a freshly opened channel.
    pub fn connect(&mut self, channel: Box<dyn Channel>, address: &str) -> SweepResult<()> {
        self.guard_unlocked("connect")?;
        let grant = self.arbiter.connect_listener(channel, address)?;
        self.grant = Some(grant);
        Ok(())
    }

    /// Drop the channel and free the session.
    pub fn disconnect(&mut self) -> SweepResult<()> {
        self.guard_unlocked("disconnect")?;
        if let Some(grant) = self.grant.take() {
            self.arbiter.disconnect_listener(grant);
        }
        Ok(())
    }

    /// Configure the trigger input and show the instrument-side waiting
    /// state.
    pub fn arm(&mut self, config: &TriggerConfig) -> SweepResult<()> {
        self.guard_unlocked("configure the trigger")?;
        let command = self.commands.render_trigger_setup(
            config.edge.as_key(),
            config.clamped_line(),
            config.mode.as_key(),
        )?;
        self.channel()?.write_line(&command)?;
        debug!(line = config.clamped_line(), edge = config.edge.as_key(), "trigger armed");
        Ok(())
    }

    /// Block until the trigger fires, the configured timeout elapses, or the
    /// wait is cancelled.
    ///
    /// The instrument-side wait may outlast any single read timeout, so the
    /// drain runs under the short poll timeout and treats bare read
    /// timeouts as "still waiting". Cancellation via `cancel` is bounded by
    /// one poll interval; a best-effort instrument-side cancel is written
    /// before returning.
    pub fn wait_for_trigger(
        &mut self,
        config: &TriggerConfig,
        cancel: &CancelToken,
    ) -> SweepResult<TriggerOutcome> {
        self.guard_unlocked("start a new wait")?;
        let command = self.commands.render_trigger_wait(
            config.timeout.map(|t| t.as_secs_f64()),
            config.edge.as_key(),
            config.clamped_line(),
            config.mode.as_key(),
        )?;
        let cancel_command = self.commands.trigger_cancel.clone();
        let poll_timeout = self.tuning.poll_timeout;

        let channel = self.channel()?;
        channel.write_line(&command)?;

        let mut guard = TimeoutGuard::new(channel, poll_timeout);
        let channel = guard.channel();
        loop {
            if cancel.is_cancelled() {
                // Tell the instrument to stop waiting too; failure here
                // only delays its own timeout.
                if channel.write_line(&cancel_command).is_err() {
                    warn!("instrument-side trigger cancel failed");
                }
                return Ok(TriggerOutcome::Cancelled);
            }
            let line = match channel.read_line() {
                Ok(line) => line,
                Err(ChannelError::Timeout(_)) => continue,
                Err(err) => return Err(err.into()),
            };
            match line.trim() {
                "TRIGGER" => {
                    info!("external trigger received");
                    return Ok(TriggerOutcome::Triggered);
                }
                "TIMEOUT" => return Ok(TriggerOutcome::TimedOut),
                "CANCEL" => return Ok(TriggerOutcome::Cancelled),
                "INVALID_MODE" => return Ok(TriggerOutcome::InvalidMode),
                "" => continue,
                other => debug!(line = other, "ignoring non-sentinel trigger output"),
            }
        }
    }

    /// Hand the channel to the sweep side. The arbiter notifies the lock
    /// observer before the handle moves, so this listener is already locked
    /// when the grant leaves it.
    pub fn offer_to_sweep(&mut self) -> SweepResult<SweepGrant> {
        let grant = self.grant.take().ok_or_else(|| {
            SweepError::SessionLost("no instrument session to offer".into())
        })?;
        self.arbiter.hand_to_sweep(grant)
    }

    /// Take the channel back after the sweep side released it.
    pub fn reclaim(&mut self) -> SweepResult<()> {
        let grant = self.arbiter.reclaim_listener()?;
        self.grant = Some(grant);
        debug!("listener reclaimed the instrument session");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::mock::{MockChannel, SmuSimulator};

    fn quick_tuning() -> Tuning {
        Tuning {
            poll_timeout: Duration::from_millis(5),
            command_timeout: Duration::from_millis(10),
            ..Tuning::default()
        }
    }

    fn listener() -> TriggerListener {
        TriggerListener::new(
            Arc::new(SessionArbiter::new()),
            Arc::new(CommandSet::default()),
            quick_tuning(),
        )
    }

    #[test]
    fn wait_reports_trigger_outcome() {
        let mut listener = listener();
        listener
            .connect(Box::new(MockChannel::simulated(SmuSimulator::new())), "addr")
            .expect("connect");
        listener.arm(&TriggerConfig::default()).expect("arm");
        let outcome = listener
            .wait_for_trigger(&TriggerConfig::default(), &CancelToken::new())
            .expect("wait");
        assert_eq!(outcome, TriggerOutcome::Triggered);
    }

    #[test]
    fn wait_maps_instrument_timeout_sentinel() {
        let mut simulator = SmuSimulator::new();
        simulator.trigger_outcome = Some("TIMEOUT".to_string());
        let mut listener = listener();
        listener
            .connect(Box::new(MockChannel::simulated(simulator)), "addr")
            .expect("connect");
        let outcome = listener
            .wait_for_trigger(&TriggerConfig::default(), &CancelToken::new())
            .expect("wait");
        assert_eq!(outcome, TriggerOutcome::TimedOut);
    }

    #[test]
    fn cancellation_stops_a_silent_wait() {
        let mut simulator = SmuSimulator::new();
        simulator.trigger_outcome = None; // instrument never answers
        let mut listener = listener();
        listener
            .connect(Box::new(MockChannel::simulated(simulator)), "addr")
            .expect("connect");

        let cancel = CancelToken::new();
        cancel.cancel();
        let outcome = listener
            .wait_for_trigger(&TriggerConfig::default(), &cancel)
            .expect("wait");
        assert_eq!(outcome, TriggerOutcome::Cancelled);
    }

    #[test]
    fn operations_are_rejected_while_locked() {
        let mut listener = listener();
        listener
            .connect(Box::new(MockChannel::simulated(SmuSimulator::new())), "addr")
            .expect("connect");
        let _sweep_grant = listener.offer_to_sweep().expect("handoff");

        assert!(listener.is_locked());
        assert!(matches!(
            listener.arm(&TriggerConfig::default()),
            Err(SweepError::InstrumentBusy(_))
        ));
        assert!(matches!(
            listener.wait_for_trigger(&TriggerConfig::default(), &CancelToken::new()),
            Err(SweepError::InstrumentBusy(_))
        ));
        assert!(matches!(
            listener.disconnect(),
            Err(SweepError::InstrumentBusy(_))
        ));
    }

    #[test]
    fn line_is_clamped_into_instrument_range() {
        let config = TriggerConfig {
            line: 9,
            ..TriggerConfig::default()
        };
        assert_eq!(config.clamped_line(), 6);
    }
}
