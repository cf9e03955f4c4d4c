//! # smu-sweep
//!
//! Coordination core for automated parametric sweeps and triggered captures
//! on programmable test instruments reachable over a text-based,
//! line-oriented command channel.
//!
//! The hard problem this crate solves is not the instrument vocabulary — it
//! is making a single exclusive, half-duplex command channel safely usable
//! by two cooperating components: a long-running background sweep that
//! issues many sequential commands and polls instrument-side buffer state,
//! and a wait-for-external-trigger listener that hands its channel to the
//! sweep the instant a trigger fires and reclaims it when the sweep ends.
//!
//! ## Module map
//!
//! - **`channel`**: the abstract [`Channel`](channel::Channel) transport the
//!   core writes command lines to and reads lines/timeouts from, plus the
//!   scripted mock instrument used by tests.
//! - **`planner`**: splits a sweep range into monotonic zero-bounded
//!   segments and generates the commanded level path.
//! - **`executor`**: drives one segment — write, drain-until-marker with
//!   short poll timeouts, buffer readback with live-parse fallback.
//! - **`reconcile`**: sticky commanded-vs-measured correction that detects
//!   compliance-induced clipping.
//! - **`session`**: the ownership arbiter; channel access is carried by
//!   typed grant values so only the current owner can touch the wire.
//! - **`listener`**: arms the external trigger, waits for it, and routes
//!   the channel handoff through the arbiter.
//! - **`runner`**: the worker thread orchestrating planner → executor →
//!   reconciler → progress reporting, with best-effort safe-off on every
//!   exit path.
//! - **`progress`**: immutable snapshot types and the bounded queue that
//!   carries them to the presentation layer.
//! - **`config`**: the empirically tuned constants, loadable from TOML and
//!   environment.
//! - **`cancel`**, **`error`**, **`logging`**: cooperative cancellation,
//!   the error taxonomy, tracing setup.
//!
//! ## Typical flow
//!
//! ```no_run
//! use std::sync::Arc;
//! use smu_sweep::cancel::CancelToken;
//! use smu_sweep::channel::MockChannel;
//! use smu_sweep::config::Tuning;
//! use smu_sweep::executor::CommandSet;
//! use smu_sweep::listener::{TriggerConfig, TriggerListener, TriggerOutcome};
//! use smu_sweep::planner::{SweepParameters, WiringMode};
//! use smu_sweep::runner::SweepRunner;
//! use smu_sweep::session::SessionArbiter;
//!
//! # fn main() -> Result<(), smu_sweep::error::SweepError> {
//! let arbiter = Arc::new(SessionArbiter::new());
//! let commands = Arc::new(CommandSet::default());
//! let tuning = Tuning::default();
//!
//! let mut listener = TriggerListener::new(Arc::clone(&arbiter), Arc::clone(&commands), tuning.clone());
//! listener.connect(Box::new(MockChannel::new()), "TCPIP0::10.0.0.5::5025::SOCKET")?;
//! listener.arm(&TriggerConfig::default())?;
//!
//! if listener.wait_for_trigger(&TriggerConfig::default(), &CancelToken::new())?
//!     == TriggerOutcome::Triggered
//! {
//!     let grant = listener.offer_to_sweep()?;
//!     let params = SweepParameters {
//!         start_level: -4.0,
//!         stop_level: 4.0,
//!         step_magnitude: 0.1,
//!         compliance_limit: 0.5,
//!         integration_time: 1.0,
//!         settle_time: 0.01,
//!         total_runs: 1,
//!         wiring_mode: WiringMode::FourWire,
//!     };
//!     let (handle, events) =
//!         SweepRunner::start(&params, grant, Arc::clone(&arbiter), commands, tuning)?;
//!     for event in events {
//!         if event.is_terminal() {
//!             break;
//!         }
//!     }
//!     handle.join();
//!     listener.reclaim()?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod cancel;
pub mod channel;
pub mod config;
pub mod error;
pub mod executor;
pub mod listener;
pub mod logging;
pub mod planner;
pub mod progress;
pub mod reconcile;
pub mod runner;
pub mod session;
