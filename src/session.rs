//! Session ownership arbitration.
//!
//! One physical channel, two logical owners: the trigger listener holds it
//! while waiting for an external trigger, and the sweep runner borrows it
//! for the duration of a sweep. The [`SessionArbiter`] is the only place
//! ownership changes, and the channel handle itself travels *inside* the
//! grant values its transitions return — code that does not hold a
//! [`ListenerGrant`] or [`SweepGrant`] has no way to reach the channel, so
//! "touching the channel while not owner" is unrepresentable rather than
//! merely checked at runtime.
//!
//! Transition table:
//!
//! ```text
//! Free            --connect_listener-->   OwnedByListener
//! OwnedByListener --hand_to_sweep---->    OwnedBySweep     (lock observer fires first)
//! OwnedBySweep    --release_from_sweep--> OwnedByListener  (health probe; Free on failure)
//! OwnedByListener --disconnect_listener-> Free
//! ```
//!
//! Every out-of-state request fails fast with `InstrumentBusy` — never
//! queued. Queuing would let two logical operations interleave on one
//! half-duplex line and desynchronize command/response pairing, which is
//! unrecoverable without reconnecting.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::channel::{Channel, TimeoutGuard};
use crate::config::Tuning;
use crate::error::{ChannelError, SweepError, SweepResult};
use crate::executor::CommandSet;

/// Who currently owns the shared channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Ownership {
    /// No channel connected, or the previous one was dropped.
    Free,
    /// The trigger listener side owns the channel.
    OwnedByListener,
    /// A sweep owns the channel.
    OwnedBySweep,
}

/// Capability to use the channel as the listener side.
pub struct ListenerGrant {
    channel: Box<dyn Channel>,
}

impl ListenerGrant {
    /// Access the owned channel.
    pub fn channel(&mut self) -> &mut dyn Channel {
        &mut *self.channel
    }
}

/// Capability to use the channel as the sweep side.
pub struct SweepGrant {
    channel: Box<dyn Channel>,
}

impl SweepGrant {
    /// Access the owned channel.
    pub fn channel(&mut self) -> &mut dyn Channel {
        &mut *self.channel
    }
}

type LockObserver = Arc<dyn Fn(bool) + Send + Sync>;

struct ArbiterInner {
    ownership: Ownership,
    address: Option<String>,
    /// Channel waiting for the listener to reclaim it after a sweep.
    parked: Option<Box<dyn Channel>>,
    lock_observer: Option<LockObserver>,
}

/// Mediates ownership handoff of the shared channel.
///
/// Note: dropping a grant without returning it to the arbiter strands the
/// session in its current ownership state; the embedding layer observes
/// this through [`SessionArbiter::ownership`].
pub struct SessionArbiter {
    inner: Mutex<ArbiterInner>,
}

impl SessionArbiter {
    /// New arbiter with no channel connected.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(ArbiterInner {
                ownership: Ownership::Free,
                address: None,
                parked: None,
                lock_observer: None,
            }),
        }
    }

    /// Register the observer notified when the listener side must
    /// lock (true) or may unlock (false). Fired *before* the channel handle
    /// moves to the sweep side, so there is no window where both sides
    /// believe they own it.
    pub fn set_lock_observer<F>(&self, observer: F)
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        self.lock(|inner| inner.lock_observer = Some(Arc::new(observer)));
    }

    /// Current ownership state.
    pub fn ownership(&self) -> Ownership {
        self.lock(|inner| inner.ownership)
    }

    /// Address of the connected instrument, if any.
    pub fn address(&self) -> Option<String> {
        self.lock(|inner| inner.address.clone())
    }

    /// `Free → OwnedByListener`: adopt a freshly opened channel.
    pub fn connect_listener(
        &self,
        channel: Box<dyn Channel>,
        address: &str,
    ) -> SweepResult<ListenerGrant> {
        self.lock(|inner| {
            if inner.ownership != Ownership::Free {
                return Err(SweepError::InstrumentBusy(format!(
                    "cannot connect while session is {:?}",
                    inner.ownership
                )));
            }
            inner.ownership = Ownership::OwnedByListener;
            inner.address = Some(address.to_string());
            info!(%address, "listener connected");
            Ok(ListenerGrant { channel })
        })
    }

    /// `OwnedByListener → OwnedBySweep`: transfer the channel to a sweep.
    ///
    /// The lock observer is notified before the handle is reassigned.
    pub fn hand_to_sweep(&self, grant: ListenerGrant) -> SweepResult<SweepGrant> {
        let observer = self.lock(|inner| {
            if inner.ownership != Ownership::OwnedByListener {
                // A live ListenerGrant outside OwnedByListener means a caller
                // kept one across a disconnect; refuse and drop the handle.
                error!(state = ?inner.ownership, "stale listener grant offered to sweep");
                inner.ownership = Ownership::Free;
                inner.address = None;
                return Err(SweepError::InstrumentBusy(
                    "channel is not owned by the listener".into(),
                ));
            }
            Ok(inner.lock_observer.clone())
        })?;

        // Dependents reject new listener-initiated operations from here on.
        if let Some(observer) = &observer {
            observer(true);
        }

        self.lock(|inner| inner.ownership = Ownership::OwnedBySweep);
        debug!("channel handed to sweep");
        Ok(SweepGrant {
            channel: grant.channel,
        })
    }

    /// `OwnedBySweep → OwnedByListener`: take the channel back after a sweep
    /// ends, validate it still answers, and park it for the listener.
    ///
    /// A channel that fails the health probe is dropped and the session goes
    /// `Free`; the failure surfaces as [`SweepError::SessionLost`] instead of
    /// being silently treated as available.
    pub fn release_from_sweep(
        &self,
        grant: SweepGrant,
        commands: &CommandSet,
        tuning: &Tuning,
    ) -> SweepResult<()> {
        let mut channel = grant.channel;
        let healthy = probe_channel(&mut *channel, commands, tuning);

        let observer = self.lock(|inner| {
            let observer = inner.lock_observer.clone();
            match &healthy {
                Ok(()) => {
                    inner.ownership = Ownership::OwnedByListener;
                    inner.parked = Some(channel);
                    debug!("channel released back to listener");
                }
                Err(reason) => {
                    inner.ownership = Ownership::Free;
                    inner.address = None;
                    inner.parked = None;
                    warn!(%reason, "released channel failed health probe; session dropped");
                }
            }
            observer
        });

        if let Some(observer) = &observer {
            observer(false);
        }

        healthy.map_err(SweepError::SessionLost)
    }

    /// Retrieve the parked channel after a sweep returned it.
    pub fn reclaim_listener(&self) -> SweepResult<ListenerGrant> {
        self.lock(|inner| match inner.ownership {
            Ownership::OwnedBySweep => Err(SweepError::InstrumentBusy(
                "a sweep still owns the channel".into(),
            )),
            Ownership::Free => Err(SweepError::SessionLost(
                "no channel to reclaim".into(),
            )),
            Ownership::OwnedByListener => match inner.parked.take() {
                Some(channel) => Ok(ListenerGrant { channel }),
                None => Err(SweepError::InstrumentBusy(
                    "listener grant is already out".into(),
                )),
            },
        })
    }

    /// `OwnedByListener → Free`: drop the channel entirely.
    pub fn disconnect_listener(&self, grant: ListenerGrant) {
        drop(grant.channel);
        self.lock(|inner| {
            inner.ownership = Ownership::Free;
            inner.address = None;
            inner.parked = None;
        });
        info!("listener disconnected");
    }

    fn lock<R>(&self, f: impl FnOnce(&mut ArbiterInner) -> R) -> R {
        // Lock poisoning means a panic while holding the arbiter; the state
        // is still internally consistent, so continue with it.
        match self.inner.lock() {
            Ok(mut guard) => f(&mut guard),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }
}

impl Default for SessionArbiter {
    fn default() -> Self {
        Self::new()
    }
}

/// One cheap command/response exchange to prove the channel still answers.
fn probe_channel(
    channel: &mut dyn Channel,
    commands: &CommandSet,
    tuning: &Tuning,
) -> Result<(), String> {
    let mut guard = TimeoutGuard::new(channel, tuning.command_timeout);
    let channel = guard.channel();
    if let Err(err) = channel.write_line(&commands.health_probe) {
        return Err(format!("probe write failed: {err}"));
    }
    match channel.read_line() {
        Ok(_) => Ok(()),
        Err(ChannelError::Timeout(t)) => Err(format!("probe unanswered after {t:?}")),
        Err(err) => Err(format!("probe read failed: {err}")),
    }
}
