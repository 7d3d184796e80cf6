//! The per-device call state machine.
//!
//! ```text
//! Initializing -> Ready <-> Active
//!       \           |         /
//!        `------> Error <----'
//! ```
//!
//! `Error` is only left by resetting and rescanning the device.

use std::{
    fmt::Display,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    command::Urc,
    error::Error,
    events::{Event, Events},
    session::UrcHandler,
};

/// A caller visible handle to a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallId(Uuid);

impl CallId {
    /// A new, unique, call id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a device is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceState {
    /// Nothing registered.
    Free,

    /// Registered, session starting.
    Initializing,

    /// Idle, session running.
    Ready,

    /// Carrying a call.
    Active,

    /// The transport failed.
    Error,
}

impl Display for DeviceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DeviceState::Free => "free",
            DeviceState::Initializing => "initializing",
            DeviceState::Ready => "ready",
            DeviceState::Active => "active",
            DeviceState::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// How far a call got.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallPhase {
    /// Dial command sent, no answer yet.
    Dialing,

    /// The far end answered.
    Answered,
}

/// Why a call ended without us hanging up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureCause {
    /// The far end was busy.
    Busy,

    /// Nobody answered, or the carrier went away.
    NoAnswer,

    /// The device failed.
    Error,
}

impl Display for FailureCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureCause::Busy => "busy",
            FailureCause::NoAnswer => "no answer",
            FailureCause::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// A call bound to a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallContext {
    /// The handle given to the caller.
    pub id: CallId,

    /// The dialed number.
    pub number: String,

    /// How far the call got.
    pub phase: CallPhase,

    /// When the dial was accepted.
    pub started: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug)]
struct Machine {
    state: DeviceState,
    call: Option<CallContext>,
}

impl Machine {
    /// The call ended remotely. Back to ready.
    fn finish(&mut self, device: &str, cause: FailureCause) -> Option<Event> {
        let call = self.call.take()?;
        self.state = DeviceState::Ready;

        info!(%device, call = %call.id, %cause, "Call failed");

        Some(Event::CallFailed {
            device: device.to_owned(),
            call: call.id,
            cause,
        })
    }
}

/// State and call context of one device, driven by call control and URCs.
#[derive(Debug)]
pub struct CallMachine {
    device: String,
    inner: Mutex<Machine>,
    events: Arc<Events>,
}

impl CallMachine {
    /// A machine for a device which is being brought up.
    pub fn new(device: &str, events: Arc<Events>) -> Self {
        Self {
            device: device.to_owned(),
            inner: Mutex::new(Machine {
                state: DeviceState::Initializing,
                call: None,
            }),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Machine> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The current state.
    pub fn state(&self) -> DeviceState {
        self.lock().state
    }

    /// The current call, if any.
    pub fn call(&self) -> Option<CallContext> {
        self.lock().call.clone()
    }

    /// The session is running. A device which already failed stays failed.
    pub fn ready(&self) -> Result<(), Error> {
        let mut machine = self.lock();

        match machine.state {
            DeviceState::Free | DeviceState::Initializing => {
                machine.state = DeviceState::Ready;
                debug!(device = %self.device, "Ready");
                Ok(())
            }
            DeviceState::Ready | DeviceState::Active => Ok(()),
            DeviceState::Error => Err(Error::IoFailure(format!(
                "`{}` failed while starting",
                self.device
            ))),
        }
    }

    /// Bind a new call. Only a ready device takes one.
    pub fn begin_call(&self, number: &str) -> Result<CallContext, Error> {
        let mut machine = self.lock();

        if machine.state != DeviceState::Ready {
            return Err(Error::Busy(format!(
                "`{}` is {}",
                self.device, machine.state
            )));
        }

        let call = CallContext {
            id: CallId::new(),
            number: number.to_owned(),
            phase: CallPhase::Dialing,
            started: chrono::Utc::now(),
        };

        machine.state = DeviceState::Active;
        machine.call = Some(call.clone());

        info!(device = %self.device, call = %call.id, %number, "Call started");

        Ok(call)
    }

    /// Undo [`Self::begin_call`] when the dial never reached the wire.
    pub fn abandon_call(&self, id: CallId) {
        let mut machine = self.lock();

        if machine.call.as_ref().is_some_and(|call| call.id == id) {
            machine.call = None;
            machine.state = DeviceState::Ready;
            debug!(device = %self.device, call = %id, "Call abandoned");
        }
    }

    /// The call in progress.
    ///
    /// Returns [`Error::NotFound`] if there is none.
    pub fn active_call(&self) -> Result<CallContext, Error> {
        let machine = self.lock();

        match (&machine.call, machine.state) {
            (Some(call), DeviceState::Active) => Ok(call.clone()),
            (_, state) => Err(Error::NotFound(format!(
                "no call on `{}` ({state})",
                self.device
            ))),
        }
    }

    /// Release call `id` on a local hangup.
    ///
    /// Returns [`Error::NotFound`] if that call is not in progress.
    pub fn end_call(&self, id: CallId) -> Result<CallContext, Error> {
        let mut machine = self.lock();

        if machine.state != DeviceState::Active
            || machine.call.as_ref().map(|call| call.id) != Some(id)
        {
            return Err(Error::NotFound(format!(
                "call {id} is not in progress on `{}` ({})",
                self.device, machine.state
            )));
        }

        let call = machine
            .call
            .take()
            .ok_or_else(|| Error::NotFound(format!("no call on `{}`", self.device)))?;
        machine.state = DeviceState::Ready;

        info!(device = %self.device, call = %call.id, "Call hung up");

        Ok(call)
    }

    /// The transport failed. Any call fails with it.
    ///
    /// Reported once. A device already failed stays quiet.
    pub fn fault(&self, problem: &str) {
        let failed_call = {
            let mut machine = self.lock();
            if machine.state == DeviceState::Error {
                debug!(device = %self.device, %problem, "Already failed");
                return;
            }

            machine.state = DeviceState::Error;
            machine.call.take()
        };

        warn!(device = %self.device, %problem, "Device failed");

        if let Some(call) = failed_call {
            self.events.send_event(Event::CallFailed {
                device: self.device.clone(),
                call: call.id,
                cause: FailureCause::Error,
            });
        }

        self.events.send_event(Event::DeviceFault {
            device: self.device.clone(),
            problem: problem.to_owned(),
        });
    }
}

impl UrcHandler for CallMachine {
    fn on_urc(&self, urc: Urc) {
        let event = {
            let mut machine = self.lock();

            match (urc, machine.state) {
                (Urc::Connect, DeviceState::Active) => match machine.call.as_mut() {
                    Some(call) if call.phase == CallPhase::Dialing => {
                        call.phase = CallPhase::Answered;
                        info!(device = %self.device, call = %call.id, "Call answered");

                        Some(Event::Answered {
                            device: self.device.clone(),
                            call: call.id,
                        })
                    }
                    _ => {
                        debug!(device = %self.device, "Repeated CONNECT, ignoring");
                        None
                    }
                },
                (Urc::Busy, DeviceState::Active) => machine.finish(&self.device, FailureCause::Busy),
                (Urc::NoCarrier, DeviceState::Active) => {
                    machine.finish(&self.device, FailureCause::NoAnswer)
                }
                (Urc::Other(line), _) => {
                    debug!(device = %self.device, %line, "Unsolicited");

                    Some(Event::Unsolicited {
                        device: self.device.clone(),
                        line,
                    })
                }
                (urc, state) => {
                    debug!(device = %self.device, %urc, %state, "Call progress without a call, ignoring");
                    None
                }
            }
        };

        if let Some(event) = event {
            self.events.send_event(event);
        }
    }

    fn on_fault(&self, error: &Error) {
        self.fault(&error.to_string());
    }
}
