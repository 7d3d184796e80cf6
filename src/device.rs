use std::{fmt::Display, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    call::{CallContext, CallMachine, DeviceState},
    command::{CommandRequest, Reply},
    config::SessionSettings,
    dial,
    error::Error,
    events::Events,
    serial::Transport,
    session::Session,
};

/// The hardware identity of a modem.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Imei(String);

impl Imei {
    /// Shortest accepted IMEI. Some firmware leaves out the check digit.
    pub const MIN_LEN: usize = 14;

    /// Trimmed, at least [`Self::MIN_LEN`] long, and nothing but decimal digits.
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();

        if text.len() >= Self::MIN_LEN && text.bytes().all(|b| b.is_ascii_digit()) {
            Some(Self(text.to_owned()))
        } else {
            None
        }
    }

    /// The digits.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Imei {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What identifies a registered device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Logical name, unique within the registry.
    pub name: String,

    /// Hardware identity, unique within the registry.
    pub imei: Imei,

    /// Where the control channel lives.
    pub path: String,
}

/// A snapshot of a device, for status output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSummary {
    /// Logical name.
    pub name: String,

    /// Hardware identity.
    pub imei: Imei,

    /// Control channel path.
    pub path: String,

    /// State at the time of the snapshot.
    pub state: DeviceState,

    /// The call, if any.
    pub call: Option<CallContext>,
}

/// A registered modem: identity, call state and a running session.
#[derive(Debug)]
pub struct Device {
    info: DeviceInfo,
    machine: Arc<CallMachine>,
    session: Session,
    command_timeout: Duration,
}

impl Device {
    /// Take ownership of a freshly opened transport and put the device in service.
    pub async fn start(
        info: DeviceInfo,
        mut transport: Transport,
        events: Arc<Events>,
        settings: &SessionSettings,
        flush_quiet: Duration,
    ) -> Result<Self, Error> {
        let machine = Arc::new(CallMachine::new(&info.name, events));

        // Whatever the modem said since the probe is nobody's reply.
        transport.discard_input(flush_quiet).await?;

        let session = Session::spawn(transport, machine.clone(), settings.poll_interval());
        if let Err(e) = machine.ready() {
            session.shutdown().await;
            return Err(e);
        }

        info!(name = %info.name, imei = %info.imei, path = %info.path, "Device ready");

        Ok(Self {
            info,
            machine,
            session,
            command_timeout: settings.command_timeout(),
        })
    }

    /// Name, IMEI, path.
    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    /// The logical name.
    pub fn name(&self) -> &str {
        &self.info.name
    }

    /// The current state.
    pub fn state(&self) -> DeviceState {
        self.machine.state()
    }

    /// The current call, if any.
    pub fn call(&self) -> Option<CallContext> {
        self.machine.call()
    }

    /// A snapshot for status output.
    pub fn summary(&self) -> DeviceSummary {
        DeviceSummary {
            name: self.info.name.clone(),
            imei: self.info.imei.clone(),
            path: self.info.path.clone(),
            state: self.machine.state(),
            call: self.machine.call(),
        }
    }

    fn note_failure(&self, error: &Error) {
        if error.is_fatal() {
            self.machine.fault(&error.to_string());
        }
    }

    /// Place a call. Progress is reported on the event stream.
    ///
    /// Only a [`DeviceState::Ready`] device takes a call, others give [`Error::Busy`].
    pub async fn dial(&self, number: &str) -> Result<CallContext, Error> {
        dial::validate_number(number)?;

        let call = self.machine.begin_call(number)?;

        match self
            .session
            .send(CommandRequest::dial(number, self.command_timeout))
            .await
        {
            Ok(()) => Ok(call),
            Err(e) => {
                warn!(name = %self.info.name, %e, "Dial not sent");

                if e.is_fatal() {
                    self.note_failure(&e);
                } else {
                    self.machine.abandon_call(call.id);
                }

                Err(e)
            }
        }
    }

    /// Hang up the current call.
    ///
    /// The call is released once `ATH` is written, without waiting for the
    /// modem to confirm. If writing fails the call is kept.
    /// Gives [`Error::NotFound`] if there is no call.
    pub async fn hangup(&self) -> Result<CallContext, Error> {
        let call = self.machine.active_call()?;

        if let Err(e) = self
            .session
            .send(CommandRequest::hangup(self.command_timeout))
            .await
        {
            warn!(name = %self.info.name, %e, "Hangup not sent");
            self.note_failure(&e);

            return Err(e);
        }

        match self.machine.end_call(call.id) {
            Ok(call) => Ok(call),
            Err(_) => {
                debug!(name = %self.info.name, call = %call.id, "Call ended while hanging up");
                Ok(call)
            }
        }
    }

    /// Send a command and wait for its reply.
    ///
    /// For commands beyond call control, e.g. signal quality.
    pub async fn command(&self, request: CommandRequest) -> Result<Reply, Error> {
        if self.machine.state() == DeviceState::Error {
            return Err(Error::IoFailure(format!(
                "`{}` has failed and needs a reset",
                self.info.name
            )));
        }

        let result = self.session.command(request).await;
        if let Err(e) = &result {
            self.note_failure(e);
        }

        result
    }

    /// Send a command with the configured timeout and wait for its reply.
    pub async fn query(&self, text: &str) -> Result<Reply, Error> {
        self.command(CommandRequest::new(text, self.command_timeout))
            .await
    }

    /// Stop the session and close the transport.
    pub async fn shutdown(&self) {
        self.session.shutdown().await;
        info!(name = %self.info.name, "Device shut down");
    }
}
