use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::serial::error::SerialPortError;

/// Errors thay may occur in this library.
#[derive(Debug, Error, Serialize, Deserialize, PartialEq, Eq, Clone)]
pub enum Error {
    /// The serial port could not be opened or configured.
    #[error("Could not open `{path}`. Problem: {problem}")]
    CannotOpen {
        /// The path we tried to open.
        path: String,

        /// What went wrong.
        problem: String,
    },

    /// The port did not complete the probe handshake,
    /// or did not report an IMEI.
    #[error("`{path}` is not a modem: {reason}")]
    NotAModem {
        /// The probed path.
        path: String,

        /// Which step failed.
        reason: String,
    },

    /// Reading or writing the transport failed.
    /// Fatal for the device when observed by its session.
    #[error("IO failure: {0}")]
    IoFailure(String),

    /// The deadline elapsed before the expected data arrived.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The device was not in a state allowing the request,
    /// or a command was already outstanding.
    #[error("Busy: {0}")]
    Busy(String),

    /// No such device, or no call to act on.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The IMEI is already registered.
    #[error("IMEI {imei} (seen on `{path}`) is already registered")]
    Duplicate {
        /// The IMEI reported twice.
        imei: String,

        /// The port which reported it the second time.
        path: String,
    },

    /// A dial string was not of the form `<device>/<number>`.
    #[error("Bad dial string `{0}`, expected `<device>/<number>`")]
    BadDialString(String),

    /// The configuration is not valid.
    #[error("Bad configuration. Problem: {0}")]
    BadConfig(String),

    /// A reset was requested for a path outside the device namespace.
    #[error("Refusing to reset `{0}`: not a device path")]
    BadResetPath(String),

    /// The reset program could not be started.
    #[error("Could not start the reset program: {0}")]
    ResetFailed(String),
}

impl Error {
    /// If the error is a bad config, get the problem.
    pub fn try_into_bad_config(self) -> Option<String> {
        if let Self::BadConfig(problem) = self {
            Some(problem)
        } else {
            None
        }
    }

    /// Transport faults end the session of the device.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::IoFailure(_))
    }
}

impl From<SerialPortError> for Error {
    fn from(e: SerialPortError) -> Self {
        Self::IoFailure(e.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::IoFailure(e.to_string())
    }
}
