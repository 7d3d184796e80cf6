//! AT commands, their replies, and unsolicited result codes.

use std::{fmt::Display, time::Duration};

use serde::{Deserialize, Serialize};

/// Success token.
pub const OK: &str = "OK";

/// Failure token.
pub const ERROR: &str = "ERROR";

/// Lines starting with this are failures, followed by an error code.
pub const CME_ERROR: &str = "+CME ERROR";

/// How a reply ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    /// A success terminator was seen.
    Ok,

    /// A failure terminator was seen.
    Failed,
}

/// Decides whether accumulated reply text is complete, and how it ended.
///
/// Matching is by substring, since firmware varies in what it puts around
/// the tokens. Text holding both kinds of token is a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Terminators {
    success: &'static [&'static str],
    failure: &'static [&'static str],
    failure_line_prefixes: &'static [&'static str],
}

impl Terminators {
    /// `OK` for success, `ERROR` or a `+CME ERROR` line for failure.
    pub const AT: Self = Self {
        success: &[OK],
        failure: &[ERROR],
        failure_line_prefixes: &[CME_ERROR],
    };

    /// `None` while the reply is incomplete.
    pub fn classify(&self, text: &str) -> Option<Status> {
        let failed = self.failure.iter().any(|token| text.contains(token))
            || text.lines().any(|line| {
                let line = line.trim_start();
                self.failure_line_prefixes
                    .iter()
                    .any(|prefix| line.starts_with(prefix))
            });

        if failed {
            Some(Status::Failed)
        } else if self.success.iter().any(|token| text.contains(token)) {
            Some(Status::Ok)
        } else {
            None
        }
    }
}

impl Default for Terminators {
    fn default() -> Self {
        Self::AT
    }
}

/// One command to put on the wire, and how to know when its reply is done.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRequest {
    /// The command, without line terminator.
    pub text: String,

    /// How long to wait for a terminator.
    pub timeout: Duration,

    /// What ends the reply.
    pub terminators: Terminators,
}

impl Display for CommandRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.text)
    }
}

impl CommandRequest {
    /// A command ended by the usual AT terminators.
    pub fn new(text: impl Into<String>, timeout: Duration) -> Self {
        Self {
            text: text.into(),
            timeout,
            terminators: Terminators::AT,
        }
    }

    /// Sent blind to wake a freshly attached modem.
    pub fn wake_up(timeout: Duration) -> Self {
        Self::new("AT", timeout)
    }

    /// Turn off local echo.
    pub fn echo_off(timeout: Duration) -> Self {
        Self::new("ATE0", timeout)
    }

    /// Is anyone there?
    pub fn liveness(timeout: Duration) -> Self {
        Self::new("AT", timeout)
    }

    /// Ask for the IMEI.
    pub fn identity(timeout: Duration) -> Self {
        Self::new("AT+CGSN", timeout)
    }

    /// Place a voice call. The trailing `;` makes it voice rather than data.
    pub fn dial(number: &str, timeout: Duration) -> Self {
        Self::new(format!("ATD{number};"), timeout)
    }

    /// Hang up whatever call is up.
    pub fn hangup(timeout: Duration) -> Self {
        Self::new("ATH", timeout)
    }
}

/// The text and outcome of a completed command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    /// How it ended.
    pub status: Status,

    /// Everything received up to and including the terminator.
    pub text: String,
}

impl Reply {
    /// Did the reply end in success?
    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }
}

/// A line the modem sent on its own accord.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Urc {
    /// The far end answered.
    Connect,

    /// The far end is busy.
    Busy,

    /// The call ended or never connected.
    NoCarrier,

    /// Anything else, like `RING` or network registration reports.
    Other(String),
}

impl Urc {
    /// Recognize a single line.
    pub fn parse(line: &str) -> Self {
        let line = line.trim();

        // Some firmware reports a rate: `CONNECT 9600`.
        if line == "CONNECT" || line.starts_with("CONNECT ") {
            Self::Connect
        } else if line == "BUSY" {
            Self::Busy
        } else if line == "NO CARRIER" {
            Self::NoCarrier
        } else {
            Self::Other(line.to_owned())
        }
    }

    /// Does this report call progress?
    pub fn is_call_control(&self) -> bool {
        !matches!(self, Self::Other(_))
    }
}

impl Display for Urc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Urc::Connect => write!(f, "CONNECT"),
            Urc::Busy => write!(f, "BUSY"),
            Urc::NoCarrier => write!(f, "NO CARRIER"),
            Urc::Other(line) => write!(f, "{line}"),
        }
    }
}
