use std::{path::Path, time::Duration};

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::{device::Imei, error::Error};

/// A device as described by a configuration file.
/// Binds an operator chosen name to the IMEI the hardware reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigDevice {
    /// The logical name, used in dial strings.
    pub name: String,

    /// The IMEI the modem is expected to report.
    pub imei: String,
}

impl ConfigDevice {
    /// Bind `name` to `imei`.
    pub fn new(name: &str, imei: &str) -> Self {
        Self {
            name: name.to_owned(),
            imei: imei.to_owned(),
        }
    }
}

/// How candidate ports are found and probed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Discovery {
    /// Only ports whose path starts with this are probed.
    /// Resets are also only allowed within this namespace.
    pub prefix: String,

    /// Line speed.
    pub baud: u32,

    /// How long to let a freshly opened port stabilize.
    pub settle_ms: u64,

    /// How many blind `AT` to send before the handshake.
    pub wakeup_commands: usize,

    /// How long the port must be quiet before the flush is considered done.
    pub flush_quiet_ms: u64,

    /// Deadline for each handshake step.
    pub command_timeout_ms: u64,
}

impl Default for Discovery {
    fn default() -> Self {
        Self {
            prefix: "/dev/ttyUSB".into(),
            baud: 115_200,
            settle_ms: 1000,
            wakeup_commands: 2,
            flush_quiet_ms: 100,
            command_timeout_ms: 3000,
        }
    }
}

/// How running sessions behave.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Upper bound on how long the session task waits per read.
    /// Shutdown is noticed within this time.
    pub poll_interval_ms: u64,

    /// Deadline for commands sent to a running device.
    pub command_timeout_ms: u64,
}

impl SessionSettings {
    /// See [`Self::poll_interval_ms`].
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// See [`Self::command_timeout_ms`].
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            command_timeout_ms: 3000,
        }
    }
}

/// The external program which power cycles a USB device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResetSettings {
    /// Program to run. Gets the device path as its last argument.
    pub program: String,

    /// Arguments put before the device path.
    pub args: Vec<String>,
}

impl Default for ResetSettings {
    fn default() -> Self {
        Self {
            program: "usbreset".into(),
            args: vec![],
        }
    }
}

/// The configuration used for running the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Names for known hardware.
    /// Devices not listed here get a default name.
    pub devices: Vec<ConfigDevice>,

    /// See [`Discovery`].
    pub discovery: Discovery,

    /// See [`SessionSettings`].
    pub session: SessionSettings,

    /// See [`ResetSettings`].
    pub reset: ResetSettings,
}

impl Config {
    fn ron() -> ron::Options {
        ron::Options::default()
            .with_default_extension(ron::extensions::Extensions::IMPLICIT_SOME)
            .with_default_extension(ron::extensions::Extensions::UNWRAP_NEWTYPES)
    }

    /// Deserialize a .ron file's contents.
    pub fn deserialize(input: &str) -> Result<Self, Error> {
        Self::ron()
            .from_str::<Config>(input)
            .map_err(|e| Error::BadConfig(e.to_string()))
    }

    /// An example configuration with some fields filled in.
    pub fn example() -> Self {
        Self {
            devices: vec![
                ConfigDevice::new("office", "352099001761481"),
                ConfigDevice::new("lab", "861234567890123"),
            ],
            reset: ResetSettings {
                program: "usbreset".into(),
                args: vec!["--quiet".into()],
            },
            ..Default::default()
        }
    }

    /// Serialize the configuration in a "pretty" (i.e. non-compact) fashion.
    pub fn serialize_pretty(&self) -> Result<String, Error> {
        Self::ron()
            .to_string_pretty(self, ron::ser::PrettyConfig::default())
            .map_err(|e| Error::BadConfig(e.to_string()))
    }

    /// Setup a new, validated, configuration from a RON file.
    pub fn new_from_path<P: AsRef<Path>>(p: P) -> Result<Self, Error> {
        let path = p.as_ref();
        let s = std::fs::read_to_string(path)
            .map_err(|e| Error::BadConfig(format!("Could not read {path:?}: {e}")))?;

        let config = Self::deserialize(&s)?;
        config.validate()?;

        Ok(config)
    }

    fn check_duplicate_names(&self) -> Result<(), Error> {
        let duplicates = self
            .devices
            .iter()
            .map(|device| &device.name)
            .duplicates()
            .collect::<Vec<_>>();

        if duplicates.is_empty() {
            Ok(())
        } else {
            Err(Error::BadConfig(format!(
                "Device names are used in dial strings and must be unique. Duplicates: {duplicates:?}"
            )))
        }
    }

    fn check_duplicate_imeis(&self) -> Result<(), Error> {
        let duplicates = self
            .devices
            .iter()
            .filter_map(|device| Imei::parse(&device.imei))
            .duplicates()
            .map(|imei| imei.as_str().to_owned())
            .collect::<Vec<_>>();

        if duplicates.is_empty() {
            Ok(())
        } else {
            Err(Error::BadConfig(format!(
                "An IMEI identifies one modem and can only have one name. Duplicates: {duplicates:?}"
            )))
        }
    }

    fn check_devices(&self) -> Result<(), Error> {
        for (index, device) in self.devices.iter().enumerate() {
            if device.name.is_empty() || device.name.contains('/') {
                return Err(Error::BadConfig(format!(
                    "The device with index {index} (zero indexed) has the name `{}`. Names must be non-empty and must not contain `/`.",
                    device.name
                )));
            }

            if Imei::parse(&device.imei).is_none() {
                return Err(Error::BadConfig(format!(
                    "The device `{}` has the IMEI `{}`, which is not at least 14 decimal digits.",
                    device.name, device.imei
                )));
            }
        }

        Ok(())
    }

    fn check_discovery(&self) -> Result<(), Error> {
        if self.discovery.prefix.is_empty() {
            return Err(Error::BadConfig(
                "The discovery prefix is empty, which would probe every port on the system.".into(),
            ));
        }

        Ok(())
    }

    fn check_session(&self) -> Result<(), Error> {
        if self.session.poll_interval_ms == 0 {
            return Err(Error::BadConfig(
                "The session poll interval must be at least one millisecond.".into(),
            ));
        }

        if self.session.command_timeout_ms == 0 || self.discovery.command_timeout_ms == 0 {
            return Err(Error::BadConfig(
                "Command timeouts must be at least one millisecond.".into(),
            ));
        }

        Ok(())
    }

    /// Check the invariants a configuration must uphold.
    pub fn validate(&self) -> Result<(), Error> {
        self.check_devices()?;
        self.check_duplicate_names()?;
        self.check_duplicate_imeis()?;
        self.check_discovery()?;
        self.check_session()?;

        Ok(())
    }
}
