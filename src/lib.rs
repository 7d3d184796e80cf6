#![deny(missing_docs)]

//! This crate places and monitors voice calls through GSM/LTE USB modems ("dongles").
//!
//! By default, serial ports with paths starting with `/dev/ttyUSB` are probed.
//! Each port answering the AT handshake with an IMEI becomes a device.
//!
//! Every device has a session: a single task reading its serial port,
//! routing each line either to the command waiting for a reply
//! or to the call state machine as an unsolicited result code.
//!
//! Call progress is published as events, see [`events::Events`].
//!
//! A scripted modem is available in [`mock`], which allows the whole engine
//! to be exercised without any hardware present.

/// AT commands, replies and unsolicited result codes.
pub mod command;

/// Serial port plumbing.
pub mod serial;

/// The AT session engine.
pub mod session;

/// Probing ports for modems.
pub mod probe;

/// Registered devices.
pub mod registry;

/// The call state machine.
pub mod call;

/// A modem in service.
pub mod device;

/// Dial strings.
pub mod dial;

/// Events observable by the channel layer.
pub mod events;

/// Resetting dongles.
pub mod reset;

/// The owner of all devices.
pub mod control_center;

/// Configuration.
pub mod config;

/// The command line interface.
pub mod cli;

/// Logging.
pub mod logging;

/// Possible errors in this library.
pub mod error;

/// Mocked modems and ports.
pub mod mock;
