use std::{io, string};

use thiserror::Error;

/// Errors from the serial port and its codecs.
#[derive(Debug, Error)]
pub enum SerialPortError {
    /// IO related errors.
    #[error("Underlying IO problem: {0}")]
    IO(#[from] io::Error),

    /// Utf8 related errors.
    #[error("Problem with UTF8 conversion")]
    Utf8(#[from] string::FromUtf8Error),

    /// Serial port disconnected.
    #[error("Serial port disconnected")]
    Disconnected,
}
