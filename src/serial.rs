/// Serial port related errors.
pub mod error;

/// Opening, reading and writing a serial port.
pub mod transport;

/// Codecs for encoding/decoding messages to/from wire.
pub mod codecs;

pub use transport::{PortOpener, SerialIo, SerialOpener, Transport};
