//! The byte level link to a modem.
//!
//! A [`Transport`] is opened on a device path, configured as a raw 8-N-1 line
//! without flow control, and has any input buffered by the kernel discarded.
//! Modems print boot banners which must not be taken as replies.
//!
//! Before a session takes ownership, the transport is used directly
//! (probing). A session splits it into a single reader and a shared writer.

use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use itertools::Itertools;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio_serial::{ClearBuffer, SerialPort, SerialPortBuilderExt};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, info, trace, warn};

use crate::{
    error::Error,
    serial::{
        codecs::lines::{LinesCodec, StringCodec},
        error::SerialPortError,
    },
};

/// How many bytes we ask for per read.
const READ_CHUNK: usize = 256;

/// Bytes without a line delimiter beyond this are noise, not a reply.
const MAX_BUF: usize = 8192;

/// Anything we can speak AT over.
/// Implemented by serial ports and by in-memory pipes in tests.
pub trait SerialIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> SerialIo for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// An open link to a (possible) modem.
pub struct Transport {
    path: String,
    io: Box<dyn SerialIo>,
    codec: StringCodec,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport").field("path", &self.path).finish()
    }
}

async fn read_with_timeout<R>(
    reader: &mut R,
    buf: &mut BytesMut,
    timeout: Duration,
) -> Result<usize, Error>
where
    R: AsyncRead + Unpin,
{
    buf.reserve(READ_CHUNK);

    match tokio::time::timeout(timeout, reader.read_buf(buf)).await {
        Ok(Ok(0)) => Err(SerialPortError::Disconnected.into()),
        Ok(Ok(n)) => Ok(n),
        Ok(Err(e)) => Err(SerialPortError::from(e).into()),
        Err(_) => Err(Error::Timeout(format!("no data within {timeout:?}"))),
    }
}

async fn write_line<W>(writer: &mut W, codec: &mut StringCodec, line: &str) -> Result<(), Error>
where
    W: AsyncWrite + Unpin,
{
    let mut dst = BytesMut::new();
    codec.encode(line.to_owned(), &mut dst)?;

    writer.write_all(&dst).await?;
    writer.flush().await?;

    Ok(())
}

impl Transport {
    /// Open the serial port at `path`.
    ///
    /// The port is put in raw mode (no echo, no line editing) at 8-N-1
    /// without flow control, and pending input is dropped.
    pub fn open(path: &str, baud: u32) -> Result<Self, Error> {
        let cannot_open = |problem: String| Error::CannotOpen {
            path: path.to_owned(),
            problem,
        };

        let port = tokio_serial::new(path, baud)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| cannot_open(e.to_string()))?;

        port.clear(ClearBuffer::All)
            .map_err(|e| cannot_open(format!("flush failed: {e}")))?;

        info!(%path, %baud, "Opened serial port");

        Ok(Self::from_io(path, port))
    }

    /// Wrap anything readable and writable as a transport.
    pub fn from_io<S: SerialIo + 'static>(path: &str, io: S) -> Self {
        Self {
            path: path.to_owned(),
            io: Box::new(io),
            codec: LinesCodec::at().into_string_codec(true),
        }
    }

    /// The path this transport was opened on.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Wait at most `timeout` for bytes, appending whatever arrives to `buf`.
    ///
    /// Returns [`Error::Timeout`] if nothing arrived,
    /// and [`Error::IoFailure`] if the port failed or went away.
    pub async fn read_available(
        &mut self,
        buf: &mut BytesMut,
        timeout: Duration,
    ) -> Result<usize, Error> {
        read_with_timeout(&mut self.io, buf, timeout).await
    }

    /// Put raw bytes on the wire.
    pub async fn write(&mut self, bytes: &[u8]) -> Result<(), Error> {
        trace!(path = %self.path, "Writing {} byte(s)", bytes.len());
        self.io.write_all(bytes).await?;
        self.io.flush().await?;

        Ok(())
    }

    /// Put a command on the wire, terminated by a carriage return.
    pub async fn write_line(&mut self, line: &str) -> Result<(), Error> {
        trace!(path = %self.path, %line, "Writing line");
        write_line(&mut self.io, &mut self.codec, line).await
    }

    /// Read and drop input until the line has been quiet for `quiet`.
    ///
    /// Returns how many bytes were dropped.
    pub async fn discard_input(&mut self, quiet: Duration) -> Result<usize, Error> {
        let mut buf = BytesMut::new();
        let mut discarded = 0;

        loop {
            match self.read_available(&mut buf, quiet).await {
                Ok(n) => {
                    discarded += n;
                    buf.clear();

                    // A port which never stops talking is not going to be useful,
                    // but that is for the handshake to find out.
                    if discarded > MAX_BUF {
                        warn!(path = %self.path, discarded, "Port keeps talking, giving up on flush");
                        break;
                    }
                }
                Err(Error::Timeout(_)) => break,
                Err(e) => return Err(e),
            }
        }

        if discarded > 0 {
            debug!(path = %self.path, discarded, "Discarded input");
        }

        Ok(discarded)
    }

    /// Close the transport.
    pub async fn close(mut self) {
        if let Err(e) = self.io.shutdown().await {
            debug!(path = %self.path, ?e, "Problem closing transport");
        }
        debug!(path = %self.path, "Closed transport");
    }

    /// Split into the reading side (owned by one session task)
    /// and the writing side (shared behind a lock).
    pub(crate) fn split(self) -> (TransportReader, TransportWriter) {
        let (reader, writer) = tokio::io::split(self.io);

        (
            TransportReader {
                path: self.path.clone(),
                io: reader,
                buf: BytesMut::new(),
                codec: self.codec.clone(),
            },
            TransportWriter {
                path: self.path,
                io: writer,
                codec: self.codec,
            },
        )
    }
}

/// The reading half of a [`Transport`].
pub(crate) struct TransportReader {
    path: String,
    io: ReadHalf<Box<dyn SerialIo>>,
    buf: BytesMut,
    codec: StringCodec,
}

impl TransportReader {
    /// Wait at most `timeout` for bytes, then return every complete line.
    /// A partial line stays buffered until its delimiter arrives.
    pub(crate) async fn read_lines(&mut self, timeout: Duration) -> Result<Vec<String>, Error> {
        let n = read_with_timeout(&mut self.io, &mut self.buf, timeout).await?;
        trace!(path = %self.path, "Read {n} byte(s)");

        let mut lines = vec![];
        while let Some(line) = self.codec.decode(&mut self.buf)? {
            lines.push(line);
        }

        if self.buf.len() > MAX_BUF {
            warn!(path = %self.path, len = self.buf.len(), "No line delimiter in sight, dropping buffer");
            self.buf.clear();
            self.codec.reset();
        }

        Ok(lines)
    }
}

/// The writing half of a [`Transport`].
pub(crate) struct TransportWriter {
    path: String,
    io: WriteHalf<Box<dyn SerialIo>>,
    codec: StringCodec,
}

impl TransportWriter {
    /// Put a command on the wire, terminated by a carriage return.
    pub(crate) async fn write_line(&mut self, line: &str) -> Result<(), Error> {
        trace!(path = %self.path, %line, "Writing line");
        write_line(&mut self.io, &mut self.codec, line).await
    }

    /// Shut the writing side down.
    pub(crate) async fn close(mut self) {
        if let Err(e) = self.io.shutdown().await {
            debug!(path = %self.path, ?e, "Problem closing transport");
        }
    }
}

/// Something which knows which ports exist and how to open them.
#[async_trait]
pub trait PortOpener: Send + Sync {
    /// Open the port at `path`.
    async fn open(&self, path: &str) -> Result<Transport, Error>;

    /// The ports whose path starts with `prefix`, in discovery order.
    fn candidates(&self, prefix: &str) -> Vec<String>;
}

/// Opens real serial ports.
#[derive(Debug, Clone)]
pub struct SerialOpener {
    baud: u32,
}

impl SerialOpener {
    /// Open ports at the given baud rate.
    pub fn new(baud: u32) -> Self {
        Self { baud }
    }
}

/// Sort so that `ttyUSB2` comes before `ttyUSB10`.
pub(crate) fn discovery_order(paths: impl IntoIterator<Item = String>) -> Vec<String> {
    paths
        .into_iter()
        .sorted_by(|a, b| a.len().cmp(&b.len()).then_with(|| a.cmp(b)))
        .collect()
}

#[async_trait]
impl PortOpener for SerialOpener {
    async fn open(&self, path: &str) -> Result<Transport, Error> {
        Transport::open(path, self.baud)
    }

    fn candidates(&self, prefix: &str) -> Vec<String> {
        match serialport::available_ports() {
            Ok(ports) => discovery_order(
                ports
                    .into_iter()
                    .map(|port| port.port_name)
                    .filter(|name| name.starts_with(prefix)),
            ),
            Err(e) => {
                warn!(?e, "Could not enumerate serial ports");
                vec![]
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn discovery_order_is_numeric() {
        let paths = ["/dev/ttyUSB10", "/dev/ttyUSB2", "/dev/ttyUSB0", "/dev/ttyUSB1"]
            .map(String::from);

        assert_eq!(
            discovery_order(paths),
            vec![
                "/dev/ttyUSB0",
                "/dev/ttyUSB1",
                "/dev/ttyUSB2",
                "/dev/ttyUSB10"
            ]
        );
    }

    #[tokio::test]
    async fn read_times_out_without_data() {
        let (ours, _theirs) = tokio::io::duplex(64);
        let mut transport = Transport::from_io("/dev/ttyTest0", ours);

        let mut buf = BytesMut::new();
        let result = transport
            .read_available(&mut buf, Duration::from_millis(20))
            .await;

        assert!(matches!(result, Err(Error::Timeout(_))));
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn read_after_hangup_is_io_failure() {
        let (ours, theirs) = tokio::io::duplex(64);
        let mut transport = Transport::from_io("/dev/ttyTest0", ours);
        drop(theirs);

        let mut buf = BytesMut::new();
        let result = transport
            .read_available(&mut buf, Duration::from_millis(20))
            .await;

        assert!(matches!(result, Err(Error::IoFailure(_))));
    }

    #[tokio::test]
    async fn discard_drops_banner() {
        let (ours, mut theirs) = tokio::io::duplex(64);
        let mut transport = Transport::from_io("/dev/ttyTest0", ours);

        theirs.write_all(b"\r\n^BOOT:123\r\n").await.unwrap();

        let discarded = transport
            .discard_input(Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(discarded, 13);

        theirs.write_all(b"OK\r\n").await.unwrap();
        let mut buf = BytesMut::new();
        transport
            .read_available(&mut buf, Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(&buf[..], b"OK\r\n");
    }

    #[tokio::test]
    async fn write_puts_bytes_as_is() {
        let (ours, mut theirs) = tokio::io::duplex(64);
        let mut transport = Transport::from_io("/dev/ttyTest0", ours);

        transport.write(b"AT\r\x1a").await.unwrap();

        let mut buf = [0u8; 4];
        theirs.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"AT\r\x1a");
    }

    #[tokio::test]
    async fn write_line_appends_carriage_return() {
        let (ours, mut theirs) = tokio::io::duplex(64);
        let mut transport = Transport::from_io("/dev/ttyTest0", ours);

        transport.write_line("ATE0").await.unwrap();

        let mut buf = [0u8; 5];
        theirs.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ATE0\r");
    }

    #[tokio::test]
    async fn reader_yields_complete_lines_only() {
        let (ours, mut theirs) = tokio::io::duplex(64);
        let (mut reader, _writer) = Transport::from_io("/dev/ttyTest0", ours).split();

        theirs.write_all(b"\r\nRING\r\nOK").await.unwrap();
        let lines = reader.read_lines(Duration::from_millis(100)).await.unwrap();
        assert_eq!(lines, vec!["", "RING"]);

        theirs.write_all(b"\r\n").await.unwrap();
        let lines = reader.read_lines(Duration::from_millis(100)).await.unwrap();
        assert_eq!(lines, vec!["OK"]);
    }
}
