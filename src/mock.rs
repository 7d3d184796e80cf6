//! A scripted modem, useful to test the engine without the actual dongles.
//!
//! A [`MockModem`] answers AT commands over an in-memory pipe.
//! [`MockPorts`] hands such pipes out as if they were serial ports.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, DuplexStream},
    sync::mpsc,
};
use tracing::{debug, debug_span, trace, warn, Instrument};

use crate::{
    error::Error,
    serial::{transport::discovery_order, PortOpener, Transport},
};

const OK: &str = "\r\nOK\r\n";
const ERROR: &str = "\r\nERROR\r\n";

#[derive(Debug)]
enum ToModem {
    Inject(String),
    Disconnect,
}

#[derive(Debug)]
struct ModemState {
    /// Checked newest first. A key ending in `*` matches by prefix.
    replies: Vec<(String, String)>,

    /// For commands without a scripted reply. `None` stays silent.
    fallback: Option<String>,

    echo: bool,
    banner: Option<String>,
    received: Vec<String>,

    connection: Option<(u64, mpsc::UnboundedSender<ToModem>)>,
    connections: u64,
}

impl ModemState {
    fn lookup(&self, line: &str) -> Option<&str> {
        self.replies
            .iter()
            .rev()
            .find(|(key, _)| match key.strip_suffix('*') {
                Some(prefix) => line.starts_with(prefix),
                None => line == key,
            })
            .map(|(_, reply)| reply.as_str())
            .or(self.fallback.as_deref())
    }

    fn respond(&mut self, line: &str) -> String {
        self.received.push(line.to_owned());

        let mut out = String::new();
        if self.echo {
            out.push_str(line);
            out.push('\r');
        }

        match line {
            "ATE0" => self.echo = false,
            "ATE1" => self.echo = true,
            _ => {}
        }

        if let Some(reply) = self.lookup(line) {
            out.push_str(reply);
        }

        out
    }
}

/// A modem which answers over an in-memory pipe.
///
/// Clones share the same modem.
#[derive(Debug, Clone)]
pub struct MockModem {
    state: Arc<Mutex<ModemState>>,
}

impl MockModem {
    fn with_replies(replies: Vec<(String, String)>, fallback: Option<String>) -> Self {
        Self {
            state: Arc::new(Mutex::new(ModemState {
                replies,
                fallback,
                echo: false,
                banner: None,
                received: vec![],
                connection: None,
                connections: 0,
            })),
        }
    }

    /// A well behaved modem reporting `imei`.
    ///
    /// Answers `OK` to the handshake, dial and hangup,
    /// and `ERROR` to anything else.
    pub fn new(imei: &str) -> Self {
        let replies = [
            ("AT", OK.to_owned()),
            ("ATE0", OK.to_owned()),
            ("ATE1", OK.to_owned()),
            ("AT+CGSN", format!("\r\n{imei}\r\n{OK}")),
            ("ATD*", OK.to_owned()),
            ("ATH", OK.to_owned()),
        ]
        .into_iter()
        .map(|(command, reply)| (command.to_owned(), reply))
        .collect();

        Self::with_replies(replies, Some(ERROR.to_owned()))
    }

    /// Something on a serial port which never answers.
    pub fn unresponsive() -> Self {
        Self::with_replies(vec![], None)
    }

    /// Something on a serial port which answers `ERROR` to everything.
    pub fn erroring() -> Self {
        Self::with_replies(vec![], Some(ERROR.to_owned()))
    }

    fn lock(&self) -> MutexGuard<'_, ModemState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Answer `command` with `reply` (raw, including line endings).
    /// A trailing `*` in `command` matches any command with that prefix.
    pub fn reply(self, command: &str, reply: &str) -> Self {
        self.lock()
            .replies
            .push((command.to_owned(), reply.to_owned()));
        self
    }

    /// Never answer `command`.
    pub fn silent(self, command: &str) -> Self {
        self.reply(command, "")
    }

    /// Start with local echo on or off.
    pub fn echo(self, echo: bool) -> Self {
        self.lock().echo = echo;
        self
    }

    /// Print this as soon as a connection is made.
    pub fn banner(self, banner: &str) -> Self {
        self.lock().banner = Some(banner.to_owned());
        self
    }

    /// Every command received so far, without line terminators.
    pub fn received(&self) -> Vec<String> {
        self.lock().received.clone()
    }

    /// Is a transport connected right now?
    pub fn is_connected(&self) -> bool {
        self.lock().connection.is_some()
    }

    /// How many times a transport has been connected.
    pub fn connections(&self) -> u64 {
        self.lock().connections
    }

    fn send(&self, message: ToModem) {
        match &self.lock().connection {
            Some((_, tx)) => {
                if tx.send(message).is_err() {
                    warn!("Mock connection is gone");
                }
            }
            None => warn!(?message, "Mock is not connected"),
        }
    }

    /// Put `text` on the wire unprompted, like a URC.
    pub fn inject(&self, text: &str) {
        self.send(ToModem::Inject(text.to_owned()));
    }

    /// Drop the connection, like pulling the dongle out.
    pub fn disconnect(&self) {
        self.send(ToModem::Disconnect);
    }

    /// Connect a new transport to this modem.
    pub fn connect(&self, path: &str) -> Transport {
        let (ours, theirs) = tokio::io::duplex(4096);
        let (tx, rx) = mpsc::unbounded_channel();

        let (id, banner) = {
            let mut state = self.lock();
            state.connections += 1;
            state.connection = Some((state.connections, tx));

            (state.connections, state.banner.clone())
        };

        tokio::spawn(
            self.clone()
                .serve(id, theirs, rx, banner)
                .instrument(debug_span!("mock", %path)),
        );

        Transport::from_io(path, ours)
    }

    async fn serve(
        self,
        id: u64,
        mut port: DuplexStream,
        mut rx: mpsc::UnboundedReceiver<ToModem>,
        banner: Option<String>,
    ) {
        debug!("Mock connected");

        if let Some(banner) = banner {
            if port.write_all(banner.as_bytes()).await.is_err() {
                warn!("Could not write banner");
            }
        }

        let mut buf = BytesMut::new();
        let mut line = String::new();

        loop {
            tokio::select! {
                message = rx.recv() => match message {
                    Some(ToModem::Inject(text)) => {
                        trace!(%text, "Injecting");
                        if port.write_all(text.as_bytes()).await.is_err() {
                            break;
                        }
                    }
                    Some(ToModem::Disconnect) | None => break,
                },

                read = port.read_buf(&mut buf) => {
                    match read {
                        Ok(0) | Err(_) => break,
                        Ok(_) => {}
                    }

                    let text = String::from_utf8_lossy(&buf).into_owned();
                    buf.clear();

                    let mut out = String::new();
                    for c in text.chars() {
                        if c == '\r' || c == '\n' {
                            if !line.is_empty() {
                                trace!(%line, "Mock got command");
                                out.push_str(&self.lock().respond(&line));
                                line.clear();
                            }
                        } else {
                            line.push(c);
                        }
                    }

                    if !out.is_empty() && port.write_all(out.as_bytes()).await.is_err() {
                        break;
                    }
                }
            }
        }

        let mut state = self.lock();
        if state.connection.as_ref().is_some_and(|(current, _)| *current == id) {
            state.connection = None;
        }

        debug!("Mock disconnected");
    }
}

/// Serial ports backed by [`MockModem`]s.
#[derive(Debug, Clone, Default)]
pub struct MockPorts {
    modems: Arc<Mutex<BTreeMap<String, MockModem>>>,
}

impl MockPorts {
    /// No ports at all.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, MockModem>> {
        self.modems.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Plug `modem` in at `path`.
    pub fn with(self, path: &str, modem: MockModem) -> Self {
        self.plug(path, modem);
        self
    }

    /// Plug `modem` in at `path`.
    pub fn plug(&self, path: &str, modem: MockModem) {
        self.lock().insert(path.to_owned(), modem);
    }

    /// Remove whatever is at `path`. Connections stay up.
    pub fn unplug(&self, path: &str) -> Option<MockModem> {
        self.lock().remove(path)
    }

    /// The modem at `path`.
    pub fn modem(&self, path: &str) -> Option<MockModem> {
        self.lock().get(path).cloned()
    }
}

#[async_trait]
impl PortOpener for MockPorts {
    async fn open(&self, path: &str) -> Result<Transport, Error> {
        let modem = self.modem(path).ok_or_else(|| Error::CannotOpen {
            path: path.to_owned(),
            problem: "No such file or directory".into(),
        })?;

        Ok(modem.connect(path))
    }

    fn candidates(&self, prefix: &str) -> Vec<String> {
        discovery_order(self.lock().keys().filter(|path| path.starts_with(prefix)).cloned())
    }
}
