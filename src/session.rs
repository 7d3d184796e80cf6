//! The AT session engine.
//!
//! A modem has one serial stream carrying two kinds of traffic:
//! replies to the command we last sent, and unsolicited result codes (URCs)
//! which may show up at any time.
//!
//! Before a device is in service, commands are exchanged directly on the
//! [`Transport`] with [`exchange`]. Once a [`Session`] is spawned, a single
//! task owns the reading side. Nobody else reads. Callers install their
//! command in the outstanding slot, write it, and wait for the task to
//! resolve it.

use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use bytes::BytesMut;
use tokio::{
    sync::{self, oneshot},
    task::JoinHandle,
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

use crate::{
    command::{CommandRequest, Reply, Status, Terminators, Urc},
    error::Error,
    serial::transport::{Transport, TransportReader, TransportWriter},
};

/// Send `request` and read its reply directly from the transport.
///
/// Only for use while no session owns the transport, i.e. while probing.
pub async fn exchange(transport: &mut Transport, request: &CommandRequest) -> Result<Reply, Error> {
    transport.write_line(&request.text).await?;

    let deadline = Instant::now() + request.timeout;
    let mut buf = BytesMut::new();

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(Error::Timeout(format!("reply to `{request}`")));
        }

        match transport.read_available(&mut buf, remaining).await {
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf);

                if let Some(status) = request.terminators.classify(&text) {
                    trace!(%request, ?status, "Exchange done");
                    return Ok(Reply {
                        status,
                        text: text.into_owned(),
                    });
                }
            }
            Err(Error::Timeout(_)) => {
                return Err(Error::Timeout(format!("reply to `{request}`")));
            }
            Err(e) => return Err(e),
        }
    }
}

/// Receives what the session could not attribute to a command.
///
/// Called from the session task. Implementations must not block.
pub trait UrcHandler: Send + Sync + 'static {
    /// A line which was not part of a reply.
    fn on_urc(&self, urc: Urc);

    /// The transport failed. The session has stopped reading.
    fn on_fault(&self, error: &Error);
}

/// A command waiting for its terminator.
#[derive(Debug)]
struct Pending {
    id: u64,
    command: String,
    terminators: Terminators,
    accumulated: String,

    /// `None` when nobody waits for the reply (fire-and-forget).
    reply: Option<oneshot::Sender<Reply>>,
}

impl Pending {
    /// Someone is still waiting for this one.
    fn is_awaited(&self) -> bool {
        self.reply
            .as_ref()
            .map(|reply| !reply.is_closed())
            .unwrap_or(false)
    }

    fn resolve(self, status: Status) {
        debug!(command = %self.command, ?status, "Command resolved");

        if let Some(reply) = self.reply {
            let reply_result = reply.send(Reply {
                status,
                text: self.accumulated,
            });

            if reply_result.is_err() {
                debug!("Nobody waiting for the reply anymore");
            }
        }
    }
}

#[derive(Debug, Default)]
struct Slot {
    pending: Option<Pending>,
    next_id: u64,

    /// Set when the session task has stopped.
    closed: bool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Route one line either into the outstanding command or out as a URC.
fn route(line: &str, slot: &Mutex<Slot>, handler: &dyn UrcHandler) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }

    let urc = Urc::parse(line);
    let mut guard = lock(slot);

    if urc.is_call_control() {
        // Call progress supersedes a fire-and-forget command, but never
        // ends up in a reply someone waits for.
        if guard.pending.as_ref().is_some_and(|p| !p.is_awaited()) {
            if let Some(superseded) = guard.pending.take() {
                debug!(command = %superseded.command, %urc, "Superseded by call progress");
            }
        }
        drop(guard);

        handler.on_urc(urc);
        return;
    }

    let Some(pending) = guard.pending.as_mut() else {
        drop(guard);

        handler.on_urc(urc);
        return;
    };

    pending.accumulated.push_str(line);
    pending.accumulated.push('\n');

    if let Some(status) = pending.terminators.classify(&pending.accumulated) {
        if let Some(pending) = guard.pending.take() {
            pending.resolve(status);
        }
    }
}

/// The loop owning the reading side of a transport.
async fn demultiplex(
    mut reader: TransportReader,
    slot: Arc<Mutex<Slot>>,
    handler: Arc<dyn UrcHandler>,
    poll_interval: Duration,
    cancel: CancellationToken,
) {
    info!("Session started");

    loop {
        let read = tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                debug!("Session cancelled");
                break;
            }

            read = reader.read_lines(poll_interval) => read,
        };

        match read {
            Ok(lines) => {
                for line in lines {
                    trace!(%line, "Line from port");
                    route(&line, &slot, &*handler);
                }
            }
            Err(Error::Timeout(_)) => continue,
            Err(e) => {
                error!(%e, "Transport fault, ending session");

                let pending = {
                    let mut slot = lock(&slot);
                    slot.closed = true;
                    slot.pending.take()
                };

                handler.on_fault(&e);

                // Wakes a waiting caller.
                drop(pending);
                return;
            }
        }
    }

    let mut slot = lock(&slot);
    slot.closed = true;
    slot.pending = None;
}

/// A running session on one device.
pub struct Session {
    path: String,
    writer: sync::Mutex<Option<TransportWriter>>,
    slot: Arc<Mutex<Slot>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").field("path", &self.path).finish()
    }
}

impl Session {
    /// Take ownership of `transport` and start demultiplexing it.
    ///
    /// The task waits at most `poll_interval` per read,
    /// so cancellation is seen in that time even with a stuck port.
    pub fn spawn(
        transport: Transport,
        handler: Arc<dyn UrcHandler>,
        poll_interval: Duration,
    ) -> Self {
        let path = transport.path().to_owned();
        let (reader, writer) = transport.split();

        let slot = Arc::new(Mutex::new(Slot::default()));
        let cancel = CancellationToken::new();

        let task = tokio::spawn(
            demultiplex(reader, slot.clone(), handler, poll_interval, cancel.clone())
                .instrument(info_span!("session", %path)),
        );

        Self {
            path,
            writer: sync::Mutex::new(Some(writer)),
            slot,
            cancel,
            task: Mutex::new(Some(task)),
        }
    }

    /// The path of the transport.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Is the session task still reading?
    pub fn is_running(&self) -> bool {
        !lock(&self.slot).closed
    }

    /// Is a command waiting for its reply?
    pub fn has_outstanding(&self) -> bool {
        lock(&self.slot).pending.is_some()
    }

    fn ensure_open(&self, slot: &Slot) -> Result<(), Error> {
        if slot.closed {
            return Err(Error::IoFailure(format!(
                "session on `{}` has ended",
                self.path
            )));
        }

        Ok(())
    }

    fn occupy(
        slot: &mut Slot,
        request: &CommandRequest,
        reply: Option<oneshot::Sender<Reply>>,
    ) -> u64 {
        if let Some(pending) = &slot.pending {
            debug!(command = %pending.command, superseded_by = %request, "Superseding unanswered command");
        }

        slot.next_id += 1;
        let id = slot.next_id;

        slot.pending = Some(Pending {
            id,
            command: request.text.clone(),
            terminators: request.terminators,
            accumulated: String::new(),
            reply,
        });

        id
    }

    /// Take the slot for a command someone waits for.
    fn install(
        &self,
        request: &CommandRequest,
        reply: oneshot::Sender<Reply>,
    ) -> Result<u64, Error> {
        let mut slot = lock(&self.slot);
        self.ensure_open(&slot)?;

        if let Some(pending) = slot.pending.as_ref().filter(|p| p.is_awaited()) {
            return Err(Error::Busy(format!(
                "`{}` is outstanding on `{}`",
                pending.command, self.path
            )));
        }

        Ok(Self::occupy(&mut slot, request, Some(reply)))
    }

    /// Take the slot for a fire-and-forget command.
    ///
    /// Gives `None` if a reply is awaited. The command then goes out
    /// without a slot, and the awaited reply keeps it.
    fn install_detached(&self, request: &CommandRequest) -> Result<Option<u64>, Error> {
        let mut slot = lock(&self.slot);
        self.ensure_open(&slot)?;

        if let Some(pending) = slot.pending.as_ref().filter(|p| p.is_awaited()) {
            debug!(command = %pending.command, alongside = %request, "Sending while a reply is awaited");
            return Ok(None);
        }

        Ok(Some(Self::occupy(&mut slot, request, None)))
    }

    /// Clear the slot if it still holds command `id`.
    fn clear(&self, id: u64) {
        let mut slot = lock(&self.slot);
        if slot.pending.as_ref().is_some_and(|p| p.id == id) {
            slot.pending = None;
        }
    }

    async fn write(&self, id: Option<u64>, request: &CommandRequest) -> Result<(), Error> {
        // Held for the write only, never while waiting for the reply.
        let mut writer = self.writer.lock().await;

        let result = match writer.as_mut() {
            Some(writer) => writer.write_line(&request.text).await,
            None => Err(Error::IoFailure(format!(
                "session on `{}` is shut down",
                self.path
            ))),
        };

        if let (Err(_), Some(id)) = (&result, id) {
            self.clear(id);
        }

        result
    }

    /// Send a command and wait for its reply.
    ///
    /// Rejected with [`Error::Busy`] if another reply is awaited,
    /// without touching the transport.
    /// On [`Error::Timeout`] the slot is cleared and the session carries on.
    pub async fn command(&self, request: CommandRequest) -> Result<Reply, Error> {
        let (reply_tx, reply_rx) = oneshot::channel();

        // The slot is taken before writing so a fast reply cannot be missed.
        // Lines read before this point are URCs. A line landing between
        // here and the write is taken as part of the reply.
        let id = self.install(&request, reply_tx)?;
        self.write(Some(id), &request).await?;

        match tokio::time::timeout(request.timeout, reply_rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(Error::IoFailure(format!(
                "session on `{}` ended before `{request}` was answered",
                self.path
            ))),
            Err(_) => {
                self.clear(id);
                warn!(%request, path = %self.path, "No reply in time");
                Err(Error::Timeout(format!("reply to `{request}`")))
            }
        }
    }

    /// Send a command without waiting for the reply.
    ///
    /// It still occupies the outstanding slot, so its terminator is not
    /// mistaken for a URC. Call progress or a later command supersedes it.
    ///
    /// Never [`Error::Busy`]: while another reply is awaited the command is
    /// written anyway, and its terminator may end up in that reply.
    pub async fn send(&self, request: CommandRequest) -> Result<(), Error> {
        let id = self.install_detached(&request)?;
        self.write(id, &request).await
    }

    /// Stop the session task, wait for it to let go of the port, then close the port.
    pub async fn shutdown(&self) {
        self.cancel.cancel();

        let task = lock(&self.task).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(?e, path = %self.path, "Session task did not end cleanly");
            }
        }

        if let Some(writer) = self.writer.lock().await.take() {
            writer.close().await;
        }

        debug!(path = %self.path, "Session shut down");
    }
}
