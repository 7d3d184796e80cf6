use std::{collections::VecDeque, fmt::Display, sync::Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{info, trace};

use crate::call::{CallId, FailureCause};

/// What the channel layer gets to hear about.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Event {
    /// The far end answered.
    Answered {
        /// The device carrying the call.
        device: String,

        /// The call.
        call: CallId,
    },

    /// The call ended without a local hangup.
    CallFailed {
        /// The device carrying the call.
        device: String,

        /// The call.
        call: CallId,

        /// Why.
        cause: FailureCause,
    },

    /// A line from the modem which is not call progress.
    Unsolicited {
        /// The device which sent it.
        device: String,

        /// The line as received.
        line: String,
    },

    /// The transport failed. The device is out of service until reset.
    DeviceFault {
        /// The failed device.
        device: String,

        /// What went wrong.
        problem: String,
    },
}

impl Event {
    /// The device this event concerns.
    pub fn device(&self) -> &str {
        match self {
            Event::Answered { device, .. }
            | Event::CallFailed { device, .. }
            | Event::Unsolicited { device, .. }
            | Event::DeviceFault { device, .. } => device,
        }
    }
}

impl Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Event::Answered { device, call } => write!(f, "{device}: call {call} answered"),
            Event::CallFailed {
                device,
                call,
                cause,
            } => write!(f, "{device}: call {call} failed ({cause})"),
            Event::Unsolicited { device, line } => write!(f, "{device}: unsolicited `{line}`"),
            Event::DeviceFault { device, problem } => write!(f, "{device}: fault: {problem}"),
        }
    }
}

/// An event and when it happened.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimestampedEvent {
    /// The event.
    pub inner: Event,

    /// When the event happened.
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl TimestampedEvent {
    /// Stamp an event with the current time.
    pub fn new(event: Event) -> Self {
        Self {
            inner: event,
            timestamp: chrono::Utc::now(),
        }
    }
}

impl Display for TimestampedEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.inner)
    }
}

/// An event logger and broadcaster.
#[derive(Debug)]
pub struct Events {
    log: Mutex<VecDeque<TimestampedEvent>>,
    log_size: usize,

    tx: broadcast::Sender<TimestampedEvent>,
}

impl Events {
    /// Create a new events handler.
    /// It will keep a log of at most `log_size` events.
    /// It may be subscribed to to receive any events it sees.
    pub fn new(log_size: usize) -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self {
            tx,
            log: Mutex::new(VecDeque::new()),
            log_size,
        }
    }

    /// Subscribe to events.
    pub fn subscribe(&self) -> broadcast::Receiver<TimestampedEvent> {
        self.tx.subscribe()
    }

    /// Send an event. This will append it to the log and broadcast it to any subscribers.
    pub fn send_event(&self, event: Event) {
        let event = TimestampedEvent::new(event);
        info!(%event, "Sending and storing event");

        {
            let mut log = self.log.lock().unwrap_or_else(|e| e.into_inner());
            log.push_front(event.clone());

            // Keep a log of at most this number recent events.
            // Truncate removes from the back, which means older events are split off first.
            log.truncate(self.log_size);
        }

        if self.tx.send(event).is_err() {
            trace!("No subscribers");
        }
    }

    /// The most recent events, newest first.
    pub fn recent(&self) -> Vec<TimestampedEvent> {
        self.log
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }
}

impl Default for Events {
    fn default() -> Self {
        Self::new(1000)
    }
}
