//! The seam between the tick loop and the treadmill hardware.

use crate::device_message::{DeviceCommand, SensorMessage};

use log::warn;
use std::{
    collections::VecDeque,
    fmt,
    sync::{Arc, Mutex},
};

/// `DeviceBridge`
///
/// A non-blocking view of the treadmill device. Reads hand over at most one
/// buffered message per call; writes are fire-and-forget single-character
/// commands. Implementations may do their blocking I/O on a worker thread, but
/// neither method may block the caller.
pub trait DeviceBridge {
    /// Returns the oldest unread message, or `None` if nothing arrived since
    /// the last call.
    fn read_message(&mut self) -> Option<SensorMessage>;

    /// Writes `command` to the device. Failures are reported, not retried.
    fn send(&mut self, command: DeviceCommand) -> Result<(), DeviceError>;
}

/// Things that go wrong while talking to the device.
#[derive(Debug)]
pub enum DeviceError {
    /// There is currently no open transport to write to.
    NotConnected,
    /// The worker thread behind the bridge has gone away.
    WorkerGone,
    /// The transport rejected the write.
    IoError(std::io::Error),
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceError::NotConnected => write!(f, "device is not connected"),
            DeviceError::WorkerGone => write!(f, "device worker thread has stopped"),
            DeviceError::IoError(error) => write!(f, "device io error: {}", error),
        }
    }
}

impl std::error::Error for DeviceError {}

impl From<std::io::Error> for DeviceError {
    fn from(value: std::io::Error) -> Self {
        Self::IoError(value)
    }
}

/// A thread-safe, bounded buffer of [`SensorMessage`]s shared between a
/// device worker thread and the tick loop.
///
/// When the buffer is full the oldest *reading* is discarded; connection
/// events are never dropped, so every edge is delivered exactly once.
#[derive(Debug, Clone)]
pub struct MessageQueue {
    msgs: Arc<Mutex<VecDeque<SensorMessage>>>,
    capacity: usize,
}

impl MessageQueue {
    /// Make an empty queue that holds at most `capacity` readings.
    pub fn new(capacity: usize) -> Self {
        Self {
            msgs: Arc::new(Mutex::new(VecDeque::new())),
            capacity: capacity.max(1),
        }
    }

    /// Appends a message, evicting old readings if over capacity.
    pub fn push(&self, msg: SensorMessage) {
        let mut msgs = match self.msgs.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        msgs.push_back(msg);

        let mut excess = msgs.len().saturating_sub(self.capacity);
        while excess > 0 {
            // The message just pushed is the freshest and always stays.
            let older = msgs.len() - 1;
            let Some(idx) = msgs.iter().take(older).position(is_droppable) else {
                break;
            };
            if let Some(dropped) = msgs.remove(idx) {
                warn!("Unread queue full, dropping {:?}", dropped);
            }
            excess -= 1;
        }
    }

    /// Takes the oldest message, if any.
    pub fn pop(&self) -> Option<SensorMessage> {
        match self.msgs.lock() {
            Ok(mut guard) => guard.pop_front(),
            Err(poisoned) => poisoned.into_inner().pop_front(),
        }
    }

    /// Number of unread messages.
    pub fn len(&self) -> usize {
        match self.msgs.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    /// True when nothing is waiting to be read.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn is_droppable(msg: &SensorMessage) -> bool {
    matches!(msg, SensorMessage::Reading(_) | SensorMessage::Malformed(_))
}
