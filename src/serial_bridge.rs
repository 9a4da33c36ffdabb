//! A [`DeviceBridge`] backed by a real serial port.
//!
//! A worker thread owns the port: it opens it, splits the incoming byte
//! stream into lines, classifies them and stores them in a [`MessageQueue`].
//! When the port disappears the worker reports the disconnect once, waits the
//! configured reconnection delay and tries again. The tick loop only ever
//! touches the queue and, for writes, a shared handle to the open port.

use crate::config::SerialConfig;
use crate::device_bridge::{DeviceBridge, DeviceError, MessageQueue};
use crate::device_message::{DeviceCommand, SensorMessage};

use log::{debug, info, warn};
use serial2::SerialPort;
use std::{
    io,
    path::{Path, PathBuf},
    str,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

type SharedPort = Arc<Mutex<Option<Arc<SerialPort>>>>;

const READ_CHUNK: usize = 256;
/// Longest line the firmware can legitimately send; anything longer is noise.
const MAX_LINE: usize = 64;
const STOP_POLL: Duration = Duration::from_millis(50);

/// Talks to the treadmill firmware over a serial port.
pub struct SerialBridge {
    queue: MessageQueue,
    port: SharedPort,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl SerialBridge {
    /// Starts the worker thread for the port at `path`. The port does not
    /// need to exist yet; the worker keeps trying until it can open it.
    pub fn open(path: impl Into<PathBuf>, config: &SerialConfig) -> Self {
        let path = path.into();
        let queue = MessageQueue::new(config.max_unread_messages);
        let port: SharedPort = Arc::new(Mutex::new(None));
        let stop = Arc::new(AtomicBool::new(false));

        let worker = Worker {
            path,
            config: config.clone(),
            queue: queue.clone(),
            port: Arc::clone(&port),
            stop: Arc::clone(&stop),
        };
        let handle = thread::spawn(move || worker.run());

        SerialBridge {
            queue,
            port,
            stop,
            handle: Some(handle),
        }
    }

    /// Lists the serial devices present on this machine.
    pub fn available_ports() -> io::Result<Vec<PathBuf>> {
        SerialPort::available_ports()
    }

    /// Asks the worker to close the port and waits for it to finish.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.handle.take() {
            if thread.join().is_err() {
                warn!("Serial worker panicked");
            }
        }
    }
}

impl DeviceBridge for SerialBridge {
    fn read_message(&mut self) -> Option<SensorMessage> {
        self.queue.pop()
    }

    fn send(&mut self, command: DeviceCommand) -> Result<(), DeviceError> {
        if self.handle.is_none() {
            return Err(DeviceError::WorkerGone);
        }
        let port = match self.port.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        let port = port.ok_or(DeviceError::NotConnected)?;

        debug!("Sending {}", command);
        match port.write(&[command.token()])? {
            1 => Ok(()),
            _ => Err(DeviceError::IoError(io::Error::from(io::ErrorKind::WriteZero))),
        }
    }
}

impl Drop for SerialBridge {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Worker {
    path: PathBuf,
    config: SerialConfig,
    queue: MessageQueue,
    port: SharedPort,
    stop: Arc<AtomicBool>,
}

impl Worker {
    fn run(self) {
        // `None` until the first open attempt, so the first outcome is always reported.
        let mut connected: Option<bool> = None;

        while !self.stopping() {
            match self.open_port() {
                Ok(port) => {
                    info!("Opened {}", self.path.display());
                    self.publish_port(Some(Arc::clone(&port)));
                    self.queue.push(SensorMessage::DeviceConnected);
                    connected = Some(true);

                    let res = self.read_lines(&port);
                    self.publish_port(None);
                    if self.stopping() {
                        break;
                    }
                    if let Err(error) = res {
                        warn!("Lost {}: {}", self.path.display(), error);
                    }
                    self.queue.push(SensorMessage::DeviceDisconnected);
                    connected = Some(false);
                }
                Err(error) => {
                    if connected != Some(false) {
                        warn!("Could not open {}: {}", self.path.display(), error);
                        self.queue.push(SensorMessage::DeviceDisconnected);
                        connected = Some(false);
                    }
                }
            }
            self.pause(self.config.reconnect_delay());
        }
        info!("Serial worker for {} terminated.", self.path.display());
    }

    fn open_port(&self) -> io::Result<Arc<SerialPort>> {
        let mut port = SerialPort::open(&self.path, self.config.baud_rate)?;
        port.set_read_timeout(self.config.read_timeout())?;
        Ok(Arc::new(port))
    }

    fn read_lines(&self, port: &SerialPort) -> io::Result<()> {
        let mut buffer = [0; READ_CHUNK];
        let mut lines = LineSplitter::default();

        while !self.stopping() {
            let read_len = match port.read(&mut buffer) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "device closed the port",
                    ))
                }
                Ok(n) => n,
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::TimedOut
                            | io::ErrorKind::WouldBlock
                            | io::ErrorKind::Interrupted
                    ) =>
                {
                    continue
                }
                Err(e) => return Err(e),
            };

            for msg in lines.feed(&buffer[..read_len]) {
                self.queue.push(msg);
            }
        }
        Ok(())
    }

    fn publish_port(&self, port: Option<Arc<SerialPort>>) {
        match self.port.lock() {
            Ok(mut guard) => *guard = port,
            Err(poisoned) => *poisoned.into_inner() = port,
        }
    }

    fn pause(&self, delay: Duration) {
        let deadline = Instant::now() + delay;
        while !self.stopping() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep(STOP_POLL.min(deadline - now));
        }
    }

    fn stopping(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }
}

/// Cuts the byte stream into lines. A line that outgrows [`MAX_LINE`] is
/// reported once as malformed and the rest of it, up to the next `\n`, is
/// thrown away.
#[derive(Debug, Default)]
struct LineSplitter {
    line: Vec<u8>,
    overflowed: bool,
}

impl LineSplitter {
    fn feed(&mut self, bytes: &[u8]) -> Vec<SensorMessage> {
        let mut msgs = Vec::new();
        for &c in bytes {
            if c == b'\n' {
                if !self.overflowed {
                    msgs.push(classify(&self.line));
                }
                self.line.clear();
                self.overflowed = false;
            } else if self.overflowed {
                continue;
            } else if self.line.len() == MAX_LINE {
                warn!("Line longer than {} bytes, discarding it", MAX_LINE);
                msgs.push(SensorMessage::Malformed(
                    String::from_utf8_lossy(&self.line).into_owned(),
                ));
                self.line.clear();
                self.overflowed = true;
            } else {
                self.line.push(c);
            }
        }
        msgs
    }
}

/// Turns one raw line (without its `\n`) into a [`SensorMessage`].
fn classify(raw: &[u8]) -> SensorMessage {
    match str::from_utf8(raw) {
        Ok(s) => {
            let msg = SensorMessage::from_line(s);
            debug!("Received {:?}", msg);
            msg
        }
        // Often happens right after opening the port when there is still
        // garbage in the device's buffer
        Err(e) => {
            warn!("Failed to decode utf-8: {:?}", e);
            SensorMessage::Malformed(String::from_utf8_lossy(raw).into_owned())
        }
    }
}

/// Convenience for the binaries: true if `path` is one of the ports the OS
/// currently reports.
pub fn port_exists(path: &Path) -> bool {
    SerialBridge::available_ports()
        .map(|ports| ports.iter().any(|p| p == path))
        .unwrap_or(false)
}
