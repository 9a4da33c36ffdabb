//! Remote control of the neural acquisition software.
//!
//! The acquisition software listens on a plain TCP socket and accepts text
//! commands. We only ever need two of them, sent back to back when a session
//! starts, and only ever look for one answer: the complaint that no output
//! file was configured, which means the recording silently did not start.
//!
//! Each connection attempt runs on its own listener thread. The thread owns
//! the blocking reads and hands everything it learns to the tick loop over a
//! channel; the tick loop drains it once per tick with
//! [`RecorderControl::poll`].

use crate::config::RecorderConfig;

use log::{debug, info, warn};
use std::{
    fmt,
    io::{self, Read, Write},
    net::{Shutdown, TcpStream, ToSocketAddrs},
    sync::mpsc::{self, Receiver, Sender, TryRecvError},
    thread::{self, JoinHandle},
    time::Duration,
};

/// Sent first: leave whatever run mode the software is in.
pub const STOP_COMMAND: &str = "set runmode stop;";
/// Sent second: start recording.
pub const RECORD_COMMAND: &str = "set runmode record;";
/// What the software says when recording cannot start for lack of a file.
pub const MISCONFIGURED_SENTENCE: &str =
    "Filename.BaseFilename and Filename.Path must both be specified before recording can occur";

const READ_BUFFER: usize = 1024;

/// Where the control connection stands, as last seen by the tick loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No attempt made, or the connection was closed on purpose.
    Disconnected,
    /// A listener thread is trying to connect.
    Connecting,
    /// The listener thread is connected and reading.
    Connected,
    /// The last attempt ended with a transport error.
    Failed,
}

/// One-shot edges, each returned by exactly one [`RecorderControl::poll`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderEvent {
    /// An attempt succeeded.
    Connected,
    /// An attempt, or an established connection, failed.
    Failed,
}

/// Things that go wrong when commanding the recorder.
#[derive(Debug)]
pub enum RecorderError {
    /// There is no live connection to send on.
    NotConnected,
    /// Writing to the socket failed.
    IoError(io::Error),
}

impl fmt::Display for RecorderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecorderError::NotConnected => write!(f, "recorder is not connected"),
            RecorderError::IoError(error) => write!(f, "recorder io error: {}", error),
        }
    }
}

impl std::error::Error for RecorderError {}

impl From<io::Error> for RecorderError {
    fn from(value: io::Error) -> Self {
        Self::IoError(value)
    }
}

/// `RecorderControl`
///
/// What the session controller needs from the acquisition software link.
/// [`RecorderClient`] is the real thing; tests substitute their own.
pub trait RecorderControl {
    /// Start a new connection attempt. Returns `false`, and does nothing, if
    /// an attempt is already in flight or connected.
    fn connect(&mut self) -> bool;

    /// Drain what the listener reported since the last call and return the
    /// connection edges in the order they happened.
    fn poll(&mut self) -> Vec<RecorderEvent>;

    /// The latest known state.
    fn state(&self) -> ConnectionState;

    /// True if the most recent attempt failed and no attempt has succeeded
    /// since. Sessions must not start while this holds.
    fn last_attempt_failed(&self) -> bool;

    /// True once the software complained that no output file is configured,
    /// until [`RecorderControl::clear_misconfigured`] or the next
    /// [`RecorderControl::send_commands`].
    fn acquisition_misconfigured(&self) -> bool;

    /// Forget a previous misconfiguration complaint.
    fn clear_misconfigured(&mut self);

    /// Send the stop and record commands on the live connection.
    fn send_commands(&mut self) -> Result<(), RecorderError>;
}

/// What a listener thread tells the tick loop.
enum Handoff {
    Connected(TcpStream),
    Misconfigured,
    Failed(io::Error),
}

/// TCP client for the acquisition software's control socket.
pub struct RecorderClient {
    config: RecorderConfig,
    state: ConnectionState,
    last_failed: bool,
    misconfigured: bool,
    writer: Option<TcpStream>,
    rx: Option<Receiver<Handoff>>,
    handle: Option<JoinHandle<()>>,
    attempts: u64,
}

impl RecorderClient {
    /// A client that has not tried to connect yet.
    pub fn new(config: RecorderConfig) -> Self {
        Self {
            config,
            state: ConnectionState::Disconnected,
            last_failed: false,
            misconfigured: false,
            writer: None,
            rx: None,
            handle: None,
            attempts: 0,
        }
    }

    /// How many listener threads have been started so far.
    pub fn attempts(&self) -> u64 {
        self.attempts
    }

    fn reap_listener(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.is_finished() && handle.join().is_err() {
                warn!("Recorder listener panicked");
            }
            // An unfinished listener is blocked on a socket we no longer
            // read from; it exits on its own when that socket closes.
        }
    }
}

impl RecorderControl for RecorderClient {
    fn connect(&mut self) -> bool {
        if matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Connected
        ) {
            debug!("Recorder connect ignored, already {:?}", self.state);
            return false;
        }
        self.reap_listener();

        if self.last_failed {
            info!("Trying {} again...", self.config.endpoint);
        } else {
            info!("Connecting to recorder at {}...", self.config.endpoint);
        }

        let (tx, rx) = mpsc::channel();
        let endpoint = self.config.endpoint.clone();
        let timeout = self.config.connect_timeout();
        self.handle = Some(thread::spawn(move || listen(&endpoint, timeout, tx)));
        self.rx = Some(rx);
        self.state = ConnectionState::Connecting;
        self.attempts += 1;
        true
    }

    fn poll(&mut self) -> Vec<RecorderEvent> {
        let mut events = Vec::new();
        let mut listener_gone = false;

        if let Some(rx) = self.rx.as_ref() {
            loop {
                match rx.try_recv() {
                    Ok(Handoff::Connected(writer)) => {
                        info!("Connected to recorder, session ready.");
                        self.writer = Some(writer);
                        self.state = ConnectionState::Connected;
                        self.last_failed = false;
                        events.push(RecorderEvent::Connected);
                    }
                    Ok(Handoff::Misconfigured) => {
                        warn!("Recorder has no output file configured");
                        self.misconfigured = true;
                    }
                    Ok(Handoff::Failed(error)) => {
                        warn!("Recorder connection failed: {}", error);
                        self.writer = None;
                        self.state = ConnectionState::Failed;
                        self.last_failed = true;
                        events.push(RecorderEvent::Failed);
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        listener_gone = true;
                        break;
                    }
                }
            }
        }

        if listener_gone {
            self.rx = None;
            // A listener always reports before it exits; one that vanished
            // silently has panicked.
            if matches!(
                self.state,
                ConnectionState::Connecting | ConnectionState::Connected
            ) {
                warn!("Recorder listener stopped unexpectedly");
                self.writer = None;
                self.state = ConnectionState::Failed;
                self.last_failed = true;
                events.push(RecorderEvent::Failed);
            }
        }

        events
    }

    fn state(&self) -> ConnectionState {
        self.state
    }

    fn last_attempt_failed(&self) -> bool {
        self.last_failed
    }

    fn acquisition_misconfigured(&self) -> bool {
        self.misconfigured
    }

    fn clear_misconfigured(&mut self) {
        self.misconfigured = false;
    }

    fn send_commands(&mut self) -> Result<(), RecorderError> {
        self.misconfigured = false;
        let writer = self.writer.as_mut().ok_or(RecorderError::NotConnected)?;

        writer.write_all(STOP_COMMAND.as_bytes())?;
        debug!("Sent {:?}", STOP_COMMAND);
        writer.write_all(RECORD_COMMAND.as_bytes())?;
        debug!("Sent {:?}", RECORD_COMMAND);
        writer.flush()?;
        Ok(())
    }
}

impl Drop for RecorderClient {
    fn drop(&mut self) {
        if let Some(writer) = self.writer.take() {
            let _ = writer.shutdown(Shutdown::Both);
        }
    }
}

/// Body of a listener thread: one connection attempt, then reads until the
/// connection dies.
fn listen(endpoint: &str, timeout: Duration, tx: Sender<Handoff>) {
    let mut stream = match open(endpoint, timeout) {
        Ok(stream) => stream,
        Err(error) => {
            let _ = tx.send(Handoff::Failed(error));
            return;
        }
    };
    let writer = match stream.try_clone() {
        Ok(writer) => writer,
        Err(error) => {
            let _ = tx.send(Handoff::Failed(error));
            return;
        }
    };
    if tx.send(Handoff::Connected(writer)).is_err() {
        return;
    }

    let mut buffer = [0; READ_BUFFER];
    let mut scanner = SentenceScanner::new(MISCONFIGURED_SENTENCE);
    loop {
        let read_len = match stream.read(&mut buffer) {
            Ok(0) => {
                let _ = tx.send(Handoff::Failed(io::Error::new(
                    io::ErrorKind::ConnectionAborted,
                    "recorder closed the connection",
                )));
                return;
            }
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                let _ = tx.send(Handoff::Failed(e));
                return;
            }
        };

        let text = String::from_utf8_lossy(&buffer[..read_len]);
        debug!("Recorder said: {:?}", text);
        if scanner.feed(&text) && tx.send(Handoff::Misconfigured).is_err() {
            return;
        }
    }
}

fn open(endpoint: &str, timeout: Duration) -> io::Result<TcpStream> {
    let mut last_error = io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("{} resolved to no addresses", endpoint),
    );
    for addr in endpoint.to_socket_addrs()? {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(error) => last_error = error,
        }
    }
    Err(last_error)
}

/// Finds a sentence in a stream of text chunks, even when a chunk boundary
/// splits it. Text that does not complete a match is discarded.
#[derive(Debug)]
struct SentenceScanner {
    sentence: &'static str,
    carry: String,
}

impl SentenceScanner {
    fn new(sentence: &'static str) -> Self {
        Self {
            sentence,
            carry: String::new(),
        }
    }

    /// Returns true if the sentence completes within `chunk`.
    fn feed(&mut self, chunk: &str) -> bool {
        self.carry.push_str(chunk);
        if self.carry.contains(self.sentence) {
            self.carry.clear();
            return true;
        }

        // Keep just enough of the tail to complete a match next time.
        let keep = self.sentence.len().saturating_sub(1);
        if self.carry.len() > keep {
            let mut cut = self.carry.len() - keep;
            while !self.carry.is_char_boundary(cut) {
                cut += 1;
            }
            self.carry.drain(..cut);
        }
        false
    }
}
